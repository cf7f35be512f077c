// Modem HTTPS client flows against a scripted command channel.

use std::time::Duration;

use crate::config::{Config, NetworkMode};
use crate::error::UpdateError;
use crate::http::FirmwareSource;
use crate::modem::http::ModemTimeouts;
use crate::modem::ModemHttpClient;
use crate::tests::support::{commands, MockChannel};

fn short_timeouts() -> ModemTimeouts {
    ModemTimeouts {
        command: Duration::from_millis(150),
        connect: Duration::from_millis(150),
        request: Duration::from_millis(150),
        header: Duration::from_millis(150),
        data: Duration::from_millis(300),
    }
}

fn sim_config() -> Config {
    Config {
        network_mode: NetworkMode::Sim,
        ..Config::default()
    }
}

fn client(script: Vec<Vec<u8>>) -> ModemHttpClient<MockChannel> {
    ModemHttpClient::new(MockChannel::with_script(script), &sim_config())
        .with_timeouts(short_timeouts())
}

fn ok() -> Vec<u8> {
    b"OK\r\n".to_vec()
}

/// Responses for a full HTTPS session connect (8 config commands, SHCONN,
/// SHSTATE query).
fn connect_responses() -> Vec<Vec<u8>> {
    let mut script = vec![ok(); 9];
    script.push(b"+SHSTATE: 1\r\n\r\nOK\r\n".to_vec());
    script
}

/// Responses for a GET (SHCHEAD, three SHAHEAD, SHREQ result).
fn get_responses(status: u16, length: usize) -> Vec<Vec<u8>> {
    let mut script = vec![ok(); 4];
    script.push(format!("OK\r\n+SHREQ: \"GET\",{},{}\r\n", status, length).into_bytes());
    script
}

fn shread_response(data: &[u8]) -> Vec<u8> {
    let mut out = format!("OK\r\n+SHREAD: {}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// A complete redirect hop: connect, GET answering 302, body read carrying
/// the Location echo, disconnect.
fn redirect_hop_responses(location: &str) -> Vec<Vec<u8>> {
    let mut body = format!("HTTP/1.1 302 Found\r\nLocation: {}\r\n", location).into_bytes();
    body.resize(body.len().max(64), b' ');
    let mut script = connect_responses();
    script.extend(get_responses(302, body.len()));
    script.push(shread_response(&body));
    script.push(ok()); // SHDISC
    script
}

#[test]
fn connect_issues_session_setup_sequence() {
    let channel = MockChannel::with_script(connect_responses());
    let log = channel.written_log();
    let mut client =
        ModemHttpClient::new(channel, &sim_config()).with_timeouts(short_timeouts());

    client.connect("https://github.com/fw/image.bin").unwrap();

    let cmds = commands(&log);
    assert_eq!(
        cmds,
        vec![
            "AT+CSSLCFG=\"ignorertctime\",1,1",
            "AT+CSSLCFG=\"sslversion\",1,3",
            "AT+CSSLCFG=\"sni\",1,\"github.com\"",
            "AT+SHSSL=1,\"\"",
            "AT+SHCONF=\"URL\",\"https://github.com:443\"",
            "AT+SHCONF=\"BODYLEN\",1024",
            "AT+SHCONF=\"HEADERLEN\",350",
            "AT+SHCONF=\"TIMEOUT\",30",
            "AT+SHCONN",
            "AT+SHSTATE?",
        ]
    );
}

#[test]
fn plain_http_skips_tls_setup() {
    let mut script = vec![ok(); 5];
    script.push(b"+SHSTATE: 1\r\n\r\nOK\r\n".to_vec());
    let channel = MockChannel::with_script(script);
    let log = channel.written_log();
    let mut client =
        ModemHttpClient::new(channel, &sim_config()).with_timeouts(short_timeouts());

    client.connect("http://10.0.0.2:8080/fw.bin").unwrap();

    let cmds = commands(&log);
    assert_eq!(cmds[0], "AT+SHCONF=\"URL\",\"http://10.0.0.2:8080\"");
    assert!(!cmds.iter().any(|c| c.contains("CSSLCFG") || c.contains("SHSSL")));
}

#[test]
fn connect_fails_when_session_state_disagrees() {
    // SHCONN says OK but the session never became usable
    let mut script = vec![ok(); 9];
    script.push(b"+SHSTATE: 0\r\n\r\nOK\r\n".to_vec());
    let mut client = client(script);

    match client.connect("https://example.com/fw.bin") {
        Err(UpdateError::SessionSetup(msg)) => assert!(msg.contains("SHSTATE")),
        other => panic!("expected SessionSetup, got {:?}", other),
    }
}

#[test]
fn connect_timeout_is_timeout_classed() {
    let mut client = client(Vec::new());
    let err = client.connect("https://example.com/fw.bin").unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn download_end_to_end_with_offset_reads() {
    let mut body = vec![0xE9u8];
    body.extend((1..1000u32).map(|i| (i % 251) as u8));
    assert_eq!(body.len(), 1000);

    let mut script = connect_responses();
    script.extend(get_responses(200, 1000));
    for chunk in body.chunks(256) {
        script.push(shread_response(chunk));
    }
    script.push(ok()); // SHDISC on finish

    let channel = MockChannel::with_script(script);
    let log = channel.written_log();
    let mut source =
        ModemHttpClient::new(channel, &sim_config()).with_timeouts(short_timeouts());

    let total = source.begin("https://example.com/fw.bin").unwrap();
    assert_eq!(total, 1000);

    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = source.next_chunk(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    source.finish();

    assert_eq!(out, body);
    let cmds = commands(&log);
    assert!(cmds.contains(&"AT+SHREAD=0,256".to_string()));
    assert!(cmds.contains(&"AT+SHREAD=768,232".to_string()));
    assert_eq!(cmds.last().unwrap(), "AT+SHDISC");
}

#[test]
fn oversized_block_is_rejected_not_trusted() {
    // The modem announces a 300-byte block in answer to AT+SHREAD=0,256.
    // The announced size must not be trusted past the requested length.
    let mut script = connect_responses();
    script.extend(get_responses(200, 300));
    script.push(shread_response(&vec![0xE9u8; 300]));

    let mut source = client(script);
    assert_eq!(source.begin("https://example.com/fw.bin").unwrap(), 300);

    let mut buf = [0u8; 256];
    match source.next_chunk(&mut buf) {
        Err(UpdateError::MalformedResponse(msg)) => {
            assert!(msg.contains("300"), "{}", msg);
        }
        other => panic!("expected MalformedResponse, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn redirect_target_recovered_from_body() {
    let mut script = redirect_hop_responses("https://cdn.example.com/fw.bin");
    script.extend(connect_responses());
    script.extend(get_responses(200, 4));
    script.push(shread_response(&[0xE9, 1, 2, 3]));

    let channel = MockChannel::with_script(script);
    let log = channel.written_log();
    let mut source =
        ModemHttpClient::new(channel, &sim_config()).with_timeouts(short_timeouts());

    let total = source.begin("https://example.com/fw.bin").unwrap();
    assert_eq!(total, 4);

    let cmds = commands(&log);
    assert!(cmds.contains(&"AT+SHCONF=\"URL\",\"https://example.com:443\"".to_string()));
    assert!(cmds.contains(&"AT+SHCONF=\"URL\",\"https://cdn.example.com:443\"".to_string()));
}

#[test]
fn redirect_without_location_in_body_fails() {
    let body = b"HTTP/1.1 302 Found\r\nno forwarding address here\r\n".to_vec();
    let mut script = connect_responses();
    script.extend(get_responses(302, body.len()));
    script.push(shread_response(&body));
    script.push(ok()); // SHDISC

    let mut source = client(script);
    assert!(matches!(
        source.begin("https://example.com/fw.bin"),
        Err(UpdateError::MissingLocation)
    ));
}

#[test]
fn six_redirects_exceed_modem_hop_bound() {
    // 6 consecutive 302s against the 5-hop bound: the client must give
    // up at the bound without requesting the sixth target.
    let mut script = Vec::new();
    for i in 0..6 {
        script.extend(redirect_hop_responses(&format!(
            "https://hop{}.example.com/fw.bin",
            i
        )));
    }

    let mut source = client(script);
    assert!(matches!(
        source.begin("https://example.com/fw.bin"),
        Err(UpdateError::TooManyRedirects)
    ));
}

#[test]
fn availability_requires_sim_mode_and_ready_channel() {
    let sim = client(Vec::new());
    assert!(sim.is_available());

    let wifi_config = Config::default(); // Wifi mode
    let wifi = ModemHttpClient::new(MockChannel::with_script(Vec::new()), &wifi_config);
    assert!(!wifi.is_available());

    let unplugged = ModemHttpClient::new(
        MockChannel::with_script(Vec::new()).not_ready(),
        &sim_config(),
    );
    assert!(!unplugged.is_available());
}

#[test]
fn download_firmware_streams_into_sink_with_progress() {
    let mut body = vec![0xE9u8; 512];
    body[511] = 7;

    let mut script = connect_responses();
    script.extend(get_responses(200, 512));
    for chunk in body.chunks(256) {
        script.push(shread_response(chunk));
    }
    script.push(ok()); // SHDISC

    let mut source = client(script);
    let mut sunk = Vec::new();
    let mut reports = Vec::new();
    let total = source
        .download_firmware(
            "https://example.com/fw.bin",
            256,
            |chunk| {
                sunk.extend_from_slice(chunk);
                Ok(())
            },
            |pct, done, total| reports.push((pct, done, total)),
        )
        .unwrap();

    assert_eq!(total, 512);
    assert_eq!(sunk, body);
    assert_eq!(reports.last().copied(), Some((100, 512, 512)));
}
