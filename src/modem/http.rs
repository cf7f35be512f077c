// Modem-mediated HTTPS client for firmware downloads.
//
// The whole HTTP exchange - TLS setup, request, body reads - happens
// through AT command/response exchanges on the modem's command channel.
// Body bytes are fetched with offset/length reads, so the download survives
// the command channel's line-oriented framing.

use std::time::Duration;

use crate::config::{Config, NetworkMode};
use crate::error::UpdateError;
use crate::http::redirect::{HopOutcome, RedirectPolicy};
use crate::http::url::ParsedUrl;
use crate::http::FirmwareSource;
use crate::modem::channel::CommandChannel;
use crate::platform::ByteChannel;

const OK: &str = "OK";
const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10) AppleWebKit/537.36";

/// How much of a redirect response body is scanned for a Location target.
const REDIRECT_BODY_SCAN: u64 = 2048;

#[derive(Debug, Clone, Copy)]
pub struct ModemTimeouts {
    /// Ordinary configuration commands.
    pub command: Duration,
    /// Session connect, TLS handshake included.
    pub connect: Duration,
    /// Waiting for the +SHREQ result of a GET.
    pub request: Duration,
    /// Waiting for a +SHREAD block header.
    pub header: Duration,
    /// Receiving a block payload.
    pub data: Duration,
}

impl Default for ModemTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(5),
            connect: Duration::from_secs(30),
            request: Duration::from_secs(120),
            header: Duration::from_secs(30),
            data: Duration::from_secs(60),
        }
    }
}

impl ModemTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_timeout_secs as u64),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connected,
}

pub struct ModemHttpClient<C: ByteChannel> {
    chan: CommandChannel<C>,
    timeouts: ModemTimeouts,
    network_mode: NetworkMode,
    max_redirects: u32,
    state: SessionState,
    url: Option<ParsedUrl>,
    status: u16,
    content_length: u64,
    offset: u64,
}

impl<C: ByteChannel> ModemHttpClient<C> {
    pub fn new(channel: C, config: &Config) -> Self {
        Self {
            chan: CommandChannel::new(channel),
            timeouts: ModemTimeouts::from_config(config),
            network_mode: config.network_mode,
            max_redirects: config.modem_max_redirects,
            state: SessionState::Disconnected,
            url: None,
            status: 0,
            content_length: 0,
            offset: 0,
        }
    }

    pub fn with_timeouts(mut self, timeouts: ModemTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// True only when the gateway is provisioned for the SIM network mode
    /// and the modem channel is reachable.
    pub fn is_available(&self) -> bool {
        self.network_mode == NetworkMode::Sim && self.chan.is_ready()
    }

    /// Establish an HTTP(S) session to the origin of `url`. Any existing
    /// session is torn down first.
    pub fn connect(&mut self, url: &str) -> Result<(), UpdateError> {
        let parsed = ParsedUrl::parse(url)?;

        if self.state == SessionState::Connected {
            self.disconnect();
        }

        log::info!("Modem HTTP connect: {}", parsed.origin());

        let t = self.timeouts.command;
        if parsed.is_tls() {
            // TLS context 1: skip remote-clock validation, pin TLS 1.2,
            // SNI to the target host, accept-all-certificates trust mode.
            self.chan
                .send("AT+CSSLCFG=\"ignorertctime\",1,1", OK, t)?;
            self.chan.send("AT+CSSLCFG=\"sslversion\",1,3", OK, t)?;
            self.chan.send(
                &format!("AT+CSSLCFG=\"sni\",1,\"{}\"", parsed.host),
                OK,
                t,
            )?;
            self.chan.send("AT+SHSSL=1,\"\"", OK, t)?;
        }

        self.chan.send(
            &format!("AT+SHCONF=\"URL\",\"{}\"", parsed.origin()),
            OK,
            t,
        )?;
        self.chan.send("AT+SHCONF=\"BODYLEN\",1024", OK, t)?;
        self.chan.send("AT+SHCONF=\"HEADERLEN\",350", OK, t)?;
        self.chan.send("AT+SHCONF=\"TIMEOUT\",30", OK, t)?;

        self.chan.send("AT+SHCONN", OK, self.timeouts.connect)?;

        // The connect command can report OK before the session is actually
        // usable; trust only the state query.
        let resp = self.chan.send("AT+SHSTATE?", OK, t)?;
        if !session_connected(&resp) {
            self.chan.send("AT+SHDISC", OK, t).ok();
            return Err(UpdateError::SessionSetup(format!(
                "SHSTATE reports not connected: {}",
                resp.trim()
            )));
        }

        self.state = SessionState::Connected;
        self.url = Some(parsed);
        self.status = 0;
        self.content_length = 0;
        Ok(())
    }

    /// Issue a GET for the connected URL's path. Returns (status code,
    /// content length).
    pub fn get(&mut self) -> Result<(u16, u64), UpdateError> {
        let path = match &self.url {
            Some(url) if self.state == SessionState::Connected => url.path.clone(),
            _ => return Err(UpdateError::SessionSetup("not connected".to_string())),
        };

        let t = self.timeouts.command;
        self.chan.send("AT+SHCHEAD", OK, t)?;
        self.chan.send(
            &format!("AT+SHAHEAD=\"User-Agent\",\"{}\"", USER_AGENT),
            OK,
            t,
        )?;
        self.chan.send("AT+SHAHEAD=\"Accept\",\"*/*\"", OK, t)?;
        self.chan
            .send("AT+SHAHEAD=\"Connection\",\"keep-alive\"", OK, t)?;

        let resp = self.chan.send(
            &format!("AT+SHREQ=\"{}\",1", path),
            "+SHREQ:",
            self.timeouts.request,
        )?;

        let (status, length) = parse_shreq(&resp)?;
        log::info!("HTTP response: status={}, content_length={}", status, length);
        self.status = status;
        self.content_length = length;
        Ok((status, length))
    }

    /// Read `len` body bytes starting at `offset`. The length is clamped to
    /// the remaining content when the total is known; 0 remaining bytes is
    /// success, not an error.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, UpdateError> {
        if self.state != SessionState::Connected {
            return Err(UpdateError::SessionSetup("not connected".to_string()));
        }

        let len = if self.content_length > 0 {
            let remaining = self.content_length.saturating_sub(offset);
            (len as u64).min(remaining) as usize
        } else {
            len
        };
        if len == 0 {
            return Ok(Vec::new());
        }

        self.chan.request_block(
            &format!("AT+SHREAD={},{}", offset, len),
            "+SHREAD",
            self.timeouts.header,
            self.timeouts.data,
        )
    }

    pub fn disconnect(&mut self) {
        if self.state == SessionState::Connected {
            self.chan
                .send("AT+SHDISC", OK, self.timeouts.command)
                .ok();
        }
        self.state = SessionState::Disconnected;
        self.url = None;
    }

    /// Recover the redirect target of a 3xx response.
    ///
    /// Unusually, this scans the response BODY for a `Location:` line
    /// rather than a protocol-level header: the command set gives no access
    /// to response headers, and the servers this gateway talks to echo the
    /// header into the body. Kept as-is deliberately.
    fn redirect_target_from_body(&mut self) -> Result<String, UpdateError> {
        let scan = if self.content_length > 0 {
            self.content_length.min(REDIRECT_BODY_SCAN)
        } else {
            REDIRECT_BODY_SCAN
        };
        let body = self.read(0, scan as usize)?;
        let text = String::from_utf8_lossy(&body);
        for line in text.lines() {
            let lower = line.to_ascii_lowercase();
            if let Some(rest) = lower.strip_prefix("location:") {
                let start = line.len() - rest.len();
                let target = line[start..].trim();
                if !target.is_empty() {
                    return Ok(target.to_string());
                }
            }
        }
        Err(UpdateError::MissingLocation)
    }

    /// Convenience download surface mirroring the rest of the modem API:
    /// streams the resolved image into `sink`, reporting progress.
    pub fn download_firmware<S, P>(
        &mut self,
        url: &str,
        chunk_size: usize,
        mut sink: S,
        mut progress: P,
    ) -> Result<u64, UpdateError>
    where
        S: FnMut(&[u8]) -> Result<(), UpdateError>,
        P: FnMut(u8, u64, u64),
    {
        let total = self.begin(url)?;
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut downloaded: u64 = 0;
        let result = loop {
            match self.next_chunk(&mut buf) {
                Ok(0) => break Ok(downloaded),
                Ok(n) => {
                    if let Err(e) = sink(&buf[..n]) {
                        break Err(e);
                    }
                    downloaded += n as u64;
                    let pct = if total > 0 {
                        ((downloaded * 100) / total) as u8
                    } else {
                        0
                    };
                    progress(pct, downloaded, total);
                }
                Err(e) => break Err(e),
            }
        };
        self.finish();
        result
    }
}

impl<C: ByteChannel> FirmwareSource for ModemHttpClient<C> {
    fn begin(&mut self, url: &str) -> Result<u64, UpdateError> {
        let policy = RedirectPolicy::modem().with_max_hops(self.max_redirects);
        let mut current = url.to_string();
        let mut hops = 0u32;

        loop {
            self.connect(&current)?;
            let (status, length) = self.get()?;
            match policy.classify(status) {
                HopOutcome::Success => {
                    self.offset = 0;
                    return Ok(length);
                }
                HopOutcome::Redirect => {
                    let target = self.redirect_target_from_body();
                    self.disconnect();
                    let target = target?;
                    policy.next_hop(&mut hops)?;
                    current = target;
                    log::info!("Following redirect {} -> {}", hops, current);
                }
                HopOutcome::Error(code) => {
                    self.disconnect();
                    return Err(UpdateError::HttpStatus(code));
                }
            }
        }
    }

    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
        let data = self.read(self.offset, buf.len())?;
        let n = data.len();
        if n > buf.len() {
            // The block header promised more than we asked for; trusting it
            // would overrun the caller's buffer.
            return Err(UpdateError::MalformedResponse(format!(
                "block of {} bytes exceeds requested {}",
                n,
                buf.len()
            )));
        }
        buf[..n].copy_from_slice(&data);
        self.offset += n as u64;
        Ok(n)
    }

    fn finish(&mut self) {
        self.disconnect();
    }
}

fn session_connected(resp: &str) -> bool {
    resp.find("+SHSTATE:")
        .map(|idx| {
            let after = &resp[idx + "+SHSTATE:".len()..];
            after.trim_start().starts_with('1')
        })
        .unwrap_or(false)
}

/// Parse a `+SHREQ: "GET",<status>,<length>` result line. Both spacings
/// seen in the field (`"GET",200` and `"GET", 200`) are accepted.
fn parse_shreq(resp: &str) -> Result<(u16, u64), UpdateError> {
    let idx = resp
        .find("+SHREQ:")
        .ok_or_else(|| UpdateError::MalformedResponse(format!("no +SHREQ in {:?}", resp.trim())))?;
    let line = resp[idx..].lines().next().unwrap_or("");
    let rest = line["+SHREQ:".len()..].trim();

    let mut fields = rest.splitn(3, ',');
    let method = fields.next().unwrap_or("").trim();
    if !method.contains("GET") {
        return Err(UpdateError::MalformedResponse(format!(
            "unexpected +SHREQ method in {:?}",
            line
        )));
    }
    let status = fields
        .next()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .ok_or_else(|| UpdateError::MalformedResponse(format!("bad +SHREQ status in {:?}", line)))?;
    let length = fields
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| UpdateError::MalformedResponse(format!("bad +SHREQ length in {:?}", line)))?;
    Ok((status, length))
}
