// AT command/response transport over a raw byte channel.
//
// Two read shapes exist on this link: text responses terminated by a known
// token, and binary blocks announced by a `<TOKEN>: <count>` header line.
// Retry policy belongs to callers; this layer reports exactly what the
// modem did.

use std::time::{Duration, Instant};

use crate::error::UpdateError;
use crate::platform::ByteChannel;

/// Poll increment while accumulating a response.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on an accumulated text response. Exceeding it is an explicit
/// error, never truncation.
const RESPONSE_CAP: usize = 4096;

/// Upper bound on a binary-block header line.
const HEADER_CAP: usize = 128;

const ERROR_TOKEN: &str = "ERROR";

pub struct CommandChannel<C: ByteChannel> {
    channel: C,
}

impl<C: ByteChannel> CommandChannel<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn is_ready(&self) -> bool {
        self.channel.is_ready()
    }

    /// Send `cmd` (CRLF appended) and accumulate the response until
    /// `expected` appears, the modem reports ERROR, or `timeout` elapses.
    /// A timeout reports whatever partial bytes were collected.
    pub fn send(
        &mut self,
        cmd: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<String, UpdateError> {
        log::info!(">>> {}", cmd);

        self.channel.write_all(format!("{}\r\n", cmd).as_bytes())?;

        let mut response: Vec<u8> = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let n = self.channel.read(&mut buf, POLL_INTERVAL)?;
            if n == 0 {
                continue;
            }
            if response.len() + n > RESPONSE_CAP {
                return Err(UpdateError::ResponseTooLarge { limit: RESPONSE_CAP });
            }
            response.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&response);
            if text.contains(expected) {
                if text.len() < 200 {
                    log::info!("<<< (len={}) {}", text.len(), text.trim());
                } else {
                    log::info!("<<< (len={}) [response too long to log]", text.len());
                }
                return Ok(text.into_owned());
            }
            if text.contains(ERROR_TOKEN) {
                log::error!("<<< ERROR: {}", text.trim());
                return Err(UpdateError::RemoteError(text.into_owned()));
            }
        }

        let partial = String::from_utf8_lossy(&response).into_owned();
        log::warn!(
            "Timeout waiting for {:?} (got: {})",
            expected,
            if partial.is_empty() { "[nothing]" } else { &partial }
        );
        Err(UpdateError::CommandTimeout {
            expected: expected.to_string(),
            partial,
        })
    }

    /// Send `cmd`, then read a binary block announced by a
    /// `<token> <count>` header line: accumulate the header one byte at a
    /// time until its newline, then switch to block reads for exactly
    /// `count` bytes. A `count` of 0 is success with an empty payload.
    pub fn request_block(
        &mut self,
        cmd: &str,
        token: &str,
        header_timeout: Duration,
        data_timeout: Duration,
    ) -> Result<Vec<u8>, UpdateError> {
        log::info!(">>> {}", cmd);
        self.channel.write_all(format!("{}\r\n", cmd).as_bytes())?;

        // Header phase: byte-at-a-time until the token's line is complete.
        let mut header: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        let deadline = Instant::now() + header_timeout;
        let count = loop {
            if Instant::now() >= deadline {
                let partial = String::from_utf8_lossy(&header).into_owned();
                return Err(UpdateError::CommandTimeout {
                    expected: token.to_string(),
                    partial,
                });
            }
            let n = self.channel.read(&mut byte, POLL_INTERVAL)?;
            if n == 0 {
                continue;
            }
            if header.len() >= HEADER_CAP {
                return Err(UpdateError::ResponseTooLarge { limit: HEADER_CAP });
            }
            header.push(byte[0]);

            let text = String::from_utf8_lossy(&header);
            if text.contains(ERROR_TOKEN) {
                return Err(UpdateError::RemoteError(text.into_owned()));
            }
            if let Some(idx) = text.find(token) {
                let after = &text[idx + token.len()..];
                if let Some(nl) = after.find('\n') {
                    let count_str = after[..nl].trim().trim_start_matches(':').trim();
                    break count_str.parse::<usize>().map_err(|_| {
                        UpdateError::MalformedResponse(format!(
                            "bad block header: {:?}",
                            text.trim()
                        ))
                    })?;
                }
            }
        };

        if count == 0 {
            log::debug!("Block read: no data (length=0)");
            self.drain();
            return Ok(Vec::new());
        }
        log::debug!("Reading {} bytes of data...", count);

        // Data phase: block reads, tolerating arbitrarily small deliveries.
        let mut data: Vec<u8> = Vec::with_capacity(count);
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + data_timeout;
        while data.len() < count {
            if Instant::now() >= deadline {
                return Err(UpdateError::CommandTimeout {
                    expected: format!("{} payload ({} bytes)", token, count),
                    partial: format!("{} of {} bytes received", data.len(), count),
                });
            }
            let want = (count - data.len()).min(buf.len());
            let n = self.channel.read(&mut buf[..want], Duration::from_secs(1))?;
            if n > 0 {
                data.extend_from_slice(&buf[..n]);
            }
        }

        // Consume any trailing status text so it cannot bleed into the next
        // command's response.
        self.drain();

        Ok(data)
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.channel.read(&mut buf, Duration::from_millis(50)) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
