// Streaming HTTPS download client.
//
// Wraps a conventional HTTP connection behind `HttpBackend` and resolves
// redirects manually: the backend captures any Location header it sees
// while fetching response headers, and we decide per hop whether to stream
// the body or tear down and retry against the captured target.

use crate::error::UpdateError;
use crate::http::redirect::{HopOutcome, RedirectPolicy};
use crate::http::FirmwareSource;

#[derive(Debug, Clone, Copy)]
pub struct ResponseHead {
    pub status: u16,
    /// 0 = unknown.
    pub content_length: u64,
}

/// Minimal capability surface of a conventional HTTP client: open a GET,
/// read the body, and report the redirect target observed (case-insensitive
/// "Location" header) during the last `open`.
///
/// Implementations must clear the captured target at the start of each
/// `open` so a stale value from a previous hop can never leak into the next
/// attempt.
pub trait HttpBackend: Send {
    fn open(&mut self, url: &str) -> Result<ResponseHead, UpdateError>;

    /// Blocking body read; `Ok(0)` is end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError>;

    /// Location header captured during the last `open`, if any.
    fn observed_redirect_target(&self) -> Option<String>;

    fn close(&mut self);
}

pub struct StreamingClient<B: HttpBackend> {
    backend: B,
    policy: RedirectPolicy,
    content_length: u64,
    received: u64,
    connected: bool,
}

impl<B: HttpBackend> StreamingClient<B> {
    pub fn new(backend: B) -> Self {
        Self::with_policy(backend, RedirectPolicy::streaming())
    }

    /// Streaming client with the configured hop bound.
    pub fn from_config(backend: B, config: &crate::config::Config) -> Self {
        Self::with_policy(
            backend,
            RedirectPolicy::streaming().with_max_hops(config.stream_max_redirects),
        )
    }

    pub fn with_policy(backend: B, policy: RedirectPolicy) -> Self {
        Self {
            backend,
            policy,
            content_length: 0,
            received: 0,
            connected: false,
        }
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: HttpBackend> FirmwareSource for StreamingClient<B> {
    fn begin(&mut self, url: &str) -> Result<u64, UpdateError> {
        let mut current = url.to_string();
        let mut hops = 0u32;

        loop {
            let head = self.backend.open(&current)?;
            log::info!(
                "HTTP status: {}, content-length: {}",
                head.status,
                head.content_length
            );

            match self.policy.classify(head.status) {
                HopOutcome::Success => {
                    self.content_length = head.content_length;
                    self.received = 0;
                    self.connected = true;
                    return Ok(head.content_length);
                }
                HopOutcome::Redirect => {
                    let target = self
                        .backend
                        .observed_redirect_target()
                        .filter(|t| !t.is_empty())
                        .ok_or(UpdateError::MissingLocation)?;
                    self.backend.close();
                    self.policy.next_hop(&mut hops)?;
                    log::info!("Following redirect {} -> {}", hops, target);
                    current = target;
                }
                HopOutcome::Error(code) => {
                    self.backend.close();
                    return Err(UpdateError::HttpStatus(code));
                }
            }
        }
    }

    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
        let want = if self.content_length > 0 {
            let remaining = self.content_length.saturating_sub(self.received);
            (buf.len() as u64).min(remaining) as usize
        } else {
            buf.len()
        };
        if want == 0 {
            return Ok(0);
        }
        let n = self.backend.read(&mut buf[..want])?;
        self.received += n as u64;
        Ok(n)
    }

    fn finish(&mut self) {
        if self.connected {
            self.backend.close();
            self.connected = false;
        }
    }
}
