// Redirect policy shared by both download transports.

use crate::error::UpdateError;

/// Per-hop cost on the modem path is much higher (full session teardown and
/// TLS re-handshake), so it gets a tighter bound.
pub const MODEM_MAX_REDIRECTS: u32 = 5;
pub const STREAM_MAX_REDIRECTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    /// 200 - stream the body.
    Success,
    /// Follow the Location target.
    Redirect,
    /// Terminal HTTP error carrying the status code.
    Error(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct RedirectPolicy {
    max_hops: u32,
    /// The modem path treats any 3xx as a redirect; the streaming path only
    /// follows the standard set (301/302/307/308).
    any_3xx: bool,
}

impl RedirectPolicy {
    pub fn modem() -> Self {
        Self {
            max_hops: MODEM_MAX_REDIRECTS,
            any_3xx: true,
        }
    }

    pub fn streaming() -> Self {
        Self {
            max_hops: STREAM_MAX_REDIRECTS,
            any_3xx: false,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn classify(&self, status: u16) -> HopOutcome {
        match status {
            200 => HopOutcome::Success,
            301 | 302 | 307 | 308 => HopOutcome::Redirect,
            300..=399 if self.any_3xx => HopOutcome::Redirect,
            other => HopOutcome::Error(other),
        }
    }

    /// Account for one followed redirect. `hops` redirects succeed iff
    /// `hops < max_hops`; reaching the bound is a terminal error distinct
    /// from other HTTP errors.
    pub fn next_hop(&self, hops: &mut u32) -> Result<(), UpdateError> {
        *hops += 1;
        if *hops >= self.max_hops {
            Err(UpdateError::TooManyRedirects)
        } else {
            Ok(())
        }
    }
}
