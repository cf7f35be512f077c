// HTTP download plumbing shared by both transports.

pub mod redirect;
pub mod streaming;
pub mod url;

use crate::error::UpdateError;

/// A resolved, readable firmware image stream.
///
/// Both transports (streaming HTTPS and modem-mediated HTTPS) present the
/// download as this pull interface so the orchestrator's chunk loop is
/// transport-agnostic.
pub trait FirmwareSource: Send {
    /// Resolve redirects against `url` and leave the source positioned at
    /// the start of the image body. Returns the declared content length
    /// (0 = unknown).
    fn begin(&mut self, url: &str) -> Result<u64, UpdateError>;

    /// Read the next chunk into `buf`. `Ok(0)` means end of stream.
    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError>;

    /// Release any connection state. Safe to call after a failed `begin`.
    fn finish(&mut self);
}
