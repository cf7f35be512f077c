// Error type shared across the update pipeline.
//
// Transport, partition and orchestration failures all funnel into one enum
// so the orchestrator can report a single error string and callers can
// still match on the class of failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    /// A command got no recognizable answer before its deadline. `partial`
    /// carries whatever bytes did arrive, for diagnostics.
    #[error("timeout waiting for {expected:?} (partial: {partial:?})")]
    CommandTimeout { expected: String, partial: String },

    /// The remote side answered with its error token.
    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// HTTP(S) session could not be established or is not usable.
    #[error("session setup failed: {0}")]
    SessionSetup(String),

    /// Byte-level transport failure underneath a command or stream.
    #[error("channel I/O error: {0}")]
    ChannelIo(String),

    /// Terminal HTTP status (non-2xx, non-redirect).
    #[error("HTTP error status {0}")]
    HttpStatus(u16),

    #[error("too many redirects")]
    TooManyRedirects,

    /// A redirect status arrived without a recoverable Location target.
    #[error("redirect without Location header")]
    MissingLocation,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// No inactive partition bank is available to receive an image.
    #[error("no update partition available")]
    NoPartition,

    #[error("partition write failed: {0}")]
    PartitionWrite(String),

    /// The finished image failed validation and was discarded.
    #[error("image validation failed: {0}")]
    ValidationFailed(String),

    #[error("failed to set boot partition: {0}")]
    MarkBootableFailed(String),

    /// A response outgrew the accumulation buffer.
    #[error("response exceeds {limit} byte limit")]
    ResponseTooLarge { limit: usize },

    #[error("update already in progress")]
    AlreadyInProgress,

    #[error("no update in progress")]
    NotInProgress,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl UpdateError {
    /// True for deadline-class failures, which callers may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpdateError::CommandTimeout { .. })
    }
}
