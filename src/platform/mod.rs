// Platform abstraction layer.
//
// The update pipeline never talks to hardware directly; it is handed these
// capabilities by the firmware's composition root. On the device they are
// backed by ESP-IDF (see `esp` module, feature `esp`); tests inject
// in-memory doubles.

use std::time::Duration;

use crate::error::UpdateError;

#[cfg(feature = "esp")]
pub mod esp;

/// Blocking byte-stream channel to a communications peripheral (the modem
/// UART on the gateway hardware).
pub trait ByteChannel: Send {
    /// Read up to `buf.len()` bytes, blocking at most `timeout`.
    /// Returns `Ok(0)` when no data arrived within the timeout.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, UpdateError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), UpdateError>;

    /// True when the underlying link is usable (UART driver installed,
    /// modem powered).
    fn is_ready(&self) -> bool;
}

/// Validation state of the currently running firmware bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankState {
    /// Image has been confirmed by a previous `mark_valid`.
    Valid,
    /// Freshly flashed image that has not confirmed itself yet.
    PendingVerify,
    /// Previous image was aborted by the bootloader; this boot is a rollback.
    Aborted,
}

/// Dual-bank firmware storage plus boot-state introspection.
///
/// `begin` always targets the next inactive bank; the running bank is not
/// reachable for writes through this interface.
pub trait PartitionTable: Send {
    /// Open the next inactive bank for writing.
    fn begin(&mut self) -> Result<(), UpdateError>;

    fn write(&mut self, data: &[u8]) -> Result<(), UpdateError>;

    /// Close the bank and run the platform's image validation.
    fn end(&mut self) -> Result<(), UpdateError>;

    /// Designate the written bank as the one to boot next. Only legal after
    /// a successful `end`.
    fn mark_bootable(&mut self) -> Result<(), UpdateError>;

    /// Discard an in-progress write. Must tolerate being called without an
    /// open bank.
    fn abort(&mut self);

    fn running_bank_state(&self) -> BankState;

    /// Confirm the running image and clear any pending-rollback flag.
    fn confirm_running_bank(&mut self);

    /// Restart the device.
    fn restart(&mut self);
}

/// Small persisted key/value store (NVS on the device). Survives power loss.
pub trait KvStore: Send {
    fn get_u32(&self, key: &str) -> Option<u32>;
    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), UpdateError>;
    fn get_str(&self, key: &str) -> Option<String>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), UpdateError>;
}
