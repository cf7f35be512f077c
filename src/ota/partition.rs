// Rollback-safe writer over the dual-bank firmware storage.
//
// Lifecycle: open_next -> write* -> finalize -> mark_bootable, or abort at
// any point. The guard here makes the illegal orders unrepresentable at
// runtime: mark_bootable is only reachable after finalize succeeded, and
// abort is idempotent no matter where the handle died.

use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::error::UpdateError;
use crate::platform::PartitionTable;

/// First byte of a valid firmware image (ESP application image magic).
const IMAGE_MAGIC: u8 = 0xE9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Closed,
    Open,
    Finalized,
}

pub struct PartitionWriter {
    table: Arc<Mutex<dyn PartitionTable>>,
    state: HandleState,
    digest: Sha256,
    bytes_written: u64,
    first_byte: Option<u8>,
}

impl PartitionWriter {
    pub fn new(table: Arc<Mutex<dyn PartitionTable>>) -> Self {
        Self {
            table,
            state: HandleState::Closed,
            digest: Sha256::new(),
            bytes_written: 0,
            first_byte: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Open the next inactive bank. The running bank is never reachable
    /// here.
    pub fn open_next(&mut self) -> Result<(), UpdateError> {
        if self.state != HandleState::Closed {
            return Err(UpdateError::PartitionWrite(
                "partition handle already open".to_string(),
            ));
        }
        self.table.lock().unwrap().begin()?;
        self.state = HandleState::Open;
        self.digest = Sha256::new();
        self.bytes_written = 0;
        self.first_byte = None;
        log::info!("Opened next update partition");
        Ok(())
    }

    /// Append a chunk. Safe for arbitrary chunk sizes.
    pub fn write(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        if self.state != HandleState::Open {
            return Err(UpdateError::PartitionWrite(
                "no open partition handle".to_string(),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.first_byte.is_none() {
            self.first_byte = Some(data[0]);
        }
        self.table.lock().unwrap().write(data)?;
        self.digest.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Validate and close the image. Only after this succeeds may the bank
    /// be marked bootable.
    pub fn finalize(&mut self) -> Result<(), UpdateError> {
        if self.state != HandleState::Open {
            return Err(UpdateError::ValidationFailed(
                "no open partition handle".to_string(),
            ));
        }

        if self.bytes_written == 0 {
            self.abort();
            return Err(UpdateError::ValidationFailed("empty image".to_string()));
        }
        if self.first_byte != Some(IMAGE_MAGIC) {
            self.abort();
            return Err(UpdateError::ValidationFailed(format!(
                "bad image magic: {:#04x}",
                self.first_byte.unwrap_or(0)
            )));
        }

        if let Err(e) = self.table.lock().unwrap().end() {
            // The platform releases the handle on a failed validation.
            self.state = HandleState::Closed;
            return Err(e);
        }
        self.state = HandleState::Finalized;

        let digest = self.digest.clone().finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        log::info!(
            "Image finalized: {} bytes, sha256={}",
            self.bytes_written,
            hex
        );
        Ok(())
    }

    /// Designate the written bank as the boot target.
    pub fn mark_bootable(&mut self) -> Result<(), UpdateError> {
        if self.state != HandleState::Finalized {
            return Err(UpdateError::MarkBootableFailed(
                "image not finalized".to_string(),
            ));
        }
        self.table.lock().unwrap().mark_bootable()?;
        log::info!("Update partition marked bootable");
        Ok(())
    }

    /// Discard an in-progress write. Idempotent: calling on a handle that
    /// was never opened, already finalized, or already aborted does
    /// nothing.
    pub fn abort(&mut self) {
        if self.state == HandleState::Open {
            self.table.lock().unwrap().abort();
            log::warn!(
                "Aborted partition write after {} bytes",
                self.bytes_written
            );
        }
        if self.state != HandleState::Finalized {
            self.state = HandleState::Closed;
        }
    }
}
