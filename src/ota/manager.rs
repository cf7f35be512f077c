// Update orchestrator: owns the status state machine, runs the
// download+write loop on a background worker, and exposes progress,
// cancellation and the local push-chunk upload path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::error::UpdateError;
use crate::http::FirmwareSource;
use crate::ota::partition::PartitionWriter;
use crate::platform::{BankState, KvStore, PartitionTable};
use crate::version::FW_VERSION;

const KV_KEY_BOOT_COUNT: &str = "boot_cnt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Installing,
    PendingReboot,
    Success,
    Failed,
    Rollback,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Idle => "idle",
            UpdateStatus::Checking => "checking",
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Verifying => "verifying",
            UpdateStatus::Installing => "installing",
            UpdateStatus::PendingReboot => "pending_reboot",
            UpdateStatus::Success => "success",
            UpdateStatus::Failed => "failed",
            UpdateStatus::Rollback => "rollback",
        }
    }

    fn in_progress(&self) -> bool {
        matches!(self, UpdateStatus::Downloading | UpdateStatus::Installing)
    }
}

/// Snapshot of the update state. Callers only ever see clones of this;
/// the live structure stays behind the orchestrator's lock.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateInfo {
    pub current_version: String,
    pub target_version: String,
    pub url: String,
    pub status: UpdateStatus,
    /// 0-100, monotonic within a run.
    pub progress: u8,
    pub bytes_downloaded: u64,
    /// 0 = unknown.
    pub total_bytes: u64,
    pub error: String,
    pub rollback: bool,
    pub boot_count: u32,
}

impl UpdateInfo {
    fn new() -> Self {
        Self {
            current_version: FW_VERSION.to_string(),
            target_version: String::new(),
            url: String::new(),
            status: UpdateStatus::Idle,
            progress: 0,
            bytes_downloaded: 0,
            total_bytes: 0,
            error: String::new(),
            rollback: false,
            boot_count: 0,
        }
    }
}

pub type ProgressCallback = Box<dyn Fn(u8, u64, u64) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(UpdateStatus) + Send + Sync>;

/// Picks the download transport for the current network mode. Resolved by
/// the composition root; the orchestrator does not probe links itself.
pub type SourceSelector =
    Arc<dyn Fn() -> Result<Box<dyn FirmwareSource>, UpdateError> + Send + Sync>;

struct Shared {
    info: Mutex<UpdateInfo>,
    cancel: AtomicBool,
    progress_cb: Mutex<Option<ProgressCallback>>,
    status_cb: Mutex<Option<StatusCallback>>,
}

impl Shared {
    /// Mutate under the lock, then notify with the lock released.
    fn set_status(&self, status: UpdateStatus) {
        {
            let mut info = self.info.lock().unwrap();
            info.status = status;
        }
        self.notify_status(status);
    }

    fn fail(&self, message: String) {
        log::error!("Update failed: {}", message);
        {
            let mut info = self.info.lock().unwrap();
            info.status = UpdateStatus::Failed;
            info.error = message;
        }
        self.notify_status(UpdateStatus::Failed);
    }

    fn notify_status(&self, status: UpdateStatus) {
        if let Some(cb) = self.status_cb.lock().unwrap().as_ref() {
            cb(status);
        }
    }

    fn notify_progress(&self, progress: u8, downloaded: u64, total: u64) {
        if let Some(cb) = self.progress_cb.lock().unwrap().as_ref() {
            cb(progress, downloaded, total);
        }
    }
}

pub struct UpdateManager {
    shared: Arc<Shared>,
    partitions: Arc<Mutex<dyn PartitionTable>>,
    kv: Arc<Mutex<dyn KvStore>>,
    select_source: SourceSelector,
    chunk_size: usize,
    reboot_delay: Duration,
    /// Local push-chunk upload session, exclusive with the URL worker.
    upload: Mutex<Option<PartitionWriter>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateManager {
    pub fn new(
        partitions: Arc<Mutex<dyn PartitionTable>>,
        kv: Arc<Mutex<dyn KvStore>>,
        select_source: SourceSelector,
        config: &crate::config::Config,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                info: Mutex::new(UpdateInfo::new()),
                cancel: AtomicBool::new(false),
                progress_cb: Mutex::new(None),
                status_cb: Mutex::new(None),
            }),
            partitions,
            kv,
            select_source,
            chunk_size: config.download_chunk_size,
            reboot_delay: Duration::from_millis(config.reboot_delay_ms),
            upload: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Boot-time initialization: detect a rollback boot and bump the
    /// persisted boot counter. Called once early in app startup.
    pub fn init(&self) {
        log::info!("Initializing update module ({})", crate::version::version_info());

        let bank_state = self.partitions.lock().unwrap().running_bank_state();
        {
            let mut info = self.shared.info.lock().unwrap();
            match bank_state {
                BankState::PendingVerify => {
                    log::warn!("Running in pending-verify state - firmware needs validation");
                }
                BankState::Aborted => {
                    log::warn!("Previous firmware was aborted - this is a ROLLBACK boot");
                    info.rollback = true;
                    info.status = UpdateStatus::Rollback;
                    info.error = "Rollback from failed update".to_string();
                }
                BankState::Valid => {}
            }
        }

        let mut kv = self.kv.lock().unwrap();
        let boot_count = kv.get_u32(KV_KEY_BOOT_COUNT).unwrap_or(0);
        self.shared.info.lock().unwrap().boot_count = boot_count;
        if let Err(e) = kv.set_u32(KV_KEY_BOOT_COUNT, boot_count + 1) {
            log::warn!("Failed to persist boot counter: {}", e);
        }
        log::info!("Boot count: {}", boot_count + 1);
    }

    /// Kick off a download from `url` on the background worker.
    pub fn start(&self, url: &str, version: Option<&str>) -> Result<(), UpdateError> {
        if url.is_empty() {
            return Err(UpdateError::InvalidArgument("empty firmware URL".to_string()));
        }

        {
            let mut info = self.shared.info.lock().unwrap();
            if info.status.in_progress() {
                log::warn!("Update already in progress");
                return Err(UpdateError::AlreadyInProgress);
            }

            info.status = UpdateStatus::Checking;
            info.progress = 0;
            info.bytes_downloaded = 0;
            info.total_bytes = 0;
            info.error.clear();
            info.url = url.to_string();
            info.target_version = version.unwrap_or("unknown").to_string();
        }
        self.shared.cancel.store(false, Ordering::SeqCst);

        log::info!("Starting update from: {}", url);
        log::info!("Target version: {}", version.unwrap_or("unknown"));

        let shared = self.shared.clone();
        let partitions = self.partitions.clone();
        let select_source = self.select_source.clone();
        let chunk_size = self.chunk_size;

        let handle = std::thread::Builder::new()
            .name("ota_worker".to_string())
            .spawn(move || download_worker(shared, partitions, select_source, chunk_size))
            .map_err(|e| {
                self.shared
                    .fail(format!("Failed to spawn update worker: {}", e));
                UpdateError::InvalidArgument(format!("spawn failed: {}", e))
            })?;

        let mut worker = self.worker.lock().unwrap();
        if let Some(old) = worker.take() {
            // Previous worker already reached a terminal status; reap it.
            let _ = old.join();
        }
        *worker = Some(handle);
        Ok(())
    }

    /// Local firmware push for callers that already hold the image bytes
    /// (e.g. an upload through the config UI). Same partition invariants
    /// and status field as the URL path.
    pub fn push_chunk(
        &self,
        data: &[u8],
        is_first: bool,
        is_last: bool,
    ) -> Result<(), UpdateError> {
        let mut upload = self.upload.lock().unwrap();

        if is_first {
            if self.shared.info.lock().unwrap().status.in_progress() {
                return Err(UpdateError::AlreadyInProgress);
            }
            let mut writer = PartitionWriter::new(self.partitions.clone());
            writer.open_next()?;
            *upload = Some(writer);

            {
                let mut info = self.shared.info.lock().unwrap();
                info.status = UpdateStatus::Installing;
                info.progress = 0;
                info.bytes_downloaded = 0;
                info.total_bytes = 0;
                info.error.clear();
            }
            self.shared.notify_status(UpdateStatus::Installing);
        }

        let writer = upload
            .as_mut()
            .ok_or(UpdateError::NotInProgress)?;

        if !data.is_empty() {
            if let Err(e) = writer.write(data) {
                writer.abort();
                *upload = None;
                self.shared.fail(format!("Write failed: {}", e));
                return Err(e);
            }
            self.shared.info.lock().unwrap().bytes_downloaded += data.len() as u64;
        }

        if is_last {
            let mut writer = match upload.take() {
                Some(writer) => writer,
                None => return Err(UpdateError::NotInProgress),
            };
            self.shared.set_status(UpdateStatus::Verifying);
            if let Err(e) = writer.finalize() {
                writer.abort();
                self.shared.fail(format!("Validation failed: {}", e));
                return Err(e);
            }
            if let Err(e) = writer.mark_bootable() {
                self.shared.fail(format!("Set boot partition failed: {}", e));
                return Err(e);
            }

            {
                let mut info = self.shared.info.lock().unwrap();
                info.status = UpdateStatus::PendingReboot;
                info.progress = 100;
            }
            self.shared.notify_status(UpdateStatus::PendingReboot);
            log::info!("Local upload complete - reboot to apply");
        }

        Ok(())
    }

    /// Request cooperative cancellation. Checked once per streamed chunk.
    pub fn cancel(&self) -> Result<(), UpdateError> {
        if !self.shared.info.lock().unwrap().status.in_progress() {
            return Err(UpdateError::NotInProgress);
        }
        log::warn!("Cancellation requested");
        self.shared.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Lock-guarded snapshot of the update state.
    pub fn get_info(&self) -> UpdateInfo {
        self.shared.info.lock().unwrap().clone()
    }

    pub fn is_rollback(&self) -> bool {
        self.shared.info.lock().unwrap().rollback
    }

    /// Confirm the running image: clears the platform's pending-rollback
    /// flag and resets the boot counter. Must be called by firmware that
    /// has decided it is healthy.
    pub fn mark_valid(&self) {
        log::info!("Marking current firmware as valid");
        self.partitions.lock().unwrap().confirm_running_bank();

        if let Err(e) = self.kv.lock().unwrap().set_u32(KV_KEY_BOOT_COUNT, 0) {
            log::warn!("Failed to reset boot counter: {}", e);
        }

        let mut info = self.shared.info.lock().unwrap();
        info.boot_count = 0;
        info.rollback = false;
        if info.status == UpdateStatus::Rollback {
            info.status = UpdateStatus::Idle;
        }
    }

    pub fn set_progress_callback(&self, cb: ProgressCallback) {
        *self.shared.progress_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_status_callback(&self, cb: StatusCallback) {
        *self.shared.status_cb.lock().unwrap() = Some(cb);
    }

    /// Apply a pending update. Sleeps briefly so final status can
    /// propagate, then restarts; a no-op unless status is PendingReboot.
    pub fn reboot(&self) {
        if self.get_info().status != UpdateStatus::PendingReboot {
            log::warn!("No pending update to apply");
            return;
        }
        log::info!("Rebooting to apply update...");
        std::thread::sleep(self.reboot_delay);
        self.partitions.lock().unwrap().restart();
    }

    /// Wait for the background worker to exit. Test hook; production code
    /// polls `get_info` instead.
    #[cfg(test)]
    pub(crate) fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The download+write loop. Exactly one worker runs per update run,
/// enforced by the status check in `start`.
fn download_worker(
    shared: Arc<Shared>,
    partitions: Arc<Mutex<dyn PartitionTable>>,
    select_source: SourceSelector,
    chunk_size: usize,
) {
    let url = shared.info.lock().unwrap().url.clone();
    shared.set_status(UpdateStatus::Downloading);

    let mut source = match select_source() {
        Ok(source) => source,
        Err(e) => {
            shared.fail(format!("Transport unavailable: {}", e));
            return;
        }
    };

    let total = match source.begin(&url) {
        Ok(total) => total,
        Err(e) => {
            source.finish();
            shared.fail(format!("Connection failed: {}", e));
            return;
        }
    };
    if total > 0 {
        shared.info.lock().unwrap().total_bytes = total;
        log::info!("Firmware size: {} bytes", total);
    }

    let mut writer = PartitionWriter::new(partitions);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut downloaded: u64 = 0;
    let mut last_logged: i32 = -10;

    loop {
        // Cooperative cancellation, once per chunk.
        if shared.cancel.load(Ordering::SeqCst) {
            log::warn!("Update cancelled by user");
            writer.abort();
            source.finish();
            {
                let mut info = shared.info.lock().unwrap();
                info.status = UpdateStatus::Idle;
                info.error = "Cancelled by user".to_string();
            }
            shared.notify_status(UpdateStatus::Idle);
            return;
        }

        let n = match source.next_chunk(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                writer.abort();
                source.finish();
                shared.fail(format!("Download failed: {}", e));
                return;
            }
        };
        if n == 0 {
            break;
        }

        // First chunk: open the target bank and move to Installing.
        if !writer.is_open() {
            if let Err(e) = writer.open_next() {
                source.finish();
                shared.fail(format!("No update partition: {}", e));
                return;
            }
            shared.set_status(UpdateStatus::Installing);
        }

        if let Err(e) = writer.write(&buf[..n]) {
            writer.abort();
            source.finish();
            shared.fail(format!("Write failed: {}", e));
            return;
        }
        downloaded += n as u64;

        let (progress, total_bytes) = {
            let mut info = shared.info.lock().unwrap();
            info.bytes_downloaded = downloaded;
            if info.total_bytes > 0 {
                let pct = ((downloaded * 100) / info.total_bytes) as u8;
                // Monotonic within the run
                if pct > info.progress {
                    info.progress = pct.min(100);
                }
            }
            (info.progress, info.total_bytes)
        };
        shared.notify_progress(progress, downloaded, total_bytes);

        if progress as i32 >= last_logged + 10 {
            log::info!(
                "Download progress: {}% ({}/{} bytes)",
                progress,
                downloaded,
                total_bytes
            );
            last_logged = progress as i32;
        }

        if total > 0 && downloaded >= total {
            break;
        }
    }
    source.finish();

    if total > 0 && downloaded < total {
        writer.abort();
        shared.fail(format!(
            "Incomplete download: {} of {} bytes",
            downloaded, total
        ));
        return;
    }
    if downloaded == 0 {
        writer.abort();
        shared.fail("No data received".to_string());
        return;
    }

    log::info!("Download complete: {} bytes, verifying...", downloaded);
    shared.set_status(UpdateStatus::Verifying);

    if let Err(e) = writer.finalize() {
        writer.abort();
        shared.fail(format!("Validation failed: {}", e));
        return;
    }
    if let Err(e) = writer.mark_bootable() {
        shared.fail(format!("Set boot partition failed: {}", e));
        return;
    }

    {
        let mut info = shared.info.lock().unwrap();
        info.status = UpdateStatus::PendingReboot;
        info.progress = 100;
        info.current_version = info.target_version.clone();
    }
    shared.notify_status(UpdateStatus::PendingReboot);
    log::info!("Update successful - reboot to apply");
}
