// ESP-IDF-backed platform implementations, compiled only for on-device
// builds (feature `esp`).

use std::time::Duration;

use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_get_running_partition, esp_ota_get_state_partition, esp_ota_handle_t,
    esp_ota_img_states_t, esp_ota_img_states_t_ESP_OTA_IMG_ABORTED,
    esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY, esp_ota_mark_app_valid_cancel_rollback,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_t, esp_restart, ESP_OK,
    OTA_SIZE_UNKNOWN,
};

use crate::error::UpdateError;
use crate::platform::{BankState, ByteChannel, KvStore, PartitionTable};

/// Dual-bank OTA storage over the ESP-IDF partition API.
pub struct EspPartitionTable {
    handle: Option<esp_ota_handle_t>,
    update_partition: *const esp_partition_t,
}

// The partition pointer refers to the static partition table in flash.
unsafe impl Send for EspPartitionTable {}

impl EspPartitionTable {
    pub fn new() -> Self {
        Self {
            handle: None,
            update_partition: core::ptr::null(),
        }
    }
}

impl Default for EspPartitionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionTable for EspPartitionTable {
    fn begin(&mut self) -> Result<(), UpdateError> {
        let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            return Err(UpdateError::NoPartition);
        }

        let mut handle: esp_ota_handle_t = Default::default();
        let err = unsafe { esp_ota_begin(partition, OTA_SIZE_UNKNOWN as usize, &mut handle) };
        if err != ESP_OK {
            return Err(UpdateError::PartitionWrite(format!(
                "esp_ota_begin failed: {}",
                err
            )));
        }

        self.update_partition = partition;
        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        let handle = self
            .handle
            .ok_or_else(|| UpdateError::PartitionWrite("no open handle".to_string()))?;
        let err = unsafe {
            esp_ota_write(handle, data.as_ptr() as *const core::ffi::c_void, data.len())
        };
        if err != ESP_OK {
            return Err(UpdateError::PartitionWrite(format!(
                "esp_ota_write failed: {}",
                err
            )));
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), UpdateError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| UpdateError::ValidationFailed("no open handle".to_string()))?;
        let err = unsafe { esp_ota_end(handle) };
        if err != ESP_OK {
            return Err(UpdateError::ValidationFailed(format!(
                "esp_ota_end failed: {}",
                err
            )));
        }
        Ok(())
    }

    fn mark_bootable(&mut self) -> Result<(), UpdateError> {
        if self.update_partition.is_null() {
            return Err(UpdateError::MarkBootableFailed("no partition".to_string()));
        }
        let err = unsafe { esp_ota_set_boot_partition(self.update_partition) };
        if err != ESP_OK {
            return Err(UpdateError::MarkBootableFailed(format!(
                "esp_ota_set_boot_partition failed: {}",
                err
            )));
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe {
                esp_ota_abort(handle);
            }
        }
    }

    fn running_bank_state(&self) -> BankState {
        let running = unsafe { esp_ota_get_running_partition() };
        let mut state: esp_ota_img_states_t = Default::default();
        let err = unsafe { esp_ota_get_state_partition(running, &mut state) };
        if err != ESP_OK {
            return BankState::Valid;
        }
        #[allow(non_upper_case_globals)]
        match state {
            esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY => BankState::PendingVerify,
            esp_ota_img_states_t_ESP_OTA_IMG_ABORTED => BankState::Aborted,
            _ => BankState::Valid,
        }
    }

    fn confirm_running_bank(&mut self) {
        let err = unsafe { esp_ota_mark_app_valid_cancel_rollback() };
        if err != ESP_OK {
            // Already confirmed on a previous boot
            log::warn!("esp_ota_mark_app_valid_cancel_rollback: {}", err);
        }
    }

    fn restart(&mut self) {
        unsafe {
            esp_restart();
        }
    }
}

impl Drop for EspPartitionTable {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Boot counter and configuration storage in NVS.
pub struct EspKvStore {
    nvs: esp_idf_svc::nvs::EspNvs<esp_idf_svc::nvs::NvsDefault>,
}

impl EspKvStore {
    pub fn new(namespace: &str) -> Result<Self, UpdateError> {
        let partition = esp_idf_svc::nvs::EspDefaultNvsPartition::take()
            .map_err(|e| UpdateError::InvalidArgument(format!("NVS partition: {}", e)))?;
        let nvs = esp_idf_svc::nvs::EspNvs::new(partition, namespace, true)
            .map_err(|e| UpdateError::InvalidArgument(format!("NVS namespace: {}", e)))?;
        Ok(Self { nvs })
    }
}

impl KvStore for EspKvStore {
    fn get_u32(&self, key: &str) -> Option<u32> {
        self.nvs.get_u32(key).ok().flatten()
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), UpdateError> {
        self.nvs
            .set_u32(key, value)
            .map_err(|e| UpdateError::InvalidArgument(format!("NVS write: {}", e)))
    }

    fn get_str(&self, key: &str) -> Option<String> {
        let mut buf = vec![0u8; 2048];
        self.nvs
            .get_str(key, &mut buf)
            .ok()
            .flatten()
            .map(|s| s.to_string())
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), UpdateError> {
        self.nvs
            .set_str(key, value)
            .map_err(|e| UpdateError::InvalidArgument(format!("NVS write: {}", e)))
    }
}

/// Modem command channel over the UART the modem is wired to.
pub struct UartByteChannel<'d> {
    uart: esp_idf_hal::uart::UartDriver<'d>,
}

impl<'d> UartByteChannel<'d> {
    pub fn new(uart: esp_idf_hal::uart::UartDriver<'d>) -> Self {
        Self { uart }
    }
}

// UartDriver is used from a single worker thread at a time.
unsafe impl Send for UartByteChannel<'_> {}

impl ByteChannel for UartByteChannel<'_> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, UpdateError> {
        let ticks = (timeout.as_millis() as u32).max(1);
        match self.uart.read(buf, ticks) {
            Ok(n) => Ok(n),
            Err(e) => Err(UpdateError::ChannelIo(format!("uart read: {}", e))),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        self.uart
            .write(data)
            .map(|_| ())
            .map_err(|e| UpdateError::ChannelIo(format!("uart write: {}", e)))
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Streaming HTTP backend over the ESP-IDF HTTP client.
pub struct EspHttpBackend {
    connection: Option<esp_idf_svc::http::client::EspHttpConnection>,
    location: Option<String>,
    timeout: Duration,
}

impl EspHttpBackend {
    pub fn new(timeout: Duration) -> Self {
        Self {
            connection: None,
            location: None,
            timeout,
        }
    }

    /// Backend with the configured request timeout.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(Duration::from_secs(config.http_timeout_secs as u64))
    }
}

unsafe impl Send for EspHttpBackend {}

impl crate::http::streaming::HttpBackend for EspHttpBackend {
    fn open(
        &mut self,
        url: &str,
    ) -> Result<crate::http::streaming::ResponseHead, UpdateError> {
        use embedded_svc::http::client::Connection;

        self.location = None;
        self.close();

        let config = esp_idf_svc::http::client::Configuration {
            buffer_size: Some(4096),
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut connection = esp_idf_svc::http::client::EspHttpConnection::new(&config)
            .map_err(|e| UpdateError::SessionSetup(format!("http client: {}", e)))?;

        connection
            .initiate_request(embedded_svc::http::Method::Get, url, &[])
            .map_err(|e| UpdateError::SessionSetup(format!("http open: {}", e)))?;
        connection
            .initiate_response()
            .map_err(|e| UpdateError::SessionSetup(format!("http response: {}", e)))?;

        let status = connection.status();
        self.location = connection.header("Location").map(|s| s.to_string());
        let content_length = connection
            .header("Content-Length")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        self.connection = Some(connection);
        Ok(crate::http::streaming::ResponseHead {
            status,
            content_length,
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
        use embedded_svc::io::Read;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| UpdateError::SessionSetup("not connected".to_string()))?;
        connection
            .read(buf)
            .map_err(|e| UpdateError::ChannelIo(format!("http read: {}", e)))
    }

    fn observed_redirect_target(&self) -> Option<String> {
        self.location.clone()
    }

    fn close(&mut self) {
        self.connection = None;
    }
}
