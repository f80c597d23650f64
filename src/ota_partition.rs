// OTA partition - flash primitives over the ESP-IDF OTA API

use core::ffi::{c_void, CStr};

use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_get_running_partition, esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write,
    esp_partition_t, EspError, ESP_ERR_OTA_VALIDATE_FAILED, OTA_SIZE_UNKNOWN,
};
use log::{info, warn};

use crate::update_pipeline::{FlashError, FlashPartition, TargetPartition};

pub struct EspOtaPartition {
    target: *const esp_partition_t,
    handle: Option<esp_ota_handle_t>,
}

// The partition table entry is static and the handle is only used by the
// session that holds the pipeline lock
unsafe impl Send for EspOtaPartition {}

impl EspOtaPartition {
    pub fn new() -> Self {
        let running = unsafe { esp_ota_get_running_partition() };
        if let Some(running) = unsafe { running.as_ref() } {
            info!(
                "Running from partition '{}' at 0x{:x}",
                partition_label(running),
                running.address
            );
        }

        Self {
            target: core::ptr::null(),
            handle: None,
        }
    }
}

impl Default for EspOtaPartition {
    fn default() -> Self {
        Self::new()
    }
}

fn partition_label(partition: &esp_partition_t) -> String {
    unsafe { CStr::from_ptr(partition.label.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

impl FlashPartition for EspOtaPartition {
    fn begin(&mut self) -> Result<TargetPartition, FlashError> {
        // A previous session may have left a handle open
        self.abort();

        let target = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        let partition = unsafe { target.as_ref() }.ok_or(FlashError::NoTarget)?;

        // Image size comes from the image header, the body length includes framing
        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(target, OTA_SIZE_UNKNOWN as _, &mut handle) })
            .map_err(|e: EspError| FlashError::Begin(e.to_string()))?;

        self.target = target;
        self.handle = Some(handle);

        Ok(TargetPartition {
            label: partition_label(partition),
            address: partition.address,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<(), FlashError> {
        let handle = self
            .handle
            .ok_or_else(|| FlashError::Write("no open handle".to_string()))?;

        esp!(unsafe { esp_ota_write(handle, data.as_ptr() as *const c_void, data.len() as _) })
            .map_err(|e: EspError| FlashError::Write(e.to_string()))
    }

    fn finalize(&mut self) -> Result<(), FlashError> {
        // esp_ota_end releases the handle whatever the outcome
        let handle = self
            .handle
            .take()
            .ok_or_else(|| FlashError::Finalize("no open handle".to_string()))?;

        let result = unsafe { esp_ota_end(handle) };
        if result == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            return Err(FlashError::Finalize("image validation failed".to_string()));
        }
        esp!(result).map_err(|e: EspError| FlashError::Finalize(e.to_string()))
    }

    fn set_boot(&mut self) -> Result<(), FlashError> {
        if self.target.is_null() {
            return Err(FlashError::NoTarget);
        }

        esp!(unsafe { esp_ota_set_boot_partition(self.target) })
            .map_err(|e: EspError| FlashError::Commit(e.to_string()))
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = esp!(unsafe { esp_ota_abort(handle) }) {
                warn!("⚠️ esp_ota_abort failed: {}", e);
            }
        }
    }
}
