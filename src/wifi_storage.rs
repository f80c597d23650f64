// Import ESP-IDF's NVS (Non-Volatile Storage) functionality
// Data stored in NVS survives device reboots and power cycles
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

// Import ESP-IDF error type for operation results
use esp_idf_svc::sys::EspError;

// Import logging macros for debug output
use log::{error, info};

// Import the blob store seam used by the credential store
use crate::credentials::{BlobStore, StoreError};

// NVS-backed blob store - one namespace, opaque fixed-size records
pub struct NvsBlobStore {
    nvs: EspNvs<NvsDefault>, // ESP-IDF NVS handle for flash storage operations
    namespace: &'static str,
}

impl NvsBlobStore {
    /// Open `namespace` on the provided partition (avoids singleton conflicts)
    pub fn new_with_partition(
        nvs_partition: EspDefaultNvsPartition,
        namespace: &'static str,
    ) -> Result<Self, EspError> {
        info!("Initializing NVS blob store, namespace '{}'", namespace);

        let nvs = EspNvs::new(nvs_partition, namespace, true)?;

        info!("NVS blob store ready");
        Ok(Self { nvs, namespace })
    }
}

impl BlobStore for NvsBlobStore {
    fn load_blob<'b>(&mut self, key: &str, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, StoreError> {
        self.nvs.get_blob(key, buf).map_err(|e| {
            error!("❌ Failed to read '{}/{}' from NVS: {:?}", self.namespace, key, e);
            StoreError::Backend(format!("nvs read {}: {}", key, e))
        })
    }

    fn save_blob(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        // set_blob commits before returning
        self.nvs.set_blob(key, data).map_err(|e| {
            error!("❌ Failed to write '{}/{}' to NVS: {:?}", self.namespace, key, e);
            StoreError::Backend(format!("nvs write {}: {}", key, e))
        })
    }
}
