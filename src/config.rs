// Device configuration
// Compile-time defaults for every control-plane component, grouped per concern

use std::time::Duration;

use crate::connectivity::RetryPolicy;

/// Persistent storage layout for the credential record
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub namespace: &'static str,   // NVS namespace holding device data
    pub credentials_key: &'static str, // Key of the fixed-size credential blob
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: "device_storage",
            credentials_key: "wifi_config",
        }
    }
}

/// WiFi station behaviour
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub connect_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::Unbounded,
        }
    }
}

/// Firmware update pipeline tuning
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub recv_buffer_size: usize,
    pub max_consecutive_timeouts: u32, // Receive timeouts tolerated before the session is abandoned
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 1024,
            max_consecutive_timeouts: 30,
        }
    }
}

/// Status monitor and deferred restart
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub send_timeout: Duration, // Producer wait before the overflow policy applies
    pub reset_delay: Duration,  // Lets the update response reach the client before restart
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(500),
            reset_delay: Duration::from_secs(8),
        }
    }
}

/// HTTP gateway settings
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub stack_size: usize,
    pub max_uri_handlers: usize,
    pub max_body_size: usize, // Largest JSON body buffered by config/LED handlers
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            stack_size: 8192,
            max_uri_handlers: 20,
            max_body_size: 1024,
        }
    }
}

/// Complete device configuration
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub update: UpdateConfig,
    pub monitor: MonitorConfig,
    pub http: HttpConfig,
}
