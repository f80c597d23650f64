// Control plane
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod http_api;
pub mod led_bank;
pub mod reset_scheduler;
pub mod status_monitor;
pub mod status_queue;
pub mod system_state;
pub mod update_pipeline;

// ESP-IDF adapters
#[cfg(target_os = "espidf")]
pub mod http_server;
#[cfg(target_os = "espidf")]
pub mod led_manager;
#[cfg(target_os = "espidf")]
pub mod ota_partition;
#[cfg(target_os = "espidf")]
pub mod restart_timer;
#[cfg(target_os = "espidf")]
pub mod wifi_client;
#[cfg(target_os = "espidf")]
pub mod wifi_storage;
