// Import ESP-IDF event loop for handling system events
// The event loop delivers WiFi station and IP assignment events
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};

// Import peripheral trait for hardware access
use esp_idf_svc::hal::peripheral::Peripheral;

// Import NVS partition for WiFi driver storage needs
use esp_idf_svc::nvs::EspDefaultNvsPartition;

// Import IP event type for DHCP address assignment
use esp_idf_svc::netif::IpEvent;

// Import ESP-IDF error type
use esp_idf_svc::sys::EspError;

// Import WiFi-related types from ESP-IDF
// - EspWifi is used directly (not BlockingWifi) so connect() only issues the request
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent};

// Import logging macros
use log::{debug, info};

use crate::connectivity::{ConnectivityManager, DriverError, StationDriver, StationEvent};
use crate::credentials::Credentials;

// Station driver over the ESP-IDF WiFi stack
pub struct EspStation {
    wifi: EspWifi<'static>, // ESP-IDF WiFi driver
}

impl EspStation {
    pub fn new(
        modem: impl Peripheral<P = esp_idf_svc::hal::modem::Modem> + 'static,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> Result<Self, EspError> {
        info!("Initializing WiFi station driver");

        let wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;

        info!("WiFi station driver initialized");
        Ok(Self { wifi })
    }

    // Determine authentication method based on password
    fn determine_auth_method(password: &str) -> AuthMethod {
        if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        }
    }
}

fn driver_error(context: &str, e: EspError) -> DriverError {
    DriverError(format!("{}: {}", context, e))
}

impl StationDriver for EspStation {
    fn configure(&mut self, credentials: &Credentials) -> Result<(), DriverError> {
        let wifi_config = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid()
                .try_into()
                .map_err(|_| DriverError("SSID does not fit driver config".to_string()))?,
            password: credentials
                .password()
                .try_into()
                .map_err(|_| DriverError("password does not fit driver config".to_string()))?,
            channel: None,
            auth_method: Self::determine_auth_method(credentials.password()),
            ..Default::default()
        });

        self.wifi
            .set_configuration(&wifi_config)
            .map_err(|e| driver_error("set_configuration", e))?;
        info!("WiFi configuration set for SSID: {}", credentials.ssid());
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.wifi.start().map_err(|e| driver_error("start", e))
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        self.wifi.connect().map_err(|e| driver_error("connect", e))
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.wifi.disconnect().map_err(|e| driver_error("disconnect", e))
    }
}

/// Subscriptions that feed driver events into the manager. They stay
/// active for as long as the returned handles are alive.
pub struct StationSubscriptions {
    _wifi: EspSubscription<'static, System>,
    _ip: EspSubscription<'static, System>,
}

pub fn subscribe_station_events(
    sys_loop: &EspSystemEventLoop,
    manager: ConnectivityManager<EspStation>,
) -> Result<StationSubscriptions, EspError> {
    let wifi_manager = manager.clone();
    let wifi = sys_loop.subscribe::<WifiEvent, _>(move |event| match event {
        WifiEvent::StaStarted => wifi_manager.handle_event(StationEvent::Started),
        WifiEvent::StaDisconnected(_) => wifi_manager.handle_event(StationEvent::Disconnected),
        other => debug!("Ignoring WiFi event {:?}", other),
    })?;

    let ip = sys_loop.subscribe::<IpEvent, _>(move |event| {
        if let IpEvent::DhcpIpAssigned(assignment) = event {
            manager.handle_event(StationEvent::GotIp(assignment.ip()));
        }
    })?;

    info!("📡 Subscribed to WiFi and IP events");
    Ok(StationSubscriptions { _wifi: wifi, _ip: ip })
}
