// Connectivity Manager Module
// WiFi station lifecycle: load credentials, connect, reconnect on disconnect
// Driver events are applied from the event-loop callback and must never block on I/O

use core::sync::atomic::{AtomicBool, Ordering};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::with_timeout;
use log::{debug, error, info, warn};

use crate::credentials::{BlobStore, CredentialStore, Credentials, StoreError};
use crate::status_queue::{OverflowPolicy, StatusQueue};
use crate::system_state::{ConnectionPhase, StatusMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError(pub String);

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WiFi driver error: {}", self.0)
    }
}

impl std::error::Error for DriverError {}

/// Station-mode WiFi driver. Every call only issues a request; outcomes
/// arrive later as `StationEvent`s.
pub trait StationDriver: Send {
    fn configure(&mut self, credentials: &Credentials) -> Result<(), DriverError>;
    fn start(&mut self) -> Result<(), DriverError>;
    fn connect(&mut self) -> Result<(), DriverError>;
    /// Drop the current association or attempt; a `Disconnected` event follows
    fn disconnect(&mut self) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationEvent {
    Started,
    Disconnected,
    GotIp(Ipv4Addr),
}

/// Reconnect budget after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Unbounded,
    Limited(u32),
}

impl RetryPolicy {
    fn allows(&self, attempt: u32) -> bool {
        match self {
            RetryPolicy::Unbounded => true,
            RetryPolicy::Limited(max) => attempt <= *max,
        }
    }
}

#[derive(Debug)]
pub enum ConnectivityError {
    NoCredentials,
    Storage(StoreError),
    Driver(DriverError),
    Timeout(Duration),
}

impl std::fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityError::NoCredentials => write!(f, "No WiFi credentials stored"),
            ConnectivityError::Storage(e) => write!(f, "{}", e),
            ConnectivityError::Driver(e) => write!(f, "{}", e),
            ConnectivityError::Timeout(t) => write!(f, "No IP address within {:?}", t),
        }
    }
}

impl std::error::Error for ConnectivityError {}

impl From<DriverError> for ConnectivityError {
    fn from(e: DriverError) -> Self {
        ConnectivityError::Driver(e)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub credentials: Option<Credentials>,
    pub last_ip: Option<Ipv4Addr>,
    pub retries: u32,
    // What the driver was last configured with
    applied: Option<Credentials>,
    started: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedInfo {
    pub ip: Ipv4Addr,
    pub ssid: String,
}

struct Shared<D> {
    driver: Mutex<D>,
    state: Mutex<ConnectionState>,
    connected: Signal<CriticalSectionRawMutex, Ipv4Addr>,
    credentials_changed: Signal<CriticalSectionRawMutex, ()>,
    attempt_in_flight: AtomicBool,
    status: Arc<StatusQueue>,
    policy: RetryPolicy,
}

/// Cheap handle shared by the boot task, the event subscription and HTTP handlers
pub struct ConnectivityManager<D: StationDriver> {
    shared: Arc<Shared<D>>,
}

impl<D: StationDriver> Clone for ConnectivityManager<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: StationDriver> ConnectivityManager<D> {
    pub fn new(driver: D, status: Arc<StatusQueue>, policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver: Mutex::new(driver),
                state: Mutex::new(ConnectionState {
                    phase: ConnectionPhase::Idle,
                    credentials: None,
                    last_ip: None,
                    retries: 0,
                    applied: None,
                    started: false,
                }),
                connected: Signal::new(),
                credentials_changed: Signal::new(),
                attempt_in_flight: AtomicBool::new(false),
                status,
                policy,
            }),
        }
    }

    /// Load persisted credentials. Fails fast when none are stored.
    pub fn init<B: BlobStore>(&self, store: &mut CredentialStore<B>) -> Result<Credentials, ConnectivityError> {
        let credentials = store
            .load()
            .map_err(ConnectivityError::Storage)?
            .ok_or(ConnectivityError::NoCredentials)?;

        info!("📶 WiFi credentials loaded for SSID: {}", credentials.ssid());
        self.state().credentials = Some(credentials.clone());
        Ok(credentials)
    }

    /// Replace the credentials and wake whoever waits in `credentials_changed`
    pub fn set_credentials(&self, credentials: Credentials) {
        self.state().credentials = Some(credentials);
        self.shared.credentials_changed.signal(());
    }

    /// Resolves with the new credentials after the next `set_credentials`
    pub async fn credentials_changed(&self) -> Credentials {
        loop {
            self.shared.credentials_changed.wait().await;
            if let Some(credentials) = self.credentials() {
                return credentials;
            }
        }
    }

    /// Apply credentials, start the station and wait for an IP address.
    /// A running station is re-associated when the credentials changed.
    /// On timeout the attempt keeps running in the driver.
    pub async fn connect(&self, timeout: Duration) -> Result<ConnectedInfo, ConnectivityError> {
        let (credentials, started, phase) = {
            let mut state = self.state();
            let credentials = state.credentials.clone().ok_or(ConnectivityError::NoCredentials)?;
            if let (ConnectionPhase::Connected, Some(ip)) = (state.phase, state.last_ip) {
                if state.applied.as_ref() == Some(&credentials) {
                    return Ok(ConnectedInfo {
                        ip,
                        ssid: credentials.ssid().to_string(),
                    });
                }
            }
            state.retries = 0;
            (credentials, state.started, state.phase)
        };

        self.shared.connected.reset();

        {
            let mut driver = self.driver();
            driver.configure(&credentials)?;
            if !started {
                driver.start()?;
            } else if phase != ConnectionPhase::Idle {
                // Reconnect on the resulting Disconnected event picks up the new config
                driver.disconnect()?;
            }
        }
        {
            let mut state = self.state();
            state.applied = Some(credentials.clone());
            state.started = true;
        }
        if started && phase == ConnectionPhase::Idle {
            // Retry budget was exhausted, nothing is in flight
            self.state().phase = ConnectionPhase::Connecting;
            self.issue_connect();
        }
        info!("🔌 Connecting to '{}' (timeout {:?})", credentials.ssid(), timeout);

        let wait = embassy_time::Duration::from_micros(timeout.as_micros() as u64);
        match with_timeout(wait, self.shared.connected.wait()).await {
            Ok(ip) => {
                info!("✅ Connected to '{}' with IP {}", credentials.ssid(), ip);
                Ok(ConnectedInfo {
                    ip,
                    ssid: credentials.ssid().to_string(),
                })
            }
            Err(_) => {
                warn!("⏰ No IP address from '{}' within {:?}", credentials.ssid(), timeout);
                let _ = self
                    .shared
                    .status
                    .send(StatusMessage::WifiFailed, OverflowPolicy::Reject)
                    .await;
                Err(ConnectivityError::Timeout(timeout))
            }
        }
    }

    /// Apply a driver event. Runs in the event-loop context.
    pub fn handle_event(&self, event: StationEvent) {
        match event {
            StationEvent::Started => {
                info!("📡 WiFi station started");
                self.state().phase = ConnectionPhase::Connecting;
                self.notify(StatusMessage::WifiInitializing);
                self.issue_connect();
            }
            StationEvent::Disconnected => {
                self.shared.attempt_in_flight.store(false, Ordering::Release);

                let retry = {
                    let mut state = self.state();
                    state.last_ip = None;
                    state.retries = state.retries.saturating_add(1);
                    if self.shared.policy.allows(state.retries) {
                        state.phase = ConnectionPhase::Retrying;
                        info!("🔄 WiFi disconnected, reconnect attempt {}", state.retries);
                        true
                    } else {
                        state.phase = ConnectionPhase::Idle;
                        error!("❌ WiFi retry budget exhausted after {} attempts", state.retries - 1);
                        false
                    }
                };

                self.notify(StatusMessage::WifiFailed);
                if retry {
                    self.issue_connect();
                }
            }
            StationEvent::GotIp(ip) => {
                self.shared.attempt_in_flight.store(false, Ordering::Release);
                {
                    let mut state = self.state();
                    state.last_ip = Some(ip);
                    state.phase = ConnectionPhase::Connected;
                    state.retries = 0;
                }
                info!("🌐 Got IP address: {}", ip);
                self.shared.connected.signal(ip);
                self.notify(StatusMessage::WifiConnected);
            }
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state().phase
    }

    pub fn last_ip(&self) -> Option<Ipv4Addr> {
        self.state().last_ip
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.state().credentials.clone()
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.state().clone()
    }

    // At most one connect request outstanding at a time
    fn issue_connect(&self) {
        if self.shared.attempt_in_flight.swap(true, Ordering::AcqRel) {
            debug!("Connect already in flight, skipping");
            return;
        }

        if let Err(e) = self.driver().connect() {
            error!("❌ Failed to issue WiFi connect: {}", e);
            self.shared.attempt_in_flight.store(false, Ordering::Release);
        }
    }

    fn notify(&self, msg: StatusMessage) {
        let _ = self.shared.status.try_send(msg);
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn driver(&self) -> MutexGuard<'_, D> {
        self.shared
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::MemoryBlobStore;

    #[derive(Default)]
    struct StationLog {
        configured_ssid: Option<String>,
        starts: usize,
        connects: usize,
        disconnects: usize,
    }

    #[derive(Clone, Default)]
    struct FakeStation {
        log: Arc<Mutex<StationLog>>,
    }

    impl StationDriver for FakeStation {
        fn configure(&mut self, credentials: &Credentials) -> Result<(), DriverError> {
            self.log.lock().unwrap().configured_ssid = Some(credentials.ssid().to_string());
            Ok(())
        }

        fn start(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().starts += 1;
            Ok(())
        }

        fn connect(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().connects += 1;
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().disconnects += 1;
            Ok(())
        }
    }

    fn manager(policy: RetryPolicy) -> (ConnectivityManager<FakeStation>, Arc<Mutex<StationLog>>, Arc<StatusQueue>) {
        let station = FakeStation::default();
        let log = station.log.clone();
        let queue = Arc::new(StatusQueue::new(Duration::ZERO));
        (ConnectivityManager::new(station, queue.clone(), policy), log, queue)
    }

    fn connects(log: &Arc<Mutex<StationLog>>) -> usize {
        log.lock().unwrap().connects
    }

    #[test]
    fn init_without_credentials_fails_fast() {
        let (manager, _log, _queue) = manager(RetryPolicy::Unbounded);
        let mut store = CredentialStore::new(MemoryBlobStore::default(), "wifi_config");

        assert!(matches!(
            manager.init(&mut store),
            Err(ConnectivityError::NoCredentials)
        ));
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
    }

    #[test]
    fn init_loads_stored_credentials() {
        let (manager, _log, _queue) = manager(RetryPolicy::Unbounded);
        let mut store = CredentialStore::new(MemoryBlobStore::default(), "wifi_config");
        store.save(&Credentials::new("net", "secret123").unwrap()).unwrap();

        manager.init(&mut store).unwrap();
        assert_eq!(manager.credentials().unwrap().ssid(), "net");
    }

    #[test]
    fn start_event_issues_connect() {
        let (manager, log, queue) = manager(RetryPolicy::Unbounded);

        manager.handle_event(StationEvent::Started);

        assert_eq!(connects(&log), 1);
        assert_eq!(manager.phase(), ConnectionPhase::Connecting);
        assert_eq!(queue.try_receive(), Some(StatusMessage::WifiInitializing));
    }

    #[test]
    fn each_disconnect_triggers_exactly_one_reconnect() {
        let (manager, log, queue) = manager(RetryPolicy::Unbounded);
        manager.handle_event(StationEvent::Started);

        for expected in 2..=6 {
            manager.handle_event(StationEvent::Disconnected);
            assert_eq!(connects(&log), expected);
            assert_eq!(manager.phase(), ConnectionPhase::Retrying);
            while queue.try_receive().is_some() {}
        }
    }

    #[test]
    fn duplicate_start_does_not_stack_attempts() {
        let (manager, log, _queue) = manager(RetryPolicy::Unbounded);
        manager.handle_event(StationEvent::Started);
        manager.handle_event(StationEvent::Started);

        assert_eq!(connects(&log), 1);
    }

    #[test]
    fn got_ip_records_address_and_resets_retries() {
        let (manager, _log, queue) = manager(RetryPolicy::Unbounded);
        let ip = Ipv4Addr::new(192, 168, 1, 42);

        manager.handle_event(StationEvent::Started);
        manager.handle_event(StationEvent::Disconnected);
        manager.handle_event(StationEvent::GotIp(ip));

        let state = manager.snapshot();
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.last_ip, Some(ip));
        assert_eq!(state.retries, 0);

        let messages: Vec<_> = std::iter::from_fn(|| queue.try_receive()).collect();
        assert_eq!(
            messages,
            vec![
                StatusMessage::WifiInitializing,
                StatusMessage::WifiFailed,
                StatusMessage::WifiConnected
            ]
        );
    }

    #[test]
    fn disconnect_clears_ip() {
        let (manager, _log, _queue) = manager(RetryPolicy::Unbounded);
        manager.handle_event(StationEvent::GotIp(Ipv4Addr::new(10, 0, 0, 2)));
        manager.handle_event(StationEvent::Disconnected);

        assert_eq!(manager.last_ip(), None);
    }

    #[test]
    fn limited_policy_stops_reconnecting() {
        let (manager, log, _queue) = manager(RetryPolicy::Limited(2));
        manager.handle_event(StationEvent::Started);

        manager.handle_event(StationEvent::Disconnected);
        manager.handle_event(StationEvent::Disconnected);
        assert_eq!(connects(&log), 3);

        manager.handle_event(StationEvent::Disconnected);
        assert_eq!(connects(&log), 3);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
    }

    #[test]
    fn connect_returns_once_ip_is_assigned() {
        let (manager, log, _queue) = manager(RetryPolicy::Unbounded);
        manager.set_credentials(Credentials::new("net", "secret123").unwrap());

        let events = manager.clone();
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            events.handle_event(StationEvent::Started);
            events.handle_event(StationEvent::GotIp(Ipv4Addr::new(192, 168, 4, 2)));
        });

        let info = embassy_futures::block_on(manager.connect(Duration::from_secs(5))).unwrap();
        notifier.join().unwrap();

        assert_eq!(info.ip, Ipv4Addr::new(192, 168, 4, 2));
        assert_eq!(info.ssid, "net");
        let log = log.lock().unwrap();
        assert_eq!(log.configured_ssid.as_deref(), Some("net"));
        assert_eq!(log.starts, 1);
    }

    #[test]
    fn connect_times_out_without_cancelling() {
        let (manager, log, queue) = manager(RetryPolicy::Unbounded);
        manager.set_credentials(Credentials::new("net", "").unwrap());

        let result = embassy_futures::block_on(manager.connect(Duration::from_millis(20)));

        assert!(matches!(result, Err(ConnectivityError::Timeout(_))));
        assert_eq!(queue.try_receive(), Some(StatusMessage::WifiFailed));

        // Late IP still lands in the state
        manager.handle_event(StationEvent::GotIp(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(manager.phase(), ConnectionPhase::Connected);
        assert_eq!(log.lock().unwrap().starts, 1);
    }

    #[test]
    fn new_credentials_reach_the_running_station() {
        let (manager, log, _queue) = manager(RetryPolicy::Unbounded);
        let old_ip = Ipv4Addr::new(192, 168, 4, 2);
        let new_ip = Ipv4Addr::new(10, 0, 0, 7);
        manager.set_credentials(Credentials::new("old", "secret123").unwrap());

        let events = manager.clone();
        let first = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            events.handle_event(StationEvent::Started);
            events.handle_event(StationEvent::GotIp(old_ip));
        });
        embassy_futures::block_on(manager.connect(Duration::from_secs(5))).unwrap();
        first.join().unwrap();

        manager.set_credentials(Credentials::new("new", "hunter22").unwrap());
        let events = manager.clone();
        let second = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            events.handle_event(StationEvent::Disconnected);
            events.handle_event(StationEvent::GotIp(new_ip));
        });
        let info = embassy_futures::block_on(manager.connect(Duration::from_secs(5))).unwrap();
        second.join().unwrap();

        assert_eq!(info.ssid, "new");
        assert_eq!(info.ip, new_ip);
        let log = log.lock().unwrap();
        assert_eq!(log.configured_ssid.as_deref(), Some("new"));
        assert_eq!(log.starts, 1);
        assert_eq!(log.disconnects, 1);
        assert_eq!(log.connects, 2);
    }

    #[test]
    fn unchanged_credentials_keep_the_connection() {
        let (manager, log, _queue) = manager(RetryPolicy::Unbounded);
        manager.set_credentials(Credentials::new("net", "secret123").unwrap());

        let events = manager.clone();
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            events.handle_event(StationEvent::Started);
            events.handle_event(StationEvent::GotIp(Ipv4Addr::new(192, 168, 4, 2)));
        });
        embassy_futures::block_on(manager.connect(Duration::from_secs(5))).unwrap();
        notifier.join().unwrap();

        let info = embassy_futures::block_on(manager.connect(Duration::from_secs(5))).unwrap();
        assert_eq!(info.ip, Ipv4Addr::new(192, 168, 4, 2));
        let log = log.lock().unwrap();
        assert_eq!(log.disconnects, 0);
        assert_eq!(log.starts, 1);
    }

    #[test]
    fn exhausted_station_retries_with_new_credentials() {
        let (manager, log, _queue) = manager(RetryPolicy::Limited(0));
        manager.set_credentials(Credentials::new("old", "secret123").unwrap());
        let _ = embassy_futures::block_on(manager.connect(Duration::from_millis(10)));
        manager.handle_event(StationEvent::Started);
        manager.handle_event(StationEvent::Disconnected);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
        assert_eq!(connects(&log), 1);

        manager.set_credentials(Credentials::new("new", "").unwrap());
        let _ = embassy_futures::block_on(manager.connect(Duration::from_millis(10)));

        let log = log.lock().unwrap();
        assert_eq!(log.configured_ssid.as_deref(), Some("new"));
        assert_eq!(log.connects, 2);
        assert_eq!(log.disconnects, 0);
    }

    #[test]
    fn credentials_changed_wakes_with_the_new_ssid() {
        let (manager, _log, _queue) = manager(RetryPolicy::Unbounded);

        let setter = manager.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set_credentials(Credentials::new("fresh", "secret123").unwrap());
        });

        let credentials = embassy_futures::block_on(manager.credentials_changed());
        writer.join().unwrap();
        assert_eq!(credentials.ssid(), "fresh");
    }

    #[test]
    fn connect_without_credentials_is_rejected() {
        let (manager, _log, _queue) = manager(RetryPolicy::Unbounded);
        let result = embassy_futures::block_on(manager.connect(Duration::from_millis(10)));
        assert!(matches!(result, Err(ConnectivityError::NoCredentials)));
    }
}
