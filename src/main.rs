use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use embassy_executor::Spawner;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::gpio::OutputPin;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::timer::EspTaskTimerService;
use log::{error, info, warn};

use led_ota_node::config::DeviceConfig;
use led_ota_node::connectivity::{ConnectivityError, ConnectivityManager};
use led_ota_node::credentials::CredentialStore;
use led_ota_node::http_server::{start_http_server, HttpContext};
use led_ota_node::led_bank::LedBank;
use led_ota_node::led_manager::GpioLed;
use led_ota_node::ota_partition::EspOtaPartition;
use led_ota_node::reset_scheduler::ResetScheduler;
use led_ota_node::restart_timer::{restart_device, TaskTimerFactory};
use led_ota_node::status_monitor::StatusMonitor;
use led_ota_node::status_queue::StatusQueue;
use led_ota_node::system_state::{device_status, BuildInfo, DeviceStatusReader};
use led_ota_node::update_pipeline::UpdatePipeline;
use led_ota_node::wifi_client::{subscribe_station_events, EspStation};
use led_ota_node::wifi_storage::NvsBlobStore;

// Long-lived handles shared by the tasks and the HTTP server
struct DeviceContext {
    config: DeviceConfig,
    status: DeviceStatusReader,
    connectivity: ConnectivityManager<EspStation>,
    credentials: Arc<Mutex<CredentialStore<NvsBlobStore>>>,
    leds: Arc<Mutex<LedBank<GpioLed>>>,
    pipeline: Arc<UpdatePipeline<EspOtaPartition>>,
}

impl DeviceContext {
    fn http_context(&self) -> HttpContext {
        HttpContext {
            leds: self.leds.clone(),
            credentials: self.credentials.clone(),
            connectivity: self.connectivity.clone(),
            pipeline: self.pipeline.clone(),
            status: self.status.clone(),
            http: self.config.http.clone(),
            update: self.config.update.clone(),
        }
    }
}

#[embassy_executor::task]
async fn status_monitor_task(monitor: StatusMonitor<TaskTimerFactory>) {
    monitor.run().await
}

async fn bring_up(connectivity: &ConnectivityManager<EspStation>, connect_timeout: Duration) {
    match connectivity.connect(connect_timeout).await {
        Ok(connected) => info!("✅ Online at {} on '{}'", connected.ip, connected.ssid),
        // The station keeps retrying in the background
        Err(e) => warn!("⚠️ {}", e),
    }
}

#[embassy_executor::task]
async fn network_task(
    connectivity: ConnectivityManager<EspStation>,
    credentials: Arc<Mutex<CredentialStore<NvsBlobStore>>>,
    connect_timeout: Duration,
) {
    let loaded = {
        let mut store = credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connectivity.init(&mut store)
    };

    match loaded {
        Ok(_) => bring_up(&connectivity, connect_timeout).await,
        Err(ConnectivityError::NoCredentials) => {
            warn!("⚠️ No WiFi credentials stored - POST /api/config/network to configure");
        }
        Err(e) => error!("❌ Connectivity init failed: {}", e),
    }

    loop {
        let updated = connectivity.credentials_changed().await;
        info!("📶 Applying WiFi credentials for SSID: {}", updated.ssid());
        bring_up(&connectivity, connect_timeout).await;
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    if let Err(e) = run(spawner).await {
        error!("❌ Boot failed: {:?}", e);
    }
}

async fn run(spawner: Spawner) -> Result<()> {
    let build = BuildInfo::current();
    info!("🔧 Starting firmware built {} {}", build.compile_date, build.compile_time);

    let config = DeviceConfig::default();

    let peripherals = Peripherals::take().context("taking peripherals")?;
    let sys_loop = EspSystemEventLoop::take().context("taking system event loop")?;
    let nvs_partition = EspDefaultNvsPartition::take().context("initializing NVS")?;
    let timer_service = EspTaskTimerService::new().context("creating timer service")?;

    let status_queue = Arc::new(StatusQueue::new(config.monitor.send_timeout));
    let (status_writer, status_reader) = device_status(build);

    let reset = ResetScheduler::new(
        TaskTimerFactory::new(timer_service),
        config.monitor.reset_delay,
        restart_device,
    );
    let monitor = StatusMonitor::new(status_queue.clone(), status_writer, reset);

    let blob_store = NvsBlobStore::new_with_partition(nvs_partition.clone(), config.storage.namespace)
        .context("opening credential namespace")?;
    let credentials = Arc::new(Mutex::new(CredentialStore::new(
        blob_store,
        config.storage.credentials_key,
    )));

    let station = EspStation::new(peripherals.modem, sys_loop.clone(), nvs_partition)
        .context("initializing WiFi")?;
    let connectivity = ConnectivityManager::new(
        station,
        status_queue.clone(),
        config.network.retry_policy,
    );
    let _subscriptions = subscribe_station_events(&sys_loop, connectivity.clone())
        .context("subscribing to WiFi events")?;

    let pins = peripherals.pins;
    let leds = LedBank::new([
        GpioLed::new(pins.gpio21.downgrade_output())?,
        GpioLed::new(pins.gpio19.downgrade_output())?,
        GpioLed::new(pins.gpio18.downgrade_output())?,
        GpioLed::new(pins.gpio5.downgrade_output())?,
    ])?;

    let pipeline = UpdatePipeline::new(EspOtaPartition::new(), status_queue.clone(), config.update.clone());

    let ctx = DeviceContext {
        status: status_reader,
        connectivity,
        credentials,
        leds: Arc::new(Mutex::new(leds)),
        pipeline: Arc::new(pipeline),
        config,
    };

    let _server = start_http_server(ctx.http_context()).context("starting HTTP server")?;

    spawner
        .spawn(status_monitor_task(monitor))
        .map_err(|e| anyhow!("spawning status monitor: {:?}", e))?;
    spawner
        .spawn(network_task(
            ctx.connectivity.clone(),
            ctx.credentials.clone(),
            ctx.config.network.connect_timeout,
        ))
        .map_err(|e| anyhow!("spawning network task: {:?}", e))?;

    info!("✅ Device ready");

    // Server and event subscriptions live as long as this future
    core::future::pending::<()>().await;
    Ok(())
}
