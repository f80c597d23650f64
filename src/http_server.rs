// HTTP Server Module
// Routes LED, network config and firmware update requests onto the control plane

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use embedded_svc::http::Method;
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::io::EspIOError;
use esp_idf_svc::sys::{ESP_ERR_TIMEOUT, HTTPD_SOCK_ERR_TIMEOUT};
use log::{error, info, warn};
use serde::Serialize;

use crate::config::{HttpConfig, UpdateConfig};
use crate::connectivity::ConnectivityManager;
use crate::credentials::CredentialStore;
use crate::http_api::{
    parse_content_length, parse_led_uri, parse_network_config, read_body, ApiError,
    IpAddrResponse, LedRoute, LedStateResponse, NetworkConfigBody, OtaStatusResponse, CORS_HEADERS,
};
use crate::led_bank::LedBank;
use crate::led_manager::GpioLed;
use crate::ota_partition::EspOtaPartition;
use crate::system_state::DeviceStatusReader;
use crate::update_pipeline::{BodyFraming, BodySource, RecvError, UpdatePipeline};
use crate::wifi_client::EspStation;
use crate::wifi_storage::NvsBlobStore;

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// Everything the handlers touch, handed over by the composition root
#[derive(Clone)]
pub struct HttpContext {
    pub leds: Arc<Mutex<LedBank<GpioLed>>>,
    pub credentials: Arc<Mutex<CredentialStore<NvsBlobStore>>>,
    pub connectivity: ConnectivityManager<EspStation>,
    pub pipeline: Arc<UpdatePipeline<EspOtaPartition>>,
    pub status: DeviceStatusReader,
    pub http: HttpConfig,
    pub update: UpdateConfig,
}

// Request body as a blocking byte source; socket timeouts surface as RecvError::Timeout
struct RequestBody<'a, R>(&'a mut R);

impl<R: Read<Error = EspIOError>> BodySource for RequestBody<'_, R> {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
        self.0.read(buf).map_err(|e| {
            let code = e.0.code();
            if code == HTTPD_SOCK_ERR_TIMEOUT || code == ESP_ERR_TIMEOUT as i32 {
                RecvError::Timeout
            } else {
                RecvError::Io(e.to_string())
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn send_json<T: Serialize>(req: HttpRequest<'_, '_>, status: u16, body: &T) -> Result<()> {
    let json = serde_json::to_string(body)?;
    send_raw(req, status, json.as_bytes())
}

fn send_raw(req: HttpRequest<'_, '_>, status: u16, body: &[u8]) -> Result<()> {
    let headers = [
        ("Content-Type", "application/json"),
        CORS_HEADERS[0],
        CORS_HEADERS[1],
        CORS_HEADERS[2],
    ];
    let mut response = req.into_response(status, None, &headers)?;
    response.write_all(body)?;
    Ok(())
}

fn respond<T: Serialize>(req: HttpRequest<'_, '_>, result: Result<T, ApiError>) -> Result<()> {
    match result {
        Ok(body) => send_json(req, 200, &body),
        Err(e) => {
            warn!("⚠️ {} {} -> {}", method_name(req.method()), req.uri(), e);
            send_raw(req, e.status_code(), e.to_json().as_bytes())
        }
    }
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
        Method::Options => "OPTIONS",
        _ => "?",
    }
}

fn declared_length(req: &HttpRequest<'_, '_>) -> Option<usize> {
    req.header("Content-Length").and_then(|v| v.trim().parse().ok())
}

fn led_state(uri: &str, ctx: &HttpContext) -> Result<LedStateResponse, ApiError> {
    match parse_led_uri(uri)? {
        LedRoute::State(id) => Ok(LedStateResponse::new(id, lock(&ctx.leds).get(id))),
        LedRoute::Toggle(_) => Err(ApiError::Protocol("Invalid URI".to_string())),
    }
}

fn led_toggle(req: &mut HttpRequest<'_, '_>, ctx: &HttpContext) -> Result<LedStateResponse, ApiError> {
    let id = match parse_led_uri(req.uri())? {
        LedRoute::Toggle(id) => id,
        LedRoute::State(_) => return Err(ApiError::Protocol("Invalid URI".to_string())),
    };

    // Body is accepted but unused
    let declared = declared_length(req);
    if declared.unwrap_or(0) > 0 {
        read_body(
            &mut RequestBody(req),
            declared,
            ctx.http.max_body_size,
            ctx.update.max_consecutive_timeouts,
        )?;
    }

    let state = lock(&ctx.leds).toggle(id)?;
    Ok(LedStateResponse::new(id, state))
}

fn network_config(ctx: &HttpContext) -> Result<NetworkConfigBody, ApiError> {
    let stored = lock(&ctx.credentials).load()?;
    Ok(stored
        .as_ref()
        .map(NetworkConfigBody::from)
        .unwrap_or(NetworkConfigBody {
            ssid: String::new(),
            password: String::new(),
        }))
}

fn save_network_config(req: &mut HttpRequest<'_, '_>, ctx: &HttpContext) -> Result<NetworkConfigBody, ApiError> {
    let declared = declared_length(req);
    let body = read_body(
        &mut RequestBody(req),
        declared,
        ctx.http.max_body_size,
        ctx.update.max_consecutive_timeouts,
    )?;
    let credentials = parse_network_config(&body)?;

    lock(&ctx.credentials).save(&credentials)?;
    ctx.connectivity.set_credentials(credentials.clone());

    info!("📶 Network config updated for SSID: {}", credentials.ssid());
    Ok(NetworkConfigBody::from(&credentials))
}

fn ip_addr(ctx: &HttpContext) -> IpAddrResponse {
    IpAddrResponse {
        ip: ctx
            .connectivity
            .last_ip()
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
            .to_string(),
    }
}

fn firmware_update(req: &mut HttpRequest<'_, '_>, ctx: &HttpContext) -> Result<serde_json::Value, ApiError> {
    let declared = parse_content_length(req.header("Content-Length"))?;
    let framing = BodyFraming::from_content_type(req.header("Content-Type"));
    info!("📦 Firmware upload: {} bytes, {:?} framing", declared, framing);

    let committed = ctx
        .pipeline
        .run_update(declared, framing, &mut RequestBody(req))?;

    Ok(serde_json::json!({
        "status": "ok",
        "partition": committed.partition.label,
        "image_len": committed.image_len,
        "sha256": committed.sha256,
    }))
}

fn ota_status(ctx: &HttpContext) -> OtaStatusResponse {
    OtaStatusResponse::from(ctx.status.snapshot())
}

pub fn start_http_server(ctx: HttpContext) -> Result<EspHttpServer<'static>> {
    info!("🌐 Starting HTTP server");

    let config = Configuration {
        stack_size: ctx.http.stack_size,
        max_uri_handlers: ctx.http.max_uri_handlers,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&config)?;

    let c = ctx.clone();
    server.fn_handler("/api/leds/*", Method::Get, move |req| {
        let result = led_state(req.uri(), &c);
        respond(req, result)
    })?;

    let c = ctx.clone();
    server.fn_handler("/api/leds/*", Method::Post, move |mut req| {
        let result = led_toggle(&mut req, &c);
        respond(req, result)
    })?;

    let c = ctx.clone();
    server.fn_handler("/api/config/network", Method::Get, move |req| {
        respond(req, network_config(&c))
    })?;

    let c = ctx.clone();
    server.fn_handler("/api/config/network", Method::Post, move |mut req| {
        let result = save_network_config(&mut req, &c);
        respond(req, result)
    })?;

    let c = ctx.clone();
    server.fn_handler("/api/config/ip_addr", Method::Get, move |req| {
        send_json(req, 200, &ip_addr(&c))
    })?;

    let c = ctx.clone();
    server.fn_handler("/OTAupdate", Method::Post, move |mut req| {
        let result = firmware_update(&mut req, &c);
        if let Err(e) = &result {
            error!("❌ Firmware upload rejected: {}", e);
        }
        respond(req, result)
    })?;

    for method in [Method::Get, Method::Post] {
        let c = ctx.clone();
        server.fn_handler("/OTAstatus", method, move |req| {
            send_json(req, 200, &ota_status(&c))
        })?;
    }

    server.fn_handler("/api/*", Method::Options, |req| send_raw(req, 204, &[]))?;

    info!("✅ HTTP server started");
    Ok(server)
}
