// HTTP API Module
// Request parsing, response bodies and error mapping for the HTTP gateway
// Kept free of ESP-IDF types so every rule here is unit tested

use serde::{Deserialize, Serialize};

use crate::credentials::{Credentials, CredentialsError, StoreError};
use crate::led_bank::{LedError, LedId, LedState};
use crate::system_state::DeviceStatus;
use crate::update_pipeline::{BodySource, RecvError, UpdateError};

pub const LED_URI_PREFIX: &str = "/api/leds/";

pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type, Authorization"),
];

/// Handler failure classified by who is at fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    Protocol(String),
    Conflict(String),
    Resource(String),
    Hardware(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Protocol(_) => 400,
            ApiError::Conflict(_) => 409,
            ApiError::Resource(_) | ApiError::Hardware(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::Protocol(msg)
            | ApiError::Conflict(msg)
            | ApiError::Resource(msg)
            | ApiError::Hardware(msg) => msg,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "error": self.message() }).to_string()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status_code(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl From<LedError> for ApiError {
    fn from(e: LedError) -> Self {
        match e {
            LedError::InvalidId(_) => ApiError::Protocol("Invalid LED ID".to_string()),
            LedError::Gpio(_) => ApiError::Hardware(e.to_string()),
        }
    }
}

impl From<CredentialsError> for ApiError {
    fn from(e: CredentialsError) -> Self {
        ApiError::Protocol(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Hardware(e.to_string())
    }
}

impl From<UpdateError> for ApiError {
    fn from(e: UpdateError) -> Self {
        match e {
            UpdateError::Conflict | UpdateError::RestartPending => ApiError::Conflict(e.to_string()),
            UpdateError::InvalidLength
            | UpdateError::Framing
            | UpdateError::Incomplete { .. }
            | UpdateError::ConnectionClosed { .. } => ApiError::Protocol(e.to_string()),
            UpdateError::Flash(_)
            | UpdateError::Receive(_)
            | UpdateError::TimedOut(_)
            | UpdateError::NotReceiving(_) => ApiError::Hardware(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedRoute {
    State(LedId),
    Toggle(LedId),
}

/// Parse `/api/leds/{id}` or `/api/leds/{id}/toggle`, ignoring any query string
pub fn parse_led_uri(uri: &str) -> Result<LedRoute, ApiError> {
    let path = uri.split('?').next().unwrap_or(uri);
    let invalid = || ApiError::Protocol("Invalid URI".to_string());

    let rest = path.strip_prefix(LED_URI_PREFIX).ok_or_else(invalid)?;
    let (raw_id, action) = match rest.split_once('/') {
        Some((id, action)) => (id, Some(action)),
        None => (rest, None),
    };

    let id: i64 = raw_id.parse().map_err(|_| invalid())?;
    let id = LedId::new(id)?;

    match action {
        None | Some("") => Ok(LedRoute::State(id)),
        Some("toggle") => Ok(LedRoute::Toggle(id)),
        Some(_) => Err(invalid()),
    }
}

pub fn parse_content_length(header: Option<&str>) -> Result<u32, ApiError> {
    let raw = header.ok_or_else(|| ApiError::Protocol("Content-Length required".to_string()))?;
    match raw.trim().parse::<u32>() {
        Ok(0) | Err(_) => Err(ApiError::Protocol(format!("Invalid Content-Length: {}", raw))),
        Ok(len) => Ok(len),
    }
}

/// Buffer a small request body. `declared` is the Content-Length when
/// present; without one the body is read until the peer stops sending.
pub fn read_body<S: BodySource>(
    source: &mut S,
    declared: Option<usize>,
    limit: usize,
    max_timeouts: u32,
) -> Result<Vec<u8>, ApiError> {
    let capacity = match declared {
        Some(len) if len > limit => {
            return Err(ApiError::Protocol(format!(
                "Request body too large: {} bytes (max {})",
                len, limit
            )))
        }
        Some(len) => len,
        None => limit,
    };

    let mut body = Vec::new();
    body.try_reserve_exact(capacity)
        .map_err(|_| ApiError::Resource("Out of memory".to_string()))?;
    body.resize(capacity, 0);

    let mut filled = 0;
    let mut timeouts = 0;
    while filled < capacity {
        match source.recv(&mut body[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                timeouts = 0;
            }
            Err(RecvError::Timeout) => {
                timeouts += 1;
                if timeouts >= max_timeouts {
                    return Err(ApiError::Protocol("Timed out reading request body".to_string()));
                }
            }
            Err(RecvError::Io(msg)) => return Err(ApiError::Hardware(msg)),
        }
    }

    if declared.is_some_and(|len| filled < len) {
        return Err(ApiError::Protocol("Request body truncated".to_string()));
    }

    body.truncate(filled);
    Ok(body)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfigBody {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl From<&Credentials> for NetworkConfigBody {
    fn from(credentials: &Credentials) -> Self {
        Self {
            ssid: credentials.ssid().to_string(),
            password: credentials.password().to_string(),
        }
    }
}

pub fn parse_network_config(body: &[u8]) -> Result<Credentials, ApiError> {
    let parsed: NetworkConfigBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::Protocol(format!("Invalid JSON: {}", e)))?;
    Ok(Credentials::new(parsed.ssid, parsed.password)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedStateResponse {
    pub id: u8,
    pub state: &'static str,
}

impl LedStateResponse {
    pub fn new(id: LedId, state: LedState) -> Self {
        Self {
            id: id.get(),
            state: state.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpAddrResponse {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtaStatusResponse {
    pub ota_update_status: i8,
    pub compile_time: &'static str,
    pub compile_date: &'static str,
}

impl From<DeviceStatus> for OtaStatusResponse {
    fn from(status: DeviceStatus) -> Self {
        Self {
            ota_update_status: status.last_update_result.code(),
            compile_time: status.build.compile_time,
            compile_date: status.build.compile_date,
        }
    }
}
