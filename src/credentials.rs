// WiFi credentials and their persisted fixed-layout record
// The record mirrors the on-flash struct { char ssid[33]; char password[65]; }

use log::{error, info, warn};

pub const SSID_MAX_LEN: usize = 32;
pub const PASSWORD_MAX_LEN: usize = 64;

const SSID_FIELD_LEN: usize = SSID_MAX_LEN + 1; // NUL terminated
const PASSWORD_FIELD_LEN: usize = PASSWORD_MAX_LEN + 1;

/// Size of the persisted credential blob
pub const RECORD_LEN: usize = SSID_FIELD_LEN + PASSWORD_FIELD_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    EmptySsid,
    SsidTooLong(usize),
    PasswordTooLong(usize),
    EmbeddedNul,
    CorruptRecord(&'static str),
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsError::EmptySsid => write!(f, "SSID cannot be empty"),
            CredentialsError::SsidTooLong(len) => {
                write!(f, "SSID too long: {} bytes (max {})", len, SSID_MAX_LEN)
            }
            CredentialsError::PasswordTooLong(len) => {
                write!(f, "Password too long: {} bytes (max {})", len, PASSWORD_MAX_LEN)
            }
            CredentialsError::EmbeddedNul => write!(f, "Credentials contain a NUL byte"),
            CredentialsError::CorruptRecord(why) => write!(f, "Corrupt credential record: {}", why),
        }
    }
}

impl std::error::Error for CredentialsError {}

/// Station credentials with the length bounds of the persisted record
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: String,
    password: String,
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, CredentialsError> {
        let ssid = ssid.into();
        let password = password.into();

        if ssid.is_empty() {
            return Err(CredentialsError::EmptySsid);
        }
        if ssid.len() > SSID_MAX_LEN {
            return Err(CredentialsError::SsidTooLong(ssid.len()));
        }
        if password.len() > PASSWORD_MAX_LEN {
            return Err(CredentialsError::PasswordTooLong(password.len()));
        }
        if ssid.contains('\0') || password.contains('\0') {
            return Err(CredentialsError::EmbeddedNul);
        }

        Ok(Self { ssid, password })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Open networks are stored with an empty password
    pub fn is_open_network(&self) -> bool {
        self.password.is_empty()
    }

    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[..self.ssid.len()].copy_from_slice(self.ssid.as_bytes());
        record[SSID_FIELD_LEN..SSID_FIELD_LEN + self.password.len()]
            .copy_from_slice(self.password.as_bytes());
        record
    }

    pub fn from_record(record: &[u8]) -> Result<Self, CredentialsError> {
        if record.len() != RECORD_LEN {
            return Err(CredentialsError::CorruptRecord("unexpected record size"));
        }

        let (ssid_field, password_field) = record.split_at(SSID_FIELD_LEN);
        let ssid = decode_field(ssid_field)?;
        let password = decode_field(password_field)?;

        Self::new(ssid, password)
    }
}

// Keeps passwords out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &format_args!("[{} chars]", self.password.len()))
            .finish()
    }
}

fn decode_field(field: &[u8]) -> Result<String, CredentialsError> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(CredentialsError::CorruptRecord("field is not NUL terminated"))?;

    String::from_utf8(field[..end].to_vec())
        .map_err(|_| CredentialsError::CorruptRecord("field is not valid UTF-8"))
}

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Corrupt(CredentialsError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "Storage backend error: {}", msg),
            StoreError::Corrupt(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Namespaced key-value blob persistence
pub trait BlobStore: Send {
    /// Returns `None` when nothing is stored under `key`
    fn load_blob<'b>(&mut self, key: &str, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, StoreError>;

    fn save_blob(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError>;
}

/// Credential persistence on top of a blob store
pub struct CredentialStore<B: BlobStore> {
    store: B,
    key: &'static str,
}

impl<B: BlobStore> CredentialStore<B> {
    pub fn new(store: B, key: &'static str) -> Self {
        Self { store, key }
    }

    pub fn save(&mut self, credentials: &Credentials) -> Result<(), StoreError> {
        info!("💾 Storing WiFi credentials for SSID: {}", credentials.ssid());

        self.store.save_blob(self.key, &credentials.to_record())?;

        info!("✅ WiFi credentials stored");
        Ok(())
    }

    /// `Ok(None)` is the not-found outcome; a stored but unreadable record is an error
    pub fn load(&mut self) -> Result<Option<Credentials>, StoreError> {
        let mut buf = [0u8; RECORD_LEN];

        let record = match self.store.load_blob(self.key, &mut buf)? {
            Some(record) => record,
            None => {
                warn!("No WiFi credentials stored under '{}'", self.key);
                return Ok(None);
            }
        };

        match Credentials::from_record(record) {
            Ok(credentials) => {
                info!("Loaded WiFi credentials for SSID: {}", credentials.ssid());
                Ok(Some(credentials))
            }
            Err(e) => {
                error!("❌ Stored credential record is unusable: {}", e);
                Err(StoreError::Corrupt(e))
            }
        }
    }
}
