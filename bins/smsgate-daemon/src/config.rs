use serde::Deserialize;
use smsgate_core::device::DeviceIdentity;
use smsgate_core::policy::SyncPolicy;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub policy: SyncPolicy,
    pub backend: BackendConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Either a phone number resolved through the lookup service, or a fixed
/// identity. A fixed identity wins when both are given.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct DeviceConfig {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_secret: Option<String>,
}

impl DeviceConfig {
    pub fn static_identity(&self) -> Option<DeviceIdentity> {
        match (self.device_id.as_ref(), self.device_secret.as_ref()) {
            (Some(id), Some(secret)) => Some(DeviceIdentity {
                device_id: id.clone(),
                device_secret: secret.clone(),
                enabled: true,
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default)]
    pub mode: EndpointMode,
    #[serde(default = "default_ingest_path")]
    pub ingest_path: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LookupConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Falls back to the backend base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_lookup_path")]
    pub path: String,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            base_url: None,
            path: default_lookup_path(),
            refresh_secs: default_refresh_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_attempts: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub allow_remote: bool,
    #[serde(default = "default_audit_limit")]
    pub default_audit_limit: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            allow_remote: false,
            default_audit_limit: default_audit_limit(),
        }
    }
}

impl ControlConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("control.bind_addr".to_string()))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    #[default]
    Http,
    Tls,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_ingest_path() -> String {
    "/api/sms/ingest".to_string()
}

fn default_lookup_path() -> String {
    "/api/devices/lookup".to_string()
}

fn default_refresh_secs() -> u64 {
    300
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_bind_addr() -> String {
    "127.0.0.1:9180".to_string()
}

fn default_audit_limit() -> usize {
    100
}

fn default_interval_ms() -> u64 {
    15_000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io {0}")]
    Io(String),
    #[error("parse {0}")]
    Parse(String),
    #[error("invalid {0}")]
    Invalid(String),
}

pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn check_url(url: &str, mode: &EndpointMode, field: &str) -> Result<(), ConfigError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::Invalid(field.to_string()));
    }
    if *mode == EndpointMode::Tls && !url.starts_with("https://") {
        return Err(ConfigError::Invalid(format!("{field} requires https")));
    }
    Ok(())
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url(&self.backend.base_url, &self.backend.mode, "backend.base_url")?;
        if !self.backend.ingest_path.starts_with('/') {
            return Err(ConfigError::Invalid("backend.ingest_path".to_string()));
        }
        if let Some(url) = self.lookup.base_url.as_deref() {
            check_url(url, &self.backend.mode, "lookup.base_url")?;
        }
        if self.device.device_id.is_some() != self.device.device_secret.is_some() {
            return Err(ConfigError::Invalid(
                "device.device_id and device.device_secret go together".to_string(),
            ));
        }
        let addr = self.control.socket_addr()?;
        if !addr.ip().is_loopback() && !self.control.allow_remote {
            return Err(ConfigError::Invalid(
                "control.bind_addr is not loopback; set control.allow_remote".to_string(),
            ));
        }
        let policy = &self.policy;
        if policy.batch_size == 0 || policy.max_in_flight == 0 {
            return Err(ConfigError::Invalid("policy batch_size/max_in_flight".to_string()));
        }
        if policy.backoff_initial_ms > policy.backoff_max_ms {
            return Err(ConfigError::Invalid("policy.backoff_initial_ms".to_string()));
        }
        if policy.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("policy.send_timeout_ms".to_string()));
        }
        if policy.stale_syncing_ms < policy.send_timeout_ms.saturating_mul(2) {
            return Err(ConfigError::Invalid(
                "policy.stale_syncing_ms must be at least twice send_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}
