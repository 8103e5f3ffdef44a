use crate::error::CoreError;
use async_trait::async_trait;
use smsgate_api::DeviceLookupResponse;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_secret: String,
    pub enabled: bool,
}

impl Debug for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("device_secret", &"<redacted>")
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl DeviceIdentity {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.device_id.trim().is_empty() && !self.device_secret.is_empty()
    }
}

impl From<DeviceLookupResponse> for DeviceIdentity {
    fn from(resp: DeviceLookupResponse) -> Self {
        Self {
            device_id: resp.device_id,
            device_secret: resp.device_secret,
            enabled: resp.enabled,
        }
    }
}

/// Resolves a registered phone number to a device identity. How the number is
/// normalized is up to the implementation.
#[async_trait]
pub trait DeviceLookup: Send + Sync {
    async fn lookup(&self, phone: &str) -> Result<Option<DeviceIdentity>, CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryDeviceLookup {
    entries: Arc<RwLock<HashMap<String, DeviceIdentity>>>,
}

impl InMemoryDeviceLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, phone: &str, identity: DeviceIdentity) {
        self.entries.write().await.insert(phone.to_string(), identity);
    }
}

#[async_trait]
impl DeviceLookup for InMemoryDeviceLookup {
    async fn lookup(&self, phone: &str) -> Result<Option<DeviceIdentity>, CoreError> {
        Ok(self.entries.read().await.get(phone).cloned())
    }
}

/// Holds the identity sync runs under. Sync is refused until a usable one is
/// present.
#[derive(Clone, Default)]
pub struct DeviceGate {
    identity: Arc<RwLock<Option<DeviceIdentity>>>,
}

impl DeviceGate {
    pub async fn current(&self) -> Result<DeviceIdentity, CoreError> {
        match self.identity.read().await.as_ref() {
            Some(identity) if identity.is_usable() => Ok(identity.clone()),
            _ => Err(CoreError::DeviceNotConfigured),
        }
    }

    pub async fn set(&self, identity: Option<DeviceIdentity>) {
        *self.identity.write().await = identity;
    }

    pub async fn is_configured(&self) -> bool {
        self.current().await.is_ok()
    }

    /// Ask `lookup` for the identity of `phone` and install the answer, which
    /// may clear a previously configured identity.
    pub async fn refresh(&self, lookup: &dyn DeviceLookup, phone: &str) -> Result<bool, CoreError> {
        let resolved = lookup.lookup(phone).await?;
        let usable = resolved.as_ref().map(|d| d.is_usable()).unwrap_or(false);
        self.set(resolved).await;
        Ok(usable)
    }
}
