use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Directory holding the SQLite database. Empty means in-memory.
    pub storage_path: String,
    pub namespace: String,
    /// Phone number of this gateway, used to resolve the device identity.
    #[serde(default)]
    pub device_phone: Option<String>,
    /// Period of the background drain worker; 0 disables it.
    pub sync_interval_ms: u64,
}

impl CoreConfig {
    pub fn in_memory() -> Self {
        Self {
            storage_path: String::new(),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.storage_path.trim().is_empty()
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_path: ".smsgate".to_string(),
            namespace: "default".to_string(),
            device_phone: None,
            sync_interval_ms: 15_000,
        }
    }
}
