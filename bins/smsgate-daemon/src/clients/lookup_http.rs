use super::backend_http::build_http;
use crate::config::{BackendConfig, LookupConfig};
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use smsgate_api::DeviceLookupResponse;
use smsgate_core::device::{DeviceIdentity, DeviceLookup};
use smsgate_core::error::CoreError;

const COUNTRY_PREFIX: &str = "250";

/// Spellings of `phone` to try, in order: as given, without a leading `+`,
/// then with the country prefix swapped for a trunk `0`.
pub fn phone_candidates(phone: &str) -> Vec<String> {
    let raw = phone.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let mut candidates = vec![raw.to_string()];
    let bare = raw.strip_prefix('+').unwrap_or(raw);
    if bare != raw {
        candidates.push(bare.to_string());
    }
    if let Some(national) = bare.strip_prefix(COUNTRY_PREFIX) {
        if !national.is_empty() {
            candidates.push(format!("0{national}"));
        }
    }
    candidates.dedup();
    candidates
}

pub struct LookupHttpClient {
    url: String,
    http: reqwest::Client,
}

impl LookupHttpClient {
    pub fn new(lookup: &LookupConfig, backend: &BackendConfig) -> Result<Self, CoreError> {
        let base = lookup
            .base_url
            .as_deref()
            .unwrap_or(&backend.base_url)
            .trim_end_matches('/');
        Ok(Self {
            url: format!("{}{}", base, lookup.path),
            http: build_http(&backend.http, backend.tls.as_ref())?,
        })
    }

    async fn lookup_one(&self, candidate: &str) -> Result<Option<DeviceIdentity>, CoreError> {
        let resp = self
            .http
            .get(self.url.as_str())
            .query(&[("phone", candidate)])
            .send()
            .await
            .map_err(|e| CoreError::Lookup(e.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let parsed = resp
                    .json::<DeviceLookupResponse>()
                    .await
                    .map_err(|e| CoreError::Lookup(format!("decode: {e}")))?;
                Ok(Some(DeviceIdentity::from(parsed)))
            }
            s => Err(CoreError::Lookup(format!("status {}", s.as_u16()))),
        }
    }
}

#[async_trait]
impl DeviceLookup for LookupHttpClient {
    async fn lookup(&self, phone: &str) -> Result<Option<DeviceIdentity>, CoreError> {
        for candidate in phone_candidates(phone) {
            if let Some(identity) = self.lookup_one(&candidate).await? {
                debug!("lookup: matched device {} via {candidate}", identity.device_id);
                return Ok(Some(identity));
            }
        }
        Ok(None)
    }
}
