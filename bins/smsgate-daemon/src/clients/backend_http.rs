use crate::config::{BackendConfig, HttpConfig, TlsConfig};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use smsgate_api::BackendIngestResponse;
use smsgate_core::backend::{BackendClient, BackendReceipt, OutboundMessage};
use smsgate_core::device::DeviceIdentity;
use smsgate_core::error::{BackendError, CoreError};
use std::time::Duration;
use tokio::time::sleep;

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const DEVICE_SECRET_HEADER: &str = "x-device-secret";

const MAX_ERROR_TEXT: usize = 200;

pub struct BackendHttpClient {
    url: String,
    http: reqwest::Client,
    retry_attempts: u32,
    retry_backoff: Duration,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<ErrorDetail>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

pub(crate) fn build_http(
    http: &HttpConfig,
    tls: Option<&TlsConfig>,
) -> Result<reqwest::Client, CoreError> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(http.timeout_secs))
        .connect_timeout(Duration::from_secs(http.connect_timeout_secs));
    if let Some(ca) = tls.and_then(|t| t.ca_cert.as_ref()) {
        let pem = std::fs::read(ca).map_err(|e| CoreError::Validation(format!("tls_ca: {e}")))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| CoreError::Validation(format!("tls_ca: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|e| CoreError::Validation(format!("http client: {e}")))
}

impl BackendHttpClient {
    pub fn new(cfg: &BackendConfig) -> Result<Self, CoreError> {
        let base = cfg.base_url.trim_end_matches('/');
        Ok(Self {
            url: format!("{}{}", base, cfg.ingest_path),
            http: build_http(&cfg.http, cfg.tls.as_ref())?,
            retry_attempts: cfg.http.retry_attempts,
            retry_backoff: Duration::from_millis(cfg.http.retry_backoff_ms),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_with_retry<F, Fut>(&self, mut op: F) -> Result<Response, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Response, reqwest::Error>>,
    {
        let mut remaining = self.retry_attempts;
        loop {
            match op().await {
                Ok(resp) => {
                    if should_retry_status(resp.status()) && remaining > 0 {
                        remaining = remaining.saturating_sub(1);
                        sleep(self.retry_backoff).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if remaining == 0 {
                        return Err(map_reqwest_error(err));
                    }
                    remaining = remaining.saturating_sub(1);
                    sleep(self.retry_backoff).await;
                }
            }
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn map_reqwest_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        return BackendError::transient("BACKEND_TIMEOUT", err.to_string());
    }
    let lower = err.to_string().to_lowercase();
    if lower.contains("tls") || lower.contains("certificate") {
        return BackendError::rejected("BACKEND_TLS_ERROR", err.to_string());
    }
    if err.is_connect() || err.is_request() {
        return BackendError::transient("BACKEND_UNAVAILABLE", err.to_string());
    }
    BackendError::transient("BACKEND_BAD_RESPONSE", err.to_string())
}

/// Classify a non-success response.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let detail_code = parsed
        .as_ref()
        .and_then(|p| p.error.as_ref())
        .and_then(|e| e.code.clone());
    let message = parsed
        .and_then(|p| p.error.map(|e| e.message).or(p.message))
        .unwrap_or_else(|| {
            let mut text = body.trim().to_string();
            if let Some((cut, _)) = text.char_indices().nth(MAX_ERROR_TEXT) {
                text.truncate(cut);
            }
            if text.is_empty() {
                format!("status {}", status.as_u16())
            } else {
                text
            }
        });
    let message = match detail_code {
        Some(code) => format!("{code}: {message}"),
        None => message,
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::rejected("BACKEND_UNAUTHORIZED", message)
        }
        s if should_retry_status(s) => BackendError::transient("BACKEND_UNAVAILABLE", message),
        s if s.is_client_error() => BackendError::rejected("BACKEND_REJECTED", message),
        _ => BackendError::transient("BACKEND_BAD_RESPONSE", message),
    }
}

#[async_trait]
impl BackendClient for BackendHttpClient {
    async fn send(
        &self,
        device: &DeviceIdentity,
        message: &OutboundMessage,
    ) -> Result<BackendReceipt, BackendError> {
        let payload = message.to_request(device);
        let resp = self
            .send_with_retry(|| {
                self.http
                    .post(self.url.as_str())
                    .header(DEVICE_ID_HEADER, device.device_id.as_str())
                    .header(DEVICE_SECRET_HEADER, device.device_secret.as_str())
                    .json(&payload)
                    .send()
            })
            .await?;
        let status = resp.status();
        if status == StatusCode::CONFLICT {
            // The backend already holds this fingerprint.
            return Ok(BackendReceipt {
                id: None,
                parse_status: Some("DUPLICATE".to_string()),
                model_used: None,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let bytes = resp.bytes().await.map_err(map_reqwest_error)?;
        if bytes.is_empty() {
            return Ok(BackendReceipt::default());
        }
        serde_json::from_slice::<BackendIngestResponse>(&bytes)
            .map(BackendReceipt::from)
            .map_err(|e| BackendError::transient("BACKEND_BAD_RESPONSE", e.to_string()))
    }
}
