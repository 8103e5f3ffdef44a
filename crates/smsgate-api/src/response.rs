use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const API_VERSION: u16 = 1;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiMeta {
    pub api_version: u16,
    pub request_id: Uuid,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse<T> {
    pub meta: ApiMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, timestamp_ms: u64) -> Self {
        Self {
            meta: ApiMeta::new(timestamp_ms),
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: &str, message: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            meta: ApiMeta::new(timestamp_ms),
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.into(),
                details: None,
            }),
        }
    }
}

impl ApiMeta {
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            api_version: API_VERSION,
            request_id: Uuid::new_v4(),
            timestamp_ms,
        }
    }
}
