use crate::device::DeviceIdentity;
use crate::error::BackendError;
use crate::record::MessageRecord;
use async_trait::async_trait;
use smsgate_api::{BackendIngestRequest, BackendIngestResponse};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One message as handed to the ingestion backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub fingerprint: String,
    pub sender: String,
    pub body: String,
    pub received_at: u64,
}

impl OutboundMessage {
    pub fn to_request(&self, device: &DeviceIdentity) -> BackendIngestRequest {
        BackendIngestRequest {
            device_id: device.device_id.clone(),
            fingerprint: self.fingerprint.clone(),
            sender: self.sender.clone(),
            body: self.body.clone(),
            received_at: self.received_at,
        }
    }
}

impl From<&MessageRecord> for OutboundMessage {
    fn from(record: &MessageRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            sender: record.sender.clone(),
            body: record.body.clone(),
            received_at: record.received_at,
        }
    }
}

/// Acknowledgement from the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendReceipt {
    pub id: Option<String>,
    pub parse_status: Option<String>,
    pub model_used: Option<String>,
}

impl From<BackendIngestResponse> for BackendReceipt {
    fn from(resp: BackendIngestResponse) -> Self {
        Self {
            id: resp.id,
            parse_status: resp.parse_status,
            model_used: resp.model_used,
        }
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn send(
        &self,
        device: &DeviceIdentity,
        message: &OutboundMessage,
    ) -> Result<BackendReceipt, BackendError>;
}

/// What the in-memory backend does with the next send.
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    Accept,
    Fail(BackendError),
    Hang,
}

/// Backend double that records every request and replays scripted outcomes,
/// accepting once the script runs out.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    received: Arc<Mutex<Vec<BackendIngestRequest>>>,
    script: Arc<Mutex<VecDeque<ScriptedReply>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        let script = (0..times)
            .map(|_| {
                ScriptedReply::Fail(BackendError::transient("BACKEND_UNAVAILABLE", "scripted"))
            })
            .collect();
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub async fn push_reply(&self, reply: ScriptedReply) {
        self.script.lock().await.push_back(reply);
    }

    pub async fn received(&self) -> Vec<BackendIngestRequest> {
        self.received.lock().await.clone()
    }

    pub async fn received_len(&self) -> usize {
        self.received.lock().await.len()
    }
}

#[async_trait]
impl BackendClient for InMemoryBackend {
    async fn send(
        &self,
        device: &DeviceIdentity,
        message: &OutboundMessage,
    ) -> Result<BackendReceipt, BackendError> {
        let request = message.to_request(device);
        let reply = self.script.lock().await.pop_front();
        self.received.lock().await.push(request);
        match reply {
            None | Some(ScriptedReply::Accept) => Ok(BackendReceipt {
                id: Some(format!(
                    "txn-{}",
                    message.fingerprint.get(..8).unwrap_or(&message.fingerprint)
                )),
                parse_status: Some("PARSED".to_string()),
                model_used: Some("in-memory".to_string()),
            }),
            Some(ScriptedReply::Fail(err)) => Err(err),
            Some(ScriptedReply::Hang) => std::future::pending().await,
        }
    }
}
