use super::*;
use crate::config::{
    BackendConfig, ControlConfig, DeviceConfig, EndpointMode, HttpConfig, LoggingConfig,
    LookupConfig, SyncConfig,
};
use http_body_util::BodyExt;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use serde::de::DeserializeOwned;
use smsgate_core::backend::InMemoryBackend;
use smsgate_core::device::DeviceIdentity;
use smsgate_core::policy::SyncPolicy;
use tokio::io::duplex;


pub(super) fn test_config() -> GatewayConfig {
    GatewayConfig {
        data_dir: PathBuf::new(),
        device: DeviceConfig::default(),
        policy: SyncPolicy {
            backoff_jitter: false,
            max_retries: 0,
            ..SyncPolicy::default()
        },
        backend: BackendConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            mode: EndpointMode::Http,
            ingest_path: "/api/sms/ingest".to_string(),
            tls: None,
            http: HttpConfig::default(),
        },
        lookup: LookupConfig {
            enabled: false,
            ..LookupConfig::default()
        },
        control: ControlConfig::default(),
        sync: SyncConfig { interval_ms: 0 },
        logging: LoggingConfig {
            level: "error".to_string(),
        },
    }
}

pub(super) fn test_device() -> DeviceIdentity {
    DeviceIdentity {
        device_id: "dev-1".to_string(),
        device_secret: "secret".to_string(),
        enabled: true,
    }
}

pub(super) async fn build_test_state(cfg: &GatewayConfig, backend: InMemoryBackend) -> DaemonState {
    init_logging(cfg);
    build_state_with(cfg, Arc::new(backend), Arc::new(InMemoryDeviceLookup::new()))
        .await
        .unwrap()
}

pub(super) fn build_request(
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost");
    if body.is_some() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    let bytes = body
        .map(|value| value.to_string().into_bytes())
        .unwrap_or_default();
    builder.body(Full::from(Bytes::from(bytes))).unwrap()
}

pub(super) async fn dispatch_request(
    state: DaemonState,
    req: Request<Full<Bytes>>,
) -> Response<Incoming> {
    let (client, server) = duplex(64 * 1024);
    let server_state = state.clone();
    let service = service_fn(move |incoming: Request<Incoming>| {
        let inner = server_state.clone();
        async move { handle_request(inner, incoming).await }
    });
    let server_task = tokio::spawn(async move {
        let io = TokioIo::new(server);
        let _ = server_http1::Builder::new()
            .serve_connection(io, service)
            .await;
    });
    let io = TokioIo::new(client);
    let (mut sender, connection) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let response = sender.send_request(req).await.unwrap();
    drop(sender);
    let _ = server_task.await;
    response
}

pub(super) async fn decode_response<T: DeserializeOwned>(
    resp: Response<Incoming>,
) -> ApiResponse<T> {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn control_server_starts_and_stops() {
    let cfg = test_config();
    let state = build_test_state(&cfg, InMemoryBackend::new()).await;
    let (tx, rx) = oneshot::channel();
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let (bound, handle) = match start_control_server(state, addr, rx).await {
        Ok(started) => started,
        // Sandboxes without loopback networking.
        Err(DaemonError::Io(_)) => return,
        Err(err) => panic!("{err}"),
    };
    assert!(bound.ip().is_loopback());
    assert_ne!(bound.port(), 0);
    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn static_identity_enables_sync() {
    let cfg = GatewayConfig {
        device: DeviceConfig {
            phone: None,
            device_id: Some("dev-1".to_string()),
            device_secret: Some("secret".to_string()),
        },
        ..test_config()
    };
    let state = build_test_state(&cfg, InMemoryBackend::new()).await;
    assert!(state.gateway.device_configured().await);
    assert!(start_device_refresher(&cfg, state.gateway.clone()).is_none());
}
