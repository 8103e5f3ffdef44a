mod clients;
mod config;

use bytes::Bytes;
use clients::backend_http::BackendHttpClient;
use clients::lookup_http::LookupHttpClient;
use config::{ConfigError, GatewayConfig};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn, LevelFilter};
use serde::Serialize;
use smsgate_api::{ApiResponse, AuditEntryDto, InboundSms, IngestOutcome, MessageDto};
use smsgate_core::backend::BackendClient;
use smsgate_core::config::CoreConfig;
use smsgate_core::device::{DeviceLookup, InMemoryDeviceLookup};
use smsgate_core::error::CoreError;
use smsgate_core::time::{now_ms, SystemClock};
use smsgate_core::Gateway;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const MAX_LIST_LIMIT: usize = 1_000;
const BODY_OVERHEAD_BYTES: usize = 4 * 1024;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config {0}")]
    Config(#[from] ConfigError),
    #[error("core {0}")]
    Core(#[from] CoreError),
    #[error("io {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct DaemonState {
    gateway: Gateway,
    started_at: u64,
    audit_limit: usize,
    max_request_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("smsgate.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    cfg.validate()?;
    init_logging(&cfg);
    let state = build_state(&cfg).await?;
    let refresher = start_device_refresher(&cfg, state.gateway.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let gateway = state.gateway.clone();
    let (addr, server) =
        start_control_server(state, cfg.control.socket_addr()?, shutdown_rx).await?;
    info!("smsgate: control api on {addr}");
    if let Err(err) = signal::ctrl_c().await {
        error!("smsgate: signal handler failed: {err}");
    }
    info!("smsgate: shutting down");
    if let Some(handle) = refresher {
        handle.abort();
    }
    gateway.stop_sync_worker().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

fn init_logging(cfg: &GatewayConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}

async fn build_state(cfg: &GatewayConfig) -> Result<DaemonState, DaemonError> {
    let backend: Arc<dyn BackendClient> = Arc::new(BackendHttpClient::new(&cfg.backend)?);
    let lookup: Arc<dyn DeviceLookup> = if cfg.lookup.enabled {
        Arc::new(LookupHttpClient::new(&cfg.lookup, &cfg.backend)?)
    } else {
        Arc::new(InMemoryDeviceLookup::new())
    };
    build_state_with(cfg, backend, lookup).await
}

async fn build_state_with(
    cfg: &GatewayConfig,
    backend: Arc<dyn BackendClient>,
    lookup: Arc<dyn DeviceLookup>,
) -> Result<DaemonState, DaemonError> {
    let fixed = cfg.device.static_identity();
    let core_cfg = CoreConfig {
        storage_path: cfg.data_dir.to_string_lossy().to_string(),
        namespace: "daemon".to_string(),
        device_phone: if fixed.is_some() {
            None
        } else {
            cfg.device.phone.clone()
        },
        sync_interval_ms: cfg.sync.interval_ms,
    };
    let gateway = Gateway::init(
        core_cfg,
        cfg.policy.clone(),
        backend,
        lookup,
        Arc::new(SystemClock),
    )
    .await?;
    if fixed.is_some() {
        gateway.configure_device(fixed).await;
    }
    Ok(DaemonState {
        gateway,
        started_at: now_ms(),
        audit_limit: cfg.control.default_audit_limit,
        max_request_bytes: cfg.policy.max_body_bytes + BODY_OVERHEAD_BYTES,
    })
}

/// Periodically re-resolve the device so a disabled or re-provisioned
/// identity is picked up without a restart.
fn start_device_refresher(cfg: &GatewayConfig, gateway: Gateway) -> Option<JoinHandle<()>> {
    if cfg.device.static_identity().is_some()
        || !cfg.lookup.enabled
        || cfg.lookup.refresh_secs == 0
    {
        return None;
    }
    let phone = cfg.device.phone.clone()?;
    let every = Duration::from_secs(cfg.lookup.refresh_secs);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match gateway.resolve_device(&phone).await {
                Ok(true) => debug!("device: identity refreshed"),
                Ok(false) => warn!("device: no usable identity for configured phone"),
                Err(err) => warn!("device: lookup failed, keeping current identity: {err}"),
            }
        }
    }))
}

async fn start_control_server(
    state: DaemonState,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, JoinHandle<()>), DaemonError> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let state_clone = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = state_clone.clone();
                                    async move { handle_request(state, req).await }
                                });
                                let conn = http1::Builder::new().serve_connection(io, service);
                                if let Err(err) = conn.await {
                                    debug!("control: connection closed with error: {err}");
                                }
                            });
                        }
                        Err(err) => {
                            error!("control: accept failed: {err}");
                            break;
                        }
                    }
                }
            }
        }
    });
    Ok((local, handle))
}

async fn handle_request(
    state: DaemonState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let gateway = &state.gateway;
    let response = if method == "POST" && requeue_target(&path).is_some() {
        let fingerprint = requeue_target(&path).unwrap_or_default();
        let result = match gateway.requeue(fingerprint).await {
            Ok(()) => gateway.message(fingerprint).await,
            Err(err) => Err(err),
        };
        respond(result.map(|record| record.map(|r| r.to_dto())))
    } else {
        match (method.as_str(), path.as_str()) {
            ("GET", "/health") => ok(
                StatusCode::OK,
                serde_json::json!({
                    "status": "ok",
                    "uptime_ms": now_ms().saturating_sub(state.started_at),
                    "device_configured": gateway.device_configured().await,
                }),
            ),
            ("GET", "/stats") => respond(gateway.sync_stats().await),
            ("GET", "/counters") => ok(StatusCode::OK, gateway.session_counters()),
            ("POST", "/counters/reset") => respond(
                gateway
                    .reset_counters()
                    .await
                    .map(|_| gateway.session_counters()),
            ),
            ("POST", "/ingest") => ingest(&state, req).await,
            ("POST", "/sync") => respond(gateway.drain_once().await),
            ("GET", "/failed") => {
                let limit = limit_param(query.as_deref(), MAX_LIST_LIMIT);
                respond(gateway.permanently_failed(limit).await.map(|records| {
                    records.iter().map(|r| r.to_dto()).collect::<Vec<MessageDto>>()
                }))
            }
            ("GET", "/audit") => {
                let limit = limit_param(query.as_deref(), state.audit_limit);
                respond(gateway.audit_log(limit).await.map(|entries| {
                    entries.iter().map(|e| e.to_dto()).collect::<Vec<AuditEntryDto>>()
                }))
            }
            _ => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "no such route"),
        }
    };
    debug!("control: {method} {path} -> {}", response.status().as_u16());
    Ok(response)
}

async fn ingest(state: &DaemonState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), state.max_request_bytes)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.is::<LengthLimitError>() => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "BODY_TOO_LARGE",
                err.to_string(),
            )
        }
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "BAD_BODY", err.to_string()),
    };
    let sms: InboundSms = match serde_json::from_slice(&body) {
        Ok(sms) => sms,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", err.to_string())
        }
    };
    match state.gateway.ingest(sms).await {
        Ok(outcome @ IngestOutcome::Inserted { .. }) => ok(StatusCode::CREATED, outcome),
        Ok(outcome) => ok(StatusCode::OK, outcome),
        Err(err) => core_error_response(&err),
    }
}

fn requeue_target(path: &str) -> Option<&str> {
    path.strip_prefix("/failed/")?
        .strip_suffix("/requeue")
        .filter(|fp| !fp.is_empty() && !fp.contains('/'))
}

fn limit_param(query: Option<&str>, default: usize) -> usize {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "limit")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(default)
        .min(MAX_LIST_LIMIT)
}

fn json_response<T: Serialize>(status: StatusCode, body: &ApiResponse<T>) -> Response<Full<Bytes>> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("control: encode failed: {err}");
            return Response::new(Full::new(Bytes::new()));
        }
    };
    let mut resp = Response::new(Full::from(Bytes::from(bytes)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response<Full<Bytes>> {
    json_response(status, &ApiResponse::ok(data, now_ms()))
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    json_response(status, &ApiResponse::<()>::err(code, message, now_ms()))
}

fn core_error_response(err: &CoreError) -> Response<Full<Bytes>> {
    let (status, code) = match err {
        CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        CoreError::DeviceNotConfigured => (StatusCode::CONFLICT, "DEVICE_NOT_CONFIGURED"),
        CoreError::IllegalTransition { .. } => (StatusCode::CONFLICT, "ILLEGAL_TRANSITION"),
        CoreError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        CoreError::Lookup(_) => (StatusCode::BAD_GATEWAY, "LOOKUP_FAILED"),
        CoreError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    };
    if status.is_server_error() {
        error!("control: {err}");
    }
    error_response(status, code, err.to_string())
}

fn respond<T: Serialize>(result: Result<T, CoreError>) -> Response<Full<Bytes>> {
    match result {
        Ok(data) => ok(StatusCode::OK, data),
        Err(err) => core_error_response(&err),
    }
}

#[cfg(test)]
mod tests;
