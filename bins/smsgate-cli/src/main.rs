use serde::Serialize;
use smsgate_api::{AuditEntryDto, InboundSms, MessageDto};
use smsgate_core::backend::InMemoryBackend;
use smsgate_core::config::CoreConfig;
use smsgate_core::device::InMemoryDeviceLookup;
use smsgate_core::error::CoreError;
use smsgate_core::policy::SyncPolicy;
use smsgate_core::time::{now_ms, SystemClock};
use smsgate_core::Gateway;
use std::sync::Arc;

const USAGE: &str = "usage: smsgate-cli [--data-dir DIR] <command>
  ingest <sender> <body> [received_at_ms]
  stats
  failed [limit]
  requeue <fingerprint>
  audit [limit]";

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("core {0}")]
    Core(#[from] CoreError),
    #[error("json {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run(std::env::args().skip(1).collect()).await {
        eprintln!("error {err}");
        if matches!(err, CliError::Usage(_)) {
            eprintln!("{USAGE}");
        }
        std::process::exit(1);
    }
}

async fn run(mut args: Vec<String>) -> Result<(), CliError> {
    let mut config = CoreConfig {
        namespace: "cli".to_string(),
        sync_interval_ms: 0,
        ..CoreConfig::default()
    };
    if args.first().map(String::as_str) == Some("--data-dir") {
        if args.len() < 2 {
            return Err(CliError::Usage("--data-dir needs a value".to_string()));
        }
        config.storage_path = args[1].clone();
        args.drain(..2);
    }
    let command = args
        .first()
        .cloned()
        .ok_or_else(|| CliError::Usage("missing command".to_string()))?;
    // Offline view of the local store: no device, so nothing is ever sent.
    let gateway = Gateway::init(
        config,
        SyncPolicy::default(),
        Arc::new(InMemoryBackend::new()),
        Arc::new(InMemoryDeviceLookup::new()),
        Arc::new(SystemClock),
    )
    .await?;
    match command.as_str() {
        "ingest" => {
            if args.len() < 3 {
                return Err(CliError::Usage("ingest <sender> <body>".to_string()));
            }
            let received_at = match args.get(3) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|_| CliError::Usage(format!("bad received_at {raw}")))?,
                None => now_ms(),
            };
            let outcome = gateway
                .ingest(InboundSms {
                    sender: args[1].clone(),
                    body: args[2].clone(),
                    received_at,
                    sim_slot: None,
                })
                .await?;
            print_json(&outcome)
        }
        "stats" => print_json(&gateway.sync_stats().await?),
        "failed" => {
            let limit = limit_arg(args.get(1), 50)?;
            let records = gateway.permanently_failed(limit).await?;
            print_json(&records.iter().map(|r| r.to_dto()).collect::<Vec<MessageDto>>())
        }
        "requeue" => {
            let fingerprint = args
                .get(1)
                .ok_or_else(|| CliError::Usage("requeue <fingerprint>".to_string()))?;
            gateway.requeue(fingerprint).await?;
            let record = gateway.message(fingerprint).await?;
            print_json(&record.map(|r| r.to_dto()))
        }
        "audit" => {
            let limit = limit_arg(args.get(1), 20)?;
            let entries = gateway.audit_log(limit).await?;
            print_json(&entries.iter().map(|e| e.to_dto()).collect::<Vec<AuditEntryDto>>())
        }
        other => Err(CliError::Usage(format!("unknown command {other}"))),
    }
}

fn limit_arg(raw: Option<&String>, default: usize) -> Result<usize, CliError> {
    match raw {
        Some(value) => value
            .parse()
            .map_err(|_| CliError::Usage(format!("bad limit {value}"))),
        None => Ok(default),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
