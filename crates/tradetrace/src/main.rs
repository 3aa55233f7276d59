mod telemetry;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use tradetrace_core::config::Config;
use tradetrace_core::traceparent;
use tradetrace_store::Store;

use crate::telemetry::{init_cli_tracing, init_run_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "tradetrace")]
#[command(about = "Trade settlement service with end-to-end trace context")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run the HTTP API, queue consumer and span recorder")]
    Run {
        #[arg(long)]
        db_path: Option<PathBuf>,
        #[arg(long)]
        http_addr: Option<String>,
        #[arg(long)]
        queue_name: Option<String>,
    },
    #[command(about = "Decode a traceparent header and print it as JSON")]
    Decode {
        traceparent: String,
        #[arg(long)]
        tracestate: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            db_path,
            http_addr,
            queue_name,
        } => run_server(db_path, http_addr, queue_name).await,
        Commands::Decode {
            traceparent,
            tracestate,
        } => {
            init_cli_tracing();
            decode(&traceparent, tracestate.as_deref())
        }
    }
}

async fn run_server(
    db_path: Option<PathBuf>,
    http_addr: Option<String>,
    queue_name: Option<String>,
) -> anyhow::Result<()> {
    let mut cfg = Config::load().context("load config")?;
    if let Some(v) = db_path {
        cfg.db_path = v;
    }
    if let Some(v) = http_addr {
        cfg.http_addr = v;
    }
    if let Some(v) = queue_name {
        cfg.queue_name = v;
    }
    cfg.validate().context("validate config")?;

    let export = init_run_tracing(&cfg);
    let store = Store::open(&cfg.db_path)
        .with_context(|| format!("open store at {}", cfg.db_path.display()))?;

    eprintln!("tradetrace run");
    eprintln!("  db: {}", cfg.db_path.display());
    eprintln!("  http: {}", cfg.http_addr);
    eprintln!("  queue: {} ({})", cfg.queue_name, cfg.queue_connection);
    if let Some(endpoint) = &cfg.otlp_endpoint {
        eprintln!("  otlp: {endpoint}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let result = tradetrace_service::run_services(&cfg, store, export, shutdown_rx).await;
    shutdown_tracing();
    result.context("service failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn decode(raw: &str, tracestate: Option<&str>) -> anyhow::Result<()> {
    let ctx = traceparent::decode(raw, tracestate)
        .with_context(|| format!("invalid traceparent {raw:?}"))?;
    let rendered = json!({
        "traceparent": traceparent::encode(&ctx),
        "version": format!("{:02x}", ctx.version()),
        "traceId": ctx.trace_id().to_string(),
        "spanId": ctx.span_id().to_string(),
        "sampled": ctx.is_sampled(),
        "flags": format!("{:02x}", ctx.flags()),
        "traceState": ctx.trace_state().map(|s| s.as_str()),
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}
