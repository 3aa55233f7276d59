use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TradeTraceError};
use crate::time::parse_duration_str;

pub const EMULATED_QUEUE: &str = "emulated";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub http_addr: String,
    pub service_name: String,
    pub environment: String,
    pub otlp_endpoint: Option<String>,
    pub queue_connection: String,
    pub queue_name: String,
    pub max_delivery_count: u32,
    pub log_format: LogFormat,
    pub span_retention_ttl: Duration,
    pub span_batch_size: usize,
    pub span_flush_ms: u64,
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_root = env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(home).join(".local/share"));

        Self {
            db_path: data_root.join("tradetrace/tradetrace.duckdb"),
            http_addr: "127.0.0.1:8080".to_string(),
            service_name: "tradetrace".to_string(),
            environment: "development".to_string(),
            otlp_endpoint: None,
            queue_connection: EMULATED_QUEUE.to_string(),
            queue_name: "trades".to_string(),
            max_delivery_count: 10,
            log_format: LogFormat::Compact,
            span_retention_ttl: Duration::from_secs(60 * 60 * 24),
            span_batch_size: 256,
            span_flush_ms: 200,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.queue_connection.eq_ignore_ascii_case(EMULATED_QUEUE) {
            return Err(TradeTraceError::Config(format!(
                "unsupported queue connection {:?}; only {EMULATED_QUEUE:?} is available",
                self.queue_connection
            )));
        }
        if self.queue_name.trim().is_empty() {
            return Err(TradeTraceError::Config("queue name cannot be empty".to_string()));
        }
        if self.max_delivery_count == 0 {
            return Err(TradeTraceError::Config(
                "max delivery count must be at least 1".to_string(),
            ));
        }
        if self.span_batch_size == 0 {
            return Err(TradeTraceError::Config(
                "span batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    db_path: Option<PathBuf>,
    http_addr: Option<String>,
    service_name: Option<String>,
    environment: Option<String>,
    otlp_endpoint: Option<String>,
    queue_connection: Option<String>,
    queue_name: Option<String>,
    max_delivery_count: Option<u32>,
    log_format: Option<String>,
    span_retention_ttl: Option<String>,
    span_batch_size: Option<usize>,
    span_flush_ms: Option<u64>,
    shutdown_grace: Option<String>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("TRADETRACE_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("tradetrace/config.toml")
}

fn load_file_overrides(path: &PathBuf) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| TradeTraceError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| TradeTraceError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    let max_delivery_count = match env::var("TRADETRACE_MAX_DELIVERY_COUNT") {
        Ok(v) => Some(v.parse::<u32>().map_err(|e| {
            TradeTraceError::Config(format!(
                "bad TRADETRACE_MAX_DELIVERY_COUNT in environment: {e}"
            ))
        })?),
        Err(_) => None,
    };

    Ok(ConfigOverrides {
        db_path: env::var("TRADETRACE_DB_PATH").ok().map(PathBuf::from),
        http_addr: env::var("TRADETRACE_HTTP_ADDR").ok(),
        service_name: env::var("OTEL_SERVICE_NAME").ok(),
        environment: env::var("TRADETRACE_ENVIRONMENT").ok(),
        otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        queue_connection: env::var("TRADETRACE_QUEUE_CONNECTION").ok(),
        queue_name: env::var("TRADETRACE_QUEUE_NAME").ok(),
        max_delivery_count,
        log_format: env::var("TRADETRACE_LOG_FORMAT").ok(),
        span_retention_ttl: env::var("TRADETRACE_SPAN_RETENTION_TTL").ok(),
        span_batch_size: None,
        span_flush_ms: None,
        shutdown_grace: env::var("TRADETRACE_SHUTDOWN_GRACE").ok(),
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.db_path {
        cfg.db_path = v;
    }
    if let Some(v) = overrides.http_addr {
        cfg.http_addr = v;
    }
    if let Some(v) = overrides.service_name {
        cfg.service_name = v;
    }
    if let Some(v) = overrides.environment {
        cfg.environment = v;
    }
    if let Some(v) = overrides.otlp_endpoint
        && !v.trim().is_empty()
    {
        cfg.otlp_endpoint = Some(v);
    }
    if let Some(v) = overrides.queue_connection {
        cfg.queue_connection = v;
    }
    if let Some(v) = overrides.queue_name {
        cfg.queue_name = v;
    }
    if let Some(v) = overrides.max_delivery_count {
        cfg.max_delivery_count = v;
    }
    if let Some(v) = overrides.log_format {
        cfg.log_format = LogFormat::parse(&v).ok_or_else(|| {
            TradeTraceError::Config(format!("bad log_format in {source}: {v}"))
        })?;
    }
    if let Some(v) = overrides.span_retention_ttl {
        cfg.span_retention_ttl = parse_duration_str(&v).map_err(|e| {
            TradeTraceError::Config(format!("bad span_retention_ttl in {source}: {e}"))
        })?;
    }
    if let Some(v) = overrides.span_batch_size {
        cfg.span_batch_size = v;
    }
    if let Some(v) = overrides.span_flush_ms {
        cfg.span_flush_ms = v;
    }
    if let Some(v) = overrides.shutdown_grace {
        cfg.shutdown_grace = parse_duration_str(&v).map_err(|e| {
            TradeTraceError::Config(format!("bad shutdown_grace in {source}: {e}"))
        })?;
    }
    Ok(())
}
