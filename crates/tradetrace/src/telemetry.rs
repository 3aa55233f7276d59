use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use opentelemetry::trace::{
    Link, Span as _, SpanContext, SpanId, Status, TraceContextExt, TraceFlags, TraceId,
    TraceState, Tracer as _, TracerProvider,
};
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace as sdktrace;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use tradetrace_core::config::{Config, LogFormat};
use tradetrace_core::model::span::SpanRecord;
use tradetrace_core::sink::SpanSink;

const DEFAULT_FILTER: &str = "info";

pub fn init_cli_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Installs the process subscriber for `run`: env filter, a compact or JSON
/// fmt layer on stderr, and an OTLP export layer when an endpoint is set.
///
/// With an endpoint, the returned sink forwards finished trade spans to the
/// same exporter, keeping their propagated trace ids, parents and links.
pub fn init_run_tracing(cfg: &Config) -> Option<Arc<dyn SpanSink>> {
    let fmt_layer = match cfg.log_format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .compact()
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let tracer = build_otlp_tracer(cfg);
    let layer = tracer
        .clone()
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(layer)
        .try_init();

    tracer.map(|tracer| Arc::new(OtlpSpanSink { tracer }) as Arc<dyn SpanSink>)
}

/// Flushes and stops the OTLP exporter, if one was installed.
pub fn shutdown_tracing() {
    if let Some(provider) = otlp_provider_slot()
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
    {
        let _ = provider.shutdown();
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn build_otlp_tracer(cfg: &Config) -> Option<sdktrace::Tracer> {
    let endpoint = cfg.otlp_endpoint.as_deref()?;

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("tradetrace: otlp exporter disabled: {e}");
            return None;
        }
    };

    let resource = Resource::builder()
        .with_service_name(cfg.service_name.clone())
        .with_attribute(KeyValue::new(
            "deployment.environment",
            cfg.environment.clone(),
        ))
        .build();

    let provider = sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("tradetrace");

    if let Ok(mut slot) = otlp_provider_slot().lock() {
        *slot = Some(provider);
    }

    Some(tracer)
}

fn otlp_provider_slot() -> &'static Mutex<Option<sdktrace::SdkTracerProvider>> {
    static SLOT: OnceLock<Mutex<Option<sdktrace::SdkTracerProvider>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Replays finished [`SpanRecord`]s through the OTLP tracer with their
/// original ids, so the exported trace is the one carried on the wire.
struct OtlpSpanSink {
    tracer: sdktrace::Tracer,
}

impl SpanSink for OtlpSpanSink {
    fn export(&self, span: SpanRecord) {
        let Some(trace_id) = TraceId::from_hex(&span.trace_id).ok() else {
            return;
        };
        let Some(span_id) = SpanId::from_hex(&span.span_id).ok() else {
            return;
        };

        let parent = match span
            .parent_span_id
            .as_deref()
            .and_then(|id| SpanId::from_hex(id).ok())
        {
            // Only sampled spans reach a sink, and a span inherits its
            // parent's sampling decision.
            Some(parent_id) => opentelemetry::Context::new().with_remote_span_context(
                SpanContext::new(
                    trace_id,
                    parent_id,
                    TraceFlags::SAMPLED,
                    true,
                    TraceState::default(),
                ),
            ),
            None => opentelemetry::Context::new(),
        };

        let links = span.links.iter().filter_map(otel_link).collect::<Vec<_>>();
        let mut otel_span = self
            .tracer
            .span_builder(span.name.clone())
            .with_trace_id(trace_id)
            .with_span_id(span_id)
            .with_kind(otel_kind(&span.kind))
            .with_start_time(SystemTime::from(span.start_ts))
            .with_attributes(json_attributes(&span.attrs_json))
            .with_links(links)
            .start_with_context(&self.tracer, &parent);

        for event in serde_json::from_str::<Vec<serde_json::Value>>(&span.events_json)
            .unwrap_or_default()
        {
            let name = event["name"].as_str().unwrap_or("event").to_string();
            let ts = event["ts"]
                .as_str()
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                .map(SystemTime::from)
                .unwrap_or_else(SystemTime::now);
            otel_span.add_event_with_timestamp(name, ts, object_attributes(&event["attributes"]));
        }

        match span.status.as_str() {
            "OK" => otel_span.set_status(Status::Ok),
            "ERROR" => otel_span.set_status(Status::error(
                span.status_message.clone().unwrap_or_default(),
            )),
            _ => {}
        }
        otel_span.end_with_timestamp(SystemTime::from(span.end_ts));
    }
}

fn otel_link(link: &tradetrace_core::model::span::LinkRecord) -> Option<Link> {
    let trace_id = TraceId::from_hex(&link.trace_id).ok()?;
    let span_id = SpanId::from_hex(&link.span_id).ok()?;
    let state = link
        .trace_state
        .as_deref()
        .and_then(|s| TraceState::from_str(s).ok())
        .unwrap_or_default();
    let flags = if link.sampled {
        TraceFlags::SAMPLED
    } else {
        TraceFlags::default()
    };
    let context = SpanContext::new(trace_id, span_id, flags, true, state);
    Some(Link::new(context, json_attributes(&link.attrs_json), 0))
}

fn otel_kind(kind: &str) -> opentelemetry::trace::SpanKind {
    use opentelemetry::trace::SpanKind;
    match kind {
        "SERVER" => SpanKind::Server,
        "CLIENT" => SpanKind::Client,
        "PRODUCER" => SpanKind::Producer,
        "CONSUMER" => SpanKind::Consumer,
        _ => SpanKind::Internal,
    }
}

fn json_attributes(raw: &str) -> Vec<KeyValue> {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(|v| object_attributes(&v))
        .unwrap_or_default()
}

fn object_attributes(value: &serde_json::Value) -> Vec<KeyValue> {
    let Some(map) = value.as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::Bool(b) => Value::Bool(*b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => Value::I64(i),
                    None => Value::F64(n.as_f64().unwrap_or_default()),
                },
                serde_json::Value::String(s) => Value::String(s.clone().into()),
                other => Value::String(other.to_string().into()),
            };
            KeyValue::new(key.clone(), value)
        })
        .collect()
}
