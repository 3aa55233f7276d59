use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service: String,
    pub name: String,
    pub kind: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub status: String,
    pub status_message: Option<String>,
    pub attrs_json: String,
    pub events_json: String,
    pub links: Vec<LinkRecord>,
}

impl SpanRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.end_ts - self.start_ts).num_milliseconds().max(0)
    }
}

/// A causal edge from a span to another, possibly finished, span context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkRecord {
    pub trace_id: String,
    pub span_id: String,
    pub trace_state: Option<String>,
    #[serde(default = "default_sampled")]
    pub sampled: bool,
    pub attrs_json: String,
}

fn default_sampled() -> bool {
    true
}

/// A link stored in another trace that points into the trace being viewed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundLink {
    pub from_trace_id: String,
    pub from_span_id: String,
    pub from_name: String,
    pub to_span_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceView {
    pub trace_id: String,
    pub spans: Vec<SpanRecord>,
    pub inbound_links: Vec<InboundLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub db_path: String,
    pub db_size_bytes: u64,
    pub trades_count: usize,
    pub spans_count: usize,
    pub links_count: usize,
    pub oldest_span_ts: Option<DateTime<Utc>>,
    pub newest_span_ts: Option<DateTime<Utc>>,
}
