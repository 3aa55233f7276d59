use chrono::{Duration, TimeZone, Utc};
use tradetrace_core::ids::{SpanId, TraceId};
use tradetrace_core::model::span::{LinkRecord, SpanRecord};
use tradetrace_core::model::trade::{NewTrade, Trade};
use tradetrace_core::traceparent::TraceContext;

pub const SAMPLE_TRACE_ID: &str = "0af7651916cd43dd8448eb211c80319c";
pub const SAMPLE_SPAN_ID: &str = "b7ad6b7169203331";
pub const SAMPLE_TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

pub fn sample_context() -> TraceContext {
    TraceContext::new(
        TraceId::parse(SAMPLE_TRACE_ID).unwrap(),
        SpanId::parse(SAMPLE_SPAN_ID).unwrap(),
        true,
    )
}

pub fn sample_new_trade() -> NewTrade {
    NewTrade {
        instrument: "CRUDE-OIL".to_string(),
        quantity: 1000.0,
        price: 75.50,
        counterparty: "ACME".to_string(),
        trade_date: Some(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()),
    }
}

pub fn sample_trade() -> Trade {
    sample_new_trade().into_pending()
}

/// A producer span in the sample trace and a consumer span in a fresh trace
/// that links back to it.
pub fn sample_linked_spans() -> (SpanRecord, SpanRecord) {
    let base = Utc::now();
    let producer = SpanRecord {
        trace_id: SAMPLE_TRACE_ID.to_string(),
        span_id: SAMPLE_SPAN_ID.to_string(),
        parent_span_id: None,
        service: "api".to_string(),
        name: "POST /api/trades".to_string(),
        kind: "SERVER".to_string(),
        start_ts: base - Duration::milliseconds(500),
        end_ts: base - Duration::milliseconds(400),
        status: "OK".to_string(),
        status_message: None,
        attrs_json: "{}".to_string(),
        events_json: "[]".to_string(),
        links: Vec::new(),
    };

    let consumer = SpanRecord {
        trace_id: TraceId::random().to_string(),
        span_id: SpanId::random().to_string(),
        parent_span_id: None,
        service: "settlement".to_string(),
        name: "settle_trade".to_string(),
        kind: "CONSUMER".to_string(),
        start_ts: base - Duration::milliseconds(100),
        end_ts: base,
        status: "OK".to_string(),
        status_message: None,
        attrs_json: "{\"trade.id\":\"t-1\"}".to_string(),
        events_json: "[]".to_string(),
        links: vec![LinkRecord {
            trace_id: SAMPLE_TRACE_ID.to_string(),
            span_id: SAMPLE_SPAN_ID.to_string(),
            trace_state: None,
            sampled: true,
            attrs_json: "{\"link.reason\":\"trade.created\"}".to_string(),
        }],
    };

    (producer, consumer)
}
