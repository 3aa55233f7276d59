//! W3C trace-context codec.
//!
//! A `traceparent` value has the shape `{version}-{trace-id}-{span-id}-{flags}`
//! with field widths of 2, 32, 16 and 2 hex characters. Only version `00` is
//! understood. Decoding never panics: malformed input comes back as an
//! [`InvalidTraceParent`] so the operation carrying the header can continue
//! without a context.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{SpanId, TraceId, decode_hex};

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

pub const SUPPORTED_VERSION: u8 = 0x00;
pub const MAX_TRACE_STATE_LEN: usize = 500;
pub const MAX_TRACE_PARENT_LEN: usize = 100;

const FLAG_SAMPLED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidTraceParent {
    #[error("traceparent is empty")]
    Empty,

    #[error("expected 4 dash-separated fields, found {0}")]
    FieldCount(usize),

    #[error("{field} must be {expected} hex characters, got {actual}")]
    FieldWidth {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{0} contains non-hex characters")]
    NotHex(&'static str),

    #[error("unsupported traceparent version {0:02x}")]
    UnsupportedVersion(u8),

    #[error("trace id is all zeros")]
    ZeroTraceId,

    #[error("span id is all zeros")]
    ZeroSpanId,
}

/// Opaque vendor key/value list carried next to a `traceparent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceState(String);

impl TraceState {
    /// Accepts a non-blank value of at most [`MAX_TRACE_STATE_LEN`] characters, untouched.
    pub fn new(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() || raw.chars().count() > MAX_TRACE_STATE_LEN {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of a span as it crosses a process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    version: u8,
    trace_id: TraceId,
    span_id: SpanId,
    sampled: bool,
    trace_state: Option<TraceState>,
}

impl TraceContext {
    pub fn new(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            trace_id,
            span_id,
            sampled,
            trace_state: None,
        }
    }

    pub fn with_trace_state(mut self, trace_state: Option<TraceState>) -> Self {
        self.trace_state = trace_state;
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn trace_state(&self) -> Option<&TraceState> {
        self.trace_state.as_ref()
    }

    pub fn flags(&self) -> u8 {
        if self.sampled { FLAG_SAMPLED } else { 0 }
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{}-{}-{:02x}",
            self.version,
            self.trace_id,
            self.span_id,
            self.flags()
        )
    }
}

pub fn encode(context: &TraceContext) -> String {
    context.to_string()
}

pub fn decode(
    raw: &str,
    vendor_state: Option<&str>,
) -> Result<TraceContext, InvalidTraceParent> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(InvalidTraceParent::Empty);
    }

    let fields = raw.split('-').collect::<Vec<_>>();
    let [version, trace_id, span_id, flags] = fields.as_slice() else {
        return Err(InvalidTraceParent::FieldCount(fields.len()));
    };

    let [version] = hex_field::<1>(version, "version")?;
    if version != SUPPORTED_VERSION {
        return Err(InvalidTraceParent::UnsupportedVersion(version));
    }

    let trace_id = TraceId::from_bytes(hex_field::<16>(trace_id, "trace-id")?)
        .map_err(|_| InvalidTraceParent::ZeroTraceId)?;
    let span_id = SpanId::from_bytes(hex_field::<8>(span_id, "parent-id")?)
        .map_err(|_| InvalidTraceParent::ZeroSpanId)?;
    let [flags] = hex_field::<1>(flags, "trace-flags")?;

    Ok(
        TraceContext::new(trace_id, span_id, flags & FLAG_SAMPLED == FLAG_SAMPLED)
            .with_trace_state(vendor_state.and_then(TraceState::new)),
    )
}

fn hex_field<const N: usize>(
    value: &str,
    field: &'static str,
) -> Result<[u8; N], InvalidTraceParent> {
    if value.len() != N * 2 {
        return Err(InvalidTraceParent::FieldWidth {
            field,
            expected: N * 2,
            actual: value.len(),
        });
    }
    decode_hex::<N>(value).ok_or(InvalidTraceParent::NotHex(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn sample_context() -> TraceContext {
        TraceContext::new(
            TraceId::parse("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId::parse("b7ad6b7169203331").unwrap(),
            true,
        )
    }

    #[test]
    fn encodes_sampled_and_unsampled() {
        let ctx = sample_context();
        assert_eq!(encode(&ctx), SAMPLE);

        let unsampled = TraceContext::new(ctx.trace_id(), ctx.span_id(), false);
        assert_eq!(
            encode(&unsampled),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00"
        );
    }

    #[test]
    fn decodes_known_value() {
        let ctx = decode(SAMPLE, None).unwrap();
        assert_eq!(ctx.version(), 0);
        assert_eq!(ctx.trace_id().to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.span_id().to_string(), "b7ad6b7169203331");
        assert!(ctx.is_sampled());
        assert!(ctx.trace_state().is_none());
    }

    #[test]
    fn round_trips_generated_contexts() {
        for sampled in [true, false] {
            for state in [None, Some("congo=t61rcWkgMzE,rojo=00f067aa0ba902b7")] {
                let ctx = TraceContext::new(TraceId::random(), SpanId::random(), sampled)
                    .with_trace_state(state.and_then(TraceState::new));
                let back = decode(&encode(&ctx), state).unwrap();
                assert_eq!(back, ctx);
            }
        }
    }

    #[test]
    fn sampled_reads_lowest_flag_bit() {
        let ctx = decode("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-03", None).unwrap();
        assert!(ctx.is_sampled());
        let ctx = decode("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-02", None).unwrap();
        assert!(!ctx.is_sampled());
    }

    #[test]
    fn rejects_malformed_values() {
        let cases = [
            ("", InvalidTraceParent::Empty),
            ("   ", InvalidTraceParent::Empty),
            (
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331",
                InvalidTraceParent::FieldCount(3),
            ),
            (
                "00_0af7651916cd43dd8448eb211c80319c_b7ad6b7169203331_01",
                InvalidTraceParent::FieldCount(1),
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
                InvalidTraceParent::FieldCount(5),
            ),
            (
                "00-0af7651916cd43dd8448eb211c8031-b7ad6b7169203331-01",
                InvalidTraceParent::FieldWidth {
                    field: "trace-id",
                    expected: 32,
                    actual: 30,
                },
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b71692033-01",
                InvalidTraceParent::FieldWidth {
                    field: "parent-id",
                    expected: 16,
                    actual: 14,
                },
            ),
            (
                "0-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
                InvalidTraceParent::FieldWidth {
                    field: "version",
                    expected: 2,
                    actual: 1,
                },
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319z-b7ad6b7169203331-01",
                InvalidTraceParent::NotHex("trace-id"),
            ),
            (
                "00-00000000000000000000000000000000-b7ad6b7169203331-01",
                InvalidTraceParent::ZeroTraceId,
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
                InvalidTraceParent::ZeroSpanId,
            ),
            (
                "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
                InvalidTraceParent::UnsupportedVersion(0x01),
            ),
            (
                "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
                InvalidTraceParent::UnsupportedVersion(0xff),
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-g1",
                InvalidTraceParent::NotHex("trace-flags"),
            ),
        ];

        for (raw, expected) in cases {
            assert_eq!(decode(raw, None), Err(expected), "input: {raw:?}");
        }
    }

    #[test]
    fn trims_and_lowercases() {
        let ctx = decode(
            "  00-0AF7651916CD43DD8448EB211C80319C-B7AD6B7169203331-01\n",
            None,
        )
        .unwrap();
        assert_eq!(encode(&ctx), SAMPLE);
    }

    #[test]
    fn keeps_vendor_state_verbatim() {
        let ctx = decode(SAMPLE, Some("rojo=00f067aa0ba902b7,congo=t61rcWkgMzE")).unwrap();
        assert_eq!(
            ctx.trace_state().map(TraceState::as_str),
            Some("rojo=00f067aa0ba902b7,congo=t61rcWkgMzE")
        );
    }

    #[test]
    fn drops_oversized_or_blank_vendor_state() {
        let long = "a".repeat(MAX_TRACE_STATE_LEN + 1);
        let ctx = decode(SAMPLE, Some(&long)).unwrap();
        assert!(ctx.trace_state().is_none());

        let ctx = decode(SAMPLE, Some("  ")).unwrap();
        assert!(ctx.trace_state().is_none());

        let exact = "b".repeat(MAX_TRACE_STATE_LEN);
        let ctx = decode(SAMPLE, Some(&exact)).unwrap();
        assert_eq!(ctx.trace_state().map(|s| s.as_str().len()), Some(MAX_TRACE_STATE_LEN));
    }

    #[test]
    fn encoded_length_fits_column() {
        assert!(encode(&sample_context()).len() <= MAX_TRACE_PARENT_LEN);
    }
}
