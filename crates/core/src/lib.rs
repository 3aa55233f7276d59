pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod sink;
pub mod time;
pub mod traceparent;
pub mod tracer;

pub use error::{Result, TradeTraceError};
pub use traceparent::TraceContext;
pub use tracer::{Context, SpanBuilder, SpanHandle, SpanKind, SpanLink, SpanStatus, Tracer};
