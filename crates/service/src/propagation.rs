//! Moves a [`Context`] in and out of string-keyed carriers: broker message
//! headers and HTTP headers.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector};
use tradetrace_core::Context;
use tradetrace_core::traceparent::{self, TRACEPARENT_HEADER, TRACESTATE_HEADER};

/// Writes into broker message headers.
pub struct MessageInjector<'a>(pub &'a mut BTreeMap<String, String>);

impl Injector for MessageInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Reads from broker message headers.
pub struct MessageExtractor<'a>(pub &'a BTreeMap<String, String>);

impl Extractor for MessageExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Writes into HTTP headers. Values that are not valid header text are
/// skipped.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

/// Reads from HTTP headers.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// Writes the active span of `cx`, if any, into `carrier`.
pub fn inject(cx: &Context, carrier: &mut dyn Injector) {
    let Some(span) = cx.span_context() else {
        return;
    };
    carrier.set(TRACEPARENT_HEADER, traceparent::encode(span));
    if let Some(state) = span.trace_state() {
        carrier.set(TRACESTATE_HEADER, state.as_str().to_string());
    }
}

/// Reads a remote context from `carrier`. Missing or malformed headers give an
/// empty context.
pub fn extract(carrier: &dyn Extractor) -> Context {
    let Some(raw) = carrier.get(TRACEPARENT_HEADER) else {
        return Context::empty();
    };
    match traceparent::decode(raw, carrier.get(TRACESTATE_HEADER)) {
        Ok(span) => Context::remote(Some(span)),
        Err(err) => {
            tracing::warn!(traceparent = raw, error = %err, "ignoring malformed traceparent");
            Context::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use testkit::{SAMPLE_TRACEPARENT, sample_context};
    use tradetrace_core::traceparent::TraceState;

    use super::*;

    #[test]
    fn inject_then_extract_over_message_headers() {
        let span = sample_context().with_trace_state(TraceState::new("rojo=1"));
        let cx = Context::empty().with_span(span.clone());

        let mut headers = BTreeMap::new();
        inject(&cx, &mut MessageInjector(&mut headers));
        assert_eq!(headers.get("traceparent").map(String::as_str), Some(SAMPLE_TRACEPARENT));
        assert_eq!(headers.get("tracestate").map(String::as_str), Some("rojo=1"));

        let extractor = MessageExtractor(&headers);
        assert_eq!(extractor.keys(), vec!["traceparent", "tracestate"]);
        assert_eq!(extract(&extractor).span_context(), Some(&span));
    }

    #[test]
    fn empty_context_injects_nothing() {
        let mut headers = BTreeMap::new();
        inject(&Context::empty(), &mut MessageInjector(&mut headers));
        assert!(headers.is_empty());
    }

    #[test]
    fn malformed_http_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static("00-garbage-01"));
        assert_eq!(extract(&HeaderExtractor(&headers)), Context::empty());
    }

    #[test]
    fn http_headers_carry_context_both_ways() {
        let mut headers = HeaderMap::new();
        inject(
            &Context::empty().with_span(sample_context()),
            &mut HeaderInjector(&mut headers),
        );
        assert_eq!(headers.get("traceparent").unwrap(), SAMPLE_TRACEPARENT);

        let cx = extract(&HeaderExtractor(&headers));
        assert_eq!(cx.span_context(), Some(&sample_context()));
    }
}
