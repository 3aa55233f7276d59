use std::collections::HashMap;

use chrono::NaiveDateTime;
use duckdb::params;
use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::model::span::{InboundLink, LinkRecord, SpanRecord, TraceView};

use crate::Store;
use crate::db::naive_to_utc;

impl Store {
    pub fn insert_spans(&self, spans: &[SpanRecord]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| TradeTraceError::Store(format!("begin tx failed: {e}")))?;

        {
            let mut span_stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO spans
                     (trace_id, span_id, parent_span_id, service, name, kind, start_ts, end_ts,
                      status, status_message, attrs_json, events_json)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .map_err(|e| TradeTraceError::Store(format!("prepare insert spans failed: {e}")))?;
            let mut link_stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO span_links
                     (trace_id, span_id, link_index, linked_trace_id, linked_span_id,
                      linked_trace_state, linked_sampled, attrs_json)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .map_err(|e| TradeTraceError::Store(format!("prepare insert links failed: {e}")))?;

            for span in spans {
                span_stmt
                    .execute(params![
                        span.trace_id,
                        span.span_id,
                        span.parent_span_id,
                        span.service,
                        span.name,
                        span.kind,
                        span.start_ts.to_rfc3339(),
                        span.end_ts.to_rfc3339(),
                        span.status,
                        span.status_message,
                        span.attrs_json,
                        span.events_json,
                    ])
                    .map_err(|e| TradeTraceError::Store(format!("insert span failed: {e}")))?;

                for (index, link) in span.links.iter().enumerate() {
                    link_stmt
                        .execute(params![
                            span.trace_id,
                            span.span_id,
                            index as i32,
                            link.trace_id,
                            link.span_id,
                            link.trace_state,
                            link.sampled,
                            link.attrs_json,
                        ])
                        .map_err(|e| TradeTraceError::Store(format!("insert link failed: {e}")))?;
                }
            }
        }

        tx.commit()
            .map_err(|e| TradeTraceError::Store(format!("commit spans failed: {e}")))
    }

    /// Spans of one trace with their links, plus links from other spans into it.
    pub fn get_trace(&self, trace_id: &str) -> Result<TraceView> {
        let mut spans = self.fetch_trace_spans(trace_id)?;
        let mut links = self.fetch_trace_links(trace_id)?;
        for span in &mut spans {
            if let Some(found) = links.remove(&span.span_id) {
                span.links = found;
            }
        }

        Ok(TraceView {
            trace_id: trace_id.to_string(),
            spans,
            inbound_links: self.fetch_inbound_links(trace_id)?,
        })
    }

    fn fetch_trace_spans(&self, trace_id: &str) -> Result<Vec<SpanRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT trace_id, span_id, parent_span_id, service, name, kind, start_ts, end_ts,
                        status, status_message, attrs_json, events_json
                 FROM spans
                 WHERE trace_id = ?
                 ORDER BY start_ts ASC",
            )
            .map_err(|e| TradeTraceError::Store(format!("prepare trace spans failed: {e}")))?;

        let rows = stmt
            .query_map(params![trace_id], |row| {
                Ok(SpanRecord {
                    trace_id: row.get::<_, String>(0)?,
                    span_id: row.get::<_, String>(1)?,
                    parent_span_id: row.get::<_, Option<String>>(2)?,
                    service: row.get::<_, String>(3)?,
                    name: row.get::<_, String>(4)?,
                    kind: row.get::<_, String>(5)?,
                    start_ts: naive_to_utc(row.get::<_, NaiveDateTime>(6)?),
                    end_ts: naive_to_utc(row.get::<_, NaiveDateTime>(7)?),
                    status: row.get::<_, String>(8)?,
                    status_message: row.get::<_, Option<String>>(9)?,
                    attrs_json: row.get::<_, String>(10)?,
                    events_json: row.get::<_, String>(11)?,
                    links: Vec::new(),
                })
            })
            .map_err(|e| TradeTraceError::Store(format!("query trace spans failed: {e}")))?;

        let mut spans = Vec::new();
        for row in rows {
            spans.push(
                row.map_err(|e| TradeTraceError::Store(format!("map trace span failed: {e}")))?,
            );
        }
        Ok(spans)
    }

    fn fetch_trace_links(&self, trace_id: &str) -> Result<HashMap<String, Vec<LinkRecord>>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT span_id, linked_trace_id, linked_span_id, linked_trace_state,
                        linked_sampled, attrs_json
                 FROM span_links
                 WHERE trace_id = ?
                 ORDER BY span_id, link_index",
            )
            .map_err(|e| TradeTraceError::Store(format!("prepare trace links failed: {e}")))?;

        let rows = stmt
            .query_map(params![trace_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    LinkRecord {
                        trace_id: row.get::<_, String>(1)?,
                        span_id: row.get::<_, String>(2)?,
                        trace_state: row.get::<_, Option<String>>(3)?,
                        sampled: row.get::<_, bool>(4)?,
                        attrs_json: row.get::<_, String>(5)?,
                    },
                ))
            })
            .map_err(|e| TradeTraceError::Store(format!("query trace links failed: {e}")))?;

        let mut out: HashMap<String, Vec<LinkRecord>> = HashMap::new();
        for row in rows {
            let (span_id, link) =
                row.map_err(|e| TradeTraceError::Store(format!("map trace link failed: {e}")))?;
            out.entry(span_id).or_default().push(link);
        }
        Ok(out)
    }

    fn fetch_inbound_links(&self, trace_id: &str) -> Result<Vec<InboundLink>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT l.trace_id, l.span_id, COALESCE(s.name, ''), l.linked_span_id
                 FROM span_links l
                 LEFT JOIN spans s ON s.trace_id = l.trace_id AND s.span_id = l.span_id
                 WHERE l.linked_trace_id = ? AND l.trace_id <> ?
                 ORDER BY l.trace_id, l.span_id, l.link_index",
            )
            .map_err(|e| TradeTraceError::Store(format!("prepare inbound links failed: {e}")))?;

        let rows = stmt
            .query_map(params![trace_id, trace_id], |row| {
                Ok(InboundLink {
                    from_trace_id: row.get::<_, String>(0)?,
                    from_span_id: row.get::<_, String>(1)?,
                    from_name: row.get::<_, String>(2)?,
                    to_span_id: row.get::<_, String>(3)?,
                })
            })
            .map_err(|e| TradeTraceError::Store(format!("query inbound links failed: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(
                row.map_err(|e| TradeTraceError::Store(format!("map inbound link failed: {e}")))?,
            );
        }
        Ok(out)
    }
}
