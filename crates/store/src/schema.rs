pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
  trade_id TEXT PRIMARY KEY,
  instrument TEXT NOT NULL,
  quantity DECIMAL(18, 4) NOT NULL,
  price DECIMAL(18, 4) NOT NULL,
  counterparty TEXT NOT NULL,
  trade_date TIMESTAMP NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('Pending', 'Submitted', 'Settled', 'Failed')),
  created_at TIMESTAMP NOT NULL,
  settled_at TIMESTAMP,
  trace_parent VARCHAR(100),
  trace_state VARCHAR(500)
);

CREATE TABLE IF NOT EXISTS spans (
  trace_id TEXT NOT NULL,
  span_id TEXT NOT NULL,
  parent_span_id TEXT,
  service TEXT NOT NULL,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  start_ts TIMESTAMP NOT NULL,
  end_ts TIMESTAMP NOT NULL,
  status TEXT NOT NULL,
  status_message TEXT,
  attrs_json TEXT NOT NULL,
  events_json TEXT NOT NULL,
  PRIMARY KEY(trace_id, span_id)
);

CREATE TABLE IF NOT EXISTS span_links (
  trace_id TEXT NOT NULL,
  span_id TEXT NOT NULL,
  link_index INTEGER NOT NULL,
  linked_trace_id TEXT NOT NULL,
  linked_span_id TEXT NOT NULL,
  linked_trace_state TEXT,
  linked_sampled BOOLEAN NOT NULL DEFAULT true,
  attrs_json TEXT NOT NULL,
  PRIMARY KEY(trace_id, span_id, link_index)
);

CREATE INDEX IF NOT EXISTS idx_trades_created ON trades(created_at);

CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
CREATE INDEX IF NOT EXISTS idx_spans_end ON spans(end_ts);

CREATE INDEX IF NOT EXISTS idx_links_linked_trace ON span_links(linked_trace_id);
"#;
