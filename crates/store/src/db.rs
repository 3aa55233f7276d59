use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::Connection;
use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::model::span::StoreStatus;

use crate::schema::SCHEMA_SQL;

/// Shared handle to the DuckDB database. Cloning is cheap; every operation
/// checks the connection out for its own duration only.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TradeTraceError::Io(format!("failed to create db dir: {e}")))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| TradeTraceError::Store(format!("failed to open duckdb: {e}")))?;
        conn.execute_batch("PRAGMA threads=4;")
            .map_err(|e| TradeTraceError::Store(format!("failed to set pragmas: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| TradeTraceError::Store(format!("failed to initialize schema: {e}")))?;

        tracing::debug!(db_path = %path.display(), "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.display().to_string(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TradeTraceError::Store(format!("failed to open in-memory db: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| TradeTraceError::Store(format!("failed to initialize schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TradeTraceError::Internal("store mutex poisoned".to_string()))
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let conn = self.conn()?;

        let trades_count = scalar_usize(&conn, "SELECT COUNT(*) FROM trades")?;
        let spans_count = scalar_usize(&conn, "SELECT COUNT(*) FROM spans")?;
        let links_count = scalar_usize(&conn, "SELECT COUNT(*) FROM span_links")?;

        let oldest_span_ts = scalar_ts(&conn, "SELECT MIN(start_ts) FROM spans")?;
        let newest_span_ts = scalar_ts(&conn, "SELECT MAX(end_ts) FROM spans")?;

        let db_size_bytes = if self.db_path == ":memory:" {
            0
        } else {
            fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StoreStatus {
            db_path: self.db_path.clone(),
            db_size_bytes,
            trades_count,
            spans_count,
            links_count,
            oldest_span_ts,
            newest_span_ts,
        })
    }
}

pub(crate) fn naive_to_utc(ts: NaiveDateTime) -> DateTime<Utc> {
    ts.and_utc()
}

fn scalar_usize(conn: &Connection, sql: &str) -> Result<usize> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|v| v as usize)
        .map_err(|e| TradeTraceError::Store(format!("query failed: {e}")))
}

fn scalar_ts(conn: &Connection, sql: &str) -> Result<Option<DateTime<Utc>>> {
    conn.query_row(sql, [], |row| row.get::<_, Option<NaiveDateTime>>(0))
        .map(|opt| opt.map(naive_to_utc))
        .map_err(|e| TradeTraceError::Store(format!("query failed: {e}")))
}
