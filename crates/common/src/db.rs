use anyhow::Result;

use crate::error::PipelineError;

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, busy_timeout) and create the
    /// shared schema, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // The holder collector writes into the same file. If it holds the write
        // lock at startup we back off and retry instead of crash-looping.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(anyhow::Error::from(err)
                            .context("AsyncDb::open: schema setup failed"));
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: schema setup failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying schema setup"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("leagues_db_query_latency_ms", "op" => op, "status" => status)
            .record(ms);
        if res.is_err() {
            metrics::counter!("leagues_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

/// Validate a per-token table name before it is spliced into SQL.
///
/// Table names come from configuration, never from requests, but they are
/// still interpolated, so only `[A-Za-z_][A-Za-z0-9_]{0,62}` is accepted.
pub fn checked_table_name(name: &str) -> std::result::Result<&str, PipelineError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && !name.to_ascii_lowercase().starts_with("sqlite_") {
        Ok(name)
    } else {
        Err(PipelineError::Configuration(format!(
            "invalid table name: {name:?}"
        )))
    }
}

pub fn table_exists(conn: &rusqlite::Connection, table: &str) -> rusqlite::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        rusqlite::params![table],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// DDL for a per-token holder snapshot table. The table is owned by the
/// holder collector; this is what it is expected to look like.
pub fn holder_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            address TEXT NOT NULL,
            is_contract INTEGER NOT NULL DEFAULT 0,
            balance TEXT NOT NULL,          -- decimal, formatted with token decimals
            date TEXT NOT NULL,             -- YYYY-MM-DD
            PRIMARY KEY (address, date)
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_date ON {table}(date);"
    )
}

/// DDL for a per-token published league table. Holds only the latest snapshot.
pub fn league_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            league_name TEXT NOT NULL,
            percentage TEXT,                -- bucket minimum; NULL for TOTAL
            all_holders INTEGER NOT NULL,
            user_holders INTEGER NOT NULL,
            last_week_holders INTEGER NOT NULL,
            holder_change INTEGER NOT NULL,
            date TEXT NOT NULL
        );"
    )
}

const SCHEMA: &str = r#"
-- Written by the supply collector; the newest as_of per (ticker, chain) wins.
CREATE TABLE IF NOT EXISTS token_supply (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    chain TEXT NOT NULL,
    total_supply_formatted TEXT NOT NULL,
    as_of TEXT NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_token_supply_lookup
    ON token_supply(ticker, chain, as_of);

-- Cross-process run lease, one row per ticker while a run holds it.
CREATE TABLE IF NOT EXISTS league_locks (
    ticker TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL      -- unix seconds
);

CREATE TABLE IF NOT EXISTS league_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger TEXT NOT NULL,            -- http, schedule, cli
    snapshot_date TEXT NOT NULL,
    status TEXT NOT NULL,             -- running, completed, failed
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    duration_ms INTEGER,
    report_json TEXT,
    error TEXT
);
"#;
