use std::str::FromStr;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};

/// How database failures are classified for callers.
///
/// `Transient` may be retried (the store already does so internally);
/// `Programmer` is a bug in our own SQL and must never be retried.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,
    #[error("transient database error: {0}")]
    Transient(String),
    #[error("fatal database error: {0}")]
    Fatal(String),
    #[error("programmer error: {0}")]
    Programmer(String),
}

impl StoreError {
    fn classify(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::PoolTimeout,
            sqlx::Error::Database(db) => {
                let msg = db.message().to_lowercase();
                if msg.contains("locked") || msg.contains("busy") {
                    StoreError::Transient(db.message().to_string())
                } else {
                    StoreError::Fatal(db.message().to_string())
                }
            }
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::TypeNotFound { .. } => StoreError::Programmer(err.to_string()),
            sqlx::Error::PoolClosed => StoreError::Fatal("connection pool closed".to_string()),
            sqlx::Error::Io(_) => StoreError::Transient(err.to_string()),
            _ => StoreError::Fatal(err.to_string()),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::PoolTimeout)
    }
}

/// Result of a write statement.
#[derive(Debug, Clone, Copy)]
pub struct Exec {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// Outcome of `Store::health_check`.
#[derive(Debug, serde::Serialize)]
pub struct Health {
    pub ok: bool,
    pub latency_ms: f64,
}

/// Named SQL parameters. Values are JSON scalars — text, integer, float,
/// bool or null — which covers every column type the schema uses.
pub type Params<'a> = &'a [(&'a str, serde_json::Value)];

static NAMED_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":[a-zA-Z_][a-zA-Z0-9_]*").expect("named-param regex"));

/// The single pooled handle to the relational store.
///
/// SQL is written with `:name` placeholders; the store rewrites them to the
/// driver's positional binds in order of appearance. A parameter referenced
/// in SQL but missing from `params` is a `Programmer` error, as is a supplied
/// parameter the SQL never mentions.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

const MAX_RETRIES: u32 = 3;

impl Store {
    /// Opens the pool and applies the SQLite performance pragmas:
    /// WAL, synchronous=NORMAL, 16 MiB page cache, 256 MiB mmap, 10 s busy
    /// timeout.
    pub async fn connect(database_url: &str, pool_min: u32, pool_max: u32) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .pragma("cache_size", "-16384")
            .pragma("mmap_size", "268435456");

        let pool = SqlitePoolOptions::new()
            .min_connections(pool_min)
            .max_connections(pool_max)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_memory() -> anyhow::Result<Self> {
        // A single connection keeps the in-memory database alive and shared
        // across the whole test.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Creates all tables and indexes. Idempotent; safe to run on every boot.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                purpose TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                metadata TEXT -- JSON blob
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_type TEXT NOT NULL, -- denormalized so type filters need no join
                content TEXT NOT NULL,
                visibility TEXT NOT NULL DEFAULT 'public',
                message_type TEXT NOT NULL DEFAULT 'agent_response',
                metadata TEXT, -- JSON blob
                timestamp REAL NOT NULL,
                parent_message_id INTEGER,
                FOREIGN KEY(session_id) REFERENCES sessions(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_memory (
                agent_id TEXT NOT NULL,
                session_id TEXT NOT NULL DEFAULT '', -- '' means global scope
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                metadata TEXT,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                expires_at REAL,
                PRIMARY KEY (agent_id, session_id, key)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                session_id TEXT,
                metadata TEXT,
                timestamp REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS secure_tokens (
                opaque_id TEXT PRIMARY KEY,
                ciphertext TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                created_at REAL NOT NULL,
                expires_at REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // Migration: columns added after the first release. SQLite has no
        // ADD COLUMN IF NOT EXISTS, so failures here are expected and ignored.
        let _ = sqlx::query("ALTER TABLE messages ADD COLUMN parent_message_id INTEGER")
            .execute(&self.pool)
            .await;
        let _ = sqlx::query(
            "ALTER TABLE messages ADD COLUMN message_type TEXT NOT NULL DEFAULT 'agent_response'",
        )
        .execute(&self.pool)
        .await;

        for idx in [
            "CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_messages_visibility ON messages(session_id, visibility)",
            "CREATE INDEX IF NOT EXISTS idx_memory_expires ON agent_memory(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_audit_agent ON audit_log(agent_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_tokens_expires ON secure_tokens(expires_at)",
        ] {
            sqlx::query(idx).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Rewrites `:name` placeholders to positional `?` binds and returns the
    /// parameter values in bind order. Duplicate references are allowed.
    fn rewrite<'a>(
        sql: &str,
        params: Params<'a>,
    ) -> Result<(String, Vec<&'a serde_json::Value>), StoreError> {
        let mut ordered = Vec::new();
        for caps in NAMED_PARAM.find_iter(sql) {
            let name = &caps.as_str()[1..];
            let value = params
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    StoreError::Programmer(format!("SQL references unknown parameter :{name}"))
                })?;
            ordered.push(value);
        }
        for (name, _) in params {
            if !NAMED_PARAM
                .find_iter(sql)
                .any(|m| &m.as_str()[1..] == *name)
            {
                return Err(StoreError::Programmer(format!(
                    "parameter :{name} supplied but never referenced"
                )));
            }
        }
        Ok((NAMED_PARAM.replace_all(sql, "?").into_owned(), ordered))
    }

    fn bind_all<'q>(
        mut q: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        values: &[&'q serde_json::Value],
    ) -> Result<sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>, StoreError> {
        for value in values {
            q = match value {
                serde_json::Value::Null => q.bind(Option::<String>::None),
                serde_json::Value::Bool(b) => q.bind(*b as i64),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        q.bind(i)
                    } else if let Some(f) = n.as_f64() {
                        q.bind(f)
                    } else {
                        return Err(StoreError::Programmer(format!(
                            "unbindable numeric parameter: {n}"
                        )));
                    }
                }
                serde_json::Value::String(s) => q.bind(s.as_str()),
                other => {
                    return Err(StoreError::Programmer(format!(
                        "non-scalar parameter: {other}"
                    )))
                }
            };
        }
        Ok(q)
    }

    async fn backoff(attempt: u32) {
        // 50ms, 100ms, 200ms
        tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
    }

    /// Parameterized SELECT. Caller values never reach the SQL text.
    pub async fn query(&self, sql: &str, params: Params<'_>) -> Result<Vec<SqliteRow>, StoreError> {
        let (rewritten, values) = Self::rewrite(sql, params)?;
        let mut attempt = 0;
        loop {
            let q = Self::bind_all(sqlx::query(&rewritten), &values)?;
            match q.fetch_all(&self.pool).await {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    let classified = StoreError::classify(e);
                    if classified.is_transient() && attempt < MAX_RETRIES {
                        Self::backoff(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }

    /// Parameterized INSERT/UPDATE/DELETE with transient retry.
    pub async fn execute(&self, sql: &str, params: Params<'_>) -> Result<Exec, StoreError> {
        let (rewritten, values) = Self::rewrite(sql, params)?;
        let mut attempt = 0;
        loop {
            let q = Self::bind_all(sqlx::query(&rewritten), &values)?;
            match q.execute(&self.pool).await {
                Ok(done) => {
                    return Ok(Exec {
                        rows_affected: done.rows_affected(),
                        last_insert_id: done.last_insert_rowid(),
                    })
                }
                Err(e) => {
                    let classified = StoreError::classify(e);
                    if classified.is_transient() && attempt < MAX_RETRIES {
                        Self::backoff(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }

    /// Scoped transaction for multi-statement writes (the batch flusher).
    /// Dropping the transaction without commit rolls it back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool.begin().await.map_err(StoreError::classify)
    }

    pub async fn health_check(&self) -> Health {
        let started = Instant::now();
        let ok = sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok();
        Health {
            ok,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Pool statistics for the performance metrics tool.
    pub fn pool_stats(&self) -> (u32, usize) {
        (self.pool.size(), self.pool.num_idle())
    }
}
