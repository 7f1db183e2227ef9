use anyhow::{bail, Context, Result};

/// Runtime configuration resolved once at startup from the environment.
///
/// The three secrets (`API_KEY`, `JWT_SECRET_KEY`, `JWT_ENCRYPTION_KEY`) are
/// hard requirements: a server started without them would either be open to
/// the world or unable to mint tokens, so startup aborts instead.
#[derive(Clone)]
pub struct Config {
    /// Machine-to-machine secret agents present to `authenticate_agent`.
    pub api_key: String,
    /// HS256 signing key for the inner JWTs.
    pub jwt_secret_key: String,
    /// 256-bit key (hex) wrapping JWTs at rest behind opaque token ids.
    pub jwt_encryption_key: String,

    pub database_url: String,
    pub port: u16,

    pub pool_min: u32,
    pub pool_max: u32,

    pub ws_idle_timeout_s: u64,
    pub memory_sweep_interval_s: u64,
    pub write_batch_size: usize,
    pub write_flush_interval_s: u64,

    pub default_search_recency_hours: f64,
    pub default_search_max_rows: i64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparsable {} value — using default", key);
            default
        }),
        Err(_) => default,
    }
}

fn required(key: &str) -> Result<String> {
    let value = std::env::var(key)
        .with_context(|| format!("FATAL: {key} environment variable is not set. The server cannot start without it."))?;
    if value.trim().is_empty() {
        bail!("FATAL: {key} is set but empty");
    }
    Ok(value)
}

impl Config {
    /// Reads the full configuration from the environment.
    /// Call after `dotenvy::dotenv()` so `.env` values are visible.
    pub fn from_env() -> Result<Self> {
        let api_key = required("API_KEY")?;
        let jwt_secret_key = required("JWT_SECRET_KEY")?;
        let jwt_encryption_key = required("JWT_ENCRYPTION_KEY")?;

        let mut database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:shared_context.db".to_string());

        // Ensure the path is absolute for Windows environments to avoid Code 14 errors
        if database_url.starts_with("sqlite:")
            && database_url != "sqlite::memory:"
            && !database_url.contains(":/")
            && !database_url.contains(":\\")
            && !database_url[7..].contains('/')
            && !database_url[7..].contains('\\')
        {
            if let Ok(cwd) = std::env::current_dir() {
                let db_path = cwd.join(&database_url[7..]);
                database_url = format!("sqlite:{}", db_path.to_string_lossy());
                tracing::info!("🛠️ Auto-resolving relative database path to: {}", database_url);
            }
        }

        Ok(Self {
            api_key,
            jwt_secret_key,
            jwt_encryption_key,
            database_url,
            port: env_or("PORT", 8000),
            pool_min: env_or("POOL_MIN", 5),
            pool_max: env_or("POOL_MAX", 50),
            ws_idle_timeout_s: env_or("WS_IDLE_TIMEOUT_S", 300),
            memory_sweep_interval_s: env_or("MEMORY_SWEEP_INTERVAL_S", 300),
            write_batch_size: env_or("WRITE_BATCH_SIZE", 50),
            write_flush_interval_s: env_or("WRITE_FLUSH_INTERVAL_S", 1),
            default_search_recency_hours: env_or("DEFAULT_SEARCH_RECENCY_HOURS", 24.0),
            default_search_max_rows: env_or("DEFAULT_SEARCH_MAX_ROWS", 1000),
        })
    }

    /// A fixed configuration for tests: in-memory database, known secrets.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            api_key: "test-api-key".to_string(),
            jwt_secret_key: "test-jwt-signing-secret".to_string(),
            jwt_encryption_key: hex::encode([7u8; 32]),
            database_url: "sqlite::memory:".to_string(),
            port: 0,
            pool_min: 1,
            pool_max: 5,
            ws_idle_timeout_s: 300,
            memory_sweep_interval_s: 300,
            write_batch_size: 50,
            write_flush_interval_s: 1,
            default_search_recency_hours: 24.0,
            default_search_max_rows: 1000,
        }
    }
}
