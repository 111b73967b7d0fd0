//! Configuration types shared across crates.

use crate::schedule::CronSchedule;
use crate::size::parse_byte_size;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL used when building download links.
    /// Falls back to `http://{Host}` from the request when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Scope assigned to requests that carry no `x-cache-scope` header.
    #[serde(default = "default_scope")]
    pub default_scope: String,
    /// Hand out presigned backend URLs instead of proxying downloads.
    /// Only honoured by backends that can presign.
    #[serde(default)]
    pub enable_direct_downloads: bool,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Largest request body accepted by a single chunk write.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_scope() -> String {
    "default".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_max_chunk_bytes() -> u64 {
    2 * crate::DEFAULT_CHUNK_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_base_url: None,
            default_scope: default_scope(),
            enable_direct_downloads: false,
            metrics_enabled: default_metrics_enabled(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the default credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the default credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }

    /// Short backend name for logs and health output.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Filesystem { .. } => "filesystem",
            StorageConfig::S3 { .. } => "s3",
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single host deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Seconds to wait for the single SQLite connection before failing a query.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer DEPOT_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }

    /// Short driver name for logs and health output.
    pub fn driver_name(&self) -> &'static str {
        match self {
            MetadataConfig::Sqlite { .. } => "sqlite",
            MetadataConfig::Postgres { .. } => "postgres",
        }
    }
}

/// Pruning and stale-upload configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Run the scheduled sweeps at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cron expression for the age and capacity sweep.
    #[serde(default = "default_cache_cron")]
    pub cache_cron: String,
    /// Cron expression for the stale-upload sweep.
    #[serde(default = "default_upload_cron")]
    pub upload_cron: String,
    /// Entries not accessed for this many days are evicted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Total committed size budget, e.g. "10GB".
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: String,
    /// Open sessions idle this long are reaped.
    #[serde(default = "default_upload_ttl_secs")]
    pub upload_ttl_secs: u64,
    /// Re-reserving a pending triple within this window returns the same session.
    #[serde(default = "default_reserve_reuse_secs")]
    pub reserve_reuse_secs: u64,
    /// How long a second commit waits for an in-flight one.
    #[serde(default = "default_commit_wait_secs")]
    pub commit_wait_secs: u64,
    /// Rows fetched per sweep page.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_true() -> bool {
    true
}

fn default_cache_cron() -> String {
    "0 0 * * *".to_string()
}

fn default_upload_cron() -> String {
    "*/10 * * * *".to_string()
}

fn default_retention_days() -> u32 {
    90
}

fn default_max_cache_size() -> String {
    "10GB".to_string()
}

fn default_upload_ttl_secs() -> u64 {
    3600
}

fn default_reserve_reuse_secs() -> u64 {
    3600
}

fn default_commit_wait_secs() -> u64 {
    30
}

fn default_batch_size() -> u32 {
    500
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_cron: default_cache_cron(),
            upload_cron: default_upload_cron(),
            retention_days: default_retention_days(),
            max_cache_size: default_max_cache_size(),
            upload_ttl_secs: default_upload_ttl_secs(),
            reserve_reuse_secs: default_reserve_reuse_secs(),
            commit_wait_secs: default_commit_wait_secs(),
            batch_size: default_batch_size(),
        }
    }
}

fn saturating_seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

impl CleanupConfig {
    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }

    pub fn upload_ttl(&self) -> Duration {
        saturating_seconds(self.upload_ttl_secs)
    }

    pub fn reserve_reuse_window(&self) -> Duration {
        saturating_seconds(self.reserve_reuse_secs)
    }

    pub fn commit_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.commit_wait_secs)
    }

    /// Parsed `max_cache_size` in bytes.
    pub fn max_cache_bytes(&self) -> crate::Result<u64> {
        parse_byte_size(&self.max_cache_size)
    }

    pub fn cache_schedule(&self) -> crate::Result<CronSchedule> {
        CronSchedule::parse(&self.cache_cron)
    }

    pub fn upload_schedule(&self) -> crate::Result<CronSchedule> {
        CronSchedule::parse(&self.upload_cron)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.cache_schedule()
            .map_err(|e| format!("cleanup.cache_cron: {e}"))?;
        self.upload_schedule()
            .map_err(|e| format!("cleanup.upload_cron: {e}"))?;
        self.max_cache_bytes()
            .map_err(|e| format!("cleanup.max_cache_size: {e}"))?;
        if self.retention_days == 0 {
            return Err("cleanup.retention_days must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            return Err("cleanup.batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Multi-worker deployment settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Several processes share one metadata store and storage backend.
    #[serde(default)]
    pub enabled: bool,
    /// Tokio worker threads for this process.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: default_workers(),
        }
    }
}

/// Bearer token authentication.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// SHA256 hex of the accepted bearer token.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    #[serde(default)]
    pub token_hash: Option<String>,
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        match self.token_hash.as_deref() {
            None | Some("") => Err("auth.token_hash is required when auth is enabled".to_string()),
            Some(hash) if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) => {
                Err("auth.token_hash must be 64 hex characters".to_string())
            }
            Some(_) => Ok(()),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info,tower_http=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Scheduled sweeps are disabled so tests drive
    /// them explicitly.
    pub fn for_testing() -> Self {
        Self {
            cleanup: CleanupConfig {
                enabled: false,
                ..CleanupConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.cleanup.validate()?;
        self.auth.validate()?;
        if self.cluster.workers == 0 {
            return Err("cluster.workers must be at least 1".to_string());
        }
        if self.server.default_scope.is_empty() {
            return Err("server.default_scope must not be empty".to_string());
        }
        Ok(())
    }
}
