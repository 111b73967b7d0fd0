//! Metadata store trait and implementations.

use crate::error::{MetadataError, MetadataResult, map_unique_violation};
use crate::repos::{EntryRepo, PruneJobRepo, ReserveRequest, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: EntryRepo + UploadRepo + PruneJobRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Name of the database driver, for metrics and logging.
    fn driver_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let mut pool_opts = SqlitePoolOptions::new()
            // One connection serializes writers; every state transition runs
            // inside a transaction on it.
            .max_connections(1);
        if let Some(secs) = query_timeout_secs {
            pool_opts = pool_opts.acquire_timeout(Duration::from_secs(secs));
        }
        let pool = pool_opts.connect_with(opts).await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = ?query_timeout_secs,
            "SQLite metadata store ready"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Encode a timestamp for a TEXT column.
///
/// Always UTC with nine fractional digits, so string order is time order.
/// Plain RFC 3339 trims trailing zeros and would sort `12:00:00Z` after
/// `12:00:00.5Z`.
pub(crate) fn ts(at: OffsetDateTime) -> String {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
    );
    at.to_offset(UtcOffset::UTC)
        .format(format)
        .unwrap_or_else(|_| at.to_string())
}

/// SQLite schema. Timestamp columns hold [`ts`] text.
const SCHEMA_SQL: &str = r#"
-- Cache entries, one row per reservation
CREATE TABLE IF NOT EXISTS cache_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    version TEXT NOT NULL,
    scope TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL CHECK (state IN ('pending', 'committed', 'expired')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    accessed_at TEXT NOT NULL
);

-- At most one live entry per triple; expired rows do not hold the key
CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_entries_live
    ON cache_entries(key, version, scope)
    WHERE state IN ('pending', 'committed');

CREATE INDEX IF NOT EXISTS idx_cache_entries_scope_key ON cache_entries(scope, key);
CREATE INDEX IF NOT EXISTS idx_cache_entries_state_accessed ON cache_entries(state, accessed_at, id);

-- Upload sessions, created together with their entry
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id BLOB PRIMARY KEY,
    entry_id INTEGER NOT NULL REFERENCES cache_entries(id) ON DELETE CASCADE,
    state TEXT NOT NULL CHECK (state IN ('open', 'committing', 'committed', 'abandoned')),
    declared_size INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_entry ON upload_sessions(entry_id);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state, updated_at);

-- Received chunks; a resent offset replaces its row
CREATE TABLE IF NOT EXISTS upload_chunks (
    upload_id BLOB NOT NULL REFERENCES upload_sessions(upload_id) ON DELETE CASCADE,
    byte_offset INTEGER NOT NULL,
    chunk_index INTEGER NOT NULL,
    byte_length INTEGER NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (upload_id, byte_offset)
);

-- Sweep runs
CREATE TABLE IF NOT EXISTS prune_jobs (
    job_id BLOB PRIMARY KEY,
    job_type TEXT NOT NULL,
    state TEXT NOT NULL CHECK (state IN ('running', 'finished', 'failed')),
    started_at TEXT NOT NULL,
    finished_at TEXT,
    stats_json TEXT
);

-- One running job per type across all workers
CREATE UNIQUE INDEX IF NOT EXISTS idx_prune_jobs_running
    ON prune_jobs(job_type)
    WHERE state = 'running';

CREATE INDEX IF NOT EXISTS idx_prune_jobs_started ON prune_jobs(started_at);
"#;

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use depot_core::{EntryKey, EntryState};
    use time::OffsetDateTime;
    use uuid::Uuid;

    impl SqliteStore {
        /// Classify the live row that made a reservation insert fail.
        ///
        /// Runs inside the failed insert's transaction, which still holds the
        /// write lock. A row that vanished in between is reported as a
        /// constraint error so the caller retries.
        async fn existing_reservation(
            &self,
            tx: &mut sqlx::Transaction<'_, Sqlite>,
            request: &ReserveRequest<'_>,
            message: String,
        ) -> MetadataResult<ReserveOutcome> {
            let existing = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE key = ? AND version = ? AND scope = ? AND state IN ('pending', 'committed')
                "#,
            )
            .bind(&request.key.key)
            .bind(&request.key.version)
            .bind(&request.key.scope)
            .fetch_optional(&mut **tx)
            .await?;

            let Some(entry) = existing else {
                return Err(MetadataError::Constraint(message));
            };
            if entry.is_committed() {
                return Ok(ReserveOutcome::Committed(entry));
            }

            let session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE entry_id = ? ORDER BY created_at DESC LIMIT 1",
            )
            .bind(entry.id)
            .fetch_optional(&mut **tx)
            .await?;

            Ok(match session {
                Some(session)
                    if session.state == "open" && entry.created_at >= request.reuse_after =>
                {
                    ReserveOutcome::Reused { entry, session }
                }
                _ => ReserveOutcome::InProgress(entry),
            })
        }
    }

    #[async_trait]
    impl EntryRepo for SqliteStore {
        async fn reserve_entry(
            &self,
            request: &ReserveRequest<'_>,
        ) -> MetadataResult<ReserveOutcome> {
            let mut tx = self.pool.begin().await?;

            // The insert goes first so the transaction holds the write lock
            // before it reads. A worker in another process then waits on the
            // busy timeout and sees the winner's row, instead of failing to
            // upgrade a read lock.
            let inserted = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                INSERT INTO cache_entries (key, version, scope, size_bytes, state, created_at, updated_at, accessed_at)
                VALUES (?, ?, ?, 0, 'pending', ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(&request.key.key)
            .bind(&request.key.version)
            .bind(&request.key.scope)
            .bind(ts(request.now))
            .bind(ts(request.now))
            .bind(ts(request.now))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, "entry is already reserved"));

            let entry = match inserted {
                Ok(entry) => entry,
                Err(MetadataError::Constraint(message)) => {
                    return self.existing_reservation(&mut tx, request, message).await;
                }
                Err(e) => return Err(e),
            };

            let session = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                INSERT INTO upload_sessions (upload_id, entry_id, state, declared_size, created_at, updated_at)
                VALUES (?, ?, 'open', ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(request.upload_id)
            .bind(entry.id)
            .bind(request.declared_size)
            .bind(ts(request.now))
            .bind(ts(request.now))
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(ReserveOutcome::Created { entry, session })
        }

        async fn get_entry(&self, id: i64) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn find_committed(&self, key: &EntryKey) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE key = ? AND version = ? AND scope = ? AND state = 'committed'
                "#,
            )
            .bind(&key.key)
            .bind(&key.version)
            .bind(&key.scope)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_committed_by_prefix(
            &self,
            scope: &str,
            prefix: &str,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            // substr keeps the match literal and case-sensitive, unlike LIKE.
            let row = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE scope = ? AND state = 'committed' AND substr(key, 1, length(?)) = ?
                ORDER BY updated_at DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(scope)
            .bind(prefix)
            .bind(prefix)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn touch_entry(&self, id: i64, accessed_at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE cache_entries SET accessed_at = ? WHERE id = ? AND state = 'committed'",
            )
            .bind(ts(accessed_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn expire_entry(
            &self,
            id: i64,
            expected: EntryState,
            accessed_before: Option<OffsetDateTime>,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE cache_entries SET state = 'expired', updated_at = ?
                WHERE id = ? AND state = ? AND (? IS NULL OR accessed_at < ?)
                "#,
            )
            .bind(ts(now))
            .bind(id)
            .bind(expected.as_str())
            .bind(accessed_before.map(ts))
            .bind(accessed_before.map(ts))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_expired_entry(&self, id: i64) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM cache_entries WHERE id = ? AND state = 'expired'")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_entries_by_access(
            &self,
            after: Option<(OffsetDateTime, i64)>,
            accessed_before: Option<OffsetDateTime>,
            scope: Option<&str>,
            limit: i64,
        ) -> MetadataResult<Vec<CacheEntryRow>> {
            let (after_at, after_id) = after.unzip();
            let rows = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE state = 'committed'
                  AND (? IS NULL OR accessed_at > ? OR (accessed_at = ? AND id > ?))
                  AND (? IS NULL OR accessed_at < ?)
                  AND (? IS NULL OR scope = ?)
                ORDER BY accessed_at ASC, id ASC
                LIMIT ?
                "#,
            )
            .bind(after_at.map(ts))
            .bind(after_at.map(ts))
            .bind(after_at.map(ts))
            .bind(after_id)
            .bind(accessed_before.map(ts))
            .bind(accessed_before.map(ts))
            .bind(scope)
            .bind(scope)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_expired_entries(&self, limit: i64) -> MetadataResult<Vec<CacheEntryRow>> {
            let rows = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE state = 'expired' ORDER BY updated_at ASC, id ASC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn query_entries(&self, query: &EntryQuery) -> MetadataResult<Vec<CacheEntryRow>> {
            let rows = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE state = 'committed'
                  AND (? IS NULL OR key LIKE ? ESCAPE '\')
                  AND (? IS NULL OR scope = ?)
                  AND (? IS NULL OR created_at > ?)
                  AND (? IS NULL OR created_at < ?)
                  AND (? IS NULL OR size_bytes >= ?)
                  AND (? IS NULL OR size_bytes <= ?)
                ORDER BY accessed_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(&query.key_like)
            .bind(&query.key_like)
            .bind(&query.scope)
            .bind(&query.scope)
            .bind(query.created_after.map(ts))
            .bind(query.created_after.map(ts))
            .bind(query.created_before.map(ts))
            .bind(query.created_before.map(ts))
            .bind(query.min_size)
            .bind(query.min_size)
            .bind(query.max_size)
            .bind(query.max_size)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn entry_usage(&self) -> MetadataResult<EntryUsage> {
            let (committed_count, committed_bytes, pending_count): (i64, i64, i64) =
                sqlx::query_as(
                    r#"
                    SELECT
                        CAST(COALESCE(SUM(CASE WHEN state = 'committed' THEN 1 ELSE 0 END), 0) AS BIGINT),
                        CAST(COALESCE(SUM(CASE WHEN state = 'committed' THEN size_bytes ELSE 0 END), 0) AS BIGINT),
                        CAST(COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0) AS BIGINT)
                    FROM cache_entries
                    "#,
                )
                .fetch_one(&self.pool)
                .await?;
            Ok(EntryUsage {
                committed_count,
                committed_bytes,
                pending_count,
            })
        }

        async fn count_accessed_since(&self, since: OffsetDateTime) -> MetadataResult<i64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM cache_entries WHERE state = 'committed' AND accessed_at >= ?",
            )
            .bind(ts(since))
            .fetch_one(&self.pool)
            .await?;
            Ok(count)
        }
    }

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_session_for_entry(
            &self,
            entry_id: i64,
        ) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE entry_id = ? ORDER BY created_at DESC LIMIT 1",
            )
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn record_chunk(&self, chunk: &UploadChunkRow) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            // Touching the session first locks it against a concurrent commit.
            let touched = sqlx::query(
                "UPDATE upload_sessions SET updated_at = ? WHERE upload_id = ? AND state = 'open'",
            )
            .bind(ts(chunk.received_at))
            .bind(chunk.upload_id)
            .execute(&mut *tx)
            .await?;
            if touched.rows_affected() == 0 {
                return Ok(false);
            }

            sqlx::query(
                r#"
                INSERT INTO upload_chunks (upload_id, byte_offset, chunk_index, byte_length, received_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(upload_id, byte_offset) DO UPDATE SET
                    chunk_index = excluded.chunk_index,
                    byte_length = excluded.byte_length,
                    received_at = excluded.received_at
                "#,
            )
            .bind(chunk.upload_id)
            .bind(chunk.byte_offset)
            .bind(chunk.chunk_index)
            .bind(chunk.byte_length)
            .bind(ts(chunk.received_at))
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(true)
        }

        async fn list_chunks(&self, upload_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>> {
            let rows = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE upload_id = ? ORDER BY byte_offset ASC",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn begin_commit(
            &self,
            upload_id: Uuid,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<Option<CommitClaim>> {
            let mut tx = self.pool.begin().await?;

            let session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(mut session) = session else {
                return Ok(None);
            };
            if session.state != "open" {
                return Ok(Some(CommitClaim::Unavailable(session)));
            }

            let result = sqlx::query(
                "UPDATE upload_sessions SET state = 'committing', updated_at = ? WHERE upload_id = ? AND state = 'open'",
            )
            .bind(ts(updated_at))
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            if result.rows_affected() == 0 {
                return Ok(Some(CommitClaim::Unavailable(session)));
            }
            session.state = "committing".to_string();
            session.updated_at = updated_at;
            Ok(Some(CommitClaim::Claimed(session)))
        }

        async fn abort_commit(
            &self,
            upload_id: Uuid,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET state = 'open', updated_at = ? WHERE upload_id = ? AND state = 'committing'",
            )
            .bind(ts(updated_at))
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn complete_commit(
            &self,
            upload_id: Uuid,
            size_bytes: i64,
            committed_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("upload {upload_id}")))?;

            let moved = sqlx::query(
                "UPDATE upload_sessions SET state = 'committed', updated_at = ? WHERE upload_id = ? AND state = 'committing'",
            )
            .bind(ts(committed_at))
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
            if moved.rows_affected() == 0 {
                return Err(MetadataError::InvalidStateTransition {
                    from: session.state,
                    to: "committed".to_string(),
                });
            }

            let published = sqlx::query(
                r#"
                UPDATE cache_entries
                SET state = 'committed', size_bytes = ?, updated_at = ?, accessed_at = ?
                WHERE id = ? AND state = 'pending'
                "#,
            )
            .bind(size_bytes)
            .bind(ts(committed_at))
            .bind(ts(committed_at))
            .bind(session.entry_id)
            .execute(&mut *tx)
            .await?;
            if published.rows_affected() == 0 {
                let state: Option<String> =
                    sqlx::query_scalar("SELECT state FROM cache_entries WHERE id = ?")
                        .bind(session.entry_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                return Err(MetadataError::InvalidStateTransition {
                    from: state.unwrap_or_else(|| "missing".to_string()),
                    to: "committed".to_string(),
                });
            }

            sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn list_stale_sessions(
            &self,
            stale_before: OffsetDateTime,
            limit: i64,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                SELECT s.* FROM upload_sessions s
                JOIN cache_entries e ON e.id = s.entry_id
                WHERE (s.state IN ('open', 'committing') AND s.updated_at < ?)
                   OR (s.state = 'abandoned' AND e.state = 'pending')
                ORDER BY s.updated_at ASC
                LIMIT ?
                "#,
            )
            .bind(ts(stale_before))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn abandon_session(
            &self,
            upload_id: Uuid,
            stale_before: OffsetDateTime,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE upload_sessions SET state = 'abandoned', updated_at = ?
                WHERE upload_id = ? AND state IN ('open', 'committing') AND updated_at < ?
                "#,
            )
            .bind(ts(now))
            .bind(upload_id)
            .bind(ts(stale_before))
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Ok(false);
            }

            sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(true)
        }
    }

    #[async_trait]
    impl PruneJobRepo for SqliteStore {
        async fn start_prune_job(&self, job: &PruneJobRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO prune_jobs (job_id, job_type, state, started_at, finished_at, stats_json)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.job_id)
            .bind(&job.job_type)
            .bind(&job.state)
            .bind(ts(job.started_at))
            .bind(job.finished_at.map(ts))
            .bind(&job.stats_json)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique_violation(e, &format!("a {} sweep is already running", job.job_type))
            })?;
            Ok(())
        }

        async fn finish_prune_job(
            &self,
            job_id: Uuid,
            state: JobState,
            finished_at: OffsetDateTime,
            stats_json: Option<&str>,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE prune_jobs SET state = ?, finished_at = ?, stats_json = ?
                WHERE job_id = ? AND state = 'running'
                "#,
            )
            .bind(state.as_str())
            .bind(ts(finished_at))
            .bind(stats_json)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("running prune job {job_id}")));
            }
            Ok(())
        }

        async fn get_prune_job(&self, job_id: Uuid) -> MetadataResult<Option<PruneJobRow>> {
            let row = sqlx::query_as::<_, PruneJobRow>("SELECT * FROM prune_jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_recent_prune_jobs(&self, limit: i64) -> MetadataResult<Vec<PruneJobRow>> {
            let rows = sqlx::query_as::<_, PruneJobRow>(
                "SELECT * FROM prune_jobs ORDER BY started_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn fail_stale_prune_jobs(
            &self,
            started_before: OffsetDateTime,
            now: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                r#"
                UPDATE prune_jobs SET state = 'failed', finished_at = ?
                WHERE state = 'running' AND started_at < ?
                "#,
            )
            .bind(ts(now))
            .bind(ts(started_before))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}
