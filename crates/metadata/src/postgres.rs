//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult, map_unique_violation};
use crate::models::*;
use crate::repos::{EntryRepo, PruneJobRepo, ReserveRequest, UploadRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use depot_core::config::PgSslMode;
use depot_core::{EntryKey, EntryState};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters,
    /// so the password can come from its own secret.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements hold one command each.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl EntryRepo for PostgresStore {
    async fn reserve_entry(&self, request: &ReserveRequest<'_>) -> MetadataResult<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            SELECT * FROM cache_entries
            WHERE key = $1 AND version = $2 AND scope = $3 AND state IN ('pending', 'committed')
            FOR UPDATE
            "#,
        )
        .bind(&request.key.key)
        .bind(&request.key.version)
        .bind(&request.key.scope)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(entry) = existing {
            if entry.is_committed() {
                return Ok(ReserveOutcome::Committed(entry));
            }
            let session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE entry_id = $1 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(entry.id)
            .fetch_optional(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(match session {
                Some(session)
                    if session.state == "open" && entry.created_at >= request.reuse_after =>
                {
                    ReserveOutcome::Reused { entry, session }
                }
                _ => ReserveOutcome::InProgress(entry),
            });
        }

        // A racing worker inserting the same triple trips the partial
        // unique index and surfaces as a constraint error.
        let entry = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            INSERT INTO cache_entries (key, version, scope, size_bytes, state, created_at, updated_at, accessed_at)
            VALUES ($1, $2, $3, 0, 'pending', $4, $4, $4)
            RETURNING *
            "#,
        )
        .bind(&request.key.key)
        .bind(&request.key.version)
        .bind(&request.key.scope)
        .bind(request.now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, "entry is already reserved"))?;

        let session = sqlx::query_as::<_, UploadSessionRow>(
            r#"
            INSERT INTO upload_sessions (upload_id, entry_id, state, declared_size, created_at, updated_at)
            VALUES ($1, $2, 'open', $3, $4, $4)
            RETURNING *
            "#,
        )
        .bind(request.upload_id)
        .bind(entry.id)
        .bind(request.declared_size)
        .bind(request.now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReserveOutcome::Created { entry, session })
    }

    async fn get_entry(&self, id: i64) -> MetadataResult<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_committed(&self, key: &EntryKey) -> MetadataResult<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            SELECT * FROM cache_entries
            WHERE key = $1 AND version = $2 AND scope = $3 AND state = 'committed'
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
        let row = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            SELECT * FROM cache_entries
            WHERE scope = $1 AND state = 'committed' AND left(key, length($2)) = $2
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(scope)
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn touch_entry(&self, id: i64, accessed_at: OffsetDateTime) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE cache_entries SET accessed_at = $1 WHERE id = $2 AND state = 'committed'",
        )
        .bind(accessed_at)
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
            UPDATE cache_entries SET state = 'expired', updated_at = $1
            WHERE id = $2 AND state = $3 AND ($4 IS NULL OR accessed_at < $4)
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(expected.as_str())
        .bind(accessed_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_entry(&self, id: i64) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE id = $1 AND state = 'expired'")
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
              AND ($1 IS NULL OR accessed_at > $1 OR (accessed_at = $1 AND id > $2))
              AND ($3 IS NULL OR accessed_at < $3)
              AND ($4 IS NULL OR scope = $4)
            ORDER BY accessed_at ASC, id ASC
            LIMIT $5
            "#,
        )
        .bind(after_at)
        .bind(after_id)
        .bind(accessed_before)
        .bind(scope)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_expired_entries(&self, limit: i64) -> MetadataResult<Vec<CacheEntryRow>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(
            "SELECT * FROM cache_entries WHERE state = 'expired' ORDER BY updated_at ASC, id ASC LIMIT $1",
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
              AND ($1 IS NULL OR key LIKE $1 ESCAPE '\')
              AND ($2 IS NULL OR scope = $2)
              AND ($3 IS NULL OR created_at > $3)
              AND ($4 IS NULL OR created_at < $4)
              AND ($5 IS NULL OR size_bytes >= $5)
              AND ($6 IS NULL OR size_bytes <= $6)
            ORDER BY accessed_at DESC, id DESC
            LIMIT $7
            "#,
        )
        .bind(&query.key_like)
        .bind(&query.scope)
        .bind(query.created_after)
        .bind(query.created_before)
        .bind(query.min_size)
        .bind(query.max_size)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn entry_usage(&self) -> MetadataResult<EntryUsage> {
        let (committed_count, committed_bytes, pending_count): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                CAST(COUNT(*) FILTER (WHERE state = 'committed') AS BIGINT),
                CAST(COALESCE(SUM(size_bytes) FILTER (WHERE state = 'committed'), 0) AS BIGINT),
                CAST(COUNT(*) FILTER (WHERE state = 'pending') AS BIGINT)
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
            "SELECT COUNT(*) FROM cache_entries WHERE state = 'committed' AND accessed_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
        let row =
            sqlx::query_as::<_, UploadSessionRow>("SELECT * FROM upload_sessions WHERE upload_id = $1")
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
            "SELECT * FROM upload_sessions WHERE entry_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn record_chunk(&self, chunk: &UploadChunkRow) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken here orders this write against begin_commit.
        let touched = sqlx::query(
            "UPDATE upload_sessions SET updated_at = $1 WHERE upload_id = $2 AND state = 'open'",
        )
        .bind(chunk.received_at)
        .bind(chunk.upload_id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO upload_chunks (upload_id, byte_offset, chunk_index, byte_length, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (upload_id, byte_offset) DO UPDATE SET
                chunk_index = EXCLUDED.chunk_index,
                byte_length = EXCLUDED.byte_length,
                received_at = EXCLUDED.received_at
            "#,
        )
        .bind(chunk.upload_id)
        .bind(chunk.byte_offset)
        .bind(chunk.chunk_index)
        .bind(chunk.byte_length)
        .bind(chunk.received_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_chunks(&self, upload_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>> {
        let rows = sqlx::query_as::<_, UploadChunkRow>(
            "SELECT * FROM upload_chunks WHERE upload_id = $1 ORDER BY byte_offset ASC",
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
            "SELECT * FROM upload_sessions WHERE upload_id = $1 FOR UPDATE",
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
            "UPDATE upload_sessions SET state = 'committing', updated_at = $1 WHERE upload_id = $2 AND state = 'open'",
        )
        .bind(updated_at)
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

    async fn abort_commit(&self, upload_id: Uuid, updated_at: OffsetDateTime) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET state = 'open', updated_at = $1 WHERE upload_id = $2 AND state = 'committing'",
        )
        .bind(updated_at)
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
            "SELECT * FROM upload_sessions WHERE upload_id = $1 FOR UPDATE",
        )
        .bind(upload_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("upload {upload_id}")))?;

        if session.state != "committing" {
            return Err(MetadataError::InvalidStateTransition {
                from: session.state,
                to: "committed".to_string(),
            });
        }

        sqlx::query(
            "UPDATE upload_sessions SET state = 'committed', updated_at = $1 WHERE upload_id = $2",
        )
        .bind(committed_at)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;

        let published = sqlx::query(
            r#"
            UPDATE cache_entries
            SET state = 'committed', size_bytes = $1, updated_at = $2, accessed_at = $2
            WHERE id = $3 AND state = 'pending'
            "#,
        )
        .bind(size_bytes)
        .bind(committed_at)
        .bind(session.entry_id)
        .execute(&mut *tx)
        .await?;
        if published.rows_affected() == 0 {
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM cache_entries WHERE id = $1")
                    .bind(session.entry_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(MetadataError::InvalidStateTransition {
                from: state.unwrap_or_else(|| "missing".to_string()),
                to: "committed".to_string(),
            });
        }

        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = $1")
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
            WHERE (s.state IN ('open', 'committing') AND s.updated_at < $1)
               OR (s.state = 'abandoned' AND e.state = 'pending')
            ORDER BY s.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(stale_before)
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
            UPDATE upload_sessions SET state = 'abandoned', updated_at = $1
            WHERE upload_id = $2 AND state IN ('open', 'committing') AND updated_at < $3
            "#,
        )
        .bind(now)
        .bind(upload_id)
        .bind(stale_before)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = $1")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl PruneJobRepo for PostgresStore {
    async fn start_prune_job(&self, job: &PruneJobRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO prune_jobs (job_id, job_type, state, started_at, finished_at, stats_json)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.job_type)
        .bind(&job.state)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.stats_json)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("a {} sweep is already running", job.job_type)))?;
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
            UPDATE prune_jobs SET state = $1, finished_at = $2, stats_json = $3
            WHERE job_id = $4 AND state = 'running'
            "#,
        )
        .bind(state.as_str())
        .bind(finished_at)
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
        let row = sqlx::query_as::<_, PruneJobRow>("SELECT * FROM prune_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_recent_prune_jobs(&self, limit: i64) -> MetadataResult<Vec<PruneJobRow>> {
        let rows =
            sqlx::query_as::<_, PruneJobRow>("SELECT * FROM prune_jobs ORDER BY started_at DESC LIMIT $1")
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
            "UPDATE prune_jobs SET state = 'failed', finished_at = $1 WHERE state = 'running' AND started_at < $2",
        )
        .bind(now)
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::{POSTGRES_SCHEMA, postgres_schema_statements};

    #[test]
    fn postgres_schema_statements_skips_empty_and_comment_only() {
        let schema = r#"
            -- comment only

            CREATE TABLE foo (id int);
            ;
            -- another comment
            CREATE TABLE bar (id int);
        "#;

        let statements = postgres_schema_statements(schema);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE foo"));
        assert!(statements[1].contains("CREATE TABLE bar"));
    }

    #[test]
    fn embedded_schema_creates_every_table() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        for table in ["cache_entries", "upload_sessions", "upload_chunks", "prune_jobs"] {
            assert!(
                statements
                    .iter()
                    .any(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {table}"))),
                "missing table {table}"
            );
        }
        assert!(
            statements
                .iter()
                .any(|s| s.contains("idx_cache_entries_live"))
        );
    }
}
