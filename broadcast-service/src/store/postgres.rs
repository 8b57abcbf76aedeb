//! PostgreSQL lifecycle store
//!
//! Conditional updates are optimistic version-token compare-and-swap: load
//! the row, apply the mutation, write back `WHERE id = $1 AND version = $2`.
//! A lost race reloads and re-applies, bounded by `CAS_ATTEMPTS`. Viewer
//! counters are single atomic UPDATE statements and deliberately excluded
//! from the CAS write set so a concurrent counter bump is never clobbered
//! by a stale status write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    CasOutcome, LifecycleStore, RecordingMutator, StoreError, StoreResult, StreamMutator,
    ViewerCounts,
};
use crate::models::{Recording, RecordingStatus, Stream, StreamStatus, ViewerSession};

const CAS_ATTEMPTS: usize = 3;

const STREAM_COLUMNS: &str = "id, creator_id, provider_stream_id, credential, title, visibility, \
     mode, status, playback_url, current_viewers, peak_viewers, total_unique_viewers, suspended, \
     started_at, ended_at, version, created_at, updated_at";

const RECORDING_COLUMNS: &str = "id, stream_id, creator_id, provider_asset_id, source_session_id, \
     title, visibility, status, playback_url, duration_seconds, size_bytes, resolution, \
     view_count, unique_viewer_count, peak_live_viewers, failure_reason, hidden, ready_at, \
     version, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, stream_id, viewer_id, joined_at, last_seen_at, left_at";

#[derive(Clone)]
pub struct PgLifecycleStore {
    pool: PgPool,
}

impl PgLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, then bring the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    async fn write_stream(&self, stream: &Stream, expected_version: i64) -> StoreResult<bool> {
        let query = "UPDATE streams SET provider_stream_id = $3, credential = $4, title = $5, \
             visibility = $6, mode = $7, status = $8, playback_url = $9, suspended = $10, \
             started_at = $11, ended_at = $12, version = $13, updated_at = $14 \
             WHERE id = $1 AND version = $2";
        let result = sqlx::query(query)
            .bind(stream.id)
            .bind(expected_version)
            .bind(&stream.provider_stream_id)
            .bind(&stream.credential)
            .bind(&stream.title)
            .bind(stream.visibility)
            .bind(stream.mode)
            .bind(stream.status)
            .bind(&stream.playback_url)
            .bind(stream.suspended)
            .bind(stream.started_at)
            .bind(stream.ended_at)
            .bind(stream.version)
            .bind(stream.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn write_recording(&self, rec: &Recording, expected_version: i64) -> StoreResult<bool> {
        let query = "UPDATE recordings SET stream_id = $3, creator_id = $4, \
             provider_asset_id = $5, source_session_id = $6, title = $7, visibility = $8, \
             status = $9, playback_url = $10, duration_seconds = $11, size_bytes = $12, \
             resolution = $13, peak_live_viewers = $14, failure_reason = $15, hidden = $16, \
             ready_at = $17, version = $18, updated_at = $19 \
             WHERE id = $1 AND version = $2";
        let result = sqlx::query(query)
            .bind(rec.id)
            .bind(expected_version)
            .bind(rec.stream_id)
            .bind(rec.creator_id)
            .bind(&rec.provider_asset_id)
            .bind(&rec.source_session_id)
            .bind(&rec.title)
            .bind(rec.visibility)
            .bind(rec.status)
            .bind(&rec.playback_url)
            .bind(rec.duration_seconds)
            .bind(rec.size_bytes)
            .bind(&rec.resolution)
            .bind(rec.peak_live_viewers)
            .bind(&rec.failure_reason)
            .bind(rec.hidden)
            .bind(rec.ready_at)
            .bind(rec.version)
            .bind(rec.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LifecycleStore for PgLifecycleStore {
    async fn insert_stream(&self, stream: Stream) -> StoreResult<Stream> {
        let query = format!(
            "INSERT INTO streams ({STREAM_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        );
        sqlx::query(&query)
            .bind(stream.id)
            .bind(stream.creator_id)
            .bind(&stream.provider_stream_id)
            .bind(&stream.credential)
            .bind(&stream.title)
            .bind(stream.visibility)
            .bind(stream.mode)
            .bind(stream.status)
            .bind(&stream.playback_url)
            .bind(stream.current_viewers)
            .bind(stream.peak_viewers)
            .bind(stream.total_unique_viewers)
            .bind(stream.suspended)
            .bind(stream.started_at)
            .bind(stream.ended_at)
            .bind(stream.version)
            .bind(stream.created_at)
            .bind(stream.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(stream)
    }

    async fn stream(&self, id: Uuid) -> StoreResult<Option<Stream>> {
        let query = format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = $1");
        sqlx::query_as::<_, Stream>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn stream_by_provider_id(&self, provider_id: &str) -> StoreResult<Option<Stream>> {
        let query = format!("SELECT {STREAM_COLUMNS} FROM streams WHERE provider_stream_id = $1");
        sqlx::query_as::<_, Stream>(&query)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn stream_by_credential(&self, credential: &str) -> StoreResult<Option<Stream>> {
        let query = format!("SELECT {STREAM_COLUMNS} FROM streams WHERE credential = $1");
        sqlx::query_as::<_, Stream>(&query)
            .bind(credential)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn active_stream_for_creator(&self, creator_id: Uuid) -> StoreResult<Option<Stream>> {
        let query = format!(
            "SELECT {STREAM_COLUMNS} FROM streams \
             WHERE creator_id = $1 AND status <> 'ended' LIMIT 1"
        );
        sqlx::query_as::<_, Stream>(&query)
            .bind(creator_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn live_streams(&self, limit: i64) -> StoreResult<Vec<Stream>> {
        let query = format!(
            "SELECT {STREAM_COLUMNS} FROM streams WHERE status = 'live' \
             ORDER BY started_at DESC NULLS LAST LIMIT $1"
        );
        sqlx::query_as::<_, Stream>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn update_stream_if_status(
        &self,
        id: Uuid,
        expected: &[StreamStatus],
        mutate: StreamMutator,
    ) -> StoreResult<Option<CasOutcome<Stream>>> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut current) = self.stream(id).await? else {
                return Ok(None);
            };
            if !expected.contains(&current.status) {
                return Ok(Some(CasOutcome::Stale(current)));
            }

            let held_version = current.version;
            mutate(&mut current);
            current.version = held_version + 1;
            current.updated_at = Utc::now();

            if self.write_stream(&current, held_version).await? {
                return Ok(Some(CasOutcome::Applied(current)));
            }
            // lost the version race, reload and retry
        }
        Err(StoreError::Transient(format!(
            "stream {id} exceeded {CAS_ATTEMPTS} compare-and-swap attempts"
        )))
    }

    async fn insert_recording(&self, recording: Recording) -> StoreResult<Recording> {
        let query = format!(
            "INSERT INTO recordings ({RECORDING_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20, $21)"
        );
        sqlx::query(&query)
            .bind(recording.id)
            .bind(recording.stream_id)
            .bind(recording.creator_id)
            .bind(&recording.provider_asset_id)
            .bind(&recording.source_session_id)
            .bind(&recording.title)
            .bind(recording.visibility)
            .bind(recording.status)
            .bind(&recording.playback_url)
            .bind(recording.duration_seconds)
            .bind(recording.size_bytes)
            .bind(&recording.resolution)
            .bind(recording.view_count)
            .bind(recording.unique_viewer_count)
            .bind(recording.peak_live_viewers)
            .bind(&recording.failure_reason)
            .bind(recording.hidden)
            .bind(recording.ready_at)
            .bind(recording.version)
            .bind(recording.created_at)
            .bind(recording.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(recording)
    }

    async fn recording(&self, id: Uuid) -> StoreResult<Option<Recording>> {
        let query = format!("SELECT {RECORDING_COLUMNS} FROM recordings WHERE id = $1");
        sqlx::query_as::<_, Recording>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn recording_by_provider_asset(&self, asset_id: &str) -> StoreResult<Option<Recording>> {
        let query =
            format!("SELECT {RECORDING_COLUMNS} FROM recordings WHERE provider_asset_id = $1");
        sqlx::query_as::<_, Recording>(&query)
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn recording_for_stream(&self, stream_id: Uuid) -> StoreResult<Option<Recording>> {
        let query = format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings WHERE stream_id = $1 \
             ORDER BY created_at ASC LIMIT 1"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn recordings_for_creator(&self, creator_id: Uuid) -> StoreResult<Vec<Recording>> {
        let query = format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings \
             WHERE creator_id = $1 AND status <> 'deleted' ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(creator_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn recordings_in_status(
        &self,
        statuses: &[RecordingStatus],
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Recording>> {
        let labels: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let query = format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings \
             WHERE status = ANY($1) AND created_at >= $2 \
             ORDER BY created_at DESC LIMIT $3"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(labels)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn unresolved_orphans(&self, limit: i64) -> StoreResult<Vec<Recording>> {
        let query = format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings \
             WHERE creator_id IS NULL AND status <> 'deleted' \
             ORDER BY created_at DESC LIMIT $1"
        );
        sqlx::query_as::<_, Recording>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn update_recording_if_status(
        &self,
        id: Uuid,
        expected: &[RecordingStatus],
        mutate: RecordingMutator,
    ) -> StoreResult<Option<CasOutcome<Recording>>> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut current) = self.recording(id).await? else {
                return Ok(None);
            };
            if !expected.contains(&current.status) {
                return Ok(Some(CasOutcome::Stale(current)));
            }

            let held_version = current.version;
            mutate(&mut current);
            current.version = held_version + 1;
            current.updated_at = Utc::now();

            if self.write_recording(&current, held_version).await? {
                return Ok(Some(CasOutcome::Applied(current)));
            }
        }
        Err(StoreError::Transient(format!(
            "recording {id} exceeded {CAS_ATTEMPTS} compare-and-swap attempts"
        )))
    }

    async fn viewer_joined(
        &self,
        stream_id: Uuid,
        unique_key: &str,
    ) -> StoreResult<Option<ViewerCounts>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let row: Option<(i32, i32, i64)> = sqlx::query_as(
            "UPDATE streams SET current_viewers = current_viewers + 1, \
             peak_viewers = GREATEST(peak_viewers, current_viewers + 1), updated_at = NOW() \
             WHERE id = $1 \
             RETURNING current_viewers, peak_viewers, total_unique_viewers",
        )
        .bind(stream_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some((current, peak, mut total_unique)) = row else {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(None);
        };

        let inserted = sqlx::query(
            "INSERT INTO stream_viewers (stream_id, viewer_key) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(stream_id)
        .bind(unique_key)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if inserted.rows_affected() == 1 {
            let (unique,): (i64,) = sqlx::query_as(
                "UPDATE streams SET total_unique_viewers = total_unique_viewers + 1 \
                 WHERE id = $1 RETURNING total_unique_viewers",
            )
            .bind(stream_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            total_unique = unique;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(Some(ViewerCounts {
            current,
            peak,
            total_unique,
        }))
    }

    async fn viewer_left(&self, stream_id: Uuid) -> StoreResult<Option<ViewerCounts>> {
        let row: Option<(i32, i32, i64)> = sqlx::query_as(
            "UPDATE streams SET current_viewers = GREATEST(current_viewers - 1, 0), \
             updated_at = NOW() WHERE id = $1 \
             RETURNING current_viewers, peak_viewers, total_unique_viewers",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(|(current, peak, total_unique)| ViewerCounts {
            current,
            peak,
            total_unique,
        }))
    }

    async fn record_recording_view(
        &self,
        recording_id: Uuid,
        unique_key: Option<&str>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let touched = sqlx::query(
            "UPDATE recordings SET view_count = view_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(recording_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if touched.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(());
        }

        if let Some(key) = unique_key {
            let inserted = sqlx::query(
                "INSERT INTO recording_viewers (recording_id, viewer_key) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(recording_id)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if inserted.rows_affected() == 1 {
                sqlx::query(
                    "UPDATE recordings SET unique_viewer_count = unique_viewer_count + 1 \
                     WHERE id = $1",
                )
                .bind(recording_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_session(&self, session: ViewerSession) -> StoreResult<ViewerSession> {
        let query = format!(
            "INSERT INTO viewer_sessions ({SESSION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        );
        sqlx::query(&query)
            .bind(session.id)
            .bind(session.stream_id)
            .bind(session.viewer_id)
            .bind(session.joined_at)
            .bind(session.last_seen_at)
            .bind(session.left_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(session)
    }

    async fn close_session(
        &self,
        session_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> StoreResult<Option<ViewerSession>> {
        let query = format!(
            "UPDATE viewer_sessions SET left_at = $2 \
             WHERE id = $1 AND left_at IS NULL RETURNING {SESSION_COLUMNS}"
        );
        sqlx::query_as::<_, ViewerSession>(&query)
            .bind(session_id)
            .bind(left_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn touch_session(&self, session_id: Uuid, seen_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE viewer_sessions SET last_seen_at = $2 WHERE id = $1 AND left_at IS NULL",
        )
        .bind(session_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn sessions_idle_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ViewerSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM viewer_sessions \
             WHERE left_at IS NULL AND last_seen_at < $1"
        );
        sqlx::query_as::<_, ViewerSession>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
            field: "unique constraint",
            value: db.constraint().unwrap_or("unknown").to_string(),
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Other(anyhow::Error::new(err)),
    }
}
