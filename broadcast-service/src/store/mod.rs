//! Lifecycle store: durable, versioned Stream/Recording records
//!
//! The store is the single shared mutable resource. Every status transition
//! goes through a conditional update guarded by the expected prior status,
//! so racing webhook deliveries serialize per entity without a global lock.
//! Viewer counters move only through dedicated atomic operations, never
//! read-then-write.
//!
//! Two implementations: [`postgres::PgLifecycleStore`] (optimistic
//! version-token compare-and-swap) and [`memory::MemoryLifecycleStore`]
//! (per-entry locked mutation; local development and tests).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Recording, RecordingStatus, Stream, StreamStatus, ViewerSession};

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {field}: {value}")]
    Duplicate {
        field: &'static str,
        value: String,
    },

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a conditional update.
///
/// `Stale` means the record's current status matched none of the expected
/// statuses; the record is returned untouched. Callers treat this as
/// "already handled", never as an error.
#[derive(Debug)]
pub enum CasOutcome<T> {
    Applied(T),
    Stale(T),
}

impl<T> CasOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            CasOutcome::Applied(v) | CasOutcome::Stale(v) => v,
        }
    }
}

/// Mutations passed to conditional updates.
///
/// `Fn` (not `FnOnce`) because the Postgres implementation re-applies the
/// mutation when its version-token write loses a race and retries. Mutators
/// must not touch viewer counters; those move only through the atomic
/// counter operations below.
pub type StreamMutator = Box<dyn Fn(&mut Stream) + Send + Sync>;
pub type RecordingMutator = Box<dyn Fn(&mut Recording) + Send + Sync>;

/// Snapshot of a stream's viewer counters after an atomic counter op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerCounts {
    pub current: i32,
    pub peak: i32,
    pub total_unique: i64,
}

#[async_trait]
pub trait LifecycleStore: Send + Sync {
    // ---- streams ----

    /// Insert a new stream. Fails with `Duplicate` if the credential or
    /// provider stream id is already taken.
    async fn insert_stream(&self, stream: Stream) -> StoreResult<Stream>;

    async fn stream(&self, id: Uuid) -> StoreResult<Option<Stream>>;

    async fn stream_by_provider_id(&self, provider_id: &str) -> StoreResult<Option<Stream>>;

    async fn stream_by_credential(&self, credential: &str) -> StoreResult<Option<Stream>>;

    /// The creator's single non-ended stream, if any.
    async fn active_stream_for_creator(&self, creator_id: Uuid) -> StoreResult<Option<Stream>>;

    /// Currently-live streams, most recently started first.
    async fn live_streams(&self, limit: i64) -> StoreResult<Vec<Stream>>;

    /// Conditionally mutate a stream: the mutation is applied only when the
    /// current status is one of `expected`. Returns `None` when the stream
    /// does not exist.
    async fn update_stream_if_status(
        &self,
        id: Uuid,
        expected: &[StreamStatus],
        mutate: StreamMutator,
    ) -> StoreResult<Option<CasOutcome<Stream>>>;

    // ---- recordings ----

    /// Insert a new recording. Fails with `Duplicate` when another recording
    /// already carries the same provider asset id, which is what makes
    /// orphan creation safe under concurrent redelivery.
    async fn insert_recording(&self, recording: Recording) -> StoreResult<Recording>;

    async fn recording(&self, id: Uuid) -> StoreResult<Option<Recording>>;

    async fn recording_by_provider_asset(&self, asset_id: &str) -> StoreResult<Option<Recording>>;

    /// The recording created for a stream at stream-end, if any.
    async fn recording_for_stream(&self, stream_id: Uuid) -> StoreResult<Option<Recording>>;

    async fn recordings_for_creator(&self, creator_id: Uuid) -> StoreResult<Vec<Recording>>;

    /// Recordings in any of `statuses` created at or after `cutoff`,
    /// most recent first, bounded by `limit`. Backs the title-match
    /// fallback's bounded scan window.
    async fn recordings_in_status(
        &self,
        statuses: &[RecordingStatus],
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Recording>>;

    /// Orphan recordings (no creator) awaiting re-match.
    async fn unresolved_orphans(&self, limit: i64) -> StoreResult<Vec<Recording>>;

    async fn update_recording_if_status(
        &self,
        id: Uuid,
        expected: &[RecordingStatus],
        mutate: RecordingMutator,
    ) -> StoreResult<Option<CasOutcome<Recording>>>;

    // ---- viewer counters (atomic, never read-then-write) ----

    /// Register a join as one atomic operation: current+1, peak raised if
    /// exceeded, total-unique+1 on first sight of `unique_key`. Returns
    /// `None` when the stream does not exist.
    async fn viewer_joined(
        &self,
        stream_id: Uuid,
        unique_key: &str,
    ) -> StoreResult<Option<ViewerCounts>>;

    /// Register a leave: current−1, floored at zero.
    async fn viewer_left(&self, stream_id: Uuid) -> StoreResult<Option<ViewerCounts>>;

    /// Count a recording view, deduplicating uniques by `unique_key` when
    /// one is available.
    async fn record_recording_view(
        &self,
        recording_id: Uuid,
        unique_key: Option<&str>,
    ) -> StoreResult<()>;

    // ---- viewer sessions ----

    async fn insert_session(&self, session: ViewerSession) -> StoreResult<ViewerSession>;

    /// Close a session exactly once: returns the session on the first close,
    /// `None` when it is unknown or already closed.
    async fn close_session(
        &self,
        session_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> StoreResult<Option<ViewerSession>>;

    /// Refresh a session's liveness. `false` when unknown or already closed.
    async fn touch_session(&self, session_id: Uuid, seen_at: DateTime<Utc>) -> StoreResult<bool>;

    /// Open sessions whose `last_seen_at` is older than `cutoff`.
    async fn sessions_idle_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ViewerSession>>;
}
