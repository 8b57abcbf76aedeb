//! Data models for the broadcast service
//!
//! This module defines structures for:
//! - Stream: a creator broadcast and its lifecycle state
//! - Recording: the archived asset produced from an ended stream
//! - ViewerSession: one viewer's attendance on a live stream
//! - Request/response DTOs for the HTTP surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ========================================
// Stream
// ========================================

/// Stream lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Configuring,
    Live,
    Ended,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }
}

/// Who may watch a stream or recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Members,
    Private,
}

/// Broadcast content mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    Video,
    AudioOnly,
    Avatar,
}

/// Stream database entity
///
/// Status and playback URL are mutated only through the reconciliation
/// engine; viewer counters only through the store's atomic counter ops.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Stream {
    pub id: Uuid,
    pub creator_id: Uuid,
    /// Provider-assigned id, set once the provider confirms provisioning.
    pub provider_stream_id: Option<String>,
    /// Secret ingest credential. Never serialized into viewer responses.
    #[serde(skip_serializing)]
    pub credential: String,
    pub title: String,
    pub visibility: Visibility,
    pub mode: ContentMode,
    pub status: StreamStatus,
    pub playback_url: Option<String>,
    pub current_viewers: i32,
    pub peak_viewers: i32,
    pub total_unique_viewers: i64,
    pub suspended: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every conditional update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    pub fn is_active(&self) -> bool {
        self.status != StreamStatus::Ended
    }

    /// Seconds spent live, known only once both timestamps are set.
    pub fn live_duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => Some((ended - started).num_seconds().max(0)),
            _ => None,
        }
    }
}

// ========================================
// Recording
// ========================================

/// Recording lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Pending,
    Processing,
    Ready,
    Failed,
    Deleted,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

/// Recording database entity
///
/// `stream_id`/`creator_id` are `None` for orphans created from asset
/// events that matched nothing; the re-match sweep may attach them later.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recording {
    pub id: Uuid,
    pub stream_id: Option<Uuid>,
    pub creator_id: Option<Uuid>,
    pub provider_asset_id: Option<String>,
    /// Provider live-session id carried on the asset payload, kept so
    /// unresolved orphans can still be attached once the stream is known.
    pub source_session_id: Option<String>,
    pub title: String,
    pub visibility: Visibility,
    pub status: RecordingStatus,
    pub playback_url: Option<String>,
    pub duration_seconds: Option<i32>,
    pub size_bytes: Option<i64>,
    pub resolution: Option<String>,
    pub view_count: i64,
    pub unique_viewer_count: i64,
    /// Peak concurrent viewers copied from the source stream at creation.
    pub peak_live_viewers: i32,
    pub failure_reason: Option<String>,
    pub hidden: bool,
    pub ready_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recording {
    pub fn is_orphan(&self) -> bool {
        self.creator_id.is_none()
    }
}

// ========================================
// Viewer sessions
// ========================================

/// One viewer's attendance on a live stream
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ViewerSession {
    pub id: Uuid,
    pub stream_id: Uuid,
    pub viewer_id: Option<Uuid>,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl ViewerSession {
    pub fn new(stream_id: Uuid, viewer_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            stream_id,
            viewer_id,
            joined_at: now,
            last_seen_at: now,
            left_at: None,
        }
    }

    /// Dedup key for unique-viewer counting: the viewer identity when known,
    /// otherwise the session itself counts as unique.
    pub fn unique_key(&self) -> String {
        match self.viewer_id {
            Some(viewer) => viewer.to_string(),
            None => self.id.to_string(),
        }
    }
}

// ========================================
// Requester identity (injected by the gateway)
// ========================================

/// Membership tier, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    Free,
    Member,
    Premium,
}

impl MembershipTier {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "member" => Some(Self::Member),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Creator,
    Admin,
}

impl Role {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Self::Viewer),
            "creator" => Some(Self::Creator),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// The requesting principal as asserted by the upstream gateway.
#[derive(Debug, Clone)]
pub struct Requester {
    pub user_id: Option<Uuid>,
    pub tier: MembershipTier,
    pub role: Role,
}

impl Requester {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            tier: MembershipTier::Free,
            role: Role::Viewer,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Closed set of access-denial reasons consumed by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotAuthenticated,
    InsufficientTier,
    Suspended,
    NotFound,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "not_authenticated",
            Self::InsufficientTier => "insufficient_tier",
            Self::Suspended => "suspended",
            Self::NotFound => "not_found",
        }
    }
}

// ========================================
// Lifecycle update bus
// ========================================

/// Broadcast to in-process subscribers on every applied transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleUpdate {
    StreamStatus {
        stream_id: Uuid,
        status: StreamStatus,
    },
    RecordingStatus {
        recording_id: Uuid,
        stream_id: Option<Uuid>,
        status: RecordingStatus,
    },
    ViewerCount {
        stream_id: Uuid,
        current_viewers: i32,
    },
}

// ========================================
// Request / response DTOs
// ========================================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateStreamRequest {
    #[validate(length(min = 1, max = 120))]
    pub title: String,
    pub visibility: Option<Visibility>,
    pub mode: Option<ContentMode>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateStreamRequest {
    #[validate(length(min = 1, max = 120))]
    pub title: Option<String>,
    pub visibility: Option<Visibility>,
    pub mode: Option<ContentMode>,
}

/// Returned once at creation; the only response that carries the credential.
#[derive(Debug, Clone, Serialize)]
pub struct CreateStreamResponse {
    pub stream_id: Uuid,
    pub credential: String,
    pub playback_url: Option<String>,
    pub status: StreamStatus,
    pub created_at: DateTime<Utc>,
}

/// Stream response DTO (credential withheld)
#[derive(Debug, Clone, Serialize)]
pub struct StreamResponse {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub title: String,
    pub visibility: Visibility,
    pub mode: ContentMode,
    pub status: StreamStatus,
    pub playback_url: Option<String>,
    pub current_viewers: i32,
    pub peak_viewers: i32,
    pub total_unique_viewers: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Stream> for StreamResponse {
    fn from(stream: Stream) -> Self {
        Self {
            id: stream.id,
            creator_id: stream.creator_id,
            title: stream.title,
            visibility: stream.visibility,
            mode: stream.mode,
            status: stream.status,
            playback_url: stream.playback_url,
            current_viewers: stream.current_viewers,
            peak_viewers: stream.peak_viewers,
            total_unique_viewers: stream.total_unique_viewers,
            started_at: stream.started_at,
            ended_at: stream.ended_at,
            created_at: stream.created_at,
        }
    }
}

/// Recording response DTO
#[derive(Debug, Clone, Serialize)]
pub struct RecordingResponse {
    pub id: Uuid,
    pub stream_id: Option<Uuid>,
    pub title: String,
    pub visibility: Visibility,
    pub status: RecordingStatus,
    pub playback_url: Option<String>,
    pub duration_seconds: Option<i32>,
    pub resolution: Option<String>,
    pub view_count: i64,
    pub unique_viewer_count: i64,
    pub peak_live_viewers: i32,
    pub ready_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Recording> for RecordingResponse {
    fn from(rec: Recording) -> Self {
        Self {
            id: rec.id,
            stream_id: rec.stream_id,
            title: rec.title,
            visibility: rec.visibility,
            status: rec.status,
            playback_url: rec.playback_url,
            duration_seconds: rec.duration_seconds,
            resolution: rec.resolution,
            view_count: rec.view_count,
            unique_viewer_count: rec.unique_viewer_count,
            peak_live_viewers: rec.peak_live_viewers,
            ready_at: rec.ready_at,
            created_at: rec.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinStreamResponse {
    pub session_id: Uuid,
    pub playback_url: Option<String>,
    pub current_viewers: i32,
}

/// Playback descriptor handed to viewers after the access check.
///
/// A `processing` recording yields `status: "processing"` with no URL;
/// clients poll or subscribe for readiness.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackDescriptor {
    pub status: String,
    pub playback_url: Option<String>,
    pub title: String,
}
