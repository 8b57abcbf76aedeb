//! Viewer session tracking
//!
//! Maintains live viewer counts per stream under concurrent join/leave
//! traffic. Counter movement happens inside the store's atomic counter
//! operations, never as read-then-write, so N concurrent joins land as
//! exactly N. Mobile clients get killed without a graceful leave, so a
//! periodic sweep reaps sessions whose heartbeat went quiet.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{LifecycleUpdate, StreamStatus, ViewerSession};
use crate::store::{LifecycleStore, ViewerCounts};

#[derive(Debug)]
pub struct JoinedSession {
    pub session: ViewerSession,
    pub counts: ViewerCounts,
    pub playback_url: Option<String>,
}

pub struct ViewerTracker {
    store: Arc<dyn LifecycleStore>,
    updates: broadcast::Sender<LifecycleUpdate>,
    session_ttl_secs: i64,
}

impl ViewerTracker {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        updates: broadcast::Sender<LifecycleUpdate>,
        session_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            updates,
            session_ttl_secs,
        }
    }

    /// Open a session on a live stream and count the join.
    pub async fn join(
        &self,
        stream_id: Uuid,
        viewer_id: Option<Uuid>,
    ) -> Result<JoinedSession> {
        let stream = self
            .store
            .stream(stream_id)
            .await?
            .ok_or(AppError::NotFound("stream"))?;
        if stream.status != StreamStatus::Live {
            return Err(AppError::Conflict("stream is not live".to_string()));
        }

        let session = self
            .store
            .insert_session(ViewerSession::new(stream_id, viewer_id))
            .await?;
        let counts = self
            .store
            .viewer_joined(stream_id, &session.unique_key())
            .await?
            .ok_or(AppError::NotFound("stream"))?;

        metrics::record_viewer_event("join");
        self.publish_count(stream_id, counts);
        debug!(stream_id = %stream_id, session_id = %session.id, "Viewer joined");

        Ok(JoinedSession {
            session,
            counts,
            playback_url: stream.playback_url,
        })
    }

    /// Close a session and count the leave. A double leave, or a leave for a
    /// session we never saw, is a no-op; the counter is decremented at most
    /// once per session.
    pub async fn leave(&self, session_id: Uuid) -> Result<()> {
        let Some(session) = self.store.close_session(session_id, Utc::now()).await? else {
            debug!(session_id = %session_id, "Leave for unknown or already-closed session");
            return Ok(());
        };

        if let Some(counts) = self.store.viewer_left(session.stream_id).await? {
            self.publish_count(session.stream_id, counts);
        }
        metrics::record_viewer_event("leave");
        debug!(stream_id = %session.stream_id, session_id = %session_id, "Viewer left");
        Ok(())
    }

    /// Refresh a session's liveness so the sweep leaves it alone.
    pub async fn heartbeat(&self, session_id: Uuid) -> Result<()> {
        if self.store.touch_session(session_id, Utc::now()).await? {
            Ok(())
        } else {
            Err(AppError::NotFound("viewer session"))
        }
    }

    /// Reap sessions with no heartbeat inside the inactivity window,
    /// decrementing counters as if the viewer had left. Returns how many
    /// sessions were closed.
    pub async fn sweep_stale(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(self.session_ttl_secs);
        let stale = self.store.sessions_idle_since(cutoff).await?;
        let mut reaped = 0;

        for session in stale {
            // close_session arbitrates with a racing explicit leave
            if self
                .store
                .close_session(session.id, Utc::now())
                .await?
                .is_some()
            {
                if let Some(counts) = self.store.viewer_left(session.stream_id).await? {
                    self.publish_count(session.stream_id, counts);
                }
                metrics::record_viewer_event("reaped");
                reaped += 1;
            }
        }

        if reaped > 0 {
            info!(reaped, "Reaped stale viewer sessions");
        }
        Ok(reaped)
    }

    fn publish_count(&self, stream_id: Uuid, counts: ViewerCounts) {
        let _ = self.updates.send(LifecycleUpdate::ViewerCount {
            stream_id,
            current_viewers: counts.current,
        });
    }
}
