//! Reconciliation engine
//!
//! Maps provider webhook events onto Stream/Recording records and applies
//! the resulting state transitions. All writes go through the store's
//! conditional-update contract, so duplicate and out-of-order deliveries
//! collapse into benign no-ops instead of corrupting state. The engine is
//! the only component that mutates lifecycle status.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ingress::{AssetEventPayload, ParsedEvent};
use super::matchers;
use crate::config::LifecycleConfig;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{
    LifecycleUpdate, Recording, RecordingStatus, Stream, StreamStatus, Visibility,
};
use crate::store::{CasOutcome, LifecycleStore, StoreError};

const ORPHAN_SWEEP_LIMIT: i64 = 100;

/// What a reconcile pass did. Every variant is acknowledged to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// A transition was applied.
    Applied,
    /// Conditional update found the transition already done (duplicate or
    /// out-of-order delivery).
    AlreadyApplied,
    /// The referenced entity is unknown here (e.g. a late event for a
    /// deleted stream).
    UnknownTarget,
    /// No matching strategy succeeded; an orphan recording was created
    /// instead of dropping the event.
    OrphanCreated(Uuid),
}

impl ReconcileResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadyApplied => "already_applied",
            Self::UnknownTarget => "unknown_target",
            Self::OrphanCreated(_) => "orphan_created",
        }
    }
}

#[derive(Clone, Copy)]
enum AssetEventKind {
    Ready,
    Failed,
}

pub struct Reconciler {
    store: Arc<dyn LifecycleStore>,
    updates: broadcast::Sender<LifecycleUpdate>,
    cfg: LifecycleConfig,
    playback_base: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        updates: broadcast::Sender<LifecycleUpdate>,
        cfg: LifecycleConfig,
        playback_base: String,
    ) -> Self {
        Self {
            store,
            updates,
            cfg,
            playback_base,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleUpdate> {
        self.updates.subscribe()
    }

    /// Apply one parsed provider event.
    pub async fn reconcile(&self, event: ParsedEvent) -> Result<ReconcileResult> {
        match event {
            ParsedEvent::StreamStarted {
                provider_stream_id, ..
            } => match self.store.stream_by_provider_id(&provider_stream_id).await? {
                Some(stream) => self.mark_live(stream.id).await,
                None => {
                    info!(%provider_stream_id, "stream.started for unknown provider stream");
                    Ok(ReconcileResult::UnknownTarget)
                }
            },
            ParsedEvent::StreamIdle {
                provider_stream_id, ..
            } => match self.store.stream_by_provider_id(&provider_stream_id).await? {
                Some(stream) => self.mark_ended(stream.id).await,
                None => {
                    info!(%provider_stream_id, "stream.idle for unknown provider stream");
                    Ok(ReconcileResult::UnknownTarget)
                }
            },
            ParsedEvent::AssetReady { asset, .. } => {
                self.apply_asset_event(AssetEventKind::Ready, asset).await
            }
            ParsedEvent::AssetFailed { asset, .. } => {
                self.apply_asset_event(AssetEventKind::Failed, asset).await
            }
        }
    }

    /// Transition a stream to live. Shared by the `stream.started` webhook
    /// and the creator's explicit go-live override.
    pub async fn mark_live(&self, stream_id: Uuid) -> Result<ReconcileResult> {
        let outcome = self
            .store
            .update_stream_if_status(
                stream_id,
                &[StreamStatus::Configuring, StreamStatus::Idle],
                Box::new(|s| {
                    s.status = StreamStatus::Live;
                    if s.started_at.is_none() {
                        s.started_at = Some(Utc::now());
                    }
                }),
            )
            .await?;

        match outcome {
            None => Ok(ReconcileResult::UnknownTarget),
            Some(CasOutcome::Stale(stream)) => {
                debug!(stream_id = %stream.id, status = stream.status.as_str(), "go-live already handled");
                Ok(ReconcileResult::AlreadyApplied)
            }
            Some(CasOutcome::Applied(stream)) => {
                info!(stream_id = %stream.id, "Stream is live");
                self.publish(LifecycleUpdate::StreamStatus {
                    stream_id: stream.id,
                    status: stream.status,
                });
                Ok(ReconcileResult::Applied)
            }
        }
    }

    /// Transition a stream to ended and, when the live duration qualifies,
    /// create its pending recording. Shared by the `stream.idle` webhook and
    /// the creator's explicit stop. The conditional update guarantees only
    /// one caller ever observes the live→ended edge, which is what makes the
    /// recording creation idempotent.
    pub async fn mark_ended(&self, stream_id: Uuid) -> Result<ReconcileResult> {
        let outcome = self
            .store
            .update_stream_if_status(
                stream_id,
                &[StreamStatus::Live],
                Box::new(|s| {
                    s.status = StreamStatus::Ended;
                    s.ended_at = Some(Utc::now());
                }),
            )
            .await?;

        match outcome {
            None => Ok(ReconcileResult::UnknownTarget),
            Some(CasOutcome::Stale(stream)) => {
                debug!(stream_id = %stream.id, status = stream.status.as_str(), "stream end already handled");
                Ok(ReconcileResult::AlreadyApplied)
            }
            Some(CasOutcome::Applied(stream)) => {
                info!(stream_id = %stream.id, "Stream ended");
                self.publish(LifecycleUpdate::StreamStatus {
                    stream_id: stream.id,
                    status: stream.status,
                });
                self.ensure_recording(&stream).await?;
                Ok(ReconcileResult::Applied)
            }
        }
    }

    async fn ensure_recording(&self, stream: &Stream) -> Result<Option<Recording>> {
        let Some(lived) = stream.live_duration_secs() else {
            warn!(stream_id = %stream.id, "Ended stream has no live timestamps; skipping recording");
            return Ok(None);
        };
        if lived < self.cfg.min_recording_secs {
            info!(
                stream_id = %stream.id,
                lived_secs = lived,
                "Stream below minimum duration; no recording"
            );
            return Ok(None);
        }
        if let Some(existing) = self.store.recording_for_stream(stream.id).await? {
            debug!(stream_id = %stream.id, recording_id = %existing.id, "Recording already exists");
            return Ok(Some(existing));
        }

        let now = Utc::now();
        let recording = Recording {
            id: Uuid::new_v4(),
            stream_id: Some(stream.id),
            creator_id: Some(stream.creator_id),
            provider_asset_id: None,
            source_session_id: stream.provider_stream_id.clone(),
            title: stream.title.clone(),
            visibility: stream.visibility,
            status: RecordingStatus::Pending,
            playback_url: None,
            duration_seconds: None,
            size_bytes: None,
            resolution: None,
            view_count: 0,
            unique_viewer_count: 0,
            peak_live_viewers: stream.peak_viewers,
            failure_reason: None,
            hidden: false,
            ready_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let recording = self.store.insert_recording(recording).await?;
        info!(
            stream_id = %stream.id,
            recording_id = %recording.id,
            lived_secs = lived,
            "Created pending recording for ended stream"
        );
        self.publish(LifecycleUpdate::RecordingStatus {
            recording_id: recording.id,
            stream_id: recording.stream_id,
            status: recording.status,
        });
        Ok(Some(recording))
    }

    async fn apply_asset_event(
        &self,
        kind: AssetEventKind,
        asset: AssetEventPayload,
    ) -> Result<ReconcileResult> {
        let located = matchers::locate_recording(
            self.store.as_ref(),
            &asset,
            self.cfg.match_window_secs,
            self.cfg.match_scan_limit,
        )
        .await?;

        match located {
            Some((strategy, recording_id)) => {
                debug!(
                    recording_id = %recording_id,
                    provider_asset_id = %asset.id,
                    strategy = strategy.name(),
                    "Matched asset event to recording"
                );
                self.apply_to_recording(kind, recording_id, &asset).await
            }
            None => self.create_orphan(kind, &asset).await,
        }
    }

    async fn apply_to_recording(
        &self,
        kind: AssetEventKind,
        recording_id: Uuid,
        asset: &AssetEventPayload,
    ) -> Result<ReconcileResult> {
        let outcome = match kind {
            AssetEventKind::Ready => {
                // the provider is the source of truth: differing values
                // overwrite, an identical replay converges to the same state
                let asset = asset.clone();
                let playback_base = self.playback_base.clone();
                self.store
                    .update_recording_if_status(
                        recording_id,
                        &[
                            RecordingStatus::Pending,
                            RecordingStatus::Processing,
                            RecordingStatus::Ready,
                            RecordingStatus::Failed,
                        ],
                        Box::new(move |rec| {
                            rec.status = RecordingStatus::Ready;
                            rec.provider_asset_id = Some(asset.id.clone());
                            if rec.source_session_id.is_none() {
                                rec.source_session_id = asset.source_session_id.clone();
                            }
                            if let Some(playback_id) = &asset.playback_id {
                                rec.playback_url =
                                    Some(format!("{}/{}.m3u8", playback_base, playback_id));
                            }
                            if let Some(duration) = asset.duration_seconds {
                                rec.duration_seconds = Some(duration.round() as i32);
                            }
                            if let Some(size) = asset.size_bytes {
                                rec.size_bytes = Some(size);
                            }
                            if let Some(resolution) = &asset.max_resolution {
                                rec.resolution = Some(resolution.clone());
                            }
                            rec.failure_reason = None;
                            if rec.ready_at.is_none() {
                                rec.ready_at = Some(Utc::now());
                            }
                        }),
                    )
                    .await?
            }
            AssetEventKind::Failed => {
                // a late `failed` must not clobber a recording that already
                // made it to ready
                let asset = asset.clone();
                self.store
                    .update_recording_if_status(
                        recording_id,
                        &[RecordingStatus::Pending, RecordingStatus::Processing],
                        Box::new(move |rec| {
                            rec.status = RecordingStatus::Failed;
                            rec.provider_asset_id = Some(asset.id.clone());
                            if rec.source_session_id.is_none() {
                                rec.source_session_id = asset.source_session_id.clone();
                            }
                            rec.failure_reason = Some(
                                asset
                                    .error_message
                                    .clone()
                                    .unwrap_or_else(|| "provider reported processing failure".to_string()),
                            );
                        }),
                    )
                    .await?
            }
        };

        match outcome {
            None => Ok(ReconcileResult::UnknownTarget),
            Some(CasOutcome::Stale(rec)) => {
                debug!(
                    recording_id = %rec.id,
                    status = rec.status.as_str(),
                    "asset event already handled"
                );
                Ok(ReconcileResult::AlreadyApplied)
            }
            Some(CasOutcome::Applied(rec)) => {
                info!(
                    recording_id = %rec.id,
                    status = rec.status.as_str(),
                    "Recording reconciled from asset event"
                );
                self.publish(LifecycleUpdate::RecordingStatus {
                    recording_id: rec.id,
                    stream_id: rec.stream_id,
                    status: rec.status,
                });
                Ok(ReconcileResult::Applied)
            }
        }
    }

    /// Nothing matched: keep the finished recording rather than dropping the
    /// event. The unresolved creator is a sentinel picked up by the re-match
    /// sweep and by manual reconciliation.
    async fn create_orphan(
        &self,
        kind: AssetEventKind,
        asset: &AssetEventPayload,
    ) -> Result<ReconcileResult> {
        let now = Utc::now();
        let (status, playback_url, failure_reason, ready_at) = match kind {
            AssetEventKind::Ready => (
                RecordingStatus::Ready,
                asset
                    .playback_id
                    .as_ref()
                    .map(|pid| format!("{}/{}.m3u8", self.playback_base, pid)),
                None,
                Some(now),
            ),
            AssetEventKind::Failed => (
                RecordingStatus::Failed,
                None,
                Some(
                    asset
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "provider reported processing failure".to_string()),
                ),
                None,
            ),
        };

        let recording = Recording {
            id: Uuid::new_v4(),
            stream_id: None,
            creator_id: None,
            provider_asset_id: Some(asset.id.clone()),
            source_session_id: asset.source_session_id.clone(),
            title: asset
                .name
                .clone()
                .unwrap_or_else(|| "Untitled recording".to_string()),
            // unowned content stays private until a creator is resolved
            visibility: Visibility::Private,
            status,
            playback_url,
            duration_seconds: asset.duration_seconds.map(|d| d.round() as i32),
            size_bytes: asset.size_bytes,
            resolution: asset.max_resolution.clone(),
            view_count: 0,
            unique_viewer_count: 0,
            peak_live_viewers: 0,
            failure_reason,
            hidden: false,
            ready_at,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_recording(recording).await {
            Ok(recording) => {
                warn!(
                    recording_id = %recording.id,
                    provider_asset_id = %asset.id,
                    "No match for asset event; created orphan recording"
                );
                metrics::record_orphan();
                self.publish(LifecycleUpdate::RecordingStatus {
                    recording_id: recording.id,
                    stream_id: None,
                    status: recording.status,
                });
                Ok(ReconcileResult::OrphanCreated(recording.id))
            }
            // a concurrent delivery of the same asset already created it
            Err(StoreError::Duplicate { .. }) => Ok(ReconcileResult::AlreadyApplied),
            Err(err) => Err(AppError::from(err)),
        }
    }

    /// Periodic re-match pass: attach unresolved orphans to their stream and
    /// creator once the session linkage resolves. Returns how many attached.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let orphans = self.store.unresolved_orphans(ORPHAN_SWEEP_LIMIT).await?;
        let mut attached = 0;

        for orphan in orphans {
            let Some(session_id) = orphan.source_session_id.clone() else {
                continue;
            };
            let Some(stream) = self.store.stream_by_provider_id(&session_id).await? else {
                continue;
            };

            let creator_id = stream.creator_id;
            let stream_id = stream.id;
            let visibility = stream.visibility;
            let outcome = self
                .store
                .update_recording_if_status(
                    orphan.id,
                    &[
                        RecordingStatus::Pending,
                        RecordingStatus::Processing,
                        RecordingStatus::Ready,
                        RecordingStatus::Failed,
                    ],
                    Box::new(move |rec| {
                        if rec.creator_id.is_none() {
                            rec.creator_id = Some(creator_id);
                            rec.stream_id = Some(stream_id);
                            rec.visibility = visibility;
                        }
                    }),
                )
                .await?;

            if let Some(CasOutcome::Applied(rec)) = outcome {
                if rec.creator_id == Some(creator_id) {
                    info!(
                        recording_id = %rec.id,
                        stream_id = %stream_id,
                        "Attached orphan recording to its stream"
                    );
                    attached += 1;
                }
            }
        }

        Ok(attached)
    }

    fn publish(&self, update: LifecycleUpdate) {
        // nobody listening is fine
        let _ = self.updates.send(update);
    }
}
