//! Stream service (business logic layer)
//!
//! Orchestrates the lifecycle store, the provider gateway, and the
//! reconciliation engine for creator- and viewer-facing operations. Every
//! status change ultimately resolves to a conditional update; explicit
//! creator actions (end stream, go live) drive the same engine transitions
//! the webhooks do.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use provider_client::ProviderClient;

use super::access::{can_view_recording, can_view_stream, AccessDecision};
use super::reconciler::Reconciler;
use crate::error::{AppError, Result};
use crate::models::{
    ContentMode, CreateStreamRequest, CreateStreamResponse, DenialReason, MembershipTier,
    PlaybackDescriptor, Recording, RecordingStatus, Requester, Stream, StreamResponse,
    StreamStatus, UpdateStreamRequest, Visibility,
};
use crate::store::{CasOutcome, LifecycleStore};

pub struct StreamService {
    store: Arc<dyn LifecycleStore>,
    provider: Arc<ProviderClient>,
    reconciler: Arc<Reconciler>,
    playback_base: String,
    min_member_tier: MembershipTier,
}

impl StreamService {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        provider: Arc<ProviderClient>,
        reconciler: Arc<Reconciler>,
        playback_base: String,
        min_member_tier: MembershipTier,
    ) -> Self {
        Self {
            store,
            provider,
            reconciler,
            playback_base,
            min_member_tier,
        }
    }

    /// Create a new stream: record the intent, provision with the provider,
    /// then confirm. The creator gets the ingest credential exactly once.
    pub async fn create_stream(
        &self,
        creator_id: Uuid,
        request: CreateStreamRequest,
    ) -> Result<CreateStreamResponse> {
        // one non-ended stream per creator; the partial unique index in
        // Postgres backstops this check under races
        if self
            .store
            .active_stream_for_creator(creator_id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(
                "creator already has an active stream".to_string(),
            ));
        }

        let now = Utc::now();
        let stream = Stream {
            id: Uuid::new_v4(),
            creator_id,
            provider_stream_id: None,
            credential: Uuid::new_v4().simple().to_string(),
            title: request.title,
            visibility: request.visibility.unwrap_or(Visibility::Public),
            mode: request.mode.unwrap_or(ContentMode::Video),
            status: StreamStatus::Idle,
            playback_url: None,
            current_viewers: 0,
            peak_viewers: 0,
            total_unique_viewers: 0,
            suspended: false,
            started_at: None,
            ended_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let stream = self.store.insert_stream(stream).await?;

        let provisioned = match self.provider.create_live_stream(&stream.title).await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                warn!(stream_id = %stream.id, error = %err, "Provider provisioning failed; aborting stream");
                self.store
                    .update_stream_if_status(
                        stream.id,
                        &[StreamStatus::Idle],
                        Box::new(|s| {
                            s.status = StreamStatus::Ended;
                            s.ended_at = Some(Utc::now());
                        }),
                    )
                    .await?;
                return Err(AppError::Provider(err));
            }
        };

        let playback_url = format!("{}/{}.m3u8", self.playback_base, provisioned.playback_id);
        let provider_stream_id = provisioned.id.clone();
        let credential = provisioned.stream_key.clone();
        let outcome = self
            .store
            .update_stream_if_status(
                stream.id,
                &[StreamStatus::Idle],
                Box::new(move |s| {
                    s.status = StreamStatus::Configuring;
                    s.provider_stream_id = Some(provider_stream_id.clone());
                    s.credential = credential.clone();
                    s.playback_url = Some(playback_url.clone());
                }),
            )
            .await?;

        match outcome {
            Some(CasOutcome::Applied(stream)) => Ok(CreateStreamResponse {
                stream_id: stream.id,
                credential: stream.credential.clone(),
                playback_url: stream.playback_url.clone(),
                status: stream.status,
                created_at: stream.created_at,
            }),
            _ => Err(AppError::Internal(anyhow::anyhow!(
                "stream {} left idle state during provisioning",
                stream.id
            ))),
        }
    }

    /// Explicit creator override: `configuring → live` without waiting for
    /// the provider webhook.
    pub async fn go_live(&self, creator_id: Uuid, stream_id: Uuid) -> Result<StreamResponse> {
        let stream = self.owned_stream(creator_id, stream_id).await?;
        self.reconciler.mark_live(stream.id).await?;
        self.stream_details(stream_id).await
    }

    /// Explicit creator stop; drives the same `live → ended` transition and
    /// recording creation the provider's idle webhook does.
    pub async fn end_stream(&self, creator_id: Uuid, stream_id: Uuid) -> Result<StreamResponse> {
        let stream = self.owned_stream(creator_id, stream_id).await?;
        self.reconciler.mark_ended(stream.id).await?;
        self.stream_details(stream_id).await
    }

    /// Swap the ingest credential in one conditional update; the previous
    /// credential stops resolving the moment the swap lands.
    pub async fn regenerate_credential(
        &self,
        creator_id: Uuid,
        stream_id: Uuid,
    ) -> Result<String> {
        let stream = self.owned_stream(creator_id, stream_id).await?;

        let fresh = Uuid::new_v4().simple().to_string();
        let fresh_for_mutator = fresh.clone();
        let outcome = self
            .store
            .update_stream_if_status(
                stream.id,
                &[
                    StreamStatus::Idle,
                    StreamStatus::Configuring,
                    StreamStatus::Live,
                ],
                Box::new(move |s| s.credential = fresh_for_mutator.clone()),
            )
            .await?;

        match outcome {
            Some(CasOutcome::Applied(_)) => Ok(fresh),
            Some(CasOutcome::Stale(_)) => {
                Err(AppError::Conflict("stream has ended".to_string()))
            }
            None => Err(AppError::NotFound("stream")),
        }
    }

    /// Patch title/visibility/mode. Ended streams are immutable.
    pub async fn update_stream(
        &self,
        creator_id: Uuid,
        stream_id: Uuid,
        request: UpdateStreamRequest,
    ) -> Result<StreamResponse> {
        let stream = self.owned_stream(creator_id, stream_id).await?;

        let outcome = self
            .store
            .update_stream_if_status(
                stream.id,
                &[
                    StreamStatus::Idle,
                    StreamStatus::Configuring,
                    StreamStatus::Live,
                ],
                Box::new(move |s| {
                    if let Some(title) = &request.title {
                        s.title = title.clone();
                    }
                    if let Some(visibility) = request.visibility {
                        s.visibility = visibility;
                    }
                    if let Some(mode) = request.mode {
                        s.mode = mode;
                    }
                }),
            )
            .await?;

        match outcome {
            Some(CasOutcome::Applied(stream)) => Ok(stream.into()),
            Some(CasOutcome::Stale(_)) => {
                Err(AppError::Conflict("stream has ended".to_string()))
            }
            None => Err(AppError::NotFound("stream")),
        }
    }

    /// Soft-delete a recording and release the provider-side asset.
    pub async fn delete_recording(
        &self,
        requester: &Requester,
        recording_id: Uuid,
    ) -> Result<()> {
        let recording = self
            .store
            .recording(recording_id)
            .await?
            .ok_or(AppError::NotFound("recording"))?;

        let is_owner =
            recording.creator_id.is_some() && recording.creator_id == requester.user_id;
        if !(is_owner || requester.is_admin()) {
            return Err(AppError::AccessDenied(DenialReason::NotFound));
        }
        if recording.status == RecordingStatus::Deleted {
            return Ok(());
        }

        // release the provider asset first; delete-asset treats 404 as
        // success so a retry after partial failure converges
        if let Some(asset_id) = &recording.provider_asset_id {
            self.provider.delete_asset(asset_id).await?;
        }

        self.store
            .update_recording_if_status(
                recording.id,
                &[
                    RecordingStatus::Pending,
                    RecordingStatus::Processing,
                    RecordingStatus::Ready,
                    RecordingStatus::Failed,
                ],
                Box::new(|rec| rec.status = RecordingStatus::Deleted),
            )
            .await?;
        Ok(())
    }

    pub async fn stream_details(&self, stream_id: Uuid) -> Result<StreamResponse> {
        let stream = self
            .store
            .stream(stream_id)
            .await?
            .ok_or(AppError::NotFound("stream"))?;
        Ok(stream.into())
    }

    pub async fn list_live(&self, limit: i64) -> Result<Vec<StreamResponse>> {
        let streams = self.store.live_streams(limit).await?;
        Ok(streams.into_iter().map(Into::into).collect())
    }

    pub async fn recordings_for_creator(&self, creator_id: Uuid) -> Result<Vec<Recording>> {
        Ok(self.store.recordings_for_creator(creator_id).await?)
    }

    /// Gate stream playback behind the access resolver. The URL is only
    /// exposed while the stream is live.
    pub async fn playback_for_stream(
        &self,
        stream_id: Uuid,
        requester: &Requester,
    ) -> Result<PlaybackDescriptor> {
        let stream = self
            .store
            .stream(stream_id)
            .await?
            .ok_or(AppError::NotFound("stream"))?;

        match can_view_stream(&stream, requester, self.min_member_tier) {
            AccessDecision::Denied(reason) => Err(AppError::AccessDenied(reason)),
            AccessDecision::Allowed => {
                let playback_url = if stream.status == StreamStatus::Live {
                    stream.playback_url.clone()
                } else {
                    None
                };
                Ok(PlaybackDescriptor {
                    status: stream.status.as_str().to_string(),
                    playback_url,
                    title: stream.title,
                })
            }
        }
    }

    /// Gate recording playback. A recording that is still processing yields
    /// a descriptor without a URL so clients can poll for readiness.
    pub async fn playback_for_recording(
        &self,
        recording_id: Uuid,
        requester: &Requester,
    ) -> Result<PlaybackDescriptor> {
        let recording = self
            .store
            .recording(recording_id)
            .await?
            .ok_or(AppError::NotFound("recording"))?;

        match can_view_recording(&recording, requester, self.min_member_tier) {
            AccessDecision::Denied(reason) => Err(AppError::AccessDenied(reason)),
            AccessDecision::Allowed => {
                if recording.status == RecordingStatus::Ready {
                    let unique_key = requester.user_id.map(|id| id.to_string());
                    self.store
                        .record_recording_view(recording.id, unique_key.as_deref())
                        .await?;
                    Ok(PlaybackDescriptor {
                        status: "ready".to_string(),
                        playback_url: recording.playback_url.clone(),
                        title: recording.title,
                    })
                } else {
                    Ok(PlaybackDescriptor {
                        status: recording.status.as_str().to_string(),
                        playback_url: None,
                        title: recording.title,
                    })
                }
            }
        }
    }

    /// Fetch a stream and verify the actor owns it (admins pass). Foreign
    /// streams are concealed as not-found.
    async fn owned_stream(&self, creator_id: Uuid, stream_id: Uuid) -> Result<Stream> {
        let stream = self
            .store
            .stream(stream_id)
            .await?
            .ok_or(AppError::NotFound("stream"))?;
        if stream.creator_id != creator_id {
            return Err(AppError::AccessDenied(DenialReason::NotFound));
        }
        Ok(stream)
    }
}
