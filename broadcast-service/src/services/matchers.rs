//! Asset-to-recording matching strategies
//!
//! The provider's asset payload does not always carry a clean foreign key
//! back to a recording, so the engine tries an ordered list of strategies
//! and stops at the first hit. Each strategy is a self-contained lookup over
//! the store, which keeps them testable in isolation and lets new strategies
//! slot in without touching engine control flow.

use chrono::{Duration, Utc};
use uuid::Uuid;

use super::ingress::AssetEventPayload;
use crate::models::RecordingStatus;
use crate::store::{LifecycleStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Fast path once an asset id has been linked to a recording.
    ByProviderAssetId,
    /// Asset's source session id → stream's provider id → that stream's
    /// recording. The common case for recordings pre-created at stream-end.
    BySourceSession,
    /// Best-effort fallback: exact title equality against unlinked
    /// recordings still awaiting their asset, scanned most-recent-first
    /// inside a bounded window.
    ByRecentTitle,
}

/// Strategies in the order the engine applies them.
pub const STRATEGY_ORDER: [MatchStrategy; 3] = [
    MatchStrategy::ByProviderAssetId,
    MatchStrategy::BySourceSession,
    MatchStrategy::ByRecentTitle,
];

impl MatchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ByProviderAssetId => "provider_asset_id",
            Self::BySourceSession => "source_session",
            Self::ByRecentTitle => "recent_title",
        }
    }

    pub async fn locate(
        &self,
        store: &dyn LifecycleStore,
        asset: &AssetEventPayload,
        window_secs: i64,
        scan_limit: i64,
    ) -> StoreResult<Option<Uuid>> {
        match self {
            Self::ByProviderAssetId => Ok(store
                .recording_by_provider_asset(&asset.id)
                .await?
                .map(|rec| rec.id)),

            Self::BySourceSession => {
                let Some(session_id) = &asset.source_session_id else {
                    return Ok(None);
                };
                let Some(stream) = store.stream_by_provider_id(session_id).await? else {
                    return Ok(None);
                };
                Ok(store
                    .recording_for_stream(stream.id)
                    .await?
                    .map(|rec| rec.id))
            }

            Self::ByRecentTitle => {
                let Some(name) = &asset.name else {
                    return Ok(None);
                };
                let cutoff = Utc::now() - Duration::seconds(window_secs);
                let candidates = store
                    .recordings_in_status(
                        &[RecordingStatus::Processing, RecordingStatus::Pending],
                        cutoff,
                        scan_limit,
                    )
                    .await?;
                Ok(candidates
                    .into_iter()
                    .find(|rec| rec.provider_asset_id.is_none() && &rec.title == name)
                    .map(|rec| rec.id))
            }
        }
    }
}

/// Run the strategies in order; first hit wins.
pub async fn locate_recording(
    store: &dyn LifecycleStore,
    asset: &AssetEventPayload,
    window_secs: i64,
    scan_limit: i64,
) -> StoreResult<Option<(MatchStrategy, Uuid)>> {
    for strategy in STRATEGY_ORDER {
        if let Some(id) = strategy.locate(store, asset, window_secs, scan_limit).await? {
            return Ok(Some((strategy, id)));
        }
    }
    Ok(None)
}
