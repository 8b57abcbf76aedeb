//! In-memory lifecycle store
//!
//! Backs local development and the test suite. Conditional updates mutate
//! under the entry's shard lock, which gives the same per-entity
//! serialization the Postgres implementation gets from version tokens.
//!
//! Lock order is always primary map (streams/recordings/sessions) before
//! index maps. Index lookups re-check the resolved record, so a reader that
//! races a reindex simply misses, it never observes a wrong record.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    CasOutcome, LifecycleStore, RecordingMutator, StoreError, StoreResult, StreamMutator,
    ViewerCounts,
};
use crate::models::{Recording, RecordingStatus, Stream, StreamStatus, ViewerSession};
use async_trait::async_trait;

#[derive(Default)]
pub struct MemoryLifecycleStore {
    streams: DashMap<Uuid, Stream>,
    recordings: DashMap<Uuid, Recording>,
    sessions: DashMap<Uuid, ViewerSession>,

    stream_by_provider: DashMap<String, Uuid>,
    stream_by_credential: DashMap<String, Uuid>,
    recording_by_asset: DashMap<String, Uuid>,
    recording_by_stream: DashMap<Uuid, Uuid>,

    stream_uniques: DashMap<Uuid, HashSet<String>>,
    recording_uniques: DashMap<Uuid, HashSet<String>>,
}

impl MemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_recording(&self, rec: &Recording) {
        if let Some(aid) = &rec.provider_asset_id {
            self.recording_by_asset.insert(aid.clone(), rec.id);
        }
        if let Some(sid) = rec.stream_id {
            // first recording for a stream wins the primary slot
            self.recording_by_stream.entry(sid).or_insert(rec.id);
        }
    }
}

#[async_trait]
impl LifecycleStore for MemoryLifecycleStore {
    async fn insert_stream(&self, stream: Stream) -> StoreResult<Stream> {
        match self.stream_by_credential.entry(stream.credential.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::Duplicate {
                    field: "credential",
                    value: stream.credential,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(stream.id);
            }
        }
        if let Some(pid) = &stream.provider_stream_id {
            self.stream_by_provider.insert(pid.clone(), stream.id);
        }
        self.streams.insert(stream.id, stream.clone());
        Ok(stream)
    }

    async fn stream(&self, id: Uuid) -> StoreResult<Option<Stream>> {
        Ok(self.streams.get(&id).map(|s| s.clone()))
    }

    async fn stream_by_provider_id(&self, provider_id: &str) -> StoreResult<Option<Stream>> {
        let Some(id) = self.stream_by_provider.get(provider_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self
            .streams
            .get(&id)
            .filter(|s| s.provider_stream_id.as_deref() == Some(provider_id))
            .map(|s| s.clone()))
    }

    async fn stream_by_credential(&self, credential: &str) -> StoreResult<Option<Stream>> {
        let Some(id) = self.stream_by_credential.get(credential).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self
            .streams
            .get(&id)
            .filter(|s| s.credential == credential)
            .map(|s| s.clone()))
    }

    async fn active_stream_for_creator(&self, creator_id: Uuid) -> StoreResult<Option<Stream>> {
        Ok(self
            .streams
            .iter()
            .find(|s| s.creator_id == creator_id && s.is_active())
            .map(|s| s.clone()))
    }

    async fn live_streams(&self, limit: i64) -> StoreResult<Vec<Stream>> {
        let mut live: Vec<Stream> = self
            .streams
            .iter()
            .filter(|s| s.status == StreamStatus::Live)
            .map(|s| s.clone())
            .collect();
        live.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        live.truncate(limit.max(0) as usize);
        Ok(live)
    }

    async fn update_stream_if_status(
        &self,
        id: Uuid,
        expected: &[StreamStatus],
        mutate: StreamMutator,
    ) -> StoreResult<Option<CasOutcome<Stream>>> {
        let (updated, old_credential, old_provider) = {
            let Some(mut entry) = self.streams.get_mut(&id) else {
                return Ok(None);
            };
            if !expected.contains(&entry.status) {
                return Ok(Some(CasOutcome::Stale(entry.clone())));
            }

            let old_credential = entry.credential.clone();
            let old_provider = entry.provider_stream_id.clone();

            mutate(&mut entry);
            entry.version += 1;
            entry.updated_at = Utc::now();
            (entry.clone(), old_credential, old_provider)
        };

        if updated.credential != old_credential {
            self.stream_by_credential.remove(&old_credential);
            self.stream_by_credential
                .insert(updated.credential.clone(), id);
        }
        if updated.provider_stream_id != old_provider {
            if let Some(old) = old_provider {
                self.stream_by_provider.remove(&old);
            }
            if let Some(new) = &updated.provider_stream_id {
                self.stream_by_provider.insert(new.clone(), id);
            }
        }

        Ok(Some(CasOutcome::Applied(updated)))
    }

    async fn insert_recording(&self, recording: Recording) -> StoreResult<Recording> {
        if let Some(aid) = &recording.provider_asset_id {
            match self.recording_by_asset.entry(aid.clone()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Duplicate {
                        field: "provider_asset_id",
                        value: aid.clone(),
                    })
                }
                Entry::Vacant(slot) => {
                    slot.insert(recording.id);
                }
            }
        }
        if let Some(sid) = recording.stream_id {
            self.recording_by_stream.entry(sid).or_insert(recording.id);
        }
        self.recordings.insert(recording.id, recording.clone());
        Ok(recording)
    }

    async fn recording(&self, id: Uuid) -> StoreResult<Option<Recording>> {
        Ok(self.recordings.get(&id).map(|r| r.clone()))
    }

    async fn recording_by_provider_asset(&self, asset_id: &str) -> StoreResult<Option<Recording>> {
        let Some(id) = self.recording_by_asset.get(asset_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self
            .recordings
            .get(&id)
            .filter(|r| r.provider_asset_id.as_deref() == Some(asset_id))
            .map(|r| r.clone()))
    }

    async fn recording_for_stream(&self, stream_id: Uuid) -> StoreResult<Option<Recording>> {
        let Some(id) = self.recording_by_stream.get(&stream_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.recordings.get(&id).map(|r| r.clone()))
    }

    async fn recordings_for_creator(&self, creator_id: Uuid) -> StoreResult<Vec<Recording>> {
        let mut recs: Vec<Recording> = self
            .recordings
            .iter()
            .filter(|r| r.creator_id == Some(creator_id) && r.status != RecordingStatus::Deleted)
            .map(|r| r.clone())
            .collect();
        recs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(recs)
    }

    async fn recordings_in_status(
        &self,
        statuses: &[RecordingStatus],
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Recording>> {
        let mut recs: Vec<Recording> = self
            .recordings
            .iter()
            .filter(|r| statuses.contains(&r.status) && r.created_at >= cutoff)
            .map(|r| r.clone())
            .collect();
        recs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recs.truncate(limit.max(0) as usize);
        Ok(recs)
    }

    async fn unresolved_orphans(&self, limit: i64) -> StoreResult<Vec<Recording>> {
        let mut recs: Vec<Recording> = self
            .recordings
            .iter()
            .filter(|r| r.is_orphan() && r.status != RecordingStatus::Deleted)
            .map(|r| r.clone())
            .collect();
        recs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recs.truncate(limit.max(0) as usize);
        Ok(recs)
    }

    async fn update_recording_if_status(
        &self,
        id: Uuid,
        expected: &[RecordingStatus],
        mutate: RecordingMutator,
    ) -> StoreResult<Option<CasOutcome<Recording>>> {
        let updated = {
            let Some(mut entry) = self.recordings.get_mut(&id) else {
                return Ok(None);
            };
            if !expected.contains(&entry.status) {
                return Ok(Some(CasOutcome::Stale(entry.clone())));
            }

            mutate(&mut entry);
            entry.version += 1;
            entry.updated_at = Utc::now();
            entry.clone()
        };

        self.index_recording(&updated);
        Ok(Some(CasOutcome::Applied(updated)))
    }

    async fn viewer_joined(
        &self,
        stream_id: Uuid,
        unique_key: &str,
    ) -> StoreResult<Option<ViewerCounts>> {
        let Some(mut stream) = self.streams.get_mut(&stream_id) else {
            return Ok(None);
        };

        stream.current_viewers += 1;
        if stream.current_viewers > stream.peak_viewers {
            stream.peak_viewers = stream.current_viewers;
        }
        let newly_unique = self
            .stream_uniques
            .entry(stream_id)
            .or_default()
            .insert(unique_key.to_string());
        if newly_unique {
            stream.total_unique_viewers += 1;
        }

        Ok(Some(ViewerCounts {
            current: stream.current_viewers,
            peak: stream.peak_viewers,
            total_unique: stream.total_unique_viewers,
        }))
    }

    async fn viewer_left(&self, stream_id: Uuid) -> StoreResult<Option<ViewerCounts>> {
        let Some(mut stream) = self.streams.get_mut(&stream_id) else {
            return Ok(None);
        };

        stream.current_viewers = (stream.current_viewers - 1).max(0);

        Ok(Some(ViewerCounts {
            current: stream.current_viewers,
            peak: stream.peak_viewers,
            total_unique: stream.total_unique_viewers,
        }))
    }

    async fn record_recording_view(
        &self,
        recording_id: Uuid,
        unique_key: Option<&str>,
    ) -> StoreResult<()> {
        let Some(mut rec) = self.recordings.get_mut(&recording_id) else {
            return Ok(());
        };

        rec.view_count += 1;
        if let Some(key) = unique_key {
            let newly = self
                .recording_uniques
                .entry(recording_id)
                .or_default()
                .insert(key.to_string());
            if newly {
                rec.unique_viewer_count += 1;
            }
        }
        Ok(())
    }

    async fn insert_session(&self, session: ViewerSession) -> StoreResult<ViewerSession> {
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn close_session(
        &self,
        session_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> StoreResult<Option<ViewerSession>> {
        let Some(mut session) = self.sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        if session.left_at.is_some() {
            return Ok(None);
        }
        session.left_at = Some(left_at);
        Ok(Some(session.clone()))
    }

    async fn touch_session(&self, session_id: Uuid, seen_at: DateTime<Utc>) -> StoreResult<bool> {
        let Some(mut session) = self.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if session.left_at.is_some() {
            return Ok(false);
        }
        session.last_seen_at = seen_at;
        Ok(true)
    }

    async fn sessions_idle_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ViewerSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.left_at.is_none() && s.last_seen_at < cutoff)
            .map(|s| s.clone())
            .collect())
    }
}
