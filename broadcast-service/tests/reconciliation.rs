//! Reconciliation engine integration tests
//!
//! Drives the engine with parsed provider events against the in-memory
//! store and checks the lifecycle invariants: idempotent transitions,
//! out-of-order safety, matching fallback order, and orphan handling.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use broadcast_service::config::LifecycleConfig;
use broadcast_service::models::{
    ContentMode, Recording, RecordingStatus, Stream, StreamStatus, Visibility,
};
use broadcast_service::services::ingress::AssetEventPayload;
use broadcast_service::services::reconciler::{ReconcileResult, Reconciler};
use broadcast_service::services::ParsedEvent;
use broadcast_service::store::memory::MemoryLifecycleStore;
use broadcast_service::store::LifecycleStore;

const PLAYBACK_BASE: &str = "https://cdn.test/hls";

fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        min_recording_secs: 60,
        dedup_window_secs: 300,
        event_timeout_ms: 5_000,
        store_retry_attempts: 3,
        store_retry_base_ms: 10,
        match_window_secs: 86_400,
        match_scan_limit: 50,
        orphan_sweep_interval_secs: 300,
    }
}

fn harness() -> (Arc<MemoryLifecycleStore>, Reconciler) {
    let store = Arc::new(MemoryLifecycleStore::new());
    let (updates, _) = broadcast::channel(64);
    let reconciler = Reconciler::new(
        store.clone(),
        updates,
        lifecycle_config(),
        PLAYBACK_BASE.to_string(),
    );
    (store, reconciler)
}

fn configuring_stream(provider_id: &str) -> Stream {
    let now = Utc::now();
    Stream {
        id: Uuid::new_v4(),
        creator_id: Uuid::new_v4(),
        provider_stream_id: Some(provider_id.to_string()),
        credential: Uuid::new_v4().simple().to_string(),
        title: "Friday AMA".to_string(),
        visibility: Visibility::Public,
        mode: ContentMode::Video,
        status: StreamStatus::Configuring,
        playback_url: Some(format!("{PLAYBACK_BASE}/pb_test.m3u8")),
        current_viewers: 0,
        peak_viewers: 0,
        total_unique_viewers: 0,
        suspended: false,
        started_at: None,
        ended_at: None,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

fn pending_recording(title: &str, stream_id: Option<Uuid>, creator_id: Option<Uuid>) -> Recording {
    let now = Utc::now();
    Recording {
        id: Uuid::new_v4(),
        stream_id,
        creator_id,
        provider_asset_id: None,
        source_session_id: None,
        title: title.to_string(),
        visibility: Visibility::Public,
        status: RecordingStatus::Processing,
        playback_url: None,
        duration_seconds: None,
        size_bytes: None,
        resolution: None,
        view_count: 0,
        unique_viewer_count: 0,
        peak_live_viewers: 0,
        failure_reason: None,
        hidden: false,
        ready_at: None,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

fn started(provider_stream_id: &str) -> ParsedEvent {
    ParsedEvent::StreamStarted {
        event_id: Uuid::new_v4().to_string(),
        provider_stream_id: provider_stream_id.to_string(),
    }
}

fn idle(provider_stream_id: &str) -> ParsedEvent {
    ParsedEvent::StreamIdle {
        event_id: Uuid::new_v4().to_string(),
        provider_stream_id: provider_stream_id.to_string(),
    }
}

fn asset_ready(asset: AssetEventPayload) -> ParsedEvent {
    ParsedEvent::AssetReady {
        event_id: Uuid::new_v4().to_string(),
        asset,
    }
}

fn bare_asset(id: &str) -> AssetEventPayload {
    AssetEventPayload {
        id: id.to_string(),
        name: None,
        source_session_id: None,
        playback_id: None,
        duration_seconds: None,
        size_bytes: None,
        max_resolution: None,
        error_message: None,
    }
}

/// Shift a live stream's start time into the past to simulate elapsed
/// broadcast time.
async fn backdate_start(store: &MemoryLifecycleStore, stream_id: Uuid, secs: i64) {
    store
        .update_stream_if_status(
            stream_id,
            &[StreamStatus::Live],
            Box::new(move |s| {
                s.started_at = s.started_at.map(|t| t - Duration::seconds(secs));
            }),
        )
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn ninety_second_stream_ends_with_a_pending_recording() {
    let (store, reconciler) = harness();
    let stream = store
        .insert_stream(configuring_stream("ls_90"))
        .await
        .unwrap();

    let result = reconciler.reconcile(started("ls_90")).await.unwrap();
    assert_eq!(result, ReconcileResult::Applied);

    let live = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(live.status, StreamStatus::Live);
    assert!(live.started_at.is_some());

    backdate_start(&store, stream.id, 90).await;

    let result = reconciler.reconcile(idle("ls_90")).await.unwrap();
    assert_eq!(result, ReconcileResult::Applied);

    let ended = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(ended.status, StreamStatus::Ended);
    assert!(ended.ended_at.is_some());

    let recording = store
        .recording_for_stream(stream.id)
        .await
        .unwrap()
        .expect("recording should exist for a 90s stream");
    assert_eq!(recording.status, RecordingStatus::Pending);
    assert_eq!(recording.creator_id, Some(stream.creator_id));
    assert_eq!(recording.title, "Friday AMA");
}

#[tokio::test]
async fn forty_five_second_stream_produces_no_recording() {
    let (store, reconciler) = harness();
    let stream = store
        .insert_stream(configuring_stream("ls_45"))
        .await
        .unwrap();

    reconciler.reconcile(started("ls_45")).await.unwrap();
    backdate_start(&store, stream.id, 45).await;
    reconciler.reconcile(idle("ls_45")).await.unwrap();

    let ended = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(ended.status, StreamStatus::Ended);
    assert!(store
        .recording_for_stream(stream.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn duplicate_started_does_not_reset_started_at() {
    let (store, reconciler) = harness();
    let stream = store
        .insert_stream(configuring_stream("ls_dup"))
        .await
        .unwrap();

    reconciler.reconcile(started("ls_dup")).await.unwrap();
    let first = store.stream(stream.id).await.unwrap().unwrap();

    let result = reconciler.reconcile(started("ls_dup")).await.unwrap();
    assert_eq!(result, ReconcileResult::AlreadyApplied);

    let second = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(second.started_at, first.started_at);
    assert_eq!(second.version, first.version);
}

#[tokio::test]
async fn late_started_cannot_resurrect_an_ended_stream() {
    let (store, reconciler) = harness();
    let stream = store
        .insert_stream(configuring_stream("ls_flap"))
        .await
        .unwrap();

    reconciler.reconcile(started("ls_flap")).await.unwrap();
    backdate_start(&store, stream.id, 120).await;
    reconciler.reconcile(idle("ls_flap")).await.unwrap();

    // the flapping connection redelivers a stale `started`
    let result = reconciler.reconcile(started("ls_flap")).await.unwrap();
    assert_eq!(result, ReconcileResult::AlreadyApplied);

    let stream = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(stream.status, StreamStatus::Ended);
}

#[tokio::test]
async fn stream_events_for_unknown_streams_are_noops() {
    let (_store, reconciler) = harness();
    assert_eq!(
        reconciler.reconcile(started("ls_ghost")).await.unwrap(),
        ReconcileResult::UnknownTarget
    );
    assert_eq!(
        reconciler.reconcile(idle("ls_ghost")).await.unwrap(),
        ReconcileResult::UnknownTarget
    );
}

#[tokio::test]
async fn title_only_asset_ready_attaches_to_processing_recording() {
    let (store, reconciler) = harness();
    let rec = store
        .insert_recording(pending_recording("Friday AMA", None, Some(Uuid::new_v4())))
        .await
        .unwrap();

    let mut asset = bare_asset("as_title");
    asset.name = Some("Friday AMA".to_string());
    asset.duration_seconds = Some(1800.0);

    let result = reconciler.reconcile(asset_ready(asset)).await.unwrap();
    assert_eq!(result, ReconcileResult::Applied);

    let rec = store.recording(rec.id).await.unwrap().unwrap();
    assert_eq!(rec.status, RecordingStatus::Ready);
    assert_eq!(rec.duration_seconds, Some(1800));
    assert_eq!(rec.provider_asset_id.as_deref(), Some("as_title"));
    assert!(rec.ready_at.is_some());
    // attached, not orphaned
    assert!(rec.creator_id.is_some());
}

#[tokio::test]
async fn asset_ready_applied_twice_is_idempotent() {
    let (store, reconciler) = harness();
    let stream = store
        .insert_stream(configuring_stream("ls_idem"))
        .await
        .unwrap();
    let rec = store
        .insert_recording(pending_recording(
            "Friday AMA",
            Some(stream.id),
            Some(stream.creator_id),
        ))
        .await
        .unwrap();

    let mut asset = bare_asset("as_idem");
    asset.source_session_id = Some("ls_idem".to_string());
    asset.playback_id = Some("pb_1".to_string());
    asset.duration_seconds = Some(1800.0);
    asset.size_bytes = Some(1_234_567);
    asset.max_resolution = Some("1920x1080".to_string());

    reconciler
        .reconcile(asset_ready(asset.clone()))
        .await
        .unwrap();
    let once = store.recording(rec.id).await.unwrap().unwrap();

    reconciler.reconcile(asset_ready(asset)).await.unwrap();
    let twice = store.recording(rec.id).await.unwrap().unwrap();

    assert_eq!(twice.status, once.status);
    assert_eq!(twice.playback_url, once.playback_url);
    assert_eq!(twice.duration_seconds, once.duration_seconds);
    assert_eq!(twice.size_bytes, once.size_bytes);
    assert_eq!(twice.resolution, once.resolution);
    assert_eq!(twice.ready_at, once.ready_at);

    assert_eq!(once.status, RecordingStatus::Ready);
    assert_eq!(
        once.playback_url.as_deref(),
        Some("https://cdn.test/hls/pb_1.m3u8")
    );
}

#[tokio::test]
async fn differing_redelivery_overwrites_because_provider_wins() {
    let (store, reconciler) = harness();
    let rec = store
        .insert_recording(pending_recording("Friday AMA", None, Some(Uuid::new_v4())))
        .await
        .unwrap();

    let mut asset = bare_asset("as_lww");
    asset.name = Some("Friday AMA".to_string());
    asset.duration_seconds = Some(1700.0);
    reconciler
        .reconcile(asset_ready(asset.clone()))
        .await
        .unwrap();

    asset.duration_seconds = Some(1800.0);
    reconciler.reconcile(asset_ready(asset)).await.unwrap();

    let rec = store.recording(rec.id).await.unwrap().unwrap();
    assert_eq!(rec.duration_seconds, Some(1800));
}

#[tokio::test]
async fn asset_failed_sets_failure_note_but_never_clobbers_ready() {
    let (store, reconciler) = harness();
    let rec = store
        .insert_recording(pending_recording("Take one", None, Some(Uuid::new_v4())))
        .await
        .unwrap();

    let mut asset = bare_asset("as_fail");
    asset.name = Some("Take one".to_string());
    asset.error_message = Some("input file unreadable".to_string());

    let result = reconciler
        .reconcile(ParsedEvent::AssetFailed {
            event_id: Uuid::new_v4().to_string(),
            asset: asset.clone(),
        })
        .await
        .unwrap();
    assert_eq!(result, ReconcileResult::Applied);

    let failed = store.recording(rec.id).await.unwrap().unwrap();
    assert_eq!(failed.status, RecordingStatus::Failed);
    assert_eq!(
        failed.failure_reason.as_deref(),
        Some("input file unreadable")
    );

    // a ready recording ignores a late failed event
    let rec2 = store
        .insert_recording(pending_recording("Take two", None, Some(Uuid::new_v4())))
        .await
        .unwrap();
    let mut ready = bare_asset("as_ok");
    ready.name = Some("Take two".to_string());
    reconciler.reconcile(asset_ready(ready)).await.unwrap();

    let mut late_fail = bare_asset("as_ok");
    late_fail.error_message = Some("late failure".to_string());
    let result = reconciler
        .reconcile(ParsedEvent::AssetFailed {
            event_id: Uuid::new_v4().to_string(),
            asset: late_fail,
        })
        .await
        .unwrap();
    assert_eq!(result, ReconcileResult::AlreadyApplied);
    let rec2 = store.recording(rec2.id).await.unwrap().unwrap();
    assert_eq!(rec2.status, RecordingStatus::Ready);
}

#[tokio::test]
async fn unmatched_asset_creates_exactly_one_orphan() {
    let (store, reconciler) = harness();

    let mut asset = bare_asset("as_orphan");
    asset.name = Some("Lost broadcast".to_string());
    asset.duration_seconds = Some(600.0);
    asset.playback_id = Some("pb_lost".to_string());

    let result = reconciler
        .reconcile(asset_ready(asset.clone()))
        .await
        .unwrap();
    let ReconcileResult::OrphanCreated(orphan_id) = result else {
        panic!("expected an orphan, got {result:?}");
    };

    let orphan = store.recording(orphan_id).await.unwrap().unwrap();
    assert!(orphan.is_orphan());
    assert!(orphan.stream_id.is_none());
    assert_eq!(orphan.status, RecordingStatus::Ready);
    assert_eq!(orphan.title, "Lost broadcast");
    assert_eq!(orphan.visibility, Visibility::Private);

    // redelivery of the same asset reaches the orphan via the asset-id
    // matcher instead of creating a second record
    let result = reconciler.reconcile(asset_ready(asset)).await.unwrap();
    assert_eq!(result, ReconcileResult::Applied);
    assert_eq!(store.unresolved_orphans(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn orphan_sweep_attaches_once_the_stream_appears() {
    let (store, reconciler) = harness();

    let mut asset = bare_asset("as_early");
    asset.name = Some("Early bird".to_string());
    asset.source_session_id = Some("ls_late".to_string());

    // asset.ready arrives before we ever heard of the stream
    let result = reconciler
        .reconcile(asset_ready(asset))
        .await
        .unwrap();
    let ReconcileResult::OrphanCreated(orphan_id) = result else {
        panic!("expected an orphan, got {result:?}");
    };

    // the stream record shows up afterwards
    let stream = store
        .insert_stream(configuring_stream("ls_late"))
        .await
        .unwrap();

    let attached = reconciler.sweep_orphans().await.unwrap();
    assert_eq!(attached, 1);

    let orphan = store.recording(orphan_id).await.unwrap().unwrap();
    assert_eq!(orphan.creator_id, Some(stream.creator_id));
    assert_eq!(orphan.stream_id, Some(stream.id));
    assert!(store.unresolved_orphans(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn creator_end_and_provider_idle_race_creates_one_recording() {
    let (store, reconciler) = harness();
    let stream = store
        .insert_stream(configuring_stream("ls_race"))
        .await
        .unwrap();
    reconciler.reconcile(started("ls_race")).await.unwrap();
    backdate_start(&store, stream.id, 300).await;

    // explicit creator stop and the provider's idle webhook race; the
    // conditional update lets exactly one of them observe the edge
    let first = reconciler.mark_ended(stream.id).await.unwrap();
    let second = reconciler.reconcile(idle("ls_race")).await.unwrap();
    assert_eq!(first, ReconcileResult::Applied);
    assert_eq!(second, ReconcileResult::AlreadyApplied);

    let recordings = store
        .recordings_in_status(
            &[RecordingStatus::Pending],
            Utc::now() - Duration::hours(1),
            10,
        )
        .await
        .unwrap();
    assert_eq!(recordings.len(), 1);
}
