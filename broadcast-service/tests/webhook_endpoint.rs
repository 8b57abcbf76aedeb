//! HTTP surface tests
//!
//! Boots the real route table on the in-memory store and drives it the way
//! the provider and clients do: raw signed webhook bodies in, JSON out.
//! The response contract matters here: 401 only for signature failures,
//! 200 `{"received": true}` for every handled webhook outcome.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use actix_web::{test, web, App};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::broadcast;
use uuid::Uuid;

use broadcast_service::config::{
    AccessConfig, AppConfig, Config, DatabaseConfig, LifecycleConfig, ProviderConfig,
    ViewerConfig,
};
use broadcast_service::handlers::{routes, AppState};
use broadcast_service::models::{
    ContentMode, MembershipTier, Stream, StreamStatus, Visibility,
};
use broadcast_service::services::{EventIngress, Reconciler, StreamService, ViewerTracker};
use broadcast_service::store::memory::MemoryLifecycleStore;
use broadcast_service::store::LifecycleStore;
use provider_client::ProviderClient;

const SECRET: &str = "whsec_endpoint_test";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn test_config() -> Config {
    Config {
        app: AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            env: "test".to_string(),
        },
        database: DatabaseConfig {
            url: None,
            max_connections: 5,
        },
        provider: ProviderConfig {
            api_base: "http://127.0.0.1:9".to_string(),
            api_token: String::new(),
            webhook_secret: SECRET.to_string(),
            playback_base: "https://cdn.test/hls".to_string(),
        },
        lifecycle: LifecycleConfig {
            min_recording_secs: 60,
            dedup_window_secs: 300,
            event_timeout_ms: 5_000,
            store_retry_attempts: 3,
            store_retry_base_ms: 10,
            match_window_secs: 86_400,
            match_scan_limit: 50,
            orphan_sweep_interval_secs: 300,
        },
        viewers: ViewerConfig {
            session_ttl_secs: 120,
            sweep_interval_secs: 30,
        },
        access: AccessConfig {
            min_member_tier: MembershipTier::Member,
        },
    }
}

fn build_state() -> (Arc<MemoryLifecycleStore>, AppState) {
    let config = test_config();
    let store = Arc::new(MemoryLifecycleStore::new());
    let store_dyn: Arc<dyn LifecycleStore> = store.clone();
    let (updates, _) = broadcast::channel(64);

    let provider = Arc::new(ProviderClient::new(
        config.provider.api_base.clone(),
        config.provider.api_token.clone(),
    ));
    let ingress = Arc::new(EventIngress::new(
        config.provider.webhook_secret.clone(),
        StdDuration::from_secs(config.lifecycle.dedup_window_secs),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store_dyn.clone(),
        updates.clone(),
        config.lifecycle.clone(),
        config.provider.playback_base.clone(),
    ));
    let tracker = Arc::new(ViewerTracker::new(
        store_dyn.clone(),
        updates,
        config.viewers.session_ttl_secs,
    ));
    let streams = Arc::new(StreamService::new(
        store_dyn.clone(),
        provider,
        reconciler.clone(),
        config.provider.playback_base.clone(),
        config.access.min_member_tier,
    ));

    let state = AppState {
        config,
        store: store_dyn,
        ingress,
        reconciler,
        tracker,
        streams,
    };
    (store, state)
}

fn seeded_stream(provider_id: &str, visibility: Visibility, status: StreamStatus) -> Stream {
    let now = Utc::now();
    Stream {
        id: Uuid::new_v4(),
        creator_id: Uuid::new_v4(),
        provider_stream_id: Some(provider_id.to_string()),
        credential: Uuid::new_v4().simple().to_string(),
        title: "Endpoint test".to_string(),
        visibility,
        mode: ContentMode::Video,
        status,
        playback_url: Some("https://cdn.test/hls/pb.m3u8".to_string()),
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

#[actix_web::test]
async fn webhook_without_signature_is_rejected() {
    let (_store, state) = build_state();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    let body = br#"{"id": "evt_1", "type": "stream.started", "data": {"id": "ls_1"}}"#;
    let req = test::TestRequest::post()
        .uri("/webhooks/provider")
        .set_payload(body.to_vec())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn webhook_with_bad_signature_is_rejected() {
    let (_store, state) = build_state();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    let body = br#"{"id": "evt_1", "type": "stream.started", "data": {"id": "ls_1"}}"#;
    let req = test::TestRequest::post()
        .uri("/webhooks/provider")
        .insert_header(("x-provider-signature", "deadbeef"))
        .set_payload(body.to_vec())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn signed_started_event_marks_the_stream_live() {
    let (store, state) = build_state();
    let stream = store
        .insert_stream(seeded_stream(
            "ls_go",
            Visibility::Public,
            StreamStatus::Configuring,
        ))
        .await
        .unwrap();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    let body = br#"{"id": "evt_go", "type": "stream.started", "data": {"id": "ls_go"}}"#;
    let req = test::TestRequest::post()
        .uri("/webhooks/provider")
        .insert_header(("x-provider-signature", sign(body)))
        .set_payload(body.to_vec())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let payload: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(payload["received"], true);

    let stream = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(stream.status, StreamStatus::Live);
}

#[actix_web::test]
async fn duplicate_delivery_is_acknowledged_without_reprocessing() {
    let (store, state) = build_state();
    let stream = store
        .insert_stream(seeded_stream(
            "ls_dup",
            Visibility::Public,
            StreamStatus::Configuring,
        ))
        .await
        .unwrap();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    let body = br#"{"id": "evt_dup", "type": "stream.started", "data": {"id": "ls_dup"}}"#;
    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri("/webhooks/provider")
            .insert_header(("x-provider-signature", sign(body)))
            .set_payload(body.to_vec())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
    }

    let after = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(after.status, StreamStatus::Live);
    // the second delivery was deduplicated before touching the store
    assert_eq!(after.version, 1);
}

#[actix_web::test]
async fn unknown_event_types_are_acknowledged() {
    let (_store, state) = build_state();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    let body = br#"{"id": "evt_x", "type": "caption.ready", "data": {"id": "c_1"}}"#;
    let req = test::TestRequest::post()
        .uri("/webhooks/provider")
        .insert_header(("x-provider-signature", sign(body)))
        .set_payload(body.to_vec())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let payload: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(payload["received"], true);
}

#[actix_web::test]
async fn members_stream_playback_walks_the_denial_ladder() {
    let (store, state) = build_state();
    let stream = store
        .insert_stream(seeded_stream(
            "ls_members",
            Visibility::Members,
            StreamStatus::Live,
        ))
        .await
        .unwrap();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    // anonymous → 401 not_authenticated
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/streams/{}/playback", stream.id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let payload: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(payload["reason"], "not_authenticated");

    // free tier → 403 insufficient_tier
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/streams/{}/playback", stream.id))
        .insert_header(("x-user-id", Uuid::new_v4().to_string()))
        .insert_header(("x-user-tier", "free"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    let payload: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(payload["reason"], "insufficient_tier");

    // member tier → playback descriptor with the URL
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/streams/{}/playback", stream.id))
        .insert_header(("x-user-id", Uuid::new_v4().to_string()))
        .insert_header(("x-user-tier", "member"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let payload: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(payload["status"], "live");
    assert_eq!(payload["playback_url"], "https://cdn.test/hls/pb.m3u8");
}

#[actix_web::test]
async fn viewers_join_and_leave_over_http() {
    let (store, state) = build_state();
    let stream = store
        .insert_stream(seeded_stream(
            "ls_join",
            Visibility::Public,
            StreamStatus::Live,
        ))
        .await
        .unwrap();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/streams/{}/viewers", stream.id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let payload: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(payload["current_viewers"], 1);
    let session_id = payload["session_id"].as_str().unwrap().to_string();

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/viewers/{session_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    let after = store.stream(stream.id).await.unwrap().unwrap();
    assert_eq!(after.current_viewers, 0);
}

#[actix_web::test]
async fn processing_recording_playback_reports_processing() {
    use broadcast_service::models::{Recording, RecordingStatus};

    let (store, state) = build_state();
    let now = Utc::now();
    let creator = Uuid::new_v4();
    let recording = store
        .insert_recording(Recording {
            id: Uuid::new_v4(),
            stream_id: None,
            creator_id: Some(creator),
            provider_asset_id: None,
            source_session_id: None,
            title: "Still cooking".to_string(),
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
        })
        .await
        .unwrap();
    let app =
        test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/recordings/{}/playback", recording.id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let payload: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(payload["status"], "processing");
    assert!(payload["playback_url"].is_null());
}
