//! HTTP handlers for the broadcast service
//!
//! This module contains HTTP handlers for:
//! - The inbound provider webhook endpoint
//! - Creator stream operations (create, end, credential, metadata)
//! - Viewer operations (discovery, playback, join/leave)
//! - Recording management

pub mod recordings;
pub mod streams;
pub mod webhooks;

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::metrics;
use crate::models::{MembershipTier, Requester, Role};
use crate::services::{EventIngress, Reconciler, StreamService, ViewerTracker};
use crate::store::LifecycleStore;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn LifecycleStore>,
    pub ingress: Arc<EventIngress>,
    pub reconciler: Arc<Reconciler>,
    pub tracker: Arc<ViewerTracker>,
    pub streams: Arc<StreamService>,
}

/// Route table, shared by `main` and the handler tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/webhooks/provider",
        web::post().to(webhooks::provider_webhook),
    )
    .route("/health", web::get().to(health))
    .route("/metrics", web::get().to(metrics::serve_metrics))
    .route("/api-docs/openapi.json", web::get().to(openapi_json))
    .service(
        web::scope("/api/v1")
            .route("/streams", web::post().to(streams::create_stream))
            .route("/streams/live", web::get().to(streams::list_live))
            .route("/streams/{id}", web::get().to(streams::get_stream))
            .route("/streams/{id}", web::patch().to(streams::update_stream))
            .route("/streams/{id}/go-live", web::post().to(streams::go_live))
            .route("/streams/{id}/end", web::post().to(streams::end_stream))
            .route(
                "/streams/{id}/credential",
                web::post().to(streams::regenerate_credential),
            )
            .route(
                "/streams/{id}/playback",
                web::get().to(streams::stream_playback),
            )
            .route("/streams/{id}/viewers", web::post().to(streams::join_stream))
            .route(
                "/viewers/{session_id}",
                web::delete().to(streams::leave_stream),
            )
            .route(
                "/viewers/{session_id}/heartbeat",
                web::post().to(streams::heartbeat),
            )
            .route("/recordings", web::get().to(recordings::list_recordings))
            .route(
                "/recordings/{id}/playback",
                web::get().to(recordings::recording_playback),
            )
            .route(
                "/recordings/{id}",
                web::delete().to(recordings::delete_recording),
            ),
    );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn openapi_json() -> HttpResponse {
    HttpResponse::Ok().json(crate::openapi::doc())
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Build the requester identity from the gateway-asserted headers. Absent or
/// unparseable headers degrade to an anonymous free-tier viewer.
pub fn requester_from(req: &HttpRequest) -> Requester {
    let user_id = header_str(req, "x-user-id").and_then(|v| Uuid::parse_str(v).ok());
    let tier = header_str(req, "x-user-tier")
        .and_then(MembershipTier::from_str)
        .unwrap_or(MembershipTier::Free);
    let role = header_str(req, "x-user-role")
        .and_then(Role::from_str)
        .unwrap_or(Role::Viewer);

    Requester {
        user_id,
        tier,
        role,
    }
}

/// Creator operations require an authenticated principal.
pub fn require_user(req: &HttpRequest) -> Result<Uuid, AppError> {
    requester_from(req)
        .user_id
        .ok_or_else(|| AppError::Authentication("authenticated user required".to_string()))
}
