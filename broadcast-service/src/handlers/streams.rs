//! Stream handlers - creator and viewer HTTP endpoints

use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;
use validator::Validate;

use super::{require_user, requester_from, AppState};
use crate::error::{AppError, Result};
use crate::models::{CreateStreamRequest, JoinStreamResponse, UpdateStreamRequest};

/// Create a new stream for the authenticated creator.
pub async fn create_stream(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateStreamRequest>,
) -> Result<HttpResponse> {
    let creator_id = require_user(&req)?;
    body.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let response = state
        .streams
        .create_stream(creator_id, body.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(response))
}

/// Public discovery: currently-live streams.
pub async fn list_live(state: web::Data<AppState>) -> Result<HttpResponse> {
    let streams = state.streams.list_live(100).await?;
    Ok(HttpResponse::Ok().json(streams))
}

pub async fn get_stream(
    state: web::Data<AppState>,
    stream_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let stream = state.streams.stream_details(stream_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(stream))
}

pub async fn update_stream(
    state: web::Data<AppState>,
    req: HttpRequest,
    stream_id: web::Path<Uuid>,
    body: web::Json<UpdateStreamRequest>,
) -> Result<HttpResponse> {
    let creator_id = require_user(&req)?;
    body.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let stream = state
        .streams
        .update_stream(creator_id, stream_id.into_inner(), body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(stream))
}

/// Explicit creator override onto the live state.
pub async fn go_live(
    state: web::Data<AppState>,
    req: HttpRequest,
    stream_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let creator_id = require_user(&req)?;
    let stream = state
        .streams
        .go_live(creator_id, stream_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(stream))
}

pub async fn end_stream(
    state: web::Data<AppState>,
    req: HttpRequest,
    stream_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let creator_id = require_user(&req)?;
    let stream = state
        .streams
        .end_stream(creator_id, stream_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(stream))
}

pub async fn regenerate_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    stream_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let creator_id = require_user(&req)?;
    let credential = state
        .streams
        .regenerate_credential(creator_id, stream_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "credential": credential })))
}

/// Playback descriptor, gated by the access resolver.
pub async fn stream_playback(
    state: web::Data<AppState>,
    req: HttpRequest,
    stream_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let requester = requester_from(&req);
    let descriptor = state
        .streams
        .playback_for_stream(stream_id.into_inner(), &requester)
        .await?;
    Ok(HttpResponse::Ok().json(descriptor))
}

/// Viewer joins a live stream; anonymous viewers are welcome.
pub async fn join_stream(
    state: web::Data<AppState>,
    req: HttpRequest,
    stream_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let requester = requester_from(&req);
    let joined = state
        .tracker
        .join(stream_id.into_inner(), requester.user_id)
        .await?;

    Ok(HttpResponse::Ok().json(JoinStreamResponse {
        session_id: joined.session.id,
        playback_url: joined.playback_url,
        current_viewers: joined.counts.current,
    }))
}

pub async fn leave_stream(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    state.tracker.leave(session_id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn heartbeat(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    state.tracker.heartbeat(session_id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
