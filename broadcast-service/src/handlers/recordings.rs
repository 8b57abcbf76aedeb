//! Recording handlers - HTTP endpoints for archived broadcasts

use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;

use super::{require_user, requester_from, AppState};
use crate::error::Result;
use crate::models::RecordingResponse;

/// The authenticated creator's recordings, newest first.
pub async fn list_recordings(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse> {
    let creator_id = require_user(&req)?;
    let recordings = state.streams.recordings_for_creator(creator_id).await?;
    let responses: Vec<RecordingResponse> = recordings.into_iter().map(Into::into).collect();
    Ok(HttpResponse::Ok().json(responses))
}

/// Playback descriptor, gated by the access resolver. Recordings still
/// processing return a descriptor without a URL rather than an error.
pub async fn recording_playback(
    state: web::Data<AppState>,
    req: HttpRequest,
    recording_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let requester = requester_from(&req);
    let descriptor = state
        .streams
        .playback_for_recording(recording_id.into_inner(), &requester)
        .await?;
    Ok(HttpResponse::Ok().json(descriptor))
}

/// Soft-delete a recording (owner or admin).
pub async fn delete_recording(
    state: web::Data<AppState>,
    req: HttpRequest,
    recording_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    require_user(&req)?;
    let requester = requester_from(&req);
    state
        .streams
        .delete_recording(&requester, recording_id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
