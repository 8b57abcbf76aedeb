//! Inbound provider webhook endpoint
//!
//! The provider redelivers on anything but a 2xx, so the response contract
//! is strict: 401 only on signature failure, 200 `{"received": true}` for
//! every handled outcome (applied, duplicate, no-op, orphan), and 5xx only
//! when the event could not be durably applied, which is exactly when
//! redelivery is wanted.

use std::time::{Duration, Instant};

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::{error, warn};

use super::AppState;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::services::reconciler::ReconcileResult;
use crate::services::{IngestOutcome, ParsedEvent};

const SIGNATURE_HEADER: &str = "x-provider-signature";

pub async fn provider_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.ingress.ingest(&body, signature)?;
    let received = json!({ "received": true });

    match outcome {
        IngestOutcome::Duplicate {
            event_id,
            event_type,
        } => {
            metrics::record_webhook_outcome(&event_type, "duplicate");
            tracing::debug!(%event_id, %event_type, "Acknowledged duplicate webhook");
            Ok(HttpResponse::Ok().json(received))
        }
        IngestOutcome::Discarded { event_type } => {
            metrics::record_webhook_outcome(&event_type, "discarded");
            Ok(HttpResponse::Ok().json(received))
        }
        IngestOutcome::Event(event) => {
            let event_type = event.event_type();
            let event_id = event.event_id().to_string();
            let started = Instant::now();
            let budget = Duration::from_millis(state.config.lifecycle.event_timeout_ms);

            match tokio::time::timeout(budget, reconcile_with_retry(&state, event)).await {
                Ok(Ok(result)) => {
                    state.ingress.mark_processed(&event_id);
                    metrics::observe_webhook(event_type, result.label(), started.elapsed());
                    Ok(HttpResponse::Ok().json(received))
                }
                Ok(Err(err)) => {
                    metrics::record_webhook_outcome(event_type, "error");
                    error!(
                        %event_id,
                        event_type,
                        error = %err,
                        alert = true,
                        "Webhook reconcile failed after bounded retries"
                    );
                    Err(err)
                }
                Err(_elapsed) => {
                    metrics::record_webhook_outcome(event_type, "timeout");
                    error!(
                        %event_id,
                        event_type,
                        alert = true,
                        "Webhook reconcile exceeded the per-event budget"
                    );
                    Err(AppError::Timeout)
                }
            }
        }
    }
}

/// Retry transient store failures with exponential backoff, bounded by
/// configuration. The provider's own redelivery backstops anything that
/// still fails here.
async fn reconcile_with_retry(
    state: &AppState,
    event: ParsedEvent,
) -> Result<ReconcileResult> {
    let attempts = state.config.lifecycle.store_retry_attempts.max(1);
    let base = Duration::from_millis(state.config.lifecycle.store_retry_base_ms);
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(base * 2u32.pow(attempt - 1)).await;
        }
        match state.reconciler.reconcile(event.clone()).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retriable() => {
                warn!(attempt, error = %err, "Transient store failure; retrying");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err
        .unwrap_or_else(|| AppError::TransientStore("retry budget exhausted".to_string())))
}
