//! Webhook event ingress
//!
//! Authenticates, deduplicates, and parses inbound provider webhooks before
//! they reach the reconciliation engine. The provider delivers at-least-once
//! and out of order, so everything past the signature check is forgiving:
//! duplicates and unknown event types are acknowledged and dropped, never
//! errors.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamEventPayload {
    id: String,
}

/// Asset descriptor as delivered by the provider. Every field except the id
/// is optional; the matching strategies cope with whatever is present.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetEventPayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Provider live-session id linking the asset back to its stream.
    #[serde(default)]
    pub source_session_id: Option<String>,
    #[serde(default)]
    pub playback_id: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub max_resolution: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ParsedEvent {
    StreamStarted {
        event_id: String,
        provider_stream_id: String,
    },
    StreamIdle {
        event_id: String,
        provider_stream_id: String,
    },
    AssetReady {
        event_id: String,
        asset: AssetEventPayload,
    },
    AssetFailed {
        event_id: String,
        asset: AssetEventPayload,
    },
}

impl ParsedEvent {
    pub fn event_id(&self) -> &str {
        match self {
            Self::StreamStarted { event_id, .. }
            | Self::StreamIdle { event_id, .. }
            | Self::AssetReady { event_id, .. }
            | Self::AssetFailed { event_id, .. } => event_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StreamStarted { .. } => "stream.started",
            Self::StreamIdle { .. } => "stream.idle",
            Self::AssetReady { .. } => "asset.ready",
            Self::AssetFailed { .. } => "asset.failed",
        }
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// Authenticated, first-seen, recognized event to hand to the engine.
    Event(ParsedEvent),
    /// Redelivery of an already-processed event; acknowledge without work.
    Duplicate {
        event_id: String,
        event_type: String,
    },
    /// Unknown type or unusable payload; acknowledged and dropped so the
    /// provider never backlogs retries on events we will never consume.
    Discarded { event_type: String },
}

pub struct EventIngress {
    secret: String,
    window: Duration,
    seen: DashMap<String, Instant>,
}

impl EventIngress {
    pub fn new(secret: impl Into<String>, window: Duration) -> Self {
        Self {
            secret: secret.into(),
            window,
            seen: DashMap::new(),
        }
    }

    /// Validate and parse a raw webhook delivery.
    ///
    /// Only a signature failure is an error; every other outcome must be
    /// acknowledged to the provider.
    pub fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, AppError> {
        let signature = signature
            .ok_or_else(|| AppError::Authentication("missing webhook signature".to_string()))?;
        self.verify_signature(body, signature)?;

        let envelope: WebhookEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "Discarding webhook with unparseable body");
                return Ok(IngestOutcome::Discarded {
                    event_type: "malformed".to_string(),
                });
            }
        };

        if self.is_duplicate(&envelope.id) {
            debug!(event_id = %envelope.id, "Duplicate webhook delivery");
            return Ok(IngestOutcome::Duplicate {
                event_id: envelope.id,
                event_type: envelope.event_type,
            });
        }

        let event = match envelope.event_type.as_str() {
            "stream.started" | "stream.idle" => {
                let payload: StreamEventPayload = match serde_json::from_value(envelope.data) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(
                            event_id = %envelope.id,
                            event_type = %envelope.event_type,
                            error = %err,
                            "Discarding stream event with unusable payload"
                        );
                        return Ok(IngestOutcome::Discarded {
                            event_type: envelope.event_type,
                        });
                    }
                };
                if envelope.event_type == "stream.started" {
                    ParsedEvent::StreamStarted {
                        event_id: envelope.id,
                        provider_stream_id: payload.id,
                    }
                } else {
                    ParsedEvent::StreamIdle {
                        event_id: envelope.id,
                        provider_stream_id: payload.id,
                    }
                }
            }
            "asset.ready" | "asset.failed" => {
                let asset: AssetEventPayload = match serde_json::from_value(envelope.data) {
                    Ok(asset) => asset,
                    Err(err) => {
                        warn!(
                            event_id = %envelope.id,
                            event_type = %envelope.event_type,
                            error = %err,
                            "Discarding asset event with unusable payload"
                        );
                        return Ok(IngestOutcome::Discarded {
                            event_type: envelope.event_type,
                        });
                    }
                };
                if envelope.event_type == "asset.ready" {
                    ParsedEvent::AssetReady {
                        event_id: envelope.id,
                        asset,
                    }
                } else {
                    ParsedEvent::AssetFailed {
                        event_id: envelope.id,
                        asset,
                    }
                }
            }
            other => {
                debug!(event_id = %envelope.id, event_type = %other, "Ignoring unknown event type");
                return Ok(IngestOutcome::Discarded {
                    event_type: envelope.event_type,
                });
            }
        };

        Ok(IngestOutcome::Event(event))
    }

    /// Record a fully-processed event id so redeliveries short-circuit.
    /// Called only after the engine commits; a failed attempt stays
    /// retriable.
    pub fn mark_processed(&self, event_id: &str) {
        self.seen.insert(event_id.to_string(), Instant::now());
    }

    /// Drop dedup entries older than the window. Returns how many remain.
    pub fn sweep(&self) -> usize {
        let window = self.window;
        self.seen.retain(|_, seen_at| seen_at.elapsed() <= window);
        self.seen.len()
    }

    fn is_duplicate(&self, event_id: &str) -> bool {
        self.seen
            .get(event_id)
            .map(|seen_at| seen_at.elapsed() <= self.window)
            .unwrap_or(false)
    }

    fn verify_signature(&self, body: &[u8], header: &str) -> Result<(), AppError> {
        let hex_digest = header.trim().trim_start_matches("sha256=");
        let digest = hex::decode(hex_digest)
            .map_err(|_| AppError::Authentication("malformed webhook signature".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body);
        mac.verify_slice(&digest)
            .map_err(|_| AppError::Authentication("webhook signature mismatch".to_string()))
    }
}
