//! Service layer for the broadcast service
//!
//! This module contains the business logic:
//! - Webhook event ingress (authentication, dedup, parsing)
//! - Reconciliation engine and its matching strategies
//! - Stream lifecycle operations (creator- and viewer-facing)
//! - Viewer session tracking
//! - Access resolution

pub mod access;
pub mod ingress;
pub mod matchers;
pub mod reconciler;
pub mod stream_service;
pub mod viewer_tracker;

// Re-export commonly used types
pub use access::{can_view_recording, can_view_stream, AccessDecision};
pub use ingress::{EventIngress, IngestOutcome, ParsedEvent};
pub use reconciler::{ReconcileResult, Reconciler};
pub use stream_service::StreamService;
pub use viewer_tracker::{JoinedSession, ViewerTracker};
