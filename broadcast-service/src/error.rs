use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::models::DenialReason;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, AppError>;

/// Service error taxonomy.
///
/// Only `Authentication` and exhausted store retries surface to the webhook
/// sender as failures; everything else on the reconcile path degrades to an
/// acknowledged no-op so the provider never believes an event was lost.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("access denied: {}", .0.as_str())]
    AccessDenied(DenialReason),

    #[error("transient store failure: {0}")]
    TransientStore(String),

    #[error("event processing timed out")]
    Timeout,

    #[error("provider request failed: {0}")]
    Provider(#[from] provider_client::ProviderError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::AccessDenied(reason) => match reason {
                DenialReason::NotAuthenticated => StatusCode::UNAUTHORIZED,
                DenialReason::NotFound => StatusCode::NOT_FOUND,
                DenialReason::InsufficientTier | DenialReason::Suspended => StatusCode::FORBIDDEN,
            },
            AppError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        let reason = match self {
            AppError::AccessDenied(reason) => Some(reason.as_str()),
            _ => None,
        };

        HttpResponse::build(code).json(ErrorResponse {
            error: self.to_string(),
            code: code.as_u16(),
            reason,
        })
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => AppError::TransientStore(msg),
            StoreError::Duplicate { field, value } => {
                AppError::Conflict(format!("duplicate {field}: {value}"))
            }
            StoreError::Other(err) => AppError::Internal(err),
        }
    }
}

impl AppError {
    /// Transient failures are worth retrying with backoff; everything else
    /// fails fast.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AppError::TransientStore(_))
    }
}
