use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Numbering mode not set, use board or bcm numbering first")]
    NumberingNotSet,
    #[error("Invalid channel: {0}")]
    InvalidChannel(u32),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Channel {0} has not been set up as an input")]
    NotConfigured(u32),
    #[error("Callback already registered for gpio {0}")]
    DuplicateCallback(u32),
    #[error("Conflicting edge detection already enabled for gpio {0}")]
    ConflictingEdgeDetection(u32),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl AppError {
    /// Caller-side mistakes that are reported as-is and never retried.
    pub fn is_usage(&self) -> bool {
        !matches!(self, AppError::Config(_) | AppError::Gpio(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AppError::DuplicateCallback(_) | AppError::ConflictingEdgeDetection(_)
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        if self.is_conflict() {
            StatusCode::CONFLICT
        } else if self.is_usage() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
