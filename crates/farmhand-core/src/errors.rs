use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    Ending,
    ChannelClosed,
    Call,
    Internal,
}

/// Serializable error carried across the wire and surfaced on call futures.
///
/// This is the single error shape for both infrastructure failures and
/// user-code failures inside worker methods; `code` tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct FarmError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<String>,
}

impl FarmError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// A user-code failure inside a worker method.
    pub fn call(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Call, message)
    }

    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ChannelClosed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}
