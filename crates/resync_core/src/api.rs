//! Backend response model.
//!
//! Every backend call yields a value together with response metadata, or an
//! [`ApiError`] carrying the same metadata. Classifiers only ever look at the
//! metadata, never at the value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error body returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// Error code (e.g. `"version.mismatch"`).
    #[serde(default)]
    pub code: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
}

/// HTTP-like response metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiResponse {
    /// Status code. `0` means the request never produced a response.
    pub status: u16,
    /// Correlation id echoed by the backend, if any.
    pub correlation_id: Option<String>,
    /// Parsed error body, if any.
    pub error: Option<ApiErrorBody>,
}

impl ApiResponse {
    /// Creates response metadata with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            correlation_id: None,
            error: None,
        }
    }

    /// Attaches an error body.
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ApiErrorBody {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Attaches a correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the error code, if the backend sent one.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// A successful backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply<T> {
    /// Decoded value.
    pub value: T,
    /// Response metadata.
    pub response: ApiResponse,
}

impl<T> ApiReply<T> {
    /// Creates a reply with the given status.
    pub fn new(value: T, status: u16) -> Self {
        Self {
            value,
            response: ApiResponse::new(status),
        }
    }

    /// Creates a `200 OK` reply.
    pub fn ok(value: T) -> Self {
        Self::new(value, 200)
    }

    /// Maps the value, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiReply<U> {
        ApiReply {
            value: f(self.value),
            response: self.response,
        }
    }
}

/// A failed backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("API error {}: {}", .response.status, .message)]
pub struct ApiError {
    /// Response metadata of the failed call.
    pub response: ApiResponse,
    /// Error message.
    pub message: String,
}

impl ApiError {
    /// Creates an API error from response metadata.
    pub fn new(response: ApiResponse, message: impl Into<String>) -> Self {
        Self {
            response,
            message: message.into(),
        }
    }

    /// Creates an error for a status with a coded error body.
    pub fn status(status: u16, code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            response: ApiResponse::new(status).with_error(code, message.clone()),
            message,
        }
    }

    /// Creates an error for a request that never produced a response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ApiResponse::new(0), message)
    }

    /// Returns the status code.
    pub fn status_code(&self) -> u16 {
        self.response.status
    }
}

/// Result of a backend call.
pub type ApiResult<T> = Result<ApiReply<T>, ApiError>;
