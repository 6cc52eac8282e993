use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the request/response API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: u32,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("api error {status} (code {code}): {message}")]
pub struct ApiException {
    pub status: u16,
    pub code: u32,
    pub message: String,
}

impl ApiException {
    pub fn from_body(status: u16, body: ApiError) -> Self {
        Self {
            status,
            code: body.code,
            message: body.message,
        }
    }
}

impl From<ApiException> for ApiError {
    fn from(value: ApiException) -> Self {
        Self {
            code: value.code,
            message: value.message,
        }
    }
}
