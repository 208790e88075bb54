//! Stable JSON error envelope: `{"error":{"code","message","details?"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::OpsdeckError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<OpsdeckError> for ApiError {
    fn from(err: OpsdeckError) -> Self {
        let status = match &err {
            OpsdeckError::NotFound(_) => StatusCode::NOT_FOUND,
            OpsdeckError::AlreadyExists(_) | OpsdeckError::Conflict(_) => StatusCode::CONFLICT,
            OpsdeckError::Validation(_) => StatusCode::BAD_REQUEST,
            OpsdeckError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            OpsdeckError::Forbidden(_) => StatusCode::FORBIDDEN,
            OpsdeckError::Transport(_) | OpsdeckError::Http(_) => StatusCode::BAD_GATEWAY,
            OpsdeckError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        if let Some(details) = self.details {
            body["error"]["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let not_found: ApiError = OpsdeckError::NotFound("environment x".into()).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.code, "not_found");

        let conflict: ApiError = OpsdeckError::Conflict("busy".into()).into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let transport: ApiError = OpsdeckError::Transport("refused".into()).into();
        assert_eq!(transport.status, StatusCode::BAD_GATEWAY);

        let validation: ApiError = OpsdeckError::Validation("bad".into()).into();
        assert_eq!(validation.status, StatusCode::BAD_REQUEST);
    }
}
