//! Relay error types
//!
//! Every error the relay surfaces to a client renders as the OpenAI-style
//! JSON error object so existing SDKs can read it.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error object in the OpenAI wire shape, also used to parse upstream errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: String,
    /// Upstream implementations send strings or numbers here.
    #[serde(default)]
    pub code: Value,
    #[serde(default)]
    pub param: Option<String>,
}

impl ApiError {
    pub fn code_str(&self) -> Option<&str> {
        self.code.as_str()
    }
}

/// Error raised by the relay pipeline, carrying the HTTP status to render.
#[derive(Debug, Clone)]
pub struct RelayError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub code: String,
    pub message: String,
    pub param: Option<String>,
}

impl RelayError {
    /// Error originating in the relay itself.
    pub fn one_api(code: &str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type: "one_api_error",
            code: code.to_string(),
            message: message.into(),
            param: None,
        }
    }

    /// Non-2xx response from the upstream vendor, wrapped verbatim.
    pub fn upstream(status: StatusCode, upstream: &ApiError) -> Self {
        Self {
            status,
            error_type: "upstream_error",
            code: "bad_response_status_code".to_string(),
            message: if upstream.message.is_empty() {
                format!("upstream returned status {}", status.as_u16())
            } else {
                upstream.message.clone()
            },
            param: Some(status.as_u16().to_string()),
        }
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::one_api(code, StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(code: &str, message: impl Into<String>) -> Self {
        Self::one_api(code, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn insufficient_quota() -> Self {
        Self::one_api(
            "insufficient_user_quota",
            StatusCode::FORBIDDEN,
            "user quota is not enough",
        )
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        tracing::warn!(
            status = self.status.as_u16(),
            code = %self.code,
            "returning relay error: {}",
            self.message
        );
        (
            self.status,
            Json(serde_json::json!({
                "error": {
                    "message": self.message,
                    "type": self.error_type,
                    "code": self.code,
                    "param": self.param,
                }
            })),
        )
            .into_response()
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Whether an upstream response indicates the channel's credentials are dead
/// and the channel should be flagged for automatic disable.
///
/// Pure predicate; the `automatic_disable_channel` option gates whether the
/// caller acts on it.
pub fn should_disable(error: Option<&ApiError>, status: u16) -> bool {
    if status == 401 {
        return true;
    }
    let Some(error) = error else {
        return false;
    };
    if error.error_type == "insufficient_quota" {
        return true;
    }
    matches!(
        error.code_str(),
        Some("invalid_api_key") | Some("account_deactivated")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_disable_nil_error() {
        assert!(!should_disable(None, 200));
        assert!(!should_disable(None, 429));
        assert!(!should_disable(None, 500));
    }

    #[test]
    fn test_should_disable_on_401() {
        assert!(should_disable(None, 401));
        assert!(should_disable(Some(&ApiError::default()), 401));
    }

    #[test]
    fn test_should_disable_on_error_kind() {
        let err = ApiError {
            error_type: "insufficient_quota".to_string(),
            ..Default::default()
        };
        assert!(should_disable(Some(&err), 200));

        let err = ApiError {
            code: serde_json::json!("invalid_api_key"),
            ..Default::default()
        };
        assert!(should_disable(Some(&err), 400));

        let err = ApiError {
            code: serde_json::json!("account_deactivated"),
            ..Default::default()
        };
        assert!(should_disable(Some(&err), 400));

        let err = ApiError {
            code: serde_json::json!("context_length_exceeded"),
            ..Default::default()
        };
        assert!(!should_disable(Some(&err), 400));
    }

    #[test]
    fn test_error_wire_shape() {
        let err = RelayError::bad_request("prompt_missing", "prompt is required");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type, "one_api_error");

        let upstream = ApiError {
            message: "invalid key".to_string(),
            error_type: "invalid_request_error".to_string(),
            code: serde_json::json!("invalid_api_key"),
            param: None,
        };
        let wrapped = RelayError::upstream(StatusCode::UNAUTHORIZED, &upstream);
        assert_eq!(wrapped.code, "bad_response_status_code");
        assert_eq!(wrapped.param.as_deref(), Some("401"));
        assert_eq!(wrapped.message, "invalid key");
    }

    #[test]
    fn test_numeric_upstream_code_parses() {
        let err: ApiError = serde_json::from_value(serde_json::json!({
            "message": "boom",
            "type": "server_error",
            "code": 500
        }))
        .unwrap();
        assert!(err.code_str().is_none());
        assert!(!should_disable(Some(&err), 500));
    }
}
