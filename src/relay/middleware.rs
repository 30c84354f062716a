//! Relay middleware
//!
//! Resolves the caller's access token into a [`RelayContext`] and attaches it
//! to the request. The token lookup itself lives behind the
//! [`crate::ledger::TokenResolver`] collaborator; this layer only moves data.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::RelayError;
use super::RelayState;

/// Extract the access token from the request headers.
///
/// Accepts `Authorization: Bearer <token>` and the `x-api-key` form some
/// OpenAI-compatible clients send.
pub fn extract_access_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        return Some(token.to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Attach the resolved [`super::context::RelayContext`] to the request or
/// reject it.
pub async fn resolve_context(
    State(state): State<Arc<RelayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(key) = extract_access_token(request.headers()) else {
        return RelayError::one_api(
            "missing_access_token",
            StatusCode::UNAUTHORIZED,
            "access token is required",
        )
        .into_response();
    };

    match state.auth.resolve(&key).await {
        Ok(Some(ctx)) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Ok(None) => RelayError::one_api(
            "invalid_access_token",
            StatusCode::UNAUTHORIZED,
            "access token is not valid",
        )
        .into_response(),
        Err(err) => RelayError::internal(
            "resolve_access_token_failed",
            format!("token lookup: {}", err),
        )
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_access_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_access_token(&headers), None);

        headers.insert("authorization", "Bearer sk-abc ".parse().unwrap());
        assert_eq!(extract_access_token(&headers), Some("sk-abc".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-key".parse().unwrap());
        assert_eq!(extract_access_token(&headers), Some("sk-key".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer ".parse().unwrap());
        assert_eq!(extract_access_token(&headers), None);
    }
}
