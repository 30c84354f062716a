//! Relay module
//!
//! The OpenAI-compatible relay pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Request -> Middleware -> Executor -> Upstream
//!               |             |
//!               v             v
//!          RelayContext   parse -> resolve -> estimate -> admit
//!          (user, token,    -> dispatch -> stream/buffer -> commit
//!           channel, key)
//! ```
//!
//! ## API Endpoints
//!
//! - `POST /v1/chat/completions`
//! - `POST /v1/completions`
//! - `POST /v1/embeddings`
//! - `POST /v1/images/generations`
//! - `GET /healthz`
//!
//! ## Components
//!
//! - `middleware`: access-token resolution into a per-request context
//! - `adapter`: per-vendor URL and header rewriting
//! - `executor`: the relay state machine and deferred commit
//! - `stream`: SSE passthrough with incremental token counting
//! - `image`: the buffered image-generation flow
//! - `client`: shared HTTP clients
//! - `context` / `error`: shared data structures

pub mod adapter;
pub mod client;
pub mod context;
pub mod error;
pub mod executor;
pub mod image;
pub mod middleware;
pub mod stream;

use std::sync::Arc;

use axum::{
    extract::{Extension, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::ledger::{QuotaLedger, TokenResolver};

#[allow(unused_imports)]
pub use context::{RelayContext, TokenUsage};
#[allow(unused_imports)]
pub use error::{should_disable, RelayError, RelayResult};
#[allow(unused_imports)]
pub use executor::RelayMode;

/// Shared state for the relay routes.
pub struct RelayState {
    pub ledger: QuotaLedger,
    pub auth: Arc<dyn TokenResolver>,
}

/// Build the relay router. Relay routes sit behind the context middleware;
/// the health probe does not.
pub fn router(state: Arc<RelayState>) -> Router {
    let relay_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(image_generations))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::resolve_context,
        ))
        .with_state(state);

    Router::new().merge(relay_routes).route("/healthz", get(health))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Chat completions endpoint
///
/// Route: POST /v1/chat/completions
async fn chat_completions(
    State(state): State<Arc<RelayState>>,
    Extension(ctx): Extension<RelayContext>,
    request: Request,
) -> Response {
    relay(state, ctx, Some(RelayMode::ChatCompletions), request).await
}

/// Legacy completions endpoint
///
/// Route: POST /v1/completions
async fn completions(
    State(state): State<Arc<RelayState>>,
    Extension(ctx): Extension<RelayContext>,
    request: Request,
) -> Response {
    relay(state, ctx, Some(RelayMode::Completions), request).await
}

/// Embeddings endpoint
///
/// Route: POST /v1/embeddings
async fn embeddings(
    State(state): State<Arc<RelayState>>,
    Extension(ctx): Extension<RelayContext>,
    request: Request,
) -> Response {
    relay(state, ctx, Some(RelayMode::Embeddings), request).await
}

/// Image generation endpoint
///
/// Route: POST /v1/images/generations
async fn image_generations(
    State(state): State<Arc<RelayState>>,
    Extension(ctx): Extension<RelayContext>,
    request: Request,
) -> Response {
    relay(state, ctx, None, request).await
}

async fn relay(
    state: Arc<RelayState>,
    ctx: RelayContext,
    mode: Option<RelayMode>,
    request: Request,
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    // buffer the body once: counting and forwarding both need it
    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            return RelayError::one_api(
                "read_request_body_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("read request body: {}", err),
            )
            .into_response()
        }
    };

    let result = match mode {
        Some(mode) => executor::relay_text(&state, &ctx, mode, &path_and_query, body).await,
        None => image::relay_image(&state, &ctx, &path_and_query, body).await,
    };
    result.unwrap_or_else(|err| err.into_response())
}
