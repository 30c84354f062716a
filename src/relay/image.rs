//! Image generation relay
//!
//! Buffered flow: validate against the per-model limits, price the request
//! up front, admit, forward, and settle the fixed cost once the upstream
//! delivers. An upstream failure settles zero — nothing billable was made.

use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    response::Response,
};
use reqwest::Method;
use uuid::Uuid;

use super::adapter;
use super::client;
use super::context::{ImageRequest, RelayContext, TokenUsage};
use super::error::{RelayError, RelayResult};
use super::executor::{self, CommitGuard, CostBasis};
use super::RelayState;
use crate::pricing;

/// Relay an image generation request end to end.
pub async fn relay_image(
    state: &RelayState,
    ctx: &RelayContext,
    path_and_query: &str,
    body: Bytes,
) -> RelayResult<Response> {
    let request_id = Uuid::new_v4();

    // PARSE
    let mut request: ImageRequest = serde_json::from_slice(&body).map_err(|e| {
        RelayError::bad_request("bind_request_body_failed", format!("invalid request body: {}", e))
    })?;
    let billing_model = request.model.clone();

    tracing::debug!(
        request_id = %request_id,
        model = %billing_model,
        size = %request.size,
        n = request.n,
        "image relay started"
    );

    // ESTIMATE (validation first: a rejected request never reaches pricing)
    pricing::validate_image_request(&request)?;
    let size_ratio = pricing::image_size_ratio(&billing_model, &request.size, request.quality)?;
    let model_ratio = pricing::model_ratio(&billing_model);
    let group_ratio = pricing::group_ratio(&ctx.group);
    let quota = pricing::image_cost(model_ratio * group_ratio, size_ratio, request.n);

    // ADMIT
    state.ledger.admit(ctx, quota).await?;

    // RESOLVE
    let upstream_model = ctx
        .mapped_model(&billing_model)
        .map(str::to_string)
        .unwrap_or_else(|| billing_model.clone());
    let target = adapter::build_target(ctx, path_and_query, &upstream_model)?;
    let out_body = if upstream_model != request.model {
        request.model = upstream_model;
        Bytes::from(serde_json::to_vec(&request).map_err(|e| {
            RelayError::internal("set_request_body_failed", format!("rewrite body: {}", e))
        })?)
    } else {
        body
    };

    // The price is fixed before dispatch; the guard settles it (or zero, if
    // the upstream produced nothing) on every path from here on.
    let guard = CommitGuard::new(
        state.ledger.clone(),
        ctx,
        request_id,
        &billing_model,
        CostBasis::Fixed {
            quota,
            model_ratio,
            group_ratio,
        },
        Arc::new(Mutex::new(TokenUsage::default())),
    );

    // DISPATCH
    let upstream = match client::dispatch(
        client::http(),
        Method::POST,
        &target.url,
        target.headers,
        out_body,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            guard.void_billing();
            return Err(err);
        }
    };

    // RELAY
    let status = upstream.status();
    if status.as_u16() >= 400 {
        guard.void_billing();
        return Err(executor::handle_upstream_error(state, ctx, upstream).await);
    }

    let headers = upstream.headers().clone();
    let body = upstream.bytes().await.map_err(|e| {
        // delivery failed mid-read; the artifact still cost the upstream call
        RelayError::internal(
            "read_response_body_failed",
            format!("read upstream response: {}", e),
        )
    })?;

    let response = executor::propagate_response(status, &headers, body)?;
    drop(guard);
    Ok(response)
}
