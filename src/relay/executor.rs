//! Relay executor
//!
//! Drives a single text relay through its states: parse the buffered body,
//! resolve the channel target, estimate the admission cost, pre-check the
//! ledger, dispatch upstream, then stream or buffer the response back.
//! Settlement is a scoped guard created once billable work begins; it runs on
//! every exit path after that point, including client disconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use reqwest::Method;
use serde_json::Value;
use uuid::Uuid;

use super::adapter;
use super::client;
use super::context::{RelayContext, TextRequest, TokenUsage};
use super::error::{should_disable, ApiError, RelayError, RelayResult};
use super::stream;
use super::RelayState;
use crate::ledger::{CommitRecord, QuotaLedger};
use crate::{config, pricing, token};

/// Which OpenAI-compatible operation a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
        }
    }
}

/// How the settled quota is derived when the guard fires.
#[derive(Debug, Clone, Copy)]
pub enum CostBasis {
    /// Token-based models: ratio times observed usage.
    PerToken { model_ratio: f64, group_ratio: f64 },
    /// Image generations: priced up front, independent of tokens.
    Fixed {
        quota: i64,
        model_ratio: f64,
        group_ratio: f64,
    },
}

/// Scoped finalizer for the commit phase.
///
/// Created only after the upstream accepted the request; dropped when the
/// response (buffered or streamed) is done, at which point the observed cost
/// is settled on a background task. Mirrors the admission/commit split: a
/// request that never reaches billable work never constructs one.
pub struct CommitGuard {
    ledger: QuotaLedger,
    request_id: Uuid,
    user_id: i64,
    token_id: i64,
    token_name: String,
    channel_id: i64,
    consume_quota: bool,
    model: String,
    basis: CostBasis,
    usage: Arc<Mutex<TokenUsage>>,
    voided: AtomicBool,
}

impl CommitGuard {
    pub fn new(
        ledger: QuotaLedger,
        ctx: &RelayContext,
        request_id: Uuid,
        model: &str,
        basis: CostBasis,
        usage: Arc<Mutex<TokenUsage>>,
    ) -> Self {
        Self {
            ledger,
            request_id,
            user_id: ctx.user_id,
            token_id: ctx.token_id,
            token_name: ctx.token_name.clone(),
            channel_id: ctx.channel_id,
            consume_quota: ctx.consume_quota,
            model: model.to_string(),
            basis,
            usage,
            voided: AtomicBool::new(false),
        }
    }

    /// Settle zero instead of the computed cost. Used when the upstream
    /// failed after the guard was armed and nothing billable was produced.
    pub fn void_billing(&self) {
        self.voided.store(true, Ordering::SeqCst);
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        let usage = *self.usage.lock().unwrap();
        let (quota, note) = match self.basis {
            CostBasis::PerToken {
                model_ratio,
                group_ratio,
            } => (
                pricing::completion_cost(
                    model_ratio * group_ratio,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                ),
                pricing::ratio_note(model_ratio, group_ratio),
            ),
            CostBasis::Fixed {
                quota,
                model_ratio,
                group_ratio,
            } => (quota, pricing::ratio_note(model_ratio, group_ratio)),
        };
        let quota = if self.voided.load(Ordering::SeqCst) {
            0
        } else {
            quota
        };
        let record = CommitRecord {
            request_id: self.request_id,
            user_id: self.user_id,
            token_id: self.token_id,
            token_name: std::mem::take(&mut self.token_name),
            channel_id: self.channel_id,
            consume_quota: self.consume_quota,
            model: std::mem::take(&mut self.model),
            usage,
            quota,
            note,
        };
        let ledger = self.ledger.clone();
        tokio::spawn(async move { ledger.commit(record).await });
    }
}

/// Relay a chat/completions/embeddings request end to end.
pub async fn relay_text(
    state: &RelayState,
    ctx: &RelayContext,
    mode: RelayMode,
    path_and_query: &str,
    body: Bytes,
) -> RelayResult<Response> {
    let request_id = Uuid::new_v4();

    // PARSE
    let mut request: TextRequest = serde_json::from_slice(&body).map_err(|e| {
        RelayError::bad_request("bind_request_body_failed", format!("invalid request body: {}", e))
    })?;
    let billing_model = request.model.clone();
    let is_stream = request.is_stream();

    tracing::debug!(
        request_id = %request_id,
        mode = mode.as_str(),
        model = %billing_model,
        stream = is_stream,
        "relay started"
    );

    // RESOLVE
    let upstream_model = ctx
        .mapped_model(&billing_model)
        .map(str::to_string)
        .unwrap_or_else(|| billing_model.clone());
    let target = adapter::build_target(ctx, path_and_query, &upstream_model)?;
    let out_body = if upstream_model != request.model {
        request.model = upstream_model.clone();
        Bytes::from(serde_json::to_vec(&request).map_err(|e| {
            RelayError::internal("set_request_body_failed", format!("rewrite body: {}", e))
        })?)
    } else {
        body
    };

    // ESTIMATE
    let prompt_tokens = match mode {
        RelayMode::ChatCompletions => {
            token::count_messages(&request.messages, &billing_model).await
                + token::count_functions(
                    request.functions.as_ref(),
                    request.function_call.as_ref(),
                    &billing_model,
                )
        }
        RelayMode::Completions => request
            .prompt
            .as_ref()
            .map(|prompt| token::count_input(prompt, &billing_model))
            .unwrap_or(0),
        RelayMode::Embeddings => request
            .input
            .as_ref()
            .map(|input| token::count_input(input, &billing_model))
            .unwrap_or(0),
    };
    let model_ratio = pricing::model_ratio(&billing_model);
    let group_ratio = pricing::group_ratio(&ctx.group);
    let ratio = model_ratio * group_ratio;
    let pre_consumed = pricing::admission_estimate(ratio, prompt_tokens, request.max_tokens);

    // ADMIT
    state.ledger.admit(ctx, pre_consumed).await?;

    // DISPATCH
    let http_client = if is_stream {
        client::streaming()
    } else {
        client::http()
    };
    let upstream = client::dispatch(
        http_client,
        Method::POST,
        &target.url,
        target.headers,
        out_body,
    )
    .await?;

    // RELAY
    let status = upstream.status();
    if status.as_u16() >= 400 {
        return Err(handle_upstream_error(state, ctx, upstream).await);
    }

    let usage = Arc::new(Mutex::new(TokenUsage::new(prompt_tokens, 0)));
    let guard = CommitGuard::new(
        state.ledger.clone(),
        ctx,
        request_id,
        &billing_model,
        CostBasis::PerToken {
            model_ratio,
            group_ratio,
        },
        usage.clone(),
    );

    if is_stream {
        return Ok(stream::passthrough(upstream, billing_model, usage, guard));
    }

    // buffered: read fully, reconcile usage, then hand the bytes back
    let headers = upstream.headers().clone();
    let body = upstream.bytes().await.map_err(|e| {
        RelayError::internal(
            "read_response_body_failed",
            format!("read upstream response: {}", e),
        )
    })?;

    if let Ok(parsed) = serde_json::from_slice::<Value>(&body) {
        let observed = extract_usage(&parsed);
        let mut tracked = usage.lock().unwrap();
        if observed.total() > 0 {
            *tracked = observed;
        } else {
            tracked.completion_tokens = count_completion_fallback(&parsed, &billing_model);
        }
    }

    let response = propagate_response(status, &headers, body)?;
    drop(guard); // response is assembled; settle now
    Ok(response)
}

/// Parse the upstream failure body, feed the channel-disable signal, and wrap
/// the error for the client. No settlement happens on this path.
pub(super) async fn handle_upstream_error(
    state: &RelayState,
    ctx: &RelayContext,
    upstream: reqwest::Response,
) -> RelayError {
    let status = upstream.status();
    let api_error = match upstream.bytes().await {
        Ok(body) => serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|parsed| {
                parsed
                    .get("error")
                    .cloned()
                    .and_then(|e| serde_json::from_value::<ApiError>(e).ok())
            }),
        Err(_) => None,
    };

    if config::options().automatic_disable_channel
        && should_disable(api_error.as_ref(), status.as_u16())
    {
        let reason = format!(
            "status {}, code {}",
            status.as_u16(),
            api_error
                .as_ref()
                .and_then(ApiError::code_str)
                .unwrap_or("unknown")
        );
        state.ledger.flag_channel_disabled(ctx.channel_id, &reason).await;
    }

    RelayError::upstream(status, &api_error.unwrap_or_default())
}

/// Copy the upstream status and headers (first value per name) onto the
/// client response. Hop-by-hop headers are left to the server's own framing.
pub(super) fn propagate_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let mut builder = Response::builder().status(status);
    for name in headers.keys() {
        if matches!(
            name.as_str(),
            "connection" | "transfer-encoding" | "keep-alive"
        ) {
            continue;
        }
        if let Some(value) = headers.get(name) {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(body)).map_err(|e| {
        RelayError::internal(
            "copy_response_body_failed",
            format!("assemble client response: {}", e),
        )
    })
}

/// Usage block from a buffered upstream response.
pub(super) fn extract_usage(response: &Value) -> TokenUsage {
    match response.get("usage") {
        Some(usage) => TokenUsage::new(
            usage
                .get("prompt_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            usage
                .get("completion_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        ),
        None => TokenUsage::default(),
    }
}

/// When the upstream omits usage, count the returned text instead.
pub(super) fn count_completion_fallback(response: &Value, model: &str) -> i64 {
    let Some(choices) = response.get("choices").and_then(Value::as_array) else {
        return 0;
    };
    let mut total = 0;
    for choice in choices {
        let content = choice
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .or_else(|| choice.get("text").and_then(Value::as_str));
        if let Some(content) = content {
            total += token::count_text(content, model);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_usage() {
        let response = serde_json::json!({
            "usage": {"prompt_tokens": 100, "completion_tokens": 50}
        });
        let usage = extract_usage(&response);
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 50);
        assert_eq!(usage.total(), 150);

        assert_eq!(extract_usage(&serde_json::json!({})).total(), 0);
    }

    #[test]
    fn test_completion_fallback_counts_choices() {
        let chat = serde_json::json!({
            "choices": [
                {"message": {"role": "assistant", "content": "hello there"}},
                {"message": {"role": "assistant", "content": "general"}}
            ]
        });
        let expected = token::count_text("hello there", "gpt-4")
            + token::count_text("general", "gpt-4");
        assert_eq!(count_completion_fallback(&chat, "gpt-4"), expected);

        let legacy = serde_json::json!({
            "choices": [{"text": "completion text", "index": 0}]
        });
        assert_eq!(
            count_completion_fallback(&legacy, "gpt-3.5-turbo-instruct"),
            token::count_text("completion text", "gpt-3.5-turbo-instruct")
        );

        assert_eq!(count_completion_fallback(&serde_json::json!({}), "gpt-4"), 0);
    }

    #[test]
    fn test_propagate_response_copies_first_values() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        headers.append("x-request-id", "def".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());

        let response =
            propagate_response(StatusCode::OK, &headers, Bytes::from_static(b"{}")).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        // first value only
        let ids: Vec<_> = response.headers().get_all("x-request-id").iter().collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0], "abc");
        assert!(response.headers().get("transfer-encoding").is_none());
    }
}
