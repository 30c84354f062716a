//! Channel adapter
//!
//! Pure rewriting of the inbound path and auth headers into the upstream
//! vendor's dialect. Body rewriting (model aliasing) happens in the executor;
//! this module only decides where the request goes and which headers it
//! carries.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use super::context::{ChannelType, RelayContext};
use super::error::{RelayError, RelayResult};
use crate::config;

const CLOUDFLARE_GATEWAY_PREFIX: &str = "https://gateway.ai.cloudflare.com";

/// Fully resolved upstream request target.
#[derive(Debug)]
pub struct UpstreamTarget {
    pub url: String,
    pub headers: HeaderMap,
}

/// Build the upstream URL and headers for a request.
///
/// `path_and_query` is the inbound path as received (e.g.
/// `/v1/chat/completions`); `upstream_model` is the model name after alias
/// mapping, which Azure uses as the deployment id.
pub fn build_target(
    ctx: &RelayContext,
    path_and_query: &str,
    upstream_model: &str,
) -> RelayResult<UpstreamTarget> {
    let base_url = effective_base_url(ctx);
    let base_url = base_url.trim_end_matches('/');

    let (url, auth) = match ctx.channel_type {
        ChannelType::Azure => {
            let (path, query) = split_path_query(path_and_query);
            let task = path.strip_prefix("/v1/").unwrap_or(path.trim_start_matches('/'));
            let api_version = query_param(query, "api-version")
                .map(str::to_string)
                .or_else(|| ctx.api_version.clone())
                .unwrap_or_default();
            (
                format!(
                    "{}/openai/deployments/{}/{}?api-version={}",
                    base_url, upstream_model, task, api_version
                ),
                AuthHeader::ApiKey,
            )
        }
        _ => {
            // An OpenAI-compatible channel fronted by the Cloudflare AI
            // gateway nests the account path; the gateway already owns /v1.
            let path = if base_url.starts_with(CLOUDFLARE_GATEWAY_PREFIX) {
                path_and_query
                    .strip_prefix("/v1")
                    .unwrap_or(path_and_query)
            } else {
                path_and_query
            };
            (format!("{}{}", base_url, path), AuthHeader::Bearer)
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let header_value = match auth {
        AuthHeader::Bearer => (
            "authorization",
            format!("Bearer {}", ctx.api_key),
        ),
        AuthHeader::ApiKey => ("api-key", ctx.api_key.clone()),
    };
    let value = HeaderValue::from_str(&header_value.1).map_err(|e| {
        RelayError::internal("new_request_failed", format!("build auth header: {}", e))
    })?;
    headers.insert(header_value.0, value);

    Ok(UpstreamTarget { url, headers })
}

enum AuthHeader {
    Bearer,
    ApiKey,
}

fn effective_base_url(ctx: &RelayContext) -> String {
    if !ctx.base_url.is_empty() {
        return ctx.base_url.clone();
    }
    config::tables()
        .channel_base_urls
        .get(ctx.channel_type.as_str())
        .filter(|url| !url.is_empty())
        .cloned()
        .unwrap_or_else(|| "https://api.openai.com".to_string())
}

fn split_path_query(path_and_query: &str) -> (&str, Option<&str>) {
    match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    }
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}
