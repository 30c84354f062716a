//! Token counting
//!
//! Deterministic token estimation for text, chat messages, function specs and
//! vision inputs. Encoders are resolved once and shared process-wide; lazy
//! insertions for unknown models go through a single writer lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use base64::Engine;
use image::GenericImageView;
use once_cell::sync::Lazy;
use serde_json::Value;
use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};

use crate::config;
use crate::relay::client;
use crate::relay::context::{ContentPart, ImageDetail, Message, MessageContent};
use crate::relay::error::{RelayError, RelayResult};

/// Base token charge for any vision input.
const IMAGE_BASE_TOKENS: i64 = 85;
/// Additional tokens per 512x512 tile of a high-detail image.
const IMAGE_TILE_TOKENS: i64 = 170;
/// Charged in place of a real count when an image cannot be fetched/decoded.
const IMAGE_FAILURE_PENALTY: i64 = 765;

static DEFAULT_ENCODER: Lazy<Arc<CoreBPE>> =
    Lazy::new(|| Arc::new(cl100k_base().expect("cl100k_base encoder")));

static ENCODERS: Lazy<RwLock<HashMap<String, Arc<CoreBPE>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Resolve encoders for every configured model name. Called once at startup;
/// names in the gpt-3.5 / gpt-4 families share their base encoder, everything
/// else resolves lazily on first use.
pub fn init_encoders<I, S>(models: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let gpt35 = resolve_encoder("gpt-3.5-turbo");
    let gpt4 = resolve_encoder("gpt-4");
    let mut encoders = ENCODERS.write().unwrap();
    encoders.insert("gpt-3.5-turbo".to_string(), gpt35.clone());
    encoders.insert("gpt-4".to_string(), gpt4.clone());
    for model in models {
        let model = model.as_ref();
        if encoders.contains_key(model) {
            continue;
        }
        if model.starts_with("gpt-3.5") {
            encoders.insert(model.to_string(), gpt35.clone());
        } else if model.starts_with("gpt-4") {
            encoders.insert(model.to_string(), gpt4.clone());
        }
    }
    tracing::info!(count = encoders.len(), "token encoders initialized");
}

fn resolve_encoder(model: &str) -> Arc<CoreBPE> {
    match get_bpe_from_model(model) {
        Ok(bpe) => Arc::new(bpe),
        Err(err) => {
            tracing::warn!(model, %err, "no tokenizer for model, using default encoder");
            DEFAULT_ENCODER.clone()
        }
    }
}

fn encoder_for(model: &str) -> Arc<CoreBPE> {
    if let Some(encoder) = ENCODERS.read().unwrap().get(model) {
        return encoder.clone();
    }
    let encoder = resolve_encoder(model);
    ENCODERS
        .write()
        .unwrap()
        .entry(model.to_string())
        .or_insert(encoder)
        .clone()
}

/// Character-length approximation used when `approximate_tokens` is enabled.
fn approximate_count(text: &str) -> i64 {
    (text.chars().count() as f64 * 0.38) as i64
}

/// Token count of a piece of text under the model's encoder.
pub fn count_text(text: &str, model: &str) -> i64 {
    if config::options().approximate_tokens {
        return approximate_count(text);
    }
    encoder_for(model).encode_ordinary(text).len() as i64
}

/// Token count of a chat conversation, including per-message framing overhead
/// and the reply priming tokens. Vision parts are priced by resolution; an
/// image that cannot be inspected is charged the fixed failure penalty.
pub async fn count_messages(messages: &[Message], model: &str) -> i64 {
    // gpt-3.5-turbo-0301 frames messages differently: one extra token per
    // message, and a name elides the role.
    let (per_message, per_name) = if model == "gpt-3.5-turbo-0301" {
        (4, -1)
    } else {
        (3, 1)
    };

    let mut total = 0;
    for message in messages {
        total += per_message;
        total += count_text(&message.role, model);
        match &message.content {
            Some(MessageContent::Text(text)) => total += count_text(text, model),
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => total += count_text(text, model),
                        ContentPart::ImageUrl { .. } => match count_image(part).await {
                            Ok(tokens) => total += tokens,
                            Err(err) => {
                                tracing::warn!(%err, "image token count failed, applying penalty");
                                total += IMAGE_FAILURE_PENALTY;
                            }
                        },
                    }
                }
            }
            None => {}
        }
        if let Some(name) = &message.name {
            total += per_name;
            total += count_text(name, model);
        }
    }
    // every reply is primed with <|start|>assistant<|message|>
    total + 3
}

/// Token count of a completions `prompt` or embeddings `input`: a single
/// string, or a sequence of strings concatenated before counting. Any other
/// shape counts as zero.
pub fn count_input(input: &Value, model: &str) -> i64 {
    match input {
        Value::String(text) => count_text(text, model),
        Value::Array(items) => {
            let mut joined = String::new();
            for item in items {
                match item.as_str() {
                    Some(text) => joined.push_str(text),
                    None => return 0,
                }
            }
            count_text(&joined, model)
        }
        _ => 0,
    }
}

/// Token cost of function specs and the function_call selector. Schemas
/// compress under the tokenizer, so the indented form is discounted.
pub fn count_functions(
    functions: Option<&Value>,
    function_call: Option<&Value>,
    model: &str,
) -> i64 {
    let mut total = 0;
    if let Some(functions) = functions {
        if let Ok(formatted) = serde_json::to_string_pretty(functions) {
            total += (count_text(&formatted, model) as f64 * 0.6) as i64;
        }
    }
    if let Some(function_call) = function_call {
        let compact = match function_call {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        total += count_text(&compact, model);
    }
    total
}

/// Token count of one image content part. Low-detail inputs cost a flat 85
/// without touching the image; otherwise the image is fetched, decoded, and
/// priced by its fitted tile count.
pub async fn count_image(part: &ContentPart) -> RelayResult<i64> {
    let Some((url, detail)) = part.image_ref() else {
        return Err(RelayError::bad_request(
            "invalid_image_data_url",
            "image part carries no url",
        ));
    };
    if detail == ImageDetail::Low {
        return Ok(IMAGE_BASE_TOKENS);
    }
    let bytes = fetch_image_bytes(url).await?;
    let decoded = image::load_from_memory(&bytes).map_err(|e| {
        RelayError::bad_request("invalid_image_data_url", format!("decode image: {}", e))
    })?;
    let (width, height) = decoded.dimensions();
    let (width, height) = fit_resolution(width, height);
    let tiles = height.div_ceil(512) as i64 * width.div_ceil(512) as i64;
    Ok(IMAGE_BASE_TOKENS + tiles * IMAGE_TILE_TOKENS)
}

/// Scale dimensions into the 2000x768 envelope the vision pricing model uses,
/// preserving aspect ratio.
pub fn fit_resolution(width: u32, height: u32) -> (u32, u32) {
    const LONG: f64 = 2000.0;
    const SHORT: f64 = 768.0;
    let (mut w, mut h) = (width as f64, height as f64);
    let ratio = w / h;
    if w > h {
        if w > LONG {
            w = LONG;
            h = w / ratio;
        }
        if h > SHORT {
            h = SHORT;
            w = h * ratio;
        }
    } else {
        if h > LONG {
            h = LONG;
            w = h / ratio;
        }
        if w > SHORT {
            w = SHORT;
            h = w * ratio;
        }
    }
    (w.floor() as u32, h.floor() as u32)
}

async fn fetch_image_bytes(url: &str) -> RelayResult<Vec<u8>> {
    if url.starts_with("data:image/") {
        let payload = url
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| {
                RelayError::bad_request("invalid_image_data_url", "data url has no payload")
            })?;
        return base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| {
                RelayError::bad_request(
                    "invalid_image_data_url",
                    format!("decode data url: {}", e),
                )
            });
    }

    let timeout = Duration::from_secs(config::options().image_fetch_timeout_secs);
    let response = client::http()
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            RelayError::one_api(
                "do_request_failed",
                StatusCode::BAD_GATEWAY,
                format!("fetch image: {}", e),
            )
        })?;
    if !response.status().is_success() {
        return Err(RelayError::one_api(
            "do_request_failed",
            StatusCode::BAD_GATEWAY,
            format!("fetch image: upstream returned {}", response.status()),
        ));
    }
    let bytes = response.bytes().await.map_err(|e| {
        RelayError::internal("read_response_body_failed", format!("read image: {}", e))
    })?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_data_url(width: u32, height: u32) -> String {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
        )
    }

    fn image_part(url: &str, detail: &str) -> ContentPart {
        serde_json::from_value(serde_json::json!({
            "type": "image_url",
            "image_url": {"url": url, "detail": detail}
        }))
        .unwrap()
    }

    fn messages(raw: Value) -> Vec<Message> {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_fit_resolution_invariants() {
        for (w, h) in [
            (4096, 2048),
            (2048, 4096),
            (100, 100),
            (5000, 5000),
            (1, 1),
            (10000, 30),
            (30, 10000),
        ] {
            let (fw, fh) = fit_resolution(w, h);
            assert!(fw <= 2000 && fh <= 2000, "{}x{} -> {}x{}", w, h, fw, fh);
            assert!(fw.min(fh) <= 768, "{}x{} -> {}x{}", w, h, fw, fh);
            // idempotent
            assert_eq!(fit_resolution(fw, fh), (fw, fh));
            // aspect ratio preserved within a pixel of rounding
            let original = w as f64 / h as f64;
            let fitted = fw as f64 / fh as f64;
            let tolerance = 1.0 / fh as f64 + 1.0 / fw as f64;
            assert!(
                (original - fitted).abs() / original <= tolerance + 0.01,
                "{}x{} -> {}x{}",
                w,
                h,
                fw,
                fh
            );
        }
        // 4096x2048 fits to 1536x768: 2 x 3 tiles -> 85 + 6*170 tokens
        let (w, h) = fit_resolution(4096, 2048);
        assert_eq!((w, h), (1536, 768));
        let tiles = h.div_ceil(512) as i64 * w.div_ceil(512) as i64;
        assert_eq!(IMAGE_BASE_TOKENS + tiles * IMAGE_TILE_TOKENS, 1105);
    }

    #[tokio::test]
    async fn test_low_detail_image_is_flat_without_fetch() {
        // url is deliberately not fetchable; low detail must not touch it
        let part = image_part("https://192.0.2.1/unreachable.png", "low");
        assert_eq!(count_image(&part).await.unwrap(), 85);
    }

    #[tokio::test]
    async fn test_high_detail_tile_math() {
        let part = image_part(&png_data_url(1024, 1024), "high");
        // 1024x1024 fits to 768x768 -> 2x2 tiles -> 85 + 4*170
        assert_eq!(count_image(&part).await.unwrap(), 765);

        let part = image_part(&png_data_url(1, 1), "high");
        assert_eq!(count_image(&part).await.unwrap(), 85 + 170);
    }

    #[tokio::test]
    async fn test_bad_data_url_is_an_error() {
        let part = image_part("data:image/png;base64,@@not-base64@@", "high");
        let err = count_image(&part).await.unwrap_err();
        assert_eq!(err.code, "invalid_image_data_url");
    }

    #[tokio::test]
    async fn test_count_messages_matches_recipe() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"}
        ]));

        let encoder = cl100k_base().unwrap();
        let tok = |s: &str| encoder.encode_ordinary(s).len() as i64;

        let legacy = count_messages(&msgs, "gpt-3.5-turbo-0301").await;
        assert_eq!(
            legacy,
            4 + tok("user") + tok("hi") + 4 + tok("assistant") + tok("hello") + 3
        );

        let current = count_messages(&msgs, "gpt-3.5-turbo").await;
        assert_eq!(
            current,
            3 + tok("user") + tok("hi") + 3 + tok("assistant") + tok("hello") + 3
        );
    }

    #[tokio::test]
    async fn test_count_messages_name_adjustment() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": "hi", "name": "alice"}
        ]));
        let encoder = cl100k_base().unwrap();
        let tok = |s: &str| encoder.encode_ordinary(s).len() as i64;

        let current = count_messages(&msgs, "gpt-4").await;
        assert_eq!(current, 3 + tok("user") + tok("hi") + 1 + tok("alice") + 3);

        let legacy = count_messages(&msgs, "gpt-3.5-turbo-0301").await;
        assert_eq!(legacy, 4 + tok("user") + tok("hi") - 1 + tok("alice") + 3);
    }

    #[tokio::test]
    async fn test_unfetchable_image_absorbed_as_penalty() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64", "detail": "high"}}
            ]}
        ]));
        let total = count_messages(&msgs, "gpt-4").await;
        assert_eq!(total, 3 + count_text("user", "gpt-4") + 765 + 3);
    }

    #[test]
    fn test_count_input_shapes() {
        let model = "gpt-3.5-turbo";
        let single = count_input(&serde_json::json!("hello world"), model);
        assert!(single > 0);

        // sequence concatenates without separator
        let joined = count_input(&serde_json::json!(["hello", " world"]), model);
        assert_eq!(joined, count_text("hello world", model));

        assert_eq!(count_input(&serde_json::json!(42), model), 0);
        assert_eq!(count_input(&serde_json::json!([1, 2, 3]), model), 0);
        assert_eq!(count_input(&serde_json::json!({"text": "x"}), model), 0);
    }

    #[test]
    fn test_count_functions() {
        let functions = serde_json::json!([{
            "name": "get_weather",
            "description": "Get the weather for a location",
            "parameters": {
                "type": "object",
                "properties": {"location": {"type": "string"}}
            }
        }]);
        let formatted = serde_json::to_string_pretty(&functions).unwrap();
        // indented reformat parses back to the same data
        let reparsed: Value = serde_json::from_str(&formatted).unwrap();
        assert_eq!(reparsed, functions);

        let expected = (count_text(&formatted, "gpt-4") as f64 * 0.6) as i64;
        assert_eq!(count_functions(Some(&functions), None, "gpt-4"), expected);

        let call = serde_json::json!({"name": "get_weather"});
        let with_call = count_functions(Some(&functions), Some(&call), "gpt-4");
        assert_eq!(with_call, expected + count_text(&call.to_string(), "gpt-4"));
    }

    #[test]
    fn test_approximate_count() {
        assert_eq!(approximate_count(""), 0);
        assert_eq!(approximate_count(&"a".repeat(100)), 38);
        // multi-byte characters are counted as scalars, not bytes
        assert_eq!(approximate_count(&"中".repeat(100)), 38);
    }

    #[test]
    fn test_encoder_cache_prefix_binding() {
        init_encoders(["gpt-3.5-turbo-16k", "gpt-4-32k", "my-fine-tune"]);
        let encoders = ENCODERS.read().unwrap();
        assert!(encoders.contains_key("gpt-3.5-turbo-16k"));
        assert!(encoders.contains_key("gpt-4-32k"));
        // non-gpt names resolve lazily instead
        assert!(!encoders.contains_key("my-fine-tune"));
    }
}
