//! Cost model: pure computation of quota cost from model, group and usage.

use axum::http::StatusCode;

use crate::config;
use crate::relay::context::{ImageQuality, ImageRequest};
use crate::relay::error::{RelayError, RelayResult};

/// Fallback multiplier for models missing from the ratio table.
const DEFAULT_MODEL_RATIO: f64 = 30.0;

/// Price multiplier for a model. Unknown models get a deliberately high
/// fallback so a misconfigured table fails expensive, not free.
pub fn model_ratio(model: &str) -> f64 {
    match config::tables().model_ratio.get(model) {
        Some(ratio) => *ratio,
        None => {
            tracing::warn!(model, "model ratio not found, using default");
            DEFAULT_MODEL_RATIO
        }
    }
}

/// Discount multiplier for a user group; unknown groups pay full price.
pub fn group_ratio(group: &str) -> f64 {
    config::tables().group_ratio.get(group).copied().unwrap_or(1.0)
}

/// Quota units for a completed token-based request.
pub fn completion_cost(ratio: f64, prompt_tokens: i64, completion_tokens: i64) -> i64 {
    (ratio * (prompt_tokens + completion_tokens) as f64) as i64
}

/// Quota units pre-checked at admission. With no `max_tokens` hint the
/// configured pre-consumed ceiling stands in for the completion.
pub fn admission_estimate(ratio: f64, prompt_tokens: i64, max_tokens: Option<u32>) -> i64 {
    let ceiling = max_tokens
        .map(i64::from)
        .unwrap_or_else(|| config::options().pre_consumed_tokens);
    (ratio * (prompt_tokens + ceiling) as f64) as i64
}

/// Human-readable note stored with each consume-log record.
pub fn ratio_note(model_ratio: f64, group_ratio: f64) -> String {
    format!("模型倍率 {:.2}，分组倍率 {:.2}", model_ratio, group_ratio)
}

/// Validate an image request against the per-model limits.
pub fn validate_image_request(request: &ImageRequest) -> RelayResult<()> {
    if request.prompt.is_empty() {
        return Err(RelayError::bad_request("prompt_missing", "prompt is required"));
    }
    let tables = config::tables();
    if let Some(limit) = tables.dalle_prompt_length_limit.get(&request.model) {
        if request.prompt.chars().count() > *limit {
            return Err(RelayError::bad_request(
                "prompt_too_long",
                format!("prompt is longer than {} characters", limit),
            ));
        }
    }
    if let Some((min, max)) = tables.dalle_image_amounts.get(&request.model) {
        if request.n < *min || request.n > *max {
            return Err(RelayError::bad_request(
                "n_not_within_range",
                format!("n must be within [{}, {}]", min, max),
            ));
        }
    }
    Ok(())
}

/// Size multiplier for an image request, including the DALL·E 3 HD surcharge.
pub fn image_size_ratio(model: &str, size: &str, quality: Option<ImageQuality>) -> RelayResult<f64> {
    let tables = config::tables();
    let mut ratio = tables
        .dalle_size_ratios
        .get(model)
        .and_then(|sizes| sizes.get(size))
        .copied()
        .ok_or_else(|| {
            RelayError::one_api(
                "size_not_supported",
                StatusCode::BAD_REQUEST,
                format!("size {} is not supported for model {}", size, model),
            )
        })?;
    if model == "dall-e-3" && quality == Some(ImageQuality::Hd) {
        ratio *= if size == "1024x1024" { 2.0 } else { 1.5 };
    }
    Ok(ratio)
}

/// Quota units for an image generation: per-image price times image count.
pub fn image_cost(ratio: f64, size_ratio: f64, n: u32) -> i64 {
    ((ratio * size_ratio * 1000.0) as i64) * n as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_request(model: &str, prompt: &str, n: u32, size: &str) -> ImageRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "prompt": prompt,
            "n": n,
            "size": size,
        }))
        .unwrap()
    }

    #[test]
    fn test_unknown_model_ratio_falls_back() {
        assert_eq!(model_ratio("made-up-model"), DEFAULT_MODEL_RATIO);
        assert_eq!(model_ratio("gpt-4"), 15.0);
    }

    #[test]
    fn test_completion_cost_floors() {
        assert_eq!(completion_cost(0.75, 10, 5), 11); // 11.25 floors to 11
        assert_eq!(completion_cost(1.0, 100, 50), 150);
    }

    #[test]
    fn test_admission_estimate_uses_hint_or_ceiling() {
        assert_eq!(admission_estimate(1.0, 100, Some(200)), 300);
        // default pre_consumed_tokens is 500
        assert_eq!(admission_estimate(1.0, 100, None), 600);
    }

    #[test]
    fn test_dalle3_hd_pricing() {
        // ModelRatio 0.04, GroupRatio 1.0, 1024x1024 hd, n = 2 -> 160.
        // The default table prices dall-e-3 1024x1024 at 1.0; hd doubles it.
        let size_ratio =
            image_size_ratio("dall-e-3", "1024x1024", Some(ImageQuality::Hd)).unwrap();
        assert_eq!(size_ratio, 2.0);
        assert_eq!(image_cost(0.04, size_ratio, 2), 160);

        let tall = image_size_ratio("dall-e-3", "1024x1792", Some(ImageQuality::Hd)).unwrap();
        assert_eq!(tall, 3.0); // 2.0 base * 1.5 non-square surcharge
    }

    #[test]
    fn test_image_rejections() {
        let err = validate_image_request(&image_request("dall-e-2", "", 1, "1024x1024"))
            .unwrap_err();
        assert_eq!(err.code, "prompt_missing");

        let long_prompt = "x".repeat(1001);
        let err =
            validate_image_request(&image_request("dall-e-2", &long_prompt, 1, "1024x1024"))
                .unwrap_err();
        assert_eq!(err.code, "prompt_too_long");

        let err = validate_image_request(&image_request("dall-e-3", "a cat", 2, "1024x1024"))
            .unwrap_err();
        assert_eq!(err.code, "n_not_within_range");

        let err = image_size_ratio("dall-e-2", "2048x2048", None).unwrap_err();
        assert_eq!(err.code, "size_not_supported");
    }

    #[test]
    fn test_ratio_note_format() {
        assert_eq!(ratio_note(1.0, 1.0), "模型倍率 1.00，分组倍率 1.00");
        assert_eq!(ratio_note(0.75, 1.5), "模型倍率 0.75，分组倍率 1.50");
    }
}
