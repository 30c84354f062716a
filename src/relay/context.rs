//! Relay context structures
//!
//! Defines the per-request context populated by the auth middleware and the
//! typed request envelopes shared between the counter and the executor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Supported upstream channel types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    OpenAI,
    Azure,
    Cloudflare,
    Custom,
}

impl ChannelType {
    /// Parse channel type from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(ChannelType::OpenAI),
            "azure" => Some(ChannelType::Azure),
            "cloudflare" => Some(ChannelType::Cloudflare),
            "custom" => Some(ChannelType::Custom),
            _ => None,
        }
    }

    /// Get channel type name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Azure => "azure",
            ChannelType::Cloudflare => "cloudflare",
            ChannelType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-request relay context
///
/// Built by the auth middleware from the caller's access token and the
/// channel assignment. Read-only to the relay pipeline.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    /// Upstream base URL; empty means "use the channel type's default".
    pub base_url: String,
    /// Credential for the upstream account.
    pub api_key: String,
    /// User-tier group applied as a cost multiplier.
    pub group: String,
    /// Per-channel alias table, user-visible model name -> deployment name.
    pub model_mapping: HashMap<String, String>,
    /// Whether this request is metered against the quota ledger.
    pub consume_quota: bool,
    /// Azure api-version fallback when the query string carries none.
    pub api_version: Option<String>,
}

impl RelayContext {
    /// Resolve the model name sent upstream. Returns `None` when the mapping
    /// leaves the requested name untouched.
    pub fn mapped_model(&self, model: &str) -> Option<&str> {
        self.model_mapping
            .get(model)
            .map(|s| s.as_str())
            .filter(|alias| !alias.is_empty() && *alias != model)
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Number of prompt/input tokens
    pub prompt_tokens: i64,
    /// Number of completion/output tokens
    pub completion_tokens: i64,
}

impl TokenUsage {
    /// Create new token usage
    pub fn new(prompt: i64, completion: i64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    /// Get total tokens
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Inbound request envelope for chat, completions and embeddings.
///
/// Unknown fields are preserved in `rest` so a rewritten body keeps every
/// parameter the caller sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl TextRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Message content: plain text or an ordered list of parts (vision input).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Tagged content part inside a multimodal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<ImageRef>,
        // Flat form some clients send instead of the nested object.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<ImageDetail>,
    },
}

impl ContentPart {
    /// Normalize the two accepted image-part shapes into `(url, detail)`.
    pub fn image_ref(&self) -> Option<(&str, ImageDetail)> {
        match self {
            ContentPart::ImageUrl {
                image_url,
                url,
                detail,
            } => {
                if let Some(nested) = image_url {
                    Some((
                        nested.url.as_str(),
                        nested.detail.unwrap_or(ImageDetail::Auto),
                    ))
                } else {
                    url.as_deref()
                        .map(|u| (u, detail.unwrap_or(ImageDetail::Auto)))
                }
            }
            ContentPart::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    High,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    Standard,
    Hd,
}

fn default_image_model() -> String {
    "dall-e-2".to_string()
}

fn default_image_n() -> u32 {
    1
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

/// Inbound request envelope for image generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_image_n")]
    pub n: u32,
    #[serde(default = "default_image_size")]
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<ImageQuality>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_request_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "seed": 7
        });
        let request: TextRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.rest.get("seed"), Some(&serde_json::json!(7)));

        let back = serde_json::to_value(&request).unwrap();
        assert_eq!(back.get("temperature"), Some(&serde_json::json!(0.2)));
    }

    #[test]
    fn test_multimodal_content_parses_both_shapes() {
        let nested: Message = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "https://example.com/a.png", "detail": "low"}}
            ]
        }))
        .unwrap();
        let Some(MessageContent::Parts(parts)) = nested.content else {
            panic!("expected parts");
        };
        assert_eq!(
            parts[1].image_ref(),
            Some(("https://example.com/a.png", ImageDetail::Low))
        );

        let flat: ContentPart = serde_json::from_value(serde_json::json!({
            "type": "image_url",
            "url": "https://example.com/b.png"
        }))
        .unwrap();
        assert_eq!(
            flat.image_ref(),
            Some(("https://example.com/b.png", ImageDetail::Auto))
        );
    }

    #[test]
    fn test_image_request_defaults() {
        let request: ImageRequest = serde_json::from_value(serde_json::json!({
            "prompt": "a lighthouse"
        }))
        .unwrap();
        assert_eq!(request.model, "dall-e-2");
        assert_eq!(request.n, 1);
        assert_eq!(request.size, "1024x1024");
        assert!(request.quality.is_none());
    }

    #[test]
    fn test_mapped_model() {
        let mut mapping = HashMap::new();
        mapping.insert("gpt-4".to_string(), "gpt-4-dep".to_string());
        mapping.insert("gpt-3.5-turbo".to_string(), String::new());
        let ctx = RelayContext {
            user_id: 1,
            token_id: 1,
            token_name: "t".to_string(),
            channel_id: 1,
            channel_type: ChannelType::OpenAI,
            base_url: String::new(),
            api_key: String::new(),
            group: "default".to_string(),
            model_mapping: mapping,
            consume_quota: true,
            api_version: None,
        };
        assert_eq!(ctx.mapped_model("gpt-4"), Some("gpt-4-dep"));
        assert_eq!(ctx.mapped_model("gpt-3.5-turbo"), None);
        assert_eq!(ctx.mapped_model("unknown"), None);
    }
}
