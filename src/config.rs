use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::{env, fs};

use once_cell::sync::Lazy;

use crate::relay::context::ChannelType;

/// Runtime options consumed by the relay pipeline.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Options {
    /// Estimate token counts from character length instead of the encoder.
    pub approximate_tokens: bool,
    /// Act on the channel-disable predicate for dead upstream credentials.
    pub automatic_disable_channel: bool,
    /// Admission ceiling (in tokens) used when a request carries no max_tokens.
    pub pre_consumed_tokens: i64,
    /// Timeout for fetching vision-input images.
    pub image_fetch_timeout_secs: u64,
    /// Overall timeout for buffered upstream calls.
    pub request_timeout_secs: u64,
    /// Overall timeout for streaming upstream calls.
    pub stream_timeout_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            approximate_tokens: false,
            automatic_disable_channel: false,
            pre_consumed_tokens: 500,
            image_fetch_timeout_secs: 15,
            request_timeout_secs: 120,
            stream_timeout_secs: 300,
        }
    }
}

/// Cost tables, loaded at startup and swapped atomically on admin reload.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct CostTables {
    /// Model name -> price multiplier for token-based models.
    pub model_ratio: HashMap<String, f64>,
    /// Group name -> user-tier discount multiplier.
    pub group_ratio: HashMap<String, f64>,
    /// Image model -> size string -> price multiplier.
    pub dalle_size_ratios: HashMap<String, HashMap<String, f64>>,
    /// Image model -> maximum prompt length in characters.
    pub dalle_prompt_length_limit: HashMap<String, usize>,
    /// Image model -> (min, max) allowed n.
    pub dalle_image_amounts: HashMap<String, (u32, u32)>,
    /// Channel type name -> default base URL.
    pub channel_base_urls: HashMap<String, String>,
}

impl CostTables {
    pub fn defaults() -> Self {
        let mut model_ratio = HashMap::new();
        for (model, ratio) in [
            ("gpt-3.5-turbo", 0.75),
            ("gpt-3.5-turbo-0301", 0.75),
            ("gpt-3.5-turbo-16k", 1.5),
            ("gpt-3.5-turbo-instruct", 0.75),
            ("gpt-4", 15.0),
            ("gpt-4-0314", 15.0),
            ("gpt-4-32k", 30.0),
            ("gpt-4-turbo-preview", 5.0),
            ("gpt-4-vision-preview", 5.0),
            ("gpt-4o", 2.5),
            ("text-davinci-003", 10.0),
            ("text-embedding-ada-002", 0.05),
            ("text-embedding-3-small", 0.01),
            ("text-embedding-3-large", 0.065),
            ("dall-e-2", 8.0),
            ("dall-e-3", 20.0),
        ] {
            model_ratio.insert(model.to_string(), ratio);
        }

        let mut group_ratio = HashMap::new();
        for (group, ratio) in [("default", 1.0), ("vip", 1.0), ("svip", 1.0)] {
            group_ratio.insert(group.to_string(), ratio);
        }

        let mut dalle_size_ratios = HashMap::new();
        dalle_size_ratios.insert(
            "dall-e-2".to_string(),
            HashMap::from([
                ("256x256".to_string(), 1.0),
                ("512x512".to_string(), 1.125),
                ("1024x1024".to_string(), 1.25),
            ]),
        );
        dalle_size_ratios.insert(
            "dall-e-3".to_string(),
            HashMap::from([
                ("1024x1024".to_string(), 1.0),
                ("1024x1792".to_string(), 2.0),
                ("1792x1024".to_string(), 2.0),
            ]),
        );

        let dalle_prompt_length_limit = HashMap::from([
            ("dall-e-2".to_string(), 1000),
            ("dall-e-3".to_string(), 4000),
        ]);

        let dalle_image_amounts = HashMap::from([
            ("dall-e-2".to_string(), (1, 10)),
            ("dall-e-3".to_string(), (1, 1)),
        ]);

        let channel_base_urls = HashMap::from([
            (
                ChannelType::OpenAI.as_str().to_string(),
                "https://api.openai.com".to_string(),
            ),
            (ChannelType::Azure.as_str().to_string(), String::new()),
            (
                ChannelType::Cloudflare.as_str().to_string(),
                "https://gateway.ai.cloudflare.com".to_string(),
            ),
            (ChannelType::Custom.as_str().to_string(), String::new()),
        ]);

        Self {
            model_ratio,
            group_ratio,
            dalle_size_ratios,
            dalle_prompt_length_limit,
            dalle_image_amounts,
            channel_base_urls,
        }
    }

    /// Overlay non-empty entries from `other` onto this table set.
    fn merge(&mut self, other: CostTables) {
        self.model_ratio.extend(other.model_ratio);
        self.group_ratio.extend(other.group_ratio);
        self.dalle_size_ratios.extend(other.dalle_size_ratios);
        self.dalle_prompt_length_limit
            .extend(other.dalle_prompt_length_limit);
        self.dalle_image_amounts.extend(other.dalle_image_amounts);
        self.channel_base_urls.extend(other.channel_base_urls);
    }
}

/// On-disk settings file shape.
#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub options: Options,
    pub tables: CostTables,
}

static OPTIONS: Lazy<RwLock<Options>> = Lazy::new(|| RwLock::new(Options::default()));
static TABLES: Lazy<RwLock<Arc<CostTables>>> =
    Lazy::new(|| RwLock::new(Arc::new(CostTables::defaults())));

/// Current runtime options.
pub fn options() -> Options {
    OPTIONS.read().unwrap().clone()
}

pub fn set_options(options: Options) {
    *OPTIONS.write().unwrap() = options;
}

/// Current cost-table snapshot. Callers hold the `Arc` for the duration of a
/// request; reloads never mutate a snapshot in place.
pub fn tables() -> Arc<CostTables> {
    TABLES.read().unwrap().clone()
}

/// Replace the cost tables with a new snapshot (admin reload hook).
pub fn swap_tables(tables: CostTables) {
    *TABLES.write().unwrap() = Arc::new(tables);
}

/// Load settings from a TOML file. File tables overlay the built-in defaults.
pub fn load_file(path: &str) -> Result<(), String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("read {}: {}", path, e))?;
    let settings: Settings =
        toml::from_str(&raw).map_err(|e| format!("parse {}: {}", path, e))?;
    set_options(settings.options);
    let mut tables = CostTables::defaults();
    tables.merge(settings.tables);
    swap_tables(tables);
    tracing::info!(path, "loaded settings file");
    Ok(())
}

/// Apply environment-variable overrides on top of whatever is loaded.
pub fn load_env() {
    let mut options = options();
    if let Some(v) = env_bool("TOLLGATE_APPROXIMATE_TOKENS") {
        options.approximate_tokens = v;
    }
    if let Some(v) = env_bool("TOLLGATE_AUTOMATIC_DISABLE_CHANNEL") {
        options.automatic_disable_channel = v;
    }
    if let Ok(v) = env::var("TOLLGATE_PRE_CONSUMED_TOKENS") {
        if let Ok(n) = v.trim().parse() {
            options.pre_consumed_tokens = n;
        }
    }
    set_options(options);
}

fn env_bool(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables_cover_image_models() {
        let tables = CostTables::defaults();
        assert!(tables.dalle_size_ratios["dall-e-3"].contains_key("1024x1024"));
        assert_eq!(tables.dalle_image_amounts["dall-e-3"], (1, 1));
        assert_eq!(tables.dalle_prompt_length_limit["dall-e-2"], 1000);
        assert_eq!(
            tables.channel_base_urls["openai"],
            "https://api.openai.com"
        );
    }

    #[test]
    fn test_merge_overlays_entries() {
        let mut tables = CostTables::defaults();
        let mut overlay = CostTables::default();
        overlay.model_ratio.insert("gpt-4".to_string(), 12.0);
        overlay.model_ratio.insert("my-model".to_string(), 2.0);
        tables.merge(overlay);
        assert_eq!(tables.model_ratio["gpt-4"], 12.0);
        assert_eq!(tables.model_ratio["my-model"], 2.0);
        // untouched defaults survive
        assert_eq!(tables.model_ratio["gpt-3.5-turbo"], 0.75);
    }

    #[test]
    fn test_settings_file_roundtrip() {
        let raw = r#"
            [options]
            approximate_tokens = true
            pre_consumed_tokens = 800

            [tables.model_ratio]
            "my-model" = 2.5
        "#;
        let settings: Settings = toml::from_str(raw).unwrap();
        assert!(settings.options.approximate_tokens);
        assert_eq!(settings.options.pre_consumed_tokens, 800);
        assert_eq!(settings.tables.model_ratio["my-model"], 2.5);
    }
}
