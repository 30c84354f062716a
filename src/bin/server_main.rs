use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use tollgate::ledger::{memory_ledger, MemoryBackend};
use tollgate::relay::context::{ChannelType, RelayContext};
use tollgate::relay::RelayState;
use tollgate::{config, server, token};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tollgate=info")),
        )
        .init();

    if let Ok(path) = std::env::var("TOLLGATE_CONFIG") {
        if let Err(err) = config::load_file(&path) {
            tracing::error!(%err, "failed to load settings file");
        }
    }
    config::load_env();

    let tables = config::tables();
    token::init_encoders(tables.model_ratio.keys());

    let backend = Arc::new(MemoryBackend::new());
    seed_demo_token(&backend);

    let state = Arc::new(RelayState {
        ledger: memory_ledger(backend.clone()),
        auth: backend,
    });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    if let Err(err) = server::serve(addr, state).await {
        tracing::error!(%err, "server terminated");
        std::process::exit(1);
    }
}

/// Standalone mode: wire one caller token to one upstream channel from the
/// environment. Real deployments replace the memory backend with SQL-backed
/// stores and an auth service.
fn seed_demo_token(backend: &MemoryBackend) {
    let Ok(token_key) = std::env::var("TOLLGATE_DEMO_TOKEN") else {
        tracing::warn!("TOLLGATE_DEMO_TOKEN not set; no caller tokens are registered");
        return;
    };
    let api_key = std::env::var("TOLLGATE_UPSTREAM_KEY").unwrap_or_default();
    let base_url = std::env::var("TOLLGATE_UPSTREAM_BASE_URL").unwrap_or_default();
    let channel_type = std::env::var("TOLLGATE_CHANNEL_TYPE")
        .ok()
        .and_then(|raw| ChannelType::from_str(&raw))
        .unwrap_or(ChannelType::OpenAI);
    let quota: i64 = std::env::var("TOLLGATE_DEMO_QUOTA")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(1_000_000);

    let ctx = RelayContext {
        user_id: 1,
        token_id: 1,
        token_name: "demo".to_string(),
        channel_id: 1,
        channel_type,
        base_url,
        api_key,
        group: "default".to_string(),
        model_mapping: HashMap::new(),
        consume_quota: true,
        api_version: std::env::var("TOLLGATE_AZURE_API_VERSION").ok(),
    };
    backend.seed(&token_key, ctx, quota);
    tracing::info!(quota, "registered demo caller token");
}
