//! Quota ledger
//!
//! Two-phase reserve-then-commit against the user/token/channel balances.
//! Admission is a synchronous pre-check against the cached user quota; no
//! reservation is persisted, trading a small over-admission window for cheap
//! ledger writes under load. The commit refreshes the cache and writes the
//! authoritative consume-log record, each step best-effort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::relay::context::{RelayContext, TokenUsage};
use crate::relay::error::{RelayError, RelayResult};

/// Errors surfaced by the persistence collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Read-through cache over the user quota balance.
#[async_trait]
pub trait QuotaCache: Send + Sync {
    async fn get_user_quota(&self, user_id: i64) -> Result<i64, StoreError>;
    /// Re-read the balance from the backing store into the cache.
    async fn refresh_user_quota(&self, user_id: i64) -> Result<(), StoreError>;
}

/// User/token balance writes.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Decrement the token's remaining quota (and the owning user's balance).
    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), StoreError>;
    async fn add_used_quota_and_request_count(
        &self,
        user_id: i64,
        delta: i64,
    ) -> Result<(), StoreError>;
}

/// Channel accounting and the auto-disable signal sink.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn add_used_quota(&self, channel_id: i64, delta: i64) -> Result<(), StoreError>;
    async fn flag_auto_disable(&self, channel_id: i64, reason: &str) -> Result<(), StoreError>;
}

/// One consume-log record; authoritative for reconciliation.
#[derive(Debug, Clone)]
pub struct ConsumeLogEntry {
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub user_id: i64,
    pub channel_id: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub model: String,
    pub token_name: String,
    pub quota: i64,
    pub note: String,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn record_consume_log(&self, entry: ConsumeLogEntry) -> Result<(), StoreError>;
}

/// Auth collaborator: maps an access token to its relay context.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, key: &str) -> Result<Option<RelayContext>, StoreError>;
}

/// Everything the commit phase needs, captured when billable work begins.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub request_id: Uuid,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub consume_quota: bool,
    pub model: String,
    pub usage: TokenUsage,
    pub quota: i64,
    pub note: String,
}

/// The two-phase quota protocol over the external stores.
#[derive(Clone)]
pub struct QuotaLedger {
    cache: Arc<dyn QuotaCache>,
    users: Arc<dyn UserStore>,
    channels: Arc<dyn ChannelStore>,
    logs: Arc<dyn LogStore>,
}

impl QuotaLedger {
    pub fn new(
        cache: Arc<dyn QuotaCache>,
        users: Arc<dyn UserStore>,
        channels: Arc<dyn ChannelStore>,
        logs: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            cache,
            users,
            channels,
            logs,
        }
    }

    /// Phase one: deny the request when the cached balance cannot cover the
    /// admission estimate. Performs no writes.
    pub async fn admit(&self, ctx: &RelayContext, pre_consumed: i64) -> RelayResult<()> {
        if !ctx.consume_quota {
            return Ok(());
        }
        let quota = self
            .cache
            .get_user_quota(ctx.user_id)
            .await
            .map_err(|e| {
                RelayError::internal("get_user_quota_failed", format!("quota lookup: {}", e))
            })?;
        if quota - pre_consumed < 0 {
            return Err(RelayError::insufficient_quota());
        }
        Ok(())
    }

    /// Phase two: settle the observed cost. Runs once per request after the
    /// response is on the wire; every step logs and continues on error. A
    /// zero quota skips the side-effect writes entirely.
    pub async fn commit(&self, record: CommitRecord) {
        if !record.consume_quota || record.quota == 0 {
            tracing::debug!(request_id = %record.request_id, "skipping zero-quota commit");
            return;
        }
        if let Err(err) = self
            .users
            .post_consume_token_quota(record.token_id, record.quota)
            .await
        {
            tracing::warn!(request_id = %record.request_id, %err, "token quota decrement failed");
        }
        if let Err(err) = self.cache.refresh_user_quota(record.user_id).await {
            tracing::warn!(request_id = %record.request_id, %err, "user quota cache refresh failed");
        }
        if let Err(err) = self
            .logs
            .record_consume_log(ConsumeLogEntry {
                request_id: record.request_id,
                created_at: Utc::now(),
                user_id: record.user_id,
                channel_id: record.channel_id,
                prompt_tokens: record.usage.prompt_tokens,
                completion_tokens: record.usage.completion_tokens,
                model: record.model.clone(),
                token_name: record.token_name.clone(),
                quota: record.quota,
                note: record.note.clone(),
            })
            .await
        {
            tracing::warn!(request_id = %record.request_id, %err, "consume log write failed");
        }
        if let Err(err) = self
            .users
            .add_used_quota_and_request_count(record.user_id, record.quota)
            .await
        {
            tracing::warn!(request_id = %record.request_id, %err, "user usage counter update failed");
        }
        if let Err(err) = self
            .channels
            .add_used_quota(record.channel_id, record.quota)
            .await
        {
            tracing::warn!(request_id = %record.request_id, %err, "channel usage update failed");
        }
        tracing::info!(
            request_id = %record.request_id,
            model = %record.model,
            prompt_tokens = record.usage.prompt_tokens,
            completion_tokens = record.usage.completion_tokens,
            quota = record.quota,
            "request settled"
        );
    }

    /// Report a channel whose credentials look dead. Best-effort.
    pub async fn flag_channel_disabled(&self, channel_id: i64, reason: &str) {
        if let Err(err) = self.channels.flag_auto_disable(channel_id, reason).await {
            tracing::warn!(channel_id, %err, "channel disable flag failed");
        }
    }
}

#[derive(Default)]
struct MemoryState {
    user_quota: HashMap<i64, i64>,
    cached_quota: HashMap<i64, i64>,
    token_quota: HashMap<i64, i64>,
    token_owner: HashMap<i64, i64>,
    user_used_quota: HashMap<i64, i64>,
    user_request_count: HashMap<i64, i64>,
    channel_used_quota: HashMap<i64, i64>,
    disabled_channels: HashMap<i64, String>,
    tokens: HashMap<String, RelayContext>,
    logs: Vec<ConsumeLogEntry>,
}

/// In-process implementation of every collaborator trait. Backs the server
/// binary's standalone mode and the tests; real deployments plug SQL-backed
/// stores in instead.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user balance and an access token bound to it.
    pub fn seed(&self, key: &str, ctx: RelayContext, quota: i64) {
        let mut state = self.state.lock().unwrap();
        state.user_quota.insert(ctx.user_id, quota);
        state.token_quota.insert(ctx.token_id, quota);
        state.token_owner.insert(ctx.token_id, ctx.user_id);
        state.tokens.insert(key.to_string(), ctx);
    }

    pub fn user_quota(&self, user_id: i64) -> Option<i64> {
        self.state.lock().unwrap().user_quota.get(&user_id).copied()
    }

    pub fn cached_quota(&self, user_id: i64) -> Option<i64> {
        self.state.lock().unwrap().cached_quota.get(&user_id).copied()
    }

    pub fn token_quota(&self, token_id: i64) -> Option<i64> {
        self.state.lock().unwrap().token_quota.get(&token_id).copied()
    }

    pub fn channel_used_quota(&self, channel_id: i64) -> i64 {
        self.state
            .lock()
            .unwrap()
            .channel_used_quota
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn request_count(&self, user_id: i64) -> i64 {
        self.state
            .lock()
            .unwrap()
            .user_request_count
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn disabled_reason(&self, channel_id: i64) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .disabled_channels
            .get(&channel_id)
            .cloned()
    }

    pub fn consume_logs(&self) -> Vec<ConsumeLogEntry> {
        self.state.lock().unwrap().logs.clone()
    }
}

#[async_trait]
impl QuotaCache for MemoryBackend {
    async fn get_user_quota(&self, user_id: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(cached) = state.cached_quota.get(&user_id) {
            return Ok(*cached);
        }
        let quota = *state
            .user_quota
            .get(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        state.cached_quota.insert(user_id, quota);
        Ok(quota)
    }

    async fn refresh_user_quota(&self, user_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let quota = *state
            .user_quota
            .get(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        state.cached_quota.insert(user_id, quota);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryBackend {
    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let token = state
            .token_quota
            .get_mut(&token_id)
            .ok_or_else(|| StoreError::NotFound(format!("token {}", token_id)))?;
        *token -= delta;
        // the owning user's balance moves with the token
        if let Some(user_id) = state.token_owner.get(&token_id).copied() {
            if let Some(quota) = state.user_quota.get_mut(&user_id) {
                *quota -= delta;
            }
        }
        Ok(())
    }

    async fn add_used_quota_and_request_count(
        &self,
        user_id: i64,
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        *state.user_used_quota.entry(user_id).or_insert(0) += delta;
        *state.user_request_count.entry(user_id).or_insert(0) += 1;
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for MemoryBackend {
    async fn add_used_quota(&self, channel_id: i64, delta: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        *state.channel_used_quota.entry(channel_id).or_insert(0) += delta;
        Ok(())
    }

    async fn flag_auto_disable(&self, channel_id: i64, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.disabled_channels.insert(channel_id, reason.to_string());
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryBackend {
    async fn record_consume_log(&self, entry: ConsumeLogEntry) -> Result<(), StoreError> {
        self.state.lock().unwrap().logs.push(entry);
        Ok(())
    }
}

#[async_trait]
impl TokenResolver for MemoryBackend {
    async fn resolve(&self, key: &str) -> Result<Option<RelayContext>, StoreError> {
        Ok(self.state.lock().unwrap().tokens.get(key).cloned())
    }
}

/// Wire a [`MemoryBackend`] into a ledger.
pub fn memory_ledger(backend: Arc<MemoryBackend>) -> QuotaLedger {
    QuotaLedger::new(backend.clone(), backend.clone(), backend.clone(), backend)
}
