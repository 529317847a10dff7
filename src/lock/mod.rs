// Per-strategy advisory lock for operator actions
pub mod redis_lock;

pub use redis_lock::RedisActionLock;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Proof of ownership handed back on release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait ActionLock: Send + Sync {
    /// `None` when another action already holds the strategy
    async fn try_acquire(&self, strategy_uuid: Uuid) -> LockResult<Option<LockToken>>;

    /// Release only if `token` still owns the lock
    async fn release(&self, strategy_uuid: Uuid, token: &LockToken) -> LockResult<()>;
}

/// Lock held in this process only; enough for a single CLI or API instance
#[derive(Default)]
pub struct LocalActionLock {
    held: Mutex<HashMap<Uuid, LockToken>>,
}

impl LocalActionLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionLock for LocalActionLock {
    async fn try_acquire(&self, strategy_uuid: Uuid) -> LockResult<Option<LockToken>> {
        let mut held = self.held.lock().await;
        if held.contains_key(&strategy_uuid) {
            return Ok(None);
        }
        let token = LockToken::new();
        held.insert(strategy_uuid, token.clone());
        Ok(Some(token))
    }

    async fn release(&self, strategy_uuid: Uuid, token: &LockToken) -> LockResult<()> {
        let mut held = self.held.lock().await;
        if held.get(&strategy_uuid) == Some(token) {
            held.remove(&strategy_uuid);
        }
        Ok(())
    }
}
