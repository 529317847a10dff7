use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use super::{ActionLock, LockResult, LockToken};
use crate::Result;

const KEY_PREFIX: &str = "cryptobot:strategy-lock";

/// Deletes the key only while it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lease-based lock shared by every control-plane instance.
///
/// The TTL bounds how long a crashed holder can block a strategy.
pub struct RedisActionLock {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisActionLock {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `ttl` - Lease length; must outlast the slowest close sequence
    pub async fn new(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis for action locks");

        Ok(Self { conn, ttl })
    }

    fn key(strategy_uuid: Uuid) -> String {
        format!("{}:{}", KEY_PREFIX, strategy_uuid)
    }
}

#[async_trait]
impl ActionLock for RedisActionLock {
    async fn try_acquire(&self, strategy_uuid: Uuid) -> LockResult<Option<LockToken>> {
        let mut conn = self.conn.clone();
        let token = LockToken::new();

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(strategy_uuid))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| token))
    }

    async fn release(&self, strategy_uuid: Uuid, token: &LockToken) -> LockResult<()> {
        let mut conn = self.conn.clone();

        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(Self::key(strategy_uuid))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            tracing::warn!("lock for {} expired before release", strategy_uuid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = RedisActionLock::new("redis://192.0.2.1:6379", Duration::from_secs(300)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_acquire_and_release() {
        let lock = RedisActionLock::new("redis://127.0.0.1:6379", Duration::from_secs(30))
            .await
            .expect("Failed to connect to Redis");
        let id = Uuid::new_v4();

        let token = lock.try_acquire(id).await.unwrap().unwrap();
        assert!(lock.try_acquire(id).await.unwrap().is_none());

        lock.release(id, &token).await.unwrap();
        let again = lock.try_acquire(id).await.unwrap().unwrap();
        lock.release(id, &again).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_lease_expires() {
        let lock = RedisActionLock::new("redis://127.0.0.1:6379", Duration::from_millis(200))
            .await
            .expect("Failed to connect to Redis");
        let id = Uuid::new_v4();

        let _token = lock.try_acquire(id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(lock.try_acquire(id).await.unwrap().is_some());
    }
}
