//! Redis/Valkey 协调存储
//!
//! 条件创建使用 `SET NX`，条件删除/替换使用 Lua 脚本保证原子性

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;

use super::{CoordinationStore, StoreError};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_SWAP: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    namespace: String,
}

impl RedisStore {
    /// 连接并验证 Redis
    pub async fn connect(url: &str, namespace: &str, pool_size: usize) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            namespace: namespace.to_string(),
        })
    }

    fn prefixed_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(self.prefixed_key(key))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.prefixed_key(key), value)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn create_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        conn.set_nx(self.prefixed_key(key), value)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(self.prefixed_key(key))
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let swapped: i64 = redis::Script::new(COMPARE_AND_SWAP)
            .key(self.prefixed_key(key))
            .arg(expected)
            .arg(new)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(swapped == 1)
    }
}
