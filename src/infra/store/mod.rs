//! 协调存储
//!
//! 跨进程互斥只依赖两个原子原语：条件创建（create-if-absent）与
//! 条件删除（delete-if-value-matches）。任何提供这两者的存储都可接入。

mod memory;
mod valkey;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::valkey::RedisStore;

/// 协调存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// 仅当 key 不存在时写入，返回是否写入成功
    async fn create_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StoreError>;

    /// 仅当当前值等于 expected 时删除，返回是否删除
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// 仅当当前值等于 expected 时替换为 new
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, StoreError>;
}
