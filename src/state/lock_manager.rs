//! 分布式部署锁
//!
//! 每个 `project/environment` 同时只允许一个部署。锁记录保存在协调存储中，
//! 获取依赖条件创建，释放/续期依赖对记录原始字节的条件删除/替换。
//! TTL 用于回收崩溃持有者留下的锁，运行中的部署通过心跳续期。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::LockRecord;
use crate::infra::store::{CoordinationStore, StoreError};

/// 存储中锁记录的前缀
const LOCK_PREFIX: &str = "locks";

/// 回收过期锁后的最大重试次数
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// 锁错误
#[derive(Debug, Error)]
pub enum LockError {
    #[error("locked by {holder} since {acquired_at}")]
    AlreadyLocked {
        holder: String,
        acquired_at: DateTime<Utc>,
    },

    #[error("lock '{key}' is not held by {holder}")]
    NotOwner { key: String, holder: String },

    #[error("lock '{key}' changed repeatedly during acquisition")]
    Contended { key: String },

    #[error("corrupt lock record at '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// 锁管理器
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    /// 本进程标识，写入锁记录便于排查
    node: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, node: impl Into<String>) -> Self {
        Self {
            store,
            node: node.into(),
        }
    }

    fn store_key(key: &str) -> String {
        format!("{}/{}", LOCK_PREFIX, key)
    }

    /// 获取锁
    ///
    /// 不存在或已过期时创建；否则返回当前持有者和获取时间
    pub async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockHandle, LockError> {
        let store_key = Self::store_key(key);
        let ttl_chrono = to_chrono(ttl);

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let record = LockRecord::new(holder, &self.node, ttl_chrono);
            let bytes = encode(&store_key, &record)?;

            if self.store.create_if_absent(&store_key, &bytes).await? {
                info!(lock = %key, holder = %holder, ttl_secs = ttl.as_secs(), "Lock acquired");
                return Ok(LockHandle {
                    store: self.store.clone(),
                    key: key.to_string(),
                    store_key,
                    holder: holder.to_string(),
                    current: Mutex::new(bytes),
                    released: AtomicBool::new(false),
                });
            }

            let Some(existing_bytes) = self.store.get(&store_key).await? else {
                // 在读取前被释放，重试
                continue;
            };
            let existing = decode(&store_key, &existing_bytes)?;

            if !existing.is_expired() {
                return Err(LockError::AlreadyLocked {
                    holder: existing.holder,
                    acquired_at: existing.acquired_at,
                });
            }

            warn!(
                lock = %key,
                stale_holder = %existing.holder,
                stale_node = %existing.node,
                expired_at = %existing.expires_at,
                "Reclaiming expired lock"
            );
            self.store
                .compare_and_delete(&store_key, &existing_bytes)
                .await?;
        }

        Err(LockError::Contended {
            key: key.to_string(),
        })
    }

    /// 按持有者释放锁
    ///
    /// 非持有者释放是 no-op，返回 `NotOwner`
    pub async fn release(&self, key: &str, holder: &str) -> Result<(), LockError> {
        let store_key = Self::store_key(key);
        let not_owner = || LockError::NotOwner {
            key: key.to_string(),
            holder: holder.to_string(),
        };

        let Some(bytes) = self.store.get(&store_key).await? else {
            return Err(not_owner());
        };
        let record = decode(&store_key, &bytes)?;
        if record.holder != holder {
            return Err(not_owner());
        }

        if self.store.compare_and_delete(&store_key, &bytes).await? {
            info!(lock = %key, holder = %holder, "Lock released");
            Ok(())
        } else {
            Err(not_owner())
        }
    }

    /// 当前有效的锁记录（过期视为不存在）
    pub async fn status(&self, key: &str) -> Result<Option<LockRecord>, LockError> {
        let store_key = Self::store_key(key);
        match self.store.get(&store_key).await? {
            Some(bytes) => {
                let record = decode(&store_key, &bytes)?;
                Ok((!record.is_expired()).then_some(record))
            }
            None => Ok(None),
        }
    }
}

/// 已获取的锁
///
/// 丢弃未释放的句柄会在后台尝试释放，保证所有退出路径都归还锁
pub struct LockHandle {
    store: Arc<dyn CoordinationStore>,
    key: String,
    store_key: String,
    holder: String,
    /// 存储中当前记录的原始字节，条件操作以此为准
    current: Mutex<Vec<u8>>,
    released: AtomicBool,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// 当前锁记录
    pub fn record(&self) -> Result<LockRecord, LockError> {
        let bytes = self.snapshot();
        decode(&self.store_key, &bytes)
    }

    fn snapshot(&self) -> Vec<u8> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 续期（心跳）
    ///
    /// 记录已被他人替换或删除时返回 `NotOwner`
    pub async fn refresh(&self, ttl: Duration) -> Result<(), LockError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(self.not_owner());
        }

        let expected = self.snapshot();
        let renewed = decode(&self.store_key, &expected)?.renewed(to_chrono(ttl));
        let new_bytes = encode(&self.store_key, &renewed)?;

        if self
            .store
            .compare_and_swap(&self.store_key, &expected, &new_bytes)
            .await?
        {
            *self
                .current
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_bytes;
            Ok(())
        } else {
            Err(self.not_owner())
        }
    }

    /// 释放锁（幂等）
    pub async fn release(&self) -> Result<(), LockError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let expected = self.snapshot();
        if self
            .store
            .compare_and_delete(&self.store_key, &expected)
            .await?
        {
            info!(lock = %self.key, holder = %self.holder, "Lock released");
            Ok(())
        } else {
            Err(self.not_owner())
        }
    }

    /// 保留锁直到显式 unlock 或 TTL 过期（手动加锁）
    pub fn keep(self) -> Result<LockRecord, LockError> {
        self.released.store(true, Ordering::SeqCst);
        self.record()
    }

    fn not_owner(&self) -> LockError {
        LockError::NotOwner {
            key: self.key.clone(),
            holder: self.holder.clone(),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.key, "Lock handle dropped outside runtime, relying on TTL");
            return;
        };

        let store = self.store.clone();
        let store_key = self.store_key.clone();
        let key = self.key.clone();
        let expected = self.snapshot();

        runtime.spawn(async move {
            match store.compare_and_delete(&store_key, &expected).await {
                Ok(true) => info!(lock = %key, "Lock released on drop"),
                Ok(false) => {}
                Err(e) => warn!(lock = %key, error = %e, "Failed to release lock on drop"),
            }
        });
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn encode(key: &str, record: &LockRecord) -> Result<Vec<u8>, LockError> {
    serde_json::to_vec(record).map_err(|e| LockError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn decode(key: &str, bytes: &[u8]) -> Result<LockRecord, LockError> {
    serde_json::from_slice(bytes).map_err(|e| LockError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}
