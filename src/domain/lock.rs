//! 部署锁领域模型

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 协调存储中保存的锁记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// 持有者身份
    pub holder: String,
    /// 本次授予的唯一令牌
    pub token: String,
    /// 持有进程所在节点
    pub node: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(holder: &str, node: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            node: node.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    /// 是否已过期
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// 续期后的新记录
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: Utc::now() + ttl,
            ..self.clone()
        }
    }

    /// 已持有时长
    pub fn age(&self) -> Duration {
        Utc::now() - self.acquired_at
    }
}
