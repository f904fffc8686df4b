//! 部署上下文
//!
//! 一次部署会话在执行期间持有的全部状态：会话元数据、主机任务、锁、取消令牌

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{HostResult, Outcome, SessionEvent, SessionId, SessionMeta, SessionOutcome};
use crate::state::{LockHandle, LogHub};

use super::engine::HostJob;

/// 部署执行上下文
pub struct DeployContext {
    /// 会话元数据
    pub meta: SessionMeta,
    /// 每台主机的渲染后命令
    pub jobs: Vec<HostJob>,
    /// 环境锁
    pub lock: Arc<LockHandle>,
    /// 取消令牌
    pub cancel_token: CancellationToken,
    /// 日志中心
    pub hub: Arc<LogHub>,
}

impl DeployContext {
    pub fn session_id(&self) -> &SessionId {
        &self.meta.id
    }

    /// 发送生命周期提示
    pub async fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        if let Err(e) = self
            .hub
            .publish(&self.meta.id, SessionEvent::notice(message))
            .await
        {
            warn!(session = %self.meta.id, error = %e, "Failed to publish notice");
        }
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 封存会话并释放锁
    ///
    /// 两步互不依赖，任一失败都不会跳过另一步
    pub async fn finish(&self, results: Vec<HostResult>) -> Outcome {
        let outcome = SessionOutcome::from_results(results);
        let aggregate = outcome.outcome;

        if let Err(e) = self.hub.seal(&self.meta.id, outcome).await {
            error!(session = %self.meta.id, error = %e, "Failed to seal session");
        }

        if let Err(e) = self.lock.release().await {
            warn!(session = %self.meta.id, lock = %self.lock.key(), error = %e, "Failed to release lock");
        }

        info!(
            session = %self.meta.id,
            project = %self.meta.project,
            environment = %self.meta.environment,
            revision = %self.meta.revision,
            outcome = aggregate.as_str(),
            "Deployment finished"
        );
        aggregate
    }
}
