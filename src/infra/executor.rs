//! 远程执行抽象
//!
//! 核心只依赖这个窄接口：给定主机和命令，流式产出输出行并返回退出码

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{Host, RawLine};

use super::command::LocalExecutor;
use super::ssh::SshExecutor;

/// 执行错误
#[derive(Debug, Error)]
pub enum ExecError {
    /// 无法连接主机或认证失败
    #[error("connection failed: {0}")]
    Connect(String),

    /// 执行过程中传输失败
    #[error("execution failed: {0}")]
    Io(String),
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// 在主机上执行命令
    ///
    /// 输出行在产生时写入 `sink`，返回远端退出码
    async fn run(
        &self,
        host: &Host,
        command: &str,
        sink: mpsc::Sender<RawLine>,
    ) -> Result<i32, ExecError>;
}

/// 按主机类型分发：`local` 走本机 shell，其他走 SSH
pub struct HostExecutor {
    local: LocalExecutor,
    ssh: SshExecutor,
}

impl HostExecutor {
    pub fn new(local: LocalExecutor, ssh: SshExecutor) -> Self {
        Self { local, ssh }
    }
}

#[async_trait]
impl RemoteExecutor for HostExecutor {
    async fn run(
        &self,
        host: &Host,
        command: &str,
        sink: mpsc::Sender<RawLine>,
    ) -> Result<i32, ExecError> {
        if host.is_local() {
            self.local.run(host, command, sink).await
        } else {
            self.ssh.run(host, command, sink).await
        }
    }
}
