//! 本机命令执行器
//!
//! 使用 `sh -c` 执行部署命令，支持：
//! - 实时日志流式输出
//! - stdout/stderr 分离
//! - 执行 future 被丢弃时杀掉子进程（超时、取消）

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{Host, RawLine};

use super::executor::{ExecError, RemoteExecutor};

/// 本机执行器
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    shell: String,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// 使用指定 shell（测试或 Windows 环境）
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// 执行 shell 命令并流式输出
    pub async fn run_shell_with_streaming(
        &self,
        command: &str,
        sink: mpsc::Sender<RawLine>,
    ) -> Result<i32, ExecError> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Connect(format!("failed to spawn {}: {}", self.shell, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // 启动 stdout 读取任务
        let stdout_tx = sink.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if stdout_tx.send(RawLine::stdout(line)).await.is_err() {
                        break;
                    }
                }
            }
        });

        // 启动 stderr 读取任务
        let stderr_tx = sink;
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if stderr_tx.send(RawLine::stderr(line)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::Io(format!("failed to wait for command: {}", e)))?;

        // 等待日志读取完成
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let code = status.code().unwrap_or(-1);
        debug!(exit_code = code, "Local command finished");
        Ok(code)
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(
        &self,
        _host: &Host,
        command: &str,
        sink: mpsc::Sender<RawLine>,
    ) -> Result<i32, ExecError> {
        self.run_shell_with_streaming(command, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutputStream;

    #[tokio::test]
    async fn test_streams_stdout_and_stderr() {
        let (tx, mut rx) = mpsc::channel(16);
        let code = LocalExecutor::new()
            .run_shell_with_streaming("echo hello; echo oops 1>&2", tx)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stdout && l.content == "hello"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.content == "oops"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let (tx, _rx) = mpsc::channel(16);
        let code = LocalExecutor::new()
            .run_shell_with_streaming("exit 3", tx)
            .await
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_missing_shell_is_connect_error() {
        let (tx, _rx) = mpsc::channel(16);
        let result = LocalExecutor::with_shell("nonexistent_shell_12345")
            .run_shell_with_streaming("true", tx)
            .await;
        assert!(matches!(result, Err(ExecError::Connect(_))));
    }
}
