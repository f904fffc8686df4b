//! 并行执行引擎
//!
//! 每台主机一个 tokio 任务：流式转发输出到 Hub，执行超时和取消，
//! 任务 panic 只影响自己那台主机

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{
    FailureReason, Host, HostResult, OutputLine, RawLine, SessionEvent, SessionId,
};
use crate::infra::{ExecError, RemoteExecutor};
use crate::state::LogHub;

/// 单台主机的输出缓冲
const LINE_BUFFER: usize = 1024;

/// 单台主机的执行任务
#[derive(Clone, Debug)]
pub struct HostJob {
    pub host: Host,
    pub command: String,
}

/// 执行引擎
#[derive(Clone)]
pub struct Engine {
    executor: Arc<dyn RemoteExecutor>,
    hub: Arc<LogHub>,
    host_timeout: Duration,
}

impl Engine {
    pub fn new(executor: Arc<dyn RemoteExecutor>, hub: Arc<LogHub>, host_timeout: Duration) -> Self {
        Self {
            executor,
            hub,
            host_timeout,
        }
    }

    /// 在所有主机上并行执行，返回与 `jobs` 顺序一致的结果
    pub async fn run(
        &self,
        session: &SessionId,
        jobs: Vec<HostJob>,
        cancel: CancellationToken,
    ) -> Vec<HostResult> {
        let hosts: Vec<String> = jobs.iter().map(|j| j.host.address.clone()).collect();

        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let engine = self.clone();
                let session = session.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { engine.run_host(&session, job, cancel).await })
            })
            .collect();

        let joined = futures::future::join_all(handles).await;

        let mut results = Vec::with_capacity(joined.len());
        for (host, joined) in hosts.into_iter().zip(joined) {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(session = %session, host = %host, error = %e, "Host task crashed");
                    let mut result = HostResult::pending(&host);
                    result.fail(None, FailureReason::Crashed(e.to_string()));
                    self.publish(
                        session,
                        SessionEvent::HostFinished {
                            host,
                            status: result.status,
                            exit_code: None,
                            reason: result.reason.clone(),
                        },
                    )
                    .await;
                    results.push(result);
                }
            }
        }
        results
    }

    async fn run_host(&self, session: &SessionId, job: HostJob, cancel: CancellationToken) -> HostResult {
        let address = job.host.address.clone();
        let mut result = HostResult::pending(&address);
        result.start();
        self.publish(session, SessionEvent::HostStarted { host: address.clone() })
            .await;
        debug!(session = %session, host = %address, command = %job.command, "Host execution started");

        let (tx, mut rx) = mpsc::channel::<RawLine>(LINE_BUFFER);
        let exec = self.executor.run(&job.host, &job.command, tx);
        tokio::pin!(exec);
        let deadline = tokio::time::sleep(self.host_timeout);
        tokio::pin!(deadline);

        let mut seq = 0u64;
        let finished: Result<i32, FailureReason> = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(FailureReason::Cancelled),
                _ = &mut deadline => break Err(FailureReason::Timeout),
                Some(raw) = rx.recv() => {
                    self.emit(session, &address, &mut seq, &mut result, raw).await;
                }
                exit = &mut exec => {
                    // 执行器返回前已写完所有输出
                    while let Ok(raw) = rx.try_recv() {
                        self.emit(session, &address, &mut seq, &mut result, raw).await;
                    }
                    break exit.map_err(|e| match e {
                        ExecError::Connect(msg) => FailureReason::Connection(msg),
                        ExecError::Io(msg) => FailureReason::Crashed(msg),
                    });
                }
            }
        };

        match finished {
            Ok(0) => result.succeed(0),
            Ok(code) => result.fail(Some(code), FailureReason::ExitCode(code)),
            Err(reason) => {
                if matches!(reason, FailureReason::Timeout) {
                    warn!(
                        session = %session,
                        host = %address,
                        timeout_secs = self.host_timeout.as_secs(),
                        "Host execution timed out"
                    );
                }
                result.fail(None, reason)
            }
        }

        info!(
            session = %session,
            host = %address,
            status = result.status.as_str(),
            exit_code = ?result.exit_code,
            lines = seq,
            "Host execution finished"
        );
        self.publish(
            session,
            SessionEvent::HostFinished {
                host: address,
                status: result.status,
                exit_code: result.exit_code,
                reason: result.reason.clone(),
            },
        )
        .await;
        result
    }

    async fn emit(
        &self,
        session: &SessionId,
        host: &str,
        seq: &mut u64,
        result: &mut HostResult,
        raw: RawLine,
    ) {
        *seq += 1;
        let line = OutputLine {
            host: host.to_string(),
            seq: *seq,
            timestamp: Utc::now(),
            stream: raw.stream,
            content: raw.content,
        };
        result.output.push(line.clone());
        self.publish(session, SessionEvent::Line(line)).await;
    }

    async fn publish(&self, session: &SessionId, event: SessionEvent) {
        if let Err(e) = self.hub.publish(session, event).await {
            warn!(session = %session, error = %e, "Failed to publish session event");
        }
    }
}
