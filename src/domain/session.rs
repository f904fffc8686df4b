//! 部署会话领域模型
//!
//! DeploySession / HostResult / OutputLine 以及 Hub 广播的事件

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 会话时间戳格式（同时用作日志文件名）
pub const SESSION_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// 会话标识：(environment, startTime)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    /// `project-environment`
    pub environment: String,
    pub started_at: DateTime<Utc>,
}

impl SessionId {
    /// 以当前时间创建（精确到微秒，保证可往返解析）
    pub fn now(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            started_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// 从 URL 片段解析
    pub fn parse(environment: &str, timestamp: &str) -> Option<Self> {
        let naive = NaiveDateTime::parse_from_str(timestamp, SESSION_TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            environment: environment.to_string(),
            started_at: Utc.from_utc_datetime(&naive),
        })
    }

    /// 时间戳片段
    pub fn timestamp(&self) -> String {
        self.started_at.format(SESSION_TIMESTAMP_FORMAT).to_string()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.timestamp())
    }
}

/// 输出流
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// 单行输出
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    pub host: String,
    /// 主机内单调递增序号，从 1 开始
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub content: String,
}

/// 执行器产出的原始行（尚未编号）
#[derive(Clone, Debug)]
pub struct RawLine {
    pub stream: OutputStream,
    pub content: String,
}

impl RawLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            content: content.into(),
        }
    }
}

/// 主机执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Pending => "pending",
            HostStatus::Running => "running",
            HostStatus::Succeeded => "succeeded",
            HostStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostStatus::Succeeded | HostStatus::Failed)
    }
}

/// 主机失败原因
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// 部署脚本非零退出
    ExitCode(i32),
    /// 无法连接或认证失败
    Connection(String),
    /// 超过单机执行时限
    Timeout,
    /// 会话被取消（进程关闭等）
    Cancelled,
    /// 执行单元异常退出
    Crashed(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode(code) => write!(f, "exit code {}", code),
            FailureReason::Connection(e) => write!(f, "connection failed: {}", e),
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Crashed(e) => write!(f, "crashed: {}", e),
        }
    }
}

/// 单台主机的执行结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostResult {
    pub host: String,
    pub status: HostStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Vec<OutputLine>,
}

impl HostResult {
    pub fn pending(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Pending,
            exit_code: None,
            reason: None,
            started_at: None,
            finished_at: None,
            output: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = HostStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, exit_code: i32) {
        self.status = HostStatus::Succeeded;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, exit_code: Option<i32>, reason: FailureReason) {
        self.status = HostStatus::Failed;
        self.exit_code = exit_code;
        self.reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status == HostStatus::Succeeded
    }
}

/// 会话聚合结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    /// 全部成功才算成功（空列表视为失败）
    pub fn aggregate(results: &[HostResult]) -> Self {
        if !results.is_empty() && results.iter().all(HostResult::is_success) {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
        }
    }
}

/// 会话封存时的最终记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
    pub hosts: Vec<HostResult>,
}

impl SessionOutcome {
    pub fn from_results(hosts: Vec<HostResult>) -> Self {
        Self {
            outcome: Outcome::aggregate(&hosts),
            finished_at: Utc::now(),
            hosts,
        }
    }
}

/// 会话元数据（who / what / when）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub project: String,
    pub environment: String,
    pub revision: String,
    pub requester: String,
    pub hosts: Vec<String>,
}

/// Hub 广播 / 日志存储的事件
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Line(OutputLine),
    HostStarted {
        host: String,
    },
    HostFinished {
        host: String,
        status: HostStatus,
        exit_code: Option<i32>,
        reason: Option<FailureReason>,
    },
    Notice {
        message: String,
    },
    Sealed(SessionOutcome),
}

impl SessionEvent {
    pub fn notice(message: impl Into<String>) -> Self {
        SessionEvent::Notice {
            message: message.into(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, SessionEvent::Sealed(_))
    }
}

/// 持久化后的完整会话
#[derive(Clone, Debug, Serialize)]
pub struct SessionRecord {
    pub meta: SessionMeta,
    pub transcript: Vec<SessionEvent>,
    pub outcome: Option<SessionOutcome>,
}

impl SessionRecord {
    pub fn is_sealed(&self) -> bool {
        self.outcome.is_some()
    }
}

/// 历史列表条目
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub revision: String,
    pub requester: String,
    pub outcome: Option<Outcome>,
    pub finished_at: Option<DateTime<Utc>>,
}
