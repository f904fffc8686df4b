//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod lock;
pub mod session;
pub mod topology;

// Re-exports for convenience
pub use lock::LockRecord;
pub use session::{
    FailureReason, HostResult, HostStatus, Outcome, OutputLine, OutputStream, RawLine,
    SessionEvent, SessionId, SessionMeta, SessionOutcome, SessionRecord, SessionSummary,
};
pub use topology::{
    environment_slug, lock_key, split_environment_slug, DeployProcedure, Environment,
    EnvironmentNote, Host, Project,
};
