//! 基础设施模块
//!
//! 封装外部依赖（协调存储、SSH、本机命令执行）

pub mod command;
pub mod executor;
pub mod ssh;
pub mod store;

pub use command::LocalExecutor;
pub use executor::{ExecError, HostExecutor, RemoteExecutor};
pub use ssh::SshExecutor;
pub use store::{CoordinationStore, MemoryStore, RedisStore, StoreError};
