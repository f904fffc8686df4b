//! 运行时状态模块
//!
//! 管理应用状态、环境锁、日志通道和部署日志存储

pub mod app_state;
pub mod lock_manager;
pub mod log_hub;
pub mod log_store;

pub use app_state::{get_shutdown_token, trigger_shutdown, AppState};
pub use lock_manager::{LockError, LockHandle, LockManager};
pub use log_hub::{HubError, LogHub, Subscription};
pub use log_store::{FileLogStore, LogStore, LogStoreError, MemoryLogStore};
