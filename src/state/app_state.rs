//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::env::constants::{REDIS_NAMESPACE, REDIS_POOL_SIZE, SSH_CONNECT_TIMEOUT_SECS};
use crate::config::{EnvConfig, FileTopology, TopologyProvider};
use crate::infra::{
    CoordinationStore, HostExecutor, LocalExecutor, MemoryStore, RedisStore, RemoteExecutor,
    SshExecutor, StoreError,
};
use crate::services::deploy::{DeploySettings, Deployer, Engine};

use super::lock_manager::LockManager;
use super::log_hub::LogHub;
use super::log_store::{FileLogStore, LogStore};

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 部署 ==========
    /// 日志中心
    pub log_hub: Arc<LogHub>,
    /// 部署编排器
    pub deployer: Arc<Deployer>,
}

impl AppState {
    /// 按配置创建应用状态
    ///
    /// 配置了 Redis 时使用共享协调存储，否则使用进程内存储
    pub async fn from_config(config: EnvConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn CoordinationStore> = match config.redis_url.as_deref() {
            Some(url) => {
                Arc::new(RedisStore::connect(url, REDIS_NAMESPACE, REDIS_POOL_SIZE).await?)
            }
            None => {
                tracing::warn!("SHIPDECK_REDIS_URL not set, locks are only held within this process");
                Arc::new(MemoryStore::new())
            }
        };

        let topology = Arc::new(FileTopology::new(config.topology_path.clone()));
        let log_store = Arc::new(FileLogStore::new(config.data_dir.clone()));
        let executor = Arc::new(HostExecutor::new(
            LocalExecutor::new(),
            SshExecutor::new(
                config.ssh_key.clone(),
                config.known_hosts.clone(),
                Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS),
            ),
        ));

        tracing::info!(
            bind = %config.bind,
            data_dir = %config.data_dir.display(),
            topology = %config.topology_path.display(),
            redis = config.redis_url.is_some(),
            node = %config.node,
            confirm_deploy = config.confirm_deploy,
            lock_ttl_secs = config.lock_ttl.as_secs(),
            host_timeout_secs = config.host_timeout.as_secs(),
            "Loaded configuration"
        );

        Ok(Self::with_components(
            config, topology, store, log_store, executor,
        ))
    }

    /// 由现成的组件组装
    pub fn with_components(
        config: EnvConfig,
        topology: Arc<dyn TopologyProvider>,
        store: Arc<dyn CoordinationStore>,
        log_store: Arc<dyn LogStore>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let log_hub = Arc::new(LogHub::new(log_store));
        let engine = Engine::new(executor, log_hub.clone(), config.host_timeout);
        let locks = LockManager::new(store.clone(), config.node.clone());
        let deployer = Arc::new(Deployer::new(
            topology,
            store,
            locks,
            log_hub.clone(),
            engine,
            DeploySettings::from(&config),
            get_shutdown_token(),
        ));

        Self {
            api_key: config.api_key.clone(),
            started_at: Utc::now(),
            log_hub,
            deployer,
            config,
        }
    }
}
