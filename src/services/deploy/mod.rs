//! 部署服务模块
//!
//! `Deployer` 把拓扑、环境锁、执行引擎和日志中心串成一次完整的部署：
//! 解析目标 → 确认 → 加锁 → 创建会话 → 后台并行执行 → 封存 → 释放锁

pub mod context;
pub mod engine;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{environment_from_name, ConfigurationError, EnvConfig, TopologyProvider};
use crate::domain::{
    environment_slug, lock_key, split_environment_slug, EnvironmentNote, FailureReason, Host,
    HostResult, LockRecord, SessionId, SessionMeta, SessionRecord, SessionSummary,
};
use crate::infra::{CoordinationStore, StoreError};
use crate::state::{HubError, LockError, LockManager, LogHub, LogStoreError};

pub use context::DeployContext;
pub use engine::{Engine, HostJob};

/// 备注在协调存储中的前缀
const NOTE_PREFIX: &str = "comments";

/// 部署错误
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("deploying {project}/{environment} requires confirmation")]
    ConfirmationRequired { project: String, environment: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Session(#[from] HubError),

    #[error(transparent)]
    Log(#[from] LogStoreError),

    #[error("coordination store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    InvalidInput(String),
}

/// 部署请求
#[derive(Clone, Debug, Deserialize)]
pub struct DeployRequest {
    pub project: String,
    pub environment: String,
    pub revision: String,
    pub requester: String,
    #[serde(default)]
    pub confirmed: bool,
}

/// 已启动的部署
#[derive(Clone, Debug, Serialize)]
pub struct StartedDeploy {
    pub session_id: SessionId,
    /// 会话标识的 URL 形式 `<environment>/<timestamp>`
    pub session: String,
    pub stream_url: String,
}

/// 运行中的会话
#[derive(Clone, Debug, Serialize)]
pub struct RunningSession {
    pub session_id: SessionId,
    pub project: String,
    pub environment: String,
    pub revision: String,
    pub requester: String,
    pub started_at: DateTime<Utc>,
}

struct RunningDeploy {
    session: RunningSession,
    cancel_token: CancellationToken,
}

/// 部署相关的运行参数
#[derive(Clone, Copy, Debug)]
pub struct DeploySettings {
    /// 部署锁租期，心跳每 1/3 租期续期一次
    pub lock_ttl: Duration,
    /// 手动锁租期
    pub manual_lock_ttl: Duration,
    /// 全局确认开关，与环境自身的开关取或
    pub confirm_deploy: bool,
}

impl From<&EnvConfig> for DeploySettings {
    fn from(config: &EnvConfig) -> Self {
        Self {
            lock_ttl: config.lock_ttl,
            manual_lock_ttl: config.manual_lock_ttl,
            confirm_deploy: config.confirm_deploy,
        }
    }
}

/// 项目总览
#[derive(Clone, Debug, Serialize)]
pub struct ProjectView {
    pub name: String,
    pub repo: String,
    pub environments: Vec<EnvironmentView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EnvironmentView {
    pub name: String,
    pub confirm_before_deploy: bool,
    pub comment: Option<String>,
    pub note: Option<EnvironmentNote>,
    pub lock: Option<LockRecord>,
    pub running: Option<SessionId>,
    pub hosts: Vec<HostView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HostView {
    #[serde(flatten)]
    pub host: Host,
    pub drifted: bool,
}

/// 部署编排器
pub struct Deployer {
    topology: Arc<dyn TopologyProvider>,
    store: Arc<dyn CoordinationStore>,
    locks: LockManager,
    hub: Arc<LogHub>,
    engine: Engine,
    settings: DeploySettings,
    /// 运行中的部署 (project/environment -> RunningDeploy)
    running: RwLock<HashMap<String, RunningDeploy>>,
    /// 进程级关闭令牌，会话令牌由它派生
    shutdown: CancellationToken,
}

impl Deployer {
    pub fn new(
        topology: Arc<dyn TopologyProvider>,
        store: Arc<dyn CoordinationStore>,
        locks: LockManager,
        hub: Arc<LogHub>,
        engine: Engine,
        settings: DeploySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            topology,
            store,
            locks,
            hub,
            engine,
            settings,
            running: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn hub(&self) -> &Arc<LogHub> {
        &self.hub
    }

    pub fn topology(&self) -> &Arc<dyn TopologyProvider> {
        &self.topology
    }

    /// 启动部署
    ///
    /// 加锁在返回前完成，同一环境的第二个请求直接得到冲突；执行在后台进行
    pub async fn start(self: &Arc<Self>, request: DeployRequest) -> Result<StartedDeploy, DeployError> {
        let projects = self.topology.load_topology().await?;
        let (project, env) =
            environment_from_name(&projects, &request.project, &request.environment)?;

        let accepted = env
            .procedure
            .accepts_revision(&request.revision)
            .map_err(|e| {
                ConfigurationError::Invalid(format!(
                    "revision format for {}/{}: {}",
                    project.name, env.name, e
                ))
            })?;
        if !accepted {
            return Err(ConfigurationError::InvalidRevision {
                revision: request.revision.clone(),
                format: env.procedure.revision_format.clone(),
            }
            .into());
        }

        if (env.confirm_before_deploy || self.settings.confirm_deploy) && !request.confirmed {
            return Err(DeployError::ConfirmationRequired {
                project: project.name.clone(),
                environment: env.name.clone(),
            });
        }

        let key = lock_key(&project.name, &env.name);
        let lock = self
            .locks
            .acquire(&key, &request.requester, self.settings.lock_ttl)
            .await?;

        let meta = SessionMeta {
            id: SessionId::now(environment_slug(&project.name, &env.name)),
            project: project.name.clone(),
            environment: env.name.clone(),
            revision: request.revision.clone(),
            requester: request.requester.clone(),
            hosts: env.hosts.iter().map(|h| h.address.clone()).collect(),
        };

        if let Err(e) = self.hub.open(&meta).await {
            if let Err(release_err) = lock.release().await {
                warn!(lock = %key, error = %release_err, "Failed to release lock after session error");
            }
            return Err(e.into());
        }

        let jobs = env
            .hosts
            .iter()
            .map(|host| HostJob {
                host: host.clone(),
                command: env
                    .procedure
                    .render(&project.name, &env.name, host, &request.revision),
            })
            .collect();

        let cancel_token = self.shutdown.child_token();
        let session_id = meta.id.clone();
        self.register_running(&key, &meta, cancel_token.clone()).await;

        info!(
            session = %session_id,
            project = %meta.project,
            environment = %meta.environment,
            revision = %meta.revision,
            requester = %meta.requester,
            hosts = meta.hosts.len(),
            "Deployment started"
        );

        let ctx = Arc::new(DeployContext {
            meta,
            jobs,
            lock: Arc::new(lock),
            cancel_token,
            hub: self.hub.clone(),
        });
        self.spawn_session(key, ctx);

        Ok(StartedDeploy {
            stream_url: format!(
                "/sessions/{}/{}/stream",
                session_id.environment,
                session_id.timestamp()
            ),
            session: session_id.to_string(),
            session_id,
        })
    }

    /// 后台执行会话
    ///
    /// 监督任务持有心跳与上下文：执行任务无论正常结束还是 panic，
    /// 都先停止心跳，再封存会话、释放锁、清理运行状态
    fn spawn_session(self: &Arc<Self>, key: String, ctx: Arc<DeployContext>) {
        let this = self.clone();
        tokio::spawn(async move {
            let stop_heartbeat = CancellationToken::new();
            let heartbeat =
                spawn_heartbeat(ctx.clone(), this.settings.lock_ttl, stop_heartbeat.clone());

            let run = tokio::spawn(this.clone().run_session(ctx.clone())).await;

            stop_heartbeat.cancel();
            if let Err(e) = heartbeat.await {
                warn!(session = %ctx.meta.id, error = %e, "Heartbeat task failed");
            }

            let results = match run {
                Ok(results) => results,
                Err(e) => {
                    error!(session = %ctx.meta.id, error = %e, "Deployment task crashed");
                    ctx.notice("deployment task crashed").await;
                    Vec::new()
                }
            };

            ctx.finish(results).await;
            this.unregister_running(&key).await;
        });
    }

    async fn run_session(self: Arc<Self>, ctx: Arc<DeployContext>) -> Vec<HostResult> {
        let results = if ctx.jobs.is_empty() {
            ctx.notice("environment has no hosts, nothing to deploy").await;
            Vec::new()
        } else {
            ctx.notice(format!(
                "deploying {} to {} host(s), requested by {}",
                ctx.meta.revision,
                ctx.jobs.len(),
                ctx.meta.requester
            ))
            .await;
            self.execute(&ctx).await
        };

        if ctx.is_cancelled() {
            ctx.notice("deployment cancelled").await;
        }

        for result in results.iter().filter(|r| r.is_success()) {
            if let Err(e) = self
                .topology
                .record_deployed_revision(
                    &ctx.meta.project,
                    &ctx.meta.environment,
                    &result.host,
                    &ctx.meta.revision,
                )
                .await
            {
                warn!(session = %ctx.meta.id, host = %result.host, error = %e, "Failed to record deployed revision");
            }
        }

        results
    }

    /// 执行引擎运行在独立任务中，整体崩溃时所有主机记为 crashed
    async fn execute(&self, ctx: &DeployContext) -> Vec<HostResult> {
        let engine = self.engine.clone();
        let id = ctx.meta.id.clone();
        let jobs = ctx.jobs.clone();
        let cancel = ctx.cancel_token.clone();

        match tokio::spawn(async move { engine.run(&id, jobs, cancel).await }).await {
            Ok(results) => results,
            Err(e) => {
                error!(session = %ctx.meta.id, error = %e, "Execution engine crashed");
                ctx.jobs
                    .iter()
                    .map(|job| {
                        let mut result = HostResult::pending(&job.host.address);
                        result.fail(None, FailureReason::Crashed(e.to_string()));
                        result
                    })
                    .collect()
            }
        }
    }

    async fn register_running(&self, key: &str, meta: &SessionMeta, cancel_token: CancellationToken) {
        let mut running = self.running.write().await;
        running.insert(
            key.to_string(),
            RunningDeploy {
                session: RunningSession {
                    session_id: meta.id.clone(),
                    project: meta.project.clone(),
                    environment: meta.environment.clone(),
                    revision: meta.revision.clone(),
                    requester: meta.requester.clone(),
                    started_at: meta.id.started_at,
                },
                cancel_token,
            },
        );
    }

    async fn unregister_running(&self, key: &str) {
        let mut running = self.running.write().await;
        running.remove(key);
    }

    /// 运行中的会话
    pub async fn running(&self) -> Vec<RunningSession> {
        let running = self.running.read().await;
        let mut sessions: Vec<RunningSession> =
            running.values().map(|d| d.session.clone()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// 取消某环境正在运行的部署
    pub async fn cancel(&self, project: &str, environment: &str) -> bool {
        let running = self.running.read().await;
        match running.get(&lock_key(project, environment)) {
            Some(deploy) => {
                deploy.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// 手动加锁，直到 unlock 或租期结束
    pub async fn lock(
        &self,
        project: &str,
        environment: &str,
        requester: &str,
    ) -> Result<LockRecord, DeployError> {
        self.resolve(project, environment).await?;
        let handle = self
            .locks
            .acquire(
                &lock_key(project, environment),
                requester,
                self.settings.manual_lock_ttl,
            )
            .await?;
        let record = handle.keep()?;
        info!(project = %project, environment = %environment, holder = %requester, "Environment locked manually");
        Ok(record)
    }

    /// 按持有者释放锁
    pub async fn unlock(
        &self,
        project: &str,
        environment: &str,
        requester: &str,
    ) -> Result<(), DeployError> {
        self.resolve(project, environment).await?;
        self.locks
            .release(&lock_key(project, environment), requester)
            .await?;
        Ok(())
    }

    pub async fn lock_status(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Option<LockRecord>, DeployError> {
        self.resolve(project, environment).await?;
        Ok(self.locks.status(&lock_key(project, environment)).await?)
    }

    /// 某环境的部署历史（`project-environment`）
    pub async fn history(
        &self,
        environment: &str,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, DeployError> {
        if split_environment_slug(environment).is_none() {
            return Err(DeployError::InvalidInput(format!(
                "'{}' is not a project-environment identifier",
                environment
            )));
        }
        Ok(self.hub.store().list(environment, limit).await?)
    }

    /// 读取会话日志
    pub async fn read_log(&self, id: &SessionId) -> Result<SessionRecord, DeployError> {
        Ok(self.hub.store().read(id).await?)
    }

    /// 设置环境备注，空文本清除备注
    pub async fn set_note(
        &self,
        project: &str,
        environment: &str,
        author: &str,
        text: &str,
    ) -> Result<Option<EnvironmentNote>, DeployError> {
        self.resolve(project, environment).await?;
        let key = note_key(project, environment);
        let text = text.trim();

        if text.is_empty() {
            if let Some(existing) = self.store.get(&key).await? {
                self.store.compare_and_delete(&key, &existing).await?;
            }
            debug!(project = %project, environment = %environment, "Environment note cleared");
            return Ok(None);
        }

        let note = EnvironmentNote {
            text: text.to_string(),
            author: author.to_string(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&note).map_err(|e| DeployError::InvalidInput(e.to_string()))?;
        self.store.put(&key, &bytes).await?;
        Ok(Some(note))
    }

    pub async fn note(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Option<EnvironmentNote>, DeployError> {
        let key = note_key(project, environment);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(note) => Ok(Some(note)),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring unreadable environment note");
                Ok(None)
            }
        }
    }

    /// 拓扑 + 锁 + 备注 + 运行状态
    pub async fn overview(&self) -> Result<Vec<ProjectView>, DeployError> {
        let projects = self.topology.load_topology().await?;
        let running: HashMap<String, SessionId> = {
            let running = self.running.read().await;
            running
                .iter()
                .map(|(k, d)| (k.clone(), d.session.session_id.clone()))
                .collect()
        };

        let mut views = Vec::with_capacity(projects.len());
        for project in projects {
            let mut environments = Vec::with_capacity(project.environments.len());
            for env in project.environments {
                let key = lock_key(&project.name, &env.name);
                environments.push(EnvironmentView {
                    lock: self.locks.status(&key).await?,
                    note: self.note(&project.name, &env.name).await?,
                    running: running.get(&key).cloned(),
                    hosts: env
                        .hosts
                        .into_iter()
                        .map(|host| HostView {
                            drifted: host.is_drifted(),
                            host,
                        })
                        .collect(),
                    name: env.name,
                    confirm_before_deploy: env.confirm_before_deploy,
                    comment: env.comment,
                });
            }
            views.push(ProjectView {
                name: project.name,
                repo: project.repo,
                environments,
            });
        }
        Ok(views)
    }

    async fn resolve(&self, project: &str, environment: &str) -> Result<(), DeployError> {
        let projects = self.topology.load_topology().await?;
        environment_from_name(&projects, project, environment)?;
        Ok(())
    }
}

fn note_key(project: &str, environment: &str) -> String {
    format!("{}/{}/{}", NOTE_PREFIX, project, environment)
}

/// 启动心跳任务
///
/// 每 1/3 租期续期一次；锁被他人回收时取消会话
fn spawn_heartbeat(
    ctx: Arc<DeployContext>,
    ttl: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = (ttl / 3).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    match ctx.lock.refresh(ttl).await {
                        Ok(()) => debug!(session = %ctx.meta.id, "Lock refreshed"),
                        Err(LockError::StoreUnavailable(e)) => {
                            warn!(session = %ctx.meta.id, error = %e, "Lock refresh failed, will retry");
                        }
                        Err(e) => {
                            error!(session = %ctx.meta.id, lock = %ctx.lock.key(), error = %e, "Deployment lock lost");
                            ctx.notice("deployment lock lost, cancelling").await;
                            ctx.cancel_token.cancel();
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::config::StaticTopology;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use crate::domain::{
        DeployProcedure, Environment, Outcome, Project, RawLine, SessionEvent, SessionOutcome,
    };
    use crate::error::ApiError;
    use crate::infra::{ExecError, MemoryStore, RemoteExecutor};
    use crate::state::MemoryLogStore;

    struct EchoExecutor;

    #[async_trait]
    impl RemoteExecutor for EchoExecutor {
        async fn run(
            &self,
            _host: &Host,
            command: &str,
            sink: mpsc::Sender<RawLine>,
        ) -> Result<i32, ExecError> {
            let _ = sink.send(RawLine::stdout(command)).await;
            Ok(0)
        }
    }

    fn environment(name: &str, hosts: &[&str], confirm: bool) -> Environment {
        Environment {
            name: name.to_string(),
            hosts: hosts
                .iter()
                .map(|a| Host {
                    address: a.to_string(),
                    port: 22,
                    user: "deploy".to_string(),
                    credential: None,
                    deployed_revision: None,
                    latest_revision: None,
                })
                .collect(),
            procedure: DeployProcedure {
                command: "deploy {project} {environment} {revision}".to_string(),
                working_dir: None,
                revision_format: crate::domain::topology::DEFAULT_REVISION_FORMAT.to_string(),
            },
            confirm_before_deploy: confirm,
            comment: None,
        }
    }

    /// 休眠后输出一行的执行器，用于长时间运行的部署
    struct SlowExecutor(Duration);

    #[async_trait]
    impl RemoteExecutor for SlowExecutor {
        async fn run(
            &self,
            _host: &Host,
            command: &str,
            sink: mpsc::Sender<RawLine>,
        ) -> Result<i32, ExecError> {
            tokio::time::sleep(self.0).await;
            let _ = sink.send(RawLine::stdout(command)).await;
            Ok(0)
        }
    }

    /// 记录部署 revision 时 panic 的拓扑
    struct PanickingTopology(StaticTopology);

    #[async_trait]
    impl TopologyProvider for PanickingTopology {
        async fn load_topology(&self) -> Result<Vec<Project>, ConfigurationError> {
            self.0.load_topology().await
        }

        async fn record_deployed_revision(
            &self,
            _project: &str,
            _environment: &str,
            _host: &str,
            _revision: &str,
        ) -> Result<(), ConfigurationError> {
            panic!("topology backend exploded");
        }
    }

    /// 所有操作都失败的协调存储
    struct UnreachableStore;

    #[async_trait]
    impl CoordinationStore for UnreachableStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn put(&self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn create_if_absent(&self, _key: &str, _value: &[u8]) -> Result<bool, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn compare_and_delete(&self, _key: &str, _expected: &[u8]) -> Result<bool, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: &[u8],
            _new: &[u8],
        ) -> Result<bool, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }
    }

    fn topology() -> StaticTopology {
        StaticTopology::new(vec![Project {
            name: "shop".to_string(),
            repo: "acme/shop".to_string(),
            environments: vec![
                environment("staging", &["h1", "h2"], false),
                environment("production", &["p1"], true),
                environment("empty", &[], false),
            ],
        }])
    }

    fn settings(lock_ttl: Duration, confirm_deploy: bool) -> DeploySettings {
        DeploySettings {
            lock_ttl,
            manual_lock_ttl: Duration::from_secs(60),
            confirm_deploy,
        }
    }

    fn build(
        topology: Arc<dyn TopologyProvider>,
        store: Arc<dyn CoordinationStore>,
        executor: Arc<dyn RemoteExecutor>,
        settings: DeploySettings,
    ) -> Arc<Deployer> {
        let hub = Arc::new(LogHub::new(Arc::new(MemoryLogStore::new())));
        let engine = Engine::new(executor, hub.clone(), Duration::from_secs(5));
        Arc::new(Deployer::new(
            topology,
            store.clone(),
            LockManager::new(store, "test-node"),
            hub,
            engine,
            settings,
            CancellationToken::new(),
        ))
    }

    fn deployer(confirm_deploy: bool) -> Arc<Deployer> {
        build(
            Arc::new(topology()),
            Arc::new(MemoryStore::new()),
            Arc::new(EchoExecutor),
            settings(Duration::from_secs(30), confirm_deploy),
        )
    }

    fn request(environment: &str, revision: &str, confirmed: bool) -> DeployRequest {
        DeployRequest {
            project: "shop".to_string(),
            environment: environment.to_string(),
            revision: revision.to_string(),
            requester: "alice".to_string(),
            confirmed,
        }
    }

    async fn wait_sealed(deployer: &Deployer, id: &SessionId) -> SessionOutcome {
        let mut sub = deployer.hub().subscribe(id).await.unwrap();
        while let Some(event) = sub.next().await {
            if let SessionEvent::Sealed(outcome) = event {
                return outcome;
            }
        }
        panic!("session ended without seal");
    }

    /// 封存后锁的释放紧随其后，轮询等待
    async fn wait_unlocked(deployer: &Deployer, environment: &str) -> Option<LockRecord> {
        for _ in 0..40 {
            let status = deployer.lock_status("shop", environment).await.unwrap();
            if status.is_none() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        deployer.lock_status("shop", environment).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let deployer = deployer(false);
        let mut req = request("qa", "abc1234", true);
        assert!(matches!(
            deployer.start(req.clone()).await,
            Err(DeployError::Configuration(ConfigurationError::EnvironmentNotFound { .. }))
        ));
        req.project = "blog".to_string();
        assert!(matches!(
            deployer.start(req).await,
            Err(DeployError::Configuration(ConfigurationError::ProjectNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_revision_takes_no_lock() {
        let deployer = deployer(false);
        assert!(matches!(
            deployer.start(request("staging", "not a sha", true)).await,
            Err(DeployError::Configuration(ConfigurationError::InvalidRevision { .. }))
        ));
        assert!(deployer.lock_status("shop", "staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_confirmation_gate() {
        let deployer = deployer(false);
        assert!(matches!(
            deployer.start(request("production", "abc1234", false)).await,
            Err(DeployError::ConfirmationRequired { .. })
        ));
        assert!(deployer.lock_status("shop", "production").await.unwrap().is_none());

        let global = self::deployer(true);
        assert!(matches!(
            global.start(request("staging", "abc1234", false)).await,
            Err(DeployError::ConfirmationRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_successful_deploy_releases_lock_and_records_revision() {
        let deployer = deployer(false);
        let started = deployer.start(request("staging", "abc1234", false)).await.unwrap();
        assert_eq!(started.session_id.environment, "shop-staging");
        assert!(started.stream_url.starts_with("/sessions/shop-staging/"));

        let outcome = wait_sealed(&deployer, &started.session_id).await;
        assert_eq!(outcome.outcome, Outcome::Succeeded);
        assert_eq!(outcome.hosts.len(), 2);
        assert_eq!(outcome.hosts[0].output[0].content, "deploy shop staging abc1234");

        // 封存后锁随即释放
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(deployer.lock_status("shop", "staging").await.unwrap().is_none());
        assert!(deployer.running().await.is_empty());

        let projects = deployer.topology().load_topology().await.unwrap();
        let staging = projects[0].environment("staging").unwrap();
        assert_eq!(staging.hosts[0].deployed_revision.as_deref(), Some("abc1234"));

        let history = deployer.history("shop-staging", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, Some(Outcome::Succeeded));
    }

    #[tokio::test]
    async fn test_empty_environment_seals_failed() {
        let deployer = deployer(false);
        let started = deployer.start(request("empty", "abc1234", false)).await.unwrap();
        let outcome = wait_sealed(&deployer, &started.session_id).await;
        assert_eq!(outcome.outcome, Outcome::Failed);
        assert!(outcome.hosts.is_empty());

        let record = deployer.read_log(&started.session_id).await.unwrap();
        assert!(record
            .transcript
            .iter()
            .any(|e| matches!(e, SessionEvent::Notice { .. })));
    }

    #[tokio::test]
    async fn test_manual_lock_blocks_deploy_until_unlock() {
        let deployer = deployer(false);
        let record = deployer.lock("shop", "staging", "bob").await.unwrap();
        assert_eq!(record.holder, "bob");

        match deployer.start(request("staging", "abc1234", false)).await {
            Err(DeployError::Lock(LockError::AlreadyLocked { holder, .. })) => {
                assert_eq!(holder, "bob")
            }
            other => panic!("unexpected: {:?}", other.map(|s| s.session)),
        }

        assert!(matches!(
            deployer.unlock("shop", "staging", "alice").await,
            Err(DeployError::Lock(LockError::NotOwner { .. }))
        ));
        deployer.unlock("shop", "staging", "bob").await.unwrap();
        assert!(deployer.start(request("staging", "abc1234", false)).await.is_ok());
    }

    #[tokio::test]
    async fn test_notes() {
        let deployer = deployer(false);
        assert!(deployer.note("shop", "staging").await.unwrap().is_none());

        let note = deployer
            .set_note("shop", "staging", "alice", "  db migration pending ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.text, "db migration pending");
        assert_eq!(deployer.note("shop", "staging").await.unwrap(), Some(note));

        deployer.set_note("shop", "staging", "alice", "").await.unwrap();
        assert!(deployer.note("shop", "staging").await.unwrap().is_none());

        let overview = deployer.overview().await.unwrap();
        assert_eq!(overview[0].environments.len(), 3);
    }

    #[tokio::test]
    async fn test_history_requires_project_environment_identifier() {
        let deployer = deployer(false);
        assert!(deployer.history("shop-staging", 10).await.unwrap().is_empty());
        assert!(matches!(
            deployer.history("staging", 10).await,
            Err(DeployError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_store_outage_fails_start_without_session() {
        let deployer = build(
            Arc::new(topology()),
            Arc::new(UnreachableStore),
            Arc::new(EchoExecutor),
            settings(Duration::from_secs(30), false),
        );

        let err = deployer
            .start(request("staging", "abc1234", false))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Lock(LockError::StoreUnavailable(_))));
        assert_eq!(
            ApiError::from(err).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        // 没有打开会话，也没有登记运行状态
        assert_eq!(deployer.hub().count().await, 0);
        assert!(deployer.running().await.is_empty());
        assert!(deployer.history("shop-staging", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_in_session_task_still_releases_lock() {
        let deployer = build(
            Arc::new(PanickingTopology(topology())),
            Arc::new(MemoryStore::new()),
            Arc::new(EchoExecutor),
            settings(Duration::from_millis(300), false),
        );

        let started = deployer.start(request("staging", "abc1234", false)).await.unwrap();
        let outcome = wait_sealed(&deployer, &started.session_id).await;
        assert_eq!(outcome.outcome, Outcome::Failed);

        assert!(wait_unlocked(&deployer, "staging").await.is_none());
        assert!(deployer.running().await.is_empty());

        // 心跳已停止，锁不会被重新续上
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(deployer.lock_status("shop", "staging").await.unwrap().is_none());
        assert!(deployer.start(request("staging", "abc1234", false)).await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_beyond_ttl() {
        let deployer = build(
            Arc::new(topology()),
            Arc::new(MemoryStore::new()),
            Arc::new(SlowExecutor(Duration::from_millis(1000))),
            settings(Duration::from_millis(300), false),
        );

        let started = deployer.start(request("staging", "abc1234", false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        match deployer.start(request("staging", "abc1234", false)).await {
            Err(DeployError::Lock(LockError::AlreadyLocked { holder, .. })) => {
                assert_eq!(holder, "alice")
            }
            other => panic!("unexpected: {:?}", other.map(|s| s.session)),
        }

        let outcome = wait_sealed(&deployer, &started.session_id).await;
        assert_eq!(outcome.outcome, Outcome::Succeeded);
        assert!(wait_unlocked(&deployer, "staging").await.is_none());
    }

    #[tokio::test]
    async fn test_lost_lock_cancels_session() {
        let store = Arc::new(MemoryStore::new());
        let deployer = build(
            Arc::new(topology()),
            store.clone(),
            Arc::new(SlowExecutor(Duration::from_secs(5))),
            settings(Duration::from_millis(300), false),
        );

        let started = deployer.start(request("staging", "abc1234", false)).await.unwrap();

        // 另一节点回收并占用了锁
        let usurper = LockRecord::new("mallory", "other-node", chrono::Duration::seconds(60));
        store
            .put("locks/shop/staging", &serde_json::to_vec(&usurper).unwrap())
            .await
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            wait_sealed(&deployer, &started.session_id),
        )
        .await
        .expect("session should be cancelled well before the hosts finish");
        assert_eq!(outcome.outcome, Outcome::Failed);
        assert_eq!(outcome.hosts.len(), 2);
        assert!(outcome
            .hosts
            .iter()
            .all(|h| h.reason == Some(FailureReason::Cancelled)));

        // 释放只删除自己的记录，新持有者不受影响
        let holder = deployer.lock_status("shop", "staging").await.unwrap().unwrap();
        assert_eq!(holder.holder, "mallory");

        let record = deployer.read_log(&started.session_id).await.unwrap();
        assert!(record.transcript.iter().any(|e| matches!(
            e,
            SessionEvent::Notice { message, .. } if message.contains("lock lost")
        )));
    }
}
