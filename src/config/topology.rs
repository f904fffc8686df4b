//! 拓扑配置
//!
//! 从 TOML 文件加载 Project → Environment → Host，每次请求重新读取；
//! 部署成功后记录的 revision 保存在进程内并覆盖到读取结果上

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::{Environment, Project};

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("environment '{environment}' not found in project '{project}'")]
    EnvironmentNotFound {
        project: String,
        environment: String,
    },

    #[error("revision '{revision}' does not match '{format}'")]
    InvalidRevision { revision: String, format: String },

    #[error("invalid topology: {0}")]
    Invalid(String),

    #[error("failed to load topology from {path}: {message}")]
    Load { path: String, message: String },
}

/// 拓扑提供者
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// 当前拓扑
    async fn load_topology(&self) -> Result<Vec<Project>, ConfigurationError>;

    /// 记录主机部署成功的 revision
    async fn record_deployed_revision(
        &self,
        project: &str,
        environment: &str,
        host: &str,
        revision: &str,
    ) -> Result<(), ConfigurationError>;
}

/// 按名称解析部署目标
pub fn environment_from_name<'a>(
    projects: &'a [Project],
    project: &str,
    environment: &str,
) -> Result<(&'a Project, &'a Environment), ConfigurationError> {
    let found = projects
        .iter()
        .find(|p| p.name == project)
        .ok_or_else(|| ConfigurationError::ProjectNotFound(project.to_string()))?;
    let env = found
        .environment(environment)
        .ok_or_else(|| ConfigurationError::EnvironmentNotFound {
            project: project.to_string(),
            environment: environment.to_string(),
        })?;
    Ok((found, env))
}

#[derive(Deserialize)]
struct TopologyDocument {
    #[serde(default)]
    projects: Vec<Project>,
}

/// 解析并校验 TOML 拓扑
pub fn parse_topology(text: &str) -> Result<Vec<Project>, ConfigurationError> {
    let document: TopologyDocument =
        toml::from_str(text).map_err(|e| ConfigurationError::Invalid(e.to_string()))?;

    let mut names = HashSet::new();
    for project in &document.projects {
        if !names.insert(project.name.as_str()) {
            return Err(ConfigurationError::Invalid(format!(
                "duplicate project '{}'",
                project.name
            )));
        }
        project.validate().map_err(ConfigurationError::Invalid)?;
    }
    Ok(document.projects)
}

type HostKey = (String, String, String);

/// 已部署 revision 覆盖层
#[derive(Default)]
struct DeployedRevisions {
    records: RwLock<HashMap<HostKey, String>>,
}

impl DeployedRevisions {
    async fn record(&self, project: &str, environment: &str, host: &str, revision: &str) {
        let mut records = self.records.write().await;
        records.insert(
            (project.to_string(), environment.to_string(), host.to_string()),
            revision.to_string(),
        );
    }

    async fn overlay(&self, projects: &mut [Project]) {
        let records = self.records.read().await;
        if records.is_empty() {
            return;
        }
        for project in projects.iter_mut() {
            for env in project.environments.iter_mut() {
                for host in env.hosts.iter_mut() {
                    let key = (project.name.clone(), env.name.clone(), host.address.clone());
                    if let Some(revision) = records.get(&key) {
                        host.deployed_revision = Some(revision.clone());
                    }
                }
            }
        }
    }
}

/// 基于 TOML 文件的拓扑
pub struct FileTopology {
    path: PathBuf,
    deployed: DeployedRevisions,
}

impl FileTopology {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            deployed: DeployedRevisions::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TopologyProvider for FileTopology {
    async fn load_topology(&self) -> Result<Vec<Project>, ConfigurationError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigurationError::Load {
                path: self.path.display().to_string(),
                message: e.to_string(),
            })?;
        let mut projects = parse_topology(&text)?;
        self.deployed.overlay(&mut projects).await;
        Ok(projects)
    }

    async fn record_deployed_revision(
        &self,
        project: &str,
        environment: &str,
        host: &str,
        revision: &str,
    ) -> Result<(), ConfigurationError> {
        self.deployed.record(project, environment, host, revision).await;
        Ok(())
    }
}

/// 内存拓扑（嵌入使用和测试）
pub struct StaticTopology {
    projects: Vec<Project>,
    deployed: DeployedRevisions,
}

impl StaticTopology {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects,
            deployed: DeployedRevisions::default(),
        }
    }
}

#[async_trait]
impl TopologyProvider for StaticTopology {
    async fn load_topology(&self) -> Result<Vec<Project>, ConfigurationError> {
        let mut projects = self.projects.clone();
        self.deployed.overlay(&mut projects).await;
        Ok(projects)
    }

    async fn record_deployed_revision(
        &self,
        project: &str,
        environment: &str,
        host: &str,
        revision: &str,
    ) -> Result<(), ConfigurationError> {
        self.deployed.record(project, environment, host, revision).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[[projects]]
name = "shop"
repo = "acme/shop"

[[projects.environments]]
name = "staging"
confirm_before_deploy = false

[projects.environments.procedure]
command = "./deploy.sh {revision}"
working_dir = "/srv/shop"

[[projects.environments.hosts]]
address = "10.0.0.1"

[[projects.environments.hosts]]
address = "10.0.0.2"
user = "ops"
port = 2222

[[projects.environments]]
name = "production"
confirm_before_deploy = true
comment = "freeze until friday"

[projects.environments.procedure]
command = "./deploy.sh {revision}"
"#;

    #[test]
    fn test_parse_topology() {
        let projects = parse_topology(SAMPLE).unwrap();
        assert_eq!(projects.len(), 1);
        let shop = &projects[0];
        assert_eq!(shop.environments.len(), 2);

        let staging = shop.environment("staging").unwrap();
        assert_eq!(staging.hosts.len(), 2);
        assert_eq!(staging.hosts[0].port, 22);
        assert_eq!(staging.hosts[0].user, "deploy");
        assert_eq!(staging.hosts[1].port, 2222);
        assert_eq!(staging.hosts[1].user, "ops");

        let production = shop.environment("production").unwrap();
        assert!(production.confirm_before_deploy);
        assert!(production.hosts.is_empty());
        assert_eq!(production.comment.as_deref(), Some("freeze until friday"));
    }

    #[test]
    fn test_duplicate_environment_rejected() {
        let text = r#"
[[projects]]
name = "shop"
repo = "acme/shop"

[[projects.environments]]
name = "staging"
procedure = { command = "true" }

[[projects.environments]]
name = "staging"
procedure = { command = "true" }
"#;
        assert!(matches!(
            parse_topology(text),
            Err(ConfigurationError::Invalid(_))
        ));
    }

    #[test]
    fn test_dashed_environment_name_rejected() {
        let text = r#"
[[projects]]
name = "shop"
repo = "acme/shop"

[[projects.environments]]
name = "eu-staging"
procedure = { command = "true" }
"#;
        assert!(matches!(
            parse_topology(text),
            Err(ConfigurationError::Invalid(_))
        ));
    }

    #[test]
    fn test_environment_from_name() {
        let projects = parse_topology(SAMPLE).unwrap();
        let (project, env) = environment_from_name(&projects, "shop", "staging").unwrap();
        assert_eq!(project.name, "shop");
        assert_eq!(env.name, "staging");

        assert!(matches!(
            environment_from_name(&projects, "blog", "staging"),
            Err(ConfigurationError::ProjectNotFound(_))
        ));
        assert!(matches!(
            environment_from_name(&projects, "shop", "qa"),
            Err(ConfigurationError::EnvironmentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_topology_reloads_and_keeps_deployed_revisions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let topology = FileTopology::new(file.path());

        topology
            .record_deployed_revision("shop", "staging", "10.0.0.1", "abc1234")
            .await
            .unwrap();

        let projects = topology.load_topology().await.unwrap();
        let staging = projects[0].environment("staging").unwrap();
        assert_eq!(staging.hosts[0].deployed_revision.as_deref(), Some("abc1234"));
        assert_eq!(staging.hosts[1].deployed_revision, None);

        // 文件变更后下一次读取即生效
        std::fs::write(file.path(), SAMPLE.replace("acme/shop", "acme/shop2")).unwrap();
        let projects = topology.load_topology().await.unwrap();
        assert_eq!(projects[0].repo, "acme/shop2");
        let staging = projects[0].environment("staging").unwrap();
        assert_eq!(staging.hosts[0].deployed_revision.as_deref(), Some("abc1234"));
    }

    #[tokio::test]
    async fn test_missing_file_is_load_error() {
        let topology = FileTopology::new("/nonexistent/topology.toml");
        assert!(matches!(
            topology.load_topology().await,
            Err(ConfigurationError::Load { .. })
        ));
    }
}
