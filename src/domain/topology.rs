//! 拓扑领域模型
//!
//! Project → Environment → Host，由外部配置提供，核心只读

use serde::{Deserialize, Serialize};

/// 默认 revision 格式（git commit hash）
pub const DEFAULT_REVISION_FORMAT: &str = "^[0-9a-fA-F]{6,40}$";

/// 默认 SSH 端口
pub const DEFAULT_SSH_PORT: u16 = 22;

/// 项目
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// 源码仓库引用 (e.g. "owner/repo")
    pub repo: String,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

impl Project {
    /// 按名称查找环境
    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// 检查命名合法且环境名在项目内唯一
    ///
    /// 日志目录 `project-environment` 按最后一个 `-` 拆分，环境名不能含 `-`；
    /// 锁键与 URL 以 `/` 分隔，两者都不能含 `/`
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(format!("invalid project name '{}'", self.name));
        }
        let mut seen = std::collections::HashSet::new();
        for env in &self.environments {
            if env.name.is_empty() || env.name.contains(['-', '/']) {
                return Err(format!(
                    "invalid environment name '{}' in project '{}': must be non-empty without '-' or '/'",
                    env.name, self.name
                ));
            }
            if !seen.insert(env.name.as_str()) {
                return Err(format!(
                    "duplicate environment '{}' in project '{}'",
                    env.name, self.name
                ));
            }
        }
        Ok(())
    }
}

/// 部署环境
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<Host>,
    pub procedure: DeployProcedure,
    /// 部署前需要显式确认
    #[serde(default)]
    pub confirm_before_deploy: bool,
    /// 环境备注（展示用）
    #[serde(default)]
    pub comment: Option<String>,
}

/// 部署流程描述
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployProcedure {
    /// 命令模板，支持 {revision} {project} {environment} {host}
    pub command: String,
    /// 远端工作目录
    #[serde(default)]
    pub working_dir: Option<String>,
    /// revision 必须匹配的正则
    #[serde(default = "default_revision_format")]
    pub revision_format: String,
}

fn default_revision_format() -> String {
    DEFAULT_REVISION_FORMAT.to_string()
}

impl DeployProcedure {
    /// 渲染某台主机上要执行的命令
    pub fn render(&self, project: &str, environment: &str, host: &Host, revision: &str) -> String {
        let command = self
            .command
            .replace("{revision}", revision)
            .replace("{project}", project)
            .replace("{environment}", environment)
            .replace("{host}", &host.address);

        match self.working_dir.as_deref() {
            Some(dir) if !dir.is_empty() => format!("cd {} && {}", dir, command),
            _ => command,
        }
    }

    /// 校验 revision 格式
    pub fn accepts_revision(&self, revision: &str) -> Result<bool, regex::Error> {
        let re = regex::Regex::new(&self.revision_format)?;
        Ok(re.is_match(revision))
    }
}

/// 部署目标主机
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Host {
    /// 连接地址（主机名或 IP，"local" 表示本机执行）
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// 私钥文件路径，为空时使用全局默认私钥
    #[serde(default)]
    pub credential: Option<String>,
    /// 当前已部署的 revision（部署成功后更新）
    #[serde(default)]
    pub deployed_revision: Option<String>,
    /// 最新 commit / 分支指针，用于漂移展示
    #[serde(default)]
    pub latest_revision: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_ssh_user() -> String {
    "deploy".to_string()
}

impl Host {
    /// 本机执行（不经过 SSH）
    pub fn is_local(&self) -> bool {
        self.address == "local" || self.address == "localhost"
    }

    /// 已部署版本是否落后
    pub fn is_drifted(&self) -> bool {
        match (&self.deployed_revision, &self.latest_revision) {
            (Some(deployed), Some(latest)) => deployed != latest,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// 用户留下的环境备注
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentNote {
    pub text: String,
    pub author: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// 环境的锁/会话键：`project/environment`
pub fn lock_key(project: &str, environment: &str) -> String {
    format!("{}/{}", project, environment)
}

/// 部署日志使用的环境标识：`project-environment`
///
/// 环境名不含 `-`，按最后一个 `-` 可唯一还原
pub fn environment_slug(project: &str, environment: &str) -> String {
    format!("{}-{}", project, environment)
}

/// `environment_slug` 的逆操作
pub fn split_environment_slug(slug: &str) -> Option<(&str, &str)> {
    slug.rsplit_once('-')
        .filter(|(project, environment)| !project.is_empty() && !environment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(address: &str) -> Host {
        Host {
            address: address.to_string(),
            port: 22,
            user: "deploy".to_string(),
            credential: None,
            deployed_revision: None,
            latest_revision: None,
        }
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let procedure = DeployProcedure {
            command: "./deploy.sh {project} {environment} {revision} {host}".to_string(),
            working_dir: Some("/srv/app".to_string()),
            revision_format: default_revision_format(),
        };

        let cmd = procedure.render("shop", "staging", &host("h1"), "abc1234");
        assert_eq!(cmd, "cd /srv/app && ./deploy.sh shop staging abc1234 h1");
    }

    #[test]
    fn test_render_without_working_dir() {
        let procedure = DeployProcedure {
            command: "deploy {revision}".to_string(),
            working_dir: None,
            revision_format: default_revision_format(),
        };
        assert_eq!(procedure.render("p", "e", &host("h"), "abc1234"), "deploy abc1234");
    }

    #[test]
    fn test_revision_format() {
        let procedure = DeployProcedure {
            command: "true".to_string(),
            working_dir: None,
            revision_format: default_revision_format(),
        };
        assert!(procedure.accepts_revision("abc123f").unwrap());
        assert!(!procedure.accepts_revision("abc; rm -rf /").unwrap());
        assert!(!procedure.accepts_revision("abc").unwrap());
    }

    #[test]
    fn test_duplicate_environment_rejected() {
        let env = Environment {
            name: "staging".to_string(),
            hosts: vec![],
            procedure: DeployProcedure {
                command: "true".to_string(),
                working_dir: None,
                revision_format: default_revision_format(),
            },
            confirm_before_deploy: false,
            comment: None,
        };
        let project = Project {
            name: "shop".to_string(),
            repo: "acme/shop".to_string(),
            environments: vec![env.clone(), env],
        };
        assert!(project.validate().is_err());
    }

    #[test]
    fn test_environment_names_cannot_collide_in_slug() {
        let env = |name: &str| Environment {
            name: name.to_string(),
            hosts: vec![],
            procedure: DeployProcedure {
                command: "true".to_string(),
                working_dir: None,
                revision_format: default_revision_format(),
            },
            confirm_before_deploy: false,
            comment: None,
        };
        let project = |name: &str, env_name: &str| Project {
            name: name.to_string(),
            repo: "acme/shop".to_string(),
            environments: vec![env(env_name)],
        };

        // shop-eu/staging 与 shop/eu-staging 不能同时存在
        assert!(project("shop-eu", "staging").validate().is_ok());
        assert!(project("shop", "eu-staging").validate().is_err());
        assert!(project("shop", "eu/staging").validate().is_err());
        assert!(project("shop", "").validate().is_err());
        assert!(project("acme/shop", "staging").validate().is_err());

        let slug = environment_slug("shop-eu", "staging");
        assert_eq!(slug, "shop-eu-staging");
        assert_eq!(split_environment_slug(&slug), Some(("shop-eu", "staging")));
        assert_eq!(split_environment_slug("staging"), None);
    }

    #[test]
    fn test_drift() {
        let mut h = host("h1");
        assert!(!h.is_drifted());
        h.latest_revision = Some("b".to_string());
        assert!(h.is_drifted());
        h.deployed_revision = Some("b".to_string());
        assert!(!h.is_drifted());
    }
}
