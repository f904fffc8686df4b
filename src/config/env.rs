//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use self::constants::*;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// HTTP 监听地址
    pub bind: String,
    /// 部署日志目录
    pub data_dir: PathBuf,
    /// 拓扑文件
    pub topology_path: PathBuf,
    /// 主机未指定 credential 时使用的 SSH 私钥
    pub ssh_key: PathBuf,
    /// known_hosts 文件（为空时不校验主机密钥）
    pub known_hosts: Option<PathBuf>,
    /// 协调存储地址（为空时使用进程内存储，仅适合单实例）
    pub redis_url: Option<String>,
    /// 未携带身份头时的请求者
    pub default_user: String,
    /// 全局部署确认开关
    pub confirm_deploy: bool,
    /// 部署锁租期
    pub lock_ttl: Duration,
    /// 单主机执行超时
    pub host_timeout: Duration,
    /// 手动锁租期
    pub manual_lock_ttl: Duration,
    /// 本实例标识
    pub node: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
            bind: DEFAULT_BIND.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            topology_path: PathBuf::from(DEFAULT_TOPOLOGY),
            ssh_key: PathBuf::from(DEFAULT_SSH_KEY),
            known_hosts: None,
            redis_url: None,
            default_user: DEFAULT_USER.to_string(),
            confirm_deploy: true,
            lock_ttl: Duration::from_secs(LOCK_TTL_SECS),
            host_timeout: Duration::from_secs(HOST_TIMEOUT_SECS),
            manual_lock_ttl: Duration::from_secs(MANUAL_LOCK_TTL_SECS),
            node: node_name(),
        }
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("SHIPDECK_API_KEY", "API_KEY").unwrap_or(defaults.api_key);
        if api_key == DEFAULT_API_KEY {
            warn!("SHIPDECK_API_KEY is not set, using the built-in default key");
        }

        let bind = env::var("SHIPDECK_BIND").unwrap_or(defaults.bind);
        let data_dir = env::var("SHIPDECK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let topology_path = env::var("SHIPDECK_TOPOLOGY")
            .map(PathBuf::from)
            .unwrap_or(defaults.topology_path);
        let ssh_key = env::var("SHIPDECK_SSH_KEY")
            .map(PathBuf::from)
            .unwrap_or(defaults.ssh_key);
        let known_hosts = non_empty("SHIPDECK_KNOWN_HOSTS").map(PathBuf::from);
        let redis_url = non_empty("SHIPDECK_REDIS_URL");

        let default_user = non_empty("SHIPDECK_DEFAULT_USER").unwrap_or(defaults.default_user);
        let confirm_deploy = env::var("SHIPDECK_CONFIRM_DEPLOY")
            .ok()
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.confirm_deploy);

        let lock_ttl = load_secs("SHIPDECK_LOCK_TTL_SECS").unwrap_or(defaults.lock_ttl);
        let host_timeout = load_secs("SHIPDECK_HOST_TIMEOUT_SECS").unwrap_or(defaults.host_timeout);
        let manual_lock_ttl =
            load_secs("SHIPDECK_MANUAL_LOCK_TTL_SECS").unwrap_or(defaults.manual_lock_ttl);

        let node = non_empty("SHIPDECK_NODE").unwrap_or(defaults.node);

        Self {
            api_key,
            bind,
            data_dir,
            topology_path,
            ssh_key,
            known_hosts,
            redis_url,
            default_user,
            confirm_deploy,
            lock_ttl,
            host_timeout,
            manual_lock_ttl,
            node,
        }
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn load_secs(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!(key = key, value = %raw, "Ignoring invalid duration");
            None
        }
    }
}

/// 实例标识，默认使用主机名
fn node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// 常量
pub mod constants {
    /// 未配置时的 API 密钥
    pub const DEFAULT_API_KEY: &str = "change-me-in-production";

    pub const DEFAULT_BIND: &str = "localhost:8000";
    pub const DEFAULT_DATA_DIR: &str = "data";
    pub const DEFAULT_TOPOLOGY: &str = "topology.toml";
    pub const DEFAULT_SSH_KEY: &str = "id_rsa";
    pub const DEFAULT_USER: &str = "genericUser";

    /// 部署锁租期（秒），由心跳续期
    pub const LOCK_TTL_SECS: u64 = 90;

    /// 单主机执行超时（秒）
    pub const HOST_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 手动锁租期（秒）
    pub const MANUAL_LOCK_TTL_SECS: u64 = 24 * 3600;

    /// SSH 连接超时（秒）
    pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 15;

    /// Redis 连接池大小
    pub const REDIS_POOL_SIZE: usize = 16;

    /// Redis key 前缀
    pub const REDIS_NAMESPACE: &str = "shipdeck";

    /// Hub 清理间隔（秒）
    pub const HUB_CLEANUP_INTERVAL_SECS: u64 = 300;

    /// 历史列表默认条数
    pub const HISTORY_LIMIT: usize = 50;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_with_fallback() {
        env::set_var("SHIPDECK_TEST_PRIMARY", "primary_value");
        env::set_var("SHIPDECK_TEST_FALLBACK", "fallback_value");

        assert_eq!(
            load_with_fallback("SHIPDECK_TEST_PRIMARY", "SHIPDECK_TEST_FALLBACK"),
            Some("primary_value".to_string())
        );

        env::remove_var("SHIPDECK_TEST_PRIMARY");
        assert_eq!(
            load_with_fallback("SHIPDECK_TEST_PRIMARY", "SHIPDECK_TEST_FALLBACK"),
            Some("fallback_value".to_string())
        );

        env::remove_var("SHIPDECK_TEST_FALLBACK");
        assert_eq!(
            load_with_fallback("SHIPDECK_TEST_PRIMARY", "SHIPDECK_TEST_FALLBACK"),
            None
        );
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("yes"));
    }

    #[test]
    fn test_load_secs_rejects_garbage() {
        env::set_var("SHIPDECK_TEST_SECS", "abc");
        assert_eq!(load_secs("SHIPDECK_TEST_SECS"), None);
        env::set_var("SHIPDECK_TEST_SECS", "0");
        assert_eq!(load_secs("SHIPDECK_TEST_SECS"), None);
        env::set_var("SHIPDECK_TEST_SECS", "42");
        assert_eq!(load_secs("SHIPDECK_TEST_SECS"), Some(Duration::from_secs(42)));
        env::remove_var("SHIPDECK_TEST_SECS");
    }

    #[test]
    fn test_defaults() {
        let config = EnvConfig::default();
        assert_eq!(config.bind, "localhost:8000");
        assert_eq!(config.default_user, "genericUser");
        assert!(config.confirm_deploy);
        assert_eq!(config.lock_ttl, Duration::from_secs(LOCK_TTL_SECS));
    }
}
