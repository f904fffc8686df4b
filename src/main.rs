//! Shipdeck - 多项目部署面板
//!
//! Usage:
//! - `shipdeck` 使用环境变量配置
//! - `shipdeck --bind 0.0.0.0:8000 --topology deploy.toml --data-dir /var/lib/shipdeck`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shipdeck::config::EnvConfig;
use shipdeck::state::{trigger_shutdown, AppState};

/// 关闭时等待运行中部署封存的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// 命令行参数，优先级高于环境变量
#[derive(Debug, Parser)]
#[command(name = "shipdeck", version, about = "Multi-project deployment dashboard")]
struct Cli {
    /// HTTP 监听地址
    #[arg(long, env = "SHIPDECK_BIND")]
    bind: Option<String>,

    /// 拓扑文件 (TOML)
    #[arg(long, env = "SHIPDECK_TOPOLOGY")]
    topology: Option<PathBuf>,

    /// 部署日志目录
    #[arg(long, env = "SHIPDECK_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shipdeck=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = EnvConfig::from_env();
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(topology) = cli.topology {
        config.topology_path = topology;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    let bind = config.bind.clone();
    let state = Arc::new(
        AppState::from_config(config)
            .await
            .context("failed to connect to coordination store")?,
    );

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            trigger_shutdown();
        }
    });

    shipdeck::serve(state.clone(), listener).await?;

    // 运行中的部署已随 shutdown token 取消，等待它们封存并释放锁
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    loop {
        let running = state.deployer.running().await.len();
        if running == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(running = running, "Shutting down with unsealed deployments");
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("Shipdeck stopped");
    Ok(())
}
