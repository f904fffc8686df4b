//! 配置模块
//!
//! 环境变量解析与拓扑加载

pub mod env;
pub mod topology;

pub use env::EnvConfig;
pub use topology::{
    environment_from_name, ConfigurationError, FileTopology, StaticTopology, TopologyProvider,
};
