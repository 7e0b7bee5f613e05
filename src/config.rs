// ====================================================================================
// src/config.rs - 配置管理
// ====================================================================================
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub max_connections: u32,

    // 控制端心跳超时
    pub heartbeat_timeout_seconds: u64,

    // 每个观众连接的发送队列容量
    pub viewer_queue_capacity: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("{name} must be a valid number, got {value:?}")]
pub struct ConfigError {
    name: &'static str,
    value: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // 尝试加载 .env 文件，如果失败则忽略（可能文件不存在）
        if let Err(e) = dotenvy::dotenv() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            max_connections: numeric_var("MAX_CONNECTIONS", 100_000)?,
            heartbeat_timeout_seconds: numeric_var("HEARTBEAT_TIMEOUT_SECONDS", 10)?,
            viewer_queue_capacity: numeric_var("VIEWER_QUEUE_CAPACITY", 32)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            bind_address: "0.0.0.0:3000".to_string(),
            max_connections: 100_000,
            heartbeat_timeout_seconds: 10,
            viewer_queue_capacity: 32,
        }
    }
}

fn numeric_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError { name, value }),
        Err(_) => Ok(default),
    }
}
