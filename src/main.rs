// ====================================================================================
// src/main.rs - 应用入口
// ====================================================================================
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod bracket;
mod clock;
mod config;
mod db;
mod error;
mod handler;
mod heartbeat;
mod hub;
mod models;
mod routes;
mod state;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志记录
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "scorekeeper=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env()?;

    // 连接数据库并运行迁移
    tracing::info!("正在连接数据库: {}", config.database_url);
    let pool = db::connect(&config.database_url).await?;

    tracing::info!("数据库连接成功，正在运行迁移...");
    db::migrate(&pool).await?;
    tracing::info!("数据库迁移完成");

    let addr: SocketAddr = config.bind_address.parse()?;

    // 创建共享的应用状态
    let app_state = Arc::new(AppState::new(pool, config));
    let app = routes::build_router(app_state);

    // 启动服务器
    tracing::info!("服务器正在监听于 {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
