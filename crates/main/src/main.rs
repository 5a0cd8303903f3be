//! 主应用程序入口
//!
//! 加载配置，装配实时子系统，启动 Axum 服务。

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use application::{Clock, SystemClock};
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router_with_cors, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    tracing::info!(config = %config.sanitize(), "configuration loaded");

    let infrastructure = Infrastructure::connect(&config)
        .await
        .context("failed to initialise storage")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::build(&config, infrastructure, clock);

    let shutdown = CancellationToken::new();
    let sweeper = state.limiter.spawn_sweeper(
        config.rate_limit.sweep_interval(),
        config.rate_limit.bucket_ttl(),
        shutdown.clone(),
    );

    let app = router_with_cors(state, &config.server.cors_origins);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("聊天服务启动在 http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    tracing::info!("服务已停止");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }
    tracing::info!("收到退出信号，开始优雅关闭");
    shutdown.cancel();
}
