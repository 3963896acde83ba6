use anyhow::Context;
use api_gateway::health::HealthMonitor;
use api_gateway::metrics::init_metrics;
use api_gateway::{build_router, AppState};
use axum_server::Handle;
use common::config::ConfigLoader;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 优雅关闭时等待在途请求的最长时间
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置，非法配置直接终止启动
    let config = ConfigLoader::init_global().context("加载网关配置失败")?;

    common::logging::init_from_config(&config)?;
    info!("正在启动API网关服务...");

    let prometheus = init_metrics();

    // 计数存储，连接失败时限流降级为放行
    let cache = cache::cache(&config.redis)?;
    if let Err(e) = cache.ping().await {
        warn!("计数存储暂不可用，将在后台重连: {}", e);
    }

    let state = AppState::new(config.clone(), cache.clone())?.with_prometheus(prometheus);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 后台健康巡检
    let monitor = HealthMonitor::new(
        state.routes.clone(),
        state.health.clone(),
        state.breakers.clone(),
        cache,
        &config.gateway.health,
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_tx.subscribe()));

    let app = build_router(state);

    let addr: SocketAddr = config
        .server
        .server_url()
        .parse()
        .with_context(|| format!("非法的监听地址: {}", config.server.server_url()))?;
    info!("API网关服务监听: http://{}", addr);

    let handle = Handle::new();

    // 收到信号后停止接收新连接并等待在途请求
    let shutdown_handle = handle.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        shutdown_handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
    });
    tokio::spawn(common::service::shutdown_signal(shutdown_tx.clone()));

    if let Err(err) = axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
    {
        error!("服务器错误: {}", err);
    }

    // 服务器异常退出时也要停止巡检任务
    let _ = shutdown_tx.send(());
    let _ = monitor_task.await;

    info!("API网关服务已关闭");
    Ok(())
}
