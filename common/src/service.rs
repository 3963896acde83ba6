use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_signal() {
    use tokio::signal;

    // 监听 Ctrl+C 信号
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("无法安装Ctrl+C处理器: {}", e);
            std::future::pending::<()>().await;
        }
    };

    // 在Unix系统上监听 SIGTERM 信号
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("无法安装SIGTERM处理器: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // 在非Unix系统上创建一个永不返回的future
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    // 等待任一信号
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// 处理优雅关闭
///
/// 收到信号后通过广播通知所有后台任务和服务器停止
pub async fn shutdown_signal(tx: broadcast::Sender<()>) {
    wait_for_signal().await;

    info!("接收到关闭信号，准备优雅关闭...");

    // 发送关闭信号通知服务器关闭
    if tx.send(()).is_err() {
        warn!("无法发送关闭信号，接收端可能已关闭");
    }

    info!("服务关闭准备完成");
}
