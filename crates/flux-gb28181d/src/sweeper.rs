// 流会话过期扫描任务

use crate::stream::StreamRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// 启动周期扫描，收到关闭信号后退出
pub fn spawn(
    registry: Arc<StreamRegistry>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let registry = registry.clone();
                    // 单次扫描 panic 不影响后续扫描
                    match tokio::spawn(async move { registry.sweep().await }).await {
                        Ok(closed) => {
                            tracing::debug!(target: "gb28181d", closed, "stream sweep finished");
                        }
                        Err(e) => {
                            tracing::error!(target: "gb28181d", error = %e, "stream sweep failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!(target: "gb28181d", "stream sweeper stopped");
                    break;
                }
            }
        }
    })
}
