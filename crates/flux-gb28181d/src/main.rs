use anyhow::Context;
use clap::Parser;
use flux_config::ConfigLoader;
use flux_gb28181d::{Gateway, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置目录（读取其中的 gateway.toml）
    #[arg(long, default_value = "./config")]
    config_dir: String,

    /// 覆盖 sip.bind_addr
    #[arg(long)]
    sip_bind: Option<String>,

    /// 覆盖 http.bind_addr
    #[arg(long)]
    http_bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = ConfigLoader::new(&args.config_dir)
        .validate()
        .with_context(|| format!("failed to load config from {}", args.config_dir))?;
    if let Some(addr) = args.sip_bind {
        config.sip.bind_addr = addr;
    }
    if let Some(addr) = args.http_bind {
        config.http.bind_addr = addr;
    }

    let http_addr: SocketAddr = config
        .http
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid http bind_addr {}: {}", config.http.bind_addr, e))?;

    tracing::info!(
        target: "gb28181d",
        name = %config.system.name,
        version = %config.system.version,
        "starting",
    );

    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::build(config, store).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let tasks = gateway.spawn(&shutdown_tx);

    let app = gateway.router();
    tracing::info!(target: "gb28181d", %http_addr, "http listening");

    let signal_tx = shutdown_tx.clone();
    let served = axum::Server::bind(&http_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(target: "gb28181d", error = %e, "failed to listen for Ctrl+C");
            }
            tracing::info!(target: "gb28181d", "shutdown signal received");
            let _ = signal_tx.send(());
        })
        .await;

    // HTTP 异常退出时也通知其它任务
    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(target: "gb28181d", error = %e, "task join failed");
        }
    }

    served?;
    tracing::info!(target: "gb28181d", "stopped");
    Ok(())
}
