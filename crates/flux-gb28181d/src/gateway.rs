// 网关装配：按配置构建 SIP 服务器、设备注册表、流会话注册表并注册处理器

use crate::api::{self, AppState};
use crate::catalog::CatalogSync;
use crate::error::Result;
use crate::handler::{MessageHandler, QueryClient, RegisterHandler};
use crate::registry::DeviceRegistry;
use crate::store::Store;
use crate::stream::{HttpRelay, MediaRelay, NullRelay, StreamRegistry};
use crate::sweeper;
use flux_config::GatewayConfig;
use flux_sip::{Method, SipServer, SipServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct Gateway {
    pub config: GatewayConfig,
    pub sip: Arc<SipServer>,
    pub registry: Arc<DeviceRegistry>,
    pub streams: Arc<StreamRegistry>,
}

impl Gateway {
    /// 绑定 SIP 端口并注册 REGISTER / MESSAGE 处理器
    pub async fn build(config: GatewayConfig, store: Arc<dyn Store>) -> Result<Self> {
        let sip_config = SipServerConfig {
            bind_addr: config.sip.bind_addr.clone(),
            advertised_host: config.sip.advertised_host.clone(),
            queue_capacity: config.sip.queue_capacity,
            transaction_ttl: Duration::from_secs(config.sip.transaction_ttl_secs),
            max_concurrent_handlers: config.sip.max_concurrent_handlers,
        };
        let sip = SipServer::bind(sip_config).await?;

        let registry = Arc::new(DeviceRegistry::new(
            store.clone(),
            config.sip.realm.clone(),
            config.sip.default_password.clone(),
        ));
        let catalog = Arc::new(CatalogSync::new(store, config.sip.domain.clone()));
        let queries = QueryClient::new(
            sip.client(),
            &config.sip.server_id,
            &config.sip.domain,
            Duration::from_secs(config.sip.response_timeout_secs),
        );

        sip.register_handler(
            Method::Register,
            Arc::new(RegisterHandler::new(registry.clone(), queries.clone())),
        )
        .await;
        sip.register_handler(
            Method::Message,
            Arc::new(MessageHandler::new(registry.clone(), catalog, queries)),
        )
        .await;

        let relay: Arc<dyn MediaRelay> = match &config.media.relay_endpoint {
            Some(endpoint) => Arc::new(HttpRelay::new(endpoint.clone(), config.media.timeout_ms)),
            None => Arc::new(NullRelay),
        };
        let streams = Arc::new(StreamRegistry::new(
            relay,
            Duration::from_secs(config.streams.idle_timeout_secs),
        ));

        tracing::info!(
            target: "gb28181d",
            sip_addr = %sip.local_addr(),
            server_id = %config.sip.server_id,
            domain = %config.sip.domain,
            relay = config.media.relay_endpoint.as_deref().unwrap_or("none"),
            "gateway initialized",
        );

        Ok(Self {
            config,
            sip,
            registry,
            streams,
        })
    }

    /// 启动 SIP 服务与过期扫描任务
    pub fn spawn(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let sip = self.sip.clone();
        let sip_shutdown = shutdown.subscribe();
        let sip_task = tokio::spawn(async move {
            if let Err(e) = sip.run(sip_shutdown).await {
                tracing::error!(target: "gb28181d", error = %e, "SIP server stopped with error");
            }
        });

        let sweep_task = sweeper::spawn(
            self.streams.clone(),
            Duration::from_secs(self.config.streams.sweep_interval_secs),
            shutdown.subscribe(),
        );

        vec![sip_task, sweep_task]
    }

    pub fn router(&self) -> axum::Router {
        api::create_router(AppState {
            streams: self.streams.clone(),
        })
    }
}
