// SIP 信令分发器
// 传输 -> 解析 -> 分发 三级流水线；请求按方法路由到处理器，响应按事务键投递

use crate::auth::generate_branch;
use crate::error::Result;
use crate::header::ViaHop;
use crate::message::{Message, Method, Request, Response, SipHeaders};
use crate::parser::Parser;
use crate::transaction::{transaction_key, Transaction, TransactionTable};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};

/// SIP 服务器配置
#[derive(Debug, Clone)]
pub struct SipServerConfig {
    /// 监听地址
    pub bind_addr: String,

    /// 出站请求 Via 中使用的主机名（默认取本地地址）
    pub advertised_host: Option<String>,

    /// 解析队列与分发队列容量
    pub queue_capacity: usize,

    /// 事务保留时间
    pub transaction_ttl: Duration,

    /// 并发处理器上限（None = 不限）
    pub max_concurrent_handlers: Option<usize>,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_string(),
            advertised_host: None,
            queue_capacity: 1024,
            transaction_ttl: Duration::from_secs(32),
            max_concurrent_handlers: None,
        }
    }
}

/// 方法处理器：每个入站请求在独立任务中调用一次
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: Request, tx: Arc<Transaction>);
}

/// 出站请求句柄（可克隆，供处理器发起 MESSAGE 查询）
#[derive(Clone)]
pub struct SipClient {
    transport: Transport,
    transactions: Arc<TransactionTable>,
    host: String,
    port: u16,
}

impl SipClient {
    /// 发送请求并创建客户端事务
    ///
    /// 顶层 Via 改写为本机地址，缺少 branch 时补充，并带上空 rport
    pub async fn request(&self, mut req: Request, dest: SocketAddr) -> Result<Arc<Transaction>> {
        let mut via = req
            .via_hop()
            .unwrap_or_else(|| ViaHop::new("UDP", &self.host, Some(self.port)));
        via.host = self.host.clone();
        via.port = Some(self.port);
        if via.branch().is_none() {
            via.params.set("branch", Some(generate_branch()));
        }
        via.params.set("rport", None);
        req.headers.set("Via", via.to_string());

        let key = transaction_key(&req)?;
        let tx = self.transactions.new_tx(&key).await;
        if let Err(e) = tx.send_request(&req, dest).await {
            self.transactions.remove(&key).await;
            return Err(e);
        }

        tracing::debug!(
            target: "gb28181::sip",
            method = %req.method,
            remote = %dest,
            %key,
            "request sent",
        );
        Ok(tx)
    }

    /// 等待响应后移除事务（超时也移除）
    pub async fn request_and_wait(
        &self,
        req: Request,
        dest: SocketAddr,
        timeout: Duration,
    ) -> Result<Response> {
        let tx = self.request(req, dest).await?;
        let result = tx.wait_response(timeout).await;
        self.transactions.remove(tx.key()).await;
        result
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// GB28181 SIP 服务器
pub struct SipServer {
    config: SipServerConfig,
    transport: Transport,
    transactions: Arc<TransactionTable>,
    handlers: RwLock<HashMap<Method, Arc<dyn RequestHandler>>>,
    limiter: Option<Arc<Semaphore>>,
    local_addr: SocketAddr,
}

impl SipServer {
    /// 绑定 UDP 端口；绑定失败直接返回错误
    pub async fn bind(config: SipServerConfig) -> Result<Arc<Self>> {
        let transport = Transport::bind(&config.bind_addr).await?;
        let local_addr = transport.local_addr()?;

        tracing::info!(target: "gb28181::sip", %local_addr, "GB28181 SIP server listening");

        let limiter = config
            .max_concurrent_handlers
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Ok(Arc::new(Self {
            transactions: Arc::new(TransactionTable::new(transport.clone())),
            transport,
            handlers: RwLock::new(HashMap::new()),
            limiter,
            local_addr,
            config,
        }))
    }

    pub async fn register_handler(&self, method: Method, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().await.insert(method, handler);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    pub fn client(&self) -> SipClient {
        let host = self
            .config
            .advertised_host
            .clone()
            .unwrap_or_else(|| self.local_addr.ip().to_string());
        SipClient {
            transport: self.transport.clone(),
            transactions: self.transactions.clone(),
            host,
            port: self.local_addr.port(),
        }
    }

    pub async fn request(&self, req: Request, dest: SocketAddr) -> Result<Arc<Transaction>> {
        self.client().request(req, dest).await
    }

    /// 运行流水线，直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let capacity = self.config.queue_capacity.max(1);
        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(capacity);

        let parser = Parser::start(capacity, msg_tx);
        let recv_task = tokio::spawn(self.transport.clone().run(parser.sender()));
        let janitor = tokio::spawn(Self::janitor(
            self.transactions.clone(),
            self.config.transaction_ttl,
        ));

        tracing::info!(target: "gb28181::sip", "GB28181 SIP server started");

        loop {
            tokio::select! {
                msg = msg_rx.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    tracing::info!(target: "gb28181::sip", "shutdown signal received");
                    break;
                }
            }
        }

        recv_task.abort();
        janitor.abort();
        drop(msg_rx);
        parser.stop().await;

        tracing::info!(target: "gb28181::sip", "GB28181 SIP server stopped");
        Ok(())
    }

    /// 定期清理事务表（周期为 TTL 的一半）
    async fn janitor(transactions: Arc<TransactionTable>, ttl: Duration) {
        let period = (ttl / 2).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            transactions.evict(ttl).await;
        }
    }

    async fn dispatch(&self, msg: Message) {
        match msg {
            Message::Request(req) => self.handle_request(req).await,
            Message::Response(resp) => self.handle_response(resp).await,
        }
    }

    async fn handle_request(&self, req: Request) {
        let key = match transaction_key(&req) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(target: "gb28181::sip", error = %e, "request without transaction key dropped");
                return;
            }
        };

        // 已完成的交换再次出现同键请求时视为新事务
        let mut tx = self.transactions.must_tx(&key).await;
        if tx.is_terminated() {
            tx = self.transactions.new_tx(&key).await;
        }

        let handler = self.handlers.read().await.get(&req.method).cloned();
        let Some(handler) = handler else {
            tracing::debug!(
                target: "gb28181::sip",
                method = %req.method,
                "no handler registered, answering 405",
            );
            let resp = Response::from_request(&req, 405);
            if let Err(e) = tx.respond(resp).await {
                tracing::warn!(target: "gb28181::sip", error = %e, "failed to send 405");
            }
            return;
        };

        let permit = match &self.limiter {
            Some(limiter) => match limiter.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        tokio::spawn(async move {
            let _permit = permit;
            handler.handle(req, tx).await;
        });
    }

    async fn handle_response(&self, resp: Response) {
        let key = match transaction_key(&resp) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(target: "gb28181::sip", error = %e, "response without transaction key dropped");
                return;
            }
        };

        match self.transactions.get_tx(&key).await {
            Some(tx) => {
                let is_final = !resp.is_provisional();
                tx.receive_response(resp);
                if is_final {
                    self.transactions.remove(&key).await;
                }
            }
            None => {
                tracing::debug!(
                    target: "gb28181::sip",
                    %key,
                    status = resp.status_code,
                    "response for unknown transaction dropped",
                );
            }
        }
    }
}
