// GB28181 SIP 方法处理器
// REGISTER：Digest 鉴权 / 注册 / 注销
// MESSAGE：心跳、目录、设备信息、录像信息

use crate::catalog::CatalogSync;
use crate::error::{GatewayError, Result};
use crate::manscdp::{
    self, CatalogResponse, CmdType, CommandEnvelope, DeviceInfoResponse, RecordInfoResponse,
};
use crate::model::NvrDevice;
use crate::registry::{device_from_request, AuthOutcome, DeviceRegistry};
use async_trait::async_trait;
use flux_sip::auth::{challenge_header, generate_call_id, generate_tag};
use flux_sip::{
    Method, NameAddr, Request, RequestHandler, Response, SipClient, SipUri, Transaction,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// 未携带 Expires 时回复的默认有效期
const DEFAULT_EXPIRES: u32 = 3600;

async fn reply(tx: &Transaction, req: &Request, status: u16) {
    send(tx, Response::from_request(req, status)).await;
}

async fn send(tx: &Transaction, resp: Response) {
    let status = resp.status_code;
    if let Err(e) = tx.respond(resp).await {
        tracing::warn!(target: "gb28181::sip", status, error = %e, "failed to send response");
    }
}

/// 平台发往设备的 MANSCDP 查询
#[derive(Clone)]
pub struct QueryClient {
    client: SipClient,
    server_id: String,
    domain: String,
    timeout: Duration,
}

impl QueryClient {
    pub fn new(client: SipClient, server_id: &str, domain: &str, timeout: Duration) -> Self {
        Self {
            client,
            server_id: server_id.to_string(),
            domain: domain.to_string(),
            timeout,
        }
    }

    fn build_message(&self, device: &NvrDevice, body: String) -> Request {
        let mut req = Request::new(Method::Message, device.uri.clone())
            .with_body(manscdp::CONTENT_TYPE, body);

        let from = NameAddr::new(SipUri::new(Some(&self.server_id), &self.domain, None))
            .with_tag(&generate_tag());
        let to = match &device.address {
            Some(addr) => NameAddr::new(addr.uri.clone()),
            None => NameAddr::new(SipUri::new(Some(&device.device_id), &device.region, None)),
        };

        req.headers.set("From", from.to_string());
        req.headers.set("To", to.to_string());
        req.headers.set("Call-ID", generate_call_id());
        req.headers.set("CSeq", "1 MESSAGE");
        req.headers.set("Max-Forwards", "70");
        req
    }

    /// 发送查询并等待设备确认
    pub async fn query(&self, device: &NvrDevice, body: String) -> Result<Response> {
        let dest = device.source.ok_or_else(|| {
            GatewayError::NotRegistered(format!("{} has no source address", device.device_id))
        })?;
        let req = self.build_message(device, body);
        let resp = self.client.request_and_wait(req, dest, self.timeout).await?;
        Ok(resp)
    }

    fn spawn_query(&self, device: NvrDevice, cmd: &'static str, body: String) {
        let client = self.clone();
        let span = tracing::info_span!("gb28181.sip.query", cmd, device_id = %device.device_id);
        tokio::spawn(
            async move {
                match client.query(&device, body).await {
                    Ok(resp) if resp.is_success() => {
                        tracing::debug!(target: "gb28181::sip", "query acknowledged");
                    }
                    Ok(resp) => {
                        tracing::warn!(target: "gb28181::sip", status = resp.status_code, "query rejected");
                    }
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", error = %e, "query failed");
                    }
                }
            }
            .instrument(span),
        );
    }

    /// 注册成功后查询设备信息
    pub fn spawn_device_info(&self, device: NvrDevice) {
        let body = manscdp::device_info_query(manscdp::next_sn(), &device.device_id);
        self.spawn_query(device, "DeviceInfo", body);
    }

    /// 心跳后同步目录
    pub fn spawn_catalog(&self, device: NvrDevice) {
        let body = manscdp::catalog_query(manscdp::next_sn(), &device.device_id);
        self.spawn_query(device, "Catalog", body);
    }
}

/// REGISTER 处理器
pub struct RegisterHandler {
    registry: Arc<DeviceRegistry>,
    queries: QueryClient,
}

impl RegisterHandler {
    pub fn new(registry: Arc<DeviceRegistry>, queries: QueryClient) -> Self {
        Self { registry, queries }
    }

    async fn handle_register(&self, req: Request, tx: Arc<Transaction>) {
        match self.registry.authenticate(&req).await {
            AuthOutcome::Challenge => {
                let (realm, nonce) = self.registry.challenge();
                let mut resp = Response::from_request(&req, 401);
                resp.headers.add("WWW-Authenticate", challenge_header(&realm, &nonce));
                send(&tx, resp).await;
                tracing::debug!(target: "gb28181::sip", "REGISTER challenged");
            }
            AuthOutcome::Authorized(device) => {
                let expires = req
                    .headers
                    .get("Expires")
                    .and_then(|v| v.trim().parse::<u32>().ok());

                let mut resp = Response::from_request(&req, 200);
                resp.headers.add("Expires", expires.unwrap_or(DEFAULT_EXPIRES).to_string());
                resp.headers.add(
                    "Date",
                    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                );

                if expires == Some(0) {
                    self.registry.unregister(&device.device_id);
                    send(&tx, resp).await;
                    return;
                }

                send(&tx, resp).await;
                tracing::info!(target: "gb28181::sip", device_id = %device.device_id, "REGISTER accepted");
                self.queries.spawn_device_info(device);
            }
            AuthOutcome::Ignore => {
                tracing::debug!(target: "gb28181::sip", "REGISTER ignored");
            }
        }
    }
}

#[async_trait]
impl RequestHandler for RegisterHandler {
    async fn handle(&self, req: Request, tx: Arc<Transaction>) {
        let span = tracing::info_span!(
            "gb28181.sip.register",
            remote = ?req.source,
        );
        self.handle_register(req, tx).instrument(span).await;
    }
}

/// MESSAGE 处理器
pub struct MessageHandler {
    registry: Arc<DeviceRegistry>,
    catalog: Arc<CatalogSync>,
    queries: QueryClient,
}

impl MessageHandler {
    pub fn new(registry: Arc<DeviceRegistry>, catalog: Arc<CatalogSync>, queries: QueryClient) -> Self {
        Self {
            registry,
            catalog,
            queries,
        }
    }

    async fn handle_message(&self, req: Request, tx: Arc<Transaction>) {
        let Some(device) = device_from_request(&req) else {
            reply(&tx, &req, 400).await;
            return;
        };

        if req.body.is_empty() {
            reply(&tx, &req, 200).await;
            return;
        }

        let body = req.body_text();
        let envelope: CommandEnvelope = match manscdp::decode(&body) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", device_id = %device.device_id, error = %e, "MANSCDP decode failed");
                reply(&tx, &req, 400).await;
                return;
            }
        };

        match envelope.kind() {
            CmdType::Catalog => {
                self.on_catalog(&body).await;
                reply(&tx, &req, 200).await;
            }
            CmdType::Keepalive => match self.registry.keepalive(&device).await {
                Ok(()) => {
                    reply(&tx, &req, 200).await;
                    self.queries.spawn_catalog(device);
                }
                Err(e) => {
                    tracing::warn!(target: "gb28181::sip", device_id = %device.device_id, error = %e, "keepalive rejected");
                    reply(&tx, &req, 400).await;
                }
            },
            CmdType::RecordInfo => {
                self.on_record_info(&body);
                reply(&tx, &req, 200).await;
            }
            CmdType::DeviceInfo => {
                self.on_device_info(&device, &body).await;
                reply(&tx, &req, 200).await;
            }
            CmdType::Unknown(cmd) => {
                tracing::debug!(target: "gb28181::sip", %cmd, "unsupported CmdType");
                reply(&tx, &req, 400).await;
            }
        }
    }

    async fn on_catalog(&self, body: &str) {
        let catalog: CatalogResponse = match manscdp::decode(body) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", error = %e, "catalog decode failed");
                return;
            }
        };
        if catalog.sum_num == 0 {
            return;
        }
        if let Err(e) = self.catalog.sync(&catalog.device_id, catalog.items()).await {
            tracing::error!(target: "gb28181::sip", device_id = %catalog.device_id, error = %e, "catalog sync failed");
        }
    }

    fn on_record_info(&self, body: &str) {
        match manscdp::decode::<RecordInfoResponse>(body) {
            Ok(record) => {
                tracing::info!(
                    target: "gb28181::sip",
                    device_id = %record.device_id,
                    sum_num = record.sum_num,
                    items = record.items().len(),
                    "record info received",
                );
            }
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", error = %e, "record info decode failed");
            }
        }
    }

    async fn on_device_info(&self, device: &NvrDevice, body: &str) {
        let info: DeviceInfoResponse = match manscdp::decode(body) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", error = %e, "device info decode failed");
                return;
            }
        };
        if let Err(e) = self
            .registry
            .update_device_info(&device.device_id, &info.metadata())
            .await
        {
            tracing::warn!(target: "gb28181::sip", device_id = %device.device_id, error = %e, "device info update failed");
        }
    }
}

#[async_trait]
impl RequestHandler for MessageHandler {
    async fn handle(&self, req: Request, tx: Arc<Transaction>) {
        let span = tracing::info_span!(
            "gb28181.sip.message",
            remote = ?req.source,
        );
        self.handle_message(req, tx).instrument(span).await;
    }
}
