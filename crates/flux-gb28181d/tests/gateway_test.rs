// 网关信令端到端测试：模拟设备经本地回环 UDP 完成注册、心跳、目录上报

use flux_config::{ConfigLoader, GatewayConfig};
use flux_gb28181d::{Gateway, MemoryStore, Store};
use flux_sip::auth::{compute_response, DigestParams};
use flux_sip::{Message, Request, Response, SipHeaders};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

const DEVICE_ID: &str = "34020000001110000001";
const SERVER_URI: &str = "sip:34020000002000000001@3402000000";
const PASSWORD: &str = "12345678";

struct Harness {
    store: Arc<MemoryStore>,
    gateway: Gateway,
    shutdown: broadcast::Sender<()>,
    device: UdpSocket,
}

impl Harness {
    async fn start(default_password: Option<&str>) -> Self {
        let mut config = GatewayConfig::default();
        config.sip.bind_addr = "127.0.0.1:0".to_string();
        config.sip.realm = Some("3402000000".to_string());
        config.sip.default_password = default_password.map(str::to_string);
        config.sip.response_timeout_secs = 2;
        Self::start_with(config).await
    }

    async fn start_with(config: GatewayConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::build(config, store.clone()).await.expect("build gateway");
        let (shutdown, _) = broadcast::channel(1);
        gateway.spawn(&shutdown);

        let device = UdpSocket::bind("127.0.0.1:0").await.expect("bind device");
        Self {
            store,
            gateway,
            shutdown,
            device,
        }
    }

    fn server_addr(&self) -> SocketAddr {
        self.gateway.sip.local_addr()
    }

    fn port(&self) -> u16 {
        self.device.local_addr().expect("addr").port()
    }

    async fn send(&self, raw: &str) {
        self.device
            .send_to(raw.as_bytes(), self.server_addr())
            .await
            .expect("send");
    }

    async fn recv(&self) -> Message {
        let mut buf = vec![0u8; 8192];
        let (len, from) =
            tokio::time::timeout(Duration::from_secs(2), self.device.recv_from(&mut buf))
                .await
                .expect("recv timeout")
                .expect("recv");
        Message::parse(&buf[..len], Some(from)).expect("parse")
    }

    async fn recv_response(&self) -> Response {
        match self.recv().await {
            Message::Response(resp) => resp,
            Message::Request(req) => panic!("expected response, got {}", req.method),
        }
    }

    async fn recv_request(&self) -> Request {
        match self.recv().await {
            Message::Request(req) => req,
            Message::Response(resp) => panic!("expected request, got {}", resp.status_code),
        }
    }

    /// 设备侧确认平台发来的请求
    async fn ack(&self, req: &Request) {
        let resp = Response::from_request(req, 200);
        self.device
            .send_to(&resp.to_bytes(), self.server_addr())
            .await
            .expect("send ack");
    }

    async fn register(&self) -> Response {
        self.register_with(PASSWORD).await
    }

    async fn register_with(&self, password: &str) -> Response {
        self.send(&build_register(self.port(), 1, None)).await;
        let challenge = self.recv_response().await;
        assert_eq!(challenge.status_code, 401);

        let header = challenge
            .headers
            .get("WWW-Authenticate")
            .expect("WWW-Authenticate");
        let params = DigestParams::parse(header).expect("digest params");
        let realm = params.realm().expect("realm").to_string();
        let nonce = params.nonce().expect("nonce").to_string();

        let response =
            compute_response(DEVICE_ID, &realm, password, "REGISTER", SERVER_URI, &nonce, None);
        let auth = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
            DEVICE_ID, realm, nonce, SERVER_URI, response
        );
        self.send(&build_register(self.port(), 2, Some(&auth))).await;
        self.recv_response().await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

fn build_register(port: u16, cseq: u32, authorization: Option<&str>) -> String {
    let mut raw = format!(
        "REGISTER {SERVER_URI} SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};rport;branch=z9hG4bKreg{cseq}\r\n\
From: <sip:{DEVICE_ID}@3402000000>;tag=dev1\r\n\
To: <sip:{DEVICE_ID}@3402000000>\r\n\
Call-ID: register-call\r\n\
CSeq: {cseq} REGISTER\r\n\
Contact: <sip:{DEVICE_ID}@127.0.0.1:{port}>\r\n\
Max-Forwards: 70\r\n\
Expires: 3600\r\n",
    );
    if let Some(auth) = authorization {
        raw.push_str(&format!("Authorization: {}\r\n", auth));
    }
    raw.push_str("Content-Length: 0\r\n\r\n");
    raw
}

fn build_message(port: u16, call_id: &str, body: &str) -> String {
    format!(
        "MESSAGE {SERVER_URI} SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};rport;branch=z9hG4bK{call_id}\r\n\
From: <sip:{DEVICE_ID}@3402000000>;tag=dev2\r\n\
To: <{SERVER_URI}>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 20 MESSAGE\r\n\
Max-Forwards: 70\r\n\
Content-Type: Application/MANSCDP+xml\r\n\
Content-Length: {}\r\n\
\r\n\
{body}",
        body.len(),
    )
}

fn keepalive_body() -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Notify>
<CmdType>Keepalive</CmdType>
<SN>7</SN>
<DeviceID>{DEVICE_ID}</DeviceID>
<Status>OK</Status>
</Notify>"#
    )
}

fn catalog_body() -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>Catalog</CmdType>
<SN>8</SN>
<DeviceID>{DEVICE_ID}</DeviceID>
<SumNum>2</SumNum>
<DeviceList Num="2">
<Item>
<DeviceID>34020000001320000001</DeviceID>
<Name>cam-1</Name>
<Status>ONLINE</Status>
</Item>
<Item>
<DeviceID>34020000001320000002</DeviceID>
<Name>cam-2</Name>
<Status>OFFILE</Status>
</Item>
</DeviceList>
</Response>"#
    )
}

fn device_info_body() -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>DeviceInfo</CmdType>
<SN>9</SN>
<DeviceID>{DEVICE_ID}</DeviceID>
<Result>OK</Result>
<Manufacturer>Hikvision</Manufacturer>
<Model>DS-7808N</Model>
<Firmware>V4.1.0</Firmware>
</Response>"#
    )
}

#[tokio::test]
async fn test_register_challenge_then_accept_and_query_device_info() {
    let h = Harness::start(Some(PASSWORD)).await;

    let ok = h.register().await;
    assert_eq!(ok.status_code, 200);
    assert_eq!(ok.headers.get("Expires"), Some("3600"));
    assert!(ok.headers.contains("Date"));

    let stored = h.store.get_device(DEVICE_ID).await.expect("device stored");
    assert!(stored.registered);
    assert!(h.gateway.registry.active(DEVICE_ID).is_some());

    // 注册成功后平台下发 DeviceInfo 查询
    let query = h.recv_request().await;
    assert_eq!(query.method.to_string(), "MESSAGE");
    assert!(query.body_text().contains("<CmdType>DeviceInfo</CmdType>"));
    let to = query.to_header().expect("To");
    assert_eq!(to.uri.user.as_deref(), Some(DEVICE_ID));
    let from = query.from_header().expect("From");
    assert_eq!(from.uri.user.as_deref(), Some("34020000002000000001"));
    assert!(from.tag().is_some());
    h.ack(&query).await;

    // 设备回报 DeviceInfo
    h.send(&build_message(h.port(), "info-1", &device_info_body())).await;
    let resp = h.recv_response().await;
    assert_eq!(resp.status_code, 200);

    let stored = h.store.get_device(DEVICE_ID).await.expect("device stored");
    assert_eq!(stored.manufacturer, "Hikvision");
    assert_eq!(stored.firmware, "V4.1.0");
}

#[tokio::test]
async fn test_unknown_device_without_default_password_gets_no_answer() {
    let h = Harness::start(None).await;

    h.send(&build_register(h.port(), 1, None)).await;
    let challenge = h.recv_response().await;
    assert_eq!(challenge.status_code, 401);

    let auth = format!(
        r#"Digest username="{}", realm="3402000000", nonce="x", uri="{}", response="00""#,
        DEVICE_ID, SERVER_URI
    );
    h.send(&build_register(h.port(), 2, Some(&auth))).await;

    let mut buf = vec![0u8; 2048];
    let silent =
        tokio::time::timeout(Duration::from_millis(300), h.device.recv_from(&mut buf)).await;
    assert!(silent.is_err());
    assert_eq!(h.store.device_len(), 0);
}

#[tokio::test]
async fn test_keepalive_triggers_catalog_sync() {
    let h = Harness::start(Some(PASSWORD)).await;
    assert_eq!(h.register().await.status_code, 200);
    let info_query = h.recv_request().await;
    h.ack(&info_query).await;

    h.send(&build_message(h.port(), "keepalive-1", &keepalive_body())).await;
    let resp = h.recv_response().await;
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.call_id(), Some("keepalive-1"));

    let query = h.recv_request().await;
    assert!(query.body_text().contains("<CmdType>Catalog</CmdType>"));
    h.ack(&query).await;

    h.send(&build_message(h.port(), "catalog-1", &catalog_body())).await;
    assert_eq!(h.recv_response().await.status_code, 200);

    assert_eq!(h.store.sub_device_len(), 2);
    let cam = h
        .store
        .get_sub_device("34020000001320000001", DEVICE_ID)
        .await
        .expect("sub device");
    assert_eq!(cam.status, "ON");
    assert_eq!(h.store.sys_info().await.expect("sys info").device_count, 2);

    // 重复上报不重复计数
    h.send(&build_message(h.port(), "catalog-2", &catalog_body())).await;
    assert_eq!(h.recv_response().await.status_code, 200);
    assert_eq!(h.store.sys_info().await.expect("sys info").device_count, 2);
}

#[tokio::test]
async fn test_keepalive_from_unregistered_device_is_rejected() {
    let h = Harness::start(Some(PASSWORD)).await;

    h.send(&build_message(h.port(), "keepalive-2", &keepalive_body())).await;
    let resp = h.recv_response().await;
    assert_eq!(resp.status_code, 400);
}

#[tokio::test]
async fn test_message_edge_cases() {
    let h = Harness::start(Some(PASSWORD)).await;

    h.send(&build_message(h.port(), "empty-1", "")).await;
    assert_eq!(h.recv_response().await.status_code, 200);

    h.send(&build_message(h.port(), "bad-xml", "<Notify><CmdType>")).await;
    assert_eq!(h.recv_response().await.status_code, 400);

    let unknown = format!(
        "<Notify><CmdType>Alarm</CmdType><SN>1</SN><DeviceID>{DEVICE_ID}</DeviceID></Notify>"
    );
    h.send(&build_message(h.port(), "unknown-1", &unknown)).await;
    assert_eq!(h.recv_response().await.status_code, 400);
}

#[tokio::test]
async fn test_unregister_with_zero_expires() {
    let h = Harness::start(Some(PASSWORD)).await;
    assert_eq!(h.register().await.status_code, 200);
    let info_query = h.recv_request().await;
    h.ack(&info_query).await;
    assert!(h.gateway.registry.active(DEVICE_ID).is_some());

    // 复用已通过的鉴权，Expires: 0 注销
    h.send(&build_register(h.port(), 3, None).replace("Expires: 3600", "Expires: 0"))
        .await;
    let challenge = h.recv_response().await;
    let header = challenge.headers.get("WWW-Authenticate").expect("challenge");
    let params = DigestParams::parse(header).expect("params");
    let nonce = params.nonce().expect("nonce");
    let response = compute_response(
        DEVICE_ID,
        "3402000000",
        PASSWORD,
        "REGISTER",
        SERVER_URI,
        nonce,
        None,
    );
    let auth = format!(
        r#"Digest username="{}", realm="3402000000", nonce="{}", uri="{}", response="{}""#,
        DEVICE_ID, nonce, SERVER_URI, response
    );
    h.send(&build_register(h.port(), 4, Some(&auth)).replace("Expires: 3600", "Expires: 0"))
        .await;
    let ok = h.recv_response().await;
    assert_eq!(ok.status_code, 200);
    assert_eq!(ok.headers.get("Expires"), Some("0"));
    assert!(h.gateway.registry.active(DEVICE_ID).is_none());
}

#[tokio::test]
async fn test_gateway_from_config_file() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        temp_dir.path().join("gateway.toml"),
        r#"
[sip]
bind_addr = "127.0.0.1:0"
realm = "3402000000"
default_password = "00123456"
response_timeout_secs = 2
"#,
    )
    .expect("write config");

    let config = ConfigLoader::new(temp_dir.path())
        .validate()
        .expect("load config");
    assert_eq!(config.sip.default_password.as_deref(), Some("00123456"));

    let h = Harness::start_with(config).await;
    let ok = h.register_with("00123456").await;
    assert_eq!(ok.status_code, 200);
    assert!(h.gateway.registry.active(DEVICE_ID).is_some());
}
