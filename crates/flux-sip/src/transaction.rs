// SIP 事务表
// 事务键 = Call-ID | 顶层 Via branch | CSeq 方法，请求与其响应得到同一个键

use crate::error::{Result, SipError};
use crate::message::{Request, Response, SipHeaders};
use crate::transport::Transport;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};

/// 单个事务最多缓存的未读响应
const RESPONSE_BUFFER: usize = 16;

/// 从消息头计算事务键
pub fn transaction_key<M: SipHeaders>(msg: &M) -> Result<String> {
    let call_id = msg.call_id().ok_or(SipError::MissingHeader("Call-ID"))?;
    let cseq = msg.cseq().ok_or(SipError::MissingHeader("CSeq"))?;
    let via = msg.via_hop();
    let branch = via.as_ref().and_then(|v| v.branch()).unwrap_or_default();
    Ok(format!("{}|{}|{}", call_id, branch, cseq.method))
}

/// 一次请求/响应交换
pub struct Transaction {
    key: String,
    transport: Transport,
    created_at: Instant,
    responses_tx: mpsc::Sender<Response>,
    responses_rx: Mutex<mpsc::Receiver<Response>>,
    terminated: AtomicBool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .field("age", &self.age())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Transaction {
    fn new(key: String, transport: Transport) -> Self {
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BUFFER);
        Self {
            key,
            transport,
            created_at: Instant::now(),
            responses_tx,
            responses_rx: Mutex::new(responses_rx),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// 服务端事务：发送响应。只发送第一个最终响应
    pub async fn respond(&self, resp: Response) -> Result<()> {
        if !resp.is_provisional() && self.terminated.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                target: "gb28181::sip",
                key = %self.key,
                status = resp.status_code,
                "duplicate final response skipped",
            );
            return Ok(());
        }

        let dest = resp.destination.ok_or(SipError::NoDestination)?;
        self.transport.send_to(&resp.to_bytes(), dest).await
    }

    /// 客户端事务：发送请求
    pub async fn send_request(&self, req: &Request, dest: SocketAddr) -> Result<()> {
        self.transport.send_to(&req.to_bytes(), dest).await
    }

    /// 分发层投递一个响应
    pub fn receive_response(&self, resp: Response) {
        if !resp.is_provisional() {
            self.terminated.store(true, Ordering::Release);
        }
        if let Err(e) = self.responses_tx.try_send(resp) {
            tracing::warn!(
                target: "gb28181::sip",
                key = %self.key,
                error = %e,
                "response dropped, nobody is waiting",
            );
        }
    }

    /// 等待最终响应（跳过 1xx），超时返回 `SipError::Timeout`
    pub async fn wait_response(&self, timeout: Duration) -> Result<Response> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.responses_rx.lock().await;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(resp)) if resp.is_provisional() => {
                    tracing::debug!(
                        target: "gb28181::sip",
                        key = %self.key,
                        status = resp.status_code,
                        "provisional response",
                    );
                }
                Ok(Some(resp)) => return Ok(resp),
                Ok(None) => return Err(SipError::ChannelClosed),
                Err(_) => return Err(SipError::Timeout(self.key.clone())),
            }
        }
    }
}

/// 事务表（单把读写锁保护）
pub struct TransactionTable {
    transport: Transport,
    inner: RwLock<HashMap<String, Arc<Transaction>>>,
}

impl TransactionTable {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// 新建事务，同键旧事务被替换
    pub async fn new_tx(&self, key: &str) -> Arc<Transaction> {
        let tx = Arc::new(Transaction::new(key.to_string(), self.transport.clone()));
        self.inner.write().await.insert(key.to_string(), tx.clone());
        tx
    }

    pub async fn get_tx(&self, key: &str) -> Option<Arc<Transaction>> {
        self.inner.read().await.get(key).cloned()
    }

    /// 获取或创建
    pub async fn must_tx(&self, key: &str) -> Arc<Transaction> {
        if let Some(tx) = self.get_tx(key).await {
            return tx;
        }
        let mut inner = self.inner.write().await;
        inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Transaction::new(key.to_string(), self.transport.clone())))
            .clone()
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<Transaction>> {
        self.inner.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// 清理已终结或超过 TTL 的事务，返回清理数量
    pub async fn evict(&self, ttl: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, tx| !tx.is_terminated() && tx.age() < ttl);
        let evicted = before - inner.len();
        if evicted > 0 {
            tracing::debug!(target: "gb28181::sip", evicted, remaining = inner.len(), "transactions evicted");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn parse_request(raw: &str) -> Request {
        match Message::parse(raw.as_bytes(), Some("127.0.0.1:5060".parse().unwrap())).unwrap() {
            Message::Request(req) => req,
            Message::Response(_) => panic!("expected request"),
        }
    }

    fn request(call_id: &str, branch: &str) -> Request {
        parse_request(&format!(
            "MESSAGE sip:a@b SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch={}\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 MESSAGE\r\n\r\n",
            branch, call_id
        ))
    }

    async fn table() -> TransactionTable {
        TransactionTable::new(Transport::bind("127.0.0.1:0").await.unwrap())
    }

    #[test]
    fn test_key_matches_request_and_response() {
        let req = request("abc", "z9hG4bK1");
        let resp = Response::from_request(&req, 200);

        let key = transaction_key(&req).unwrap();
        assert_eq!(key, "abc|z9hG4bK1|MESSAGE");
        assert_eq!(transaction_key(&resp).unwrap(), key);

        assert_ne!(transaction_key(&request("abc", "z9hG4bK2")).unwrap(), key);
        assert_ne!(transaction_key(&request("xyz", "z9hG4bK1")).unwrap(), key);
    }

    #[test]
    fn test_key_requires_call_id_and_cseq() {
        let req = parse_request("MESSAGE sip:a@b SIP/2.0\r\nCSeq: 1 MESSAGE\r\n\r\n");
        assert!(matches!(transaction_key(&req), Err(SipError::MissingHeader("Call-ID"))));

        let req = parse_request("MESSAGE sip:a@b SIP/2.0\r\nCall-ID: 1\r\n\r\n");
        assert!(matches!(transaction_key(&req), Err(SipError::MissingHeader("CSeq"))));
    }

    #[tokio::test]
    async fn test_must_tx_is_idempotent() {
        let table = table().await;
        let a = table.must_tx("k").await;
        let b = table.must_tx("k").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len().await, 1);

        assert!(table.get_tx("other").await.is_none());
        assert!(table.remove("k").await.is_some());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_wait_response_skips_provisional() {
        let table = table().await;
        let req = request("abc", "z9hG4bK1");
        let tx = table.new_tx(&transaction_key(&req).unwrap()).await;

        tx.receive_response(Response::from_request(&req, 100));
        tx.receive_response(Response::from_request(&req, 200));

        let resp = tx.wait_response(Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert!(tx.is_terminated());
    }

    #[tokio::test]
    async fn test_wait_response_times_out() {
        let table = table().await;
        let tx = table.new_tx("k").await;
        let err = tx.wait_response(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, SipError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_only_first_final_response_is_sent() {
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let table = table().await;

        let mut req = request("abc", "z9hG4bK1");
        req.source = Some(peer.local_addr().unwrap());
        let tx = table.must_tx(&transaction_key(&req).unwrap()).await;

        tx.respond(Response::from_request(&req, 200)).await.unwrap();
        tx.respond(Response::from_request(&req, 500)).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert!(buf[..len].starts_with(b"SIP/2.0 200 OK"));

        let second = tokio::time::timeout(Duration::from_millis(100), peer.recv_from(&mut buf)).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_evict_terminated_and_aged() {
        let table = table().await;
        let done = table.new_tx("done").await;
        let req = request("abc", "z9hG4bK1");
        done.receive_response(Response::from_request(&req, 200));
        table.new_tx("open").await;

        assert_eq!(table.evict(Duration::from_secs(60)).await, 1);
        assert!(table.get_tx("open").await.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.evict(Duration::from_millis(10)).await, 1);
        assert!(table.is_empty().await);
    }
}
