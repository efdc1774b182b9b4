// 流会话注册表
// 直播每通道至多一个会话，回放每次请求新建；空闲会话由 sweep 关闭

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Live,
    Replay,
}

/// 点播请求
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub channel_id: String,
    pub kind: StreamKind,
    /// 回放开始时间（unix 秒）
    pub start: Option<i64>,
    /// 回放结束时间（unix 秒）
    pub end: Option<i64>,
}

impl PlayRequest {
    pub fn live(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            kind: StreamKind::Live,
            start: None,
            end: None,
        }
    }

    pub fn replay(channel_id: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            channel_id: channel_id.into(),
            kind: StreamKind::Replay,
            start: Some(start),
            end: Some(end),
        }
    }
}

/// 会话描述（对外返回）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream_id: String,
    pub channel_id: String,
    pub kind: StreamKind,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub created_at: i64,
    pub last_access: i64,
}

/// 流会话
#[derive(Debug)]
pub struct StreamSession {
    pub id: String,
    pub channel_id: String,
    pub kind: StreamKind,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub created_at: i64,
    /// 最后访问时间（毫秒）
    last_access: AtomicI64,
}

impl StreamSession {
    fn new(id: String, req: &PlayRequest) -> Self {
        let now = now_ms();
        Self {
            id,
            channel_id: req.channel_id.clone(),
            kind: req.kind,
            start: req.start,
            end: req.end,
            created_at: now / 1000,
            last_access: AtomicI64::new(now),
        }
    }

    pub fn touch(&self) {
        self.last_access.store(now_ms(), Ordering::Release);
    }

    pub fn last_access_ms(&self) -> i64 {
        self.last_access.load(Ordering::Acquire)
    }

    pub fn idle_for(&self, now_ms: i64) -> Duration {
        let idle = now_ms.saturating_sub(self.last_access_ms()).max(0);
        Duration::from_millis(idle as u64)
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            stream_id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            kind: self.kind,
            start: self.start,
            end: self.end,
            created_at: self.created_at,
            last_access: self.last_access_ms() / 1000,
        }
    }
}

/// 媒体转发服务（外部协作方）
#[async_trait]
pub trait MediaRelay: Send + Sync {
    async fn play(&self, stream: &StreamDescriptor) -> Result<()>;

    async fn stop(&self, stream_id: &str) -> Result<()>;

    /// 当前观看人数；不支持时返回 None
    async fn viewer_count(&self, _stream_id: &str) -> Option<u32> {
        None
    }
}

/// 不做任何转发
#[derive(Debug, Default, Clone)]
pub struct NullRelay;

#[async_trait]
impl MediaRelay for NullRelay {
    async fn play(&self, stream: &StreamDescriptor) -> Result<()> {
        tracing::debug!(target: "gb28181d", stream_id = %stream.stream_id, "relay disabled, play accepted");
        Ok(())
    }

    async fn stop(&self, stream_id: &str) -> Result<()> {
        tracing::debug!(target: "gb28181d", %stream_id, "relay disabled, stop accepted");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ViewerReport {
    viewers: u32,
}

/// 通过 HTTP 调用媒体转发服务
#[derive(Clone)]
pub struct HttpRelay {
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(endpoint: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(timeout_ms),
            client: reqwest::Client::new(),
        }
    }

    fn stream_url(&self, stream_id: &str) -> String {
        format!("{}/streams/{}", self.endpoint, stream_id)
    }
}

#[async_trait]
impl MediaRelay for HttpRelay {
    async fn play(&self, stream: &StreamDescriptor) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/streams", self.endpoint))
            .timeout(self.timeout)
            .json(stream)
            .send()
            .await
            .map_err(|e| GatewayError::Relay(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Relay(format!(
                "play {} failed: status={}",
                stream.stream_id,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn stop(&self, stream_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.stream_url(stream_id))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| GatewayError::Relay(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Relay(format!(
                "stop {} failed: status={}",
                stream_id,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn viewer_count(&self, stream_id: &str) -> Option<u32> {
        let resp = self
            .client
            .get(self.stream_url(stream_id))
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<ViewerReport>().await.ok().map(|r| r.viewers)
    }
}

/// 流会话注册表
pub struct StreamRegistry {
    sessions: DashMap<String, Arc<StreamSession>>,

    /// 通道 -> 直播会话（OnceCell 保证并发请求只创建一次）
    live: DashMap<String, Arc<OnceCell<Arc<StreamSession>>>>,

    relay: Arc<dyn MediaRelay>,

    idle_timeout: Duration,
}

impl StreamRegistry {
    pub fn new(relay: Arc<dyn MediaRelay>, idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            live: DashMap::new(),
            relay,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub async fn play(&self, req: PlayRequest) -> Result<StreamDescriptor> {
        match req.kind {
            StreamKind::Live => self.play_live(req).await,
            StreamKind::Replay => self.play_replay(req).await,
        }
    }

    async fn play_live(&self, req: PlayRequest) -> Result<StreamDescriptor> {
        loop {
            let cell = self
                .live
                .entry(req.channel_id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let session = cell
                .get_or_try_init(|| async {
                    // 每次创建使用新 ID，旧会话的拆除不会作用到新会话
                    let session = Arc::new(StreamSession::new(
                        format!("live_{}_{:08x}", req.channel_id, rand::thread_rng().gen::<u32>()),
                        &req,
                    ));
                    self.relay.play(&session.descriptor()).await?;
                    self.sessions.insert(session.id.clone(), session.clone());
                    tracing::info!(
                        target: "gb28181d",
                        stream_id = %session.id,
                        channel_id = %session.channel_id,
                        "live stream started",
                    );
                    Ok::<_, GatewayError>(session)
                })
                .await?
                .clone();

            // 会话可能在取到 cell 之后被 stop/sweep 移除
            let current = self
                .sessions
                .get(&session.id)
                .map(|s| Arc::ptr_eq(s.value(), &session))
                .unwrap_or(false);
            if current {
                session.touch();
                return Ok(session.descriptor());
            }

            self.live
                .remove_if(&req.channel_id, |_, c| Arc::ptr_eq(c, &cell));
        }
    }

    async fn play_replay(&self, req: PlayRequest) -> Result<StreamDescriptor> {
        let start = req.start.filter(|s| *s != 0).ok_or_else(|| {
            GatewayError::InvalidParams("replay requires a non-zero start time".to_string())
        })?;
        let end = req
            .end
            .ok_or_else(|| GatewayError::InvalidParams("replay requires an end time".to_string()))?;
        if start >= end {
            return Err(GatewayError::InvalidParams(format!(
                "start time {} must be earlier than end time {}",
                start, end
            )));
        }

        let id = format!("replay_{:016x}", rand::thread_rng().gen::<u64>());
        let session = Arc::new(StreamSession::new(id, &req));
        self.relay.play(&session.descriptor()).await?;
        self.sessions.insert(session.id.clone(), session.clone());

        tracing::info!(
            target: "gb28181d",
            stream_id = %session.id,
            channel_id = %session.channel_id,
            start,
            end,
            "replay stream started",
        );
        Ok(session.descriptor())
    }

    /// 停止会话；未知 ID 返回 StreamNotFound 且不修改注册表
    pub async fn stop(&self, stream_id: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(stream_id) else {
            return Err(GatewayError::StreamNotFound(stream_id.to_string()));
        };
        self.teardown(session, "stopped").await;
        Ok(())
    }

    async fn teardown(&self, session: Arc<StreamSession>, reason: &'static str) {
        if session.kind == StreamKind::Live {
            self.live.remove_if(&session.channel_id, |_, cell| {
                cell.get().map_or(false, |s| Arc::ptr_eq(s, &session))
            });
        }

        if let Err(e) = self.relay.stop(&session.id).await {
            tracing::warn!(
                target: "gb28181d",
                stream_id = %session.id,
                error = %e,
                "relay teardown failed",
            );
        }

        tracing::info!(
            target: "gb28181d",
            stream_id = %session.id,
            channel_id = %session.channel_id,
            reason,
            "stream closed",
        );
    }

    /// 关闭空闲超时的会话，返回关闭数量
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<Arc<StreamSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        // 有观众的会话视为活跃
        for session in &snapshot {
            if let Some(viewers) = self.relay.viewer_count(&session.id).await {
                if viewers > 0 {
                    session.touch();
                }
            }
        }

        let idle_timeout = self.idle_timeout;
        let mut closed = 0;
        for session in snapshot {
            if session.idle_for(now_ms()) <= idle_timeout {
                continue;
            }

            // 条件删除：期间被访问或已被移除的会话不处理
            let removed = self.sessions.remove_if(&session.id, |_, current| {
                Arc::ptr_eq(current, &session) && current.idle_for(now_ms()) > idle_timeout
            });
            if let Some((_, session)) = removed {
                self.teardown(session, "idle").await;
                closed += 1;
            }
        }

        if closed > 0 {
            tracing::info!(target: "gb28181d", closed, remaining = self.sessions.len(), "idle streams swept");
        }
        closed
    }

    /// 刷新访问时间
    pub fn touch(&self, stream_id: &str) -> bool {
        match self.sessions.get(stream_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamDescriptor> {
        self.sessions.get(stream_id).map(|s| s.descriptor())
    }

    pub fn list(&self) -> Vec<StreamDescriptor> {
        let mut streams: Vec<StreamDescriptor> =
            self.sessions.iter().map(|e| e.value().descriptor()).collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
