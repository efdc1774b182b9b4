// UDP 传输层
// 单个 socket 负责收发；接收循环把数据报推入有界解析队列

use crate::error::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// IPv4 UDP 最大负载：65535 - IP 头(20) - UDP 头(8)
pub const MAX_DATAGRAM: usize = 65535 - 20 - 8;

/// 原始数据报
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub source: SocketAddr,
}

/// UDP 传输句柄（可廉价克隆，所有事务共享）
#[derive(Debug, Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket.send_to(data, addr).await?;
        tracing::trace!(target: "gb28181::sip", remote = %addr, len = data.len(), "datagram sent");
        Ok(())
    }

    /// 接收循环：队列满时丢弃数据报，接收错误只记录不退出
    pub async fn run(self, out: mpsc::Sender<Packet>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, source) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(target: "gb28181::sip", error = %e, "UDP receive failed");
                    continue;
                }
            };

            let packet = Packet {
                data: Bytes::copy_from_slice(&buf[..len]),
                source,
            };

            match out.try_send(packet) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        target: "gb28181::sip",
                        remote = %source,
                        "parser queue full, datagram dropped",
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::info!(target: "gb28181::sip", "parser queue closed, receive loop exits");
                    return;
                }
            }
        }
    }
}
