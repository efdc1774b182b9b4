// 解析阶段
// 独立任务：Packet -> Message，解析失败直接丢弃

use crate::message::Message;
use crate::transport::Packet;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub struct Parser {
    input: mpsc::Sender<Packet>,
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Parser {
    /// 启动解析任务，返回句柄；`out` 为分发队列
    pub fn start(capacity: usize, out: mpsc::Sender<Message>) -> Self {
        let (input, mut rx) = mpsc::channel::<Packet>(capacity);
        let (stop_tx, mut stop_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = rx.recv() => match packet {
                        Some(packet) => forward(packet, &out).await,
                        None => break,
                    },
                    _ = stop_rx.recv() => {
                        // 尽力处理已入队的数据报
                        while let Ok(packet) = rx.try_recv() {
                            forward(packet, &out).await;
                        }
                        break;
                    }
                }
            }
            tracing::debug!(target: "gb28181::sip", "parser stopped");
        });

        Self {
            input,
            stop_tx,
            handle,
        }
    }

    /// 传输层写入端
    pub fn sender(&self) -> mpsc::Sender<Packet> {
        self.input.clone()
    }

    /// 发送停止信号并等待任务结束
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        drop(self.input);
        if let Err(e) = self.handle.await {
            tracing::warn!(target: "gb28181::sip", error = %e, "parser task join failed");
        }
    }
}

async fn forward(packet: Packet, out: &mpsc::Sender<Message>) {
    match Message::parse(&packet.data, Some(packet.source)) {
        Ok(msg) => {
            if out.send(msg).await.is_err() {
                tracing::debug!(target: "gb28181::sip", "dispatcher queue closed");
            }
        }
        Err(e) => {
            tracing::debug!(
                target: "gb28181::sip",
                remote = %packet.source,
                error = %e,
                "dropping unparsable datagram",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(data: &'static [u8]) -> Packet {
        Packet {
            data: Bytes::from_static(data),
            source: "127.0.0.1:5060".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_parser_forwards_valid_and_drops_garbage() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let parser = Parser::start(8, out_tx);
        let input = parser.sender();

        input.send(packet(b"garbage")).await.unwrap();
        input
            .send(packet(b"OPTIONS sip:a@b SIP/2.0\r\nCall-ID: 1\r\nCSeq: 1 OPTIONS\r\n\r\n"))
            .await
            .unwrap();

        let msg = out_rx.recv().await.unwrap();
        assert!(matches!(msg, Message::Request(_)));

        drop(input);
        parser.stop().await;
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_drains_queued_packets() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let parser = Parser::start(8, out_tx);
        let input = parser.sender();

        for _ in 0..3 {
            input
                .send(packet(b"SIP/2.0 200 OK\r\nCall-ID: 1\r\nCSeq: 1 MESSAGE\r\n\r\n"))
                .await
                .unwrap();
        }
        drop(input);
        parser.stop().await;

        let mut received = 0;
        while out_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }
}
