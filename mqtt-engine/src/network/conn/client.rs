use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use log::{debug, trace};
use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf, sync::mpsc};

use crate::network::{CloseReason, FrameKind, SendStatus, Transport};

use super::Event;

/// 积压字节数超过此值时要求协议层暂停投递
const HIGH_WATER_MARK: usize = 1024 * 1024;
/// 积压字节数低于此值时恢复投递
const LOW_WATER_MARK: usize = 64 * 1024;

enum Command {
    Frame(Bytes),
    Close,
}

/// 客户端与服务器之间的 tcp 写端
/// 协议层可能在任意线程上发送，报文先进入队列，由单独的写任务刷入 socket
pub(crate) struct TcpTransport {
    addr: String,
    writer: mpsc::UnboundedSender<Command>,
    /// 队列中尚未写入 socket 的字节数
    queued: Arc<AtomicUsize>,
    suspended: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub(crate) fn new(
        addr: String,
        stream: OwnedWriteHalf,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (writer, commands) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let suspended = Arc::new(AtomicBool::new(false));
        tokio::spawn(write_loop(
            stream,
            commands,
            events,
            queued.clone(),
            suspended.clone(),
        ));
        Self {
            addr,
            writer,
            queued,
            suspended,
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: Bytes, kind: FrameKind) -> SendStatus {
        if self.closed.load(Ordering::SeqCst) {
            return SendStatus::Closed;
        }
        // tcp 没有传输层的探测帧
        if kind == FrameKind::Probe {
            return SendStatus::Ok;
        }

        let len = frame.len();
        let queued = self.queued.fetch_add(len, Ordering::SeqCst) + len;
        if self.writer.send(Command::Frame(frame)).is_err() {
            return SendStatus::Closed;
        }
        if queued > HIGH_WATER_MARK {
            self.suspended.store(true, Ordering::SeqCst);
            return SendStatus::Suspend;
        }
        SendStatus::Ok
    }

    fn close(&self, reason: &CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "close tcp stream {}: {} {}",
            self.addr, reason.rc, reason.reason
        );
        let _ = self.writer.send(Command::Close);
    }

    fn client_addr(&self) -> &str {
        &self.addr
    }
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    queued: Arc<AtomicUsize>,
    suspended: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Frame(frame) => {
                if let Err(e) = stream.write_all(&frame).await {
                    debug!("write tcp stream error: {}", e);
                    break;
                }
                let left = queued.fetch_sub(frame.len(), Ordering::SeqCst) - frame.len();
                if left < LOW_WATER_MARK && suspended.swap(false, Ordering::SeqCst) {
                    trace!("send queue drained");
                    let _ = events.send(Event::Resume);
                }
            }
            Command::Close => {
                let _ = stream.shutdown().await;
                break;
            }
        }
    }
    let _ = events.send(Event::Closed);
}
