//! 网络层
//! 本层只关心网络读写，收到的字节交给协议层的 [`Connection`] 处理，
//! 协议层通过 [`Transport`] 把报文写回客户端

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::{
    io::AsyncReadExt,
    net::{tcp::OwnedReadHalf, TcpStream},
    select,
    sync::mpsc,
};

use crate::{
    engine::Engine,
    protocol::{self, Connection, ReturnCode, Services},
    Hook,
};

pub(crate) use conn::{Event, TcpTransport};

pub(crate) mod conn;
pub mod packet;
pub mod topic;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::Error),
}

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// 普通的 mqtt 报文
    Binary,
    /// 传输层的保活探测，例如 websocket ping，裸 tcp 可以忽略
    Probe,
}

/// 发送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    /// 已经接收，但发送队列积压，在 resume 之前不要再投递消息
    Suspend,
    /// 连接已关闭，未发送
    Closed,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub rc: ReturnCode,
    /// 是否正常关闭
    pub clean: bool,
    pub reason: String,
}

/// 协议层使用的传输通道
///
/// 发送队列排空后，传输层需要调用 [`Connection::resume`]
pub trait Transport: Send + Sync + 'static {
    fn send(&self, frame: Bytes, kind: FrameKind) -> SendStatus;
    fn close(&self, reason: &CloseReason);
    fn client_addr(&self) -> &str;
}

/// 一个 tcp 客户端连接的事件循环
pub struct ClientEventLoop<E: Engine, H: Hook> {
    conn: Arc<Connection<E, H>>,
    read: OwnedReadHalf,
    /// 读缓冲区，不完整的报文留在这里等待更多数据
    buffer: BytesMut,
    events: mpsc::UnboundedReceiver<Event>,
}

impl<E: Engine, H: Hook> ClientEventLoop<E, H> {
    pub(crate) fn new(stream: TcpStream, services: Services<E, H>) -> Self {
        let addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = Arc::new(TcpTransport::new(addr, write, events_tx));
        let conn = Connection::new(services, transport);
        Self {
            conn,
            read,
            buffer: BytesMut::with_capacity(4096),
            events,
        }
    }

    /// 开启事件循环，连接拆除完成后返回
    /// * 从 socket 读取数据交给协议层
    /// * 写端发出的事件：发送队列排空后恢复投递，写失败后退出
    pub(crate) async fn start(mut self) -> Result<(), Error> {
        let result = self.run().await;
        if let Err(Error::Io(e)) = &result {
            self.conn
                .close(ReturnCode::Closed, false, &format!("read error: {}", e));
        }
        self.conn.closed().await;
        result
    }

    async fn run(&mut self) -> Result<(), Error> {
        loop {
            select! {
                read = self.read.read_buf(&mut self.buffer) => {
                    if read? == 0 {
                        debug!("connection {} closed by peer", self.conn.id());
                        self.conn.close(ReturnCode::Closed, false, "connection closed by peer");
                        return Ok(());
                    }
                    self.conn.receive(&mut self.buffer).await?;
                }
                event = self.events.recv() => match event {
                    Some(Event::Resume) => self.conn.resume(),
                    Some(Event::Closed) | None => {
                        self.conn.close(ReturnCode::Closed, false, "write side closed");
                        return Ok(());
                    }
                }
            }
        }
    }
}
