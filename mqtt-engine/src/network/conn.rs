pub(crate) use client::TcpTransport;

mod client;

/// 写端通知事件循环的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// 发送队列已排空，可以恢复投递
    Resume,
    /// 写端已关闭
    Closed,
}
