//! 协议层
//! 处理协议相关的逻辑，网络层把收到的字节交给 [`Connection`]，回复通过 [`Transport`] 写回
//!
//! [`Transport`]: crate::network::Transport

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use crate::{
    config::Config,
    engine::{Engine, EngineError},
    network::packet::{self, PacketType, ReasonCode},
    Hook,
};

pub use connection::Connection;
pub use keepalive::KeepAliveList;
pub use msgid::{ConnId, MsgIdTable};
pub use reason::ReturnCode;

mod alias;
mod connect;
mod connection;
mod inflight;
mod keepalive;
mod msgid;
mod publish;
mod reason;
mod session;
mod subscribe;

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("First packet is not CONNECT")]
    ConnectFirst,
    #[error("Duplicate CONNECT")]
    DuplicateConnect,
    #[error("Too many bytes received before CONNECT completed")]
    ConnectBufferOverflow,
    #[error("Message too big: {0}")]
    MessageTooBig(usize),
    #[error("QoS not supported")]
    QoSNotSupported,
    #[error("Receive maximum exceeded")]
    ReceiveMaxExceeded,
    #[error("Topic alias error: {0}")]
    TopicAlias(#[from] alias::Error),
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    #[error("Payload is not valid UTF-8")]
    PayloadFormatInvalid,
    #[error("Rejected: {0}")]
    Rejected(ReturnCode),
    #[error("Keep alive timeout")]
    KeepAliveTimeout,
    #[error("Session taken over")]
    SessionTakenOver,
    #[error("Server shutting down")]
    ServerShuttingDown,
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Connection closed")]
    Closed,
}

impl Error {
    /// 服务端返回码
    pub fn rc(&self) -> ReturnCode {
        match self {
            Error::Packet(e) => ReturnCode::from(e),
            Error::ConnectFirst => ReturnCode::ConnectFirst,
            Error::DuplicateConnect | Error::Protocol(_) => ReturnCode::ProtocolError,
            Error::ConnectBufferOverflow => ReturnCode::BadLength,
            Error::MessageTooBig(_) => ReturnCode::MsgTooBig,
            Error::QoSNotSupported => ReturnCode::QoSNotSupported,
            Error::ReceiveMaxExceeded => ReturnCode::ReceiveMaxExceeded,
            Error::TopicAlias(_) => ReturnCode::TopicAliasInvalid,
            Error::PayloadFormatInvalid => ReturnCode::PayloadFormatInvalid,
            Error::Rejected(rc) => *rc,
            Error::KeepAliveTimeout => ReturnCode::KeepAliveTimeout,
            Error::SessionTakenOver => ReturnCode::SessionTakenOver,
            Error::ServerShuttingDown => ReturnCode::ServerShuttingDown,
            Error::Engine(_) => ReturnCode::EngineFailure,
            Error::Closed => ReturnCode::Closed,
        }
    }

    /// v5 DISCONNECT 中的原因码
    pub fn reason_code(&self) -> ReasonCode {
        let code = self.rc().reason_code();
        if code.allowed_in(PacketType::Disconnect) {
            code
        } else {
            ReasonCode::UnspecifiedError
        }
    }
}

/// 所有连接共享的服务，broker 启动时创建
pub struct Services<E: Engine, H: Hook> {
    pub config: Arc<Config>,
    pub engine: Arc<E>,
    pub hook: Arc<H>,
    pub msgids: Arc<MsgIdTable>,
    pub keepalive: Arc<KeepAliveList>,
    next_conn: Arc<AtomicU64>,
}

impl<E: Engine, H: Hook> Clone for Services<E, H> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            engine: self.engine.clone(),
            hook: self.hook.clone(),
            msgids: self.msgids.clone(),
            keepalive: self.keepalive.clone(),
            next_conn: self.next_conn.clone(),
        }
    }
}

impl<E: Engine, H: Hook> Services<E, H> {
    pub fn new(config: Config, engine: Arc<E>, hook: Arc<H>) -> Self {
        let msgids = Arc::new(MsgIdTable::new(
            config.msgid.shards,
            config.msgid.free_list_max,
        ));
        Self {
            config: Arc::new(config),
            engine,
            hook,
            msgids,
            keepalive: KeepAliveList::new(),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

/// 锁中毒时继续使用内部数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
