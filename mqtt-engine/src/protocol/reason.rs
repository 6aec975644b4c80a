//! 服务端返回码，以及引擎结果到协议应答的映射

use std::fmt;

use crate::{
    engine::{EngineError, PutOutcome},
    network::packet::{self, Protocol, ReasonCode},
};

/// 服务端返回码，关闭连接时记录在日志和 CloseReason 中
/// 数值保持稳定，方便外部按数值统计
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Ok = 0,
    Closed = 1,
    ConnectFirst = 2,
    BadLength = 3,
    BadClientData = 4,
    UnicodeNotValid = 5,
    BadTopic = 6,
    BadSysTopic = 7,
    MsgTooBig = 8,
    InvalidQoS = 9,
    UsernameRequired = 10,
    InvalidVersion = 11,
    BadIdentifier = 12,
    BadUser = 13,
    NotAuthorized = 14,
    ServerUnavailable = 15,
    ReceiveMaxExceeded = 16,
    TopicAliasInvalid = 17,
    PayloadFormatInvalid = 18,
    QoSNotSupported = 19,
    QuotaExceeded = 20,
    ProtocolError = 21,
    KeepAliveTimeout = 22,
    SessionTakenOver = 23,
    ServerShuttingDown = 24,
    EngineFailure = 25,
}

impl ReturnCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// 对应的 v5 原因码
    pub fn reason_code(self) -> ReasonCode {
        use ReturnCode::*;
        match self {
            Ok | Closed => ReasonCode::Success,
            ConnectFirst | ProtocolError => ReasonCode::ProtocolError,
            BadLength | BadClientData | UnicodeNotValid | InvalidQoS | UsernameRequired => {
                ReasonCode::MalformedPacket
            }
            BadTopic | BadSysTopic => ReasonCode::TopicNameInvalid,
            MsgTooBig => ReasonCode::PacketTooLarge,
            InvalidVersion => ReasonCode::UnsupportedProtocolVersion,
            BadIdentifier => ReasonCode::ClientIdentifierNotValid,
            BadUser => ReasonCode::BadUserNamePassword,
            NotAuthorized => ReasonCode::NotAuthorized,
            ServerUnavailable => ReasonCode::ServerUnavailable,
            ReceiveMaxExceeded => ReasonCode::ReceiveMaximumExceeded,
            TopicAliasInvalid => ReasonCode::TopicAliasInvalid,
            PayloadFormatInvalid => ReasonCode::PayloadFormatInvalid,
            QoSNotSupported => ReasonCode::QoSNotSupported,
            QuotaExceeded => ReasonCode::QuotaExceeded,
            KeepAliveTimeout => ReasonCode::KeepAliveTimeout,
            SessionTakenOver => ReasonCode::SessionTakenOver,
            ServerShuttingDown => ReasonCode::ServerShuttingDown,
            EngineFailure => ReasonCode::UnspecifiedError,
        }
    }

    /// 连接被拒绝时的说明文字
    pub fn description(self) -> &'static str {
        use ReturnCode::*;
        match self {
            InvalidVersion => "The MQTT client version is not supported.",
            BadIdentifier => "The client ID is not valid.",
            BadUser => "The user name or password is not valid.",
            NotAuthorized | QoSNotSupported | QuotaExceeded => "The connection is not authorized.",
            ProtocolError => "The connect request violates the MQTT protocol.",
            _ => "The server is not available.",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

impl From<&packet::Error> for ReturnCode {
    fn from(e: &packet::Error) -> Self {
        use packet::Error::*;
        match e {
            MalformedLength | PayloadTooLarge => ReturnCode::BadLength,
            PacketTooLarge(_) => ReturnCode::MsgTooBig,
            Unicode(_) => ReturnCode::UnicodeNotValid,
            BadTopic(_) => ReturnCode::BadTopic,
            BadSysTopic(_) => ReturnCode::BadSysTopic,
            InvalidProtocol(_) => ReturnCode::InvalidVersion,
            InvalidQoS(_) => ReturnCode::InvalidQoS,
            UsernameRequired => ReturnCode::UsernameRequired,
            UnexpectedPacketType(_)
            | InvalidPropertyType(_)
            | PropertyNotAllowed(..)
            | DuplicateProperty(_)
            | InvalidPropertyValue(_)
            | InvalidReasonCode(..)
            | MissPacketId
            | EmptyTopicList => ReturnCode::ProtocolError,
            ConnectRefused { code, .. } => match code {
                ReasonCode::UnsupportedProtocolVersion => ReturnCode::InvalidVersion,
                ReasonCode::ClientIdentifierNotValid => ReturnCode::BadIdentifier,
                _ => ReturnCode::BadClientData,
            },
            _ => ReturnCode::BadClientData,
        }
    }
}

/// 入站 PUBLISH 提交给引擎之后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// 回复 PUBACK / PUBREC
    Ack(ReasonCode),
    /// 断开连接
    Disconnect(ReturnCode),
}

/// 按协议版本映射引擎的发布结果
/// v3.1 的客户端没有失败应答，鉴权和配额失败时照常确认，由客户端自行重试
pub fn publish_outcome(
    protocol: Protocol,
    result: &Result<PutOutcome, EngineError>,
) -> AckDecision {
    let err = match result {
        Ok(PutOutcome::Delivered) => return AckDecision::Ack(ReasonCode::Success),
        Ok(PutOutcome::NoSubscribers) => {
            return AckDecision::Ack(ReasonCode::NoMatchingSubscribers)
        }
        Err(e) => e,
    };

    match (err, protocol) {
        (EngineError::AllocationFailure, _) => AckDecision::Disconnect(ReturnCode::EngineFailure),
        (EngineError::NotAuthorized, Protocol::V5) => AckDecision::Ack(ReasonCode::NotAuthorized),
        (EngineError::NotAuthorized, Protocol::V4) => {
            AckDecision::Disconnect(ReturnCode::NotAuthorized)
        }
        (EngineError::QuotaExceeded | EngineError::DestinationFull, Protocol::V5) => {
            AckDecision::Ack(ReasonCode::QuotaExceeded)
        }
        (EngineError::QuotaExceeded | EngineError::DestinationFull, Protocol::V4) => {
            AckDecision::Disconnect(ReturnCode::QuotaExceeded)
        }
        (
            EngineError::NotAuthorized | EngineError::QuotaExceeded | EngineError::DestinationFull,
            Protocol::V3,
        ) => AckDecision::Ack(ReasonCode::Success),
        (_, Protocol::V5) => AckDecision::Ack(ReasonCode::UnspecifiedError),
        _ => AckDecision::Disconnect(ReturnCode::EngineFailure),
    }
}

/// 订阅失败时 SUBACK 中的原因码
pub fn subscribe_reason(err: &EngineError) -> ReasonCode {
    match err {
        EngineError::NotAuthorized => ReasonCode::NotAuthorized,
        EngineError::QuotaExceeded | EngineError::DestinationFull => ReasonCode::QuotaExceeded,
        EngineError::ShareMismatch => ReasonCode::ImplementationSpecificError,
        _ => ReasonCode::UnspecifiedError,
    }
}
