//! v5 原因码
//!
//! 同一个数值在不同报文中的含义不同（例如 0x00 在 SUBACK 中表示授予 QoS 0），
//! 因此只保留一个变体，并用允许出现的报文类型掩码约束解码。

use super::{Error, PacketType};

const CONNACK: u16 = 1 << PacketType::ConnAck as u8;
const PUBACK: u16 = 1 << PacketType::PubAck as u8;
const PUBREC: u16 = 1 << PacketType::PubRec as u8;
const PUBREL: u16 = 1 << PacketType::PubRel as u8;
const PUBCOMP: u16 = 1 << PacketType::PubComp as u8;
const SUBACK: u16 = 1 << PacketType::SubAck as u8;
const UNSUBACK: u16 = 1 << PacketType::UnsubAck as u8;
const DISCONNECT: u16 = 1 << PacketType::Disconnect as u8;
const AUTH: u16 = 1 << PacketType::Auth as u8;

/// 发布确认类报文通用的失败码
const PUB_FAILURE: u16 = CONNACK | PUBACK | PUBREC | SUBACK | UNSUBACK | DISCONNECT;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    /// 成功 / 正常断开 / 授予 QoS 0
    Success = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    /// 断开连接，但是需要发送遗嘱
    DisconnectWithWill = 0x04,
    NoMatchingSubscribers = 0x10,
    NoSubscriptionExisted = 0x11,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    UnsupportedProtocolVersion = 0x84,
    ClientIdentifierNotValid = 0x85,
    BadUserNamePassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    Banned = 0x8A,
    /// 服务端正在关闭
    ServerShuttingDown = 0x8B,
    BadAuthenticationMethod = 0x8C,
    /// 超过 1.5 倍 keepalive 时间没有收到报文
    KeepAliveTimeout = 0x8D,
    /// 另一个使用相同 client_id 的连接上线
    SessionTakenOver = 0x8E,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    PacketIdentifierInUse = 0x91,
    PacketIdentifierNotFound = 0x92,
    ReceiveMaximumExceeded = 0x93,
    TopicAliasInvalid = 0x94,
    PacketTooLarge = 0x95,
    MessageRateTooHigh = 0x96,
    QuotaExceeded = 0x97,
    AdministrativeAction = 0x98,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    SharedSubscriptionsNotSupported = 0x9E,
    ConnectionRateExceeded = 0x9F,
    MaximumConnectTime = 0xA0,
    SubscriptionIdentifiersNotSupported = 0xA1,
    WildcardSubscriptionsNotSupported = 0xA2,
}

impl ReasonCode {
    pub fn is_failure(self) -> bool {
        self as u8 >= 0x80
    }

    /// 允许携带此原因码的报文类型
    fn allowed(self) -> u16 {
        use ReasonCode::*;
        match self {
            Success => {
                CONNACK | PUBACK | PUBREC | PUBREL | PUBCOMP | SUBACK | UNSUBACK | DISCONNECT | AUTH
            }
            GrantedQoS1 | GrantedQoS2 => SUBACK,
            DisconnectWithWill => DISCONNECT,
            NoMatchingSubscribers => PUBACK | PUBREC,
            NoSubscriptionExisted => UNSUBACK,
            ContinueAuthentication | ReAuthenticate => AUTH,
            UnspecifiedError | ImplementationSpecificError | NotAuthorized => PUB_FAILURE,
            MalformedPacket | ProtocolError | ServerBusy | BadAuthenticationMethod
            | PacketTooLarge | RetainNotSupported | QoSNotSupported | UseAnotherServer
            | ServerMoved | ConnectionRateExceeded => CONNACK | DISCONNECT,
            UnsupportedProtocolVersion | ClientIdentifierNotValid | BadUserNamePassword
            | ServerUnavailable | Banned => CONNACK,
            ServerShuttingDown | KeepAliveTimeout | SessionTakenOver | ReceiveMaximumExceeded
            | TopicAliasInvalid | MessageRateTooHigh | AdministrativeAction
            | MaximumConnectTime => DISCONNECT,
            TopicFilterInvalid => SUBACK | UNSUBACK | DISCONNECT,
            TopicNameInvalid | PayloadFormatInvalid => CONNACK | PUBACK | PUBREC | DISCONNECT,
            PacketIdentifierInUse => PUBACK | PUBREC | SUBACK | UNSUBACK,
            PacketIdentifierNotFound => PUBREL | PUBCOMP,
            QuotaExceeded => CONNACK | PUBACK | PUBREC | SUBACK | DISCONNECT,
            SharedSubscriptionsNotSupported
            | SubscriptionIdentifiersNotSupported
            | WildcardSubscriptionsNotSupported => SUBACK | DISCONNECT,
        }
    }

    pub fn allowed_in(self, packet_type: PacketType) -> bool {
        self.allowed() & (1 << packet_type as u8) != 0
    }

    /// 解码指定报文中的原因码
    pub fn read(value: u8, packet_type: PacketType) -> Result<Self, Error> {
        match Self::try_from(value) {
            Ok(code) if code.allowed_in(packet_type) => Ok(code),
            _ => Err(Error::InvalidReasonCode(value, packet_type)),
        }
    }

    /// 授予的 QoS 对应的 SUBACK 原因码
    pub fn granted(qos: super::QoS) -> Self {
        match qos {
            super::QoS::AtMostOnce => ReasonCode::Success,
            super::QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            super::QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }

    /// 转换为 v3.1 / v3.1.1 的 CONNACK 返回码
    pub fn connect_return_code(self) -> u8 {
        use ReasonCode::*;
        match self {
            Success => 0,
            UnsupportedProtocolVersion => 1,
            ClientIdentifierNotValid => 2,
            BadUserNamePassword | BadAuthenticationMethod => 4,
            NotAuthorized | Banned | QoSNotSupported | TopicNameInvalid => 5,
            _ => 3,
        }
    }

    /// 从 v3.1 / v3.1.1 的 CONNACK 返回码转换
    pub fn from_connect_return_code(code: u8) -> Result<Self, Error> {
        let reason = match code {
            0 => ReasonCode::Success,
            1 => ReasonCode::UnsupportedProtocolVersion,
            2 => ReasonCode::ClientIdentifierNotValid,
            3 => ReasonCode::ServerUnavailable,
            4 => ReasonCode::BadUserNamePassword,
            5 => ReasonCode::NotAuthorized,
            n => return Err(Error::InvalidReasonCode(n, PacketType::ConnAck)),
        };
        Ok(reason)
    }
}

impl TryFrom<u8> for ReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ReasonCode::*;
        let code = match value {
            0x00 => Success,
            0x01 => GrantedQoS1,
            0x02 => GrantedQoS2,
            0x04 => DisconnectWithWill,
            0x10 => NoMatchingSubscribers,
            0x11 => NoSubscriptionExisted,
            0x18 => ContinueAuthentication,
            0x19 => ReAuthenticate,
            0x80 => UnspecifiedError,
            0x81 => MalformedPacket,
            0x82 => ProtocolError,
            0x83 => ImplementationSpecificError,
            0x84 => UnsupportedProtocolVersion,
            0x85 => ClientIdentifierNotValid,
            0x86 => BadUserNamePassword,
            0x87 => NotAuthorized,
            0x88 => ServerUnavailable,
            0x89 => ServerBusy,
            0x8A => Banned,
            0x8B => ServerShuttingDown,
            0x8C => BadAuthenticationMethod,
            0x8D => KeepAliveTimeout,
            0x8E => SessionTakenOver,
            0x8F => TopicFilterInvalid,
            0x90 => TopicNameInvalid,
            0x91 => PacketIdentifierInUse,
            0x92 => PacketIdentifierNotFound,
            0x93 => ReceiveMaximumExceeded,
            0x94 => TopicAliasInvalid,
            0x95 => PacketTooLarge,
            0x96 => MessageRateTooHigh,
            0x97 => QuotaExceeded,
            0x98 => AdministrativeAction,
            0x99 => PayloadFormatInvalid,
            0x9A => RetainNotSupported,
            0x9B => QoSNotSupported,
            0x9C => UseAnotherServer,
            0x9D => ServerMoved,
            0x9E => SharedSubscriptionsNotSupported,
            0x9F => ConnectionRateExceeded,
            0xA0 => MaximumConnectTime,
            0xA1 => SubscriptionIdentifiersNotSupported,
            0xA2 => WildcardSubscriptionsNotSupported,
            n => return Err(Error::InvalidReasonCode(n, PacketType::Disconnect)),
        };
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granted_qos_only_in_suback() {
        assert!(ReasonCode::GrantedQoS1.allowed_in(PacketType::SubAck));
        assert!(ReasonCode::GrantedQoS2.allowed_in(PacketType::SubAck));
        assert!(!ReasonCode::GrantedQoS1.allowed_in(PacketType::PubAck));
        assert!(!ReasonCode::GrantedQoS2.allowed_in(PacketType::Disconnect));
        assert!(ReasonCode::read(0x01, PacketType::PubAck).is_err());
    }

    #[test]
    fn reason_read_checks_packet() {
        assert_eq!(
            ReasonCode::read(0x92, PacketType::PubRel).unwrap(),
            ReasonCode::PacketIdentifierNotFound
        );
        assert!(ReasonCode::read(0x92, PacketType::PubAck).is_err());
        assert!(ReasonCode::read(0x03, PacketType::PubAck).is_err());
        assert_eq!(
            ReasonCode::read(0x10, PacketType::PubRec).unwrap(),
            ReasonCode::NoMatchingSubscribers
        );
    }

    #[test]
    fn connect_return_code_mapping() {
        for rc in 0..=5 {
            let reason = ReasonCode::from_connect_return_code(rc).unwrap();
            assert_eq!(reason.connect_return_code(), rc);
        }
        assert_eq!(ReasonCode::ServerBusy.connect_return_code(), 3);
        assert!(ReasonCode::from_connect_return_code(6).is_err());
    }
}
