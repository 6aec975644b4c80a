//! v5 属性块
//!
//! 属性解码由一张表驱动：每个属性有固定的标识符、值类型和允许出现的报文集合。

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    read_bytes, read_string, read_u16, read_u32, read_u8, read_varint, write_bytes,
    write_remaining_length, write_string, Error, PacketType,
};

/// 属性可以出现的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyScope {
    Packet(PacketType),
    /// CONNECT 报文中的遗嘱属性
    Will,
    /// 代理扩展的 CONNECT 带外属性块
    Proxy,
}

impl PropertyScope {
    fn bit(self) -> u32 {
        match self {
            PropertyScope::Packet(packet_type) => 1 << packet_type as u8,
            PropertyScope::Will => 1 << 16,
            PropertyScope::Proxy => 1 << 17,
        }
    }

    fn packet_type(self) -> PacketType {
        match self {
            PropertyScope::Packet(packet_type) => packet_type,
            _ => PacketType::Connect,
        }
    }
}

const CONNECT: u32 = 1 << PacketType::Connect as u8 | PROXY;
const CONNACK: u32 = 1 << PacketType::ConnAck as u8;
const PUBLISH: u32 = 1 << PacketType::Publish as u8;
const PUBACK: u32 = 1 << PacketType::PubAck as u8;
const PUBREC: u32 = 1 << PacketType::PubRec as u8;
const PUBREL: u32 = 1 << PacketType::PubRel as u8;
const PUBCOMP: u32 = 1 << PacketType::PubComp as u8;
const SUBSCRIBE: u32 = 1 << PacketType::Subscribe as u8;
const SUBACK: u32 = 1 << PacketType::SubAck as u8;
const UNSUBSCRIBE: u32 = 1 << PacketType::Unsubscribe as u8;
const UNSUBACK: u32 = 1 << PacketType::UnsubAck as u8;
const DISCONNECT: u32 = 1 << PacketType::Disconnect as u8;
const AUTH: u32 = 1 << PacketType::Auth as u8;
const WILL: u32 = 1 << 16;
const PROXY: u32 = 1 << 17;

/// 属性值的编码类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    String,
    Binary,
    StringPair,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
    /// 代理转发的客户端地址
    ClientAddress = 0x80,
    /// 代理校验过的证书名
    CertificateName = 0x81,
    /// 租户
    Domain = 0x82,
    MaxConnections = 0x83,
}

impl PropertyId {
    fn value_type(self) -> ValueType {
        use PropertyId::*;
        match self {
            PayloadFormatIndicator
            | RequestProblemInformation
            | RequestResponseInformation
            | MaximumQoS
            | RetainAvailable
            | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => ValueType::Byte,
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => ValueType::TwoByte,
            MessageExpiryInterval
            | SessionExpiryInterval
            | WillDelayInterval
            | MaximumPacketSize
            | MaxConnections => ValueType::FourByte,
            SubscriptionIdentifier => ValueType::VarInt,
            ContentType | ResponseTopic | AssignedClientIdentifier | AuthenticationMethod
            | ResponseInformation | ServerReference | ReasonString | ClientAddress
            | CertificateName | Domain => ValueType::String,
            CorrelationData | AuthenticationData => ValueType::Binary,
            UserProperty => ValueType::StringPair,
        }
    }

    fn allowed(self) -> u32 {
        use PropertyId::*;
        match self {
            PayloadFormatIndicator | MessageExpiryInterval | ContentType | ResponseTopic
            | CorrelationData => PUBLISH | WILL,
            SubscriptionIdentifier => PUBLISH | SUBSCRIBE,
            SessionExpiryInterval => CONNECT | CONNACK | DISCONNECT,
            AssignedClientIdentifier | ServerKeepAlive | ResponseInformation | MaximumQoS
            | RetainAvailable | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable | SharedSubscriptionAvailable => CONNACK,
            AuthenticationMethod | AuthenticationData => CONNECT | CONNACK | AUTH,
            RequestProblemInformation | RequestResponseInformation => CONNECT,
            WillDelayInterval => WILL,
            ServerReference => CONNACK | DISCONNECT,
            ReasonString => {
                CONNACK | PUBACK | PUBREC | PUBREL | PUBCOMP | SUBACK | UNSUBACK | DISCONNECT | AUTH
            }
            ReceiveMaximum | TopicAliasMaximum | MaximumPacketSize => CONNECT | CONNACK,
            TopicAlias => PUBLISH,
            UserProperty => {
                CONNECT
                    | CONNACK
                    | PUBLISH
                    | WILL
                    | PUBACK
                    | PUBREC
                    | PUBREL
                    | PUBCOMP
                    | SUBSCRIBE
                    | SUBACK
                    | UNSUBSCRIBE
                    | UNSUBACK
                    | DISCONNECT
                    | AUTH
            }
            ClientAddress | CertificateName | Domain | MaxConnections => PROXY,
        }
    }

    pub fn allowed_in(self, scope: PropertyScope) -> bool {
        self.allowed() & scope.bit() != 0
    }
}

impl TryFrom<u8> for PropertyId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use PropertyId::*;
        let id = match value {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQoS,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            0x80 => ClientAddress,
            0x81 => CertificateName,
            0x82 => Domain,
            0x83 => MaxConnections,
            n => return Err(Error::InvalidPropertyType(n)),
        };
        Ok(id)
    }
}

/// 解码出的属性值
enum Value {
    Int(u32),
    String(String),
    Binary(Bytes),
    Pair(String, String),
}

/// 所有已知属性的集合，未出现的属性为 None
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
    pub client_address: Option<String>,
    pub certificate_name: Option<String>,
    pub domain: Option<String>,
    pub max_connections: Option<u32>,
}

fn set<T>(slot: &mut Option<T>, value: T, id: PropertyId) -> Result<(), Error> {
    if slot.is_some() {
        return Err(Error::DuplicateProperty(id));
    }
    *slot = Some(value);
    Ok(())
}

/// 取值只能是 0 或 1 的属性
fn flag(value: u32, id: PropertyId) -> Result<u8, Error> {
    if value > 1 {
        return Err(Error::InvalidPropertyValue(id));
    }
    Ok(value as u8)
}

fn non_zero(value: u32, id: PropertyId) -> Result<u32, Error> {
    if value == 0 {
        return Err(Error::InvalidPropertyValue(id));
    }
    Ok(value)
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    /// 读取属性块（包括前面的长度字段）
    pub fn read(stream: &mut Bytes, scope: PropertyScope) -> Result<Self, Error> {
        let len = read_varint(stream)?;
        if len > stream.len() {
            return Err(Error::MalformedPacket);
        }

        let mut block = stream.split_to(len);
        let mut properties = Properties::default();
        while !block.is_empty() {
            let raw = read_varint(&mut block)?;
            let id = u8::try_from(raw)
                .map_err(|_| Error::InvalidPropertyType(0xFF))
                .and_then(PropertyId::try_from)?;
            if !id.allowed_in(scope) {
                return Err(Error::PropertyNotAllowed(id, scope.packet_type()));
            }

            let value = match id.value_type() {
                ValueType::Byte => Value::Int(read_u8(&mut block)? as u32),
                ValueType::TwoByte => Value::Int(read_u16(&mut block)? as u32),
                ValueType::FourByte => Value::Int(read_u32(&mut block)?),
                ValueType::VarInt => Value::Int(read_varint(&mut block)? as u32),
                ValueType::String => Value::String(read_string(&mut block)?),
                ValueType::Binary => Value::Binary(read_bytes(&mut block)?),
                ValueType::StringPair => {
                    let key = read_string(&mut block)?;
                    let value = read_string(&mut block)?;
                    Value::Pair(key, value)
                }
            };
            properties.assign(id, value, scope)?;
        }

        Ok(properties)
    }

    fn assign(&mut self, id: PropertyId, value: Value, scope: PropertyScope) -> Result<(), Error> {
        use PropertyId::*;
        match value {
            Value::Int(v) => match id {
                PayloadFormatIndicator => {
                    set(&mut self.payload_format_indicator, flag(v, id)?, id)
                }
                MessageExpiryInterval => set(&mut self.message_expiry_interval, v, id),
                SubscriptionIdentifier => {
                    // 只有服务端下发的 PUBLISH 可以携带多个订阅标识符
                    if scope != PropertyScope::Packet(PacketType::Publish)
                        && !self.subscription_identifiers.is_empty()
                    {
                        return Err(Error::DuplicateProperty(id));
                    }
                    self.subscription_identifiers.push(non_zero(v, id)?);
                    Ok(())
                }
                SessionExpiryInterval => set(&mut self.session_expiry_interval, v, id),
                ServerKeepAlive => set(&mut self.server_keep_alive, v as u16, id),
                RequestProblemInformation => {
                    set(&mut self.request_problem_information, flag(v, id)?, id)
                }
                WillDelayInterval => set(&mut self.will_delay_interval, v, id),
                RequestResponseInformation => {
                    set(&mut self.request_response_information, flag(v, id)?, id)
                }
                ReceiveMaximum => set(&mut self.receive_maximum, non_zero(v, id)? as u16, id),
                TopicAliasMaximum => set(&mut self.topic_alias_maximum, v as u16, id),
                TopicAlias => set(&mut self.topic_alias, non_zero(v, id)? as u16, id),
                MaximumQoS => set(&mut self.maximum_qos, flag(v, id)?, id),
                RetainAvailable => set(&mut self.retain_available, flag(v, id)?, id),
                MaximumPacketSize => set(&mut self.maximum_packet_size, non_zero(v, id)?, id),
                WildcardSubscriptionAvailable => {
                    set(&mut self.wildcard_subscription_available, flag(v, id)?, id)
                }
                SubscriptionIdentifierAvailable => {
                    set(&mut self.subscription_identifier_available, flag(v, id)?, id)
                }
                SharedSubscriptionAvailable => {
                    set(&mut self.shared_subscription_available, flag(v, id)?, id)
                }
                MaxConnections => set(&mut self.max_connections, v, id),
                _ => Err(Error::InvalidPropertyValue(id)),
            },
            Value::String(s) => match id {
                ContentType => set(&mut self.content_type, s, id),
                ResponseTopic => set(&mut self.response_topic, s, id),
                AssignedClientIdentifier => set(&mut self.assigned_client_identifier, s, id),
                AuthenticationMethod => set(&mut self.authentication_method, s, id),
                ResponseInformation => set(&mut self.response_information, s, id),
                ServerReference => set(&mut self.server_reference, s, id),
                ReasonString => set(&mut self.reason_string, s, id),
                ClientAddress => set(&mut self.client_address, s, id),
                CertificateName => set(&mut self.certificate_name, s, id),
                Domain => set(&mut self.domain, s, id),
                _ => Err(Error::InvalidPropertyValue(id)),
            },
            Value::Binary(b) => match id {
                CorrelationData => set(&mut self.correlation_data, b, id),
                AuthenticationData => set(&mut self.authentication_data, b, id),
                _ => Err(Error::InvalidPropertyValue(id)),
            },
            Value::Pair(key, value) => {
                self.user_properties.push((key, value));
                Ok(())
            }
        }
    }

    /// 写入属性块（包括前面的长度字段）
    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        use PropertyId::*;

        let mut body = BytesMut::new();
        let byte = |body: &mut BytesMut, id: PropertyId, v: Option<u8>| {
            if let Some(v) = v {
                body.put_u8(id as u8);
                body.put_u8(v);
            }
        };
        let two = |body: &mut BytesMut, id: PropertyId, v: Option<u16>| {
            if let Some(v) = v {
                body.put_u8(id as u8);
                body.put_u16(v);
            }
        };
        let four = |body: &mut BytesMut, id: PropertyId, v: Option<u32>| {
            if let Some(v) = v {
                body.put_u8(id as u8);
                body.put_u32(v);
            }
        };
        let string = |body: &mut BytesMut, id: PropertyId, v: &Option<String>| {
            if let Some(v) = v {
                body.put_u8(id as u8);
                write_string(body, v);
            }
        };
        let binary = |body: &mut BytesMut, id: PropertyId, v: &Option<Bytes>| {
            if let Some(v) = v {
                body.put_u8(id as u8);
                write_bytes(body, v);
            }
        };

        byte(&mut body, PayloadFormatIndicator, self.payload_format_indicator);
        four(&mut body, MessageExpiryInterval, self.message_expiry_interval);
        string(&mut body, ContentType, &self.content_type);
        string(&mut body, ResponseTopic, &self.response_topic);
        binary(&mut body, CorrelationData, &self.correlation_data);
        for id in &self.subscription_identifiers {
            body.put_u8(SubscriptionIdentifier as u8);
            write_remaining_length(&mut body, *id as usize)?;
        }
        four(&mut body, SessionExpiryInterval, self.session_expiry_interval);
        string(&mut body, AssignedClientIdentifier, &self.assigned_client_identifier);
        two(&mut body, ServerKeepAlive, self.server_keep_alive);
        string(&mut body, AuthenticationMethod, &self.authentication_method);
        binary(&mut body, AuthenticationData, &self.authentication_data);
        byte(&mut body, RequestProblemInformation, self.request_problem_information);
        four(&mut body, WillDelayInterval, self.will_delay_interval);
        byte(&mut body, RequestResponseInformation, self.request_response_information);
        string(&mut body, ResponseInformation, &self.response_information);
        string(&mut body, ServerReference, &self.server_reference);
        string(&mut body, ReasonString, &self.reason_string);
        two(&mut body, ReceiveMaximum, self.receive_maximum);
        two(&mut body, TopicAliasMaximum, self.topic_alias_maximum);
        two(&mut body, TopicAlias, self.topic_alias);
        byte(&mut body, MaximumQoS, self.maximum_qos);
        byte(&mut body, RetainAvailable, self.retain_available);
        for (key, value) in &self.user_properties {
            body.put_u8(UserProperty as u8);
            write_string(&mut body, key);
            write_string(&mut body, value);
        }
        four(&mut body, MaximumPacketSize, self.maximum_packet_size);
        byte(&mut body, WildcardSubscriptionAvailable, self.wildcard_subscription_available);
        byte(&mut body, SubscriptionIdentifierAvailable, self.subscription_identifier_available);
        byte(&mut body, SharedSubscriptionAvailable, self.shared_subscription_available);
        string(&mut body, ClientAddress, &self.client_address);
        string(&mut body, CertificateName, &self.certificate_name);
        string(&mut body, Domain, &self.domain);
        four(&mut body, MaxConnections, self.max_connections);

        write_remaining_length(stream, body.len())?;
        stream.extend_from_slice(&body);
        Ok(())
    }
}
