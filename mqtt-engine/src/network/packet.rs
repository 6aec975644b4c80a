//! mqtt 报文编解码
//!
//! 同时覆盖 3.1 / 3.1.1 / 5 三个协议版本，以及代理扩展报文。
//! 所有解码函数都在一个完整的帧上工作，解码出错时立即返回，不会继续解析同一个报文的剩余部分。

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use ack::Ack;
pub use connack::ConnAck;
pub use connect::{Connect, LastWill, Login, ProxyFlags};
pub use disconnect::Disconnect;
pub use extension::{Extension, FetchedMessage, SubscriptionEntry};
pub use properties::{Properties, PropertyId, PropertyScope};
pub use publish::Publish;
pub use reason::ReasonCode;
pub use suback::SubAck;
pub use subscribe::{RetainHandling, Subscribe, SubscribeFilter, SubscriptionOptions};
pub use unsuback::UnsubAck;
pub use unsubscribe::Unsubscribe;

mod ack;
mod connack;
mod connect;
mod disconnect;
mod extension;
mod properties;
mod publish;
mod reason;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

pub(crate) const PAYLOAD_MAX_LENGTH: usize = 268_435_455;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Malformed remaining length")]
    MalformedLength,
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Invalid UTF-8 string: {0}")]
    Unicode(String),
    #[error("Topic not valid: {0}")]
    BadTopic(String),
    #[error("System topic not allowed: {0}")]
    BadSysTopic(String),
    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("Reserved bits set in {packet_type:?}: {flags:#x}")]
    ReservedBits { packet_type: PacketType, flags: u8 },
    #[error("Incorrect packet format")]
    IncorrectPacketFormat,
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Packet too large: {0}")]
    PacketTooLarge(usize),
    #[error("Unexpected packet type: {0:?}")]
    UnexpectedPacketType(PacketType),
    #[error("Invalid property type: {0:#x}")]
    InvalidPropertyType(u8),
    #[error("Property {0:?} not allowed in {1:?}")]
    PropertyNotAllowed(PropertyId, PacketType),
    #[error("Duplicate property: {0:?}")]
    DuplicateProperty(PropertyId),
    #[error("Invalid value for property {0:?}")]
    InvalidPropertyValue(PropertyId),
    #[error("Invalid reason code {0:#x} for {1:?}")]
    InvalidReasonCode(u8, PacketType),
    #[error("Miss packet id")]
    MissPacketId,
    #[error("User name required when password is present")]
    UsernameRequired,
    #[error("Empty topic list")]
    EmptyTopicList,
    #[error("Connect refused: {detail}")]
    ConnectRefused {
        protocol: Protocol,
        code: ReasonCode,
        detail: String,
    },
}

/// 协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// v3.1，协议名 MQIsdp
    V3,
    /// v3.1.1
    V4,
    /// v5
    V5,
}

impl Protocol {
    pub fn level(&self) -> u8 {
        match self {
            Protocol::V3 => 3,
            Protocol::V4 => 4,
            Protocol::V5 => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::V3 => "MQIsdp",
            _ => "MQTT",
        }
    }

    pub fn is_v5(&self) -> bool {
        *self == Protocol::V5
    }
}

/// 服务质量
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// 取两者中较低的服务质量
    pub fn downgrade(self, qos: QoS) -> QoS {
        self.min(qos)
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => Err(Error::InvalidQoS(qos)),
        }
    }
}

/// 报文类型，由固定头首字节的高 4 位决定
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// 保留类型，仅代理扩展使用
    Extension = 0,
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
    Auth,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let packet_type = match value {
            0 => PacketType::Extension,
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            15 => PacketType::Auth,
            n => return Err(Error::InvalidPacketType(n)),
        };
        Ok(packet_type)
    }
}

/// 固定头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// 首字节：高 4 位报文类型，低 4 位标志位
    byte1: u8,
    /// 固定头长度（首字节 + 剩余长度字段）
    fixed_header_len: usize,
    /// 剩余长度
    remaining_len: usize,
}

impl FixedHeader {
    /// 检查缓冲区中是否已经有一个完整的帧
    /// 数据不足时返回 InsufficientBytes
    pub fn check(stream: &[u8], max_packet_size: usize) -> Result<Self, Error> {
        if stream.is_empty() {
            return Err(Error::InsufficientBytes(2));
        }

        let byte1 = stream[0];
        let (len_len, remaining_len) = length(&stream[1..])?;
        let header = Self {
            byte1,
            fixed_header_len: 1 + len_len,
            remaining_len,
        };

        let frame_len = header.frame_length();
        if frame_len > max_packet_size {
            return Err(Error::PacketTooLarge(frame_len));
        }
        if stream.len() < frame_len {
            return Err(Error::InsufficientBytes(frame_len - stream.len()));
        }

        Ok(header)
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        PacketType::try_from(self.byte1 >> 4)
    }

    pub fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }

    /// 固定头标志位校验
    fn validate_flags(&self, packet_type: PacketType) -> Result<(), Error> {
        let flags = self.flags();
        let ok = match packet_type {
            PacketType::Publish => {
                let qos = (flags >> 1) & 0x03;
                if qos == 3 {
                    return Err(Error::InvalidQoS(qos));
                }
                // QoS 0 不可以设置 DUP
                !(qos == 0 && flags & 0x08 != 0)
            }
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => flags == 0x02,
            // 扩展报文的低 4 位是子命令
            PacketType::Extension => true,
            _ => flags == 0,
        };

        if ok {
            Ok(())
        } else {
            Err(Error::ReservedBits { packet_type, flags })
        }
    }
}

/// 解码时依赖的连接上下文
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub protocol: Protocol,
    /// 是否允许代理扩展报文
    pub proxy: bool,
    pub max_packet_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::V4,
            proxy: false,
            max_packet_size: PAYLOAD_MAX_LENGTH + 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Extension(Extension),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Extension(_) => PacketType::Extension,
        }
    }

    /// 从缓冲区读取一个完整报文，读取成功的字节会从缓冲区移除
    /// 数据不足时缓冲区保持不变，返回 InsufficientBytes
    pub fn read_from(stream: &mut BytesMut, options: &ReadOptions) -> Result<Self, Error> {
        let header = FixedHeader::check(stream, options.max_packet_size)?;
        let frame = stream.split_to(header.frame_length()).freeze();
        let packet_type = header.packet_type()?;
        header.validate_flags(packet_type)?;

        let mut body = frame.slice(header.fixed_header_len..);
        let protocol = options.protocol;
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(&mut body)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut body, protocol)?),
            PacketType::Publish => {
                Packet::Publish(Publish::read(header.flags(), &mut body, protocol)?)
            }
            PacketType::PubAck => Packet::PubAck(Ack::read(packet_type, &mut body, protocol)?),
            PacketType::PubRec => Packet::PubRec(Ack::read(packet_type, &mut body, protocol)?),
            PacketType::PubRel => Packet::PubRel(Ack::read(packet_type, &mut body, protocol)?),
            PacketType::PubComp => Packet::PubComp(Ack::read(packet_type, &mut body, protocol)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut body, protocol)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&mut body, protocol)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(Unsubscribe::read(&mut body, protocol)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(&mut body, protocol)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect(Disconnect::read(&mut body, protocol)?),
            PacketType::Extension if options.proxy => {
                Packet::Extension(Extension::read(header.flags(), &mut body)?)
            }
            PacketType::Extension => return Err(Error::InvalidPacketType(0)),
            // 不支持增强认证
            PacketType::Auth => return Err(Error::UnexpectedPacketType(packet_type)),
        };

        if !body.is_empty() {
            return Err(Error::IncorrectPacketFormat);
        }

        Ok(packet)
    }

    /// 编码报文，返回写入的字节数
    pub fn write(&self, protocol: Protocol, stream: &mut BytesMut) -> Result<usize, Error> {
        let start = stream.len();
        match self {
            Packet::Connect(connect) => connect.write(stream)?,
            Packet::ConnAck(connack) => connack.write(stream, protocol)?,
            Packet::Publish(publish) => publish.write(stream, protocol)?,
            Packet::PubAck(ack) => ack.write(PacketType::PubAck, stream, protocol)?,
            Packet::PubRec(ack) => ack.write(PacketType::PubRec, stream, protocol)?,
            Packet::PubRel(ack) => ack.write(PacketType::PubRel, stream, protocol)?,
            Packet::PubComp(ack) => ack.write(PacketType::PubComp, stream, protocol)?,
            Packet::Subscribe(subscribe) => subscribe.write(stream, protocol)?,
            Packet::SubAck(suback) => suback.write(stream, protocol)?,
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(stream, protocol)?,
            Packet::UnsubAck(unsuback) => unsuback.write(stream, protocol)?,
            Packet::PingReq => stream.put_slice(&[0xC0, 0x00]),
            Packet::PingResp => stream.put_slice(&[0xD0, 0x00]),
            Packet::Disconnect(disconnect) => disconnect.write(stream, protocol)?,
            Packet::Extension(extension) => extension.write(stream)?,
        }
        Ok(stream.len() - start)
    }

    /// 编码为一个独立的帧
    pub fn to_bytes(&self, protocol: Protocol) -> Result<Bytes, Error> {
        let mut stream = BytesMut::new();
        self.write(protocol, &mut stream)?;
        Ok(stream.freeze())
    }
}

/// 字符串校验规则，按字段传入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8Rules(u8);

impl Utf8Rules {
    /// 只拒绝 U+0000
    pub const BASIC: Self = Self(0x01);
    /// 拒绝 C0、DEL、C1 控制字符
    pub const CONTROL: Self = Self(0x02);
    /// 拒绝 Unicode 非字符
    pub const NONCHAR: Self = Self(0x04);
    /// 拒绝 + 和 #
    pub const WILDCARD: Self = Self(0x08);
    /// 订阅过滤器
    pub const TOPIC: Self = Self(0x07);
    /// 发布主题
    pub const PUBLISH_TOPIC: Self = Self(0x0F);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn rejects(self, c: char) -> bool {
        (self.contains(Self::BASIC) && c == '\0')
            || (self.contains(Self::CONTROL) && is_control(c))
            || (self.contains(Self::NONCHAR) && is_nonchar(c))
            || (self.contains(Self::WILDCARD) && (c == '+' || c == '#'))
    }
}

pub(crate) fn is_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1F}' | '\u{7F}'..='\u{9F}')
}

pub(crate) fn is_nonchar(c: char) -> bool {
    let v = c as u32;
    (0xFDD0..=0xFDEF).contains(&v) || v & 0xFFFE == 0xFFFE
}

/// 字符串是否满足规则
pub fn check_utf8(s: &str, rules: Utf8Rules) -> bool {
    !s.chars().any(|c| rules.rejects(c))
}

/// 用于诊断信息的字符串，非法字节序列和违规字符都替换为 '?'
pub fn sanitize(bytes: &[u8], rules: Utf8Rules) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .map(|c| {
            if c == char::REPLACEMENT_CHARACTER || rules.rejects(c) {
                '?'
            } else {
                c
            }
        })
        .collect()
}

/// 字符串解码失败的原因
#[derive(Debug)]
pub(crate) enum StrError {
    /// 不是合法的 UTF-8
    Invalid(String),
    /// 含有规则禁止的字符
    Rejected(String),
}

impl StrError {
    fn into_unicode(self) -> Error {
        match self {
            StrError::Invalid(s) | StrError::Rejected(s) => Error::Unicode(s),
        }
    }

    pub(crate) fn into_topic(self) -> Error {
        match self {
            StrError::Invalid(s) => Error::Unicode(s),
            StrError::Rejected(s) => Error::BadTopic(s),
        }
    }
}

pub(crate) fn decode_str(bytes: &[u8], rules: Utf8Rules) -> Result<String, StrError> {
    match std::str::from_utf8(bytes) {
        Ok(s) if check_utf8(s, rules) => Ok(s.to_owned()),
        Ok(_) => Err(StrError::Rejected(sanitize(bytes, rules))),
        Err(_) => Err(StrError::Invalid(sanitize(bytes, rules))),
    }
}

/// 解析变长整数，返回 (所占字节数, 值)
/// 超过 4 个字节或者不是最短编码都视为非法
pub(crate) fn length(stream: &[u8]) -> Result<(usize, usize), Error> {
    let mut len: usize = 0;
    let mut shift = 0;

    for (i, byte) in stream.iter().enumerate() {
        let byte = *byte as usize;
        len += (byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            // 多字节编码的最后一个字节为 0，说明可以用更短的编码表示
            if i > 0 && byte == 0 {
                return Err(Error::MalformedLength);
            }
            return Ok((i + 1, len));
        }

        if i == 3 {
            return Err(Error::MalformedLength);
        }
        shift += 7;
    }

    Err(Error::InsufficientBytes(1))
}

/// 变长整数编码后所占字节数
pub(crate) fn len_len(len: usize) -> usize {
    if len >= 2_097_152 {
        4
    } else if len >= 16_384 {
        3
    } else if len >= 128 {
        2
    } else {
        1
    }
}

/// 在完整帧内读取变长整数
fn read_varint(stream: &mut Bytes) -> Result<usize, Error> {
    let (len_len, value) = match length(stream) {
        Ok(v) => v,
        Err(Error::InsufficientBytes(_)) => return Err(Error::MalformedPacket),
        Err(e) => return Err(e),
    };
    stream.advance(len_len);
    Ok(value)
}

/// 读取多个字节
fn read_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    // 后续可取出的字节的长度
    let len = read_u16(stream)? as usize;

    if len > stream.len() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.split_to(len))
}

fn read_string(stream: &mut Bytes) -> Result<String, Error> {
    read_string_with(stream, Utf8Rules::BASIC, StrError::into_unicode)
}

fn read_string_with(
    stream: &mut Bytes,
    rules: Utf8Rules,
    on_error: impl FnOnce(StrError) -> Error,
) -> Result<String, Error> {
    let bytes = read_bytes(stream)?;
    decode_str(&bytes, rules).map_err(on_error)
}

fn read_u32(stream: &mut Bytes) -> Result<u32, Error> {
    if stream.len() < 4 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u32())
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

fn write_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, Error> {
    if len > PAYLOAD_MAX_LENGTH {
        return Err(Error::PayloadTooLarge);
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        stream.put_u8(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

fn write_bytes(stream: &mut BytesMut, bytes: &[u8]) {
    stream.put_u16(bytes.len() as u16);
    stream.extend_from_slice(bytes);
}

fn write_string(stream: &mut BytesMut, string: &str) {
    write_bytes(stream, string.as_bytes())
}

/// 写入固定头和报文体
fn write_frame(stream: &mut BytesMut, byte1: u8, body: &[u8]) -> Result<(), Error> {
    stream.put_u8(byte1);
    write_remaining_length(stream, body.len())?;
    stream.extend_from_slice(body);
    Ok(())
}
