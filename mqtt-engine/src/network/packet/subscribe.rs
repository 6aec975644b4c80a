use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{
    read_string_with, read_u16, read_u8, write_frame, write_string, Error, PacketType, Properties,
    Protocol, QoS, StrError, Utf8Rules,
};

/// 订阅报文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
    pub properties: Properties,
}

/// 订阅过滤器以及订阅选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub filter: String,
    pub options: SubscriptionOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    /// 不接收自己发布的消息（v5）
    pub no_local: bool,
    /// 转发时保留原始 retain 标志（v5）
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::OnSubscribe,
        }
    }

    fn read(byte: u8, protocol: Protocol) -> Result<Self, Error> {
        let qos = QoS::try_from(byte & 0x03)?;
        if protocol != Protocol::V5 {
            if byte & 0xFC != 0 {
                return Err(Error::IncorrectPacketFormat);
            }
            return Ok(Self::new(qos));
        }

        if byte & 0xC0 != 0 {
            return Err(Error::IncorrectPacketFormat);
        }
        let retain_handling = match (byte >> 4) & 0x03 {
            0 => RetainHandling::OnSubscribe,
            1 => RetainHandling::OnNewSubscribe,
            2 => RetainHandling::DoNotSend,
            _ => return Err(Error::IncorrectPacketFormat),
        };
        Ok(Self {
            qos,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling,
        })
    }

    fn to_byte(self, protocol: Protocol) -> u8 {
        let mut byte = self.qos as u8;
        if protocol == Protocol::V5 {
            if self.no_local {
                byte |= 0x04;
            }
            if self.retain_as_published {
                byte |= 0x08;
            }
            byte |= (self.retain_handling as u8) << 4;
        }
        byte
    }
}

/// 订阅时如何发送保留消息
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainHandling {
    /// 每次订阅都发送
    OnSubscribe = 0,
    /// 只有新建订阅时发送
    OnNewSubscribe = 1,
    /// 不发送
    DoNotSend = 2,
}

impl Subscribe {
    pub(crate) fn read(stream: &mut Bytes, protocol: Protocol) -> Result<Self, Error> {
        let packet_id = read_u16(stream)?;
        if packet_id == 0 {
            return Err(Error::MissPacketId);
        }
        let properties = if protocol == Protocol::V5 {
            Properties::read(stream, PropertyScope::Packet(PacketType::Subscribe))?
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while !stream.is_empty() {
            let filter = read_string_with(stream, Utf8Rules::TOPIC, StrError::into_topic)?;
            let options = SubscriptionOptions::read(read_u8(stream)?, protocol)?;
            filters.push(SubscribeFilter { filter, options });
        }

        // 至少包含一个订阅 [MQTT-3.8.3-3]
        if filters.is_empty() {
            return Err(Error::EmptyTopicList);
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut, protocol: Protocol) -> Result<(), Error> {
        let mut body = BytesMut::new();
        body.put_u16(self.packet_id);
        if protocol == Protocol::V5 {
            self.properties.write(&mut body)?;
        }
        for filter in &self.filters {
            write_string(&mut body, &filter.filter);
            body.put_u8(filter.options.to_byte(protocol));
        }
        write_frame(stream, 0x82, &body)
    }
}
