use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{
    read_string_with, read_u16, write_frame, write_string, Error, PacketType, Properties,
    Protocol, QoS, StrError, Utf8Rules,
};

/// 发布消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// v5 使用主题别名时可以为空
    pub topic: String,
    /// QoS 0 时为 0
    pub packet_id: u16,
    pub properties: Properties,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: 0,
            properties: Properties::default(),
            payload: payload.into(),
        }
    }

    pub(crate) fn read(flags: u8, stream: &mut Bytes, protocol: Protocol) -> Result<Self, Error> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;

        let topic = read_string_with(stream, Utf8Rules::PUBLISH_TOPIC, StrError::into_topic)?;
        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            _ => match read_u16(stream)? {
                0 => return Err(Error::MissPacketId),
                id => id,
            },
        };
        let properties = if protocol == Protocol::V5 {
            Properties::read(stream, PropertyScope::Packet(PacketType::Publish))?
        } else {
            Properties::default()
        };
        let payload = stream.split_to(stream.len());

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            payload,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut, protocol: Protocol) -> Result<(), Error> {
        let mut byte1 = 0x30 | (self.qos as u8) << 1;
        if self.dup {
            byte1 |= 0x08;
        }
        if self.retain {
            byte1 |= 0x01;
        }

        let mut body = BytesMut::with_capacity(self.topic.len() + self.payload.len() + 8);
        write_string(&mut body, &self.topic);
        if self.qos != QoS::AtMostOnce {
            body.put_u16(self.packet_id);
        }
        if protocol == Protocol::V5 {
            self.properties.write(&mut body)?;
        }
        body.extend_from_slice(&self.payload);
        write_frame(stream, byte1, &body)
    }
}
