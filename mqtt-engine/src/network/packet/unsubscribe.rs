use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{
    read_string_with, read_u16, write_frame, write_string, Error, PacketType, Properties,
    Protocol, StrError, Utf8Rules,
};

/// 取消订阅报文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl Unsubscribe {
    pub(crate) fn read(stream: &mut Bytes, protocol: Protocol) -> Result<Self, Error> {
        let packet_id = read_u16(stream)?;
        if packet_id == 0 {
            return Err(Error::MissPacketId);
        }
        let properties = if protocol == Protocol::V5 {
            Properties::read(stream, PropertyScope::Packet(PacketType::Unsubscribe))?
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while !stream.is_empty() {
            filters.push(read_string_with(
                stream,
                Utf8Rules::TOPIC,
                StrError::into_topic,
            )?);
        }
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
            write_string(&mut body, filter);
        }
        write_frame(stream, 0xA2, &body)
    }
}
