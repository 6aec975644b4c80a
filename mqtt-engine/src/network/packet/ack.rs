use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{read_u16, read_u8, write_frame, Error, PacketType, Properties, Protocol, ReasonCode};

/// PUBACK / PUBREC / PUBREL / PUBCOMP 共用的报文体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub packet_id: u16,
    pub reason: ReasonCode,
    pub properties: Properties,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self::with_reason(packet_id, ReasonCode::Success)
    }

    pub fn with_reason(packet_id: u16, reason: ReasonCode) -> Self {
        Self {
            packet_id,
            reason,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(
        packet_type: PacketType,
        stream: &mut Bytes,
        protocol: Protocol,
    ) -> Result<Self, Error> {
        let packet_id = read_u16(stream)?;
        if packet_id == 0 {
            return Err(Error::MissPacketId);
        }

        // v5 剩余长度为 2 时原因码为 0，且没有属性
        let mut ack = Self::new(packet_id);
        if protocol == Protocol::V5 && !stream.is_empty() {
            ack.reason = ReasonCode::read(read_u8(stream)?, packet_type)?;
            if !stream.is_empty() {
                ack.properties = Properties::read(stream, PropertyScope::Packet(packet_type))?;
            }
        }

        Ok(ack)
    }

    pub(crate) fn write(
        &self,
        packet_type: PacketType,
        stream: &mut BytesMut,
        protocol: Protocol,
    ) -> Result<(), Error> {
        let byte1 = match packet_type {
            PacketType::PubRel => 0x62,
            t => (t as u8) << 4,
        };

        let mut body = BytesMut::new();
        body.put_u16(self.packet_id);
        if protocol == Protocol::V5 {
            if !self.properties.is_empty() {
                body.put_u8(self.reason as u8);
                self.properties.write(&mut body)?;
            } else if self.reason != ReasonCode::Success {
                body.put_u8(self.reason as u8);
            }
        }
        write_frame(stream, byte1, &body)
    }
}
