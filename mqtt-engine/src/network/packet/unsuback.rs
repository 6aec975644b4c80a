use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{read_u16, read_u8, write_frame, Error, PacketType, Properties, Protocol, ReasonCode};

/// 取消订阅确认
/// 低版本协议只有报文 id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub reasons: Vec<ReasonCode>,
    pub properties: Properties,
}

impl UnsubAck {
    pub fn new(packet_id: u16, reasons: Vec<ReasonCode>) -> Self {
        Self {
            packet_id,
            reasons,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(stream: &mut Bytes, protocol: Protocol) -> Result<Self, Error> {
        let packet_id = read_u16(stream)?;
        let mut unsuback = Self::new(packet_id, Vec::new());
        if protocol == Protocol::V5 {
            unsuback.properties =
                Properties::read(stream, PropertyScope::Packet(PacketType::UnsubAck))?;
            while !stream.is_empty() {
                let code = ReasonCode::read(read_u8(stream)?, PacketType::UnsubAck)?;
                unsuback.reasons.push(code);
            }
        }
        Ok(unsuback)
    }

    pub(crate) fn write(&self, stream: &mut BytesMut, protocol: Protocol) -> Result<(), Error> {
        let mut body = BytesMut::new();
        body.put_u16(self.packet_id);
        if protocol == Protocol::V5 {
            self.properties.write(&mut body)?;
            for reason in &self.reasons {
                body.put_u8(*reason as u8);
            }
        }
        write_frame(stream, 0xB0, &body)
    }
}
