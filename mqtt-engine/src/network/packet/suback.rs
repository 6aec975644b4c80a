use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{read_u16, read_u8, write_frame, Error, PacketType, Properties, Protocol, ReasonCode};

/// 订阅确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// 每个订阅对应一个结果
    pub return_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl SubAck {
    pub fn new(packet_id: u16, return_codes: Vec<ReasonCode>) -> Self {
        Self {
            packet_id,
            return_codes,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(stream: &mut Bytes, protocol: Protocol) -> Result<Self, Error> {
        let packet_id = read_u16(stream)?;
        let properties = if protocol == Protocol::V5 {
            Properties::read(stream, PropertyScope::Packet(PacketType::SubAck))?
        } else {
            Properties::default()
        };

        let mut return_codes = Vec::with_capacity(stream.len());
        while !stream.is_empty() {
            let code = read_u8(stream)?;
            let code = match (protocol, code) {
                (Protocol::V5, code) => ReasonCode::read(code, PacketType::SubAck)?,
                (_, 0x80) => ReasonCode::UnspecifiedError,
                (_, 0..=2) => ReasonCode::read(code, PacketType::SubAck)?,
                (_, code) => return Err(Error::InvalidReasonCode(code, PacketType::SubAck)),
            };
            return_codes.push(code);
        }

        Ok(Self {
            packet_id,
            return_codes,
            properties,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut, protocol: Protocol) -> Result<(), Error> {
        let mut body = BytesMut::new();
        body.put_u16(self.packet_id);
        if protocol == Protocol::V5 {
            self.properties.write(&mut body)?;
        }
        for code in &self.return_codes {
            let code = match protocol {
                Protocol::V5 => *code as u8,
                // 低版本协议只有一个失败码
                _ if code.is_failure() => 0x80,
                _ => *code as u8,
            };
            body.put_u8(code);
        }
        write_frame(stream, 0x90, &body)
    }
}
