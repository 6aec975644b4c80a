use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{read_u8, write_frame, Error, PacketType, Properties, Protocol, ReasonCode};

/// 断开连接
/// 低版本协议没有报文体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: ReasonCode,
    pub properties: Properties,
}

impl Disconnect {
    pub fn new(reason: ReasonCode) -> Self {
        Self {
            reason,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(stream: &mut Bytes, protocol: Protocol) -> Result<Self, Error> {
        let mut disconnect = Self::new(ReasonCode::Success);
        if protocol == Protocol::V5 && !stream.is_empty() {
            disconnect.reason = ReasonCode::read(read_u8(stream)?, PacketType::Disconnect)?;
            if !stream.is_empty() {
                disconnect.properties =
                    Properties::read(stream, PropertyScope::Packet(PacketType::Disconnect))?;
            }
        }
        Ok(disconnect)
    }

    pub(crate) fn write(&self, stream: &mut BytesMut, protocol: Protocol) -> Result<(), Error> {
        let mut body = BytesMut::new();
        if protocol == Protocol::V5
            && (self.reason != ReasonCode::Success || !self.properties.is_empty())
        {
            body.put_u8(self.reason as u8);
            if !self.properties.is_empty() {
                self.properties.write(&mut body)?;
            }
        }
        write_frame(stream, 0xE0, &body)
    }
}

#[cfg(test)]
mod tests {
    use crate::network::packet::{Packet, ReadOptions};

    use super::*;

    #[test]
    fn disconnect_forms() {
        let normal = Packet::Disconnect(Disconnect::new(ReasonCode::Success));
        assert_eq!(&normal.to_bytes(Protocol::V5).unwrap()[..], &[0xE0, 0x00]);

        let mut taken = Disconnect::new(ReasonCode::SessionTakenOver);
        taken.properties.reason_string = Some("taken over".into());
        let packet = Packet::Disconnect(taken);
        assert_eq!(&packet.to_bytes(Protocol::V4).unwrap()[..], &[0xE0, 0x00]);

        let bytes = packet.to_bytes(Protocol::V5).unwrap();
        let options = ReadOptions {
            protocol: Protocol::V5,
            ..Default::default()
        };
        let decoded = Packet::read_from(&mut BytesMut::from(&bytes[..]), &options).unwrap();
        assert_eq!(decoded, packet);
    }
}
