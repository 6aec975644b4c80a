use bytes::{BufMut, Bytes, BytesMut};

use super::properties::PropertyScope;
use super::{read_u8, write_frame, Error, PacketType, Properties, Protocol, ReasonCode};

/// 连接确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    /// v5 原因码，低版本协议编码时转换为对应的返回码
    pub code: ReasonCode,
    pub properties: Properties,
}

impl ConnAck {
    pub fn new(code: ReasonCode, session_present: bool) -> Self {
        Self {
            // If a server sends a CONNACK packet containing a non-zero return code it MUST set Session Present to 0 [MQTT-3.2.2-4].
            session_present: session_present && !code.is_failure(),
            code,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(stream: &mut Bytes, protocol: Protocol) -> Result<Self, Error> {
        let flags = read_u8(stream)?;
        if flags & 0xFE != 0 {
            return Err(Error::IncorrectPacketFormat);
        }
        let code = read_u8(stream)?;
        let (code, properties) = if protocol == Protocol::V5 {
            (
                ReasonCode::read(code, PacketType::ConnAck)?,
                Properties::read(stream, PropertyScope::Packet(PacketType::ConnAck))?,
            )
        } else {
            (
                ReasonCode::from_connect_return_code(code)?,
                Properties::default(),
            )
        };

        Ok(Self {
            session_present: flags & 0x01 != 0,
            code,
            properties,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut, protocol: Protocol) -> Result<(), Error> {
        let mut body = BytesMut::new();
        body.put_u8(self.session_present as u8);
        if protocol == Protocol::V5 {
            body.put_u8(self.code as u8);
            self.properties.write(&mut body)?;
        } else {
            body.put_u8(self.code.connect_return_code());
        }
        write_frame(stream, 0x20, &body)
    }
}
