use bytes::{BufMut, Bytes, BytesMut};

use super::{
    read_bytes, read_string, read_string_with, read_u16, read_u8, write_bytes,
    write_frame, write_string, Error, PacketType, Properties, Protocol, QoS, ReasonCode,
    StrError, Utf8Rules,
};
use super::properties::PropertyScope;

/// 协议级别中的桥接标志位
const BRIDGE_BIT: u8 = 0x80;
/// 协议级别中的代理扩展标志位
const PROXY_BIT: u8 = 0x40;

/// 连接报文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// 协议版本
    pub protocol: Protocol,
    /// 是否是桥接连接
    pub bridge: bool,
    /// 代理扩展标志，None 表示普通连接
    pub proxy: Option<ProxyFlags>,
    /// 连接保活时长（秒）
    pub keep_alive: u16,
    /// 客户端 id
    pub client_id: String,
    /// v3.1.1 的 clean session / v5 的 clean start
    pub clean_start: bool,
    /// v5 属性，或者代理扩展的带外属性
    pub properties: Properties,
    /// 遗嘱消息
    pub last_will: Option<LastWill>,
    /// 用户名密码
    pub login: Option<Login>,
}

/// 代理扩展的连接标志字节
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyFlags(pub u8);

impl ProxyFlags {
    /// 代理已经完成认证
    pub const AUTHENTICATED: u8 = 0x01;
    /// 后面跟随带外属性块
    pub const PROPERTIES: u8 = 0x02;

    pub fn authenticated(&self) -> bool {
        self.0 & Self::AUTHENTICATED != 0
    }

    pub fn has_properties(&self) -> bool {
        self.0 & Self::PROPERTIES != 0
    }
}

/// 遗嘱消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// 用户名密码
/// v5 允许只有密码没有用户名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub(crate) fn read(stream: &mut Bytes) -> Result<Self, Error> {
        // 协议名和版本
        let name = read_string(stream)?;
        let level = read_u8(stream)?;
        let bridge = level & BRIDGE_BIT != 0;
        let is_proxy = level & PROXY_BIT != 0;
        let protocol = match (name.as_str(), level & !(BRIDGE_BIT | PROXY_BIT)) {
            ("MQIsdp", 3) => Protocol::V3,
            ("MQTT", 4) => Protocol::V4,
            ("MQTT", 5) => Protocol::V5,
            ("MQIsdp", _) | ("MQTT", _) => {
                return Err(Error::ConnectRefused {
                    protocol: Protocol::V4,
                    code: ReasonCode::UnsupportedProtocolVersion,
                    detail: format!("protocol level {}", level),
                })
            }
            _ => return Err(Error::InvalidProtocol(name)),
        };

        let connect_flags = read_u8(stream)?;
        // 保留位必须为 0
        if connect_flags & 0x01 != 0 {
            return Err(Error::IncorrectPacketFormat);
        }
        let clean_start = connect_flags & 0b10 != 0;
        let will_flag = connect_flags & 0b100 != 0;
        let will_qos = (connect_flags & 0b11000) >> 3;
        let will_retain = connect_flags & 0b0010_0000 != 0;
        let password_flag = connect_flags & 0b0100_0000 != 0;
        let username_flag = connect_flags & 0b1000_0000 != 0;
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(Error::IncorrectPacketFormat);
        }
        let will_qos = QoS::try_from(will_qos)?;
        if password_flag && !username_flag && protocol != Protocol::V5 {
            return Err(Error::UsernameRequired);
        }

        let proxy = if is_proxy {
            Some(ProxyFlags(read_u8(stream)?))
        } else {
            None
        };
        let keep_alive = read_u16(stream)?;

        let properties = match proxy {
            Some(flags) if flags.has_properties() => {
                Properties::read(stream, PropertyScope::Proxy)?
            }
            _ if protocol == Protocol::V5 => {
                Properties::read(stream, PropertyScope::Packet(PacketType::Connect))?
            }
            _ => Properties::default(),
        };

        let client_id = read_string_with(stream, Utf8Rules::TOPIC, |e| {
            let id = match e {
                StrError::Invalid(s) | StrError::Rejected(s) => s,
            };
            Error::ConnectRefused {
                protocol,
                code: ReasonCode::ClientIdentifierNotValid,
                detail: format!("client id {}", id),
            }
        })?;

        let last_will = if will_flag {
            let properties = if protocol == Protocol::V5 {
                Properties::read(stream, PropertyScope::Will)?
            } else {
                Properties::default()
            };
            let topic = read_string_with(stream, Utf8Rules::PUBLISH_TOPIC, StrError::into_topic)?;
            let message = read_bytes(stream)?;
            Some(LastWill {
                topic,
                message,
                qos: will_qos,
                retain: will_retain,
                properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(read_string(stream)?)
        } else {
            None
        };
        let password = if password_flag {
            Some(read_bytes(stream)?)
        } else {
            None
        };
        let login = if username.is_some() || password.is_some() {
            Some(Login { username, password })
        } else {
            None
        };

        Ok(Self {
            protocol,
            bridge,
            proxy,
            keep_alive,
            client_id,
            clean_start,
            properties,
            last_will,
            login,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        write_string(&mut body, self.protocol.name());
        let mut level = self.protocol.level();
        if self.bridge {
            level |= BRIDGE_BIT;
        }
        if self.proxy.is_some() {
            level |= PROXY_BIT;
        }
        body.put_u8(level);

        let mut connect_flags = 0u8;
        if self.clean_start {
            connect_flags |= 0b10;
        }
        if let Some(will) = &self.last_will {
            connect_flags |= 0b100 | (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0b0010_0000;
            }
        }
        if let Some(login) = &self.login {
            if login.password.is_some() {
                connect_flags |= 0b0100_0000;
            }
            if login.username.is_some() {
                connect_flags |= 0b1000_0000;
            }
        }
        body.put_u8(connect_flags);
        if let Some(flags) = self.proxy {
            body.put_u8(flags.0);
        }
        body.put_u16(self.keep_alive);

        let proxy_properties = self.proxy.map_or(false, |flags| flags.has_properties());
        if proxy_properties || self.protocol == Protocol::V5 {
            self.properties.write(&mut body)?;
        }

        write_string(&mut body, &self.client_id);
        if let Some(will) = &self.last_will {
            if self.protocol == Protocol::V5 {
                will.properties.write(&mut body)?;
            }
            write_string(&mut body, &will.topic);
            write_bytes(&mut body, &will.message);
        }
        if let Some(login) = &self.login {
            if let Some(username) = &login.username {
                write_string(&mut body, username);
            }
            if let Some(password) = &login.password {
                write_bytes(&mut body, password);
            }
        }

        write_frame(stream, 0x10, &body)
    }
}
