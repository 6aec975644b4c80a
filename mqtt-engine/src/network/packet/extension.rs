//! 代理扩展报文
//!
//! 使用保留的报文类型 0，低 4 位是子命令。只有代理连接可以收发。

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    read_string, read_string_with, read_u16, read_u8, write_frame, Error, QoS, StrError,
    Utf8Rules,
};

const ACL: u8 = 0x01;
const SUBSCRIPTION_LIST: u8 = 0x02;
const GETX: u8 = 0x03;

/// 订阅列表中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub name: String,
    pub filter: String,
    pub qos: QoS,
}

/// 单条消息获取结果，负载占据报文剩余部分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// 代理下发的访问控制列表
    Acl(Vec<String>),
    /// 查询当前连接的订阅
    ListSubscriptions { request_id: u16 },
    SubscriptionList {
        request_id: u16,
        subscriptions: Vec<SubscriptionEntry>,
    },
    /// 从指定订阅中取出一条消息
    Get { request_id: u16, name: String },
    GetReply {
        request_id: u16,
        message: Option<FetchedMessage>,
    },
}

impl Extension {
    /// 解码代理发来的请求
    pub(crate) fn read(command: u8, stream: &mut Bytes) -> Result<Self, Error> {
        match command {
            ACL => {
                let count = read_u16(stream)?;
                let mut filters = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    filters.push(read_string_with(
                        stream,
                        Utf8Rules::TOPIC,
                        StrError::into_topic,
                    )?);
                }
                Ok(Extension::Acl(filters))
            }
            SUBSCRIPTION_LIST => Ok(Extension::ListSubscriptions {
                request_id: read_u16(stream)?,
            }),
            GETX => {
                let request_id = read_u16(stream)?;
                let name = read_string(stream)?;
                Ok(Extension::Get { request_id, name })
            }
            _ => Err(Error::IncorrectPacketFormat),
        }
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        let command = match self {
            Extension::Acl(filters) => {
                body.put_u16(count(filters.len())?);
                for filter in filters {
                    write_string(&mut body, filter)?;
                }
                ACL
            }
            Extension::ListSubscriptions { request_id } => {
                body.put_u16(*request_id);
                SUBSCRIPTION_LIST
            }
            Extension::SubscriptionList {
                request_id,
                subscriptions,
            } => {
                body.put_u16(*request_id);
                body.put_u16(count(subscriptions.len())?);
                for entry in subscriptions {
                    write_string(&mut body, &entry.name)?;
                    write_string(&mut body, &entry.filter)?;
                    body.put_u8(entry.qos as u8);
                }
                SUBSCRIPTION_LIST
            }
            Extension::Get { request_id, name } => {
                body.put_u16(*request_id);
                write_string(&mut body, name)?;
                GETX
            }
            Extension::GetReply {
                request_id,
                message,
            } => {
                body.put_u16(*request_id);
                match message {
                    Some(message) => {
                        body.put_u8(1);
                        write_string(&mut body, &message.topic)?;
                        body.put_u8(message.qos as u8);
                        body.extend_from_slice(&message.payload);
                    }
                    None => body.put_u8(0),
                }
                GETX
            }
        };
        write_frame(stream, command, &body)
    }

    /// 解码服务端的应答，供代理端使用
    pub fn read_reply(command: u8, mut stream: Bytes) -> Result<Self, Error> {
        match command {
            SUBSCRIPTION_LIST => {
                let request_id = read_u16(&mut stream)?;
                let count = read_u16(&mut stream)?;
                let mut subscriptions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = read_string(&mut stream)?;
                    let filter = read_string(&mut stream)?;
                    let qos = QoS::try_from(read_u8(&mut stream)?)?;
                    subscriptions.push(SubscriptionEntry { name, filter, qos });
                }
                Ok(Extension::SubscriptionList {
                    request_id,
                    subscriptions,
                })
            }
            GETX => {
                let request_id = read_u16(&mut stream)?;
                let message = match read_u8(&mut stream)? {
                    0 => None,
                    _ => {
                        let topic = read_string(&mut stream)?;
                        let qos = QoS::try_from(read_u8(&mut stream)?)?;
                        let payload = stream.split_off(0);
                        Some(FetchedMessage {
                            topic,
                            qos,
                            payload,
                        })
                    }
                };
                Ok(Extension::GetReply {
                    request_id,
                    message,
                })
            }
            _ => Err(Error::IncorrectPacketFormat),
        }
    }
}

/// 列表长度超过 u16 时报错，不截断
fn count(len: usize) -> Result<u16, Error> {
    u16::try_from(len).map_err(|_| Error::PayloadTooLarge)
}

fn write_string(stream: &mut BytesMut, string: &str) -> Result<(), Error> {
    stream.put_u16(count(string.len())?);
    stream.extend_from_slice(string.as_bytes());
    Ok(())
}
