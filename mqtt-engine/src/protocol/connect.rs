//! CONNECT 处理
//!
//! 同步部分校验参数并协商会话，异步部分（认证、创建客户端状态和会话）提交到完成队列，
//! 完成前收到的报文先缓存在 [`Reader`] 中。

use std::sync::{atomic::Ordering, Arc};

use log::{debug, info};
use rand::Rng;

use crate::{
    engine::{ClientRequest, Engine, EngineError, Message, MessageProperties, Will},
    network::{
        packet::{
            ConnAck, Connect, Login, Packet, Properties, Protocol, QoS, ReadOptions, ReasonCode,
        },
        topic,
    },
    AuthResult, ClientInfo, Hook,
};

use super::{
    connection::{Connection, Reader, Reply, State, StealNotice},
    lock,
    session::{Session, SessionParams},
    Error, ReturnCode,
};

/// 生成的 client id 使用的字符
const CLIENT_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const CLIENT_ID_SUFFIX_LEN: usize = 8;
/// 客户端没有指定时的接收上限
const DEFAULT_RECEIVE_MAXIMUM: u16 = 65535;

impl<E: Engine, H: Hook> Connection<E, H> {
    pub(super) fn handle_connect(&self, reader: &mut Reader, connect: Connect) -> Result<(), Error> {
        let mqtt = &self.services.config.mqtt;
        let protocol = connect.protocol;
        let v5 = protocol.is_v5();

        if (connect.bridge && !mqtt.allow_bridge) || (connect.proxy.is_some() && !mqtt.allow_proxy)
        {
            return Err(self.refuse(protocol, ReturnCode::InvalidVersion));
        }

        // client id
        let mut assigned = None;
        let client_id = if connect.client_id.is_empty() {
            if protocol == Protocol::V3 || (protocol == Protocol::V4 && !connect.clean_start) {
                return Err(self.refuse(protocol, ReturnCode::BadIdentifier));
            }
            let generated = generate_client_id(self.transport.client_addr());
            assigned = Some(generated.clone());
            generated
        } else {
            if connect.client_id.len() > mqtt.max_client_id_len
                || connect.client_id.starts_with("__")
            {
                return Err(self.refuse(protocol, ReturnCode::BadIdentifier));
            }
            connect.client_id.clone()
        };

        let proxied = connect.proxy.is_some();
        let props = &connect.properties;
        let client_addr = props
            .client_address
            .clone()
            .filter(|_| proxied)
            .unwrap_or_else(|| self.transport.client_addr().to_owned());

        // 会话过期时间
        let mut requested = if v5 {
            props.session_expiry_interval.unwrap_or(0)
        } else if connect.clean_start {
            0
        } else {
            u32::MAX
        };
        if !mqtt.allow_durable && requested > 0 {
            if !v5 {
                return Err(self.refuse(protocol, ReturnCode::NotAuthorized));
            }
            requested = 0;
        }
        let max_expiry = self.services.config.session.max_expiry_interval;
        let expiry = requested.min(max_expiry);
        let durable = expiry > 0;

        // 遗嘱
        let will = match &connect.last_will {
            Some(last_will) => {
                if last_will.qos != QoS::AtMostOnce && !mqtt.allow_persistent_messages {
                    return Err(self.refuse(protocol, ReturnCode::QoSNotSupported));
                }
                if let Err(e) = topic::valid_publish_topic(&last_will.topic, mqtt.max_topic_levels)
                {
                    return Err(self.refuse(protocol, ReturnCode::from(&e)));
                }
                Some(Will {
                    message: Message {
                        topic: last_will.topic.clone(),
                        qos: last_will.qos,
                        retain: last_will.retain,
                        persistent: last_will.qos != QoS::AtMostOnce,
                        payload: last_will.message.clone(),
                        properties: MessageProperties::from_properties(&last_will.properties),
                        origin: Some(client_id.clone()),
                    },
                    delay: last_will.properties.will_delay_interval.unwrap_or(0),
                })
            }
            None => None,
        };

        // keepalive
        let mut keep_alive = connect.keep_alive;
        let keep_alive_clamped =
            mqtt.max_keepalive > 0 && (keep_alive == 0 || keep_alive > mqtt.max_keepalive);
        if keep_alive_clamped {
            keep_alive = mqtt.max_keepalive;
        }

        // 出站流控
        let receive_maximum = if v5 {
            match props.receive_maximum {
                Some(0) => return Err(self.refuse(protocol, ReturnCode::ProtocolError)),
                Some(max) => max,
                None => DEFAULT_RECEIVE_MAXIMUM,
            }
        } else {
            mqtt.receive_maximum
        };
        let max_packet_size = match props.maximum_packet_size {
            Some(size) if v5 => size as usize,
            _ => usize::MAX,
        };
        let client_alias_maximum = if v5 {
            props.topic_alias_maximum.unwrap_or(0)
        } else {
            0
        };

        let info = ClientInfo {
            client_id: client_id.clone(),
            client_addr,
            protocol,
            domain: props.domain.clone().filter(|_| proxied),
            certificate_name: props.certificate_name.clone().filter(|_| proxied),
            username: connect
                .login
                .as_ref()
                .and_then(|login| login.username.clone()),
        };
        let session = Arc::new(Session::new(SessionParams {
            client_id: client_id.clone(),
            protocol,
            clean_start: connect.clean_start,
            durable,
            expiry,
            keep_alive,
            receive_maximum,
            max_packet_size,
            topic_alias_maximum: if v5 { mqtt.topic_alias_maximum } else { 0 },
            client_alias_maximum,
            request_problem_info: props.request_problem_information != Some(0),
            info,
        }));

        let mut connack = ConnAck::new(ReasonCode::Success, false);
        if v5 {
            let ack = &mut connack.properties;
            ack.receive_maximum = Some(mqtt.receive_maximum);
            ack.maximum_packet_size = Some(mqtt.max_packet_size().min(u32::MAX as usize) as u32);
            ack.topic_alias_maximum = Some(mqtt.topic_alias_maximum);
            ack.retain_available = Some(1);
            ack.wildcard_subscription_available = Some(1);
            ack.subscription_identifier_available = Some(1);
            ack.shared_subscription_available = Some(1);
            if props.session_expiry_interval.map_or(false, |e| e != expiry) {
                ack.session_expiry_interval = Some(expiry);
            }
            ack.assigned_client_identifier = assigned;
            if keep_alive_clamped {
                ack.server_keep_alive = Some(keep_alive);
            }
            if !mqtt.allow_persistent_messages {
                ack.maximum_qos = Some(0);
            }
        }

        self.set_session(session.clone());
        reader.options = ReadOptions {
            protocol,
            proxy: proxied,
            max_packet_size: mqtt.max_packet_size(),
        };
        if !self.transition(State::New, State::InProgress) {
            return Err(Error::Closed);
        }
        debug!(
            "connection {} CONNECT from {:?} protocol {:?} keepalive {} expiry {}",
            self.id(),
            client_id,
            protocol,
            keep_alive,
            expiry
        );

        let conn = self.arc()?;
        let authenticated = connect
            .proxy
            .map_or(false, |flags| flags.authenticated());
        let request = ClientRequest {
            client_id,
            durable,
            expiry,
            clean_start: connect.clean_start,
            domain: session.info.domain.clone(),
            max_connections: props.max_connections.filter(|_| proxied),
        };
        let pending = PendingConnect {
            session,
            request,
            will,
            connack,
            login: connect.login,
            authenticated,
        };
        self.complete(async move { conn.complete_connect(pending).await });
        Ok(())
    }

    async fn complete_connect(self: Arc<Self>, pending: PendingConnect) -> Reply {
        let PendingConnect {
            session,
            request,
            will,
            mut connack,
            login,
            authenticated,
        } = pending;
        let protocol = session.protocol;
        let engine = self.services.engine.clone();

        if !authenticated {
            match self
                .services
                .hook
                .authenticate(&session.info, login.as_ref())
                .await
            {
                AuthResult::Allowed => {}
                AuthResult::BadCredentials => return Err(self.refuse(protocol, ReturnCode::BadUser)),
                AuthResult::NotAuthorized => {
                    return Err(self.refuse(protocol, ReturnCode::NotAuthorized))
                }
                AuthResult::ServerUnavailable => {
                    return Err(self.refuse(protocol, ReturnCode::ServerUnavailable))
                }
            }
        }

        let steal = Arc::new(StealNotice {
            conn: Arc::downgrade(&self),
        });
        let (client, present) = match engine.create_client(request, steal).await {
            Ok(created) => created,
            Err(e) => {
                debug!("create client {} error: {}", session.client_id, e);
                let rc = match e {
                    EngineError::QuotaExceeded => ReturnCode::QuotaExceeded,
                    EngineError::NotAuthorized => ReturnCode::NotAuthorized,
                    _ => ReturnCode::ServerUnavailable,
                };
                return Err(self.refuse(protocol, rc));
            }
        };
        session.set_client_handle(client);

        let engine_session = match engine.create_session(client).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!("create session {} error: {}", session.client_id, e);
                return Err(self.refuse(protocol, ReturnCode::ServerUnavailable));
            }
        };
        session.set_engine_session(engine_session);

        if let Some(will) = will {
            if let Err(e) = engine.set_will(client, will).await {
                debug!("set will {} error: {}", session.client_id, e);
                return Err(self.refuse(protocol, ReturnCode::ServerUnavailable));
            }
        }

        let present = present && !session.clean_start;
        if present {
            if let Err(e) = self.restore_subscriptions(&session).await {
                debug!("restore subscriptions {} error: {}", session.client_id, e);
                return Err(self.refuse(protocol, ReturnCode::ServerUnavailable));
            }
        }

        // CONNACK 之后重放缓存的报文，期间不处理新收到的字节
        let mut reader = self.reader.lock().await;
        {
            let _deliver = lock(&self.deliver_lock);
            if !self.transition(State::InProgress, State::Connected) {
                return match self.state() {
                    State::Stolen => Err(Error::SessionTakenOver),
                    _ => Err(Error::Closed),
                };
            }
            connack.session_present = present;
            self.send_with(&Packet::ConnAck(connack), protocol);
        }
        info!(
            "client {:?} connected from {} (session present: {})",
            session.client_id, session.info.client_addr, present
        );

        reader.buffered_bytes = 0;
        for packet in std::mem::take(&mut reader.buffered) {
            self.handle_packet(packet)?;
        }
        drop(reader);

        self.announced.store(true, Ordering::SeqCst);
        self.services.hook.connected(&session.client_id).await;
        if let Err(e) = engine.resume_delivery(engine_session).await {
            debug!("resume delivery {} error: {}", session.client_id, e);
        }
        Ok(Vec::new())
    }

    /// 回复拒绝连接的 CONNACK，返回对应的错误
    pub(super) fn refuse(&self, protocol: Protocol, rc: ReturnCode) -> Error {
        let mut connack = ConnAck::new(rc.reason_code(), false);
        if protocol.is_v5() {
            connack.properties = Properties {
                reason_string: Some(rc.description().to_owned()),
                ..Default::default()
            };
        }
        self.send_with(&Packet::ConnAck(connack), protocol);
        Error::Rejected(rc)
    }
}

/// 同步阶段协商好的连接参数，交给异步阶段完成
struct PendingConnect {
    session: Arc<Session>,
    request: ClientRequest,
    will: Option<Will>,
    connack: ConnAck,
    login: Option<Login>,
    authenticated: bool,
}

/// 为没有 client id 的客户端生成一个
fn generate_client_id(addr: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..CLIENT_ID_SUFFIX_LEN)
        .map(|_| CLIENT_ID_ALPHABET[rng.gen_range(0..CLIENT_ID_ALPHABET.len())] as char)
        .collect();
    format!("_{}_{}", addr, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_client_id_shape() {
        let id = generate_client_id("127.0.0.1:1883");
        assert!(id.starts_with("_127.0.0.1:1883_"));
        let suffix = &id["_127.0.0.1:1883_".len()..];
        assert_eq!(suffix.len(), CLIENT_ID_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| CLIENT_ID_ALPHABET.contains(&b)));
        assert_ne!(id, generate_client_id("127.0.0.1:1883"));
    }
}
