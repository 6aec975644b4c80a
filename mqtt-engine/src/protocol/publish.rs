//! 发布流程
//!
//! 入站：校验、去重、提交给引擎，引擎完成后按版本映射成 PUBACK / PUBREC 或者断开连接。
//! 出站：引擎通过消费者回调投递消息，连接分配报文 id 并写入传输层，收到确认后通知引擎。

use std::sync::{atomic::Ordering, Arc, Weak};

use log::{debug, warn};

use crate::{
    engine::{
        Deliver, DeliverStatus, Delivery, Engine, EngineError, Message, MessageProperties,
        PutOutcome,
    },
    network::{
        packet::{Ack, Packet, Protocol, Publish, QoS, ReasonCode},
        topic, FrameKind, SendStatus,
    },
    Action, Hook, PolicyRequest,
};

use super::{
    alias::OutboundAlias,
    connection::{Connection, Reply, State},
    lock,
    msgid::{Direction, MsgIdState},
    reason::{publish_outcome, AckDecision},
    session::Session,
    Error,
};

/// 重复的 QoS 2 报文 id 的处理方式
enum Duplicate {
    /// 客户端重传，引擎完成后多回复一次
    Merged,
    /// 上一条还在处理中，却收到了新的报文
    InUse,
    /// 已经回复过 PUBREC，再回复一次
    Resend,
}

impl<E: Engine, H: Hook> Connection<E, H> {
    pub(super) fn handle_publish(&self, mut publish: Publish) -> Result<(), Error> {
        let session = self.session().ok_or(Error::Closed)?;
        let mqtt = &self.services.config.mqtt;

        if publish.payload.len() > mqtt.max_message_size {
            return Err(Error::MessageTooBig(publish.payload.len()));
        }
        if publish.qos != QoS::AtMostOnce && !mqtt.allow_persistent_messages {
            return Err(Error::QoSNotSupported);
        }
        // 订阅标识只能由服务端填写
        if !publish.properties.subscription_identifiers.is_empty() {
            return Err(Error::Protocol("subscription identifier from client"));
        }
        if let Some(alias) = publish.properties.topic_alias.take() {
            publish.topic = lock(&session.aliases_in).resolve(alias, &publish.topic)?;
        } else if publish.topic.is_empty() {
            return Err(Error::Protocol("empty topic without topic alias"));
        }
        topic::valid_publish_topic(&publish.topic, mqtt.max_topic_levels)?;
        if publish.properties.payload_format_indicator == Some(1)
            && std::str::from_utf8(&publish.payload).is_err()
        {
            return Err(Error::PayloadFormatInvalid);
        }

        let id = publish.packet_id;
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                let merged = self
                    .msgids
                    .update(Direction::Inbound, id, |entry| entry.pending += 1);
                if merged.is_some() {
                    return Ok(());
                }
                self.admit(&session, id)?;
            }
            QoS::ExactlyOnce => {
                let retransmit = publish.dup || session.protocol == Protocol::V3;
                let duplicate = self.msgids.update(Direction::Inbound, id, |entry| {
                    match entry.state {
                        MsgIdState::Published if retransmit => {
                            entry.pending += 1;
                            Duplicate::Merged
                        }
                        MsgIdState::Published => Duplicate::InUse,
                        _ => Duplicate::Resend,
                    }
                });
                match duplicate {
                    Some(Duplicate::Merged) => return Ok(()),
                    Some(Duplicate::InUse) => return Err(Error::Protocol("packet id in use")),
                    Some(Duplicate::Resend) => {
                        self.reply(vec![Packet::PubRec(Ack::new(id))]);
                        return Ok(());
                    }
                    None => self.admit(&session, id)?,
                }
            }
        }

        let qos = publish.qos;
        let message = Message {
            properties: MessageProperties::from_properties(&publish.properties),
            topic: publish.topic,
            qos,
            retain: publish.retain,
            persistent: qos != QoS::AtMostOnce,
            payload: publish.payload,
            origin: Some(session.client_id.clone()),
        };
        let conn = self.arc()?;
        self.complete(async move {
            let result = conn.put(&session, message).await;
            conn.publish_completed(&session, qos, id, result)
        });
        Ok(())
    }

    /// 登记入站报文 id
    fn admit(&self, session: &Session, id: u16) -> Result<(), Error> {
        let receive_maximum = self.services.config.mqtt.receive_maximum as usize;
        if session.protocol.is_v5() && self.msgids.count(Direction::Inbound) >= receive_maximum {
            return Err(Error::ReceiveMaxExceeded);
        }
        self.msgids
            .add(Direction::Inbound, id, None, MsgIdState::Published)
            .map_err(|_| Error::Protocol("packet id in use"))
    }

    async fn put(&self, session: &Session, message: Message) -> Result<PutOutcome, EngineError> {
        if !self.authorize(session, Action::Publish, &message.topic).await {
            return Err(EngineError::NotAuthorized);
        }
        let handle = session.engine_session().ok_or(EngineError::Destroyed)?;
        self.services.engine.put(handle, message).await
    }

    /// 访问控制列表和授权回调都通过才允许
    pub(super) async fn authorize(&self, session: &Session, action: Action, name: &str) -> bool {
        if !session.acl_allows(name) {
            debug!("client {:?} {:?} {} denied by acl", session.client_id, action, name);
            return false;
        }
        let request = PolicyRequest {
            action,
            name: name.to_owned(),
        };
        let authorization = self
            .services
            .hook
            .authorize(&session.info, &request, session.policy_context(action))
            .await;
        session.cache_policy_context(action, authorization.context);
        authorization.allowed
    }

    fn publish_completed(
        &self,
        session: &Session,
        qos: QoS,
        id: u16,
        result: Result<PutOutcome, EngineError>,
    ) -> Reply {
        if let Err(e) = &result {
            debug!("client {:?} publish failed: {}", session.client_id, e);
        }
        let code = match publish_outcome(session.protocol, &result) {
            AckDecision::Ack(code) => code,
            AckDecision::Disconnect(rc) => {
                if qos != QoS::AtMostOnce {
                    self.msgids.remove(Direction::Inbound, id);
                }
                return Err(Error::Rejected(rc));
            }
        };

        let (pending, ack): (u32, fn(Ack) -> Packet) = match qos {
            QoS::AtMostOnce => return Ok(Vec::new()),
            QoS::AtLeastOnce => {
                let pending = self.msgids.remove(Direction::Inbound, id).map(|(_, n)| n);
                (pending.unwrap_or(1), Packet::PubAck)
            }
            QoS::ExactlyOnce if code.is_failure() => {
                let pending = self.msgids.remove(Direction::Inbound, id).map(|(_, n)| n);
                (pending.unwrap_or(1), Packet::PubRec)
            }
            QoS::ExactlyOnce => {
                let pending = self.msgids.update(Direction::Inbound, id, |entry| {
                    entry.state = MsgIdState::Received;
                    std::mem::replace(&mut entry.pending, 1)
                });
                (pending.unwrap_or(1), Packet::PubRec)
            }
        };
        Ok((0..pending)
            .map(|_| ack(Ack::with_reason(id, code)))
            .collect())
    }

    pub(super) fn handle_pubrel(&self, ack: Ack) -> Result<(), Error> {
        let id = ack.packet_id;
        match self.msgids.get(Direction::Inbound, id) {
            Some(entry) if entry.state == MsgIdState::Published => {
                Err(Error::Protocol("PUBREL before PUBREC"))
            }
            Some(_) => {
                self.msgids.remove(Direction::Inbound, id);
                self.reply(vec![Packet::PubComp(Ack::new(id))]);
                Ok(())
            }
            None => {
                // 重复的 PUBREL
                let reason = if self.protocol().is_v5() {
                    ReasonCode::PacketIdentifierNotFound
                } else {
                    ReasonCode::Success
                };
                self.reply(vec![Packet::PubComp(Ack::with_reason(id, reason))]);
                Ok(())
            }
        }
    }

    pub(super) fn handle_puback(&self, ack: Ack) {
        match self.msgids.remove(Direction::Outbound, ack.packet_id) {
            Some((delivery, _)) => {
                self.acknowledge(delivery);
                self.outbound_retired();
            }
            None => debug!(
                "connection {} PUBACK for unknown packet id {}",
                self.id(),
                ack.packet_id
            ),
        }
    }

    pub(super) fn handle_pubrec(&self, ack: Ack) -> Result<(), Error> {
        let id = ack.packet_id;
        if ack.reason.is_failure() {
            if let Some((delivery, _)) = self.msgids.remove(Direction::Outbound, id) {
                self.acknowledge(delivery);
                self.outbound_retired();
            }
            return Ok(());
        }

        let released = self.msgids.update(Direction::Outbound, id, |entry| {
            entry.state = MsgIdState::Released;
            entry.handle.take()
        });
        match released {
            Some(delivery) => {
                self.acknowledge(delivery);
                self.reply(vec![Packet::PubRel(Ack::new(id))]);
            }
            None if self.protocol().is_v5() => {
                let pubrel = Ack::with_reason(id, ReasonCode::PacketIdentifierNotFound);
                self.reply(vec![Packet::PubRel(pubrel)]);
            }
            None => debug!("connection {} PUBREC for unknown packet id {}", self.id(), id),
        }
        Ok(())
    }

    pub(super) fn handle_pubcomp(&self, ack: Ack) {
        if self.msgids.remove(Direction::Outbound, ack.packet_id).is_some() {
            self.outbound_retired();
        }
    }

    /// 出站在途数量减少，之前因为达到上限而拒绝的投递可以继续
    pub(super) fn outbound_retired(&self) {
        if self.outbound_blocked.swap(false, Ordering::SeqCst) && !self.is_suspended() {
            self.resume_delivery();
        }
    }

    /// 消费者回调，index 是订阅槽位
    pub(super) fn deliver(&self, index: usize, delivery: Delivery) -> DeliverStatus {
        let _deliver = lock(&self.deliver_lock);
        if self.inflight.is_closing() {
            return DeliverStatus::Closed;
        }
        if self.state() != State::Connected || self.is_suspended() {
            return DeliverStatus::Full;
        }
        let session = match self.session() {
            Some(session) => session,
            None => return DeliverStatus::Closed,
        };
        let slot = match lock(&session.slots).get(index).cloned() {
            Some(slot) => slot,
            None => return DeliverStatus::Closed,
        };

        let message = &delivery.message;
        if slot.no_local && message.origin.as_deref() == Some(session.client_id.as_str()) {
            return DeliverStatus::Consumed;
        }

        let mut qos = message.qos.downgrade(slot.qos);
        if qos == QoS::ExactlyOnce && !message.persistent {
            qos = QoS::AtLeastOnce;
        }
        let mut publish = Publish::new(message.topic.clone(), qos, message.payload.clone());
        publish.retain = delivery.retained || (slot.retain_as_published && message.retain);
        publish.dup = delivery.redelivered && qos != QoS::AtMostOnce;

        let mut new_alias = None;
        if session.protocol.is_v5() {
            message.properties.apply(&mut publish.properties);
            if let Some(id) = slot.subscription_id {
                publish.properties.subscription_identifiers.push(id);
            }
            match lock(&session.aliases_out).assign(&message.topic) {
                Some(OutboundAlias::New(alias)) => {
                    publish.properties.topic_alias = Some(alias);
                    new_alias = Some(alias);
                }
                Some(OutboundAlias::Existing(alias)) => {
                    publish.properties.topic_alias = Some(alias);
                    publish.topic.clear();
                }
                None => {}
            }
        }
        let forget_alias = || {
            if let Some(alias) = new_alias {
                lock(&session.aliases_out).forget(alias);
            }
        };

        if qos != QoS::AtMostOnce {
            let full = self.msgids.count(Direction::Outbound) >= session.receive_maximum as usize;
            let id = if full {
                None
            } else {
                self.msgids.assign_outbound(Some(delivery.handle))
            };
            match id {
                Some(id) => publish.packet_id = id,
                None => {
                    forget_alias();
                    self.outbound_blocked.store(true, Ordering::SeqCst);
                    self.retry_resume.store(true, Ordering::SeqCst);
                    return DeliverStatus::Full;
                }
            }
        }
        let packet_id = publish.packet_id;
        let release_id = || {
            if qos != QoS::AtMostOnce {
                self.msgids.remove(Direction::Outbound, packet_id);
            }
        };

        let frame = match Packet::Publish(publish).to_bytes(session.protocol) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("client {:?} encode PUBLISH error: {}", session.client_id, e);
                forget_alias();
                release_id();
                return DeliverStatus::Consumed;
            }
        };
        if frame.len() > session.max_packet_size {
            debug!(
                "client {:?} drop message on {}: {} bytes exceeds client maximum",
                session.client_id,
                message.topic,
                frame.len()
            );
            forget_alias();
            release_id();
            return DeliverStatus::Consumed;
        }

        match self.transport.send(frame, FrameKind::Binary) {
            SendStatus::Ok if qos == QoS::AtMostOnce => DeliverStatus::Consumed,
            SendStatus::Ok => DeliverStatus::Accepted,
            SendStatus::Suspend => {
                self.mark_suspended();
                if qos == QoS::AtMostOnce {
                    self.acknowledge(Some(delivery.handle));
                }
                DeliverStatus::Suspend
            }
            SendStatus::Closed => {
                release_id();
                DeliverStatus::Closed
            }
        }
    }
}

/// 一个订阅槽位的消费者回调
pub(super) struct ConsumerSink<E: Engine, H: Hook> {
    pub conn: Weak<Connection<E, H>>,
    pub slot: usize,
}

impl<E: Engine, H: Hook> ConsumerSink<E, H> {
    pub fn new(conn: &Arc<Connection<E, H>>, slot: usize) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            slot,
        }
    }
}

impl<E: Engine, H: Hook> Deliver for ConsumerSink<E, H> {
    fn deliver(&self, delivery: Delivery) -> DeliverStatus {
        match self.conn.upgrade() {
            Some(conn) => conn.deliver(self.slot, delivery),
            None => DeliverStatus::Closed,
        }
    }
}
