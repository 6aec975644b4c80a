//! 订阅管理
//!
//! 每个过滤器依次处理：解析、授权、在引擎中创建或更新订阅、打开消费者，
//! 全部完成后回复一个 SUBACK。订阅在连接上对应一个槽位，消费者回调通过槽位找到投递参数。

use std::sync::Arc;

use log::debug;

use crate::{
    engine::{
        ConsumerRequest, Engine, EngineError, SharedOwner, SubscriptionInfo, SubscriptionKind,
    },
    network::{
        packet::{
            Extension, FetchedMessage, Packet, QoS, ReasonCode, RetainHandling, SubAck,
            Subscribe, SubscribeFilter, SubscriptionEntry, UnsubAck, Unsubscribe,
        },
        topic::{self, TopicSpec},
    },
    Action, Hook,
};

use super::{
    connection::{Connection, Reply},
    lock,
    publish::ConsumerSink,
    reason::subscribe_reason,
    session::{Session, Slot},
    Error,
};

/// 处理一个过滤器的失败原因
enum Refusal {
    /// 写入 SUBACK 的原因码
    Code(ReasonCode),
    /// 断开连接
    Fatal(Error),
}

impl From<EngineError> for Refusal {
    fn from(e: EngineError) -> Self {
        Refusal::Code(subscribe_reason(&e))
    }
}

impl<E: Engine, H: Hook> Connection<E, H> {
    pub(super) fn handle_subscribe(&self, subscribe: Subscribe) -> Result<(), Error> {
        let session = self.session().ok_or(Error::Closed)?;
        let conn = self.arc()?;
        let subscription_id = subscribe.properties.subscription_identifiers.first().copied();
        let Subscribe {
            packet_id, filters, ..
        } = subscribe;
        self.complete(async move {
            let mut codes = Vec::with_capacity(filters.len());
            for entry in filters {
                let code = match conn.subscribe_one(&session, &entry, subscription_id).await {
                    Ok(qos) => granted(qos),
                    Err(Refusal::Code(code)) => {
                        debug!(
                            "client {:?} subscribe {} refused: {:?}",
                            session.client_id, entry.filter, code
                        );
                        code
                    }
                    Err(Refusal::Fatal(e)) => return Err(e),
                };
                codes.push(code);
            }
            Ok(vec![Packet::SubAck(SubAck::new(packet_id, codes))])
        });
        Ok(())
    }

    async fn subscribe_one(
        self: &Arc<Self>,
        session: &Arc<Session>,
        entry: &SubscribeFilter,
        subscription_id: Option<u32>,
    ) -> Result<QoS, Refusal> {
        let mqtt = &self.services.config.mqtt;
        let spec = topic::parse_subscription(&entry.filter, mqtt.max_topic_levels)
            .map_err(|_| Refusal::Code(ReasonCode::TopicFilterInvalid))?;
        let options = entry.options;
        let qos = if mqtt.allow_persistent_messages {
            options.qos
        } else {
            QoS::AtMostOnce
        };
        if spec.is_shared() && options.no_local {
            return Err(Refusal::Fatal(Error::Protocol(
                "no local on shared subscription",
            )));
        }
        if !self.authorize(session, Action::Subscribe, &entry.filter).await {
            return Err(Refusal::Code(ReasonCode::NotAuthorized));
        }

        let kind = if spec.is_shared() {
            SubscriptionKind::Shared(if mqtt.allow_mixed_durability {
                SharedOwner::Mixed
            } else if session.durable {
                SharedOwner::Durable
            } else {
                SharedOwner::NonDurable
            })
        } else if session.durable {
            SubscriptionKind::Durable
        } else {
            SubscriptionKind::NonDurable
        };
        let info = SubscriptionInfo {
            name: spec.name.clone(),
            filter: spec.filter.clone(),
            qos,
            selector: spec.selector,
            kind,
            no_local: options.no_local,
            retain_as_published: options.retain_as_published,
            subscription_id,
        };
        self.apply_subscription(session, &spec, info, options.retain_handling)
            .await?;
        Ok(qos)
    }

    async fn apply_subscription(
        self: &Arc<Self>,
        session: &Arc<Session>,
        spec: &TopicSpec,
        info: SubscriptionInfo,
        retain_handling: RetainHandling,
    ) -> Result<(), Refusal> {
        let engine = &self.services.engine;
        let client = session.client_handle().ok_or(Refusal::Fatal(Error::Closed))?;
        let shared = spec.is_shared();
        let slot = lock(&session.slots).find(&info.name, shared);

        if shared {
            if let Some(index) = slot {
                let group = engine.find_subscription(client, &info.name, true).await?;
                let unchanged = group.map_or(false, |group| {
                    group.filter == info.filter && group.selector == info.selector
                }) && lock(&session.slots)
                    .get_mut(index)
                    .map_or(false, |slot| {
                        if slot.qos != info.qos {
                            return false;
                        }
                        slot.retain_as_published = info.retain_as_published;
                        slot.subscription_id = info.subscription_id;
                        true
                    });
                if unchanged {
                    return Ok(());
                }
                // 参数变化，退出共享组后重新加入
                self.close_slot(session, index).await;
                if let Err(e) = engine.destroy_subscription(client, &info.name, true).await {
                    debug!("leave shared subscription {} error: {}", info.name, e);
                }
            }
            engine.create_subscription(client, info.clone()).await?;
            if let Err(e) = self.open_consumer(session, &info, retain_handling, true).await {
                let leave = engine.destroy_subscription(client, &info.name, true).await;
                if let Err(leave) = leave {
                    debug!("leave shared subscription {} error: {}", info.name, leave);
                }
                return Err(e.into());
            }
            return Ok(());
        }

        match engine.find_subscription(client, &info.name, false).await? {
            Some(existing)
                if existing.qos == info.qos
                    && existing.filter == info.filter
                    && existing.selector == info.selector
                    && existing.kind == info.kind
                    && existing.no_local == info.no_local =>
            {
                if existing.subscription_id != info.subscription_id
                    || existing.retain_as_published != info.retain_as_published
                {
                    engine.update_subscription(client, info.clone()).await?;
                }
                match slot {
                    Some(index) => {
                        let consumer = lock(&session.slots).get_mut(index).and_then(|slot| {
                            slot.retain_as_published = info.retain_as_published;
                            slot.subscription_id = info.subscription_id;
                            if retain_handling == RetainHandling::OnSubscribe {
                                slot.consumer.take()
                            } else {
                                None
                            }
                        });
                        // 重新打开消费者，引擎会补发保留消息
                        if let Some(consumer) = consumer {
                            if let Err(e) = engine.destroy_consumer(consumer).await {
                                debug!("destroy consumer {:?} error: {}", consumer, e);
                            }
                            lock(&session.slots).remove(index);
                            self.open_consumer(session, &info, retain_handling, false)
                                .await?;
                        }
                    }
                    None => {
                        self.open_consumer(session, &info, retain_handling, false)
                            .await?
                    }
                }
                Ok(())
            }
            Some(_) => {
                // 订阅参数变化，重建
                if let Some(index) = slot {
                    self.close_slot(session, index).await;
                }
                engine.destroy_subscription(client, &info.name, false).await?;
                self.create_and_open(session, info, retain_handling).await
            }
            None => {
                if let Some(index) = slot {
                    self.close_slot(session, index).await;
                }
                self.create_and_open(session, info, retain_handling).await
            }
        }
    }

    async fn create_and_open(
        self: &Arc<Self>,
        session: &Arc<Session>,
        info: SubscriptionInfo,
        retain_handling: RetainHandling,
    ) -> Result<(), Refusal> {
        let engine = &self.services.engine;
        let client = session.client_handle().ok_or(Refusal::Fatal(Error::Closed))?;
        engine.create_subscription(client, info.clone()).await?;
        if let Err(e) = self.open_consumer(session, &info, retain_handling, true).await {
            if let Err(undo) = engine.destroy_subscription(client, &info.name, false).await {
                debug!("destroy subscription {} error: {}", info.name, undo);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// 先占用槽位再创建消费者，引擎可能在创建过程中就开始投递
    async fn open_consumer(
        self: &Arc<Self>,
        session: &Arc<Session>,
        info: &SubscriptionInfo,
        retain_handling: RetainHandling,
        new_subscription: bool,
    ) -> Result<(), EngineError> {
        let engine_session = session.engine_session().ok_or(EngineError::Destroyed)?;
        let shared = info.kind.is_shared();
        let index = lock(&session.slots).insert(Slot {
            name: info.name.clone(),
            shared,
            qos: info.qos,
            no_local: info.no_local,
            retain_as_published: info.retain_as_published,
            subscription_id: info.subscription_id,
            consumer: None,
        });
        let request = ConsumerRequest {
            name: info.name.clone(),
            shared,
            retain_handling,
            new_subscription,
        };
        let sink = Arc::new(ConsumerSink::new(self, index));
        match self
            .services
            .engine
            .create_consumer(engine_session, request, sink)
            .await
        {
            Ok(consumer) => {
                if let Some(slot) = lock(&session.slots).get_mut(index) {
                    slot.consumer = Some(consumer);
                }
                Ok(())
            }
            Err(e) => {
                lock(&session.slots).remove(index);
                Err(e)
            }
        }
    }

    async fn close_slot(&self, session: &Session, index: usize) {
        let consumer = lock(&session.slots).remove(index).and_then(|slot| slot.consumer);
        if let Some(consumer) = consumer {
            if let Err(e) = self.services.engine.destroy_consumer(consumer).await {
                debug!("destroy consumer {:?} error: {}", consumer, e);
            }
        }
    }

    /// 恢复保留会话中的订阅
    pub(super) async fn restore_subscriptions(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<(), EngineError> {
        let client = session.client_handle().ok_or(EngineError::Destroyed)?;
        let subscriptions = self.services.engine.list_subscriptions(client).await?;
        debug!(
            "client {:?} restore {} subscriptions",
            session.client_id,
            subscriptions.len()
        );
        for info in subscriptions {
            self.open_consumer(session, &info, RetainHandling::DoNotSend, false)
                .await?;
        }
        Ok(())
    }

    pub(super) fn handle_unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<(), Error> {
        let session = self.session().ok_or(Error::Closed)?;
        let conn = self.arc()?;
        let Unsubscribe {
            packet_id, filters, ..
        } = unsubscribe;
        self.complete(async move {
            let mut reasons = Vec::with_capacity(filters.len());
            for filter in filters {
                reasons.push(conn.unsubscribe_one(&session, &filter).await);
            }
            Ok(vec![Packet::UnsubAck(UnsubAck::new(packet_id, reasons))])
        });
        Ok(())
    }

    async fn unsubscribe_one(&self, session: &Session, filter: &str) -> ReasonCode {
        let max_levels = self.services.config.mqtt.max_topic_levels;
        let spec = match topic::parse_subscription(filter, max_levels) {
            Ok(spec) => spec,
            Err(_) => return ReasonCode::TopicFilterInvalid,
        };
        let client = match session.client_handle() {
            Some(client) => client,
            None => return ReasonCode::UnspecifiedError,
        };
        let shared = spec.is_shared();
        let slot = lock(&session.slots).find(&spec.name, shared);
        if let Some(index) = slot {
            self.close_slot(session, index).await;
        }
        match self
            .services
            .engine
            .destroy_subscription(client, &spec.name, shared)
            .await
        {
            Ok(()) => ReasonCode::Success,
            Err(EngineError::NotFound) => ReasonCode::NoSubscriptionExisted,
            Err(e) => {
                debug!("client {:?} unsubscribe {} error: {}", session.client_id, filter, e);
                ReasonCode::UnspecifiedError
            }
        }
    }

    pub(super) fn handle_extension(&self, extension: Extension) -> Result<(), Error> {
        let session = self.session().ok_or(Error::Closed)?;
        match extension {
            Extension::Acl(filters) => {
                debug!(
                    "client {:?} acl with {} filters",
                    session.client_id,
                    filters.len()
                );
                session.set_acl(filters);
                Ok(())
            }
            Extension::ListSubscriptions { request_id } => {
                let conn = self.arc()?;
                self.complete(async move { conn.list_subscriptions(&session, request_id).await });
                Ok(())
            }
            Extension::Get { request_id, name } => {
                let conn = self.arc()?;
                self.complete(async move { conn.fetch_message(&session, request_id, &name).await });
                Ok(())
            }
            Extension::SubscriptionList { .. } | Extension::GetReply { .. } => {
                Err(Error::Protocol("unexpected extension reply from client"))
            }
        }
    }

    async fn list_subscriptions(&self, session: &Session, request_id: u16) -> Reply {
        let client = session.client_handle().ok_or(Error::Closed)?;
        let subscriptions = self
            .services
            .engine
            .list_subscriptions(client)
            .await?
            .into_iter()
            .map(|info| SubscriptionEntry {
                name: info.name,
                filter: info.filter,
                qos: info.qos,
            })
            .collect();
        Ok(vec![Packet::Extension(Extension::SubscriptionList {
            request_id,
            subscriptions,
        })])
    }

    async fn fetch_message(&self, session: &Session, request_id: u16, name: &str) -> Reply {
        let engine_session = session.engine_session().ok_or(Error::Closed)?;
        let engine = &self.services.engine;
        let message = match engine.get_message(engine_session, name).await {
            Ok(Some(delivery)) => {
                engine.acknowledge(engine_session, delivery.handle).await?;
                Some(FetchedMessage {
                    topic: delivery.message.topic,
                    qos: delivery.message.qos,
                    payload: delivery.message.payload,
                })
            }
            Ok(None) | Err(EngineError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(vec![Packet::Extension(Extension::GetReply {
            request_id,
            message,
        })])
    }
}

/// 订阅成功时 SUBACK 中的原因码
fn granted(qos: QoS) -> ReasonCode {
    match qos {
        QoS::AtMostOnce => ReasonCode::Success,
        QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
        QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
    }
}
