//! 连接上协商出来的会话参数，以及本地的订阅槽位

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use crate::{
    engine::{ClientHandle, ConsumerHandle, SessionHandle},
    network::{
        packet::{Protocol, QoS},
        topic,
    },
    Action, ClientInfo, PolicyContext,
};

use super::{
    alias::{InboundAliases, OutboundAliases},
    lock,
};

/// CONNECT 处理时确定下来的会话参数
pub struct Session {
    pub client_id: String,
    pub protocol: Protocol,
    pub clean_start: bool,
    /// 断开后引擎是否保留会话
    pub durable: bool,
    /// 会话过期时间，v5 的 DISCONNECT 可以修改
    expiry: AtomicU32,
    /// 生效的 keepalive（秒）
    pub keep_alive: u16,
    /// 客户端的接收上限，约束出站 QoS>0 在途数量
    pub receive_maximum: u16,
    /// 客户端能接收的报文上限
    pub max_packet_size: usize,
    pub request_problem_info: bool,
    pub info: ClientInfo,
    pub aliases_in: Mutex<InboundAliases>,
    pub aliases_out: Mutex<OutboundAliases>,
    handles: Mutex<Handles>,
    pub slots: Mutex<ConsumerSlots>,
    /// 代理下发的访问控制列表
    acl: Mutex<Option<Vec<String>>>,
    /// 授权服务返回的上下文
    policy: Mutex<HashMap<Action, PolicyContext>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Handles {
    client: Option<ClientHandle>,
    session: Option<SessionHandle>,
}

/// 创建会话的参数
pub struct SessionParams {
    pub client_id: String,
    pub protocol: Protocol,
    pub clean_start: bool,
    pub durable: bool,
    pub expiry: u32,
    pub keep_alive: u16,
    pub receive_maximum: u16,
    pub max_packet_size: usize,
    pub topic_alias_maximum: u16,
    pub client_alias_maximum: u16,
    pub request_problem_info: bool,
    pub info: ClientInfo,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        Self {
            client_id: params.client_id,
            protocol: params.protocol,
            clean_start: params.clean_start,
            durable: params.durable,
            expiry: AtomicU32::new(params.expiry),
            keep_alive: params.keep_alive,
            receive_maximum: params.receive_maximum,
            max_packet_size: params.max_packet_size,
            request_problem_info: params.request_problem_info,
            info: params.info,
            aliases_in: Mutex::new(InboundAliases::new(params.topic_alias_maximum)),
            aliases_out: Mutex::new(OutboundAliases::new(params.client_alias_maximum)),
            handles: Mutex::new(Handles::default()),
            slots: Mutex::new(ConsumerSlots::default()),
            acl: Mutex::new(None),
            policy: Mutex::new(HashMap::new()),
        }
    }

    pub fn expiry(&self) -> u32 {
        self.expiry.load(Ordering::SeqCst)
    }

    pub fn set_expiry(&self, expiry: u32) {
        self.expiry.store(expiry, Ordering::SeqCst)
    }

    pub fn client_handle(&self) -> Option<ClientHandle> {
        lock(&self.handles).client
    }

    pub fn engine_session(&self) -> Option<SessionHandle> {
        lock(&self.handles).session
    }

    pub fn set_client_handle(&self, client: ClientHandle) {
        lock(&self.handles).client = Some(client);
    }

    pub fn set_engine_session(&self, session: SessionHandle) {
        lock(&self.handles).session = Some(session);
    }

    pub fn set_acl(&self, filters: Vec<String>) {
        *lock(&self.acl) = Some(filters);
    }

    /// 没有访问控制列表时全部放行
    pub fn acl_allows(&self, name: &str) -> bool {
        match lock(&self.acl).as_ref() {
            Some(filters) => filters.iter().any(|filter| topic::matches(name, filter)),
            None => true,
        }
    }

    pub fn policy_context(&self, action: Action) -> Option<PolicyContext> {
        lock(&self.policy).get(&action).copied()
    }

    pub fn cache_policy_context(&self, action: Action, context: Option<PolicyContext>) {
        if let Some(context) = context {
            lock(&self.policy).insert(action, context);
        }
    }
}

/// 一个订阅在连接上的投递参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// 引擎中的订阅名
    pub name: String,
    pub shared: bool,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub subscription_id: Option<u32>,
    pub consumer: Option<ConsumerHandle>,
}

/// 订阅槽位表，下标交给消费者回调，0 号保留不用
#[derive(Debug)]
pub struct ConsumerSlots {
    slots: Vec<Option<Slot>>,
}

impl Default for ConsumerSlots {
    fn default() -> Self {
        Self { slots: vec![None] }
    }
}

impl ConsumerSlots {
    pub fn find(&self, name: &str, shared: bool) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map_or(false, |slot| slot.name == name && slot.shared == shared)
        })
    }

    /// 放入空闲的槽位，返回下标
    pub fn insert(&mut self, slot: Slot) -> usize {
        match self.slots.iter().skip(1).position(Option::is_none) {
            Some(free) => {
                self.slots[free + 1] = Some(slot);
                free + 1
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, index: usize) -> Option<Slot> {
        if index == 0 {
            return None;
        }
        self.slots.get_mut(index).and_then(Option::take)
    }

    pub fn take_all(&mut self) -> Vec<Slot> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
