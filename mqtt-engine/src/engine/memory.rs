//! 内存引擎
//!
//! 进程内的参考实现：订阅树路由、保留消息、持久订阅队列、共享订阅组、遗嘱和会话过期。
//! 不做持久化，进程退出后所有状态丢失。

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, trace};
use tokio::time::{self, Instant};

use crate::network::{packet::RetainHandling, topic};

use super::{
    subscription_tree::SubscriptionTree, ClientClose, ClientHandle, ClientRequest,
    ConsumerHandle, ConsumerRequest, Deliver, DeliverStatus, Delivery, DeliveryHandle, Engine,
    EngineError, Message, PutOutcome, SessionHandle, SharedOwner, StealCallback,
    SubscriptionInfo, SubscriptionKind, Will,
};

/// 每个订阅队列默认最多缓存的消息数
pub const DEFAULT_QUEUE_MAX: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SubKey {
    /// (client id, 订阅名)
    Client(String, String),
    /// 共享订阅组名
    Shared(String),
}

struct Queued {
    message: Message,
    enqueued: Instant,
    redelivered: bool,
    retained: bool,
}

impl Queued {
    fn new(message: Message, retained: bool) -> Self {
        Self {
            message,
            enqueued: Instant::now(),
            redelivered: false,
            retained,
        }
    }

    /// 已过期返回 None，否则把有效期更新为剩余时间
    fn into_fresh(mut self, now: Instant) -> Option<Self> {
        if let Some(expiry) = self.message.properties.message_expiry_interval {
            let elapsed = now.saturating_duration_since(self.enqueued).as_secs();
            if elapsed >= u64::from(expiry) {
                return None;
            }
            self.message.properties.message_expiry_interval = Some(expiry - elapsed as u32);
        }
        Some(self)
    }
}

struct Subscription {
    info: SubscriptionInfo,
    /// 订阅树中的 token
    token: u64,
    queue: VecDeque<Queued>,
    consumers: Vec<ConsumerHandle>,
    /// 共享订阅轮询位置
    cursor: usize,
    /// 共享订阅的成员 client id
    members: HashSet<String>,
    /// 有一个任务正在投递此订阅的消息
    pumping: bool,
}

impl Subscription {
    fn new(info: SubscriptionInfo, token: u64) -> Self {
        Self {
            info,
            token,
            queue: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            members: HashSet::new(),
            pumping: false,
        }
    }

    /// 队列满时是否拒绝发布，非持久订阅直接丢弃
    fn durable(&self) -> bool {
        !matches!(
            self.info.kind,
            SubscriptionKind::NonDurable | SubscriptionKind::Shared(SharedOwner::NonDurable)
        )
    }

    fn accepts(&self, message: &Message) -> bool {
        self.info
            .selector
            .map_or(true, |selector| selector.accepts(message.qos))
    }
}

struct ClientState {
    /// 在线时的句柄
    handle: Option<ClientHandle>,
    steal: Option<Arc<dyn StealCallback>>,
    durable: bool,
    expiry: u32,
    domain: Option<String>,
    /// 每次上线加一，用于取消延迟遗嘱和会话过期
    generation: u64,
}

struct SessionState {
    client: ClientHandle,
    client_id: String,
    suspended: bool,
}

struct Consumer {
    session: SessionHandle,
    key: SubKey,
    deliver: Arc<dyn Deliver>,
}

/// 已投递未确认
struct Unacked {
    key: SubKey,
    session: SessionHandle,
    consumer: Option<ConsumerHandle>,
    queued: Queued,
}

struct State {
    next_id: u64,
    queue_max: usize,
    clients: HashMap<String, ClientState>,
    handles: HashMap<ClientHandle, String>,
    wills: HashMap<ClientHandle, Will>,
    sessions: HashMap<SessionHandle, SessionState>,
    subscriptions: HashMap<SubKey, Subscription>,
    tree: SubscriptionTree<SubKey>,
    retained: HashMap<String, Message>,
    consumers: HashMap<ConsumerHandle, Consumer>,
    unacked: HashMap<DeliveryHandle, Unacked>,
}

impl State {
    fn new(queue_max: usize) -> Self {
        Self {
            next_id: 0,
            queue_max,
            clients: HashMap::new(),
            handles: HashMap::new(),
            wills: HashMap::new(),
            sessions: HashMap::new(),
            subscriptions: HashMap::new(),
            tree: SubscriptionTree::new(),
            retained: HashMap::new(),
            consumers: HashMap::new(),
            unacked: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn client_id(&self, client: ClientHandle) -> Result<&str, EngineError> {
        self.handles
            .get(&client)
            .map(String::as_str)
            .ok_or(EngineError::Destroyed)
    }

    fn session(&self, session: SessionHandle) -> Result<&SessionState, EngineError> {
        self.sessions.get(&session).ok_or(EngineError::Destroyed)
    }

    fn key(&self, client: ClientHandle, name: &str, shared: bool) -> Result<SubKey, EngineError> {
        if shared {
            Ok(SubKey::Shared(name.to_owned()))
        } else {
            Ok(SubKey::Client(
                self.client_id(client)?.to_owned(),
                name.to_owned(),
            ))
        }
    }

    fn remove_subscription(&mut self, key: &SubKey) {
        if let Some(sub) = self.subscriptions.remove(key) {
            self.tree.remove(&sub.info.filter, sub.token);
            for consumer in sub.consumers {
                self.consumers.remove(&consumer);
            }
            self.unacked.retain(|_, unacked| &unacked.key != key);
        }
    }

    /// 删除客户端的所有订阅，并退出共享订阅组
    fn discard_subscriptions(&mut self, client_id: &str) {
        let mut removed = Vec::new();
        for (key, sub) in self.subscriptions.iter_mut() {
            match key {
                SubKey::Client(owner, _) if owner == client_id => removed.push(key.clone()),
                SubKey::Shared(_) => {
                    if sub.members.remove(client_id) && sub.members.is_empty() {
                        removed.push(key.clone());
                    }
                }
                _ => {}
            }
        }
        for key in removed {
            self.remove_subscription(&key);
        }
    }

    fn remove_consumer(&mut self, consumer: ConsumerHandle) -> Option<Consumer> {
        let removed = self.consumers.remove(&consumer)?;
        if let Some(sub) = self.subscriptions.get_mut(&removed.key) {
            sub.consumers.retain(|c| *c != consumer);
        }
        Some(removed)
    }

    /// 未确认的消息放回队列头部，标记为重复投递
    fn requeue(&mut self, filter: impl Fn(&Unacked) -> bool) -> HashSet<SubKey> {
        let mut handles = self
            .unacked
            .iter()
            .filter(|(_, unacked)| filter(unacked))
            .map(|(handle, _)| *handle)
            .collect::<Vec<_>>();
        handles.sort_unstable_by_key(|handle| std::cmp::Reverse(handle.0));

        let mut touched = HashSet::new();
        for handle in handles {
            let unacked = match self.unacked.remove(&handle) {
                Some(unacked) => unacked,
                None => continue,
            };
            if let Some(sub) = self.subscriptions.get_mut(&unacked.key) {
                if sub.durable() {
                    let mut queued = unacked.queued;
                    queued.redelivered = true;
                    sub.queue.push_front(queued);
                    touched.insert(unacked.key);
                }
            }
        }
        touched
    }

    /// 把消息放入所有匹配的订阅队列，返回需要投递的订阅
    fn route(&mut self, message: &Message) -> Result<Vec<SubKey>, EngineError> {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained.insert(message.topic.clone(), message.clone());
            }
        }

        let mut targets = Vec::new();
        for key in self.tree.matches(&message.topic) {
            let sub = match self.subscriptions.get(key) {
                Some(sub) => sub,
                None => continue,
            };
            if !sub.accepts(message) {
                continue;
            }
            if sub.durable() && sub.queue.len() >= self.queue_max {
                return Err(EngineError::DestinationFull);
            }
            targets.push(key.clone());
        }

        for key in &targets {
            if let Some(sub) = self.subscriptions.get_mut(key) {
                if sub.queue.len() >= self.queue_max {
                    debug!("drop message on {:?}: queue full", key);
                    continue;
                }
                sub.queue.push_back(Queued::new(message.clone(), false));
            }
        }
        Ok(targets)
    }

    /// 选出下一条要投递的消息和接收它的消费者
    fn next_delivery(
        &mut self,
        key: &SubKey,
    ) -> Option<(ConsumerHandle, Delivery, Arc<dyn Deliver>)> {
        let now = Instant::now();
        let sub = self.subscriptions.get_mut(key)?;
        let count = sub.consumers.len();
        let ready = (0..count).map(|i| (sub.cursor + i) % count).find(|idx| {
            self.consumers
                .get(&sub.consumers[*idx])
                .and_then(|consumer| self.sessions.get(&consumer.session))
                .map_or(false, |session| !session.suspended)
        })?;

        let queued = loop {
            match sub.queue.pop_front()?.into_fresh(now) {
                Some(queued) => break queued,
                None => trace!("message expired on {:?}", key),
            }
        };
        sub.cursor = ready + 1;
        let handle = sub.consumers[ready];
        let consumer = self.consumers.get(&handle)?;

        self.next_id += 1;
        let delivery = Delivery {
            handle: DeliveryHandle(self.next_id),
            message: queued.message.clone(),
            redelivered: queued.redelivered,
            retained: queued.retained,
        };
        let deliver = consumer.deliver.clone();
        self.unacked.insert(
            delivery.handle,
            Unacked {
                key: key.clone(),
                session: consumer.session,
                consumer: Some(handle),
                queued,
            },
        );
        Some((handle, delivery, deliver))
    }

    /// 消费者没有接收这条消息
    fn undeliver(&mut self, consumer: ConsumerHandle, delivery: DeliveryHandle, status: DeliverStatus) {
        if let Some(unacked) = self.unacked.remove(&delivery) {
            if let Some(sub) = self.subscriptions.get_mut(&unacked.key) {
                sub.queue.push_front(unacked.queued);
            }
            let session = unacked.session;
            match status {
                DeliverStatus::Closed => {
                    self.remove_consumer(consumer);
                }
                _ => {
                    if let Some(session) = self.sessions.get_mut(&session) {
                        session.suspended = true;
                    }
                }
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 投递订阅队列中的消息
    /// 回调在锁外执行，同一个订阅同时只有一个任务在投递，保证顺序
    fn pump(&self, key: &SubKey) {
        {
            let mut state = self.lock();
            match state.subscriptions.get_mut(key) {
                Some(sub) if !sub.pumping => sub.pumping = true,
                _ => return,
            }
        }

        loop {
            let next = {
                let mut state = self.lock();
                let next = state.next_delivery(key);
                if next.is_none() {
                    if let Some(sub) = state.subscriptions.get_mut(key) {
                        sub.pumping = false;
                    }
                }
                next
            };
            let (consumer, delivery, deliver) = match next {
                Some(next) => next,
                None => return,
            };

            let handle = delivery.handle;
            let status = deliver.deliver(delivery);
            trace!("deliver {:?} to {:?}: {:?}", handle, consumer, status);
            let mut state = self.lock();
            match status {
                DeliverStatus::Accepted => {}
                DeliverStatus::Consumed => {
                    state.unacked.remove(&handle);
                }
                DeliverStatus::Suspend => {
                    let session = state.consumers.get(&consumer).map(|c| c.session);
                    if let Some(session) = session.and_then(|s| state.sessions.get_mut(&s)) {
                        session.suspended = true;
                    }
                }
                DeliverStatus::Full | DeliverStatus::Closed => {
                    state.undeliver(consumer, handle, status)
                }
            }
        }
    }

    fn pump_all(&self, keys: impl IntoIterator<Item = SubKey>) {
        for key in keys {
            self.pump(&key);
        }
    }

    fn publish(&self, message: &Message) -> Result<PutOutcome, EngineError> {
        let targets = self.lock().route(message)?;
        if targets.is_empty() {
            return Ok(PutOutcome::NoSubscribers);
        }
        self.pump_all(targets);
        Ok(PutOutcome::Delivered)
    }
}

/// 进程内引擎
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_queue_max(DEFAULT_QUEUE_MAX)
    }

    /// 指定每个订阅队列的长度上限
    pub fn with_queue_max(queue_max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new(queue_max)),
            }),
        }
    }

    /// 当前保留消息数
    pub fn retained_count(&self) -> usize {
        self.inner.lock().retained.len()
    }

    /// 订阅中排队（未投递）的消息数
    pub fn queued(&self, client_id: &str, name: &str) -> Option<usize> {
        let key = SubKey::Client(client_id.to_owned(), name.to_owned());
        self.inner.lock().subscriptions.get(&key).map(|sub| sub.queue.len())
    }

    /// 已投递未确认的消息数
    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.inner
            .lock()
            .clients
            .get(client_id)
            .map_or(false, |client| client.handle.is_some())
    }

    fn schedule_will(&self, client_id: String, generation: u64, will: Will, delay: u32) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(delay.into())).await;
            let inner = match Weak::upgrade(&inner) {
                Some(inner) => inner,
                None => return,
            };
            // 期间重新上线则取消
            let cancelled = inner
                .lock()
                .clients
                .get(&client_id)
                .map_or(false, |client| client.generation != generation);
            if cancelled {
                return;
            }
            if let Err(e) = inner.publish(&will.message) {
                debug!("client {} will publish error: {}", client_id, e);
            }
        });
    }

    fn schedule_expiry(&self, client_id: String, generation: u64, expiry: u32) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(expiry.into())).await;
            let inner = match Weak::upgrade(&inner) {
                Some(inner) => inner,
                None => return,
            };
            let mut state = inner.lock();
            let expired = state
                .clients
                .get(&client_id)
                .map_or(false, |c| c.generation == generation && c.handle.is_none());
            if expired {
                debug!("client {} session expired", client_id);
                state.clients.remove(&client_id);
                state.discard_subscriptions(&client_id);
            }
        });
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn create_client(
        &self,
        request: ClientRequest,
        steal: Arc<dyn StealCallback>,
    ) -> Result<(ClientHandle, bool), EngineError> {
        let (handle, present, stolen) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;

            if let Some(max) = request.max_connections {
                let online = state
                    .clients
                    .iter()
                    .filter(|(id, client)| {
                        client.handle.is_some()
                            && client.domain == request.domain
                            && **id != request.client_id
                    })
                    .count();
                if online >= max as usize {
                    return Err(EngineError::QuotaExceeded);
                }
            }

            let handle = ClientHandle(state.next_id());
            let mut stolen = None;
            let mut present = false;
            let mut generation = 0;
            if let Some(previous) = state.clients.remove(&request.client_id) {
                if previous.handle.is_some() {
                    stolen = previous.steal;
                }
                generation = previous.generation + 1;
                if request.clean_start {
                    state.discard_subscriptions(&request.client_id);
                } else {
                    present = true;
                }
            }

            state.clients.insert(
                request.client_id.clone(),
                ClientState {
                    handle: Some(handle),
                    steal: Some(steal),
                    durable: request.durable,
                    expiry: request.expiry,
                    domain: request.domain,
                    generation,
                },
            );
            state.handles.insert(handle, request.client_id);
            (handle, present, stolen)
        };

        if let Some(stolen) = stolen {
            stolen.steal();
        }
        Ok((handle, present))
    }

    async fn destroy_client(
        &self,
        client: ClientHandle,
        close: ClientClose,
    ) -> Result<(), EngineError> {
        let mut will = None;
        let touched = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let client_id = state.handles.remove(&client).ok_or(EngineError::NotFound)?;
            let pending_will = state.wills.remove(&client);

            let sessions = state
                .sessions
                .iter()
                .filter(|(_, session)| session.client == client)
                .map(|(handle, _)| *handle)
                .collect::<HashSet<_>>();
            let consumers = state
                .consumers
                .iter()
                .filter(|(_, consumer)| sessions.contains(&consumer.session))
                .map(|(handle, _)| *handle)
                .collect::<Vec<_>>();
            for consumer in consumers {
                state.remove_consumer(consumer);
            }
            let touched = state.requeue(|unacked| sessions.contains(&unacked.session));
            state.sessions.retain(|handle, _| !sessions.contains(handle));

            // 已经被新连接接管时，会话属于新连接
            let owned = state
                .clients
                .get(&client_id)
                .map_or(false, |c| c.handle == Some(client));
            let mut will_delay = 0;
            if owned {
                match state.clients.get_mut(&client_id) {
                    Some(owner) if owner.durable && !close.discard_session => {
                        owner.handle = None;
                        owner.steal = None;
                        owner.expiry = close.expiry;
                        if owner.expiry != u32::MAX {
                            self.schedule_expiry(client_id.clone(), owner.generation, owner.expiry);
                        }
                        will_delay = owner.expiry;
                    }
                    _ => {
                        state.clients.remove(&client_id);
                        state.discard_subscriptions(&client_id);
                    }
                }
            }

            if close.send_will {
                if let Some(pending) = pending_will {
                    let generation = state.clients.get(&client_id).map_or(0, |c| c.generation);
                    let delay = pending.delay.min(will_delay);
                    will = Some((client_id.clone(), generation, pending, delay));
                }
            }
            debug!("client {} destroyed: {:?}", client_id, close);
            touched
        };

        self.inner.pump_all(touched);
        if let Some((client_id, generation, pending, delay)) = will {
            if delay == 0 {
                self.inner.publish(&pending.message)?;
            } else {
                self.schedule_will(client_id, generation, pending, delay);
            }
        }
        Ok(())
    }

    async fn create_session(&self, client: ClientHandle) -> Result<SessionHandle, EngineError> {
        let mut state = self.inner.lock();
        let client_id = state.client_id(client)?.to_owned();
        let session = SessionHandle(state.next_id());
        state.sessions.insert(
            session,
            SessionState {
                client,
                client_id,
                suspended: false,
            },
        );
        Ok(session)
    }

    async fn set_will(&self, client: ClientHandle, will: Will) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state.client_id(client)?;
        state.wills.insert(client, will);
        Ok(())
    }

    async fn put(
        &self,
        session: SessionHandle,
        message: Message,
    ) -> Result<PutOutcome, EngineError> {
        self.inner.lock().session(session)?;
        self.inner.publish(&message)
    }

    async fn find_subscription(
        &self,
        client: ClientHandle,
        name: &str,
        shared: bool,
    ) -> Result<Option<SubscriptionInfo>, EngineError> {
        let state = self.inner.lock();
        let key = state.key(client, name, shared)?;
        Ok(state.subscriptions.get(&key).map(|sub| sub.info.clone()))
    }

    async fn create_subscription(
        &self,
        client: ClientHandle,
        info: SubscriptionInfo,
    ) -> Result<(), EngineError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let client_id = state.client_id(client)?.to_owned();
        let key = state.key(client, &info.name, info.kind.is_shared())?;

        if let Some(existing) = state.subscriptions.get_mut(&key) {
            let owner = match (existing.info.kind, info.kind) {
                (SubscriptionKind::Shared(current), SubscriptionKind::Shared(joining)) => {
                    current == SharedOwner::Mixed || current == joining
                }
                _ => return Err(EngineError::Exists),
            };
            if !owner
                || existing.info.filter != info.filter
                || existing.info.selector != info.selector
            {
                return Err(EngineError::ShareMismatch);
            }
            existing.members.insert(client_id);
            return Ok(());
        }

        let token = state.tree.insert(&info.filter, key.clone());
        let mut sub = Subscription::new(info, token);
        if sub.info.kind.is_shared() {
            sub.members.insert(client_id);
        }
        state.subscriptions.insert(key, sub);
        Ok(())
    }

    async fn update_subscription(
        &self,
        client: ClientHandle,
        info: SubscriptionInfo,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        let key = state.key(client, &info.name, info.kind.is_shared())?;
        let sub = state
            .subscriptions
            .get_mut(&key)
            .ok_or(EngineError::NotFound)?;
        sub.info.subscription_id = info.subscription_id;
        sub.info.retain_as_published = info.retain_as_published;
        Ok(())
    }

    async fn destroy_subscription(
        &self,
        client: ClientHandle,
        name: &str,
        shared: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        let client_id = state.client_id(client)?.to_owned();
        let key = state.key(client, name, shared)?;
        let sub = state
            .subscriptions
            .get_mut(&key)
            .ok_or(EngineError::NotFound)?;
        if shared {
            if !sub.members.remove(&client_id) {
                return Err(EngineError::NotFound);
            }
            if !sub.members.is_empty() {
                return Ok(());
            }
        }
        state.remove_subscription(&key);
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        client: ClientHandle,
    ) -> Result<Vec<SubscriptionInfo>, EngineError> {
        let state = self.inner.lock();
        let client_id = state.client_id(client)?;
        let mut subs = state
            .subscriptions
            .iter()
            .filter(|(key, sub)| match key {
                SubKey::Client(owner, _) => owner == client_id,
                SubKey::Shared(_) => sub.members.contains(client_id),
            })
            .map(|(_, sub)| sub.info.clone())
            .collect::<Vec<_>>();
        subs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subs)
    }

    async fn create_consumer(
        &self,
        session: SessionHandle,
        request: ConsumerRequest,
        deliver: Arc<dyn Deliver>,
    ) -> Result<ConsumerHandle, EngineError> {
        let (key, handle) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let client = state.session(session)?.client;
            let key = state.key(client, &request.name, request.shared)?;
            let handle = ConsumerHandle(state.next_id());

            let send_retained = !request.shared
                && match request.retain_handling {
                    RetainHandling::OnSubscribe => true,
                    RetainHandling::OnNewSubscribe => request.new_subscription,
                    RetainHandling::DoNotSend => false,
                };
            let sub = state
                .subscriptions
                .get_mut(&key)
                .ok_or(EngineError::NotFound)?;
            sub.consumers.push(handle);
            if send_retained {
                let mut retained = state
                    .retained
                    .values()
                    .filter(|m| topic::matches(&m.topic, &sub.info.filter) && sub.accepts(m))
                    .cloned()
                    .collect::<Vec<_>>();
                retained.sort_by(|a, b| a.topic.cmp(&b.topic));
                sub.queue
                    .extend(retained.into_iter().map(|m| Queued::new(m, true)));
            }
            state.consumers.insert(
                handle,
                Consumer {
                    session,
                    key: key.clone(),
                    deliver,
                },
            );
            (key, handle)
        };

        self.inner.pump(&key);
        Ok(handle)
    }

    async fn destroy_consumer(&self, consumer: ConsumerHandle) -> Result<(), EngineError> {
        let touched = {
            let mut state = self.inner.lock();
            state
                .remove_consumer(consumer)
                .ok_or(EngineError::NotFound)?;
            state.requeue(|unacked| unacked.consumer == Some(consumer))
        };
        self.inner.pump_all(touched);
        Ok(())
    }

    async fn acknowledge(
        &self,
        session: SessionHandle,
        delivery: DeliveryHandle,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        match state.unacked.get(&delivery) {
            Some(unacked) if unacked.session == session => {
                state.unacked.remove(&delivery);
                Ok(())
            }
            _ => Err(EngineError::NotFound),
        }
    }

    async fn get_message(
        &self,
        session: SessionHandle,
        name: &str,
    ) -> Result<Option<Delivery>, EngineError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let client_id = state.session(session)?.client_id.clone();
        let key = [
            SubKey::Client(client_id.clone(), name.to_owned()),
            SubKey::Shared(name.to_owned()),
        ]
        .into_iter()
        .find(|key| match state.subscriptions.get(key) {
            Some(sub) => !matches!(key, SubKey::Shared(_)) || sub.members.contains(&client_id),
            None => false,
        })
        .ok_or(EngineError::NotFound)?;

        let now = Instant::now();
        let sub = state
            .subscriptions
            .get_mut(&key)
            .ok_or(EngineError::NotFound)?;
        let queued = loop {
            match sub.queue.pop_front() {
                Some(queued) => {
                    if let Some(queued) = queued.into_fresh(now) {
                        break queued;
                    }
                }
                None => return Ok(None),
            }
        };

        let handle = DeliveryHandle(state.next_id());
        let delivery = Delivery {
            handle,
            message: queued.message.clone(),
            redelivered: queued.redelivered,
            retained: queued.retained,
        };
        state.unacked.insert(
            handle,
            Unacked {
                key,
                session,
                consumer: None,
                queued,
            },
        );
        Ok(Some(delivery))
    }

    async fn suspend_delivery(&self, session: SessionHandle) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::Destroyed)?
            .suspended = true;
        Ok(())
    }

    async fn resume_delivery(&self, session: SessionHandle) -> Result<(), EngineError> {
        let keys = {
            let mut state = self.inner.lock();
            state
                .sessions
                .get_mut(&session)
                .ok_or(EngineError::Destroyed)?
                .suspended = false;
            state
                .consumers
                .values()
                .filter(|consumer| consumer.session == session)
                .map(|consumer| consumer.key.clone())
                .collect::<HashSet<_>>()
        };
        self.inner.pump_all(keys);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        engine::MessageProperties,
        network::{packet::QoS, topic::Selector},
    };

    use super::*;

    struct Noop;

    impl StealCallback for Noop {
        fn steal(&self) {}
    }

    #[derive(Default)]
    struct Stolen(Mutex<bool>);

    impl StealCallback for Stolen {
        fn steal(&self) {
            *self.0.lock().unwrap() = true;
        }
    }

    /// 记录收到的消息，按预设返回状态
    struct Recorder {
        received: Mutex<Vec<Delivery>>,
        status: Mutex<DeliverStatus>,
    }

    impl Recorder {
        fn new(status: DeliverStatus) -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                status: Mutex::new(status),
            })
        }

        fn topics(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.message.topic.clone())
                .collect()
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    impl Deliver for Recorder {
        fn deliver(&self, delivery: Delivery) -> DeliverStatus {
            let status = *self.status.lock().unwrap();
            if matches!(
                status,
                DeliverStatus::Accepted | DeliverStatus::Consumed | DeliverStatus::Suspend
            ) {
                self.received.lock().unwrap().push(delivery);
            }
            status
        }
    }

    fn request(client_id: &str, durable: bool, clean_start: bool) -> ClientRequest {
        ClientRequest {
            client_id: client_id.into(),
            durable,
            expiry: if durable { u32::MAX } else { 0 },
            clean_start,
            domain: None,
            max_connections: None,
        }
    }

    fn message(topic: &str, qos: QoS, retain: bool) -> Message {
        Message {
            topic: topic.into(),
            qos,
            retain,
            persistent: true,
            payload: Bytes::from_static(b"hello"),
            properties: MessageProperties::default(),
            origin: None,
        }
    }

    fn subscription(name: &str, kind: SubscriptionKind) -> SubscriptionInfo {
        SubscriptionInfo {
            name: name.into(),
            filter: name.into(),
            qos: QoS::AtLeastOnce,
            selector: None,
            kind,
            no_local: false,
            retain_as_published: false,
            subscription_id: None,
        }
    }

    fn consumer(name: &str) -> ConsumerRequest {
        ConsumerRequest {
            name: name.into(),
            shared: false,
            retain_handling: RetainHandling::OnSubscribe,
            new_subscription: true,
        }
    }

    async fn connect(
        engine: &MemoryEngine,
        client_id: &str,
        durable: bool,
    ) -> (ClientHandle, SessionHandle) {
        let (client, _) = engine
            .create_client(request(client_id, durable, !durable), Arc::new(Noop))
            .await
            .unwrap();
        let session = engine.create_session(client).await.unwrap();
        (client, session)
    }

    #[tokio::test]
    async fn route_and_acknowledge() {
        let engine = MemoryEngine::new();
        let (client, session) = connect(&engine, "c1", false).await;
        engine
            .create_subscription(client, subscription("a/+", SubscriptionKind::NonDurable))
            .await
            .unwrap();
        let recorder = Recorder::new(DeliverStatus::Accepted);
        engine
            .create_consumer(session, consumer("a/+"), recorder.clone())
            .await
            .unwrap();

        let outcome = engine
            .put(session, message("a/b", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Delivered);
        let outcome = engine
            .put(session, message("x/y", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::NoSubscribers);

        assert_eq!(recorder.topics(), vec!["a/b".to_owned()]);
        assert_eq!(engine.unacked_count(), 1);
        let handle = recorder.received.lock().unwrap()[0].handle;
        engine.acknowledge(session, handle).await.unwrap();
        assert_eq!(engine.unacked_count(), 0);
        assert_eq!(
            engine.acknowledge(session, handle).await,
            Err(EngineError::NotFound)
        );
    }

    #[tokio::test]
    async fn retained_messages() {
        let engine = MemoryEngine::new();
        let (client, session) = connect(&engine, "c1", false).await;
        engine
            .put(session, message("a/b", QoS::AtMostOnce, true))
            .await
            .unwrap();
        assert_eq!(engine.retained_count(), 1);

        engine
            .create_subscription(client, subscription("a/#", SubscriptionKind::NonDurable))
            .await
            .unwrap();
        let recorder = Recorder::new(DeliverStatus::Consumed);
        engine
            .create_consumer(session, consumer("a/#"), recorder.clone())
            .await
            .unwrap();
        let received = recorder.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert!(received[0].retained);
        assert!(received[0].message.retain);

        // 空消息清除保留消息
        let mut clear = message("a/b", QoS::AtMostOnce, true);
        clear.payload = Bytes::new();
        engine.put(session, clear).await.unwrap();
        assert_eq!(engine.retained_count(), 0);
    }

    #[tokio::test]
    async fn suspend_and_resume() {
        let engine = MemoryEngine::new();
        let (client, session) = connect(&engine, "c1", true).await;
        engine
            .create_subscription(client, subscription("t", SubscriptionKind::Durable))
            .await
            .unwrap();
        let recorder = Recorder::new(DeliverStatus::Full);
        engine
            .create_consumer(session, consumer("t"), recorder.clone())
            .await
            .unwrap();

        engine
            .put(session, message("t", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        engine
            .put(session, message("t", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        assert_eq!(recorder.count(), 0);
        assert_eq!(engine.queued("c1", "t"), Some(2));

        *recorder.status.lock().unwrap() = DeliverStatus::Accepted;
        engine.resume_delivery(session).await.unwrap();
        assert_eq!(recorder.count(), 2);
        assert_eq!(engine.queued("c1", "t"), Some(0));
    }

    #[tokio::test]
    async fn durable_queue_full() {
        let engine = MemoryEngine::with_queue_max(1);
        let (client, session) = connect(&engine, "c1", true).await;
        engine
            .create_subscription(client, subscription("t", SubscriptionKind::Durable))
            .await
            .unwrap();
        engine
            .put(session, message("t", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        assert_eq!(
            engine
                .put(session, message("t", QoS::AtLeastOnce, false))
                .await,
            Err(EngineError::DestinationFull)
        );
    }

    #[tokio::test]
    async fn durable_session_survives_reconnect() {
        let engine = MemoryEngine::new();
        let (client, session) = connect(&engine, "c1", true).await;
        engine
            .create_subscription(client, subscription("t", SubscriptionKind::Durable))
            .await
            .unwrap();
        let recorder = Recorder::new(DeliverStatus::Accepted);
        let consumer_handle = engine
            .create_consumer(session, consumer("t"), recorder.clone())
            .await
            .unwrap();
        engine
            .put(session, message("t", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        assert_eq!(recorder.count(), 1);

        engine.destroy_consumer(consumer_handle).await.unwrap();
        engine
            .destroy_client(
                client,
                ClientClose {
                    discard_session: false,
                    send_will: false,
                    expiry: u32::MAX,
                },
            )
            .await
            .unwrap();
        assert!(!engine.is_online("c1"));
        // 未确认的消息放回队列
        assert_eq!(engine.queued("c1", "t"), Some(1));

        let (client, present) = engine
            .create_client(request("c1", true, false), Arc::new(Noop))
            .await
            .unwrap();
        assert!(present);
        let subs = engine.list_subscriptions(client).await.unwrap();
        assert_eq!(subs.len(), 1);

        let session = engine.create_session(client).await.unwrap();
        let recorder = Recorder::new(DeliverStatus::Accepted);
        engine
            .create_consumer(session, consumer("t"), recorder.clone())
            .await
            .unwrap();
        let received = recorder.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert!(received[0].redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn close_expiry_overrides_connect_expiry() {
        let engine = MemoryEngine::new();
        let (client, _) = connect(&engine, "c1", true).await;
        engine
            .create_subscription(client, subscription("t", SubscriptionKind::Durable))
            .await
            .unwrap();
        engine
            .destroy_client(
                client,
                ClientClose {
                    discard_session: false,
                    send_will: false,
                    expiry: 5,
                },
            )
            .await
            .unwrap();
        assert_eq!(engine.queued("c1", "t"), Some(0));

        time::advance(Duration::from_secs(4)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.queued("c1", "t"), Some(0));

        time::advance(Duration::from_secs(2)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.queued("c1", "t"), None);
    }

    #[tokio::test]
    async fn steal_notifies_previous_owner() {
        let engine = MemoryEngine::new();
        let stolen = Arc::new(Stolen::default());
        let (old, _) = engine
            .create_client(request("c1", false, true), stolen.clone())
            .await
            .unwrap();
        let (new, _) = engine
            .create_client(request("c1", false, true), Arc::new(Noop))
            .await
            .unwrap();
        assert!(*stolen.0.lock().unwrap());

        // 旧连接的销毁不影响新连接
        engine
            .destroy_client(
                old,
                ClientClose {
                    discard_session: true,
                    send_will: false,
                    expiry: 0,
                },
            )
            .await
            .unwrap();
        assert!(engine.is_online("c1"));
        engine
            .destroy_client(
                new,
                ClientClose {
                    discard_session: true,
                    send_will: false,
                    expiry: 0,
                },
            )
            .await
            .unwrap();
        assert!(!engine.is_online("c1"));
    }

    #[tokio::test]
    async fn shared_subscription_mismatch() {
        let engine = MemoryEngine::new();
        let (a, _) = connect(&engine, "a", false).await;
        let (b, _) = connect(&engine, "b", false).await;

        let mut info = subscription("/grp/topic", SubscriptionKind::Shared(SharedOwner::Mixed));
        info.filter = "topic".into();
        info.selector = Some(Selector::AtMostOnce);
        engine.create_subscription(a, info.clone()).await.unwrap();

        let mut other = info.clone();
        other.selector = Some(Selector::Reliable);
        assert_eq!(
            engine.create_subscription(b, other).await,
            Err(EngineError::ShareMismatch)
        );
        engine.create_subscription(b, info).await.unwrap();

        engine
            .destroy_subscription(a, "/grp/topic", true)
            .await
            .unwrap();
        assert!(engine
            .find_subscription(b, "/grp/topic", true)
            .await
            .unwrap()
            .is_some());
        engine
            .destroy_subscription(b, "/grp/topic", true)
            .await
            .unwrap();
        assert!(engine
            .find_subscription(b, "/grp/topic", true)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn shared_round_robin() {
        let engine = MemoryEngine::new();
        let (a, sa) = connect(&engine, "a", false).await;
        let (b, sb) = connect(&engine, "b", false).await;
        let mut info = subscription("grp", SubscriptionKind::Shared(SharedOwner::Mixed));
        info.filter = "t".into();
        engine.create_subscription(a, info.clone()).await.unwrap();
        engine.create_subscription(b, info).await.unwrap();

        let ra = Recorder::new(DeliverStatus::Consumed);
        let rb = Recorder::new(DeliverStatus::Consumed);
        let mut request = consumer("grp");
        request.shared = true;
        engine
            .create_consumer(sa, request.clone(), ra.clone())
            .await
            .unwrap();
        engine.create_consumer(sb, request, rb.clone()).await.unwrap();

        for _ in 0..4 {
            engine
                .put(sa, message("t", QoS::AtMostOnce, false))
                .await
                .unwrap();
        }
        assert_eq!(ra.count(), 2);
        assert_eq!(rb.count(), 2);
    }

    #[tokio::test]
    async fn will_published_on_ungraceful_close() {
        let engine = MemoryEngine::new();
        let (watcher, session) = connect(&engine, "watcher", false).await;
        engine
            .create_subscription(watcher, subscription("will", SubscriptionKind::NonDurable))
            .await
            .unwrap();
        let recorder = Recorder::new(DeliverStatus::Consumed);
        engine
            .create_consumer(session, consumer("will"), recorder.clone())
            .await
            .unwrap();

        let (client, _) = connect(&engine, "c1", false).await;
        engine
            .set_will(
                client,
                Will {
                    message: message("will", QoS::AtMostOnce, false),
                    delay: 0,
                },
            )
            .await
            .unwrap();
        engine
            .destroy_client(
                client,
                ClientClose {
                    discard_session: true,
                    send_will: true,
                    expiry: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(recorder.topics(), vec!["will".to_owned()]);
    }

    #[tokio::test]
    async fn selector_filters_by_qos() {
        let engine = MemoryEngine::new();
        let (client, session) = connect(&engine, "c1", false).await;
        let mut info = subscription("$select/QoS>0/t", SubscriptionKind::NonDurable);
        info.filter = "t".into();
        info.selector = Some(Selector::Reliable);
        engine.create_subscription(client, info).await.unwrap();

        assert_eq!(
            engine
                .put(session, message("t", QoS::AtMostOnce, false))
                .await
                .unwrap(),
            PutOutcome::NoSubscribers
        );
        assert_eq!(
            engine
                .put(session, message("t", QoS::AtLeastOnce, false))
                .await
                .unwrap(),
            PutOutcome::Delivered
        );
    }

    #[tokio::test]
    async fn get_message_pops_queue() {
        let engine = MemoryEngine::new();
        let (client, session) = connect(&engine, "c1", true).await;
        engine
            .create_subscription(client, subscription("t", SubscriptionKind::Durable))
            .await
            .unwrap();
        assert!(engine.get_message(session, "t").await.unwrap().is_none());
        engine
            .put(session, message("t", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        let delivery = engine.get_message(session, "t").await.unwrap().unwrap();
        assert_eq!(delivery.message.topic, "t");
        engine.acknowledge(session, delivery.handle).await.unwrap();
        assert_eq!(
            engine.get_message(session, "missing").await.unwrap_err(),
            EngineError::NotFound
        );
    }
}
