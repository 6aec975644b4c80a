//! 连接状态机
//!
//! 状态：New → InProgress → {Connected, Stolen, Disconnected}，Connected 关闭后进入 Disconnected。
//!
//! 所有需要等待引擎的操作都作为一个 future 提交到连接的完成队列，队列按提交顺序逐个执行，
//! 执行结果（要回复的报文，或者导致断开的错误）也按顺序应用。
//! 同步完成和异步完成走的是同一条路径。

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use log::{debug, info, trace, warn};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    time::Instant,
};

use crate::{
    engine::{ClientClose, DeliveryHandle, Engine, EngineError, StealCallback},
    network::{
        packet::{self, Disconnect, Packet, Protocol, ReadOptions, ReasonCode},
        CloseReason, FrameKind, SendStatus, Transport,
    },
    Hook,
};

use super::{
    inflight::{Inflight, InflightGuard},
    keepalive::Sweep,
    lock,
    msgid::{ConnId, MsgIds},
    session::Session,
    Error, ReturnCode, Services,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New = 0,
    /// CONNECT 正在处理
    InProgress,
    Connected,
    /// 被相同 client id 的新连接接管
    Stolen,
    Disconnected,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::New,
            1 => State::InProgress,
            2 => State::Connected,
            3 => State::Stolen,
            _ => State::Disconnected,
        }
    }
}

/// 解码状态
pub(super) struct Reader {
    pub options: ReadOptions,
    /// CONNECT 完成前收到的报文，完成后按顺序重放
    pub buffered: Vec<Packet>,
    pub buffered_bytes: usize,
}

/// 完成队列中一个操作的结果：需要回复的报文，或者导致断开的错误
pub(super) type Reply = Result<Vec<Packet>, Error>;

type Job = (BoxFuture<'static, Reply>, InflightGuard);

pub struct Connection<E: Engine, H: Hook> {
    id: ConnId,
    pub(super) services: Services<E, H>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) this: Weak<Self>,
    state: AtomicU8,
    pub(super) inflight: Arc<Inflight>,
    pub(super) reader: AsyncMutex<Reader>,
    session: Mutex<Option<Arc<Session>>>,
    pub(super) msgids: MsgIds,
    created: Instant,
    /// 最后一次收到报文的时间，相对 created 的毫秒数
    last_access: AtomicU64,
    probed: AtomicBool,
    /// 传输层要求暂停投递
    suspended: AtomicBool,
    /// 出站在途数量达到上限
    pub(super) outbound_blocked: AtomicBool,
    /// 投递被拒绝过，保活扫描时再尝试恢复一次
    pub(super) retry_resume: AtomicBool,
    /// 投递和 CONNACK 互斥，保证 CONNACK 先发出
    pub(super) deliver_lock: Mutex<()>,
    /// 拆除时是否发布遗嘱
    pub(super) will_on_close: AtomicBool,
    /// 是否已经调用过 connected 回调
    pub(super) announced: AtomicBool,
    jobs: mpsc::UnboundedSender<Job>,
    closed_tx: watch::Sender<bool>,
}

impl<E: Engine, H: Hook> Connection<E, H> {
    pub fn new(services: Services<E, H>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let id = services.next_conn_id();
        let msgids = services
            .msgids
            .connection(id, services.config.mqtt.outbound_msgid_max);
        let (jobs, rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let options = ReadOptions {
            max_packet_size: services.config.mqtt.max_packet_size(),
            ..Default::default()
        };

        let conn = Arc::new_cyclic(|this| Self {
            id,
            services,
            transport,
            this: this.clone(),
            state: AtomicU8::new(State::New as u8),
            inflight: Inflight::new(),
            reader: AsyncMutex::new(Reader {
                options,
                buffered: Vec::new(),
                buffered_bytes: 0,
            }),
            session: Mutex::new(None),
            msgids,
            created: Instant::now(),
            last_access: AtomicU64::new(0),
            probed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            outbound_blocked: AtomicBool::new(false),
            retry_resume: AtomicBool::new(false),
            deliver_lock: Mutex::new(()),
            will_on_close: AtomicBool::new(true),
            announced: AtomicBool::new(false),
            jobs,
            closed_tx,
        });

        tokio::spawn(run_jobs(conn.this.clone(), rx));
        let sweep: Weak<dyn Sweep> = conn.this.clone();
        conn.services.keepalive.register(id, sweep);
        debug!(
            "connection {} from {} created",
            id,
            conn.transport.client_addr()
        );
        conn
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(super) fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(super) fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    pub(super) fn set_session(&self, session: Arc<Session>) {
        *lock(&self.session) = Some(session);
    }

    pub fn client_id(&self) -> Option<String> {
        self.session().map(|session| session.client_id.clone())
    }

    pub(super) fn protocol(&self) -> Protocol {
        self.session()
            .map_or(Protocol::V4, |session| session.protocol)
    }

    pub(super) fn arc(&self) -> Result<Arc<Self>, Error> {
        self.this.upgrade().ok_or(Error::Closed)
    }

    /// 处理收到的字节，消费所有完整的报文，不完整的部分留在缓冲区
    /// 出错时连接已经关闭
    pub async fn receive(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let mut reader = self.reader.lock().await;
        loop {
            if self.inflight.is_closing() {
                return Ok(());
            }

            let before = stream.len();
            let packet = match Packet::read_from(stream, &reader.options) {
                Ok(packet) => packet,
                Err(packet::Error::InsufficientBytes(_)) => return Ok(()),
                Err(e) => {
                    let e = self.decode_failed(e);
                    self.fail(&e);
                    return Err(e);
                }
            };
            let size = before - stream.len();
            self.touch();
            trace!("connection {} received {:?}", self.id, packet.packet_type());

            if let Err(e) = self.dispatch(&mut reader, packet, size) {
                self.fail(&e);
                return Err(e);
            }
        }
    }

    /// CONNECT 解码失败时先回复 CONNACK
    fn decode_failed(&self, e: packet::Error) -> Error {
        if self.state() != State::New {
            return Error::Packet(e);
        }
        match &e {
            packet::Error::ConnectRefused {
                protocol, detail, ..
            } => {
                debug!("connection {} refused: {}", self.id, detail);
                self.refuse(*protocol, ReturnCode::from(&e))
            }
            _ => Error::Packet(e),
        }
    }

    fn dispatch(&self, reader: &mut Reader, packet: Packet, size: usize) -> Result<(), Error> {
        match self.state() {
            State::New => match packet {
                Packet::Connect(connect) => self.handle_connect(reader, connect),
                _ => Err(Error::ConnectFirst),
            },
            State::InProgress => {
                if let Packet::Connect(_) = packet {
                    return Err(Error::DuplicateConnect);
                }
                reader.buffered_bytes += size;
                if reader.buffered_bytes > self.services.config.mqtt.connect_buffer_max {
                    return Err(Error::ConnectBufferOverflow);
                }
                reader.buffered.push(packet);
                Ok(())
            }
            State::Connected => self.handle_packet(packet),
            State::Stolen | State::Disconnected => Err(Error::Closed),
        }
    }

    pub(super) fn handle_packet(&self, packet: Packet) -> Result<(), Error> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::PubAck(ack) => {
                self.handle_puback(ack);
                Ok(())
            }
            Packet::PubRec(ack) => self.handle_pubrec(ack),
            Packet::PubRel(ack) => self.handle_pubrel(ack),
            Packet::PubComp(ack) => {
                self.handle_pubcomp(ack);
                Ok(())
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe),
            Packet::PingReq => {
                self.reply(vec![Packet::PingResp]);
                Ok(())
            }
            Packet::Disconnect(disconnect) => self.handle_disconnect(disconnect),
            Packet::Extension(extension) => self.handle_extension(extension),
            Packet::Connect(_) => Err(Error::DuplicateConnect),
            _ => Err(Error::Protocol("unexpected packet from client")),
        }
    }

    fn handle_disconnect(&self, disconnect: Disconnect) -> Result<(), Error> {
        let session = self.session().ok_or(Error::Closed)?;
        if let Some(expiry) = disconnect.properties.session_expiry_interval {
            if session.expiry() == 0 && expiry != 0 {
                return Err(Error::Protocol("session expiry changed from zero"));
            }
            session.set_expiry(expiry.min(self.services.config.session.max_expiry_interval));
        }
        let with_will = disconnect.reason == ReasonCode::DisconnectWithWill;
        self.will_on_close.store(with_will, Ordering::SeqCst);
        self.close(ReturnCode::Ok, true, "client disconnect");
        Ok(())
    }

    /// 提交一个需要等待的操作，连接关闭后提交的操作会被丢弃
    pub(super) fn complete<F>(&self, job: F)
    where
        F: Future<Output = Reply> + Send + 'static,
    {
        let guard = match self.inflight.enter() {
            Some(guard) => guard,
            None => return,
        };
        if self.jobs.send((job.boxed(), guard)).is_err() {
            debug!("connection {} job queue closed", self.id);
        }
    }

    /// 回复报文，和前面提交的操作保持顺序
    pub(super) fn reply(&self, packets: Vec<Packet>) {
        self.complete(futures::future::ready(Ok(packets)))
    }

    /// 后台执行引擎调用，持有在途计数，失败只记录日志
    pub(super) fn spawn_engine<F>(&self, what: &'static str, fut: F)
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let guard = self.inflight.enter();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                debug!("connection {} {} failed: {}", id, what, e);
            }
            drop(guard);
        });
    }

    fn apply(&self, reply: Reply) {
        match reply {
            Ok(packets) => {
                if self.inflight.is_closing() {
                    return;
                }
                for packet in packets {
                    match self.send_packet(&packet) {
                        SendStatus::Ok => {}
                        SendStatus::Suspend => self.suspend(),
                        SendStatus::Closed => return,
                    }
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    pub(super) fn send_packet(&self, packet: &Packet) -> SendStatus {
        self.send_with(packet, self.protocol())
    }

    pub(super) fn send_with(&self, packet: &Packet, protocol: Protocol) -> SendStatus {
        match packet.to_bytes(protocol) {
            Ok(frame) => {
                trace!("connection {} send {:?}", self.id, packet.packet_type());
                self.transport.send(frame, FrameKind::Binary)
            }
            Err(e) => {
                warn!(
                    "connection {} encode {:?} error: {}",
                    self.id,
                    packet.packet_type(),
                    e
                );
                SendStatus::Ok
            }
        }
    }

    /// 发生错误，v5 连接先发送 DISCONNECT，然后关闭
    pub(super) fn fail(&self, e: &Error) {
        if self.inflight.is_closing() {
            return;
        }
        if self.state() == State::Connected {
            if let Some(session) = self.session().filter(|s| s.protocol.is_v5()) {
                let mut disconnect = Disconnect::new(e.reason_code());
                if session.request_problem_info {
                    disconnect.properties.reason_string = Some(e.to_string());
                }
                self.send_with(&Packet::Disconnect(disconnect), Protocol::V5);
            }
        }
        self.close(e.rc(), false, &e.to_string());
    }

    /// 关闭连接，只有第一次调用生效
    /// 拆除流程在后台等待所有在途操作完成后执行
    pub fn close(&self, rc: ReturnCode, clean: bool, reason: &str) {
        if !self.inflight.close() {
            return;
        }
        self.state
            .store(State::Disconnected as u8, Ordering::SeqCst);
        self.services.keepalive.remove(self.id);

        let client_id = self.client_id().unwrap_or_default();
        if clean {
            info!("connection {} client {:?} closed: {}", self.id, client_id, reason);
        } else {
            info!(
                "connection {} client {:?} closed with {}: {}",
                self.id, client_id, rc, reason
            );
        }
        self.transport.close(&CloseReason {
            rc,
            clean,
            reason: reason.to_owned(),
        });

        if let Some(conn) = self.this.upgrade() {
            tokio::spawn(conn.teardown());
        }
    }

    async fn teardown(self: Arc<Self>) {
        self.inflight.wait_idle().await;

        let engine = &self.services.engine;
        if let Some(session) = self.session() {
            let slots = lock(&session.slots).take_all();
            for consumer in slots.into_iter().filter_map(|slot| slot.consumer) {
                if let Err(e) = engine.destroy_consumer(consumer).await {
                    debug!("destroy consumer {:?} error: {}", consumer, e);
                }
            }

            if let Some(client) = session.client_handle() {
                let close = ClientClose {
                    discard_session: !session.durable || session.expiry() == 0,
                    send_will: self.will_on_close.load(Ordering::SeqCst),
                    expiry: session.expiry(),
                };
                if let Err(e) = engine.destroy_client(client, close).await {
                    warn!("destroy client {} error: {}", session.client_id, e);
                }
            }

            if self.announced.load(Ordering::SeqCst) {
                self.services.hook.disconnected(&session.client_id).await;
            }
        }

        let released = self.msgids.release_all();
        if !released.is_empty() {
            debug!(
                "connection {} released {} packet ids",
                self.id,
                released.len()
            );
        }
        self.closed_tx.send_replace(true);
    }

    /// 等待拆除完成
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 传输层的发送队列已排空
    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            self.resume_delivery();
        }
    }

    pub(super) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// 投递时传输层返回了 Suspend，引擎已经知道
    pub(super) fn mark_suspended(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    /// 回复报文时传输层返回了 Suspend，需要通知引擎
    fn suspend(&self) {
        if self.suspended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session().and_then(|s| s.engine_session()) {
            let engine = self.services.engine.clone();
            self.spawn_engine("suspend delivery", async move {
                engine.suspend_delivery(session).await
            });
        }
    }

    pub(super) fn resume_delivery(&self) {
        if let Some(session) = self.session().and_then(|s| s.engine_session()) {
            let engine = self.services.engine.clone();
            self.spawn_engine("resume delivery", async move {
                engine.resume_delivery(session).await
            });
        }
    }

    /// 确认一次投递
    pub(super) fn acknowledge(&self, delivery: Option<DeliveryHandle>) {
        let session = self.session().and_then(|s| s.engine_session());
        if let (Some(delivery), Some(session)) = (delivery, session) {
            let engine = self.services.engine.clone();
            self.spawn_engine("acknowledge", async move {
                engine.acknowledge(session, delivery).await
            });
        }
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_access.store(now, Ordering::SeqCst);
        self.probed.store(false, Ordering::SeqCst);
    }
}

/// 按提交顺序执行完成队列
async fn run_jobs<E: Engine, H: Hook>(
    conn: Weak<Connection<E, H>>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    while let Some((job, guard)) = jobs.recv().await {
        let reply = job.await;
        if let Some(conn) = conn.upgrade() {
            conn.apply(reply);
        }
        drop(guard);
    }
}

impl<E: Engine, H: Hook> Sweep for Connection<E, H> {
    fn sweep(&self, now: Instant) {
        if self.state() != State::Connected {
            return;
        }
        if self.retry_resume.swap(false, Ordering::SeqCst) && !self.is_suspended() {
            self.resume_delivery();
        }

        let keep_alive = match self.session() {
            Some(session) if session.keep_alive > 0 => {
                Duration::from_secs(session.keep_alive.into())
            }
            _ => return,
        };
        let last = Duration::from_millis(self.last_access.load(Ordering::SeqCst));
        let idle = now.saturating_duration_since(self.created).saturating_sub(last);
        if idle > keep_alive * 3 / 2 {
            self.fail(&Error::KeepAliveTimeout);
        } else if idle > keep_alive && !self.probed.swap(true, Ordering::SeqCst) {
            trace!("connection {} idle for {:?}, probing", self.id, idle);
            self.transport.send(Bytes::new(), FrameKind::Probe);
        }
    }

    fn shutdown(&self) {
        self.fail(&Error::ServerShuttingDown);
    }
}

/// 引擎通知：相同 client id 的客户端在别处上线
pub(super) struct StealNotice<E: Engine, H: Hook> {
    pub conn: Weak<Connection<E, H>>,
}

impl<E: Engine, H: Hook> StealCallback for StealNotice<E, H> {
    fn steal(&self) {
        let conn = match self.conn.upgrade() {
            Some(conn) => conn,
            None => return,
        };
        if conn.transition(State::Connected, State::Stolen) {
            if conn.protocol().is_v5() {
                let disconnect = Disconnect::new(ReasonCode::SessionTakenOver);
                conn.send_with(&Packet::Disconnect(disconnect), Protocol::V5);
            }
            conn.close(ReturnCode::SessionTakenOver, false, "session taken over");
        } else if conn.transition(State::InProgress, State::Stolen) {
            // CONNECT 处理完成时会发现状态已经改变
            debug!("connection {} stolen while connecting", conn.id);
        }
    }
}
