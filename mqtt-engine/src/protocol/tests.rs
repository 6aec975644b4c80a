//! 连接状态机的端到端测试：原始报文进，原始报文出，引擎使用内存引擎

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    sync::Notify,
    time::{self, Instant},
};

use crate::{
    config::Config,
    engine::MemoryEngine,
    network::{
        packet::{
            Ack, Connect, Disconnect, Extension, FetchedMessage, LastWill, Login, Packet,
            Properties, Protocol, ProxyFlags, Publish, QoS, ReadOptions, ReasonCode, Subscribe,
            SubscribeFilter, SubscriptionEntry, SubscriptionOptions, Unsubscribe,
        },
        CloseReason, FrameKind, SendStatus, Transport,
    },
    Action, AuthResult, Authorization, ClientInfo, Hook, HookNoop, PolicyContext, PolicyRequest,
};

use super::{Connection, Error, ReturnCode, Services};

#[derive(Default)]
struct MockTransport {
    frames: Mutex<VecDeque<Bytes>>,
    probes: AtomicUsize,
    closed: Mutex<Option<CloseReason>>,
}

impl MockTransport {
    fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.closed.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: Bytes, kind: FrameKind) -> SendStatus {
        if self.closed.lock().unwrap().is_some() {
            return SendStatus::Closed;
        }
        if kind == FrameKind::Probe {
            self.probes.fetch_add(1, Ordering::SeqCst);
            return SendStatus::Ok;
        }
        self.frames.lock().unwrap().push_back(frame);
        SendStatus::Ok
    }

    fn close(&self, reason: &CloseReason) {
        let mut closed = self.closed.lock().unwrap();
        if closed.is_none() {
            *closed = Some(reason.clone());
        }
    }

    fn client_addr(&self) -> &str {
        "10.0.0.1:5000"
    }
}

/// 认证或者发布授权在放行之前一直等待
#[derive(Default)]
struct GatedHook {
    auth: Option<Arc<Notify>>,
    publish: Option<Arc<Notify>>,
}

#[async_trait]
impl Hook for GatedHook {
    async fn authenticate(&self, _client: &ClientInfo, _login: Option<&Login>) -> AuthResult {
        if let Some(gate) = &self.auth {
            gate.notified().await;
        }
        AuthResult::Allowed
    }

    async fn authorize(
        &self,
        _client: &ClientInfo,
        request: &PolicyRequest,
        _context: Option<PolicyContext>,
    ) -> Authorization {
        if let (Action::Publish, Some(gate)) = (request.action, &self.publish) {
            gate.notified().await;
        }
        Authorization::allow()
    }

    async fn connected(&self, _client_id: &str) {}

    async fn disconnected(&self, _client_id: &str) {}
}

struct Client<H: Hook> {
    conn: Arc<Connection<MemoryEngine, H>>,
    transport: Arc<MockTransport>,
    protocol: Protocol,
}

impl<H: Hook> Client<H> {
    fn new(services: &Services<MemoryEngine, H>, protocol: Protocol) -> Self {
        let transport = Arc::new(MockTransport::default());
        let conn = Connection::new(services.clone(), transport.clone());
        Self {
            conn,
            transport,
            protocol,
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), Error> {
        let mut stream = BytesMut::from(&packet.to_bytes(self.protocol).unwrap()[..]);
        self.conn.receive(&mut stream).await
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut stream = BytesMut::from(bytes);
        self.conn.receive(&mut stream).await
    }

    /// 等待并取出 n 个原始帧
    async fn frames(&self, n: usize) -> Vec<Bytes> {
        eventually(|| self.transport.frame_count() >= n).await;
        let mut frames = self.transport.frames.lock().unwrap();
        let taken = frames.drain(..n).collect();
        taken
    }

    async fn packets(&self, n: usize) -> Vec<Packet> {
        let options = ReadOptions {
            protocol: self.protocol,
            proxy: true,
            max_packet_size: usize::MAX,
        };
        self.frames(n)
            .await
            .into_iter()
            .map(|frame| Packet::read_from(&mut BytesMut::from(&frame[..]), &options).unwrap())
            .collect()
    }

    async fn packet(&self) -> Packet {
        self.packets(1).await.remove(0)
    }

    async fn connect(&self, client_id: &str) {
        self.connect_with(connect(self.protocol, client_id, true, 0))
            .await;
    }

    /// 发送 CONNECT，返回 CONNACK 中的 session present
    async fn connect_with(&self, connect: Connect) -> bool {
        self.send(Packet::Connect(connect)).await.unwrap();
        match self.packet().await {
            Packet::ConnAck(connack) => {
                assert_eq!(connack.code, ReasonCode::Success);
                connack.session_present
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    /// 取出一个代理扩展应答
    async fn extension_reply(&self) -> Extension {
        let frame = self.frames(1).await.remove(0);
        assert!(frame[1] < 0x80, "reply longer than one length byte");
        Extension::read_reply(frame[0] & 0x0F, frame.slice(2..)).unwrap()
    }

    async fn delivered(&self) -> Publish {
        match self.packet().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn subscribe(&self, packet_id: u16, filter: &str, qos: QoS) -> Vec<ReasonCode> {
        let subscribe = Subscribe {
            packet_id,
            filters: vec![SubscribeFilter {
                filter: filter.to_owned(),
                options: SubscriptionOptions::new(qos),
            }],
            properties: Properties::default(),
        };
        self.send(Packet::Subscribe(subscribe)).await.unwrap();
        match self.packet().await {
            Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback.return_codes
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&self, topic: &str, qos: QoS, packet_id: u16, dup: bool) -> Result<(), Error> {
        let mut publish = Publish::new(topic, qos, Bytes::from_static(b"hello"));
        publish.packet_id = packet_id;
        publish.dup = dup;
        self.send(Packet::Publish(publish)).await
    }

    async fn idle(&self) {
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(self.transport.frame_count(), 0);
    }
}

fn services<H: Hook>(hook: H) -> Services<MemoryEngine, H> {
    services_with(Config::new("127.0.0.1:0"), hook)
}

fn services_with<H: Hook>(config: Config, hook: H) -> Services<MemoryEngine, H> {
    Services::new(config, Arc::new(MemoryEngine::new()), Arc::new(hook))
}

fn connect(protocol: Protocol, client_id: &str, clean_start: bool, keep_alive: u16) -> Connect {
    Connect {
        protocol,
        bridge: false,
        proxy: None,
        keep_alive,
        client_id: client_id.to_owned(),
        clean_start,
        properties: Properties::default(),
        last_will: None,
        login: None,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(5), async {
        while !condition() {
            time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn connect_then_ping() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V4);

    // MQTT 3.1.1 CONNECT, clean session, keepalive 60, client id "c1"
    client
        .send_raw(&[
            0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02,
            b'c', b'1',
        ])
        .await
        .unwrap();
    assert_eq!(&client.frames(1).await[0][..], &[0x20, 0x02, 0x00, 0x00]);
    assert!(services.engine.is_online("c1"));

    client.send_raw(&[0xC0, 0x00]).await.unwrap();
    assert_eq!(&client.frames(1).await[0][..], &[0xD0, 0x00]);
    assert_eq!(client.conn.client_id().as_deref(), Some("c1"));
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V4);

    let result = client.send(Packet::PingReq).await;
    assert!(matches!(result, Err(Error::ConnectFirst)));
    let reason = client.transport.close_reason().unwrap();
    assert_eq!(reason.rc, ReturnCode::ConnectFirst);
    assert!(!reason.clean);
    assert_eq!(client.transport.frame_count(), 0);
    client.conn.closed().await;
}

#[tokio::test]
async fn empty_client_id_requires_clean_session() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V4);

    let result = client
        .send(Packet::Connect(connect(Protocol::V4, "", false, 0)))
        .await;
    assert!(matches!(
        result,
        Err(Error::Rejected(ReturnCode::BadIdentifier))
    ));
    assert_eq!(&client.frames(1).await[0][..], &[0x20, 0x02, 0x00, 0x02]);
    assert_eq!(
        client.transport.close_reason().unwrap().rc,
        ReturnCode::BadIdentifier
    );
}

#[tokio::test]
async fn v5_assigns_client_id() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V5);

    client
        .send(Packet::Connect(connect(Protocol::V5, "", true, 0)))
        .await
        .unwrap();
    let connack = match client.packet().await {
        Packet::ConnAck(connack) => connack,
        other => panic!("expected CONNACK, got {:?}", other),
    };
    assert_eq!(connack.code, ReasonCode::Success);
    let assigned = connack.properties.assigned_client_identifier.unwrap();
    assert!(assigned.starts_with("_10.0.0.1:5000_"));
    assert_eq!(client.conn.client_id(), Some(assigned));
    assert_eq!(connack.properties.receive_maximum, Some(128));
}

#[tokio::test]
async fn packets_wait_for_connack() {
    let gate = Arc::new(Notify::new());
    let services = services(GatedHook {
        auth: Some(gate.clone()),
        ..Default::default()
    });
    let client = Client::new(&services, Protocol::V4);

    let mut stream = BytesMut::new();
    Packet::Connect(connect(Protocol::V4, "c1", true, 0))
        .write(Protocol::V4, &mut stream)
        .unwrap();
    Packet::PingReq.write(Protocol::V4, &mut stream).unwrap();
    client.conn.receive(&mut stream).await.unwrap();
    assert!(stream.is_empty());
    client.idle().await;

    gate.notify_one();
    let packets = client.packets(2).await;
    assert!(matches!(packets[0], Packet::ConnAck(_)));
    assert_eq!(packets[1], Packet::PingResp);
}

#[tokio::test]
async fn qos1_publish_is_delivered_and_acknowledged() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V4);
    client.connect("c1").await;
    assert_eq!(
        client.subscribe(1, "a/+", QoS::AtLeastOnce).await,
        vec![ReasonCode::GrantedQoS1]
    );

    client.publish("a/b", QoS::AtLeastOnce, 7, false).await.unwrap();
    let packets = client.packets(2).await;
    let delivered = packets
        .iter()
        .find_map(|packet| match packet {
            Packet::Publish(publish) => Some(publish.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(delivered.topic, "a/b");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    assert_eq!(&delivered.payload[..], b"hello");
    assert!(packets.contains(&Packet::PubAck(Ack::new(7))));
    assert_eq!(services.engine.unacked_count(), 1);

    client
        .send(Packet::PubAck(Ack::new(delivered.packet_id)))
        .await
        .unwrap();
    eventually(|| services.engine.unacked_count() == 0).await;
}

#[tokio::test]
async fn qos2_retransmit_is_merged() {
    let gate = Arc::new(Notify::new());
    let services = services(GatedHook {
        publish: Some(gate.clone()),
        ..Default::default()
    });
    let client = Client::new(&services, Protocol::V4);
    client.connect("c1").await;

    client.publish("t", QoS::ExactlyOnce, 5, false).await.unwrap();
    client.publish("t", QoS::ExactlyOnce, 5, true).await.unwrap();
    client.idle().await;

    gate.notify_one();
    let packets = client.packets(2).await;
    assert_eq!(packets, vec![Packet::PubRec(Ack::new(5)); 2]);

    client.send(Packet::PubRel(Ack::new(5))).await.unwrap();
    assert_eq!(client.packet().await, Packet::PubComp(Ack::new(5)));

    // 重复的 PUBREL 照常回复
    client.send(Packet::PubRel(Ack::new(5))).await.unwrap();
    assert_eq!(client.packet().await, Packet::PubComp(Ack::new(5)));
}

#[tokio::test]
async fn qos2_id_reuse_without_dup_is_protocol_error() {
    let gate = Arc::new(Notify::new());
    let services = services(GatedHook {
        publish: Some(gate),
        ..Default::default()
    });
    let client = Client::new(&services, Protocol::V4);
    client.connect("c1").await;

    client.publish("t", QoS::ExactlyOnce, 9, false).await.unwrap();
    let result = client.publish("t", QoS::ExactlyOnce, 9, false).await;
    assert!(matches!(result, Err(Error::Protocol(_))));
    assert_eq!(
        client.transport.close_reason().unwrap().rc,
        ReturnCode::ProtocolError
    );
}

#[tokio::test(start_paused = true)]
async fn keepalive_probe_then_timeout() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V4);
    client
        .send(Packet::Connect(connect(Protocol::V4, "c1", true, 2)))
        .await
        .unwrap();
    assert!(matches!(client.packet().await, Packet::ConnAck(_)));

    time::advance(Duration::from_millis(2_500)).await;
    services.keepalive.sweep(Instant::now());
    assert_eq!(client.transport.probes.load(Ordering::SeqCst), 1);
    assert!(client.transport.close_reason().is_none());

    time::advance(Duration::from_millis(1_000)).await;
    services.keepalive.sweep(Instant::now());
    assert_eq!(
        client.transport.close_reason().unwrap().rc,
        ReturnCode::KeepAliveTimeout
    );
    client.conn.closed().await;
    assert!(!services.engine.is_online("c1"));
}

#[tokio::test]
async fn session_takeover_disconnects_old_connection() {
    let services = services(HookNoop);
    let old = Client::new(&services, Protocol::V5);
    old.connect("same").await;

    let new = Client::new(&services, Protocol::V5);
    new.connect("same").await;

    match old.packet().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason, ReasonCode::SessionTakenOver)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
    assert_eq!(
        old.transport.close_reason().unwrap().rc,
        ReturnCode::SessionTakenOver
    );
    old.conn.closed().await;
    assert!(services.engine.is_online("same"));
    assert!(new.transport.close_reason().is_none());
}

#[tokio::test]
async fn resubscribe_with_new_qos_recreates_subscription() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V4);
    client.connect("c1").await;

    assert_eq!(
        client.subscribe(1, "t", QoS::AtMostOnce).await,
        vec![ReasonCode::Success]
    );
    assert_eq!(
        client.subscribe(2, "t", QoS::AtLeastOnce).await,
        vec![ReasonCode::GrantedQoS1]
    );

    client.publish("t", QoS::AtLeastOnce, 3, false).await.unwrap();
    let packets = client.packets(2).await;
    let qos = packets.iter().find_map(|packet| match packet {
        Packet::Publish(publish) => Some(publish.qos),
        _ => None,
    });
    assert_eq!(qos, Some(QoS::AtLeastOnce));
    assert!(packets.contains(&Packet::PubAck(Ack::new(3))));
    client.idle().await;
}

#[tokio::test]
async fn unsubscribe_unknown_filter() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V5);
    client.connect("c1").await;
    client.subscribe(1, "a/b", QoS::AtMostOnce).await;

    let unsubscribe = Unsubscribe {
        packet_id: 2,
        filters: vec!["a/b".to_owned(), "x/y".to_owned()],
        properties: Properties::default(),
    };
    client.send(Packet::Unsubscribe(unsubscribe)).await.unwrap();
    match client.packet().await {
        Packet::UnsubAck(unsuback) => assert_eq!(
            unsuback.reasons,
            vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted]
        ),
        other => panic!("expected UNSUBACK, got {:?}", other),
    }

    client.publish("a/b", QoS::AtMostOnce, 0, false).await.unwrap();
    client.idle().await;
}

#[tokio::test]
async fn inbound_topic_alias() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V5);
    client.connect("c1").await;
    client.subscribe(1, "x/y", QoS::AtMostOnce).await;

    let mut first = Publish::new("x/y", QoS::AtMostOnce, Bytes::from_static(b"1"));
    first.properties.topic_alias = Some(1);
    client.send(Packet::Publish(first)).await.unwrap();
    let mut second = Publish::new("", QoS::AtMostOnce, Bytes::from_static(b"2"));
    second.properties.topic_alias = Some(1);
    client.send(Packet::Publish(second)).await.unwrap();

    let topics = client
        .packets(2)
        .await
        .into_iter()
        .map(|packet| match packet {
            Packet::Publish(publish) => (publish.topic, publish.payload),
            other => panic!("expected PUBLISH, got {:?}", other),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        topics,
        vec![
            ("x/y".to_owned(), Bytes::from_static(b"1")),
            ("x/y".to_owned(), Bytes::from_static(b"2")),
        ]
    );

    // 未建立的别名
    let mut unknown = Publish::new("", QoS::AtMostOnce, Bytes::from_static(b"3"));
    unknown.properties.topic_alias = Some(2);
    let result = client.send(Packet::Publish(unknown)).await;
    assert!(matches!(result, Err(Error::TopicAlias(_))));
    match client.packet().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason, ReasonCode::TopicAliasInvalid)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
}

#[tokio::test]
async fn receive_maximum_limits_outbound() {
    let services = services(HookNoop);
    let subscriber = Client::new(&services, Protocol::V5);
    let mut connect = connect(Protocol::V5, "s", true, 0);
    connect.properties.receive_maximum = Some(1);
    subscriber.send(Packet::Connect(connect)).await.unwrap();
    assert!(matches!(subscriber.packet().await, Packet::ConnAck(_)));
    subscriber.subscribe(1, "q", QoS::AtLeastOnce).await;

    let publisher = Client::new(&services, Protocol::V4);
    publisher.connect("p").await;
    publisher.publish("q", QoS::AtLeastOnce, 1, false).await.unwrap();
    assert_eq!(publisher.packet().await, Packet::PubAck(Ack::new(1)));
    publisher.publish("q", QoS::AtLeastOnce, 2, false).await.unwrap();
    assert_eq!(publisher.packet().await, Packet::PubAck(Ack::new(2)));

    let first = match subscriber.packet().await {
        Packet::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {:?}", other),
    };
    subscriber.idle().await;
    assert_eq!(services.engine.queued("s", "q"), Some(1));

    subscriber
        .send(Packet::PubAck(Ack::new(first.packet_id)))
        .await
        .unwrap();
    assert!(matches!(subscriber.packet().await, Packet::Publish(_)));
}

#[tokio::test]
async fn will_only_on_abnormal_close() {
    let services = services(HookNoop);
    let watcher = Client::new(&services, Protocol::V4);
    watcher.connect("w").await;
    watcher.subscribe(1, "will/#", QoS::AtMostOnce).await;

    let with_will = |client_id: &str, topic: &str| {
        let mut connect = connect(Protocol::V4, client_id, true, 0);
        connect.last_will = Some(LastWill {
            topic: topic.to_owned(),
            message: Bytes::from_static(b"bye"),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: Properties::default(),
        });
        Packet::Connect(connect)
    };

    // 正常断开不发布遗嘱
    let polite = Client::new(&services, Protocol::V4);
    polite.send(with_will("polite", "will/polite")).await.unwrap();
    assert!(matches!(polite.packet().await, Packet::ConnAck(_)));
    polite
        .send(Packet::Disconnect(Disconnect::new(ReasonCode::Success)))
        .await
        .unwrap();
    polite.conn.closed().await;
    assert!(polite.transport.close_reason().unwrap().clean);
    watcher.idle().await;

    let rude = Client::new(&services, Protocol::V4);
    rude.send(with_will("rude", "will/rude")).await.unwrap();
    assert!(matches!(rude.packet().await, Packet::ConnAck(_)));
    rude.conn.close(ReturnCode::Closed, false, "connection reset");
    rude.conn.closed().await;

    match watcher.packet().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "will/rude");
            assert_eq!(&publish.payload[..], b"bye");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn resubscribe_shared_with_new_qos() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V4);
    client.connect("c1").await;

    assert_eq!(
        client.subscribe(1, "$share/g/t", QoS::AtMostOnce).await,
        vec![ReasonCode::Success]
    );
    assert_eq!(
        client.subscribe(2, "$share/g/t", QoS::AtLeastOnce).await,
        vec![ReasonCode::GrantedQoS1]
    );

    client.publish("t", QoS::AtLeastOnce, 3, false).await.unwrap();
    let packets = client.packets(2).await;
    let qos = packets.iter().find_map(|packet| match packet {
        Packet::Publish(publish) => Some(publish.qos),
        _ => None,
    });
    assert_eq!(qos, Some(QoS::AtLeastOnce));
    assert!(packets.contains(&Packet::PubAck(Ack::new(3))));
    client.idle().await;
}

#[tokio::test]
async fn shared_durability_mismatch() {
    let mut config = Config::new("127.0.0.1:0");
    config.mqtt.allow_mixed_durability = false;
    let services = services_with(config, HookNoop);

    let durable = Client::new(&services, Protocol::V5);
    let mut request = connect(Protocol::V5, "a", true, 0);
    request.properties.session_expiry_interval = Some(100);
    durable.connect_with(request).await;
    assert_eq!(
        durable.subscribe(1, "$share/grp/topic", QoS::AtMostOnce).await,
        vec![ReasonCode::Success]
    );

    let transient = Client::new(&services, Protocol::V5);
    transient.connect("b").await;
    assert_eq!(
        transient
            .subscribe(1, "$share/grp/topic", QoS::AtMostOnce)
            .await,
        vec![ReasonCode::ImplementationSpecificError]
    );
    assert!(transient.transport.close_reason().is_none());
}

#[tokio::test]
async fn oversized_outbound_message_is_dropped() {
    let services = services(HookNoop);
    let subscriber = Client::new(&services, Protocol::V5);
    let mut request = connect(Protocol::V5, "s", true, 0);
    request.properties.maximum_packet_size = Some(32);
    subscriber.connect_with(request).await;
    subscriber.subscribe(1, "t", QoS::AtLeastOnce).await;

    let publisher = Client::new(&services, Protocol::V4);
    publisher.connect("p").await;
    let mut big = Publish::new("t", QoS::AtLeastOnce, Bytes::from(vec![0x42; 100]));
    big.packet_id = 1;
    publisher.send(Packet::Publish(big)).await.unwrap();
    assert_eq!(publisher.packet().await, Packet::PubAck(Ack::new(1)));
    subscriber.idle().await;
    assert_eq!(services.engine.unacked_count(), 0);
    assert_eq!(services.engine.queued("s", "t"), Some(0));

    // 放得下的消息照常投递
    publisher.publish("t", QoS::AtLeastOnce, 2, false).await.unwrap();
    let delivered = subscriber.delivered().await;
    assert_eq!(&delivered.payload[..], b"hello");
}

#[tokio::test]
async fn outbound_topic_alias() {
    let services = services(HookNoop);
    let subscriber = Client::new(&services, Protocol::V5);
    let mut request = connect(Protocol::V5, "s", true, 0);
    request.properties.topic_alias_maximum = Some(4);
    subscriber.connect_with(request).await;
    subscriber.subscribe(1, "sensor/+", QoS::AtMostOnce).await;

    let publisher = Client::new(&services, Protocol::V4);
    publisher.connect("p").await;
    publisher.publish("sensor/a", QoS::AtMostOnce, 0, false).await.unwrap();
    publisher.publish("sensor/a", QoS::AtMostOnce, 0, false).await.unwrap();
    publisher.publish("sensor/b", QoS::AtMostOnce, 0, false).await.unwrap();

    let first = subscriber.delivered().await;
    assert_eq!(first.topic, "sensor/a");
    assert_eq!(first.properties.topic_alias, Some(1));
    let second = subscriber.delivered().await;
    assert_eq!(second.topic, "");
    assert_eq!(second.properties.topic_alias, Some(1));
    let third = subscriber.delivered().await;
    assert_eq!(third.topic, "sensor/b");
    assert_eq!(third.properties.topic_alias, Some(2));
}

#[tokio::test]
async fn proxy_commands() {
    let mut config = Config::new("127.0.0.1:0");
    config.mqtt.allow_proxy = true;
    let services = services_with(config, HookNoop);

    let proxy = Client::new(&services, Protocol::V5);
    let mut request = connect(Protocol::V5, "px", true, 0);
    request.proxy = Some(ProxyFlags(0));
    request.properties.receive_maximum = Some(1);
    proxy.connect_with(request).await;

    proxy
        .send(Packet::Extension(Extension::Acl(vec![
            "jobs".to_owned(),
            "allowed/#".to_owned(),
        ])))
        .await
        .unwrap();
    assert_eq!(
        proxy.subscribe(1, "denied", QoS::AtMostOnce).await,
        vec![ReasonCode::NotAuthorized]
    );
    assert_eq!(
        proxy.subscribe(2, "jobs", QoS::AtLeastOnce).await,
        vec![ReasonCode::GrantedQoS1]
    );

    proxy
        .send(Packet::Extension(Extension::ListSubscriptions { request_id: 3 }))
        .await
        .unwrap();
    assert_eq!(
        proxy.extension_reply().await,
        Extension::SubscriptionList {
            request_id: 3,
            subscriptions: vec![SubscriptionEntry {
                name: "jobs".to_owned(),
                filter: "jobs".to_owned(),
                qos: QoS::AtLeastOnce,
            }],
        }
    );

    // 接收上限为 1，第二条留在队列里
    let publisher = Client::new(&services, Protocol::V4);
    publisher.connect("p").await;
    publisher.publish("jobs", QoS::AtLeastOnce, 1, false).await.unwrap();
    publisher.publish("jobs", QoS::AtLeastOnce, 2, false).await.unwrap();
    assert_eq!(publisher.packets(2).await.len(), 2);
    proxy.delivered().await;
    proxy.idle().await;
    assert_eq!(services.engine.queued("px", "jobs"), Some(1));

    proxy
        .send(Packet::Extension(Extension::Get {
            request_id: 4,
            name: "jobs".to_owned(),
        }))
        .await
        .unwrap();
    assert_eq!(
        proxy.extension_reply().await,
        Extension::GetReply {
            request_id: 4,
            message: Some(FetchedMessage {
                topic: "jobs".to_owned(),
                qos: QoS::AtLeastOnce,
                payload: Bytes::from_static(b"hello"),
            }),
        }
    );
    assert_eq!(services.engine.queued("px", "jobs"), Some(0));
    assert_eq!(services.engine.unacked_count(), 1);

    proxy
        .send(Packet::Extension(Extension::Get {
            request_id: 5,
            name: "jobs".to_owned(),
        }))
        .await
        .unwrap();
    assert_eq!(
        proxy.extension_reply().await,
        Extension::GetReply {
            request_id: 5,
            message: None,
        }
    );
}

#[tokio::test]
async fn durable_subscriptions_replayed_on_reconnect() {
    let services = services(HookNoop);
    let first = Client::new(&services, Protocol::V4);
    assert!(!first.connect_with(connect(Protocol::V4, "d", false, 0)).await);
    first.subscribe(1, "news", QoS::AtLeastOnce).await;
    first
        .send(Packet::Disconnect(Disconnect::new(ReasonCode::Success)))
        .await
        .unwrap();
    first.conn.closed().await;
    assert!(!services.engine.is_online("d"));

    let publisher = Client::new(&services, Protocol::V4);
    publisher.connect("p").await;
    publisher.publish("news", QoS::AtLeastOnce, 1, false).await.unwrap();
    assert_eq!(publisher.packet().await, Packet::PubAck(Ack::new(1)));
    assert_eq!(services.engine.queued("d", "news"), Some(1));

    let second = Client::new(&services, Protocol::V4);
    assert!(second.connect_with(connect(Protocol::V4, "d", false, 0)).await);
    let queued = second.delivered().await;
    assert_eq!(queued.topic, "news");
    assert_eq!(queued.qos, QoS::AtLeastOnce);
    second
        .send(Packet::PubAck(Ack::new(queued.packet_id)))
        .await
        .unwrap();

    // 恢复的订阅继续接收新消息
    publisher.publish("news", QoS::AtLeastOnce, 2, false).await.unwrap();
    assert_eq!(second.delivered().await.topic, "news");
}

#[tokio::test(start_paused = true)]
async fn disconnect_shortens_session_expiry() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V5);
    let mut request = connect(Protocol::V5, "c1", true, 0);
    request.properties.session_expiry_interval = Some(3600);
    client.connect_with(request).await;
    client.subscribe(1, "t", QoS::AtLeastOnce).await;

    let mut disconnect = Disconnect::new(ReasonCode::Success);
    disconnect.properties.session_expiry_interval = Some(1);
    client.send(Packet::Disconnect(disconnect)).await.unwrap();
    client.conn.closed().await;
    assert_eq!(services.engine.queued("c1", "t"), Some(0));

    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(services.engine.queued("c1", "t"), None);
}

#[tokio::test]
async fn zero_receive_maximum_is_refused() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V5);
    let mut request = connect(Protocol::V5, "c1", true, 0);
    request.properties.receive_maximum = Some(0);

    let result = client.send(Packet::Connect(request)).await;
    assert!(matches!(
        result,
        Err(Error::Rejected(ReturnCode::ProtocolError))
    ));
    match client.packet().await {
        Packet::ConnAck(connack) => assert_eq!(connack.code, ReasonCode::ProtocolError),
        other => panic!("expected CONNACK, got {:?}", other),
    }
    assert_eq!(
        client.transport.close_reason().unwrap().rc,
        ReturnCode::ProtocolError
    );
}

#[tokio::test]
async fn client_publish_with_subscription_identifier() {
    let services = services(HookNoop);
    let client = Client::new(&services, Protocol::V5);
    client.connect("c1").await;

    let mut publish = Publish::new("t", QoS::AtMostOnce, Bytes::from_static(b"x"));
    publish.properties.subscription_identifiers.push(3);
    let result = client.send(Packet::Publish(publish)).await;
    assert!(matches!(result, Err(Error::Protocol(_))));
    match client.packet().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason, ReasonCode::ProtocolError)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
}
