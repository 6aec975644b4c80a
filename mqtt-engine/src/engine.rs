//! 引擎边界
//!
//! 协议层通过 [`Engine`] 调用外部的消息引擎（客户端状态、会话、订阅、消费者、消息）。
//! 所有调用都是异步的，同步完成的实现直接返回就绪的 future，两种完成方式走同一条代码路径。

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::network::{
    packet::{Properties, QoS, RetainHandling},
    topic::Selector,
};

pub mod memory;
mod subscription_tree;

pub use memory::MemoryEngine;

/// 引擎侧客户端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u64);

/// 引擎侧会话
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// 引擎侧消费者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(pub u64);

/// 一次投递，确认时需要带回
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Not authorized")]
    NotAuthorized,
    #[error("Not found")]
    NotFound,
    #[error("Already exists")]
    Exists,
    #[error("Shared subscription mismatch")]
    ShareMismatch,
    #[error("Quota exceeded")]
    QuotaExceeded,
    #[error("Destination full")]
    DestinationFull,
    #[error("Server busy")]
    ServerBusy,
    #[error("Allocation failure")]
    AllocationFailure,
    #[error("Object destroyed")]
    Destroyed,
    #[error("Engine error: {0}")]
    Other(String),
}

/// 创建客户端状态的参数
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub client_id: String,
    /// 会话在断开后是否保留
    pub durable: bool,
    /// 会话过期时间（秒），u32::MAX 表示永不过期
    pub expiry: u32,
    /// 丢弃之前保留的会话
    pub clean_start: bool,
    /// 租户
    pub domain: Option<String>,
    pub max_connections: Option<u32>,
}

/// 销毁客户端状态的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientClose {
    /// 丢弃会话（非持久会话，或者过期时间为 0）
    pub discard_session: bool,
    /// 非正常断开，需要发布遗嘱
    pub send_will: bool,
    /// 断开时生效的会话过期时间，v5 的 DISCONNECT 可能修改过
    pub expiry: u32,
}

/// 消息的 v5 属性中随消息转发的部分
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub payload_format_indicator: Option<u8>,
    /// 剩余有效期（秒），投递时由引擎更新为剩余时间
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

impl MessageProperties {
    pub fn from_properties(properties: &Properties) -> Self {
        Self {
            payload_format_indicator: properties.payload_format_indicator,
            message_expiry_interval: properties.message_expiry_interval,
            content_type: properties.content_type.clone(),
            response_topic: properties.response_topic.clone(),
            correlation_data: properties.correlation_data.clone(),
            user_properties: properties.user_properties.clone(),
        }
    }

    /// 写入 PUBLISH 属性
    pub fn apply(&self, properties: &mut Properties) {
        properties.payload_format_indicator = self.payload_format_indicator;
        properties.message_expiry_interval = self.message_expiry_interval;
        properties.content_type = self.content_type.clone();
        properties.response_topic = self.response_topic.clone();
        properties.correlation_data = self.correlation_data.clone();
        properties.user_properties = self.user_properties.clone();
    }
}

/// 引擎中的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    /// 是否需要持久化
    pub persistent: bool,
    pub payload: Bytes,
    pub properties: MessageProperties,
    /// 发布者的 client id，用于 no-local
    pub origin: Option<String>,
}

/// 遗嘱
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub message: Message,
    /// 延迟发布（秒）
    pub delay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Delivered,
    /// 没有任何订阅匹配，不是错误
    NoSubscribers,
}

/// 引擎投递给消费者的消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub message: Message,
    /// 之前投递过但未确认
    pub redelivered: bool,
    /// 订阅时补发的保留消息
    pub retained: bool,
}

/// 共享订阅的所属客户端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedOwner {
    Durable,
    NonDurable,
    /// 持久和非持久成员可以混合加入
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    NonDurable,
    Durable,
    Shared(SharedOwner),
}

impl SubscriptionKind {
    pub fn is_shared(&self) -> bool {
        matches!(self, SubscriptionKind::Shared(_))
    }
}

/// 引擎中记录的订阅
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// 订阅名，共享订阅使用组名
    pub name: String,
    /// 用于匹配的过滤器
    pub filter: String,
    pub qos: QoS,
    pub selector: Option<Selector>,
    pub kind: SubscriptionKind,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub subscription_id: Option<u32>,
}

/// 创建消费者的参数
#[derive(Debug, Clone)]
pub struct ConsumerRequest {
    pub name: String,
    pub shared: bool,
    pub retain_handling: RetainHandling,
    /// 订阅是新建的（用于 retain handling = 1）
    pub new_subscription: bool,
}

/// 消费者对一次投递的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverStatus {
    /// 已接收，可以继续投递，等待确认
    Accepted,
    /// 已接收并且不需要确认（QoS 0，或者被丢弃）
    Consumed,
    /// 已接收，但在 resume 之前暂停投递
    Suspend,
    /// 未接收，resume 之后重新投递
    Full,
    /// 连接已关闭，未接收
    Closed,
}

/// 消费者回调，可能在任意线程上被调用
pub trait Deliver: Send + Sync {
    fn deliver(&self, delivery: Delivery) -> DeliverStatus;
}

/// 相同 client id 的新连接上线时，旧连接收到的通知
pub trait StealCallback: Send + Sync {
    fn steal(&self);
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// 创建客户端状态，返回 (句柄, 是否存在之前保留的会话)
    /// 已存在同一个 client id 的在线客户端时，调用其 steal 回调
    async fn create_client(
        &self,
        request: ClientRequest,
        steal: Arc<dyn StealCallback>,
    ) -> Result<(ClientHandle, bool), EngineError>;

    async fn destroy_client(&self, client: ClientHandle, close: ClientClose)
        -> Result<(), EngineError>;

    async fn create_session(&self, client: ClientHandle) -> Result<SessionHandle, EngineError>;

    async fn set_will(&self, client: ClientHandle, will: Will) -> Result<(), EngineError>;

    async fn put(&self, session: SessionHandle, message: Message)
        -> Result<PutOutcome, EngineError>;

    /// shared 为 true 时在全局共享订阅中查找
    async fn find_subscription(
        &self,
        client: ClientHandle,
        name: &str,
        shared: bool,
    ) -> Result<Option<SubscriptionInfo>, EngineError>;

    /// 共享订阅已存在时加入该组
    async fn create_subscription(
        &self,
        client: ClientHandle,
        info: SubscriptionInfo,
    ) -> Result<(), EngineError>;

    /// 只能修改 subscription_id 和 retain_as_published
    async fn update_subscription(
        &self,
        client: ClientHandle,
        info: SubscriptionInfo,
    ) -> Result<(), EngineError>;

    /// 共享订阅时退出该组
    async fn destroy_subscription(
        &self,
        client: ClientHandle,
        name: &str,
        shared: bool,
    ) -> Result<(), EngineError>;

    async fn list_subscriptions(
        &self,
        client: ClientHandle,
    ) -> Result<Vec<SubscriptionInfo>, EngineError>;

    async fn create_consumer(
        &self,
        session: SessionHandle,
        request: ConsumerRequest,
        deliver: Arc<dyn Deliver>,
    ) -> Result<ConsumerHandle, EngineError>;

    async fn destroy_consumer(&self, consumer: ConsumerHandle) -> Result<(), EngineError>;

    /// 确认一次投递
    async fn acknowledge(
        &self,
        session: SessionHandle,
        delivery: DeliveryHandle,
    ) -> Result<(), EngineError>;

    /// 从订阅中取出一条消息，不经过消费者回调
    async fn get_message(
        &self,
        session: SessionHandle,
        name: &str,
    ) -> Result<Option<Delivery>, EngineError>;

    async fn suspend_delivery(&self, session: SessionHandle) -> Result<(), EngineError>;

    async fn resume_delivery(&self, session: SessionHandle) -> Result<(), EngineError>;
}
