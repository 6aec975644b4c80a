//! 配置
//!
//! 从 toml 文件读取，除了监听地址之外所有字段都有默认值。

use tokio::{fs, io::AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse config file error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub broker: Broker,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub msgid: MsgId,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Broker {
    /// 客户端监听地址
    pub client_addr: String,
}

/// 协议策略
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Mqtt {
    /// 消息负载上限
    pub max_message_size: usize,
    /// 报文上限，默认为 max_message_size + 64KiB
    pub max_packet_size: Option<usize>,
    /// 服务端同时处理的 QoS>0 入站消息上限
    pub receive_maximum: u16,
    /// 入站主题别名上限，0 表示不支持
    pub topic_alias_maximum: u16,
    /// keepalive 上限（秒），0 表示不限制
    pub max_keepalive: u16,
    pub max_topic_levels: usize,
    pub max_client_id_len: usize,
    /// CONNECT 处理完成前最多缓存的字节数
    pub connect_buffer_max: usize,
    pub allow_durable: bool,
    pub allow_persistent_messages: bool,
    pub allow_bridge: bool,
    pub allow_proxy: bool,
    /// 共享订阅允许持久和非持久客户端混合加入
    pub allow_mixed_durability: bool,
    pub keepalive_sweep_ms: u64,
    /// 出站报文 id 的上限
    pub outbound_msgid_max: u16,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024 * 1024,
            max_packet_size: None,
            receive_maximum: 128,
            topic_alias_maximum: 16,
            max_keepalive: 0,
            max_topic_levels: 32,
            max_client_id_len: 1024,
            connect_buffer_max: 64 * 1024,
            allow_durable: true,
            allow_persistent_messages: true,
            allow_bridge: false,
            allow_proxy: false,
            allow_mixed_durability: true,
            keepalive_sweep_ms: 1000,
            outbound_msgid_max: u16::MAX,
        }
    }
}

impl Mqtt {
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
            .unwrap_or(self.max_message_size + 64 * 1024)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Session {
    /// 会话过期时间上限（秒）
    pub max_expiry_interval: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            max_expiry_interval: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct MsgId {
    /// 报文 id 表的分片数
    pub shards: usize,
    /// 每个连接最多缓存的空闲表项
    pub free_list_max: usize,
}

impl Default for MsgId {
    fn default() -> Self {
        Self {
            shards: 64,
            free_list_max: 16,
        }
    }
}

impl Config {
    /// 只指定监听地址，其余使用默认值
    pub fn new(client_addr: impl Into<String>) -> Self {
        Self {
            broker: Broker {
                client_addr: client_addr.into(),
            },
            mqtt: Mqtt::default(),
            session: Session::default(),
            msgid: MsgId::default(),
        }
    }

    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }
}
