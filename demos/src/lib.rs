use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};
use mqtt_engine::config::Config;

/// 环境变量前缀，例如 MQTT_ENGINE_CLIENT_ADDR
pub const ENV_PREFIX: &str = "MQTT_ENGINE_";

/// 可以通过环境变量覆盖的配置项
#[derive(Debug, Default, serde::Deserialize)]
pub struct Overrides {
    pub client_addr: Option<String>,
    pub max_keepalive: Option<u16>,
    pub receive_maximum: Option<u16>,
    pub max_message_size: Option<usize>,
    pub allow_durable: Option<bool>,
    pub allow_persistent_messages: Option<bool>,
    pub allow_proxy: Option<bool>,
    pub max_expiry_interval: Option<u32>,
}

impl Overrides {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed(ENV_PREFIX).from_env()
    }

    pub fn apply(self, cfg: &mut Config) {
        if let Some(addr) = self.client_addr {
            cfg.broker.client_addr = addr;
        }
        if let Some(keepalive) = self.max_keepalive {
            cfg.mqtt.max_keepalive = keepalive;
        }
        if let Some(receive_maximum) = self.receive_maximum {
            cfg.mqtt.receive_maximum = receive_maximum;
        }
        if let Some(size) = self.max_message_size {
            cfg.mqtt.max_message_size = size;
        }
        if let Some(allow) = self.allow_durable {
            cfg.mqtt.allow_durable = allow;
        }
        if let Some(allow) = self.allow_persistent_messages {
            cfg.mqtt.allow_persistent_messages = allow;
        }
        if let Some(allow) = self.allow_proxy {
            cfg.mqtt.allow_proxy = allow;
        }
        if let Some(expiry) = self.max_expiry_interval {
            cfg.session.max_expiry_interval = expiry;
        }
    }
}

/// 日志级别取自 RUST_LOG，默认 info
/// 返回的 handle 需要一直持有
pub fn init_logger() -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str("info")?
        .format(flexi_logger::detailed_format)
        .start()
}
