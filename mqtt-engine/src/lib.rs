//! mqtt 协议引擎，用户可以使用此库构建自己的 mqtt broker
//!
//! 协议层负责报文解析和连接状态，消息的存储和分发交给实现了 [`engine::Engine`] 的引擎，
//! 认证和授权交给实现了 [`Hook`] 的回调。

use async_trait::async_trait;
use network::packet::{Login, Protocol};

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod protocol;

/// 认证和授权时可以使用的客户端信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: String,
    pub client_addr: String,
    pub protocol: Protocol,
    /// 租户
    pub domain: Option<String>,
    /// 代理校验过的证书名
    pub certificate_name: Option<String>,
    pub username: Option<String>,
}

/// 认证结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Allowed,
    BadCredentials,
    NotAuthorized,
    ServerUnavailable,
}

/// 需要授权的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRequest {
    pub action: Action,
    /// 发布的主题，或者订阅的过滤器
    pub name: String,
}

/// 授权服务返回的上下文，连接会缓存下来，下一次查询时带回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyContext(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorization {
    pub allowed: bool,
    pub context: Option<PolicyContext>,
}

impl Authorization {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            context: None,
        }
    }

    pub fn deny() -> Self {
        Self {
            allowed: false,
            context: None,
        }
    }
}

/// mqtt事件发生时的回调，由用户实现
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// 客户端认证
    async fn authenticate(&self, client: &ClientInfo, login: Option<&Login>) -> AuthResult;
    /// 发布和订阅授权
    async fn authorize(
        &self,
        client: &ClientInfo,
        request: &PolicyRequest,
        context: Option<PolicyContext>,
    ) -> Authorization;
    /// 客户端上线
    async fn connected(&self, client_id: &str);
    /// 客户端连接断开
    async fn disconnected(&self, client_id: &str);
}

pub struct HookNoop;

#[async_trait]
impl Hook for HookNoop {
    async fn authenticate(&self, _client: &ClientInfo, _login: Option<&Login>) -> AuthResult {
        AuthResult::Allowed
    }

    async fn authorize(
        &self,
        _client: &ClientInfo,
        _request: &PolicyRequest,
        _context: Option<PolicyContext>,
    ) -> Authorization {
        Authorization::allow()
    }

    async fn connected(&self, _client_id: &str) {}

    async fn disconnected(&self, _client_id: &str) {}
}
