//! v5 主题别名

use std::collections::HashMap;

/// 入站别名表：客户端指定别名，服务端记住对应的主题
#[derive(Debug)]
pub struct InboundAliases {
    /// 下标即别名，0 不使用
    topics: Vec<Option<String>>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Topic alias {0} out of range")]
    OutOfRange(u16),
    #[error("Topic alias {0} not learned")]
    Unknown(u16),
}

impl InboundAliases {
    pub fn new(maximum: u16) -> Self {
        Self {
            topics: vec![None; maximum as usize + 1],
        }
    }

    /// 解析别名：主题非空时记住（替换旧值），主题为空时查表
    pub fn resolve(&mut self, alias: u16, topic: &str) -> Result<String, Error> {
        if alias == 0 || alias as usize >= self.topics.len() {
            return Err(Error::OutOfRange(alias));
        }

        let slot = &mut self.topics[alias as usize];
        if topic.is_empty() {
            return slot.clone().ok_or(Error::Unknown(alias));
        }
        *slot = Some(topic.to_owned());
        Ok(topic.to_owned())
    }
}

/// 出站别名的分配结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundAlias {
    /// 首次使用，需要同时发送主题和别名
    New(u16),
    /// 已经建立，只发送别名
    Existing(u16),
}

/// 出站别名表：服务端按客户端的 TopicAliasMaximum 分配
#[derive(Debug)]
pub struct OutboundAliases {
    topics: Vec<Option<String>>,
    aliases: HashMap<String, u16>,
    /// 表满后下一个被替换的别名
    next: u16,
}

impl OutboundAliases {
    pub fn new(maximum: u16) -> Self {
        Self {
            topics: vec![None; maximum as usize + 1],
            aliases: HashMap::new(),
            next: 0,
        }
    }

    fn maximum(&self) -> u16 {
        (self.topics.len() - 1) as u16
    }

    /// 为主题分配别名，客户端不支持别名时返回 None
    pub fn assign(&mut self, topic: &str) -> Option<OutboundAlias> {
        let maximum = self.maximum();
        if maximum == 0 {
            return None;
        }
        if let Some(alias) = self.aliases.get(topic) {
            return Some(OutboundAlias::Existing(*alias));
        }

        // 轮转替换
        self.next = if self.next >= maximum { 1 } else { self.next + 1 };
        let alias = self.next;
        if let Some(old) = self.topics[alias as usize].replace(topic.to_owned()) {
            self.aliases.remove(&old);
        }
        self.aliases.insert(topic.to_owned(), alias);
        Some(OutboundAlias::New(alias))
    }

    /// 撤销刚分配的别名（消息最终没有发送）
    pub fn forget(&mut self, alias: u16) {
        if let Some(Some(topic)) = self.topics.get_mut(alias as usize).map(Option::take) {
            self.aliases.remove(&topic);
        }
    }
}
