//! 订阅树
//!
//! 按过滤器的层级组织订阅，发布时沿着主题的层级查找所有匹配的过滤器。

use std::collections::HashMap;

#[derive(Debug)]
pub struct SubscriptionTree<T> {
    /// 订阅树的根节点，是个空节点
    root: SubscriptionNode<T>,
    /// 插入的每一个数据，分配一个唯一的 token 号，方便查询和删除
    token: u64,
}

impl<T> Default for SubscriptionTree<T> {
    fn default() -> Self {
        Self {
            root: SubscriptionNode::default(),
            token: 0,
        }
    }
}

impl<T> SubscriptionTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一个订阅记录
    pub fn insert(&mut self, filter: &str, data: T) -> u64 {
        let token = self.token;
        self.root.insert(filter, token, data);
        self.token += 1;

        token
    }

    /// 查找发布消息的主题匹配的记录
    pub fn matches(&self, topic: &str) -> Vec<&T> {
        let levels = topic.split('/').collect::<Vec<_>>();
        let mut matches = Vec::new();
        self.root.collect(&levels, true, &mut matches);
        matches
    }

    /// 删除订阅记录
    pub fn remove(&mut self, filter: &str, token: u64) -> Option<T> {
        self.root.remove(filter.split('/'), token)
    }

    pub fn is_empty(&self) -> bool {
        self.root.data.is_empty() && self.root.children.is_empty()
    }
}

/// 订阅树的节点
/// 每个客户端订阅的 filter 不固定，可能会挂在任何一个节点上
#[derive(Debug)]
struct SubscriptionNode<T> {
    /// 当前节点包含的数据
    /// key = token, value = data
    data: HashMap<u64, T>,
    /// 子节点 key = 过滤器的一层
    children: HashMap<String, SubscriptionNode<T>>,
}

impl<T> Default for SubscriptionNode<T> {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
            children: HashMap::new(),
        }
    }
}

impl<T> SubscriptionNode<T> {
    /// 将订阅加到当前节点的子树中
    fn insert(&mut self, filter: &str, token: u64, data: T) {
        let mut current_node = self;
        for path in filter.split('/') {
            current_node = current_node.children.entry(path.to_owned()).or_default();
        }
        current_node.data.insert(token, data);
    }

    /// 查找子树中和 topic 匹配的 filter
    /// 以 $ 开头的主题不会被首层的通配符匹配
    fn collect<'a>(&'a self, levels: &[&str], first: bool, matches: &mut Vec<&'a T>) {
        let (path, rest) = match levels.split_first() {
            Some(split) => split,
            None => {
                matches.extend(self.data.values());
                // a/# 同时匹配 a
                if let Some(node) = self.children.get("#") {
                    matches.extend(node.data.values());
                }
                return;
            }
        };

        if let Some(node) = self.children.get(*path) {
            node.collect(rest, false, matches);
        }
        if first && path.starts_with('$') {
            return;
        }
        if let Some(node) = self.children.get("+") {
            node.collect(rest, false, matches);
        }
        if let Some(node) = self.children.get("#") {
            matches.extend(node.data.values());
        }
    }

    /// 删除子树中对应的订阅
    fn remove<'a, I>(&mut self, mut filter_iter: I, token: u64) -> Option<T>
    where
        I: Iterator<Item = &'a str>,
    {
        match filter_iter.next() {
            // 有下一个，去子树里找
            Some(path) => {
                let node = self.children.get_mut(path)?;
                let removed = node.remove(filter_iter, token);
                // 子节点成为了叶子节点且数据为空，则删除这个子节点
                if node.children.is_empty() && node.data.is_empty() {
                    self.children.remove(path);
                }
                removed
            }
            // 没有下一个，截止到当前节点
            None => self.data.remove(&token),
        }
    }
}
