//! 报文 id 表
//!
//! 全局表被分成若干个分片，每个分片一把锁，按连接 id 的哈希选择分片。
//! 每个连接持有一个视图，视图内有一个有上限的空闲列表，用于复用表项。

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::engine::DeliveryHandle;

/// 连接 id，由 broker 分配，全局唯一
pub type ConnId = u64;

/// 报文方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 客户端发给服务端
    Inbound,
    /// 服务端发给客户端
    Outbound,
}

/// QoS 流程所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgIdState {
    /// 已发送（或已收到）PUBLISH
    Published,
    /// 已发送（或已收到）PUBREC
    Received,
    /// 已发送 PUBREL
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet id {0} in use")]
    InUse(u16),
}

/// 表项
#[derive(Debug, Clone)]
pub struct MsgIdEntry {
    pub handle: Option<DeliveryHandle>,
    pub state: MsgIdState,
    /// 重传合并计数
    pub pending: u32,
}

type Key = (ConnId, Direction, u16);

pub struct MsgIdTable {
    shards: Box<[Mutex<HashMap<Key, Box<MsgIdEntry>>>]>,
    free_list_max: usize,
}

impl MsgIdTable {
    pub fn new(shards: usize, free_list_max: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            free_list_max,
        }
    }

    fn shard(&self, conn: ConnId) -> MutexGuard<'_, HashMap<Key, Box<MsgIdEntry>>> {
        // fibonacci 哈希，连续的连接 id 也能分散开
        let hash = (conn.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize;
        let shard = &self.shards[hash % self.shards.len()];
        match shard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 创建一个连接的视图
    pub fn connection(self: &Arc<Self>, conn: ConnId, outbound_max: u16) -> MsgIds {
        MsgIds {
            table: self.clone(),
            conn,
            free: Mutex::new(Vec::new()),
            next_outbound: Mutex::new(0),
            outbound_max: outbound_max.max(1),
            inbound: AtomicUsize::new(0),
            outbound: AtomicUsize::new(0),
        }
    }

    /// 全表项数量
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| match shard.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }
}

/// 一个连接的报文 id 视图
pub struct MsgIds {
    table: Arc<MsgIdTable>,
    conn: ConnId,
    /// 空闲表项
    free: Mutex<Vec<Box<MsgIdEntry>>>,
    /// 上一次分配的出站 id
    next_outbound: Mutex<u16>,
    outbound_max: u16,
    /// 各方向的表项数，在持有分片锁时修改
    inbound: AtomicUsize,
    outbound: AtomicUsize,
}

impl MsgIds {
    fn lock_free(&self) -> MutexGuard<'_, Vec<Box<MsgIdEntry>>> {
        match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn counter(&self, direction: Direction) -> &AtomicUsize {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    fn recycle(&self, entry: Box<MsgIdEntry>) {
        let mut free = self.lock_free();
        if free.len() < self.table.free_list_max {
            free.push(entry);
        }
    }

    fn allocate(&self, handle: Option<DeliveryHandle>, state: MsgIdState) -> Box<MsgIdEntry> {
        let entry = MsgIdEntry {
            handle,
            state,
            pending: 1,
        };
        match self.lock_free().pop() {
            Some(mut boxed) => {
                *boxed = entry;
                boxed
            }
            None => Box::new(entry),
        }
    }

    /// 添加表项，id 已存在时失败
    pub fn add(
        &self,
        direction: Direction,
        id: u16,
        handle: Option<DeliveryHandle>,
        state: MsgIdState,
    ) -> Result<(), Error> {
        let entry = self.allocate(handle, state);
        let mut shard = self.table.shard(self.conn);
        let key = (self.conn, direction, id);
        if shard.contains_key(&key) {
            drop(shard);
            self.recycle(entry);
            return Err(Error::InUse(id));
        }
        shard.insert(key, entry);
        self.counter(direction).fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn get(&self, direction: Direction, id: u16) -> Option<MsgIdEntry> {
        let shard = self.table.shard(self.conn);
        shard
            .get(&(self.conn, direction, id))
            .map(|entry| entry.as_ref().clone())
    }

    /// 修改表项，不存在时返回 None
    pub fn update<R>(
        &self,
        direction: Direction,
        id: u16,
        f: impl FnOnce(&mut MsgIdEntry) -> R,
    ) -> Option<R> {
        let mut shard = self.table.shard(self.conn);
        shard
            .get_mut(&(self.conn, direction, id))
            .map(|entry| f(entry))
    }

    /// 删除表项，返回投递句柄和重传合并计数
    pub fn remove(&self, direction: Direction, id: u16) -> Option<(Option<DeliveryHandle>, u32)> {
        let entry = {
            let mut shard = self.table.shard(self.conn);
            let entry = shard.remove(&(self.conn, direction, id))?;
            self.counter(direction).fetch_sub(1, Ordering::SeqCst);
            entry
        };
        let result = (entry.handle, entry.pending);
        self.recycle(entry);
        Some(result)
    }

    /// 分配一个出站 id 并记录，所有 id 都在使用中时返回 None
    pub fn assign_outbound(&self, handle: Option<DeliveryHandle>) -> Option<u16> {
        let mut next = match self.next_outbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = self.allocate(handle, MsgIdState::Published);
        let mut shard = self.table.shard(self.conn);
        let mut id = *next;
        for _ in 0..self.outbound_max {
            id = if id >= self.outbound_max { 1 } else { id + 1 };
            let key = (self.conn, Direction::Outbound, id);
            if !shard.contains_key(&key) {
                shard.insert(key, entry);
                self.outbound.fetch_add(1, Ordering::SeqCst);
                *next = id;
                return Some(id);
            }
        }
        drop(shard);
        self.recycle(entry);
        None
    }

    pub fn count(&self, direction: Direction) -> usize {
        self.counter(direction).load(Ordering::SeqCst)
    }

    /// 连接关闭时释放所有表项
    pub fn release_all(&self) -> Vec<(Direction, u16, MsgIdEntry)> {
        let mut released = Vec::new();
        let mut shard = self.table.shard(self.conn);
        let keys = shard
            .keys()
            .filter(|(conn, _, _)| *conn == self.conn)
            .copied()
            .collect::<Vec<_>>();
        for key in keys {
            if let Some(entry) = shard.remove(&key) {
                released.push((key.1, key.2, *entry));
            }
        }
        self.inbound.store(0, Ordering::SeqCst);
        self.outbound.store(0, Ordering::SeqCst);
        released
    }

    pub fn free_len(&self) -> usize {
        self.lock_free().len()
    }
}

impl Drop for MsgIds {
    fn drop(&mut self) {
        self.release_all();
    }
}
