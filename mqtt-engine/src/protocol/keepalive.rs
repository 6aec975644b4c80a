//! 保活扫描
//!
//! 所有已连接的连接都登记在一个全局列表中，定时器周期性检查每个连接的空闲时间。

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use log::debug;
use tokio::time::{self, Instant};

use super::msgid::ConnId;

/// 可以被保活扫描的连接
pub trait Sweep: Send + Sync {
    /// 检查空闲时间，超时则关闭或发送探测
    fn sweep(&self, now: Instant);
    /// 服务端关闭
    fn shutdown(&self);
}

#[derive(Default)]
pub struct KeepAliveList {
    conns: Mutex<HashMap<ConnId, Weak<dyn Sweep>>>,
    stopped: AtomicBool,
}

impl KeepAliveList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Weak<dyn Sweep>>> {
        match self.conns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, id: ConnId, conn: Weak<dyn Sweep>) {
        self.lock().insert(id, conn);
    }

    pub fn remove(&self, id: ConnId) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 在锁外回调每个连接，连接关闭时会把自己移出列表
    fn snapshot(&self) -> Vec<Arc<dyn Sweep>> {
        let mut conns = self.lock();
        conns.retain(|_, conn| conn.strong_count() > 0);
        conns.values().filter_map(Weak::upgrade).collect()
    }

    pub fn sweep(&self, now: Instant) {
        for conn in self.snapshot() {
            conn.sweep(now);
        }
    }

    /// 关闭所有连接，并停止扫描
    pub fn shutdown_all(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let conns = self.snapshot();
        debug!("shutting down {} connections", conns.len());
        for conn in conns {
            conn.shutdown();
        }
    }

    /// 周期性扫描，直到 shutdown_all 被调用
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.sweep(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counter {
        swept: AtomicUsize,
        shutdown: AtomicUsize,
    }

    impl Sweep for Counter {
        fn sweep(&self, _now: Instant) {
            self.swept.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.shutdown.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sweep_and_shutdown() {
        let list = KeepAliveList::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let a_dyn: Arc<dyn Sweep> = a.clone();
        let b_dyn: Arc<dyn Sweep> = b.clone();
        list.register(1, Arc::downgrade(&a_dyn));
        list.register(2, Arc::downgrade(&b_dyn));

        list.sweep(Instant::now());
        assert_eq!(a.swept.load(Ordering::SeqCst), 1);
        assert_eq!(b.swept.load(Ordering::SeqCst), 1);

        list.remove(2);
        list.sweep(Instant::now());
        assert_eq!(b.swept.load(Ordering::SeqCst), 1);

        // 已经释放的连接自动移出
        drop(a_dyn);
        drop(a);
        list.sweep(Instant::now());
        assert!(list.is_empty());

        list.register(2, Arc::downgrade(&b_dyn));
        list.shutdown_all();
        assert_eq!(b.shutdown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_after_shutdown() {
        let list = KeepAliveList::new();
        let counter = Arc::new(Counter::default());
        let dyn_counter: Arc<dyn Sweep> = counter.clone();
        list.register(1, Arc::downgrade(&dyn_counter));

        let task = tokio::spawn(list.clone().run(Duration::from_millis(100)));
        time::sleep(Duration::from_millis(350)).await;
        assert!(counter.swept.load(Ordering::SeqCst) >= 3);

        list.shutdown_all();
        time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
