//! 在途操作计数
//!
//! 每个提交给引擎、尚未完成的操作都持有一个 [`InflightGuard`]。
//! 连接关闭后不再发放新的 guard，拆除流程等待计数归零后才释放会话。

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Inflight {
    count: AtomicUsize,
    closing: AtomicBool,
    idle: Notify,
}

impl Inflight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记一个在途操作，连接已经关闭时返回 None
    pub fn enter(self: &Arc<Self>) -> Option<InflightGuard> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            inflight: self.clone(),
        };
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    /// 标记为关闭，只有第一次调用返回 true
    pub fn close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// 等待所有在途操作完成
    pub async fn wait_idle(&self) {
        while self.count.load(Ordering::SeqCst) != 0 {
            self.idle.notified().await;
        }
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            // notify_one 会保留一个许可，等待方晚到也不会丢失唤醒
            self.idle.notify_one();
        }
    }
}

/// 在途操作的凭证，drop 时计数减一
#[derive(Debug)]
pub struct InflightGuard {
    inflight: Arc<Inflight>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.leave();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn close_is_idempotent() {
        let inflight = Inflight::new();
        assert!(inflight.close());
        assert!(!inflight.close());
        assert!(inflight.enter().is_none());
        assert_eq!(inflight.count(), 0);
        inflight.wait_idle().await;
    }

    #[tokio::test]
    async fn wait_idle_after_guards_drop() {
        let inflight = Inflight::new();
        let first = inflight.enter().unwrap();
        let second = inflight.enter().unwrap();
        assert_eq!(inflight.count(), 2);
        assert!(inflight.close());

        let waiter = {
            let inflight = inflight.clone();
            tokio::spawn(async move { inflight.wait_idle().await })
        };

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(second);
        });
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inflight.count(), 0);
    }
}
