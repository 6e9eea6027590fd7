//! 每个 run 一把锁与一个取消令牌
//!
//! start / drive / resume / abort 在整个执行期间持有该 run 的锁；不同 run 互不阻塞。
//! abort 先触发取消令牌，驱动循环在每轮边界（以及等待 Planner 时）观察到后自行退出并释放锁。
//!
//! 表里只存 Weak：持有守卫或正在排队的调用方让 slot 存活，没人用了就被回收，
//! 已结束的运行不会永久占用条目。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::core::state::RunId;

#[derive(Debug)]
struct RunSlot {
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

/// 独占守卫；释放即解锁
#[derive(Debug)]
pub struct RunGuard {
    _guard: OwnedMutexGuard<()>,
    slot: Arc<RunSlot>,
}

impl RunGuard {
    /// 本 run 的取消令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }
}

#[derive(Debug, Default)]
pub struct RunLocks {
    slots: Mutex<HashMap<RunId, Weak<RunSlot>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, run_id: &str) -> Arc<RunSlot> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(run_id).and_then(Weak::upgrade) {
            return slot;
        }
        slots.retain(|_, slot| slot.strong_count() > 0);
        let slot = Arc::new(RunSlot {
            lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
        });
        slots.insert(run_id.to_string(), Arc::downgrade(&slot));
        slot
    }

    async fn acquire(slot: Arc<RunSlot>) -> RunGuard {
        let guard = Arc::clone(&slot.lock).lock_owned().await;
        RunGuard {
            _guard: guard,
            slot,
        }
    }

    /// 获取该 run 的独占锁
    pub async fn lock(&self, run_id: &str) -> RunGuard {
        Self::acquire(self.slot(run_id).await).await
    }

    /// 请求中止，然后排队等锁；等待期间 slot 保持存活，正在运行的驱动循环能看到同一个令牌
    pub async fn cancel_and_lock(&self, run_id: &str) -> RunGuard {
        let slot = self.slot(run_id).await;
        slot.cancel.cancel();
        Self::acquire(slot).await
    }

    /// 仍有人持有的 slot 数
    pub async fn live(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_run_is_exclusive() {
        let locks = Arc::new(RunLocks::new());
        let guard = locks.lock("a").await;

        let l = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = l.lock("a").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_runs_do_not_block() {
        let locks = RunLocks::new();
        let _a = locks.lock("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_reaches_holder_of_same_run() {
        let locks = Arc::new(RunLocks::new());
        let holder = locks.lock("a").await;
        let token = holder.cancel_token();
        let other = locks.lock("b").await;

        let l = Arc::clone(&locks);
        let aborter = tokio::spawn(async move {
            let _g = l.cancel_and_lock("a").await;
        });
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(!other.cancel_token().is_cancelled());

        drop(holder);
        aborter.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_slots_are_released() {
        let locks = RunLocks::new();
        for id in ["a", "b", "c"] {
            let _g = locks.lock(id).await;
        }
        assert_eq!(locks.live().await, 0);

        let held = locks.lock("d").await;
        assert_eq!(locks.live().await, 1);
        assert_eq!(locks.slots.lock().await.len(), 1);
        drop(held);
        assert_eq!(locks.live().await, 0);
    }
}
