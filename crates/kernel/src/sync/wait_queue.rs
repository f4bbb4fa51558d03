use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};

use klocks::SpinNoIrqMutex;

use crate::thread::{BlockResult, BlockerId, Thread};

struct WaitQueueInner {
    waiters: VecDeque<(Weak<Thread>, BlockerId)>,
    /// 没有等待者时的 `wake_one` 会留下这个标记，下一个等待者直接返回
    wake_requested: bool,
}

/// 线程通过 [`crate::Blocker::Queue`] 在上面等待
pub struct WaitQueue {
    inner: SpinNoIrqMutex<WaitQueueInner>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: SpinNoIrqMutex::new(WaitQueueInner {
                waiters: VecDeque::new(),
                wake_requested: false,
            }),
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// 返回 false 表示已经有未被消费的唤醒，不需要阻塞
    pub(crate) fn register(&self, thread: &Arc<Thread>, id: BlockerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.wake_requested {
            inner.wake_requested = false;
            return false;
        }
        inner.waiters.push_back((Arc::downgrade(thread), id));
        true
    }

    /// 返回等待者是否还在队列中
    pub(crate) fn unregister(&self, id: BlockerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.waiters.len();
        inner.waiters.retain(|(_, waiter)| *waiter != id);
        before != inner.waiters.len()
    }

    /// 按先来后到唤醒一个等待者。已经因为其他原因醒来的等待者会被跳过
    pub fn wake_one(&self) -> bool {
        self.wake_first(true)
    }

    /// 至多唤醒 `count` 个。队列空了也不留下标记
    pub fn wake_n(&self, count: usize) -> usize {
        let mut woken = 0;
        while woken < count && self.wake_first(false) {
            woken += 1;
        }
        woken
    }

    fn wake_first(&self, latch_if_empty: bool) -> bool {
        loop {
            let (thread, id) = {
                let mut inner = self.inner.lock();
                match inner.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        inner.wake_requested |= latch_if_empty;
                        return false;
                    }
                }
            };
            let Some(thread) = thread.upgrade() else {
                continue;
            };
            if thread.unblock_from_blocker(id, BlockResult::WokeNormally) {
                return true;
            }
        }
    }

    /// 唤醒当前所有的等待者，不留下标记。返回唤醒的个数
    pub fn wake_all(&self) -> usize {
        let waiters = core::mem::take(&mut self.inner.lock().waiters);
        waiters
            .into_iter()
            .filter_map(|(thread, id)| Some((thread.upgrade()?, id)))
            .filter(|(thread, id)| thread.unblock_from_blocker(*id, BlockResult::WokeNormally))
            .count()
    }
}
