use alloc::collections::BinaryHeap;
use alloc::sync::{Arc, Weak};
use core::cmp::{Ordering, Reverse};

use klocks::SpinNoIrqMutex;
use smallvec::SmallVec;

use crate::thread::{BlockResult, BlockerId, Thread};

struct Timer {
    deadline: u64,
    blocker: BlockerId,
    thread: Weak<Thread>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.blocker == other.blocker
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.blocker.cmp(&other.blocker))
    }
}

/// 阻塞超时用的定时器。到期时以 [`BlockResult::InterruptedByTimeout`] 唤醒对应的阻塞
pub struct TimerQueue {
    timers: SpinNoIrqMutex<BinaryHeap<Reverse<Timer>>>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self {
            timers: SpinNoIrqMutex::new(BinaryHeap::new()),
        }
    }

    pub fn add(&self, deadline: u64, thread: &Arc<Thread>, blocker: BlockerId) {
        self.timers.lock().push(Reverse(Timer {
            deadline,
            blocker,
            thread: Arc::downgrade(thread),
        }));
    }

    /// 返回是否真的移除了一个定时器
    pub fn cancel(&self, blocker: BlockerId) -> bool {
        let mut timers = self.timers.lock();
        let before = timers.len();
        timers.retain(|timer| timer.0.blocker != blocker);
        before != timers.len()
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 一般在时钟中断中调用，此时唤醒会被推迟执行。返回到期的定时器个数
    pub fn fire_expired(&self, now_ns: u64) -> usize {
        let mut expired = SmallVec::<[Timer; 4]>::new();
        {
            let mut timers = self.timers.lock();
            while let Some(timer) = timers.peek() {
                if timer.0.deadline > now_ns {
                    break;
                }
                if let Some(Reverse(timer)) = timers.pop() {
                    expired.push(timer);
                }
            }
        }
        let count = expired.len();
        // 唤醒时会拿调度锁，不能持有定时器的锁
        for timer in expired {
            if let Some(thread) = timer.thread.upgrade() {
                thread.unblock_from_blocker(timer.blocker, BlockResult::InterruptedByTimeout);
            }
        }
        count
    }
}
