use alloc::collections::VecDeque;
use alloc::sync::Arc;

use klocks::SpinNoIrqMutex;

use crate::thread::{Thread, Tid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Exclusive,
}

struct MutexState {
    mode: LockMode,
    holder: Option<Tid>,
    times_locked: u32,
    /// 等待者与它们拿到锁后应有的重入次数
    blocked: VecDeque<(Arc<Thread>, u32)>,
}

/// 可重入、会阻塞的锁。进程的大锁就是它。
///
/// 释放时直接把锁交给队首的等待者，而不是唤醒后让它们重新竞争
pub struct Mutex {
    name: &'static str,
    state: SpinNoIrqMutex<MutexState>,
}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: SpinNoIrqMutex::new(MutexState {
                mode: LockMode::Unlocked,
                holder: None,
                times_locked: 0,
                blocked: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 用地址作为锁的标识，记录在阻塞的线程上
    pub fn id(&self) -> usize {
        self as *const Self as usize
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().mode != LockMode::Unlocked
    }

    pub fn own_lock(&self, thread: &Thread) -> bool {
        self.state.lock().holder == Some(thread.tid())
    }

    pub fn lock(&self, current: &Arc<Thread>) {
        self.lock_with_count(current, 1);
    }

    fn lock_with_count(&self, current: &Arc<Thread>, count: u32) {
        let mut state = self.state.lock();
        match state.holder {
            None => {
                state.mode = LockMode::Exclusive;
                state.holder = Some(current.tid());
                state.times_locked = count;
            }
            Some(holder) if holder == current.tid() => {
                state.times_locked += count;
            }
            Some(holder) => {
                trace!("{current} waits for mutex {} held by {holder}", self.name);
                state.blocked.push_back((Arc::clone(current), count));
                // 醒来时锁已经被交到手上了
                current.block_on_lock(self.id(), state);
                debug_assert!(self.own_lock(current));
            }
        }
    }

    pub fn unlock(&self, current: &Thread) {
        let next = {
            let mut state = self.state.lock();
            assert_eq!(
                state.holder,
                Some(current.tid()),
                "{current} unlocks mutex {} which it does not hold",
                self.name
            );
            state.times_locked -= 1;
            if state.times_locked > 0 {
                return;
            }
            Self::hand_off(&mut state)
        };
        if let Some(next) = next {
            next.unblock_from_lock(self.id());
        }
    }

    fn hand_off(state: &mut MutexState) -> Option<Arc<Thread>> {
        if let Some((next, count)) = state.blocked.pop_front() {
            state.holder = Some(next.tid());
            state.times_locked = count;
            Some(next)
        } else {
            state.mode = LockMode::Unlocked;
            state.holder = None;
            state.times_locked = 0;
            None
        }
    }

    /// 若 `current` 持有锁，则无视重入次数完全释放，返回原先的模式和次数供之后恢复
    pub fn force_unlock_if_locked(&self, current: &Thread) -> (LockMode, u32) {
        let (mode, count, next) = {
            let mut state = self.state.lock();
            if state.holder != Some(current.tid()) {
                return (LockMode::Unlocked, 0);
            }
            let mode = state.mode;
            let count = state.times_locked;
            (mode, count, Self::hand_off(&mut state))
        };
        if let Some(next) = next {
            next.unblock_from_lock(self.id());
        }
        (mode, count)
    }

    pub fn restore_lock(&self, current: &Arc<Thread>, mode: LockMode, count: u32) {
        if mode == LockMode::Unlocked || count == 0 {
            return;
        }
        self.lock_with_count(current, count);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::sim::{wait_until, Sim};
    use crate::ThreadState;

    #[test]
    fn recursive_lock() {
        let sim = Sim::new();
        let process = sim.process("recursive");
        let mutex = StdArc::new(Mutex::new("test"));
        let m = StdArc::clone(&mutex);
        let thread = sim.spawn(&process, move |current| {
            m.lock(current);
            m.lock(current);
            assert!(m.own_lock(current));
            m.unlock(current);
            assert!(m.is_locked());
            m.unlock(current);
            assert!(!m.is_locked());
        });
        sim.wait_for_death(&thread);
    }

    #[test]
    fn contended_lock_is_handed_off() {
        let sim = Sim::new();
        let process = sim.process("contended");
        let mutex = StdArc::new(Mutex::new("test"));
        let counter = StdArc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let m = StdArc::clone(&mutex);
            let c = StdArc::clone(&counter);
            threads.push(sim.spawn(&process, move |current| {
                for _ in 0..50 {
                    m.lock(current);
                    let value = c.load(Ordering::Relaxed);
                    std::thread::yield_now();
                    c.store(value + 1, Ordering::Relaxed);
                    m.unlock(current);
                }
            }));
        }
        for thread in &threads {
            sim.wait_for_death(thread);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 200);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn waiter_blocks_until_unlock() {
        let sim = Sim::new();
        let process = sim.process("waiter");
        let mutex = StdArc::new(Mutex::new("test"));
        let release = StdArc::new(AtomicUsize::new(0));

        let (m, r) = (StdArc::clone(&mutex), StdArc::clone(&release));
        let holder = sim.spawn(&process, move |current| {
            m.lock(current);
            while r.load(Ordering::Acquire) == 0 {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            m.unlock(current);
        });
        wait_until(|| mutex.is_locked());

        let m = StdArc::clone(&mutex);
        let waiter = sim.spawn(&process, move |current| {
            m.lock(current);
            let (mode, count) = m.force_unlock_if_locked(current);
            assert_eq!((mode, count), (LockMode::Exclusive, 1));
            assert!(!m.own_lock(current));
            m.restore_lock(current, mode, count);
            m.unlock(current);
        });
        wait_until(|| waiter.state() == ThreadState::Blocked);
        assert_eq!(waiter.state_string(), "Mutex");
        release.store(1, Ordering::Release);
        sim.wait_for_death(&holder);
        sim.wait_for_death(&waiter);
        assert!(!mutex.is_locked());
    }
}
