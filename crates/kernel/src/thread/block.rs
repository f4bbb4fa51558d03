use alloc::sync::Arc;
use core::time::Duration;

use super::blocker::ActiveBlocker;
use super::{BlockResult, Blocker, BlockerId, DispatchSignalResult, Thread, ThreadState};
use crate::hart::{DeferredCall, DeferredOp, ScopedCritical};
use crate::sched::SchedulerGuard;
use crate::sync::LockMode;
use crate::thread::blocker::BlockState;
use crate::time::BlockTimeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyLockNotHeld {
    Yes,
    No,
}

impl Thread {
    /// 阻塞在 `blocker` 上直到它被解除、超时、被信号打断或线程被杀死。
    ///
    /// 必须由当前线程在中断上下文之外调用。阻塞期间进程的大锁会被释放，返回前重新获取
    pub fn block(self: &Arc<Self>, blocker: &mut Blocker, timeout: Option<BlockTimeout>) -> BlockResult {
        let kernel = Arc::clone(self.kernel());
        let processor = kernel.processor();
        assert!(!processor.in_irq(), "{self} blocks in irq");
        assert!(self.is_current(), "{self} blocks but is not the current thread");
        let _critical = ScopedCritical::new(processor);
        let id = kernel.next_blocker_id();
        let mut timer_added = false;
        {
            let mut guard = kernel.scheduler_lock();
            let mut block = self.block.lock();
            assert!(
                block.blocker.is_none() && block.blocking_lock.is_none(),
                "{self} is already blocked"
            );
            // 之后不会再有人以死亡为由唤醒它
            if self.should_die() {
                return BlockResult::InterruptedByDeath;
            }
            if let Some(result) = blocker.setup(&mut guard, self, id) {
                trace!("{self} does not block on {}: {result:?}", blocker.name());
                return result;
            }
            if blocker.is_interruptible() {
                if let Some(signal) = self.interrupting_signal(&guard) {
                    drop(block);
                    let outcome = BlockResult::InterruptedBySignal(signal);
                    blocker.teardown(&mut guard, self, id, outcome);
                    let dispatched = self.dispatch_one_pending_signal(&mut guard);
                    drop(guard);
                    if dispatched == DispatchSignalResult::Yield {
                        self.yield_without_releasing_big_lock(VerifyLockNotHeld::No);
                    }
                    return outcome;
                }
            }
            match self.state() {
                ThreadState::Running | ThreadState::Stopped => {}
                state => panic!("{self} blocks in state {state:?}"),
            }
            block.blocker = Some(ActiveBlocker::new(id, blocker));
            if let Some(timeout) = timeout {
                let now = kernel.clock().now_ns();
                let deadline = timeout.deadline(now);
                if deadline <= now {
                    block.blocker = None;
                    drop(block);
                    blocker.teardown(&mut guard, self, id, BlockResult::InterruptedByTimeout);
                    return BlockResult::InterruptedByTimeout;
                }
                kernel.timers().add(deadline, self, id);
                timer_added = true;
            }
            drop(block);
            // 可能已经被要求停止了，恢复时再决定是否继续阻塞
            if self.is_stopped() {
                *self.stop_state.get_mut(&mut guard) = ThreadState::Blocked;
            } else {
                self.set_state(&mut guard, ThreadState::Blocked);
            }
        }
        trace!("Thread {self} blocking on {} -->", blocker.name());

        let (mode, count) = self.unlock_process_if_locked();
        let outcome = loop {
            self.yield_without_releasing_big_lock(VerifyLockNotHeld::No);
            let mut guard = kernel.scheduler_lock();
            let mut block = self.block.lock();
            if self.is_stopped() {
                debug!("{self} should be stopped, current state: {}", self.state().as_str());
                continue;
            }
            let resolved = block.blocker.as_ref().and_then(|active| active.outcome);
            match resolved {
                Some(outcome) => {
                    block.blocker = None;
                    break outcome;
                }
                None => {
                    drop(block);
                    debug!("{self} should not be unblocking, current state: {}", self.state().as_str());
                    self.set_state(&mut guard, ThreadState::Blocked);
                }
            }
        };
        trace!("<-- Thread {self} unblocked from {}: {outcome:?}", blocker.name());

        let dispatched = {
            let mut guard = kernel.scheduler_lock();
            blocker.teardown(&mut guard, self, id, outcome);
            match outcome {
                BlockResult::InterruptedBySignal(_) => self.dispatch_one_pending_signal(&mut guard),
                _ => DispatchSignalResult::Continue,
            }
        };
        if dispatched == DispatchSignalResult::Yield {
            self.yield_without_releasing_big_lock(VerifyLockNotHeld::No);
        }
        if timer_added {
            kernel.timers().cancel(id);
        }
        self.relock_process(mode, count);
        outcome
    }

    pub fn sleep(self: &Arc<Self>, duration: Duration) -> BlockResult {
        self.block(&mut Blocker::Sleep, Some(BlockTimeout::Relative(duration)))
    }

    pub fn sleep_until(self: &Arc<Self>, deadline_ns: u64) -> BlockResult {
        self.block(&mut Blocker::Sleep, Some(BlockTimeout::Absolute(deadline_ns)))
    }

    /// 阻塞在锁上，由锁的实现调用。
    ///
    /// `lock_guard` 是锁内部状态的守卫，在线程进入 `Blocked` 之后才释放，
    /// 这样释放锁的线程一定能看到等待者已经阻塞
    pub(crate) fn block_on_lock<G>(self: &Arc<Self>, lock_id: usize, lock_guard: G) {
        let kernel = Arc::clone(self.kernel());
        let processor = kernel.processor();
        assert!(!processor.in_irq(), "{self} blocks on lock in irq");
        assert!(self.is_current(), "{self} blocks but is not the current thread");
        let big_lock_id = self.process.big_lock().id();
        let is_big_lock = lock_id == big_lock_id;
        let _critical = ScopedCritical::new(processor);
        let previous_blocking_lock;
        {
            let mut guard = kernel.scheduler_lock();
            let mut block = self.block.lock();
            assert!(
                (is_big_lock && block.blocking_lock != Some(big_lock_id))
                    || block.blocking_lock.is_none(),
                "{self} is already blocked on a lock"
            );
            previous_blocking_lock = block.blocking_lock;
            block.blocking_lock = Some(lock_id);
            block.lock_requested_count = 1;
            drop(block);
            if self.is_stopped() {
                *self.stop_state.get_mut(&mut guard) = ThreadState::Blocked;
            } else {
                self.set_state(&mut guard, ThreadState::Blocked);
            }
        }
        drop(lock_guard);

        loop {
            // 等待别的锁时不应该继续占着大锁
            if !is_big_lock && self.process.big_lock().own_lock(self) {
                self.yield_and_release_relock_big_lock();
            } else {
                self.yield_without_releasing_big_lock(VerifyLockNotHeld::No);
            }
            let mut guard = kernel.scheduler_lock();
            let mut block = self.block.lock();
            if self.is_stopped() {
                continue;
            }
            if block.blocking_lock == Some(lock_id) {
                drop(block);
                debug!("{self} woke up while still waiting for lock {lock_id:#x}");
                self.set_state(&mut guard, ThreadState::Blocked);
                continue;
            }
            block.blocking_lock = previous_blocking_lock;
            break;
        }
    }

    /// 锁被交到了这个线程手上。返回它请求的次数
    pub fn unblock_from_lock(self: &Arc<Self>, lock_id: usize) -> u32 {
        let kernel = Arc::clone(self.kernel());
        if kernel.processor().in_irq() {
            kernel
                .processor()
                .deferred_call_queue(DeferredCall::new(self, DeferredOp::UnblockFromLock { lock_id }));
            return self.block.lock().lock_requested_count;
        }
        let mut guard = kernel.scheduler_lock();
        let requested_count = {
            let mut block = self.block.lock();
            assert_eq!(
                block.blocking_lock,
                Some(lock_id),
                "{self} is not blocked on lock {lock_id:#x}"
            );
            block.blocking_lock = None;
            block.lock_requested_count
        };
        self.wake_from_block(&mut guard);
        requested_count
    }

    /// 以 `outcome` 解除 `id` 对应的阻塞。在中断上下文中会被推迟。
    ///
    /// 阻塞已经结束或已经有了结果时返回 false
    pub fn unblock_from_blocker(self: &Arc<Self>, id: BlockerId, outcome: BlockResult) -> bool {
        let kernel = Arc::clone(self.kernel());
        if kernel.processor().in_irq() {
            kernel.processor().deferred_call_queue(DeferredCall::new(
                self,
                DeferredOp::UnblockFromBlocker { id, outcome },
            ));
            return true;
        }
        let mut guard = kernel.scheduler_lock();
        self.unblock_from_blocker_locked(&mut guard, id, outcome)
    }

    pub(crate) fn unblock_from_blocker_locked(
        self: &Arc<Self>,
        guard: &mut SchedulerGuard<'_>,
        id: BlockerId,
        outcome: BlockResult,
    ) -> bool {
        let mut block = self.block.lock();
        if block.blocker.as_ref().map(|active| active.id) != Some(id) {
            return false;
        }
        self.unblock_locked(guard, &mut block, outcome)
    }

    /// 记录阻塞的结果并唤醒线程。停止中的线程只记录结果，恢复时再唤醒
    pub(crate) fn unblock_locked(
        self: &Arc<Self>,
        guard: &mut SchedulerGuard<'_>,
        block: &mut BlockState,
        outcome: BlockResult,
    ) -> bool {
        if block.blocking_lock.is_some() {
            return false;
        }
        let Some(active) = block.blocker.as_mut() else {
            return false;
        };
        if active.outcome.is_some() {
            return false;
        }
        if let BlockResult::InterruptedBySignal(_) = outcome {
            if self.is_handling_page_fault() || (!active.interruptible && !self.should_die()) {
                return false;
            }
        }
        active.outcome = Some(outcome);
        self.wake_from_block(guard);
        true
    }

    fn wake_from_block(self: &Arc<Self>, guard: &mut SchedulerGuard<'_>) {
        match self.state() {
            ThreadState::Blocked => {
                let next = if self.is_current() {
                    ThreadState::Running
                } else {
                    ThreadState::Runnable
                };
                self.set_state(guard, next);
            }
            ThreadState::Stopped => debug!("{self} is stopped, it will wake up when resumed"),
            _ => {}
        }
    }

    pub fn yield_without_releasing_big_lock(self: &Arc<Self>, verify: VerifyLockNotHeld) {
        let kernel = self.kernel();
        assert!(
            verify == VerifyLockNotHeld::No || !self.process.big_lock().own_lock(self),
            "{self} yields while holding the big lock"
        );
        kernel.scheduler().yield_now(self);
        // 在临界区内时，切换发生在离开临界区的这一刻。之后可能已经在另一个处理器上了
        let processor = kernel.processor();
        let prev = processor.clear_critical();
        processor.restore_critical(prev);
    }

    pub fn yield_and_release_relock_big_lock(self: &Arc<Self>) {
        self.kernel().scheduler().yield_now(self);
        let (mode, count) = self.unlock_process_if_locked();
        // 除非不在临界区中，真正的切换会推迟到 relock_process 中离开临界区时
        self.relock_process(mode, count);
    }

    pub(crate) fn unlock_process_if_locked(&self) -> (LockMode, u32) {
        self.process.big_lock().force_unlock_if_locked(self)
    }

    pub(crate) fn relock_process(self: &Arc<Self>, mode: LockMode, count: u32) {
        let processor = self.kernel().processor();
        let prev = processor.clear_critical();
        if mode != LockMode::Unlocked {
            self.process.big_lock().restore_lock(self, mode, count);
        }
        processor.restore_critical(prev);
    }
}
