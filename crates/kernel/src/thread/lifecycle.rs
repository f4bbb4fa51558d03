use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;
use core::sync::atomic::Ordering;

use super::{BlockResult, Thread, ThreadState};
use crate::hart::ScopedCritical;
use crate::kernel::Kernel;
use crate::sched::SchedulerGuard;

impl Thread {
    pub fn should_die(&self) -> bool {
        self.should_die.load(Ordering::Acquire)
    }

    /// 标记线程应当死亡。停止的线程会被恢复，阻塞的线程会以 [`BlockResult::InterruptedByDeath`] 唤醒
    pub fn set_should_die(self: &Arc<Self>) {
        let mut guard = self.kernel().scheduler_lock();
        self.set_should_die_locked(&mut guard);
    }

    pub(crate) fn set_should_die_locked(self: &Arc<Self>, guard: &mut SchedulerGuard<'_>) {
        if self.should_die.swap(true, Ordering::AcqRel) {
            debug!("{self} should already die");
            return;
        }
        if self.is_stopped() {
            self.resume_from_stopped(guard);
        }
        if self.state() == ThreadState::Blocked {
            let mut block = self.block.lock();
            if block.blocker.is_some() {
                self.unblock_locked(guard, &mut block, BlockResult::InterruptedByDeath);
            }
        }
    }

    /// 当前线程若应当死亡，则释放大锁并进入 `Dying`，然后切换走。
    ///
    /// 返回 `Break` 时调用者不应该再回到用户态
    pub fn die_if_needed(self: &Arc<Self>) -> ControlFlow<()> {
        assert!(self.is_current(), "{self} is not the current thread");
        if !self.should_die() {
            return ControlFlow::Continue(());
        }
        let _ = self.unlock_process_if_locked();
        let kernel = Arc::clone(self.kernel());
        let processor = kernel.processor();
        let _critical = ScopedCritical::new(processor);
        {
            let mut guard = kernel.scheduler_lock();
            self.set_state(&mut guard, ThreadState::Dying);
            // 切换走之后由这份引用维持线程的存活，直到被回收
            guard.dying.push(Arc::clone(self));
        }
        kernel.scheduler().yield_now(self);
        // 离开临界区时真正切换，正常情况下不会再回到这里
        let prev = processor.clear_critical();
        processor.restore_critical(prev);
        ControlFlow::Break(())
    }

    /// 线程主动退出，`exit_value` 交给 join 它的线程
    pub fn exit(self: &Arc<Self>, exit_value: usize) -> ControlFlow<()> {
        assert!(self.is_current(), "{self} is not the current thread");
        debug!("{self} exit with {exit_value:#x}");
        self.join.thread_did_exit(exit_value);
        self.set_should_die();
        let _ = self.unlock_process_if_locked();
        let range = self.lock_inner_with(|inner| inner.thread_specific_range.take());
        if let Some(range) = range {
            if let Err(e) = self.process.address_space().deallocate_region(range) {
                warn!("{self} failed to deallocate thread specific region: {e}");
            }
        }
        self.die_if_needed()
    }

    /// 已经不在任何处理器上执行，且没有人会再 join 它
    pub fn is_finalizable(&self) -> bool {
        !self.is_active()
            && (!self.join.is_joinable() || !self.join.has_exited() || self.process.is_terminating())
    }

    fn finalize(self: &Arc<Self>) {
        let kernel = Arc::clone(self.kernel());
        {
            let mut guard = kernel.scheduler_lock();
            debug!("Finalizing thread {self}");
            self.set_state(&mut guard, ThreadState::Dead);
            if let Some((waiter, id)) = self.join.thread_finalizing() {
                if let Some(waiter) = waiter.upgrade() {
                    waiter.unblock_from_blocker_locked(&mut guard, id, BlockResult::InterruptedByDeath);
                }
            }
        }
        if self.dump_backtrace_on_finalization.load(Ordering::Relaxed) && log_enabled!(kernel_tracer::Level::Error) {
            let backtrace = kernel.processor().capture_stack_trace(self);
            error!("Backtrace of {self}: {backtrace:#x?}");
        }
        if self.process.remove_thread(self.tid) {
            self.process.finalize();
        }
    }

    /// 回收所有可以回收的 `Dying` 线程，由回收者调用。返回回收的个数
    pub fn finalize_dying_threads(kernel: &Kernel) -> usize {
        let ready: Vec<Arc<Thread>> = {
            let mut guard = kernel.scheduler_lock();
            let (ready, rest) = core::mem::take(&mut guard.dying)
                .into_iter()
                .partition(|thread: &Arc<Thread>| thread.is_finalizable());
            guard.dying = rest;
            ready
        };
        for thread in &ready {
            thread.finalize();
        }
        ready.len()
    }
}
