use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use signal::Signal;

use super::Thread;
use crate::sched::SchedulerGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// 刚创建，还未就绪
    Invalid,
    Runnable,
    Running,
    Blocked,
    Stopped,
    /// 已经不会再执行用户代码，等待回收
    Dying,
    Dead,
}

// 用于 `Atomic<ThreadState>`
unsafe impl bytemuck::NoUninit for ThreadState {}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Invalid => "Invalid",
            ThreadState::Runnable => "Runnable",
            ThreadState::Running => "Running",
            ThreadState::Blocked => "Blocked",
            ThreadState::Stopped => "Stopped",
            ThreadState::Dying => "Dying",
            ThreadState::Dead => "Dead",
        }
    }

    pub fn can_transition_to(self, next: ThreadState) -> bool {
        matches!(
            (self, next),
            (ThreadState::Invalid, ThreadState::Runnable)
                | (ThreadState::Runnable, ThreadState::Running | ThreadState::Stopped)
                | (
                    ThreadState::Running,
                    ThreadState::Runnable
                        | ThreadState::Blocked
                        | ThreadState::Stopped
                        | ThreadState::Dying
                )
                | (
                    ThreadState::Blocked,
                    ThreadState::Runnable | ThreadState::Running | ThreadState::Stopped
                )
                | (ThreadState::Stopped, ThreadState::Runnable | ThreadState::Blocked)
                | (ThreadState::Dying, ThreadState::Dead)
        )
    }
}

impl Thread {
    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ThreadState::Stopped
    }

    /// 阻塞时显示阻塞的原因
    pub fn state_string(&self) -> &'static str {
        let state = self.state();
        if state != ThreadState::Blocked {
            return state.as_str();
        }
        let block = self.block.lock();
        if block.blocking_lock.is_some() {
            return "Mutex";
        }
        block
            .blocker
            .as_ref()
            .map_or(state.as_str(), |blocker| blocker.name)
    }

    pub fn set_state(self: &Arc<Self>, guard: &mut SchedulerGuard<'_>, new_state: ThreadState) {
        self.set_state_with_signal(guard, new_state, None);
    }

    pub(crate) fn set_state_with_signal(
        self: &Arc<Self>,
        guard: &mut SchedulerGuard<'_>,
        new_state: ThreadState,
        stop_signal: Option<Signal>,
    ) {
        let previous = self.state();
        if previous == new_state {
            return;
        }
        assert!(
            previous.can_transition_to(new_state),
            "{self}: invalid state transition {previous:?} -> {new_state:?}"
        );
        self.state.store(new_state, Ordering::Release);
        trace!("Set thread {self} state to {new_state:?}");
        if previous == ThreadState::Stopped || new_state == ThreadState::Stopped {
            self.refresh_signal_hint(guard);
        }

        let kernel = Arc::clone(self.kernel());
        let process = Arc::clone(&self.process);
        if previous == ThreadState::Runnable {
            self.runnable_priority.store(-1, Ordering::Relaxed);
            kernel.scheduler().dequeue_runnable_thread(guard, self);
        } else if previous == ThreadState::Stopped {
            *self.stop_state.get_mut(guard) = ThreadState::Invalid;
            if process.set_stopped(false) {
                debug!("process {process} resumed by {self}");
                for thread in process.threads() {
                    if thread.is_stopped() {
                        thread.resume_from_stopped(guard);
                    }
                }
                process.notify_parent_locked(guard);
            }
        }

        match new_state {
            ThreadState::Runnable => {
                self.runnable_priority
                    .store(self.priority(), Ordering::Relaxed);
                kernel.scheduler().enqueue_runnable_thread(guard, self);
                kernel.processor().smp_wake_n_idle_processors(1);
            }
            ThreadState::Stopped => {
                *self.stop_state.get_mut(guard) = if previous == ThreadState::Running {
                    ThreadState::Runnable
                } else {
                    previous
                };
                if !process.set_stopped(true) {
                    debug!("process {process} stopped by {self}, signal {stop_signal:?}");
                    for thread in process.threads() {
                        // 还没开始执行的和将死的线程不参与
                        if thread.should_die()
                            || matches!(
                                thread.state(),
                                ThreadState::Invalid
                                    | ThreadState::Stopped
                                    | ThreadState::Dying
                                    | ThreadState::Dead
                            )
                        {
                            continue;
                        }
                        thread.set_state_with_signal(guard, ThreadState::Stopped, stop_signal);
                    }
                    process.notify_parent_locked(guard);
                }
            }
            ThreadState::Dying => {
                if !self.is_current() && self.is_finalizable() {
                    kernel.scheduler().notify_finalizer();
                }
            }
            _ => {}
        }

        if previous == ThreadState::Invalid && self.has_unmasked_pending_signals() {
            self.dispatch_one_pending_signal(guard);
        }
    }

    /// 恢复到停止之前的状态。之前阻塞着的线程如果等待已经有了结果，就直接变为就绪
    pub(crate) fn resume_from_stopped(self: &Arc<Self>, guard: &mut SchedulerGuard<'_>) {
        assert!(self.is_stopped(), "{self} is not stopped");
        let stop_state = *self.stop_state.get(guard);
        assert_ne!(stop_state, ThreadState::Invalid);
        let next = if stop_state == ThreadState::Blocked {
            let block = self.block.lock();
            let still_waiting = block.blocking_lock.is_some()
                || block
                    .blocker
                    .as_ref()
                    .is_some_and(|blocker| blocker.outcome.is_none());
            if still_waiting {
                ThreadState::Blocked
            } else {
                ThreadState::Runnable
            }
        } else {
            stop_state
        };
        self.set_state(guard, next);
    }
}
