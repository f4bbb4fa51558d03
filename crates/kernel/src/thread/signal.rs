//! 线程的信号：发送、屏蔽与投递。
//!
//! 待处理信号、掩码与处理函数表都由调度锁保护。`have_unmasked_pending` 是它们的一份无锁摘要，
//! 返回用户态前先看它，真正要处理时再加锁重新检查

use alloc::sync::Arc;
use core::ops::ControlFlow;
use core::sync::atomic::Ordering;

use defines::error::KResult;
use defines::signal::SignalActionFlags;
use defines::trap_context::UserRegisters;
use signal::{DefaultHandler, KSignalAction, Signal, SignalFrame, SignalSet};

use super::{BlockResult, Thread, ThreadState, VerifyLockNotHeld};
use crate::process::Process;
use crate::sched::SchedulerGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSignalResult {
    /// 线程还没有可以修改的寄存器，稍后再投递
    Deferred,
    /// 线程停止了，调用者应当让出处理器
    Yield,
    /// 进程将被终止
    Terminate,
    Continue,
}

impl Thread {
    pub fn send_signal(self: &Arc<Self>, signal: Signal, sender: Option<&Process>) {
        let mut guard = self.kernel().scheduler_lock();
        match sender {
            Some(sender) => debug!("Signal: {sender} sent {signal:?} to {self}"),
            None => debug!("Signal: Kernel sent {signal:?} to {self}"),
        }
        self.send_signal_locked(&mut guard, signal);
    }

    pub(crate) fn send_signal_locked(self: &Arc<Self>, guard: &mut SchedulerGuard<'_>, signal: Signal) {
        if self.handlers.get(guard).should_ignore(signal) {
            debug!("Signal {signal:?} was ignored by {self}");
            return;
        }
        self.signals.get_mut(guard).add_pending(signal);
        self.refresh_signal_hint(guard);

        if self.is_stopped() {
            if !self.pending_signals_for_state(guard).is_empty() {
                debug!("Signal: Resuming stopped {self} to deliver {signal:?}");
                self.resume_from_stopped(guard);
            }
            return;
        }
        if self.state() != ThreadState::Blocked {
            return;
        }
        let deliverable = self.deliverable_signals(guard).has(signal);
        let mut block = self.block.lock();
        let Some(waited) = block.blocker.as_ref().map(|active| active.waited_signals) else {
            return;
        };
        if waited.has(signal) {
            self.unblock_locked(guard, &mut block, BlockResult::WokeNormally);
        } else if deliverable {
            trace!("Signal: Unblocking {self} to deliver {signal:?}");
            self.unblock_locked(guard, &mut block, BlockResult::InterruptedBySignal(signal));
        }
    }

    /// 立即在当前线程上投递信号，不论掩码，用于异常
    pub fn send_urgent_signal_to_self(self: &Arc<Self>, signal: Signal) -> DispatchSignalResult {
        assert!(self.is_current(), "{self} is not the current thread");
        let result = {
            let mut guard = self.kernel().scheduler_lock();
            self.dispatch_signal(&mut guard, signal)
        };
        if result == DispatchSignalResult::Yield {
            self.yield_and_release_relock_big_lock();
        }
        result
    }

    pub fn signal_mask(&self) -> SignalSet {
        let guard = self.kernel().scheduler_lock();
        self.signal_mask_locked(&guard)
    }

    pub(crate) fn signal_mask_locked(&self, guard: &SchedulerGuard<'_>) -> SignalSet {
        self.signals.get(guard).mask()
    }

    /// 返回旧掩码
    pub fn update_signal_mask(&self, mask: SignalSet) -> SignalSet {
        let mut guard = self.kernel().scheduler_lock();
        self.update_signal_mask_locked(&mut guard, mask)
    }

    pub(crate) fn update_signal_mask_locked(&self, guard: &mut SchedulerGuard<'_>, mask: SignalSet) -> SignalSet {
        let old = self.signals.get_mut(guard).set_mask(mask);
        self.refresh_signal_hint(guard);
        old
    }

    /// `block` 为真时屏蔽 `set`，否则解除屏蔽。返回旧掩码
    pub fn signal_mask_block(&self, set: SignalSet, block: bool) -> SignalSet {
        let mut guard = self.kernel().scheduler_lock();
        let old = self.signals.get_mut(&mut guard).block(set, block);
        self.refresh_signal_hint(&mut guard);
        old
    }

    /// 停止时只有 CONT、KILL、TRAP 可见
    pub fn pending_signals(&self) -> SignalSet {
        let guard = self.kernel().scheduler_lock();
        self.pending_signals_for_state(&guard)
    }

    pub(crate) fn pending_signals_for_state(&self, guard: &SchedulerGuard<'_>) -> SignalSet {
        if self.is_handling_page_fault() {
            return SignalSet::empty();
        }
        self.signals.get(guard).pending_for_state(self.is_stopped())
    }

    fn deliverable_signals(&self, guard: &SchedulerGuard<'_>) -> SignalSet {
        self.pending_signals_for_state(guard)
            .difference(self.signals.get(guard).mask())
    }

    /// 可以打断一次阻塞的信号
    pub(crate) fn interrupting_signal(&self, guard: &SchedulerGuard<'_>) -> Option<Signal> {
        self.deliverable_signals(guard).first_pending()
    }

    /// 无锁的提示，可能已经过时
    pub fn has_unmasked_pending_signals(&self) -> bool {
        self.have_unmasked_pending.load(Ordering::Acquire)
    }

    /// 取走 `set` 中编号最小的待处理信号，不论掩码
    pub(crate) fn take_pending_signal(&self, guard: &mut SchedulerGuard<'_>, set: SignalSet) -> Option<Signal> {
        let signal = self.signals.get(guard).pending().intersection(set).first_pending()?;
        self.signals.get_mut(guard).remove_pending(signal);
        self.refresh_signal_hint(guard);
        Some(signal)
    }

    /// 停止状态会改变哪些信号可见，所以进出 `Stopped` 时也要刷新
    pub(super) fn refresh_signal_hint(&self, guard: &mut SchedulerGuard<'_>) {
        let unmasked = !self.signals.get(guard).deliverable(self.is_stopped()).is_empty();
        self.have_unmasked_pending.store(unmasked, Ordering::Release);
    }

    pub fn signal_action(&self, signal: Signal) -> KSignalAction {
        let guard = self.kernel().scheduler_lock();
        *self.handlers.get(&guard).action(signal)
    }

    /// KILL 与 STOP 不可更改，返回 `EINVAL`
    pub fn set_signal_action(&self, signal: Signal, action: KSignalAction) -> KResult<KSignalAction> {
        let mut guard = self.kernel().scheduler_lock();
        self.handlers.get_mut(&mut guard).set_action(signal, action)
    }

    pub fn should_ignore_signal(&self, signal: Signal) -> bool {
        let guard = self.kernel().scheduler_lock();
        self.handlers.get(&guard).should_ignore(signal)
    }

    pub fn has_signal_handler(&self, signal: Signal) -> bool {
        let guard = self.kernel().scheduler_lock();
        self.handlers.get(&guard).has_handler(signal)
    }

    /// 替换进程映像时清空掩码、待处理信号和处理函数表
    pub fn clear_signals(&self) {
        let mut guard = self.kernel().scheduler_lock();
        self.signals.get_mut(&mut guard).clear();
        self.handlers.get_mut(&mut guard).clear();
        self.have_unmasked_pending.store(false, Ordering::Release);
    }

    /// 新线程继承处理函数表和掩码，但不继承待处理信号
    pub fn copy_signal_state_from(&self, other: &Thread) {
        let mut guard = self.kernel().scheduler_lock();
        let handlers = other.handlers.get(&guard).clone();
        let signals = other.signals.get(&guard).inherit();
        *self.handlers.get_mut(&mut guard) = handlers;
        *self.signals.get_mut(&mut guard) = signals;
        self.refresh_signal_hint(&mut guard);
    }

    /// 投递一个信号：执行默认行为，或者在用户栈上构造信号帧，让线程从 trampoline 进入处理函数
    pub fn dispatch_signal(self: &Arc<Self>, guard: &mut SchedulerGuard<'_>, signal: Signal) -> DispatchSignalResult {
        debug!("Dispatch signal {signal:?} to {self}, state: {}", self.state_string());
        if self.state() == ThreadState::Invalid || !self.lock_inner_with(|inner| inner.registers_ready) {
            return DispatchSignalResult::Deferred;
        }
        let action = *self.handlers.get(guard).action(signal);
        self.signals.get_mut(guard).remove_pending(signal);
        self.refresh_signal_hint(guard);
        // 将死的线程不会再回到用户态，信号直接丢弃
        if self.should_die() {
            return DispatchSignalResult::Continue;
        }

        let process = Arc::clone(&self.process);
        let default = DefaultHandler::new(signal);
        let traced = process.with_tracer(|tracer| tracer.is_some());
        if signal == Signal::SIGSTOP || (traced && default == DefaultHandler::CoreDump) {
            debug!("Signal {signal:?} stopping {self}");
            self.set_state_with_signal(guard, ThreadState::Stopped, Some(signal));
            return DispatchSignalResult::Yield;
        }

        if signal == Signal::SIGCONT {
            debug!("Signal: SIGCONT resuming {self}");
        } else if traced {
            // 被追踪时，只有追踪者重新布置过的信号才会真正投递，其余的都先停下来交给追踪者
            let armed = process.with_tracer(|tracer| {
                tracer.is_some_and(|tracer| {
                    let armed = tracer.has_pending_signal(signal);
                    tracer.unset_signal(signal);
                    armed
                })
            });
            if !armed {
                debug!("Signal {signal:?} stopping {self} for tracer");
                self.set_state_with_signal(guard, ThreadState::Stopped, Some(signal));
                return DispatchSignalResult::Yield;
            }
        }

        if action.is_default() {
            return match default {
                DefaultHandler::Stop => {
                    self.set_state_with_signal(guard, ThreadState::Stopped, Some(signal));
                    DispatchSignalResult::Yield
                }
                DefaultHandler::CoreDump => {
                    process.set_dump_core(true);
                    for thread in process.threads() {
                        thread.set_dump_backtrace_on_finalization();
                    }
                    process.terminate_due_to_signal(guard, signal);
                    DispatchSignalResult::Terminate
                }
                DefaultHandler::Terminate => {
                    process.terminate_due_to_signal(guard, signal);
                    DispatchSignalResult::Terminate
                }
                // 被忽略的信号在发送时就已经丢弃，这里只可能是发送之后才改回了默认
                DefaultHandler::Ignore | DefaultHandler::Continue => DispatchSignalResult::Continue,
            };
        }

        if action.is_ignore() {
            debug!("Ignored signal {signal:?}");
            return DispatchSignalResult::Continue;
        }

        let old_mask = self.signals.get(guard).mask();
        let mut handler_mask = action.mask();
        if action.flags().contains(SignalActionFlags::SA_NODEFER) {
            handler_mask.remove(signal.into());
        } else {
            handler_mask.insert(signal.into());
        }

        let memory = Arc::clone(process.address_space());
        let trampoline = process.signal_trampoline();
        let setup = self.lock_inner_with(|inner| {
            inner
                .registers
                .setup_signal_frame(&*memory, signal, action.handler(), old_mask, trampoline)
        });
        if let Err(e) = setup {
            warn!("{self} failed to set up signal frame for {signal:?}: {e}");
            process.terminate_due_to_signal(guard, Signal::SIGSEGV);
            return DispatchSignalResult::Terminate;
        }
        self.signals.get_mut(guard).set_mask(old_mask | handler_mask);
        self.refresh_signal_hint(guard);
        debug!(
            "{self} has been primed with signal handler {:#x} to deliver {signal:?}",
            action.handler()
        );
        DispatchSignalResult::Continue
    }

    pub(crate) fn dispatch_one_pending_signal(self: &Arc<Self>, guard: &mut SchedulerGuard<'_>) -> DispatchSignalResult {
        match self.deliverable_signals(guard).first_pending() {
            Some(signal) => self.dispatch_signal(guard, signal),
            None => DispatchSignalResult::Continue,
        }
    }

    /// 只在 `signal` 可以投递时投递它
    pub fn try_dispatch_one_pending_signal(self: &Arc<Self>, signal: Signal) -> DispatchSignalResult {
        let mut guard = self.kernel().scheduler_lock();
        if !self.deliverable_signals(&guard).has(signal) {
            return DispatchSignalResult::Continue;
        }
        self.dispatch_signal(&mut guard, signal)
    }

    pub fn check_dispatch_pending_signal(self: &Arc<Self>) -> DispatchSignalResult {
        let result = {
            let mut guard = self.kernel().scheduler_lock();
            if self.pending_signals_for_state(&guard).is_empty() {
                DispatchSignalResult::Continue
            } else {
                self.dispatch_one_pending_signal(&mut guard)
            }
        };
        if result == DispatchSignalResult::Yield {
            self.yield_without_releasing_big_lock(VerifyLockNotHeld::No);
        }
        result
    }

    /// 返回用户态前调用。返回 `Break` 时线程不应再回到用户态
    pub fn handle_pending_signals(self: &Arc<Self>) -> ControlFlow<()> {
        if self.has_unmasked_pending_signals() {
            self.check_dispatch_pending_signal();
        }
        self.die_if_needed()
    }

    /// sigreturn：从用户栈上的信号帧恢复寄存器与掩码，返回被打断时的返回值寄存器
    pub fn restore_signal_frame(&self) -> KResult<usize> {
        let memory = Arc::clone(self.process.address_space());
        let (old_mask, return_value) = self.lock_inner_with(|inner| -> KResult<_> {
            let sp = inner.registers.sp();
            let old_mask = inner.registers.restore_signal_frame(&*memory, sp)?;
            Ok((old_mask, inner.registers.return_value()))
        })?;
        self.update_signal_mask(old_mask);
        Ok(return_value)
    }
}
