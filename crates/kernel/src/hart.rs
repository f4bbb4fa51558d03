//! 处理器相关的接口：临界区、中断上下文、延迟调用

use alloc::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use defines::trap_context::FpuState;
use smallvec::SmallVec;

use crate::thread::{BlockResult, BlockerId, Thread};

/// 当前处理器。实现应当是 per-cpu 的，即每个方法都只作用于调用者所在的处理器
pub trait Processor: Send + Sync {
    fn in_irq(&self) -> bool;
    fn in_critical(&self) -> bool;
    fn enter_critical(&self);
    /// 离开最后一层临界区时，执行被推迟的切换
    fn leave_critical(&self);
    /// 完全离开临界区（会执行被推迟的切换），返回之前的嵌套层数
    fn clear_critical(&self) -> u32;
    fn restore_critical(&self, prev: u32);
    fn current_thread(&self) -> Option<Arc<Thread>>;
    /// 在中断上下文中无法完成的操作推迟到这里，由处理器稍后在中断外执行
    fn deferred_call_queue(&self, call: DeferredCall);
    fn smp_wake_n_idle_processors(&self, count: usize);
    fn clean_fpu_state(&self) -> FpuState;
    fn capture_stack_trace(&self, thread: &Thread) -> SmallVec<[usize; 16]>;
}

/// 作用域内处于临界区
pub struct ScopedCritical<'a> {
    processor: &'a dyn Processor,
}

impl<'a> ScopedCritical<'a> {
    pub fn new(processor: &'a dyn Processor) -> Self {
        processor.enter_critical();
        Self { processor }
    }
}

impl Drop for ScopedCritical<'_> {
    fn drop(&mut self) {
        self.processor.leave_critical();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredOp {
    UnblockFromLock { lock_id: usize },
    UnblockFromBlocker { id: BlockerId, outcome: BlockResult },
}

/// 只持有线程的弱引用，线程在执行前已经销毁的话就什么也不做
pub struct DeferredCall {
    thread: Weak<Thread>,
    op: DeferredOp,
}

impl DeferredCall {
    pub fn new(thread: &Arc<Thread>, op: DeferredOp) -> Self {
        Self {
            thread: Arc::downgrade(thread),
            op,
        }
    }

    pub fn op(&self) -> DeferredOp {
        self.op
    }

    pub fn execute(self) {
        let Some(thread) = self.thread.upgrade() else {
            trace!("deferred {:?} dropped, thread is gone", self.op);
            return;
        };
        match self.op {
            DeferredOp::UnblockFromLock { lock_id } => {
                thread.unblock_from_lock(lock_id);
            }
            DeferredOp::UnblockFromBlocker { id, outcome } => {
                thread.unblock_from_blocker(id, outcome);
            }
        }
    }
}

/// 处理器可以直接用它来实现 [`Processor::deferred_call_queue`]
#[derive(Default)]
pub struct DeferredCallQueue {
    calls: SegQueue<DeferredCall>,
}

impl DeferredCallQueue {
    pub const fn new() -> Self {
        Self {
            calls: SegQueue::new(),
        }
    }

    pub fn push(&self, call: DeferredCall) {
        self.calls.push(call);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// 必须在中断上下文之外调用。返回执行了多少个
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while let Some(call) = self.calls.pop() {
            call.execute();
            count += 1;
        }
        count
    }
}
