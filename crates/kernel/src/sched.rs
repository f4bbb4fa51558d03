//! 全局调度锁，以及由它保护的线程字段

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use klocks::SpinNoIrqMutexGuard;

use crate::thread::Thread;

/// 调度器的外部接口。运行队列的具体策略由平台决定
pub trait Scheduler: Send + Sync {
    fn enqueue_runnable_thread(&self, guard: &mut SchedulerGuard<'_>, thread: &Arc<Thread>);
    fn dequeue_runnable_thread(&self, guard: &mut SchedulerGuard<'_>, thread: &Arc<Thread>);
    /// 请求切换。不在临界区内时立即切换，否则推迟到离开临界区时。
    ///
    /// 调用时不能持有调度锁。线程进入 `Dying` 后切换走时，调度器负责将其标记为不活跃并通知回收者
    fn yield_now(&self, current: &Arc<Thread>);
    fn notify_finalizer(&self);
    fn add_time_scheduled(&self, delta: u64, is_kernel: bool);
}

pub struct SchedulerState {
    kernel_id: usize,
    /// 已经进入 `Dying` 的线程，持有它们“正在运行”的那份引用，直到被回收
    pub(crate) dying: Vec<Arc<Thread>>,
}

impl SchedulerState {
    pub(crate) const fn new(kernel_id: usize) -> Self {
        Self {
            kernel_id,
            dying: Vec::new(),
        }
    }
}

pub type SchedulerGuard<'a> = SpinNoIrqMutexGuard<'a, SchedulerState>;

/// 只能在持有调度锁时访问的数据
pub struct SchedCell<T> {
    owner: usize,
    value: UnsafeCell<T>,
}

// 访问都要求出示同一个内核的调度锁守卫
unsafe impl<T: Send> Sync for SchedCell<T> {}
unsafe impl<T: Send> Send for SchedCell<T> {}

impl<T> SchedCell<T> {
    pub const fn new(owner: usize, value: T) -> Self {
        Self {
            owner,
            value: UnsafeCell::new(value),
        }
    }

    pub fn get<'a>(&'a self, guard: &'a SchedulerGuard<'_>) -> &'a T {
        assert_eq!(guard.kernel_id, self.owner);
        // SAFETY: 持有调度锁，且写入方需要 `&mut` 守卫
        unsafe { &*self.value.get() }
    }

    pub fn get_mut<'a>(&'a self, guard: &'a mut SchedulerGuard<'_>) -> &'a mut T {
        assert_eq!(guard.kernel_id, self.owner);
        // SAFETY: 同上，`&mut` 守卫保证了独占
        unsafe { &mut *self.value.get() }
    }
}
