//! 线程。
//!
//! 状态与信号相关的字段由全局调度锁保护；阻塞相关的字段由线程自己的 `block` 锁保护；
//! 名字、寄存器等杂项由 `inner` 锁保护。加锁顺序为 调度锁 -> block -> inner

mod block;
mod blocker;
mod join;
mod lifecycle;
mod registry;
mod signal;
mod state;
mod tls;

pub use block::VerifyLockNotHeld;
pub use blocker::{BlockResult, Blocker, BlockerId};
pub use registry::ThreadRegistry;
pub use self::signal::DispatchSignalResult;
pub use state::ThreadState;

use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use atomic::Atomic;
use compact_str::CompactString;
use defines::config::THREAD_PRIORITY_NORMAL;
use defines::error::KResult;
use defines::trap_context::{FpuState, TrapContext};
use klocks::SpinNoIrqMutex;
use ::signal::{SignalHandlers, SignalReceiver};

use self::blocker::BlockState;
use self::join::JoinCondition;
use crate::kernel::Kernel;
use crate::memory::KernelStack;
use crate::process::{Pid, Process};
use crate::sched::SchedCell;

pub type Tid = usize;

#[derive(Debug, Default, Clone, Copy)]
struct ThreadTimes {
    kernel: u64,
    user: u64,
}

pub struct ThreadInner {
    pub name: CompactString,
    pub registers: TrapContext,
    pub fpu_state: FpuState,
    /// 寄存器是否已经设置好。未设置时信号的投递会被推迟
    registers_ready: bool,
    /// 用户态 TLS 末尾 [`defines::misc::ThreadSpecificData`] 的地址
    pub thread_specific_data: usize,
    thread_specific_range: Option<Range<usize>>,
    last_time_scheduled: Option<u64>,
}

pub struct Thread {
    tid: Tid,
    process: Arc<Process>,
    kernel_stack: KernelStack,

    state: Atomic<ThreadState>,
    stop_state: SchedCell<ThreadState>,
    signals: SchedCell<SignalReceiver>,
    handlers: SchedCell<SignalHandlers>,
    times: SchedCell<ThreadTimes>,

    /// 是否有未屏蔽的待处理信号，返回用户态的路径上无锁地检查
    have_unmasked_pending: AtomicBool,
    should_die: AtomicBool,
    handling_page_fault: AtomicBool,
    dump_backtrace_on_finalization: AtomicBool,
    /// 是否还在某个处理器上执行。进入 `Dying` 后由调度器在切换走之后清除
    is_active: AtomicBool,
    priority: AtomicI32,
    /// 在运行队列中时为其优先级，否则为负
    runnable_priority: AtomicI32,

    block: SpinNoIrqMutex<BlockState>,
    join: JoinCondition,
    inner: SpinNoIrqMutex<ThreadInner>,
}

impl Thread {
    /// 创建一个处于 `Invalid` 状态的线程并加入进程。
    ///
    /// 进程的第一个线程使用 pid 作为 tid
    pub fn try_create(process: &Arc<Process>) -> KResult<Arc<Self>> {
        let kernel = process.kernel();
        let kernel_stack = KernelStack::new(kernel.memory())?;
        let tid = if process.claim_main_tid() {
            process.pid()
        } else {
            kernel.alloc_id()?
        };
        let id = kernel.id();
        let fpu_state = kernel.processor().clean_fpu_state();
        let thread = Arc::new_cyclic(|weak| {
            // 注册时线程尚未构造完，此时的查找会因为无法升级而失败
            kernel.threads().register(tid, weak.clone());
            Thread {
                tid,
                process: Arc::clone(process),
                kernel_stack,
                state: Atomic::new(ThreadState::Invalid),
                stop_state: SchedCell::new(id, ThreadState::Invalid),
                signals: SchedCell::new(id, SignalReceiver::new()),
                handlers: SchedCell::new(id, SignalHandlers::new()),
                times: SchedCell::new(id, ThreadTimes::default()),
                have_unmasked_pending: AtomicBool::new(false),
                should_die: AtomicBool::new(false),
                handling_page_fault: AtomicBool::new(false),
                dump_backtrace_on_finalization: AtomicBool::new(false),
                is_active: AtomicBool::new(false),
                priority: AtomicI32::new(THREAD_PRIORITY_NORMAL),
                runnable_priority: AtomicI32::new(-1),
                block: SpinNoIrqMutex::new(BlockState::new()),
                join: JoinCondition::new(),
                inner: SpinNoIrqMutex::new(ThreadInner {
                    name: process.name(),
                    registers: TrapContext::default(),
                    fpu_state,
                    registers_ready: false,
                    thread_specific_data: 0,
                    thread_specific_range: None,
                    last_time_scheduled: None,
                }),
            }
        });
        process.add_thread(Arc::clone(&thread));
        debug!("Created thread {thread}");
        Ok(thread)
    }

    pub fn from_tid(kernel: &Kernel, tid: Tid) -> Option<Arc<Self>> {
        kernel.threads().get(tid)
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    fn kernel(&self) -> &Arc<Kernel> {
        self.process.kernel()
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    pub fn is_current(&self) -> bool {
        self.kernel()
            .processor()
            .current_thread()
            .is_some_and(|current| core::ptr::eq(Arc::as_ptr(&current), self))
    }

    pub fn lock_inner_with<T>(&self, f: impl FnOnce(&mut ThreadInner) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn name(&self) -> CompactString {
        self.lock_inner_with(|inner| inner.name.clone())
    }

    pub fn set_name(&self, name: CompactString) {
        self.lock_inner_with(|inner| inner.name = name);
    }

    pub fn registers(&self) -> TrapContext {
        self.lock_inner_with(|inner| inner.registers.clone())
    }

    pub fn set_registers(&self, registers: TrapContext) {
        self.lock_inner_with(|inner| {
            inner.registers = registers;
            inner.registers_ready = true;
        });
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// 不在运行队列中时为 `None`
    pub fn runnable_priority(&self) -> Option<i32> {
        let priority = self.runnable_priority.load(Ordering::Relaxed);
        (priority >= 0).then_some(priority)
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// 由调度器在切换进出时设置
    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::Release);
    }

    pub fn set_handling_page_fault(&self, handling: bool) {
        self.handling_page_fault.store(handling, Ordering::Relaxed);
    }

    pub fn is_handling_page_fault(&self) -> bool {
        self.handling_page_fault.load(Ordering::Relaxed)
    }

    pub fn set_dump_backtrace_on_finalization(&self) {
        self.dump_backtrace_on_finalization
            .store(true, Ordering::Relaxed);
    }

    /// 累计到全局的统计之后再累计到自己身上。时钟回绕时取差的绝对值
    pub fn update_time_scheduled(&self, now: u64, is_kernel: bool, no_longer_running: bool) {
        let last = self.lock_inner_with(|inner| {
            let last = inner.last_time_scheduled;
            inner.last_time_scheduled = (!no_longer_running).then_some(now);
            last
        });
        let Some(last) = last else {
            return;
        };
        let delta = now.abs_diff(last);
        if delta == 0 {
            return;
        }
        let kernel = self.kernel();
        kernel.scheduler().add_time_scheduled(delta, is_kernel);
        let mut guard = kernel.scheduler_lock();
        let times = self.times.get_mut(&mut guard);
        if is_kernel {
            times.kernel += delta;
        } else {
            times.user += delta;
        }
    }

    /// (内核态, 用户态) 的累计运行时间
    pub fn time_scheduled(&self) -> (u64, u64) {
        let guard = self.kernel().scheduler_lock();
        let times = self.times.get(&guard);
        (times.kernel, times.user)
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.process.name(), self.pid(), self.tid)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        assert!(
            self.runnable_priority.load(Ordering::Relaxed) < 0,
            "thread {} dropped while in the run queue",
            self.tid
        );
        let kernel = self.process.kernel();
        kernel.threads().unregister(self.tid);
        if self.tid != self.process.pid() {
            kernel.dealloc_id(self.tid);
        }
        trace!("thread {} dropped", self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Sim;

    #[test]
    fn first_thread_takes_pid() {
        let sim = Sim::new();
        let process = sim.process("first");
        let main = Thread::try_create(&process).unwrap();
        let second = Thread::try_create(&process).unwrap();
        assert_eq!(main.tid(), process.pid());
        assert_ne!(second.tid(), process.pid());
        assert_eq!(main.state(), ThreadState::Invalid);
        assert_eq!(process.thread_count(), 2);
        assert_eq!(main.to_string(), alloc::format!("first({0}:{0})", process.pid()));
        assert_eq!(main.name(), "first");
    }

    #[test]
    fn registry_lookup_follows_lifetime() {
        let sim = Sim::new();
        let process = sim.process("lookup");
        let _main = Thread::try_create(&process).unwrap();
        let thread = Thread::try_create(&process).unwrap();
        let tid = thread.tid();
        let found = Thread::from_tid(&sim.kernel, tid).unwrap();
        assert!(Arc::ptr_eq(&found, &thread));
        drop(found);

        assert!(!process.remove_thread(tid));
        drop(thread);
        assert!(Thread::from_tid(&sim.kernel, tid).is_none());
        assert_eq!(sim.machine.freed_kernel_stacks(), 1);
        // tid 被回收后可以再次分配
        let again = Thread::try_create(&process).unwrap();
        assert_eq!(again.tid(), tid);
    }

    #[test]
    fn time_accounting_tolerates_wrap() {
        let sim = Sim::new();
        let process = sim.process("times");
        let thread = Thread::try_create(&process).unwrap();
        thread.update_time_scheduled(100, true, false);
        thread.update_time_scheduled(150, true, false);
        thread.update_time_scheduled(120, false, true);
        // 不再运行后的第一次只记录起点
        thread.update_time_scheduled(500, false, false);
        assert_eq!(thread.time_scheduled(), (50, 30));
        assert_eq!(sim.machine.total_time_scheduled(), 80);
    }
}
