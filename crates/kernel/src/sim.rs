//! 测试用的模拟平台。
//!
//! 每个内核线程对应一个宿主线程，处理器的个数不受限制。宿主线程只在线程处于 `Running` 时执行，
//! 其余时间在 [`Machine::run_until_scheduled`] 中等待。另有一个宿主线程模拟时钟中断与回收者

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use defines::config::PAGE_SIZE;
use defines::error::{errno, KResult};
use defines::trap_context::{FpuState, UserRegisters};
use defines::user_ptr::UserMemory;
use smallvec::SmallVec;

use crate::hart::{DeferredCall, DeferredCallQueue, Processor};
use crate::memory::{AddressSpace, MemoryManager};
use crate::sched::{Scheduler, SchedulerGuard};
use crate::time::Clock;
use crate::{Kernel, Platform, Process, Thread, ThreadState};

/// 模拟进程的信号蹦床地址
pub const TRAMPOLINE: usize = 0x7000;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
    static IN_IRQ: Cell<bool> = const { Cell::new(false) };
    static CRITICAL: Cell<u32> = const { Cell::new(0) };
    static SWITCH_PENDING: Cell<bool> = const { Cell::new(false) };
}

/// 宿主线程不会再被调度时，以它为载荷展开栈退出
struct Unscheduled;

type Entry = Box<dyn FnOnce(&Arc<Thread>) + Send>;
type UserEntry = Arc<dyn Fn(&Arc<Thread>) + Send + Sync>;

pub struct Machine {
    me: Weak<Machine>,
    start: Instant,
    /// 每次有线程入队都加一，等待被调度的宿主线程据此醒来
    generation: Mutex<u64>,
    scheduled: Condvar,
    queued: Mutex<HashMap<usize, Arc<Thread>>>,
    spawned: Mutex<HashSet<usize>>,
    hold: AtomicBool,
    entries: Mutex<HashMap<usize, Entry>>,
    user_entries: Mutex<HashMap<usize, UserEntry>>,
    deferred: DeferredCallQueue,
    housekeeping: Mutex<()>,
    paused: AtomicBool,
    shutdown: AtomicBool,
    panicked: AtomicBool,
    next_stack: AtomicUsize,
    freed_stacks: AtomicUsize,
    fail_stack: AtomicBool,
    time_scheduled: AtomicU64,
    finalizer_notified: AtomicUsize,
}

fn thread_key(thread: &Arc<Thread>) -> usize {
    Arc::as_ptr(thread) as usize
}

impl Machine {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            start: Instant::now(),
            generation: Mutex::new(0),
            scheduled: Condvar::new(),
            queued: Mutex::new(HashMap::new()),
            spawned: Mutex::new(HashSet::new()),
            hold: AtomicBool::new(false),
            entries: Mutex::new(HashMap::new()),
            user_entries: Mutex::new(HashMap::new()),
            deferred: DeferredCallQueue::new(),
            housekeeping: Mutex::new(()),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            next_stack: AtomicUsize::new(0xffff_8000_0000_0000),
            freed_stacks: AtomicUsize::new(0),
            fail_stack: AtomicBool::new(false),
            time_scheduled: AtomicU64::new(0),
            finalizer_notified: AtomicUsize::new(0),
        })
    }

    fn bump_generation(&self) {
        *self.generation.lock().unwrap() += 1;
        self.scheduled.notify_all();
    }

    /// 新入队的线程暂时不创建宿主线程，用于只观察状态的测试
    pub fn hold_new_threads(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
        if !hold {
            let queued: Vec<_> = self.queued.lock().unwrap().values().cloned().collect();
            for thread in &queued {
                self.spawn_host(thread);
            }
        }
    }

    pub fn is_queued(&self, thread: &Arc<Thread>) -> bool {
        self.queued.lock().unwrap().contains_key(&thread_key(thread))
    }

    pub fn freed_kernel_stacks(&self) -> usize {
        self.freed_stacks.load(Ordering::SeqCst)
    }

    pub fn total_time_scheduled(&self) -> u64 {
        self.time_scheduled.load(Ordering::SeqCst)
    }

    pub fn finalizer_notifications(&self) -> usize {
        self.finalizer_notified.load(Ordering::SeqCst)
    }

    /// 没有通过 [`Sim::spawn`] 指定入口的线程，按用户态入口地址找到要执行的代码
    pub fn register_entry(&self, ip: usize, body: impl Fn(&Arc<Thread>) + Send + Sync + 'static) {
        self.user_entries.lock().unwrap().insert(ip, Arc::new(body));
    }

    pub fn fail_next_kernel_stack(&self) {
        self.fail_stack.store(true, Ordering::SeqCst);
    }

    /// 暂停后时钟中断与回收都不再发生。返回时正在进行的那一轮已经结束
    pub fn pause_housekeeping(&self, paused: bool) {
        let _running = self.housekeeping.lock().unwrap();
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn drain_deferred_calls(&self) -> usize {
        self.deferred.drain()
    }

    fn spawn_host(&self, thread: &Arc<Thread>) {
        if !self.spawned.lock().unwrap().insert(thread_key(thread)) {
            return;
        }
        let Some(machine) = self.me.upgrade() else {
            return;
        };
        let thread = Arc::clone(thread);
        std::thread::Builder::new()
            .name(format!("sim-{}", thread.tid()))
            .spawn(move || machine.run_thread(thread))
            .unwrap();
    }

    fn run_thread(&self, thread: Arc<Thread>) {
        CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(&thread)));
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_until_scheduled(&thread);
            let entry = self.entries.lock().unwrap().remove(&thread.tid());
            if let Some(entry) = entry {
                entry(&thread);
            } else {
                let ip = thread.registers().ip();
                let user_entry = self.user_entries.lock().unwrap().get(&ip).cloned();
                if let Some(user_entry) = user_entry {
                    user_entry(&thread);
                }
            }
            // 从入口返回相当于退出
            if thread.state() != ThreadState::Dying {
                if thread.should_die() {
                    let _ = thread.die_if_needed();
                } else {
                    let _ = thread.exit(0);
                }
            }
        }));
        if let Err(payload) = result {
            if !payload.is::<Unscheduled>() {
                self.panicked.store(true, Ordering::SeqCst);
                CRITICAL.set(0);
                SWITCH_PENDING.set(false);
                if thread.state() == ThreadState::Running {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                        thread.set_should_die();
                        let _ = thread.die_if_needed();
                    }));
                }
            }
        }
        CURRENT.with(|current| current.borrow_mut().take());
    }

    /// 等待线程被调度。线程已经进入 `Dying` 时不会返回
    fn run_until_scheduled(&self, thread: &Arc<Thread>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                panic::resume_unwind(Box::new(Unscheduled));
            }
            let generation = *self.generation.lock().unwrap();
            {
                let kernel = Arc::clone(thread.process().kernel());
                let mut guard = kernel.scheduler_lock();
                match thread.state() {
                    ThreadState::Runnable => {
                        thread.set_active(true);
                        thread.set_state(&mut guard, ThreadState::Running);
                        return;
                    }
                    ThreadState::Running => {
                        thread.set_active(true);
                        return;
                    }
                    ThreadState::Dying => {
                        drop(guard);
                        thread.set_active(false);
                        self.notify_finalizer();
                        panic::resume_unwind(Box::new(Unscheduled));
                    }
                    _ => {}
                }
            }
            let current = self.generation.lock().unwrap();
            if *current == generation {
                let _ = self
                    .scheduled
                    .wait_timeout(current, Duration::from_millis(10))
                    .unwrap();
            }
        }
    }

    fn start_housekeeping(&self, kernel: Weak<Kernel>) {
        let Some(machine) = self.me.upgrade() else {
            return;
        };
        std::thread::Builder::new()
            .name("sim-housekeeping".into())
            .spawn(move || {
                while !machine.shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                    let _running = machine.housekeeping.lock().unwrap();
                    if machine.paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    let Some(kernel) = kernel.upgrade() else {
                        break;
                    };
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        IN_IRQ.set(true);
                        kernel.timers().fire_expired(machine.now_ns());
                        IN_IRQ.set(false);
                        machine.deferred.drain();
                        Thread::finalize_dying_threads(&kernel);
                    }));
                    if result.is_err() {
                        IN_IRQ.set(false);
                        machine.panicked.store(true, Ordering::SeqCst);
                    }
                }
            })
            .unwrap();
    }
}

impl Scheduler for Machine {
    fn enqueue_runnable_thread(&self, _guard: &mut SchedulerGuard<'_>, thread: &Arc<Thread>) {
        self.queued
            .lock()
            .unwrap()
            .insert(thread_key(thread), Arc::clone(thread));
        self.bump_generation();
        if !self.hold.load(Ordering::SeqCst) {
            self.spawn_host(thread);
        }
    }

    fn dequeue_runnable_thread(&self, _guard: &mut SchedulerGuard<'_>, thread: &Arc<Thread>) {
        self.queued.lock().unwrap().remove(&thread_key(thread));
    }

    fn yield_now(&self, current: &Arc<Thread>) {
        if CRITICAL.get() > 0 {
            SWITCH_PENDING.set(true);
        } else {
            self.run_until_scheduled(current);
        }
    }

    fn notify_finalizer(&self) {
        self.finalizer_notified.fetch_add(1, Ordering::SeqCst);
    }

    fn add_time_scheduled(&self, delta: u64, _is_kernel: bool) {
        self.time_scheduled.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Machine {
    fn run_pending_switch(&self) {
        if !SWITCH_PENDING.replace(false) {
            return;
        }
        let current = CURRENT.with(|current| current.borrow().clone());
        if let Some(current) = current {
            self.run_until_scheduled(&current);
        }
    }
}

impl Processor for Machine {
    fn in_irq(&self) -> bool {
        IN_IRQ.get()
    }

    fn in_critical(&self) -> bool {
        CRITICAL.get() > 0
    }

    fn enter_critical(&self) {
        CRITICAL.set(CRITICAL.get() + 1);
    }

    fn leave_critical(&self) {
        // 线程死亡时展开栈，此前 `clear_critical` 已经清零
        let depth = CRITICAL.get().saturating_sub(1);
        CRITICAL.set(depth);
        if depth == 0 && !std::thread::panicking() {
            self.run_pending_switch();
        }
    }

    fn clear_critical(&self) -> u32 {
        let prev = CRITICAL.replace(0);
        self.run_pending_switch();
        prev
    }

    fn restore_critical(&self, prev: u32) {
        CRITICAL.set(prev);
    }

    fn current_thread(&self) -> Option<Arc<Thread>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    fn deferred_call_queue(&self, call: DeferredCall) {
        self.deferred.push(call);
    }

    fn smp_wake_n_idle_processors(&self, _count: usize) {
        self.scheduled.notify_all();
    }

    fn clean_fpu_state(&self) -> FpuState {
        FpuState::zeroed()
    }

    fn capture_stack_trace(&self, thread: &Thread) -> SmallVec<[usize; 16]> {
        smallvec::smallvec![thread.kernel_stack().top()]
    }
}

impl Clock for Machine {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl MemoryManager for Machine {
    fn allocate_kernel_stack(&self, size: usize) -> KResult<Range<usize>> {
        if self.fail_stack.swap(false, Ordering::SeqCst) {
            return Err(errno::ENOMEM);
        }
        let start = self.next_stack.fetch_add(size + PAGE_SIZE, Ordering::SeqCst);
        Ok(start..start + size)
    }

    fn free_kernel_stack(&self, _range: Range<usize>) {
        self.freed_stacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// 一个内核加上模拟它的平台
pub struct Sim {
    pub kernel: Arc<Kernel>,
    pub machine: Arc<Machine>,
}

impl Sim {
    pub fn new() -> Self {
        let machine = Machine::new();
        let kernel = Kernel::new(Platform {
            scheduler: machine.clone(),
            processor: machine.clone(),
            clock: machine.clone(),
            memory: machine.clone(),
        });
        machine.start_housekeeping(Arc::downgrade(&kernel));
        Self { kernel, machine }
    }

    pub fn process(&self, name: &str) -> Arc<Process> {
        Process::new(&self.kernel, None, name, Arc::new(SimAddressSpace::new()), TRAMPOLINE).unwrap()
    }

    pub fn child_process(&self, parent: &Process, name: &str) -> Arc<Process> {
        Process::new(
            &self.kernel,
            Some(parent),
            name,
            Arc::new(SimAddressSpace::new()),
            TRAMPOLINE,
        )
        .unwrap()
    }

    /// 创建线程并让它就绪，它被调度后执行 `body`
    pub fn spawn(
        &self,
        process: &Arc<Process>,
        body: impl FnOnce(&Arc<Thread>) + Send + 'static,
    ) -> Arc<Thread> {
        let thread = Thread::try_create(process).unwrap();
        self.machine
            .entries
            .lock()
            .unwrap()
            .insert(thread.tid(), Box::new(body));
        let mut guard = self.kernel.scheduler_lock();
        thread.set_state(&mut guard, ThreadState::Runnable);
        drop(guard);
        thread
    }

    /// 等到线程死亡并且已经切换走
    pub fn wait_for_death(&self, thread: &Arc<Thread>) {
        wait_until(|| {
            self.machine.panicked.load(Ordering::SeqCst)
                || (matches!(thread.state(), ThreadState::Dying | ThreadState::Dead) && !thread.is_active())
        });
        assert!(
            !self.machine.panicked.load(Ordering::SeqCst),
            "a simulated thread panicked"
        );
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        self.machine.shutdown.store(true, Ordering::SeqCst);
        self.machine.bump_generation();
        if self.machine.panicked.load(Ordering::SeqCst) && !std::thread::panicking() {
            panic!("a simulated thread panicked");
        }
    }
}

/// 最多等 5 秒
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// 在模拟的中断上下文中执行
pub fn with_irq<T>(f: impl FnOnce() -> T) -> T {
    IN_IRQ.set(true);
    let result = f();
    IN_IRQ.set(false);
    result
}

/// 按页分配的用户地址空间，区域之外的访问返回 `EFAULT`
pub struct SimAddressSpace {
    regions: Mutex<BTreeMap<usize, (String, Vec<u8>)>>,
    next: AtomicUsize,
}

impl SimAddressSpace {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            next: AtomicUsize::new(0x1000_0000),
        }
    }

    fn with_region<T>(&self, addr: usize, len: usize, f: impl FnOnce(&mut [u8]) -> T) -> KResult<T> {
        let mut regions = self.regions.lock().unwrap();
        let (&start, (_, bytes)) = regions.range_mut(..=addr).next_back().ok_or(errno::EFAULT)?;
        let offset = addr - start;
        let end = offset.checked_add(len).ok_or(errno::EFAULT)?;
        if end > bytes.len() {
            return Err(errno::EFAULT);
        }
        Ok(f(&mut bytes[offset..end]))
    }
}

impl UserMemory for SimAddressSpace {
    fn copy_to_user(&self, addr: usize, data: &[u8]) -> KResult<()> {
        self.with_region(addr, data.len(), |dst| dst.copy_from_slice(data))
    }

    fn copy_from_user(&self, addr: usize, buf: &mut [u8]) -> KResult<()> {
        self.with_region(addr, buf.len(), |src| buf.copy_from_slice(src))
    }
}

impl AddressSpace for SimAddressSpace {
    fn allocate_region(&self, size: usize, name: &str) -> KResult<Range<usize>> {
        let size = size.max(1).next_multiple_of(PAGE_SIZE);
        // 区域之间留一页空隙，越界访问一定会失败
        let start = self.next.fetch_add(size + PAGE_SIZE, Ordering::SeqCst);
        self.regions
            .lock()
            .unwrap()
            .insert(start, (name.to_owned(), vec![0; size]));
        Ok(start..start + size)
    }

    fn deallocate_region(&self, range: Range<usize>) -> KResult<()> {
        self.regions
            .lock()
            .unwrap()
            .remove(&range.start)
            .map(|_| ())
            .ok_or(errno::EINVAL)
    }

    fn unmap_range(&self, addr: usize, size: usize) -> KResult<()> {
        if addr % PAGE_SIZE != 0 {
            return Err(errno::EINVAL);
        }
        let end = addr.checked_add(size).ok_or(errno::EINVAL)?;
        self.regions
            .lock()
            .unwrap()
            .retain(|&start, (_, bytes)| start + bytes.len() <= addr || start >= end);
        Ok(())
    }

    fn validate_user_stack(&self, addr: usize) -> bool {
        let regions = self.regions.lock().unwrap();
        regions.range(..addr).next_back().is_some_and(|(&start, (name, bytes))| {
            name.contains("stack") && addr > start && addr <= start + bytes.len()
        })
    }
}
