mod manager;
mod tracer;

pub use manager::ProcessRegistry;
pub use tracer::ThreadTracer;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use compact_str::CompactString;
use defines::error::KResult;
use klocks::{SpinMutex, SpinNoIrqMutex};
use signal::Signal;
use smallvec::SmallVec;

use crate::kernel::Kernel;
use crate::memory::AddressSpace;
use crate::sched::SchedulerGuard;
use crate::sync::Mutex;
use crate::thread::{Thread, ThreadState, Tid};

pub type Pid = usize;

/// 进程的结束方式，只记录第一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(Signal),
}

/// 主 TLS 镜像，新线程的 TLS 区域从它复制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterTls {
    pub image: usize,
    pub size: usize,
    pub align: usize,
}

struct ProcessInner {
    threads: BTreeMap<Tid, Arc<Thread>>,
    master_tls: Option<MasterTls>,
    main_tid_claimed: bool,
}

pub struct Process {
    pid: Pid,
    ppid: Option<Pid>,
    kernel: Arc<Kernel>,
    name: SpinMutex<CompactString>,
    big_lock: Mutex,
    address_space: Arc<dyn AddressSpace>,
    /// 用户态的信号蹦床，处理函数返回后由它调用 sigreturn
    signal_trampoline: usize,
    stopped: AtomicBool,
    dump_core: AtomicBool,
    finalized: AtomicBool,
    termination: SpinNoIrqMutex<Option<Termination>>,
    tracer: SpinNoIrqMutex<Option<ThreadTracer>>,
    inner: SpinNoIrqMutex<ProcessInner>,
}

impl Process {
    pub fn new(
        kernel: &Arc<Kernel>,
        parent: Option<&Process>,
        name: &str,
        address_space: Arc<dyn AddressSpace>,
        signal_trampoline: usize,
    ) -> KResult<Arc<Self>> {
        let pid = kernel.alloc_id()?;
        let process = Arc::new(Self {
            pid,
            ppid: parent.map(Process::pid),
            kernel: Arc::clone(kernel),
            name: SpinMutex::new(CompactString::new(name)),
            big_lock: Mutex::new("Process"),
            address_space,
            signal_trampoline,
            stopped: AtomicBool::new(false),
            dump_core: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            termination: SpinNoIrqMutex::new(None),
            tracer: SpinNoIrqMutex::new(None),
            inner: SpinNoIrqMutex::new(ProcessInner {
                threads: BTreeMap::new(),
                master_tls: None,
                main_tid_claimed: false,
            }),
        });
        kernel.processes().add(pid, Arc::downgrade(&process));
        info!("Created process {process}");
        Ok(process)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn ppid(&self) -> Option<Pid> {
        self.ppid
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn name(&self) -> CompactString {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = CompactString::new(name);
    }

    pub fn big_lock(&self) -> &Mutex {
        &self.big_lock
    }

    pub fn address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.address_space
    }

    pub fn signal_trampoline(&self) -> usize {
        self.signal_trampoline
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 返回之前的值
    pub fn set_stopped(&self, stopped: bool) -> bool {
        self.stopped.swap(stopped, Ordering::AcqRel)
    }

    pub fn is_dumping_core(&self) -> bool {
        self.dump_core.load(Ordering::Relaxed)
    }

    pub fn set_dump_core(&self, dump_core: bool) {
        self.dump_core.store(dump_core, Ordering::Relaxed);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn termination(&self) -> Option<Termination> {
        *self.termination.lock()
    }

    pub fn is_terminating(&self) -> bool {
        self.termination.lock().is_some()
    }

    fn set_termination(&self, termination: Termination) {
        let mut current = self.termination.lock();
        if current.is_none() {
            *current = Some(termination);
        }
    }

    pub fn with_tracer<T>(&self, f: impl FnOnce(Option<&mut ThreadTracer>) -> T) -> T {
        f(self.tracer.lock().as_mut())
    }

    pub fn start_tracing_from(&self, tracer_pid: Pid) {
        *self.tracer.lock() = Some(ThreadTracer::new(tracer_pid));
    }

    pub fn stop_tracing(&self) {
        *self.tracer.lock() = None;
    }

    pub fn master_tls(&self) -> Option<MasterTls> {
        self.inner.lock().master_tls
    }

    pub fn set_master_tls(&self, image: usize, size: usize, align: usize) {
        self.inner.lock().master_tls = Some(MasterTls { image, size, align });
    }

    /// 第一个线程的 tid 与 pid 相同。返回调用者是否是第一个线程
    pub(crate) fn claim_main_tid(&self) -> bool {
        let mut inner = self.inner.lock();
        !core::mem::replace(&mut inner.main_tid_claimed, true)
    }

    pub(crate) fn add_thread(&self, thread: Arc<Thread>) {
        self.inner.lock().threads.insert(thread.tid(), thread);
    }

    /// 返回被移除的是否是最后一个线程
    pub(crate) fn remove_thread(&self, tid: Tid) -> bool {
        // 线程可能在这里析构，不能在持有锁时释放
        let (removed, is_last) = {
            let mut inner = self.inner.lock();
            let removed = inner.threads.remove(&tid);
            (removed, inner.threads.is_empty())
        };
        removed.is_some() && is_last
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    pub fn threads(&self) -> SmallVec<[Arc<Thread>; 8]> {
        self.inner.lock().threads.values().cloned().collect()
    }

    pub fn find_thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.inner.lock().threads.get(&tid).cloned()
    }

    pub fn send_signal(&self, signal: Signal, sender: Option<&Process>) {
        let mut guard = self.kernel.scheduler_lock();
        if let Some(sender) = sender {
            debug!("Signal: {sender} sent {signal:?} to process {self}");
        }
        self.send_signal_locked(&mut guard, signal);
    }

    /// 交给第一个没有屏蔽该信号的存活线程，都屏蔽了则交给第一个存活线程。
    ///
    /// 没有存活线程时信号被丢弃
    pub(crate) fn send_signal_locked(&self, guard: &mut SchedulerGuard<'_>, signal: Signal) {
        let mut alive = self.threads();
        alive.retain(|thread| !matches!(thread.state(), ThreadState::Dying | ThreadState::Dead));
        let masked = |thread: &Arc<Thread>| thread.signal_mask_locked(&*guard).has(signal);
        let receiver = alive
            .iter()
            .find(|thread| !masked(thread))
            .or_else(|| alive.first())
            .cloned();
        match receiver {
            Some(thread) => thread.send_signal_locked(guard, signal),
            None => debug!("process {self} has no thread to receive {signal:?}"),
        }
    }

    /// 停止、继续与结束时向父进程发送 SIGCHLD
    pub(crate) fn notify_parent_locked(&self, guard: &mut SchedulerGuard<'_>) {
        let Some(parent) = self.ppid.and_then(|ppid| self.kernel.processes().get(ppid)) else {
            return;
        };
        parent.send_signal_locked(guard, Signal::SIGCHLD);
    }

    pub(crate) fn terminate_due_to_signal(&self, guard: &mut SchedulerGuard<'_>, signal: Signal) {
        info!("Terminating {self} due to signal {signal:?}");
        self.set_termination(Termination::Signaled(signal));
        self.kill_all_threads(guard);
    }

    pub(crate) fn kill_all_threads(&self, guard: &mut SchedulerGuard<'_>) {
        for thread in self.threads() {
            thread.set_should_die_locked(guard);
        }
    }

    /// 进程退出。调用者随后应当让当前线程死亡
    pub fn exit(&self, status: i32) {
        info!("process {self} exit with {status}");
        self.set_termination(Termination::Exited(status));
        let mut guard = self.kernel.scheduler_lock();
        self.kill_all_threads(&mut guard);
    }

    /// 最后一个线程被回收时调用
    pub(crate) fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Finalizing process {self}, termination {:?}, dump core {}",
            self.termination(),
            self.is_dumping_core()
        );
        let mut guard = self.kernel.scheduler_lock();
        self.notify_parent_locked(&mut guard);
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name.lock().as_str(), self.pid)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        trace!("process {} dropped", self.pid);
        self.kernel.processes().remove(self.pid);
        self.kernel.dealloc_id(self.pid);
    }
}
