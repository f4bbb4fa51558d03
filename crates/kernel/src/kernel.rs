use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use defines::config::TASK_LIMIT;
use defines::error::{errno, KResult};
use idallocator::RecycleAllocator;
use klocks::SpinNoIrqMutex;

use crate::hart::Processor;
use crate::memory::MemoryManager;
use crate::process::ProcessRegistry;
use crate::sched::{Scheduler, SchedulerGuard, SchedulerState};
use crate::thread::{BlockerId, Thread, ThreadRegistry};
use crate::time::{Clock, TimerQueue};

/// 平台提供的协作者
#[derive(Clone)]
pub struct Platform {
    pub scheduler: Arc<dyn Scheduler>,
    pub processor: Arc<dyn Processor>,
    pub clock: Arc<dyn Clock>,
    pub memory: Arc<dyn MemoryManager>,
}

static NEXT_KERNEL_ID: AtomicUsize = AtomicUsize::new(1);

/// 内核的全局状态。正常只有一个，测试中每个用例各自一个
pub struct Kernel {
    id: usize,
    platform: Platform,
    scheduler_lock: SpinNoIrqMutex<SchedulerState>,
    threads: ThreadRegistry,
    processes: ProcessRegistry,
    /// pid 与 tid 共用同一个命名空间
    id_allocator: SpinNoIrqMutex<RecycleAllocator>,
    timers: TimerQueue,
    next_blocker_id: AtomicU64,
}

impl Kernel {
    pub fn new(platform: Platform) -> Arc<Self> {
        let id = NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed);
        info!("kernel {id} initialized");
        Arc::new(Self {
            id,
            platform,
            scheduler_lock: SpinNoIrqMutex::new(SchedulerState::new(id)),
            threads: ThreadRegistry::new(),
            processes: ProcessRegistry::new(),
            id_allocator: SpinNoIrqMutex::new(RecycleAllocator::with_range(1, TASK_LIMIT)),
            timers: TimerQueue::new(),
            next_blocker_id: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn scheduler_lock(&self) -> SchedulerGuard<'_> {
        self.scheduler_lock.lock()
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.platform.scheduler
    }

    pub fn processor(&self) -> &dyn Processor {
        &*self.platform.processor
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.platform.clock
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.platform.memory
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.processor().current_thread()
    }

    pub(crate) fn next_blocker_id(&self) -> BlockerId {
        self.next_blocker_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_id(&self) -> KResult<usize> {
        self.id_allocator.lock().alloc().ok_or(errno::EAGAIN)
    }

    pub(crate) fn dealloc_id(&self, id: usize) {
        self.id_allocator.lock().dealloc(id);
    }
}
