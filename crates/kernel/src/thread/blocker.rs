use alloc::sync::Arc;

use defines::error::{errno, KResult};
use signal::{Signal, SignalSet};
use smallvec::SmallVec;

use super::join::TryJoin;
use super::{Thread, ThreadState};
use crate::sched::SchedulerGuard;
use crate::sync::WaitQueue;

pub type BlockerId = u64;

/// 一次阻塞的结果。只有第一个结果有效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    WokeNormally,
    /// 等待的条件在阻塞之前就已经满足
    NotBlocked,
    InterruptedBySignal(Signal),
    InterruptedByDeath,
    InterruptedByTimeout,
}

impl BlockResult {
    pub fn was_interrupted(self) -> bool {
        matches!(
            self,
            BlockResult::InterruptedBySignal(_) | BlockResult::InterruptedByDeath
        )
    }

    pub fn timed_out(self) -> bool {
        self == BlockResult::InterruptedByTimeout
    }
}

/// 线程等待的条件
pub enum Blocker {
    /// 只会被超时、信号或死亡唤醒
    Sleep,
    /// 等待另一个线程退出。不能被信号打断
    Join {
        joinee: Arc<Thread>,
        result: Option<KResult<usize>>,
    },
    Queue(Arc<WaitQueue>),
    /// 任意一个队列被唤醒即可
    Select {
        queues: SmallVec<[Arc<WaitQueue>; 4]>,
        woken: Option<usize>,
    },
    /// 等待集合中的某个信号成为待处理，并将其取走
    Signal {
        set: SignalSet,
        delivered: Option<Signal>,
    },
}

impl Blocker {
    pub fn join(joinee: Arc<Thread>) -> Self {
        Blocker::Join {
            joinee,
            result: None,
        }
    }

    pub fn queue(queue: Arc<WaitQueue>) -> Self {
        Blocker::Queue(queue)
    }

    pub fn select(queues: impl IntoIterator<Item = Arc<WaitQueue>>) -> Self {
        Blocker::Select {
            queues: queues.into_iter().collect(),
            woken: None,
        }
    }

    pub fn signal(set: SignalSet) -> Self {
        Blocker::Signal {
            set,
            delivered: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Blocker::Sleep => "Sleeping",
            Blocker::Join { .. } => "Joining",
            Blocker::Queue(_) => "Queue",
            Blocker::Select { .. } => "Selecting",
            Blocker::Signal { .. } => "Signal",
        }
    }

    pub fn is_interruptible(&self) -> bool {
        !matches!(self, Blocker::Join { .. })
    }

    /// `Join` 的结果：退出值或错误
    pub fn join_result(&self) -> Option<KResult<usize>> {
        match self {
            Blocker::Join { result, .. } => *result,
            _ => None,
        }
    }

    /// `Select` 中唤醒了等待者的队列的下标
    pub fn woken_queue(&self) -> Option<usize> {
        match self {
            Blocker::Select { woken, .. } => *woken,
            _ => None,
        }
    }

    pub fn delivered_signal(&self) -> Option<Signal> {
        match self {
            Blocker::Signal { delivered, .. } => *delivered,
            _ => None,
        }
    }

    fn waited_signals(&self) -> SignalSet {
        match self {
            Blocker::Signal { set, .. } => *set,
            _ => SignalSet::empty(),
        }
    }

    /// 注册到等待的对象上。条件已经满足时返回结果，不再阻塞
    pub(super) fn setup(
        &mut self,
        guard: &mut SchedulerGuard<'_>,
        thread: &Arc<Thread>,
        id: BlockerId,
    ) -> Option<BlockResult> {
        match self {
            Blocker::Sleep => None,
            Blocker::Join { joinee, result } => {
                if Arc::ptr_eq(joinee, thread) {
                    *result = Some(Err(errno::EDEADLK));
                    return Some(BlockResult::NotBlocked);
                }
                match joinee.join.try_join(thread, id) {
                    Err(e) => {
                        *result = Some(Err(e));
                        Some(BlockResult::NotBlocked)
                    }
                    Ok(TryJoin::Exited(value)) => {
                        *result = Some(Ok(value));
                        joinee.notify_finalizer_if_dying();
                        Some(BlockResult::NotBlocked)
                    }
                    Ok(TryJoin::Died) => Some(BlockResult::InterruptedByDeath),
                    Ok(TryJoin::Waiting) => None,
                }
            }
            Blocker::Queue(queue) => (!queue.register(thread, id)).then_some(BlockResult::NotBlocked),
            Blocker::Select { queues, woken } => {
                for (index, queue) in queues.iter().enumerate() {
                    if !queue.register(thread, id) {
                        for registered in &queues[..index] {
                            registered.unregister(id);
                        }
                        *woken = Some(index);
                        return Some(BlockResult::NotBlocked);
                    }
                }
                None
            }
            Blocker::Signal { set, delivered } => {
                let signal = thread.take_pending_signal(guard, *set)?;
                *delivered = Some(signal);
                Some(BlockResult::NotBlocked)
            }
        }
    }

    /// 阻塞结束后从等待的对象上注销，并收集结果
    pub(super) fn teardown(
        &mut self,
        guard: &mut SchedulerGuard<'_>,
        thread: &Arc<Thread>,
        id: BlockerId,
        outcome: BlockResult,
    ) {
        match self {
            Blocker::Sleep => {}
            Blocker::Join { joinee, result } => {
                if outcome == BlockResult::WokeNormally {
                    *result = Some(joinee.join.exit_value().ok_or(errno::EINVAL));
                    joinee.notify_finalizer_if_dying();
                } else {
                    joinee.join.remove_waiter(id);
                }
            }
            Blocker::Queue(queue) => {
                queue.unregister(id);
            }
            Blocker::Select { queues, woken } => {
                for (index, queue) in queues.iter().enumerate() {
                    // 已经不在队列里的，就是唤醒者弹出的
                    if !queue.unregister(id) && woken.is_none() && outcome == BlockResult::WokeNormally {
                        *woken = Some(index);
                    }
                }
            }
            Blocker::Signal { set, delivered } => {
                if outcome == BlockResult::WokeNormally {
                    *delivered = thread.take_pending_signal(guard, *set);
                }
            }
        }
    }
}

/// 线程当前的阻塞记录
pub(crate) struct ActiveBlocker {
    pub(crate) id: BlockerId,
    pub(crate) name: &'static str,
    pub(crate) interruptible: bool,
    /// `Signal` 阻塞等待的信号，这些信号即使被屏蔽也会唤醒它
    pub(crate) waited_signals: SignalSet,
    pub(crate) outcome: Option<BlockResult>,
}

impl ActiveBlocker {
    pub(crate) fn new(id: BlockerId, blocker: &Blocker) -> Self {
        Self {
            id,
            name: blocker.name(),
            interruptible: blocker.is_interruptible(),
            waited_signals: blocker.waited_signals(),
            outcome: None,
        }
    }
}

/// 一个线程不会同时阻塞在锁和 `Blocker` 上
pub(crate) struct BlockState {
    pub(crate) blocking_lock: Option<usize>,
    pub(crate) lock_requested_count: u32,
    pub(crate) blocker: Option<ActiveBlocker>,
}

impl BlockState {
    pub(crate) const fn new() -> Self {
        Self {
            blocking_lock: None,
            lock_requested_count: 0,
            blocker: None,
        }
    }
}

impl Thread {
    /// 被 join 或 detach 之后，已经死亡的线程可能变得可以回收
    pub(crate) fn notify_finalizer_if_dying(&self) {
        if self.state() == ThreadState::Dying && self.is_finalizable() {
            self.kernel().scheduler().notify_finalizer();
        }
    }
}
