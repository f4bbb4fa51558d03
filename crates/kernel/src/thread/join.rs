use alloc::sync::{Arc, Weak};

use defines::error::{errno, KResult};
use klocks::SpinNoIrqMutex;

use super::{BlockResult, BlockerId, Thread};

pub(super) enum TryJoin {
    Waiting,
    Exited(usize),
    /// 线程没有正常退出就被回收了
    Died,
}

struct JoinState {
    joinable: bool,
    exit_value: Option<usize>,
    finalized: bool,
    waiter: Option<(Weak<Thread>, BlockerId)>,
}

/// 线程的 join 状态。至多一个等待者
pub(super) struct JoinCondition(SpinNoIrqMutex<JoinState>);

impl JoinCondition {
    pub(super) const fn new() -> Self {
        Self(SpinNoIrqMutex::new(JoinState {
            joinable: true,
            exit_value: None,
            finalized: false,
            waiter: None,
        }))
    }

    pub(super) fn is_joinable(&self) -> bool {
        self.0.lock().joinable
    }

    pub(super) fn has_exited(&self) -> bool {
        self.0.lock().exit_value.is_some()
    }

    pub(super) fn exit_value(&self) -> Option<usize> {
        self.0.lock().exit_value
    }

    /// 返回之前是否可 join
    pub(super) fn detach(&self) -> bool {
        core::mem::replace(&mut self.0.lock().joinable, false)
    }

    /// 成功后线程不再可 join
    pub(super) fn try_join(&self, joiner: &Arc<Thread>, id: BlockerId) -> KResult<TryJoin> {
        let mut state = self.0.lock();
        if !state.joinable {
            return Err(errno::EINVAL);
        }
        state.joinable = false;
        if let Some(value) = state.exit_value {
            return Ok(TryJoin::Exited(value));
        }
        if state.finalized {
            return Ok(TryJoin::Died);
        }
        state.waiter = Some((Arc::downgrade(joiner), id));
        Ok(TryJoin::Waiting)
    }

    pub(super) fn remove_waiter(&self, id: BlockerId) {
        let mut state = self.0.lock();
        if state.waiter.as_ref().is_some_and(|(_, waiter)| *waiter == id) {
            state.waiter = None;
        }
    }

    /// 线程正常退出，唤醒等待者
    pub(super) fn thread_did_exit(&self, value: usize) {
        let waiter = {
            let mut state = self.0.lock();
            state.exit_value = Some(value);
            state.waiter.take()
        };
        if let Some((thread, id)) = waiter {
            if let Some(thread) = thread.upgrade() {
                thread.unblock_from_blocker(id, BlockResult::WokeNormally);
            }
        }
    }

    /// 线程被回收。此时还在等待的，说明线程没有正常退出
    pub(super) fn thread_finalizing(&self) -> Option<(Weak<Thread>, BlockerId)> {
        let mut state = self.0.lock();
        state.finalized = true;
        state.waiter.take()
    }
}

impl Thread {
    pub fn is_joinable(&self) -> bool {
        self.join.is_joinable()
    }

    pub fn detach(&self) -> KResult<()> {
        if !self.join.detach() {
            return Err(errno::EINVAL);
        }
        debug!("{self} detached");
        self.notify_finalizer_if_dying();
        Ok(())
    }
}
