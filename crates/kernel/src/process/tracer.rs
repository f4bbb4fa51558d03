use signal::{Signal, SignalSet};

use super::Pid;

/// 被跟踪进程的跟踪状态。
///
/// 被跟踪时几乎所有信号都会先让线程停下，由跟踪者决定是否真正投递
#[derive(Debug, Clone)]
pub struct ThreadTracer {
    tracer_pid: Pid,
    /// 跟踪者允许投递的信号
    pending: SignalSet,
}

impl ThreadTracer {
    pub fn new(tracer_pid: Pid) -> Self {
        Self {
            tracer_pid,
            pending: SignalSet::empty(),
        }
    }

    pub fn tracer_pid(&self) -> Pid {
        self.tracer_pid
    }

    pub fn has_pending_signal(&self, signal: Signal) -> bool {
        self.pending.has(signal)
    }

    pub fn set_signal(&mut self, signal: Signal) {
        self.pending.insert(signal.into());
    }

    pub fn unset_signal(&mut self, signal: Signal) {
        self.pending.remove(signal.into());
    }
}
