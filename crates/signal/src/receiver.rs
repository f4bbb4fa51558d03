use crate::{Signal, SignalSet};

/// 线程的待处理信号与掩码
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalReceiver {
    mask: SignalSet,
    pending: SignalSet,
}

impl SignalReceiver {
    #[inline]
    pub const fn new() -> Self {
        Self {
            mask: SignalSet::empty(),
            pending: SignalSet::empty(),
        }
    }

    /// 继承掩码，但不继承待处理信号
    pub fn inherit(&self) -> Self {
        Self {
            mask: self.mask,
            pending: SignalSet::empty(),
        }
    }

    pub fn mask(&self) -> SignalSet {
        self.mask
    }

    pub fn pending(&self) -> SignalSet {
        self.pending
    }

    pub fn add_pending(&mut self, signal: Signal) {
        self.pending.insert(signal.into());
    }

    pub fn remove_pending(&mut self, signal: Signal) {
        self.pending.remove(signal.into());
    }

    /// 线程停止期间只有 CONT、KILL、TRAP 算作待处理
    pub fn pending_for_state(&self, stopped: bool) -> SignalSet {
        if stopped {
            self.pending & SignalSet::STOP_IMMUNE
        } else {
            self.pending
        }
    }

    /// 可以投递的信号。注意运行时 CONT 和 TRAP 照常受掩码控制
    pub fn deliverable(&self, stopped: bool) -> SignalSet {
        self.pending_for_state(stopped).difference(self.mask)
    }

    /// 返回旧掩码
    pub fn set_mask(&mut self, mask: SignalSet) -> SignalSet {
        core::mem::replace(&mut self.mask, mask.difference(SignalSet::UNMASKABLE))
    }

    /// `block` 为真时加入掩码，否则从掩码中移除。返回旧掩码
    pub fn block(&mut self, set: SignalSet, block: bool) -> SignalSet {
        let old = self.mask;
        if block {
            self.set_mask(old | set);
        } else {
            self.set_mask(old.difference(set));
        }
        old
    }

    pub fn clear(&mut self) {
        self.mask = SignalSet::empty();
        self.pending = SignalSet::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_and_stop_are_never_masked() {
        let mut receiver = SignalReceiver::new();
        receiver.set_mask(SignalSet::all());
        assert!(!receiver.mask().has(Signal::SIGKILL));
        assert!(!receiver.mask().has(Signal::SIGSTOP));
        receiver.add_pending(Signal::SIGSTOP);
        receiver.add_pending(Signal::SIGUSR1);
        assert_eq!(receiver.deliverable(false), SignalSet::SIGSTOP);
    }

    #[test]
    fn stopped_threads_only_see_stop_immune_signals() {
        let mut receiver = SignalReceiver::new();
        receiver.add_pending(Signal::SIGUSR1);
        receiver.add_pending(Signal::SIGCONT);
        assert_eq!(receiver.pending_for_state(true), SignalSet::SIGCONT);
        assert_eq!(receiver.pending_for_state(false), SignalSet::SIGCONT | SignalSet::SIGUSR1);

        // 运行中的线程，CONT 仍可被屏蔽
        receiver.block(SignalSet::SIGCONT, true);
        assert_eq!(receiver.deliverable(false), SignalSet::SIGUSR1);
        assert_eq!(receiver.deliverable(true), SignalSet::empty());
    }

    #[test]
    fn block_adds_and_unblock_removes() {
        let mut receiver = SignalReceiver::new();
        let old = receiver.block(SignalSet::SIGUSR1 | SignalSet::SIGUSR2, true);
        assert_eq!(old, SignalSet::empty());
        let old = receiver.block(SignalSet::SIGUSR1, false);
        assert_eq!(old, SignalSet::SIGUSR1 | SignalSet::SIGUSR2);
        assert_eq!(receiver.mask(), SignalSet::SIGUSR2);

        receiver.add_pending(Signal::SIGUSR2);
        let child = receiver.inherit();
        assert_eq!(child.mask(), SignalSet::SIGUSR2);
        assert!(child.pending().is_empty());
    }
}
