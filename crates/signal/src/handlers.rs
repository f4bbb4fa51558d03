use defines::{
    config::SIGSET_SIZE,
    error::{errno, KResult},
};

use crate::{KSignalAction, Signal};

/// 没有注册处理函数时信号的默认行为，固定不可配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultHandler {
    Terminate,
    Ignore,
    CoreDump,
    Stop,
    Continue,
}

impl DefaultHandler {
    pub fn new(signal: Signal) -> Self {
        #[allow(clippy::enum_glob_use)]
        use Signal::*;
        match signal {
            SIGABRT | SIGBUS | SIGFPE | SIGILL | SIGQUIT | SIGSEGV | SIGSYS | SIGTRAP | SIGXCPU
            | SIGXFSZ => DefaultHandler::CoreDump,
            SIGCHLD | SIGURG | SIGWINCH => DefaultHandler::Ignore,
            SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultHandler::Stop,
            SIGCONT => DefaultHandler::Continue,
            _ => DefaultHandler::Terminate,
        }
    }
}

/// 由线程持有，创建新线程时拷贝一份
#[derive(Clone)]
pub struct SignalHandlers {
    actions: [KSignalAction; SIGSET_SIZE],
}

impl Default for SignalHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandlers {
    pub const fn new() -> Self {
        const DEFAULT_ACTION: KSignalAction = KSignalAction::new();
        Self {
            actions: [DEFAULT_ACTION; SIGSET_SIZE],
        }
    }

    pub fn action(&self, signal: Signal) -> &KSignalAction {
        &self.actions[signal as usize]
    }

    /// KILL 与 STOP 的行为不可更改
    pub fn set_action(&mut self, signal: Signal, action: KSignalAction) -> KResult<KSignalAction> {
        if signal.is_unmaskable() {
            return Err(errno::EINVAL);
        }
        Ok(core::mem::replace(&mut self.actions[signal as usize], action))
    }

    pub fn should_ignore(&self, signal: Signal) -> bool {
        let action = self.action(signal);
        if action.is_default() {
            return DefaultHandler::new(signal) == DefaultHandler::Ignore;
        }
        action.is_ignore()
    }

    /// 注意 [`crate::SIG_IGN`] 也算注册了处理函数
    pub fn has_handler(&self, signal: Signal) -> bool {
        !self.action(signal).is_default()
    }

    pub fn clear(&mut self) {
        self.actions.fill(KSignalAction::new());
    }
}

#[cfg(test)]
mod tests {
    use defines::signal::SignalActionFlags;

    use super::*;
    use crate::{SignalSet, SIG_IGN};

    #[test]
    fn default_handler_table() {
        assert_eq!(DefaultHandler::new(Signal::SIGKILL), DefaultHandler::Terminate);
        assert_eq!(DefaultHandler::new(Signal::SIGSEGV), DefaultHandler::CoreDump);
        assert_eq!(DefaultHandler::new(Signal::SIGCHLD), DefaultHandler::Ignore);
        assert_eq!(DefaultHandler::new(Signal::SIGTSTP), DefaultHandler::Stop);
        assert_eq!(DefaultHandler::new(Signal::SIGCONT), DefaultHandler::Continue);
        assert_eq!(DefaultHandler::new(Signal::SIGPWR), DefaultHandler::Terminate);
    }

    #[test]
    fn kill_and_stop_cannot_be_overridden() {
        let mut handlers = SignalHandlers::new();
        let ignore = KSignalAction::with_handler(SIG_IGN, SignalSet::empty(), SignalActionFlags::empty());
        assert_eq!(handlers.set_action(Signal::SIGKILL, ignore), Err(errno::EINVAL));
        assert_eq!(handlers.set_action(Signal::SIGSTOP, ignore), Err(errno::EINVAL));
        assert!(!handlers.should_ignore(Signal::SIGKILL));
        assert!(!handlers.has_handler(Signal::SIGSTOP));
    }

    #[test]
    fn ignore_and_handler_dispositions() {
        let mut handlers = SignalHandlers::new();
        assert!(handlers.should_ignore(Signal::SIGWINCH));
        assert!(!handlers.should_ignore(Signal::SIGUSR1));

        let ignore = KSignalAction::with_handler(SIG_IGN, SignalSet::empty(), SignalActionFlags::empty());
        handlers.set_action(Signal::SIGUSR1, ignore).unwrap();
        assert!(handlers.should_ignore(Signal::SIGUSR1));
        assert!(handlers.has_handler(Signal::SIGUSR1));

        let handler = KSignalAction::with_handler(0x40_0000, SignalSet::SIGKILL | SignalSet::SIGUSR2, SignalActionFlags::SA_NODEFER);
        let old = handlers.set_action(Signal::SIGWINCH, handler).unwrap();
        assert!(old.is_default());
        assert!(!handlers.should_ignore(Signal::SIGWINCH));
        // KILL 不会进入处理函数期间的掩码
        assert_eq!(handlers.action(Signal::SIGWINCH).mask(), SignalSet::SIGUSR2);

        handlers.clear();
        assert!(!handlers.has_handler(Signal::SIGUSR1));
        assert!(handlers.should_ignore(Signal::SIGWINCH));
    }
}
