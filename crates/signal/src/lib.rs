//! 参考：<https://man7.org/linux/man-pages/man7/signal.7.html>
//!
//! 每个线程持有自己的 signal action 表、掩码和待处理信号。
//! 创建线程时会继承创建者的 signal action 和掩码，但是待处理信号会置空。
//!
//! 而 `execve` 会将 signal action、掩码和待处理信号全部清空
//!
//! 信号处理的过程：
//!
//! 1. 将该信号从线程的待处理信号集中移除
//! 2. 若有被追踪者，先交给追踪者决定
//! 3. 没有注册处理函数则执行默认行为，否则在用户栈上构造信号帧并跳到 trampoline

#![cfg_attr(not(test), no_std)]

mod action;
mod frame;
mod handlers;
mod receiver;

pub use action::{KSignalAction, SignalAction};
pub use frame::{SignalFrame, UserStackWriter};
pub use handlers::{DefaultHandler, SignalHandlers};
pub use receiver::SignalReceiver;

use bitflags::bitflags;
use defines::error::{errno, KResult};
use num_enum::TryFromPrimitive;

pub use defines::signal::{SIG_DFL, SIG_ERR, SIG_IGN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SigProcMaskHow {
    /// 掩蔽传入的信号集，即新掩码是传入值和旧的并集
    Block = 0,
    /// 取消掩蔽传入的信号集
    Unblock = 1,
    /// 将掩码设置为传入的信号集，即直接赋值
    SetMask = 2,
}

bitflags! {
    /// 只考虑 31 个标准信号，第 `n` 号信号对应第 `n - 1` 位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SignalSet: u32 {
        const SIGHUP    = 1 << (Signal::SIGHUP as u8);
        const SIGINT    = 1 << (Signal::SIGINT as u8);
        const SIGQUIT   = 1 << (Signal::SIGQUIT as u8);
        const SIGILL    = 1 << (Signal::SIGILL as u8);
        const SIGTRAP   = 1 << (Signal::SIGTRAP as u8);
        const SIGABRT   = 1 << (Signal::SIGABRT as u8);
        const SIGBUS    = 1 << (Signal::SIGBUS as u8);
        const SIGFPE    = 1 << (Signal::SIGFPE as u8);
        const SIGKILL   = 1 << (Signal::SIGKILL as u8);
        const SIGUSR1   = 1 << (Signal::SIGUSR1 as u8);
        const SIGSEGV   = 1 << (Signal::SIGSEGV as u8);
        const SIGUSR2   = 1 << (Signal::SIGUSR2 as u8);
        const SIGPIPE   = 1 << (Signal::SIGPIPE as u8);
        const SIGALRM   = 1 << (Signal::SIGALRM as u8);
        const SIGTERM   = 1 << (Signal::SIGTERM as u8);
        const SIGSTKFLT = 1 << (Signal::SIGSTKFLT as u8);
        const SIGCHLD   = 1 << (Signal::SIGCHLD as u8);
        const SIGCONT   = 1 << (Signal::SIGCONT as u8);
        const SIGSTOP   = 1 << (Signal::SIGSTOP as u8);
        const SIGTSTP   = 1 << (Signal::SIGTSTP as u8);
        const SIGTTIN   = 1 << (Signal::SIGTTIN as u8);
        const SIGTTOU   = 1 << (Signal::SIGTTOU as u8);
        const SIGURG    = 1 << (Signal::SIGURG as u8);
        const SIGXCPU   = 1 << (Signal::SIGXCPU as u8);
        const SIGXFSZ   = 1 << (Signal::SIGXFSZ as u8);
        const SIGVTALRM = 1 << (Signal::SIGVTALRM as u8);
        const SIGPROF   = 1 << (Signal::SIGPROF as u8);
        const SIGWINCH  = 1 << (Signal::SIGWINCH as u8);
        const SIGIO     = 1 << (Signal::SIGIO as u8);
        const SIGPWR    = 1 << (Signal::SIGPWR as u8);
        const SIGSYS    = 1 << (Signal::SIGSYS as u8);
    }
}

impl SignalSet {
    /// 任何掩码都屏蔽不了的信号
    pub const UNMASKABLE: Self = Self::SIGKILL.union(Self::SIGSTOP);
    /// 线程停止期间仍然可以投递的信号
    pub const STOP_IMMUNE: Self = Self::SIGCONT.union(Self::SIGKILL).union(Self::SIGTRAP);

    /// 编号最小的信号
    pub fn first_pending(self) -> Option<Signal> {
        if self.is_empty() {
            return None;
        }
        Signal::try_from(self.bits().trailing_zeros() as u8).ok()
    }

    pub fn has(self, signal: Signal) -> bool {
        self.contains(signal.into())
    }
}

impl From<Signal> for SignalSet {
    fn from(value: Signal) -> Self {
        Self::from_bits_retain(1 << (value as u8))
    }
}

/// 注意，和 linux 不同，信号的编号从 0 开始而非从 1
/// 开始。因此在一些系统调用上应当将传入的值减 1，传出的值加 1
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Signal {
    SIGHUP = defines::signal::SIGHUP - 1,
    SIGINT = defines::signal::SIGINT - 1,
    SIGQUIT = defines::signal::SIGQUIT - 1,
    SIGILL = defines::signal::SIGILL - 1,
    SIGTRAP = defines::signal::SIGTRAP - 1,
    SIGABRT = defines::signal::SIGABRT - 1,
    SIGBUS = defines::signal::SIGBUS - 1,
    SIGFPE = defines::signal::SIGFPE - 1,
    SIGKILL = defines::signal::SIGKILL - 1,
    SIGUSR1 = defines::signal::SIGUSR1 - 1,
    SIGSEGV = defines::signal::SIGSEGV - 1,
    SIGUSR2 = defines::signal::SIGUSR2 - 1,
    SIGPIPE = defines::signal::SIGPIPE - 1,
    SIGALRM = defines::signal::SIGALRM - 1,
    SIGTERM = defines::signal::SIGTERM - 1,
    SIGSTKFLT = defines::signal::SIGSTKFLT - 1,
    SIGCHLD = defines::signal::SIGCHLD - 1,
    SIGCONT = defines::signal::SIGCONT - 1,
    SIGSTOP = defines::signal::SIGSTOP - 1,
    SIGTSTP = defines::signal::SIGTSTP - 1,
    SIGTTIN = defines::signal::SIGTTIN - 1,
    SIGTTOU = defines::signal::SIGTTOU - 1,
    SIGURG = defines::signal::SIGURG - 1,
    SIGXCPU = defines::signal::SIGXCPU - 1,
    SIGXFSZ = defines::signal::SIGXFSZ - 1,
    SIGVTALRM = defines::signal::SIGVTALRM - 1,
    SIGPROF = defines::signal::SIGPROF - 1,
    SIGWINCH = defines::signal::SIGWINCH - 1,
    SIGIO = defines::signal::SIGIO - 1,
    SIGPWR = defines::signal::SIGPWR - 1,
    SIGSYS = defines::signal::SIGSYS - 1,
}

impl Signal {
    /// 用户传入的编号，从 1 开始
    pub fn from_user(signum: usize) -> Option<Signal> {
        let index = u8::try_from(signum.checked_sub(1)?).ok()?;
        Signal::try_from(index).ok()
    }

    /// 同 [`Signal::from_user`]，但非法编号返回 `EINVAL`
    pub fn parse_user(signum: usize) -> KResult<Signal> {
        Self::from_user(signum).ok_or(errno::EINVAL)
    }

    pub fn to_user(self) -> u8 {
        self as u8 + 1
    }

    pub fn is_unmaskable(self) -> bool {
        SignalSet::UNMASKABLE.has(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_numbers_round_trip_through_user_numbering() {
        assert_eq!(Signal::from_user(9), Some(Signal::SIGKILL));
        assert_eq!(Signal::SIGKILL.to_user(), 9);
        assert_eq!(Signal::from_user(0), None);
        assert_eq!(Signal::from_user(32), None);
        assert_eq!(Signal::parse_user(300), Err(errno::EINVAL));
    }

    #[test]
    fn signal_set_bit_is_number_minus_one() {
        assert_eq!(SignalSet::from(Signal::SIGHUP).bits(), 1);
        assert_eq!(SignalSet::SIGUSR1.bits(), 1 << 9);
        let set = SignalSet::SIGTERM | SignalSet::SIGUSR2;
        assert_eq!(set.first_pending(), Some(Signal::SIGUSR2));
        assert_eq!(SignalSet::empty().first_pending(), None);
        assert!(Signal::SIGSTOP.is_unmaskable());
        assert!(!Signal::SIGTERM.is_unmaskable());
    }

    #[test]
    fn sigprocmask_how_from_user() {
        assert!(matches!(
            SigProcMaskHow::try_from(1usize),
            Ok(SigProcMaskHow::Unblock)
        ));
        assert!(SigProcMaskHow::try_from(3usize).is_err());
    }
}
