use bytemuck::{Pod, Zeroable};
use defines::signal::SignalActionFlags;

use crate::{SignalSet, SIG_DFL, SIG_IGN};

/// 跨越 syscall 边界的结构体，仅用于和 Linux 的 `k_sigaction` 一致
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SignalAction {
    /// singal handler 的地址
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    /// 信号处理程序运行期间，额外的掩码
    pub mask: u64,
}

impl From<&KSignalAction> for SignalAction {
    fn from(value: &KSignalAction) -> Self {
        Self {
            handler: value.handler as u64,
            flags: u64::from(value.flags.bits()),
            restorer: value.restorer as u64,
            mask: u64::from(value.mask.bits()),
        }
    }
}

/// 内核中真正存储的 signal action。它无需是 `#[repr(C)]`，而且 mask 只存了实际需要的
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KSignalAction {
    /// singal handler 的地址，也可能是 [`SIG_DFL`] 或 [`SIG_IGN`]
    handler: usize,
    mask: SignalSet,
    flags: SignalActionFlags,
    restorer: usize,
}

impl From<&SignalAction> for KSignalAction {
    fn from(value: &SignalAction) -> Self {
        Self {
            handler: value.handler as usize,
            // KILL 和 STOP 不可屏蔽
            mask: SignalSet::from_bits_truncate(value.mask as u32).difference(SignalSet::UNMASKABLE),
            flags: SignalActionFlags::from_bits_truncate(value.flags as u32),
            restorer: value.restorer as usize,
        }
    }
}

impl Default for KSignalAction {
    fn default() -> Self {
        Self::new()
    }
}

impl KSignalAction {
    pub const fn new() -> Self {
        Self {
            handler: SIG_DFL,
            mask: SignalSet::empty(),
            flags: SignalActionFlags::empty(),
            restorer: 0,
        }
    }

    pub fn with_handler(handler: usize, mask: SignalSet, flags: SignalActionFlags) -> Self {
        Self {
            handler,
            mask: mask.difference(SignalSet::UNMASKABLE),
            flags,
            restorer: 0,
        }
    }

    pub fn handler(&self) -> usize {
        self.handler
    }

    pub fn mask(&self) -> SignalSet {
        self.mask
    }

    pub fn flags(&self) -> SignalActionFlags {
        self.flags
    }

    pub fn restorer(&self) -> usize {
        self.restorer
    }

    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    pub fn is_ignore(&self) -> bool {
        self.handler == SIG_IGN
    }
}
