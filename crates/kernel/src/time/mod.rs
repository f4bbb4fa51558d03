mod timer;

pub use timer::TimerQueue;

use core::time::Duration;

/// 单调时钟，单位为纳秒
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// 阻塞的超时时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTimeout {
    /// 从开始阻塞时算起
    Relative(Duration),
    /// 时钟上的绝对时刻，纳秒
    Absolute(u64),
}

impl BlockTimeout {
    pub fn deadline(self, now_ns: u64) -> u64 {
        match self {
            BlockTimeout::Relative(duration) => {
                let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
                now_ns.saturating_add(ns)
            }
            BlockTimeout::Absolute(deadline) => deadline,
        }
    }
}
