//! 内核的日志门面。
//!
//! 日志宏只负责过滤与转发，真正的输出由内核在启动时注册的 [`Log`] 实现完成

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod macros;
mod level;
mod record;

pub use level::{Level, LevelFilter, CLOG};
pub use record::Record;

use core::sync::atomic::{AtomicUsize, Ordering};

use klocks::Once;

pub trait Log: Send + Sync {
    fn log_to_console(&self, record: &Record<'_>);
}

pub static KERNEL_TRACER: KernelTracer = KernelTracer {
    logger: Once::new(),
    max_level: AtomicUsize::new(CLOG as usize),
};

pub struct KernelTracer {
    pub logger: Once<&'static dyn Log>,
    max_level: AtomicUsize,
}

impl KernelTracer {
    pub fn max_level(&self) -> LevelFilter {
        LevelFilter::from_usize(self.max_level.load(Ordering::Relaxed))
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.max_level()
    }
}

/// 运行时调整控制台的日志等级，初始值由编译期的 `KERNEL_CLOG` 决定
pub fn set_max_level(level: LevelFilter) {
    KERNEL_TRACER
        .max_level
        .store(level as usize, Ordering::Relaxed);
}

#[inline]
#[doc(hidden)]
pub fn log_impl(level: Level, target: &'static str, args: core::fmt::Arguments<'_>) {
    if !KERNEL_TRACER.enabled(level) {
        return;
    }
    if let Some(logger) = KERNEL_TRACER.logger.get() {
        logger.log_to_console(&Record::new(level, target, args));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    struct Capture;

    impl Log for Capture {
        fn log_to_console(&self, record: &Record<'_>) {
            CAPTURED
                .lock()
                .unwrap()
                .push(format!("{} {} {}", record.level(), record.target(), record.args()));
        }
    }

    #[test]
    fn records_below_max_level_reach_the_logger() {
        KERNEL_TRACER.logger.call_once(|| &Capture);
        set_max_level(LevelFilter::Info);
        info!("thread {} created", 3);
        debug!("filtered out");
        set_max_level(LevelFilter::Off);
        error!("also filtered");

        let captured = CAPTURED.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0], "INFO kernel_tracer::tests thread 3 created");
    }
}
