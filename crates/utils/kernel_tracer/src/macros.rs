/// 按指定等级输出日志。等级不够时不会求值格式化参数
///
/// ```ignore
/// log!(Level::Info, "{thread} created");
/// ```
#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {{
        let level: $crate::Level = $level;
        if $crate::KERNEL_TRACER.enabled(level) {
            $crate::log_impl(level, ::core::module_path!(), ::core::format_args!($($arg)+));
        }
    }};
}

/// 当前等级下是否会输出，用于跳过代价较高的诊断信息收集
#[macro_export]
macro_rules! log_enabled {
    ($level:expr) => {
        $crate::KERNEL_TRACER.enabled($level)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Error, $($arg)+))
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Warn, $($arg)+))
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Info, $($arg)+))
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Debug, $($arg)+))
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Trace, $($arg)+))
}
