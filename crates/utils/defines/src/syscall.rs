macro_rules! declare_syscall_id {
    ($($name:tt, $id:literal,)*) => {
        $(pub const $name: usize = $id;)*
        pub fn name(id: usize) -> &'static str {
            match id {
                $($id => stringify!($name),)*
                _ => "UNKNOWN",
            }
        }
    };
}

#[rustfmt::skip]
declare_syscall_id!(
    EXIT,               93,
    NANOSLEEP,          101,
    SCHED_YIELD,        124,
    TKILL,              130,
    RT_SIGACTION,       134,
    RT_SIGPROCMASK,     135,
    RT_SIGPENDING,      136,
    RT_SIGTIMEDWAIT,    137,
    RT_SIGRETURN,       139,
    GETTID,             178,
    // 以下是线程库专用的调用，编号不与 Linux 冲突
    CREATE_THREAD,      1000,
    EXIT_THREAD,        1001,
    DETACH_THREAD,      1002,
    JOIN_THREAD,        1003,
    SET_THREAD_NAME,    1004,
    GET_THREAD_NAME,    1005,
);
