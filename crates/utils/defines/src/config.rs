pub const PTR_SIZE: usize = core::mem::size_of::<usize>();
const KB: usize = 1024;

/// 页大小
pub const PAGE_SIZE: usize = 4 * KB;

/// 每个线程的内核栈大小
pub const KERNEL_STACK_SIZE: usize = 64 * KB;

/// 线程名的最大字节数（不含结尾的 `\0`）
pub const MAX_THREAD_NAME_LEN: usize = 64;

/// 用户可请求的线程优先级范围
pub const THREAD_PRIORITY_MIN: i32 = 1;
pub const THREAD_PRIORITY_NORMAL: i32 = 30;
pub const THREAD_PRIORITY_MAX: i32 = 99;

/// 信号机制所需的 bitset 大小
pub const SIGSET_SIZE: usize = 32;
pub const SIGSET_SIZE_BYTES: usize = SIGSET_SIZE / 8;

/// x86_64 的 System V ABI 规定栈指针之下 128 字节是叶函数可以随意使用的
pub const USER_RED_ZONE: usize = 128;

/// 处理器的数量（核心数）
pub const HART_NUM: usize = 8;

/// pid 与 tid 共用一个编号空间，这是其上界
pub const TASK_LIMIT: usize = 32768;
