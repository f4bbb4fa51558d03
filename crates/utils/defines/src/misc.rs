//! 跨越 syscall 边界的结构体

use core::time::Duration;

use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    /// 负数或纳秒部分超过一秒的视为非法
    pub fn to_duration(self) -> Option<Duration> {
        if self.sec < 0 || !(0..1_000_000_000).contains(&self.nsec) {
            return None;
        }
        Some(Duration::new(self.sec as u64, self.nsec as u32))
    }
}

impl From<Duration> for TimeSpec {
    fn from(value: Duration) -> Self {
        Self {
            sec: value.as_secs() as i64,
            nsec: i64::from(value.subsec_nanos()),
        }
    }
}

/// 创建线程时用户传入的参数
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct CreateThreadParams {
    /// 用户栈的低地址
    pub stack_location: u64,
    pub stack_size: u64,
    /// 为 0 表示可 join，否则创建后立即 detach
    pub detach_state: u32,
    pub schedule_priority: i32,
    /// 按调用约定传给入口函数的参数
    pub args: [u64; 4],
}

/// 线程私有区域末尾的结构，`self_ptr` 指向自己，供用户态的 TLS 访问使用
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ThreadSpecificData {
    pub self_ptr: u64,
}
