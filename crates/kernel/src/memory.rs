//! 内存管理的外部接口：用户地址空间与内核栈

use alloc::sync::Arc;
use core::ops::Range;

use defines::config::KERNEL_STACK_SIZE;
use defines::error::KResult;
use defines::user_ptr::UserMemory;

/// 进程的用户地址空间
pub trait AddressSpace: UserMemory {
    /// 分配一块匿名区域，返回其地址范围
    fn allocate_region(&self, size: usize, name: &str) -> KResult<Range<usize>>;
    fn deallocate_region(&self, range: Range<usize>) -> KResult<()>;
    /// 与 `munmap` 相同的语义
    fn unmap_range(&self, addr: usize, size: usize) -> KResult<()>;
    /// 地址是否落在可以作为用户栈的区域中
    fn validate_user_stack(&self, addr: usize) -> bool;
}

pub trait MemoryManager: Send + Sync {
    fn allocate_kernel_stack(&self, size: usize) -> KResult<Range<usize>>;
    fn free_kernel_stack(&self, range: Range<usize>);
}

/// 线程的内核栈，析构时归还
pub struct KernelStack {
    range: Range<usize>,
    memory: Arc<dyn MemoryManager>,
}

impl KernelStack {
    pub fn new(memory: &Arc<dyn MemoryManager>) -> KResult<Self> {
        let range = memory.allocate_kernel_stack(KERNEL_STACK_SIZE)?;
        Ok(Self {
            range,
            memory: Arc::clone(memory),
        })
    }

    pub fn base(&self) -> usize {
        self.range.start
    }

    /// 栈顶，按 8 字节对齐
    pub fn top(&self) -> usize {
        self.range.end & !7
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        self.memory.free_kernel_stack(self.range.clone());
    }
}
