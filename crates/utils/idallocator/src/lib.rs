#![cfg_attr(not(test), no_std)]

use alloc::vec::Vec;

extern crate alloc;

/// 基于回收的分配器，即用 vector 收集释放的 id
#[derive(Clone)]
pub struct RecycleAllocator {
    current: usize,
    /// 可分配的 id 的上界（不含）
    limit: usize,
    recycled: Vec<usize>,
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecycleAllocator {
    /// 默认从 0 开始分配，不设上界
    pub const fn new() -> Self {
        Self::with_range(0, usize::MAX)
    }

    /// 显式决定从哪个数开始分配
    pub const fn begin_with(begin: usize) -> Self {
        Self::with_range(begin, usize::MAX)
    }

    /// 分配的 id 落在 `[begin, limit)` 中
    pub const fn with_range(begin: usize, limit: usize) -> Self {
        RecycleAllocator {
            current: begin,
            limit,
            recycled: Vec::new(),
        }
    }

    /// 优先复用回收的 id。耗尽时返回 `None`
    pub fn alloc(&mut self) -> Option<usize> {
        if let Some(id) = self.recycled.pop() {
            Some(id)
        } else if self.current < self.limit {
            self.current += 1;
            Some(self.current - 1)
        } else {
            None
        }
    }

    /// 重复释放同一个 id 是内核的逻辑错误，直接 panic
    pub fn dealloc(&mut self, id: usize) {
        assert!(id < self.current, "id {id} has never been allocated");
        assert!(!self.recycled.contains(&id), "id {id} has been deallocated!");
        self.recycled.push(id);
    }

    /// 已分配且未释放的 id 数量
    pub fn in_use(&self, begin: usize) -> usize {
        self.current - begin - self.recycled.len()
    }

    /// 释放所使用的内存。一般而言，释放之后不应该再使用
    pub fn release(&mut self) {
        self.recycled = Vec::new();
    }
}
