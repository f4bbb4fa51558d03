//! 内核访问用户地址空间的接口。
//!
//! 用户地址都可能是非法的，所以每一次拷贝都可能失败并返回 `EFAULT`

use core::marker::PhantomData;

use bytemuck::{Pod, Zeroable};
use compact_str::CompactString;

use crate::error::{errno, KResult};

/// 地址空间负责真正的拷贝
pub trait UserMemory: Send + Sync {
    fn copy_to_user(&self, addr: usize, data: &[u8]) -> KResult<()>;
    fn copy_from_user(&self, addr: usize, buf: &mut [u8]) -> KResult<()>;
}

pub struct UserConst<T: ?Sized> {
    addr: usize,
    _marker: PhantomData<*const T>,
}

impl<T: ?Sized> UserConst<T> {
    pub fn from_raw(addr: usize) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    pub fn as_raw(&self) -> usize {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

unsafe impl<T: ?Sized> Send for UserConst<T> {}

impl<T: Pod> UserConst<T> {
    pub fn read(&self, memory: &(impl UserMemory + ?Sized)) -> KResult<T> {
        if self.is_null() {
            return Err(errno::EFAULT);
        }
        let mut value = T::zeroed();
        memory.copy_from_user(self.addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }
}

impl UserConst<u8> {
    /// 读取 `len` 字节的字符串，非法的 UTF-8 会被替换
    pub fn read_str(&self, memory: &(impl UserMemory + ?Sized), len: usize) -> KResult<CompactString> {
        if self.is_null() {
            return Err(errno::EFAULT);
        }
        let mut buf = alloc::vec![0u8; len];
        memory.copy_from_user(self.addr, &mut buf)?;
        Ok(CompactString::from_utf8_lossy(&buf))
    }
}

pub struct UserMut<T: ?Sized> {
    addr: usize,
    _marker: PhantomData<*mut T>,
}

impl<T: ?Sized> UserMut<T> {
    pub fn from_raw(addr: usize) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> usize {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

unsafe impl<T: ?Sized> Send for UserMut<T> {}

impl<T: Pod> UserMut<T> {
    pub fn write(&self, memory: &(impl UserMemory + ?Sized), value: &T) -> KResult<()> {
        if self.is_null() {
            return Err(errno::EFAULT);
        }
        memory.copy_to_user(self.addr, bytemuck::bytes_of(value))
    }
}

impl UserMut<u8> {
    pub fn write_bytes(&self, memory: &(impl UserMemory + ?Sized), bytes: &[u8]) -> KResult<()> {
        if self.is_null() {
            return Err(errno::EFAULT);
        }
        memory.copy_to_user(self.addr, bytes)
    }
}
