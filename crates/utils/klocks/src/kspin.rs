//! 自旋锁，封装了一下 `spin::mutex::spin`
//!
//! 裁剪了一些不太需要的方法，添加 debug 模式下的死锁检测。
//! [`SpinNoIrqMutex`] 在持锁期间关闭本地中断，可以在中断上下文中使用

use core::{
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use crate::irq::NoIrqGuard;

/// 自旋过久即认为死锁。测试时按真实时间，内核中按自旋次数估算
struct DeadlockDetector {
    #[cfg(test)]
    begin: std::time::Instant,
    #[cfg(all(debug_assertions, not(test)))]
    spins: u64,
}

impl DeadlockDetector {
    #[cfg(all(debug_assertions, not(test)))]
    const SPIN_LIMIT: u64 = 1 << 34;

    #[inline(always)]
    fn new() -> Self {
        Self {
            #[cfg(test)]
            begin: std::time::Instant::now(),
            #[cfg(all(debug_assertions, not(test)))]
            spins: 0,
        }
    }

    #[inline(always)]
    #[track_caller]
    fn check(&mut self) {
        #[cfg(test)]
        if self.begin.elapsed().as_millis() >= 2000 {
            panic!("deadlock detected");
        }
        #[cfg(all(debug_assertions, not(test)))]
        {
            self.spins += 1;
            if self.spins >= Self::SPIN_LIMIT {
                panic!("deadlock detected");
            }
        }
    }
}

pub struct SpinMutex<T: ?Sized> {
    base: spin::mutex::SpinMutex<T>,
}

pub struct SpinMutexGuard<'a, T: ?Sized> {
    inner: spin::mutex::SpinMutexGuard<'a, T>,
    // 自旋锁的 Guard 不应被送到其他线程释放
    _not_send: PhantomData<*const ()>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SpinMutexGuard<'_, T> {}

impl<T> SpinMutex<T> {
    /// Creates a new [`SpinMutex`] wrapping the supplied data.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            base: spin::mutex::SpinMutex::new(data),
        }
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// Locks the [`SpinMutex`] and returns a guard that permits access to the
    /// inner data.
    ///
    /// The returned value may be dereferenced for data access
    /// and the lock will be dropped when the guard falls out of scope.
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let mut detector = DeadlockDetector::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            while self.is_locked() {
                core::hint::spin_loop();
                detector.check();
            }
        }
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This function provides no synchronization guarantees and so its result
    /// should be considered 'out of date' the instant it is called. Do not
    /// use it for synchronization purposes. However, it may be useful as a
    /// heuristic.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.base.is_locked()
    }

    /// Try to lock this [`SpinMutex`], returning a lock guard if successful.
    #[inline(always)]
    fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.base.try_lock().map(|inner| SpinMutexGuard {
            inner,
            _not_send: PhantomData,
        })
    }
}

impl<'a, T: ?Sized> Deref for SpinMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // We know statically that only we are referencing data
        &self.inner
    }
}

impl<'a, T: ?Sized> DerefMut for SpinMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

pub struct SpinNoIrqMutex<T: ?Sized> {
    base: spin::mutex::SpinMutex<T>,
}

pub struct SpinNoIrqMutexGuard<'a, T: ?Sized> {
    // 要控制一下析构顺序，先释放锁再开中断
    spin_guard: ManuallyDrop<spin::mutex::SpinMutexGuard<'a, T>>,
    _no_irq_guard: NoIrqGuard,
}

unsafe impl<T: ?Sized + Send> Send for SpinNoIrqMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinNoIrqMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SpinNoIrqMutexGuard<'_, T> {}

impl<T> SpinNoIrqMutex<T> {
    /// Creates a new [`SpinNoIrqMutex`] wrapping the supplied data.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            base: spin::mutex::SpinMutex::new(data),
        }
    }
}

impl<T: ?Sized> SpinNoIrqMutex<T> {
    /// Locks the [`SpinNoIrqMutex`] and returns a guard that permits access to
    /// the inner data.
    ///
    /// The returned value may be dereferenced for data access
    /// and the lock will be dropped when the guard falls out of scope.
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> SpinNoIrqMutexGuard<'_, T> {
        let mut detector = DeadlockDetector::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            while self.is_locked() {
                core::hint::spin_loop();
                detector.check();
            }
        }
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// Only useful as a heuristic, see [`SpinMutex::is_locked`].
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.base.is_locked()
    }

    /// Try to lock this [`SpinNoIrqMutex`], returning a lock guard if successful.
    #[inline(always)]
    fn try_lock(&self) -> Option<SpinNoIrqMutexGuard<'_, T>> {
        // 先关中断再拿锁，否则持锁期间可能被本核的中断处理程序抢占而死锁
        let _no_irq_guard = NoIrqGuard::new();
        self.base.try_lock().map(|spin_guard| SpinNoIrqMutexGuard {
            spin_guard: ManuallyDrop::new(spin_guard),
            _no_irq_guard,
        })
    }
}

impl<'a, T: ?Sized> Deref for SpinNoIrqMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // We know statically that only we are referencing data
        &self.spin_guard
    }
}

impl<'a, T: ?Sized> DerefMut for SpinNoIrqMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.spin_guard
    }
}

impl<'a, T: ?Sized> Drop for SpinNoIrqMutexGuard<'a, T> {
    fn drop(&mut self) {
        // SAFETY: 只会在这里 drop，而且之后再也不会被用到
        unsafe {
            ManuallyDrop::drop(&mut self.spin_guard);
        }
    }
}
