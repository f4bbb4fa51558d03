use alloc::vec;
use core::mem::size_of;

use defines::error::KResult;
use defines::misc::ThreadSpecificData;
use defines::user_ptr::UserMut;

use super::Thread;

impl Thread {
    /// 为线程建立私有区域：前面是主 TLS 镜像的拷贝，末尾是指向自己的 [`ThreadSpecificData`]。
    ///
    /// 进程没有主 TLS 镜像时什么也不做
    pub fn make_thread_specific_region(&self) -> KResult<()> {
        let Some(master) = self.process.master_tls() else {
            return Ok(());
        };
        let tls_size = master.size.next_multiple_of(master.align.max(1));
        let space = self.process.address_space();
        let range = space.allocate_region(tls_size + size_of::<ThreadSpecificData>(), "Thread-specific")?;
        // 之后任何一步失败都要归还这块区域
        let range = scopeguard::guard(range, |range| {
            if let Err(e) = space.deallocate_region(range) {
                warn!("{self} failed to release thread-specific region: {e}");
            }
        });

        let data = range.start + tls_size;
        if master.size > 0 {
            let mut image = vec![0u8; master.size];
            space.copy_from_user(master.image, &mut image)?;
            space.copy_to_user(data - tls_size, &image)?;
        }
        UserMut::<ThreadSpecificData>::from_raw(data).write(
            &**space,
            &ThreadSpecificData {
                self_ptr: data as u64,
            },
        )?;

        let range = scopeguard::ScopeGuard::into_inner(range);
        trace!("{self} thread-specific region {range:#x?}, data at {data:#x}");
        self.lock_inner_with(|inner| {
            inner.thread_specific_data = data;
            inner.thread_specific_range = Some(range);
        });
        Ok(())
    }

    pub fn thread_specific_data(&self) -> usize {
        self.lock_inner_with(|inner| inner.thread_specific_data)
    }
}
