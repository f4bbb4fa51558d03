//! 线程与信号相关的系统调用。
//!
//! 除了少数不碰进程状态的调用，其余都在持有进程大锁的情况下执行。
//! 阻塞时大锁会被暂时释放

mod signal;
mod thread;

use alloc::sync::Arc;

use defines::error::{errno, KResult};
use defines::misc::{CreateThreadParams, TimeSpec};
use defines::syscall::*;
use defines::user_ptr::{UserConst, UserMut};

use self::signal::*;
use self::thread::*;
use crate::Thread;

/// 分发系统调用，返回值按约定是结果或负的 errno
pub fn syscall(current: &Arc<Thread>, id: usize, args: [usize; 6]) -> isize {
    let name = defines::syscall::name(id);
    // 频繁而且几乎不会出错的调用
    let is_trace = [GETTID, SCHED_YIELD, EXIT, EXIT_THREAD].contains(&id);
    let is_debug = [RT_SIGACTION, RT_SIGPROCMASK, RT_SIGPENDING, RT_SIGRETURN].contains(&id);
    let needs_big_lock = ![GETTID, SCHED_YIELD].contains(&id);

    let big_lock = current.process().big_lock();
    if needs_big_lock {
        big_lock.lock(current);
    }
    let ret = syscall_impl(current, id, args);
    // 退出类的调用在死亡前已经释放了大锁
    if needs_big_lock && big_lock.own_lock(current) {
        big_lock.unlock(current);
    }

    match ret {
        Ok(ret) => {
            if is_trace {
                trace!("{current} {name} args {args:x?}. return {ret} = {ret:#x}");
            } else if is_debug {
                debug!("{current} {name} args {args:x?}. return {ret} = {ret:#x}");
            } else {
                info!("{current} {name} args {args:x?}. return {ret} = {ret:#x}");
            }
            ret
        }
        Err(err) => {
            if ![errno::BREAK, errno::EAGAIN, errno::EINTR].contains(&err) {
                warn!(
                    "{current} {name} args {args:x?}. return {err:?}, {}",
                    errno::error_info(err.as_isize()),
                );
            }
            err.as_isize()
        }
    }
}

fn syscall_impl(current: &Arc<Thread>, id: usize, args: [usize; 6]) -> KResult {
    match id {
        EXIT => sys_exit(current, args[0] as i32),
        NANOSLEEP => sys_nanosleep(
            current,
            UserConst::<TimeSpec>::from_raw(args[0]),
            UserMut::<TimeSpec>::from_raw(args[1]),
        ),
        SCHED_YIELD => sys_sched_yield(current),
        TKILL => sys_kill_thread(current, args[0], args[1]),
        RT_SIGACTION => sys_sigaction(
            current,
            args[0],
            UserConst::from_raw(args[1]),
            UserMut::from_raw(args[2]),
        ),
        RT_SIGPROCMASK => sys_sigprocmask(
            current,
            args[0],
            UserConst::from_raw(args[1]),
            UserMut::from_raw(args[2]),
        ),
        RT_SIGPENDING => sys_sigpending(current, UserMut::from_raw(args[0])),
        RT_SIGTIMEDWAIT => sys_sigtimedwait(
            current,
            UserConst::from_raw(args[0]),
            UserMut::from_raw(args[1]),
            UserConst::from_raw(args[2]),
        ),
        RT_SIGRETURN => sys_sigreturn(current),
        GETTID => sys_gettid(current),
        CREATE_THREAD => sys_create_thread(
            current,
            args[0],
            UserConst::<CreateThreadParams>::from_raw(args[1]),
        ),
        EXIT_THREAD => sys_exit_thread(current, args[0], args[1], args[2]),
        DETACH_THREAD => sys_detach_thread(current, args[0]),
        JOIN_THREAD => sys_join_thread(current, args[0], UserMut::from_raw(args[1])),
        SET_THREAD_NAME => sys_set_thread_name(current, args[0], UserConst::from_raw(args[1]), args[2]),
        GET_THREAD_NAME => sys_get_thread_name(current, args[0], UserMut::from_raw(args[1]), args[2]),
        _ => {
            error!("Unsupported syscall id: {id}");
            Err(errno::UNSUPPORTED)
        }
    }
}
