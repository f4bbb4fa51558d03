use alloc::sync::Arc;
use core::mem::size_of;

use compact_str::format_compact;
use defines::config::{MAX_THREAD_NAME_LEN, THREAD_PRIORITY_MAX, THREAD_PRIORITY_MIN};
use defines::error::{errno, KResult};
use defines::misc::{CreateThreadParams, TimeSpec};
use defines::trap_context::{TrapContext, UserRegisters};
use defines::user_ptr::{UserConst, UserMut};
use signal::Signal;

use crate::thread::VerifyLockNotHeld;
use crate::{BlockResult, Blocker, Thread, ThreadState, Tid};

/// 同一进程中 tid 对应的线程，找不到则返回 `ESRCH`
fn thread_in_process(current: &Thread, tid: Tid) -> KResult<Arc<Thread>> {
    Thread::from_tid(current.process().kernel(), tid)
        .filter(|thread| thread.pid() == current.pid())
        .ok_or(errno::ESRCH)
}

/// 在当前进程中创建一个线程，从 `entry` 开始执行。返回新线程的 tid
///
/// 参数：
/// - `entry` 用户态入口
/// - `params` 指向 [`CreateThreadParams`]，给出用户栈、优先级、是否 detach 与入口参数
///
/// 错误：
/// - `EFAULT` 参数无法读取，或者栈顶不在合法的用户栈区域中
/// - `EOVERFLOW` 栈的范围溢出
/// - `EINVAL` 优先级不在允许的范围内
/// - `ENOMEM` 内核栈或线程私有区域分配失败
pub fn sys_create_thread(
    current: &Arc<Thread>,
    entry: usize,
    params: UserConst<CreateThreadParams>,
) -> KResult {
    let process = current.process();
    let space = process.address_space();
    let params = params.read(&**space)?;

    let user_sp = params
        .stack_location
        .checked_add(params.stack_size)
        .and_then(|sp| usize::try_from(sp).ok())
        .ok_or(errno::EOVERFLOW)?;
    let top_slot = user_sp
        .checked_sub(size_of::<usize>())
        .ok_or(errno::EFAULT)?;
    if !space.validate_user_stack(top_slot) {
        return Err(errno::EFAULT);
    }
    let priority = params.schedule_priority;
    if !(THREAD_PRIORITY_MIN..=THREAD_PRIORITY_MAX).contains(&priority) {
        return Err(errno::EINVAL);
    }

    let thread = Thread::try_create(process)?;
    // 在用户调用 set_thread_name 之前，用这个名字区分同一进程的线程
    thread.set_name(format_compact!("{} [{}]", process.name(), thread.tid()));
    thread.copy_signal_state_from(current);
    if params.detach_state != 0 {
        // 新线程一定可以 detach
        let _ = thread.detach();
    }

    let mut regs = TrapContext::app_init_context(entry, user_sp);
    regs.set_entry_args(&params.args.map(|arg| arg as usize));
    thread.set_registers(regs);

    if let Err(e) = thread.make_thread_specific_region() {
        warn!("{thread} failed to make thread-specific region: {e}");
        // 还没有就绪，直接从进程中摘下即可销毁
        process.remove_thread(thread.tid());
        return Err(e);
    }

    let mut guard = process.kernel().scheduler_lock();
    thread.set_priority(priority);
    thread.set_state(&mut guard, ThreadState::Runnable);
    Ok(thread.tid() as isize)
}

/// 退出当前线程。进程的最后一个线程退出时改为退出整个进程
///
/// 参数：
/// - `exit_value` 交给 join 它的线程
/// - `stack_location` 非空时一并释放用户栈，释放失败也照样退出
pub fn sys_exit_thread(
    current: &Arc<Thread>,
    exit_value: usize,
    stack_location: usize,
    stack_size: usize,
) -> KResult {
    let process = current.process();
    if process.thread_count() == 1 {
        return sys_exit(current, 0);
    }
    if stack_location != 0 {
        if let Err(e) = process.address_space().unmap_range(stack_location, stack_size) {
            warn!("Failed to unmap thread stack, terminating thread anyway. Error: {e}");
        }
    }
    let _ = current.exit(exit_value);
    Err(errno::BREAK)
}

/// 错误：
/// - `ESRCH` 本进程中没有该线程
/// - `EINVAL` 线程已经不可 join
pub fn sys_detach_thread(current: &Arc<Thread>, tid: Tid) -> KResult {
    let thread = thread_in_process(current, tid)?;
    if !thread.is_joinable() {
        return Err(errno::EINVAL);
    }
    thread.detach()?;
    Ok(0)
}

/// 等待线程退出，并把它的退出值写入 `exit_value`（非空时）。
///
/// 不能被信号打断，只有死亡才会打断
///
/// 错误：
/// - `ESRCH` 本进程中没有该线程
/// - `EDEADLK` join 自己
/// - `EINVAL` 线程已经被 detach 或者已经有别人 join 了
/// - `EINTR` 当前线程被杀死，或者对方没有正常退出就死了
/// - `EFAULT` 退出值写不回去
pub fn sys_join_thread(current: &Arc<Thread>, tid: Tid, exit_value: UserMut<usize>) -> KResult {
    let thread = thread_in_process(current, tid)?;
    if Arc::ptr_eq(&thread, current) {
        return Err(errno::EDEADLK);
    }

    let value = loop {
        let mut blocker = Blocker::join(Arc::clone(&thread));
        match current.block(&mut blocker, None) {
            BlockResult::NotBlocked | BlockResult::WokeNormally => {
                break blocker.join_result().unwrap_or(Err(errno::EINVAL))?;
            }
            BlockResult::InterruptedByDeath => return Err(errno::EINTR),
            result => debug!("join_thread: retrying after {result:?}"),
        }
    };

    if !exit_value.is_null() {
        exit_value.write(&**current.process().address_space(), &value)?;
    }
    Ok(0)
}

/// 向本进程的线程发送信号。`signum` 为 0 时只检查线程是否存在
///
/// 错误：
/// - `EINVAL` 信号编号不在 `0..32` 中
/// - `ESRCH` 本进程中没有该线程
pub fn sys_kill_thread(current: &Arc<Thread>, tid: Tid, signum: usize) -> KResult {
    let signal = match signum {
        0 => None,
        _ => Some(Signal::parse_user(signum)?),
    };
    let thread = thread_in_process(current, tid)?;
    if let Some(signal) = signal {
        thread.send_signal(signal, Some(current.process()));
    }
    Ok(0)
}

/// 错误：
/// - `EINVAL` 名字超过 [`MAX_THREAD_NAME_LEN`] 字节
/// - `EFAULT` 名字无法读取
/// - `ESRCH` 本进程中没有该线程
pub fn sys_set_thread_name(current: &Arc<Thread>, tid: Tid, name: UserConst<u8>, len: usize) -> KResult {
    if len > MAX_THREAD_NAME_LEN {
        return Err(errno::EINVAL);
    }
    let name = name.read_str(&**current.process().address_space(), len)?;
    let thread = thread_in_process(current, tid)?;
    thread.set_name(name);
    Ok(0)
}

/// 把线程名连同结尾的 `\0` 写入 `buf`
///
/// 错误：
/// - `EINVAL` 缓冲区大小为 0
/// - `ESRCH` 本进程中没有该线程
/// - `ENAMETOOLONG` 缓冲区放不下
/// - `EFAULT` 缓冲区无法写入
pub fn sys_get_thread_name(current: &Arc<Thread>, tid: Tid, buf: UserMut<u8>, size: usize) -> KResult {
    if size == 0 {
        return Err(errno::EINVAL);
    }
    let thread = thread_in_process(current, tid)?;
    let name = thread.name();
    if name.len() + 1 > size {
        return Err(errno::ENAMETOOLONG);
    }
    let mut bytes = alloc::vec::Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    buf.write_bytes(&**current.process().address_space(), &bytes)?;
    Ok(0)
}

/// 永不失败
pub fn sys_gettid(current: &Arc<Thread>) -> KResult {
    Ok(current.tid() as isize)
}

/// 让出处理器，永不失败
pub fn sys_sched_yield(current: &Arc<Thread>) -> KResult {
    current.yield_without_releasing_big_lock(VerifyLockNotHeld::Yes);
    Ok(0)
}

/// 睡眠 `req` 指定的时间。被打断时把剩余时间写入 `rem`（非空时）
///
/// 错误：
/// - `EFAULT` `req` 无法读取或 `rem` 无法写入
/// - `EINVAL` 时间为负或纳秒部分不合法
/// - `EINTR` 被信号或死亡打断
pub fn sys_nanosleep(current: &Arc<Thread>, req: UserConst<TimeSpec>, rem: UserMut<TimeSpec>) -> KResult {
    let space = Arc::clone(current.process().address_space());
    let duration = req.read(&*space)?.to_duration().ok_or(errno::EINVAL)?;
    let clock = current.process().kernel().clock();
    let start = clock.now_ns();
    match current.sleep(duration) {
        BlockResult::InterruptedBySignal(_) | BlockResult::InterruptedByDeath => {
            if !rem.is_null() {
                let slept = core::time::Duration::from_nanos(clock.now_ns().saturating_sub(start));
                rem.write(&*space, &TimeSpec::from(duration.saturating_sub(slept)))?;
            }
            Err(errno::EINTR)
        }
        _ => Ok(0),
    }
}

/// 退出整个进程，当前线程随即死亡
pub fn sys_exit(current: &Arc<Thread>, status: i32) -> KResult {
    current.process().exit(status);
    let _ = current.die_if_needed();
    Err(errno::BREAK)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    use defines::error::errno;
    use defines::misc::{CreateThreadParams, TimeSpec};
    use defines::syscall::*;
    use defines::trap_context::UserRegisters;
    use defines::user_ptr::{UserConst, UserMemory, UserMut};
    use signal::Signal;

    use crate::memory::AddressSpace;
    use crate::sim::{wait_until, Sim};
    use crate::syscall::syscall;
    use crate::{Process, Termination, ThreadState};

    const ENTRY: usize = 0x40_1000;

    /// 在用户地址空间里放好参数，返回参数的地址
    fn write_params(process: &Process, params: CreateThreadParams) -> usize {
        let space = process.address_space();
        let region = space.allocate_region(core::mem::size_of::<CreateThreadParams>(), "params").unwrap();
        UserMut::<CreateThreadParams>::from_raw(region.start)
            .write(&**space, &params)
            .unwrap();
        region.start
    }

    fn stack_params(process: &Process) -> CreateThreadParams {
        let stack = process.address_space().allocate_region(0x4000, "stack").unwrap();
        CreateThreadParams {
            stack_location: stack.start as u64,
            stack_size: 0x4000,
            detach_state: 0,
            schedule_priority: 30,
            args: [7, 8, 9, 10],
        }
    }

    #[test]
    fn create_and_join() {
        let sim = Sim::new();
        let process = sim.process("create");
        let params = stack_params(&process);
        let params_addr = write_params(&process, params);
        let slot = process.address_space().allocate_region(8, "slot").unwrap().start;

        let child_tid = StdArc::new(AtomicUsize::new(0));
        let seen = StdArc::clone(&child_tid);
        sim.machine.register_entry(ENTRY, move |current| {
            let regs = current.registers();
            assert_eq!(regs.rdi, 7);
            assert_eq!(regs.rcx, 10);
            assert_eq!(regs.sp(), (params.stack_location + params.stack_size) as usize);
            assert_eq!(current.priority(), 30);
            assert_eq!(
                current.name(),
                alloc::format!("create [{}]", current.tid()).as_str()
            );
            seen.store(current.tid(), Ordering::SeqCst);
            syscall(current, EXIT_THREAD, [0x55, 0, 0, 0, 0, 0]);
        });

        let joined = StdArc::new(AtomicIsize::new(-1));
        let j = StdArc::clone(&joined);
        let main = sim.spawn(&process, move |current| {
            let tid = syscall(current, CREATE_THREAD, [ENTRY, params_addr, 0, 0, 0, 0]);
            assert!(tid > 0);
            j.store(syscall(current, JOIN_THREAD, [tid as usize, slot, 0, 0, 0, 0]), Ordering::SeqCst);
        });
        sim.wait_for_death(&main);
        assert_eq!(joined.load(Ordering::SeqCst), 0);
        let value = UserConst::<usize>::from_raw(slot)
            .read(&**process.address_space())
            .unwrap();
        assert_eq!(value, 0x55);
        let child = child_tid.load(Ordering::SeqCst);
        assert_ne!(child, 0);
        assert_ne!(child, process.pid());
    }

    #[test]
    fn create_thread_validates_params() {
        let sim = Sim::new();
        let process = sim.process("validate");
        let good = stack_params(&process);
        let overflow = write_params(
            &process,
            CreateThreadParams {
                stack_location: u64::MAX - 4,
                ..good
            },
        );
        let not_stack = write_params(
            &process,
            CreateThreadParams {
                stack_location: 0x5000,
                ..good
            },
        );
        let bad_priority = write_params(
            &process,
            CreateThreadParams {
                schedule_priority: 100,
                ..good
            },
        );
        let results = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let r = StdArc::clone(&results);
        let main = sim.spawn(&process, move |current| {
            let mut results = r.lock().unwrap();
            for params in [0, overflow, not_stack, bad_priority] {
                results.push(syscall(current, CREATE_THREAD, [ENTRY, params, 0, 0, 0, 0]));
            }
        });
        sim.wait_for_death(&main);
        assert_eq!(
            *results.lock().unwrap(),
            [
                errno::EFAULT.as_isize(),
                errno::EOVERFLOW.as_isize(),
                errno::EFAULT.as_isize(),
                errno::EINVAL.as_isize(),
            ]
        );
        assert_eq!(process.thread_count(), 1);
    }

    #[test]
    fn detached_thread_cannot_be_joined() {
        let sim = Sim::new();
        let process = sim.process("detached");
        let params = write_params(
            &process,
            CreateThreadParams {
                detach_state: 1,
                ..stack_params(&process)
            },
        );
        sim.machine.register_entry(ENTRY, |current| {
            std::thread::sleep(Duration::from_millis(10));
            syscall(current, EXIT_THREAD, [0; 6]);
        });
        let results = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let r = StdArc::clone(&results);
        let main = sim.spawn(&process, move |current| {
            let mut results = r.lock().unwrap();
            let tid = syscall(current, CREATE_THREAD, [ENTRY, params, 0, 0, 0, 0]) as usize;
            let thread = crate::Thread::from_tid(current.process().kernel(), tid).unwrap();
            results.push(syscall(current, JOIN_THREAD, [tid, 0, 0, 0, 0, 0]));
            results.push(syscall(current, DETACH_THREAD, [tid, 0, 0, 0, 0, 0]));
            results.push(syscall(current, JOIN_THREAD, [current.tid(), 0, 0, 0, 0, 0]));
            results.push(syscall(current, DETACH_THREAD, [usize::MAX, 0, 0, 0, 0, 0]));
            wait_until(|| thread.state() == ThreadState::Dead);
        });
        sim.wait_for_death(&main);
        assert_eq!(
            *results.lock().unwrap(),
            [
                errno::EINVAL.as_isize(),
                errno::EINVAL.as_isize(),
                errno::EDEADLK.as_isize(),
                errno::ESRCH.as_isize(),
            ]
        );
    }

    #[test]
    fn thread_name_round_trip() {
        let sim = Sim::new();
        let process = sim.process("names");
        let other = sim.process("other");
        let stranger = crate::Thread::try_create(&other).unwrap();
        let space = StdArc::clone(process.address_space());
        let buf = space.allocate_region(128, "buf").unwrap().start;
        space.copy_to_user(buf, b"worker").unwrap();

        let results = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let r = StdArc::clone(&results);
        let stranger_tid = stranger.tid();
        let main = sim.spawn(&process, move |current| {
            let tid = current.tid();
            let mut results = r.lock().unwrap();
            results.push(syscall(current, SET_THREAD_NAME, [tid, buf, 6, 0, 0, 0]));
            results.push(syscall(current, SET_THREAD_NAME, [tid, buf, 65, 0, 0, 0]));
            results.push(syscall(current, SET_THREAD_NAME, [tid, 0x10, 6, 0, 0, 0]));
            results.push(syscall(current, SET_THREAD_NAME, [stranger_tid, buf, 6, 0, 0, 0]));
            results.push(syscall(current, GET_THREAD_NAME, [tid, buf + 64, 0, 0, 0, 0]));
            results.push(syscall(current, GET_THREAD_NAME, [tid, buf + 64, 6, 0, 0, 0]));
            results.push(syscall(current, GET_THREAD_NAME, [tid, buf + 64, 7, 0, 0, 0]));
        });
        sim.wait_for_death(&main);
        assert_eq!(
            *results.lock().unwrap(),
            [
                0,
                errno::EINVAL.as_isize(),
                errno::EFAULT.as_isize(),
                errno::ESRCH.as_isize(),
                errno::EINVAL.as_isize(),
                errno::ENAMETOOLONG.as_isize(),
                0,
            ]
        );
        let mut name = [0xffu8; 7];
        space.copy_from_user(buf + 64, &mut name).unwrap();
        assert_eq!(&name, b"worker\0");
        assert_eq!(stranger.name(), "other");
    }

    #[test]
    fn kill_thread_checks_arguments() {
        let sim = Sim::new();
        let process = sim.process("kill");
        let results = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let r = StdArc::clone(&results);
        let main = sim.spawn(&process, move |current| {
            let tid = current.tid();
            let mut results = r.lock().unwrap();
            current.signal_mask_block(Signal::SIGUSR1.into(), true);
            results.push(syscall(current, TKILL, [tid, 0, 0, 0, 0, 0]));
            results.push(syscall(current, TKILL, [tid, 32, 0, 0, 0, 0]));
            results.push(syscall(current, TKILL, [tid + 1000, 10, 0, 0, 0, 0]));
            results.push(syscall(current, TKILL, [tid, 10, 0, 0, 0, 0]));
            assert!(current.pending_signals().has(Signal::SIGUSR1));
        });
        sim.wait_for_death(&main);
        assert_eq!(
            *results.lock().unwrap(),
            [0, errno::EINVAL.as_isize(), errno::ESRCH.as_isize(), 0]
        );
    }

    #[test]
    fn nanosleep_interrupted_by_signal() {
        let sim = Sim::new();
        let process = sim.process("nap");
        let space = StdArc::clone(process.address_space());
        let req = space.allocate_region(32, "timespec").unwrap().start;
        let rem = req + 16;
        UserMut::<TimeSpec>::from_raw(req)
            .write(&*space, &TimeSpec { sec: 30, nsec: 0 })
            .unwrap();
        let ret = StdArc::new(AtomicIsize::new(0));
        let r = StdArc::clone(&ret);
        let thread = sim.spawn(&process, move |current| {
            r.store(syscall(current, NANOSLEEP, [req, rem, 0, 0, 0, 0]), Ordering::SeqCst);
        });
        wait_until(|| thread.state() == ThreadState::Blocked);
        thread.send_signal(Signal::SIGUSR2, None);
        sim.wait_for_death(&thread);
        assert_eq!(ret.load(Ordering::SeqCst), errno::EINTR.as_isize());
        let remaining = UserConst::<TimeSpec>::from_raw(rem).read(&*space).unwrap();
        assert!(remaining.sec >= 25 && remaining.sec < 30);
    }

    #[test]
    fn last_thread_exit_ends_process() {
        let sim = Sim::new();
        let process = sim.process("last");
        let thread = sim.spawn(&process, |current| {
            syscall(current, EXIT_THREAD, [0x10, 0, 0, 0, 0, 0]);
        });
        sim.wait_for_death(&thread);
        wait_until(|| process.is_finalized());
        assert_eq!(process.termination(), Some(Termination::Exited(0)));
    }
}
