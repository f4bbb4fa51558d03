use alloc::sync::Arc;

use defines::error::{errno, KResult};
use defines::misc::TimeSpec;
use defines::signal::SignalActionFlags;
use defines::trap_context::UserRegisters;
use defines::user_ptr::{UserConst, UserMut};
use signal::{KSignalAction, SigProcMaskHow, Signal, SignalAction, SignalSet};

use crate::time::BlockTimeout;
use crate::{BlockResult, Blocker, Thread};

/// 设置当前线程在收到特定信号时的行为
///
/// 参数：
/// - `signum` 指定信号，可以是除了 `SIGKILL` 和 `SIGSTOP` 之外的任意有效信号
/// - `act` 如果非 NULL，则安装 `act` 指向的新操作
/// - `old_act` 如果非 NULL，则将旧操作写入 `old_act` 中
///
/// 错误：
/// - `EFAULT` 如果 `act` 或者 `old_act` 指向非法地址
/// - `EINVAL` 如果 signum 不是除了 `SIGKILL` 和 `SIGSTOP` 之外的有效信号，或者要求 `SA_SIGINFO`
pub fn sys_sigaction(
    current: &Arc<Thread>,
    signum: usize,
    act: UserConst<SignalAction>,
    old_act: UserMut<SignalAction>,
) -> KResult {
    let signal = Signal::parse_user(signum)?;
    if signal.is_unmaskable() {
        return Err(errno::EINVAL);
    }
    let space = Arc::clone(current.process().address_space());
    let new_action = if act.is_null() {
        None
    } else {
        let action = KSignalAction::from(&act.read(&*space)?);
        if action.flags().contains(SignalActionFlags::SA_SIGINFO) {
            warn!("SA_SIGINFO is not supported");
            return Err(errno::EINVAL);
        }
        Some(action)
    };
    if !old_act.is_null() {
        old_act.write(&*space, &SignalAction::from(&current.signal_action(signal)))?;
    }
    if let Some(action) = new_action {
        current.set_signal_action(signal, action)?;
    }
    Ok(0)
}

/// 修改当前线程的信号掩码。`SIGKILL` 和 `SIGSTOP` 总是会被去掉
///
/// 参数：
/// - `how` 见 [`SigProcMaskHow`]
/// - `set` 如果非 NULL，则按 `how` 修改掩码
/// - `old_set` 如果非 NULL，则将旧掩码写入其中
///
/// 错误：
/// - `EINVAL` `how` 不合法
/// - `EFAULT` `set` 或 `old_set` 指向非法地址
pub fn sys_sigprocmask(
    current: &Arc<Thread>,
    how: usize,
    set: UserConst<u32>,
    old_set: UserMut<u32>,
) -> KResult {
    let space = Arc::clone(current.process().address_space());
    let old = if set.is_null() {
        current.signal_mask()
    } else {
        let how = SigProcMaskHow::try_from(how).map_err(|_| errno::EINVAL)?;
        let set = SignalSet::from_bits_truncate(set.read(&*space)?);
        match how {
            SigProcMaskHow::Block => current.signal_mask_block(set, true),
            SigProcMaskHow::Unblock => current.signal_mask_block(set, false),
            SigProcMaskHow::SetMask => current.update_signal_mask(set),
        }
    };
    if !old_set.is_null() {
        old_set.write(&*space, &old.bits())?;
    }
    Ok(0)
}

/// 错误：
/// - `EFAULT` `set` 指向非法地址
pub fn sys_sigpending(current: &Arc<Thread>, set: UserMut<u32>) -> KResult {
    let pending = current.pending_signals();
    set.write(&**current.process().address_space(), &pending.bits())?;
    Ok(0)
}

/// 从信号处理函数返回。恢复进入处理函数前的寄存器与掩码，返回值是被打断时的返回值寄存器
pub fn sys_sigreturn(current: &Arc<Thread>) -> KResult {
    let ret = current.restore_signal_frame()?;
    debug!("{current} returned from signal handler to {:#x}", current.registers().ip());
    Ok(ret as isize)
}

/// 等待 `set` 中的某个信号，并将其从待处理信号中取走。返回信号编号
///
/// 参数：
/// - `info` 如果非 NULL，写入信号编号
/// - `timeout` 如果为 NULL 则一直等待
///
/// 错误：
/// - `EAGAIN` 超时
/// - `EINTR` 被不在 `set` 中的信号或者死亡打断
/// - `EFAULT` 参数指向非法地址
pub fn sys_sigtimedwait(
    current: &Arc<Thread>,
    set: UserConst<u32>,
    info: UserMut<u32>,
    timeout: UserConst<TimeSpec>,
) -> KResult {
    let space = Arc::clone(current.process().address_space());
    let set = SignalSet::from_bits_truncate(set.read(&*space)?).difference(SignalSet::UNMASKABLE);
    let timeout = if timeout.is_null() {
        None
    } else {
        let duration = timeout.read(&*space)?.to_duration().ok_or(errno::EINVAL)?;
        Some(BlockTimeout::Relative(duration))
    };

    let mut blocker = Blocker::signal(set);
    let signal = match current.block(&mut blocker, timeout) {
        BlockResult::NotBlocked | BlockResult::WokeNormally => blocker.delivered_signal().ok_or(errno::EINTR)?,
        BlockResult::InterruptedByTimeout => return Err(errno::EAGAIN),
        BlockResult::InterruptedBySignal(_) | BlockResult::InterruptedByDeath => return Err(errno::EINTR),
    };
    let signum = u32::from(signal.to_user());
    if !info.is_null() {
        info.write(&*space, &signum)?;
    }
    Ok(signum as isize)
}
