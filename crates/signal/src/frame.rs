//! 信号处理帧的布局。
//!
//! 投递信号时，内核把被打断时的寄存器和旧掩码压到用户栈上，再让线程从 trampoline 开始执行。
//! trampoline 调用处理函数，返回后把栈指针恢复到帧底（即假返回地址处）再发起 `sigreturn`。
//!
//! 从高地址到低地址依次是：flags、返回地址、通用寄存器、旧的栈指针、旧掩码、信号编号、处理函数地址、假返回地址

use bytemuck::Pod;
use defines::{
    config::USER_RED_ZONE,
    error::{errno, KResult},
    trap_context::{RegisterState32, RegisterState64, UserRegisters, USER_MODIFIABLE_FLAGS},
    user_ptr::UserMemory,
};

use crate::{Signal, SignalSet};

/// 在用户栈上逐个压入、弹出值
pub struct UserStackWriter<'a, M: UserMemory + ?Sized> {
    memory: &'a M,
    sp: usize,
}

impl<'a, M: UserMemory + ?Sized> UserStackWriter<'a, M> {
    pub fn new(memory: &'a M, sp: usize) -> Self {
        Self { memory, sp }
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn push<T: Pod>(&mut self, value: T) -> KResult<()> {
        let sp = self
            .sp
            .checked_sub(core::mem::size_of::<T>())
            .ok_or(errno::EFAULT)?;
        self.memory.copy_to_user(sp, bytemuck::bytes_of(&value))?;
        self.sp = sp;
        Ok(())
    }

    pub fn pop<T: Pod>(&mut self) -> KResult<T> {
        let mut value = T::zeroed();
        self.memory
            .copy_from_user(self.sp, bytemuck::bytes_of_mut(&mut value))?;
        self.sp = self
            .sp
            .checked_add(core::mem::size_of::<T>())
            .ok_or(errno::EFAULT)?;
        Ok(value)
    }
}

pub trait SignalFrame: UserRegisters {
    /// 构造信号帧并跳转到 `trampoline`，返回新的栈指针（16 字节对齐）。
    ///
    /// 失败时寄存器保持不变
    fn setup_signal_frame<M: UserMemory + ?Sized>(
        &mut self,
        memory: &M,
        signal: Signal,
        handler: usize,
        old_mask: SignalSet,
        trampoline: usize,
    ) -> KResult<usize>;

    /// `frame_sp` 指向假返回地址。恢复寄存器并返回帧中保存的旧掩码。
    ///
    /// flags 中只有用户可修改的位会被恢复
    fn restore_signal_frame<M: UserMemory + ?Sized>(
        &mut self,
        memory: &M,
        frame_sp: usize,
    ) -> KResult<SignalSet>;
}

impl SignalFrame for RegisterState64 {
    fn setup_signal_frame<M: UserMemory + ?Sized>(
        &mut self,
        memory: &M,
        signal: Signal,
        handler: usize,
        old_mask: SignalSet,
        trampoline: usize,
    ) -> KResult<usize> {
        let old_rsp = self.rsp;
        let stack = self.rsp as usize;
        // 一共压入 22 个 8 字节，正好是 16 的倍数。另外不能碰 red zone
        let alignment = stack % 16;
        let stack = stack
            .checked_sub(USER_RED_ZONE + alignment)
            .ok_or(errno::EFAULT)?;
        let mut stack = UserStackWriter::new(memory, stack);
        for value in [
            self.rflags,
            self.rip,
            self.r15,
            self.r14,
            self.r13,
            self.r12,
            self.r11,
            self.r10,
            self.r9,
            self.r8,
            self.rax,
            self.rcx,
            self.rdx,
            self.rbx,
            old_rsp,
            self.rbp,
            self.rsi,
            self.rdi,
            u64::from(old_mask.bits()),
            u64::from(signal.to_user()),
            handler as u64,
            // 假返回地址
            0,
        ] {
            stack.push(value)?;
        }
        let sp = stack.sp();
        debug_assert_eq!(sp % 16, 0);
        self.rsp = sp as u64;
        self.rip = trampoline as u64;
        Ok(sp)
    }

    fn restore_signal_frame<M: UserMemory + ?Sized>(
        &mut self,
        memory: &M,
        frame_sp: usize,
    ) -> KResult<SignalSet> {
        let mut stack = UserStackWriter::new(memory, frame_sp);
        let _fake_return: u64 = stack.pop()?;
        let _handler: u64 = stack.pop()?;
        let _signal: u64 = stack.pop()?;
        let old_mask = SignalSet::from_bits_truncate(stack.pop::<u64>()? as u32);

        let mut regs = *self;
        regs.rdi = stack.pop()?;
        regs.rsi = stack.pop()?;
        regs.rbp = stack.pop()?;
        regs.rsp = stack.pop()?;
        regs.rbx = stack.pop()?;
        regs.rdx = stack.pop()?;
        regs.rcx = stack.pop()?;
        regs.rax = stack.pop()?;
        regs.r8 = stack.pop()?;
        regs.r9 = stack.pop()?;
        regs.r10 = stack.pop()?;
        regs.r11 = stack.pop()?;
        regs.r12 = stack.pop()?;
        regs.r13 = stack.pop()?;
        regs.r14 = stack.pop()?;
        regs.r15 = stack.pop()?;
        regs.rip = stack.pop()?;
        let rflags: u64 = stack.pop()?;
        regs.rflags = (self.rflags & !USER_MODIFIABLE_FLAGS) | (rflags & USER_MODIFIABLE_FLAGS);
        *self = regs;
        Ok(old_mask)
    }
}

impl SignalFrame for RegisterState32 {
    fn setup_signal_frame<M: UserMemory + ?Sized>(
        &mut self,
        memory: &M,
        signal: Signal,
        handler: usize,
        old_mask: SignalSet,
        trampoline: usize,
    ) -> KResult<usize> {
        let old_esp = self.esp;
        let stack = self.esp as usize;
        // 一共压入 14 个 4 字节，即 56 字节，模 16 余 8
        let alignment = stack.checked_sub(8).ok_or(errno::EFAULT)? % 16;
        let mut stack = UserStackWriter::new(memory, stack - alignment);
        for value in [
            self.eflags,
            self.eip,
            self.eax,
            self.ecx,
            self.edx,
            self.ebx,
            old_esp,
            self.ebp,
            self.esi,
            self.edi,
            old_mask.bits(),
            u32::from(signal.to_user()),
            handler as u32,
            0,
        ] {
            stack.push(value)?;
        }
        let sp = stack.sp();
        debug_assert_eq!(sp % 16, 0);
        self.esp = sp as u32;
        self.eip = trampoline as u32;
        Ok(sp)
    }

    fn restore_signal_frame<M: UserMemory + ?Sized>(
        &mut self,
        memory: &M,
        frame_sp: usize,
    ) -> KResult<SignalSet> {
        let mut stack = UserStackWriter::new(memory, frame_sp);
        let _fake_return: u32 = stack.pop()?;
        let _handler: u32 = stack.pop()?;
        let _signal: u32 = stack.pop()?;
        let old_mask = SignalSet::from_bits_truncate(stack.pop::<u32>()?);

        let mut regs = *self;
        regs.edi = stack.pop()?;
        regs.esi = stack.pop()?;
        regs.ebp = stack.pop()?;
        regs.esp = stack.pop()?;
        regs.ebx = stack.pop()?;
        regs.edx = stack.pop()?;
        regs.ecx = stack.pop()?;
        regs.eax = stack.pop()?;
        regs.eip = stack.pop()?;
        let eflags: u32 = stack.pop()?;
        let modifiable = USER_MODIFIABLE_FLAGS as u32;
        regs.eflags = (self.eflags & !modifiable) | (eflags & modifiable);
        *self = regs;
        Ok(old_mask)
    }
}
