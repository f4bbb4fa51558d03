//! 陷入内核时保存的用户态寄存器。
//!
//! 两种布局分别对应 x86_64 与 i386，内核按目标平台的指针宽度选用其中之一作为 [`TrapContext`]

use bytemuck::{Pod, Zeroable};

/// 用户态刚启动时只开中断（IF）与保留位
pub const INITIAL_FLAGS: u64 = 0x0202;

/// 从用户态恢复 flags 时，只允许修改 CF、PF、AF、ZF、SF、TF、DF、OF
pub const USER_MODIFIABLE_FLAGS: u64 = 0xCD5;

/// 内核访问用户态寄存器的统一接口
pub trait UserRegisters: Clone + Default + Send + 'static {
    fn ip(&self) -> usize;
    fn set_ip(&mut self, ip: usize);
    fn sp(&self) -> usize;
    fn set_sp(&mut self, sp: usize);
    fn flags(&self) -> usize;
    fn set_flags(&mut self, flags: usize);
    /// 系统调用的返回值所在的寄存器
    fn return_value(&self) -> usize;
    /// 按调用约定设置入口函数的参数
    fn set_entry_args(&mut self, args: &[usize; 4]);

    /// 用户线程初始化时的寄存器。
    ///
    /// 从内核返回后，会在指定的 `sp` 上从指定的 `entry` 开始运行
    fn app_init_context(entry: usize, sp: usize) -> Self {
        let mut cx = Self::default();
        cx.set_ip(entry);
        cx.set_sp(sp);
        cx.set_flags(INITIAL_FLAGS as usize);
        cx
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RegisterState64 {
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    /// 用户态的栈指针
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl UserRegisters for RegisterState64 {
    fn ip(&self) -> usize {
        self.rip as usize
    }

    fn set_ip(&mut self, ip: usize) {
        self.rip = ip as u64;
    }

    fn sp(&self) -> usize {
        self.rsp as usize
    }

    fn set_sp(&mut self, sp: usize) {
        self.rsp = sp as u64;
    }

    fn flags(&self) -> usize {
        self.rflags as usize
    }

    fn set_flags(&mut self, flags: usize) {
        self.rflags = flags as u64;
    }

    fn return_value(&self) -> usize {
        self.rax as usize
    }

    fn set_entry_args(&mut self, args: &[usize; 4]) {
        self.rdi = args[0] as u64;
        self.rsi = args[1] as u64;
        self.rdx = args[2] as u64;
        self.rcx = args[3] as u64;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RegisterState32 {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// 用户态的栈指针
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub eflags: u32,
}

impl UserRegisters for RegisterState32 {
    fn ip(&self) -> usize {
        self.eip as usize
    }

    fn set_ip(&mut self, ip: usize) {
        self.eip = ip as u32;
    }

    fn sp(&self) -> usize {
        self.esp as usize
    }

    fn set_sp(&mut self, sp: usize) {
        self.esp = sp as u32;
    }

    fn flags(&self) -> usize {
        self.eflags as usize
    }

    fn set_flags(&mut self, flags: usize) {
        self.eflags = flags as u32;
    }

    fn return_value(&self) -> usize {
        self.eax as usize
    }

    /// i386 的参数在栈上传递，这里只能放进寄存器，由用户态的入口桩自行取用
    fn set_entry_args(&mut self, args: &[usize; 4]) {
        self.eax = args[0] as u32;
        self.edx = args[1] as u32;
        self.ecx = args[2] as u32;
        self.ebx = args[3] as u32;
    }
}

#[cfg(target_pointer_width = "64")]
pub type TrapContext = RegisterState64;
#[cfg(target_pointer_width = "32")]
pub type TrapContext = RegisterState32;

/// `fxsave` 的保存区域
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    pub const fn zeroed() -> Self {
        Self([0; 512])
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::zeroed()
    }
}
