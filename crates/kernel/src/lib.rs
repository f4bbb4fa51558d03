//! 可抢占 SMP 内核中线程的核心部分：状态机、阻塞协议、信号投递、回收与 tid 注册表。
//!
//! 调度器、处理器、时钟与内存管理等由平台通过 [`Platform`] 注入

#![cfg_attr(not(test), no_std)]
#![allow(elided_lifetimes_in_paths)]

#[macro_use]
extern crate kernel_tracer;
extern crate alloc;

pub mod hart;
pub mod kernel;
pub mod log_impl;
pub mod memory;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod time;

#[cfg(test)]
mod sim;

pub use kernel::{Kernel, Platform};
pub use process::{Pid, Process, Termination};
pub use thread::{BlockResult, Blocker, Thread, ThreadState, Tid};
