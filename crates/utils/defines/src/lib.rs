#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod misc;
pub mod signal;
pub mod syscall;
pub mod trap_context;
pub mod user_ptr;
