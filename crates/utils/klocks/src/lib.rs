#![cfg_attr(not(test), no_std)]

mod irq;
mod kspin;

pub use irq::{register_irq_control, IrqControl, NoIrqGuard};
pub use kspin::{SpinMutex, SpinMutexGuard, SpinNoIrqMutex, SpinNoIrqMutexGuard};
pub use spin::{Lazy, Once};
