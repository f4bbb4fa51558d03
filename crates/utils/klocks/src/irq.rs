//! 关中断的守卫。
//!
//! 具体怎么关中断由平台在启动时通过 [`register_irq_control`] 注册，
//! 未注册时守卫什么也不做（比如在宿主机上跑测试时）

use core::marker::PhantomData;

use spin::Once;

pub trait IrqControl: Sync {
    /// 关闭本地中断，返回关闭之前中断是否开启
    fn disable(&self) -> bool;
    /// 恢复为 `enabled` 所描述的状态
    fn restore(&self, enabled: bool);
}

static IRQ_CONTROL: Once<&'static dyn IrqControl> = Once::new();

/// 只有第一次注册生效
pub fn register_irq_control(control: &'static dyn IrqControl) {
    IRQ_CONTROL.call_once(|| control);
}

pub struct NoIrqGuard {
    before: bool,
    // 中断状态是本核的，不允许 Guard 被送到别的核上
    _not_send: PhantomData<*const ()>,
}

impl NoIrqGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let before = IRQ_CONTROL.get().map_or(false, |control| control.disable());
        Self {
            before,
            _not_send: PhantomData,
        }
    }
}

impl Drop for NoIrqGuard {
    fn drop(&mut self) {
        if let Some(control) = IRQ_CONTROL.get() {
            control.restore(self.before);
        }
    }
}
