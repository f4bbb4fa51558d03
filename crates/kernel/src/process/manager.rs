use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use klocks::SpinNoIrqMutex;

use super::{Pid, Process};

/// pid 到进程的弱引用。进程析构时把自己移除
pub struct ProcessRegistry(SpinNoIrqMutex<BTreeMap<Pid, Weak<Process>>>);

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub const fn new() -> Self {
        Self(SpinNoIrqMutex::new(BTreeMap::new()))
    }

    pub(crate) fn add(&self, pid: Pid, process: Weak<Process>) {
        let old = self.0.lock().insert(pid, process);
        assert!(old.is_none(), "pid {pid} registered twice");
    }

    pub(crate) fn remove(&self, pid: Pid) {
        self.0.lock().remove(&pid);
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.0.lock().get(&pid).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
