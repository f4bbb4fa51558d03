use alloc::sync::{Arc, Weak};

use hashbrown::HashMap;
use klocks::SpinNoIrqMutex;

use super::{Thread, Tid};

/// tid 到线程的映射。只持有弱引用，线程析构时才移除
///
/// 有自己独立的锁，查找不需要调度锁
pub struct ThreadRegistry {
    threads: SpinNoIrqMutex<HashMap<Tid, Weak<Thread>>>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: SpinNoIrqMutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, tid: Tid, thread: Weak<Thread>) {
        let old = self.threads.lock().insert(tid, thread);
        assert!(old.is_none(), "tid {tid} registered twice");
    }

    pub(crate) fn unregister(&self, tid: Tid) {
        let old = self.threads.lock().remove(&tid);
        assert!(old.is_some(), "tid {tid} is not registered");
    }

    /// 线程正在析构时也会返回 `None`
    pub fn get(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.threads.lock().get(&tid)?.upgrade()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Thread>)) {
        // 线程可能在回调之后析构，而析构会获取这把锁
        let threads: alloc::vec::Vec<_> = self.threads.lock().values().cloned().collect();
        for thread in threads.iter().filter_map(Weak::upgrade) {
            f(&thread);
        }
    }
}
