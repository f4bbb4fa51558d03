mod mutex;
mod wait_queue;

pub use mutex::{LockMode, Mutex};
pub use wait_queue::WaitQueue;
