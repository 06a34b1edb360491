use tokio::task::{AbortHandle, JoinHandle};

/// Owns a background task and aborts it when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    handle: AbortHandle,
}

impl TaskGuard {
    pub fn new<T>(task: &JoinHandle<T>) -> Self {
        Self {
            handle: task.abort_handle(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
