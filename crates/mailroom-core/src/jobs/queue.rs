use std::collections::VecDeque;
use std::sync::Mutex;

/// In-memory FIFO of `(job_id, user_id)` pairs. Nothing here persists; on
/// restart the [`crate::jobs::JobStatusStore`] re-enqueues whatever was
/// still pending.
#[derive(Debug, Default)]
pub struct JobQueue {
    entries: Mutex<VecDeque<(String, String)>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append; never blocks.
    pub fn enqueue(&self, job_id: impl Into<String>, user_id: impl Into<String>) {
        let mut entries = self.entries.lock().expect("queue lock");
        entries.push_back((job_id.into(), user_id.into()));
    }

    /// Non-blocking pop; `None` when empty.
    pub fn dequeue(&self) -> Option<(String, String)> {
        let mut entries = self.entries.lock().expect("queue lock");
        entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
