use std::sync::{Arc, Mutex};

use crate::{CallbackScheduler, CallbackTask};

/// Scheduler that records tasks instead of delivering them. Clones share the
/// same record, so a test can keep one handle and give another to the service.
#[derive(Clone, Default)]
pub struct RecordingScheduler {
    tasks: Arc<Mutex<Vec<CallbackTask>>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every task scheduled so far, in scheduling order.
    pub fn tasks(&self) -> Vec<CallbackTask> {
        match self.tasks.lock() {
            Ok(tasks) => tasks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CallbackScheduler for RecordingScheduler {
    fn schedule(&self, task: CallbackTask) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }
}
