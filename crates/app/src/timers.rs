use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};
use toybox_core::{TimerCallback, TimerId, TimerProvider};

/// One-shot timers backed by tokio tasks.
#[derive(Debug)]
pub struct TokioTimers {
    handle: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioTimers {
    /// Must be called from inside a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl TimerProvider for TokioTimers {
    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registry = self.tasks.clone();
        // Held until the handle is stored, so a timer that fires at once
        // cannot remove its entry before it exists.
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            callback();
        });
        tasks.insert(id, task);
        id
    }

    fn clear_timeout(&self, id: TimerId) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(task) = task {
            task.abort();
        }
    }
}
