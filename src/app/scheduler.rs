use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::debug;

use crate::app::cancel::CancelToken;
use crate::app::error::AppError;

pub struct GlobalSemaphore {
    limit: usize,
    used: Mutex<usize>,
    cv: Condvar,
}

impl GlobalSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> GlobalPermit {
        let mut used = self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while *used >= self.limit {
            used = self
                .cv
                .wait(used)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *used += 1;
        GlobalPermit {
            semaphore: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut used = self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *used = used.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct GlobalPermit {
    semaphore: Arc<GlobalSemaphore>,
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// A background task with its own cancellation token.
pub struct TaskHandle<T> {
    name: String,
    cancel: CancelToken,
    join: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self, trace_id: &str) -> Result<T, AppError> {
        self.join
            .join()
            .map_err(|_| AppError::system(format!("Task {} panicked", self.name), trace_id))
    }
}

/// Bounds how many adb tasks run at once and, optionally, serialises work
/// against a single device address.
pub struct TaskScheduler {
    global: Arc<GlobalSemaphore>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    serialize_per_address: bool,
}

impl TaskScheduler {
    pub fn new(global_limit: usize, serialize_per_address: bool) -> Self {
        Self {
            global: Arc::new(GlobalSemaphore::new(global_limit)),
            device_locks: Mutex::new(HashMap::new()),
            serialize_per_address,
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.device_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device_lock(&self, address: &str) -> Arc<Mutex<()>> {
        self.locks()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the map entry once no other caller holds or waits on it. Clones
    /// are only taken under the map lock, so the count cannot race upwards.
    fn release_device_lock(&self, address: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(address);
        }
    }

    #[cfg(test)]
    fn tracked_addresses(&self) -> usize {
        self.locks().len()
    }

    /// Runs `work` while holding the per-address lock, when serialisation is enabled.
    pub fn with_address<T>(&self, address: &str, work: impl FnOnce() -> T) -> T {
        if !self.serialize_per_address {
            return work();
        }
        let lock = self.device_lock(address);
        let output = {
            let _guard: MutexGuard<'_, ()> =
                lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            work()
        };
        self.release_device_lock(address, lock);
        output
    }

    /// Spawns `work` on a worker thread once a global permit is free. `work`
    /// receives the task's token and checks it at its own step boundaries.
    pub fn spawn<T, F>(&self, name: &str, trace_id: &str, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let cancel = CancelToken::new();
        let task_cancel = cancel.clone();
        let global = Arc::clone(&self.global);
        let task_name = name.to_string();
        let task_trace = trace_id.to_string();
        let join = std::thread::spawn(move || {
            let _permit = global.acquire();
            debug!(trace_id = %task_trace, task = %task_name, "task started");
            let output = work(task_cancel);
            debug!(trace_id = %task_trace, task = %task_name, "task finished");
            output
        });
        TaskHandle {
            name: name.to_string(),
            cancel,
            join,
        }
    }
}
