//! Cancelable one-shot timers backed by tokio tasks.
//!
//! Owners keep the returned [`TimerId`] next to the entity it guards. A fired
//! callback must check that the entity still holds the same id before acting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

pub type TimerId = u64;

#[derive(Default)]
struct TimerTable {
    next_id: TimerId,
    handles: HashMap<TimerId, AbortHandle>,
}

#[derive(Clone, Default)]
pub struct Timers {
    inner: Arc<Mutex<TimerTable>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, TimerTable> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `fire(id)` after `delay` unless canceled first. Must be called
    /// from inside a tokio runtime.
    pub fn schedule<F, Fut>(&self, delay: Duration, fire: F) -> TimerId
    where
        F: FnOnce(TimerId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut table = self.table();
        table.next_id += 1;
        let id = table.next_id;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.lock().unwrap_or_else(|e| e.into_inner()).handles.remove(&id);
            fire(id).await;
        });
        table.handles.insert(id, task.abort_handle());
        id
    }

    /// Returns false when the timer already fired or never existed.
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.table().handles.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.table().handles.contains_key(&id)
    }

    pub fn pending(&self) -> usize {
        self.table().handles.len()
    }

    /// Abort everything. Called on shutdown.
    pub fn cancel_all(&self) {
        for (_, handle) in self.table().handles.drain() {
            handle.abort();
        }
    }
}
