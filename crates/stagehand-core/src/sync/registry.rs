//! Leak-safe resource registry.
//!
//! Every spawned external process, timer task, lock, or file handle is
//! registered here with a cleanup routine. [`ResourceRegistry::release_all`]
//! runs cleanups in reverse-registration order and is invoked from the
//! daemon's shutdown path so nothing outlives the orchestrator.

use std::pin::Pin;
use std::sync::Mutex;

use tracing::{debug, info};

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Handle to a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

struct Entry {
    id: ResourceId,
    label: String,
    cleanup: CleanupFn,
}

/// Registry of live resources with reverse-order cleanup.
#[derive(Default)]
pub struct ResourceRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<Entry>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource with an async cleanup routine.
    ///
    /// The routine runs at most once, either via [`release`](Self::release)
    /// or during [`release_all`](Self::release_all).
    pub fn register<F, Fut>(&self, label: &str, cleanup: F) -> ResourceId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ResourceId(inner.next_id);
        debug!(id = id.0, label, "Resource registered");
        inner.entries.push(Entry {
            id,
            label: label.to_string(),
            cleanup: Box::new(move || Box::pin(cleanup())),
        });
        id
    }

    /// Release a single resource, running its cleanup.
    ///
    /// Returns `false` when the id is unknown (already released).
    pub async fn release(&self, id: ResourceId) -> bool {
        let entry = {
            let mut inner = self.lock();
            inner
                .entries
                .iter()
                .position(|e| e.id == id)
                .map(|pos| inner.entries.remove(pos))
        };

        match entry {
            Some(entry) => {
                debug!(id = entry.id.0, label = %entry.label, "Releasing resource");
                (entry.cleanup)().await;
                true
            }
            None => false,
        }
    }

    /// Release everything in reverse-registration order.
    pub async fn release_all(&self) {
        let entries = {
            let mut inner = self.lock();
            std::mem::take(&mut inner.entries)
        };

        let count = entries.len();
        for entry in entries.into_iter().rev() {
            debug!(id = entry.id.0, label = %entry.label, "Releasing resource (shutdown)");
            (entry.cleanup)().await;
        }
        if count > 0 {
            info!(count, "All registered resources released");
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
