//! Priority-ordered counting semaphore, mutex, and read-write gate.
//!
//! Unlike `tokio::sync::Semaphore`, waiters here carry a priority: permits
//! are handed to the highest-priority waiter first, with arrival order as
//! the stable tie-break so equal-priority waiters cannot starve each other.
//! Permits are RAII: dropping a [`Permit`] returns it to the semaphore (or
//! hands it directly to the next waiter).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::Error;

/// A waiter parked in the semaphore's queue.
struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<()>,
}

struct SemaphoreInner {
    permits: usize,
    capacity: usize,
    next_seq: u64,
    closed: bool,
    /// Sorted by (priority DESC, seq ASC); front is next to be served.
    waiters: VecDeque<Waiter>,
}

impl SemaphoreInner {
    /// Insert a waiter keeping the queue sorted (priority DESC, seq ASC).
    fn enqueue(&mut self, waiter: Waiter) {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.priority < waiter.priority)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, waiter);
    }

    /// Hand a freed permit to the next live waiter, or bank it.
    fn release_one(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            // A send failure means the waiter's acquire future was dropped;
            // move on to the next one.
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        self.permits = (self.permits + 1).min(self.capacity);
    }
}

/// Counting semaphore with a priority-ordered wait queue.
#[derive(Clone)]
pub struct PrioritySemaphore {
    inner: Arc<Mutex<SemaphoreInner>>,
}

/// RAII permit; returns to the semaphore on drop.
pub struct Permit {
    inner: Arc<Mutex<SemaphoreInner>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.release_one();
        }
    }
}

impl PrioritySemaphore {
    /// Create a semaphore with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SemaphoreInner {
                permits: capacity,
                capacity,
                next_seq: 0,
                closed: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire a permit, waiting with the given priority (higher = sooner).
    pub async fn acquire(&self, priority: i32) -> Result<Permit, Error> {
        let rx = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::Closed("semaphore".into()));
            }
            if inner.permits > 0 && inner.waiters.is_empty() {
                inner.permits -= 1;
                return Ok(Permit {
                    inner: Arc::clone(&self.inner),
                });
            }
            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.enqueue(Waiter { priority, seq, tx });
            rx
        };

        rx.await.map_err(|_| Error::Closed("semaphore".into()))?;
        Ok(Permit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Acquire a permit without waiting. Returns `None` when the semaphore
    /// is exhausted, closed, or waiters are already queued (no barging).
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut inner = self.lock();
        if inner.closed || inner.permits == 0 || !inner.waiters.is_empty() {
            return None;
        }
        inner.permits -= 1;
        Some(Permit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of permits immediately available.
    pub fn available_permits(&self) -> usize {
        self.lock().permits
    }

    /// Number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Close the semaphore: pending and future `acquire` calls fail.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.waiters.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SemaphoreInner> {
        // The inner mutex is never held across await points, so poisoning
        // only happens if a holder panicked; propagate the inner state.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Exclusive lock: the 1-capacity case of [`PrioritySemaphore`].
#[derive(Clone)]
pub struct PriorityMutex {
    sem: PrioritySemaphore,
}

impl PriorityMutex {
    pub fn new() -> Self {
        Self {
            sem: PrioritySemaphore::new(1),
        }
    }

    /// Lock with the given priority.
    pub async fn lock(&self, priority: i32) -> Result<Permit, Error> {
        self.sem.acquire(priority).await
    }

    /// Lock without waiting.
    pub fn try_lock(&self) -> Option<Permit> {
        self.sem.try_acquire()
    }
}

impl Default for PriorityMutex {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Read-write gate
// ============================================================================

struct RwInner {
    active_readers: usize,
    writer_active: bool,
    closed: bool,
    waiting_writers: VecDeque<oneshot::Sender<()>>,
    waiting_readers: Vec<oneshot::Sender<()>>,
}

impl RwInner {
    /// Called when the writer or the last reader leaves.
    ///
    /// Writer preference: a queued writer wins over queued readers; when no
    /// writer waits, all queued readers are released en masse.
    fn wake_next(&mut self) {
        while let Some(tx) = self.waiting_writers.pop_front() {
            if tx.send(()).is_ok() {
                self.writer_active = true;
                return;
            }
        }
        for tx in self.waiting_readers.drain(..) {
            if tx.send(()).is_ok() {
                self.active_readers += 1;
            }
        }
    }
}

/// Read-write lock allowing N readers XOR 1 writer, with writer preference.
///
/// Readers that arrive while a writer is active or queued must wait; when
/// the writer exits and no further writer waits, all queued readers are
/// released together.
#[derive(Clone)]
pub struct RwGate {
    inner: Arc<Mutex<RwInner>>,
}

/// RAII read permit.
pub struct ReadPermit {
    inner: Arc<Mutex<RwInner>>,
}

/// RAII write permit.
pub struct WritePermit {
    inner: Arc<Mutex<RwInner>>,
}

impl Drop for ReadPermit {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.active_readers = inner.active_readers.saturating_sub(1);
            if inner.active_readers == 0 && !inner.writer_active {
                inner.wake_next();
            }
        }
    }
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.writer_active = false;
            inner.wake_next();
        }
    }
}

impl RwGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RwInner {
                active_readers: 0,
                writer_active: false,
                closed: false,
                waiting_writers: VecDeque::new(),
                waiting_readers: Vec::new(),
            })),
        }
    }

    /// Acquire shared read access.
    pub async fn read(&self) -> Result<ReadPermit, Error> {
        let rx = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::Closed("rw gate".into()));
            }
            if !inner.writer_active && inner.waiting_writers.is_empty() {
                inner.active_readers += 1;
                return Ok(ReadPermit {
                    inner: Arc::clone(&self.inner),
                });
            }
            let (tx, rx) = oneshot::channel();
            inner.waiting_readers.push(tx);
            rx
        };

        rx.await.map_err(|_| Error::Closed("rw gate".into()))?;
        Ok(ReadPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Acquire exclusive write access.
    pub async fn write(&self) -> Result<WritePermit, Error> {
        let rx = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::Closed("rw gate".into()));
            }
            if !inner.writer_active && inner.active_readers == 0 {
                inner.writer_active = true;
                return Ok(WritePermit {
                    inner: Arc::clone(&self.inner),
                });
            }
            let (tx, rx) = oneshot::channel();
            inner.waiting_writers.push_back(tx);
            rx
        };

        rx.await.map_err(|_| Error::Closed("rw gate".into()))?;
        Ok(WritePermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of currently active readers.
    pub fn readers(&self) -> usize {
        self.lock().active_readers
    }

    /// Whether a writer currently holds the gate.
    pub fn writer_active(&self) -> bool {
        self.lock().writer_active
    }

    /// Close the gate: pending and future `read`/`write` calls fail.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.waiting_writers.clear();
        inner.waiting_readers.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RwInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for RwGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn semaphore_capacity_and_release() {
        let sem = PrioritySemaphore::new(2);
        let p1 = sem.acquire(0).await.unwrap();
        let p2 = sem.acquire(0).await.unwrap();
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.try_acquire().is_none());

        drop(p1);
        assert_eq!(sem.available_permits(), 1);
        drop(p2);
        assert_eq!(sem.available_permits(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_permit() {
        let sem = PrioritySemaphore::new(1);
        let permit = sem.acquire(0).await.unwrap();

        let sem2 = sem.clone();
        let handle = tokio::spawn(async move { sem2.acquire(0).await.map(|_| true) });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sem.waiting(), 1);
        drop(permit);

        let got = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("acquire should complete after release")
            .unwrap();
        assert!(got.unwrap());
    }

    #[tokio::test]
    async fn higher_priority_served_first() {
        let sem = Arc::new(PrioritySemaphore::new(1));
        let permit = sem.acquire(0).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (priority, tag) in [(1, "low"), (5, "high"), (3, "mid")] {
            let sem = Arc::clone(&sem);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _p = sem.acquire(priority).await.unwrap();
                order.lock().unwrap().push(tag);
            }));
            // Deterministic arrival order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(permit);
        for h in handles {
            tokio::time::timeout(Duration::from_secs(1), h)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let sem = Arc::new(PrioritySemaphore::new(1));
        let permit = sem.acquire(0).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in ["first", "second", "third"] {
            let sem = Arc::clone(&sem);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _p = sem.acquire(7).await.unwrap();
                order.lock().unwrap().push(tag);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(permit);
        for h in handles {
            tokio::time::timeout(Duration::from_secs(1), h)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn try_acquire_does_not_barge_past_waiters() {
        let sem = PrioritySemaphore::new(1);
        let permit = sem.acquire(0).await.unwrap();

        let sem2 = sem.clone();
        let handle = tokio::spawn(async move { sem2.acquire(0).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(permit);
        // The freed permit was handed to the waiter, not banked.
        assert!(sem.try_acquire().is_none() || sem.waiting() == 0);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_fails_pending_acquires() {
        let sem = PrioritySemaphore::new(1);
        let _permit = sem.acquire(0).await.unwrap();

        let sem2 = sem.clone();
        let handle = tokio::spawn(async move { sem2.acquire(0).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        sem.close();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(sem.acquire(0).await.is_err());
    }

    #[tokio::test]
    async fn mutex_is_exclusive() {
        let mutex = PriorityMutex::new();
        let guard = mutex.lock(0).await.unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[tokio::test]
    async fn rw_gate_allows_concurrent_readers() {
        let gate = RwGate::new();
        let r1 = gate.read().await.unwrap();
        let r2 = gate.read().await.unwrap();
        assert_eq!(gate.readers(), 2);
        drop((r1, r2));
        assert_eq!(gate.readers(), 0);
    }

    #[tokio::test]
    async fn rw_gate_writer_excludes_readers() {
        let gate = RwGate::new();
        let w = gate.write().await.unwrap();

        let gate2 = gate.clone();
        let reader = tokio::spawn(async move { gate2.read().await.map(|_| true) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.readers(), 0);

        drop(w);
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(got.unwrap());
    }

    #[tokio::test]
    async fn rw_gate_writer_preference() {
        let gate = RwGate::new();
        let r = gate.read().await.unwrap();

        // Queue a writer, then a reader behind it.
        let gate_w = gate.clone();
        let writer = tokio::spawn(async move {
            let _w = gate_w.write().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let gate_r = gate.clone();
        let late_reader = tokio::spawn(async move { gate_r.read().await.map(|_| true) });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Reader arriving while a writer waits must itself wait.
        assert_eq!(gate.readers(), 1);

        drop(r);
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), late_reader)
            .await
            .unwrap()
            .unwrap();
        assert!(got.unwrap());
    }

    #[tokio::test]
    async fn rw_gate_releases_readers_en_masse_after_writer() {
        let gate = RwGate::new();
        let w = gate.write().await.unwrap();

        let mut readers = Vec::new();
        for _ in 0..3 {
            let gate2 = gate.clone();
            readers.push(tokio::spawn(async move { gate2.read().await.map(|_| ()) }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(w);
        for r in readers {
            tokio::time::timeout(Duration::from_secs(1), r)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn rw_gate_close_fails_pending_and_future_acquires() {
        let gate = RwGate::new();
        let w = gate.write().await.unwrap();

        let gate2 = gate.clone();
        let parked = tokio::spawn(async move { gate2.read().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;

        gate.close();
        let result = tokio::time::timeout(Duration::from_secs(1), parked)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());

        drop(w);
        assert!(gate.read().await.is_err());
        assert!(gate.write().await.is_err());
    }
}
