//! Receive buffer shared between the read loop (single producer) and any number of
//! logical consumers waiting for a substring to show up.

use crate::error::AppError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::debug;

struct Waiter {
    id: u64,
    pattern: String,
    tx: oneshot::Sender<Result<(), AppError>>,
}

#[derive(Default)]
struct RxInner {
    text: String,
    waiters: Vec<Waiter>,
}

pub struct RxBuffer {
    inner: StdMutex<RxInner>,
    limit: usize,
    retain: usize,
    next_waiter_id: AtomicU64,
}

impl std::fmt::Debug for RxBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("RxBuffer")
            .field("len", &inner.text.len())
            .field("waiters", &inner.waiters.len())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Removes its waiter from the registry when the awaiting future goes away, whatever the outcome.
struct WaiterGuard<'a> {
    buffer: &'a RxBuffer,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.buffer.remove_waiter(self.id);
    }
}

impl RxBuffer {
    /// `limit` is the hard cap; once exceeded the buffer is cut down to its last `retain` bytes.
    pub fn new(limit: usize, retain: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: StdMutex::new(RxInner::default()),
            limit,
            retain: retain.min(limit),
            next_waiter_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.lock().text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().text.is_empty()
    }

    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn snapshot(&self) -> String {
        self.lock().text.clone()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.lock().text.contains(pattern)
    }

    /// Appends decoded device text, trims the head past the cap, then wakes every waiter whose
    /// pattern now appears anywhere in the buffer, in registration order.
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.text.push_str(text);

        if inner.text.len() > self.limit {
            let mut cut = inner.text.len() - self.retain;
            while !inner.text.is_char_boundary(cut) {
                cut += 1;
            }
            inner.text.drain(..cut);
            debug!(dropped = cut, kept = inner.text.len(), "Receive buffer trimmed");
        }

        let RxInner { text, waiters } = &mut *inner;
        let mut pending = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if text.contains(&waiter.pattern) {
                let _ = waiter.tx.send(Ok(()));
            } else {
                pending.push(waiter);
            }
        }
        *waiters = pending;
    }

    /// Resolves once `pattern` is present in the buffer, or fails with `Timeout` after `wait`.
    /// The waiter never outlives this call.
    pub async fn wait_for(&self, pattern: &str, wait: Duration) -> Result<(), AppError> {
        let (id, rx) = {
            let mut inner = self.lock();
            if inner.text.contains(pattern) {
                return Ok(());
            }
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(Waiter {
                id,
                pattern: pattern.to_string(),
                tx,
            });
            (id, rx)
        };
        let _guard = WaiterGuard { buffer: self, id };

        match timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AppError::Cancelled(pattern.to_string())),
            Err(_) => Err(AppError::Timeout {
                pattern: pattern.to_string(),
                timeout_ms: wait.as_millis() as u64,
            }),
        }
    }

    /// Removes and returns everything up to and including the first `pattern`.
    pub fn consume_through(&self, pattern: &str) -> Option<String> {
        let mut inner = self.lock();
        let idx = inner.text.find(pattern)?;
        let end = idx + pattern.len();
        let head: String = inner.text.drain(..end).collect();
        Some(head)
    }

    /// Clears the buffer and fails every outstanding waiter with `Cancelled`.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.text.clear();
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.tx.send(Err(AppError::Cancelled(waiter.pattern)));
        }
    }

    /// Fails every outstanding waiter with `Aborted`, leaving the buffer contents alone.
    pub fn abort_waiters(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.waiters.len();
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.tx.send(Err(AppError::Aborted(waiter.pattern)));
        }
        count
    }

    fn remove_waiter(&self, id: u64) {
        self.lock().waiters.retain(|w| w.id != id);
    }
}
