//! Shared random payload for download and calibration responses.
//!
//! One buffer of [`params::BUFFER_SIZE`] cryptographically random bytes is
//! allocated on first use and served, read-only, to every concurrent request
//! as zero-copy slices. Random content keeps compression on the path from
//! skewing measured throughput.
//!
//! The buffer is released after [`params::BUFFER_TIMEOUT`] without download
//! traffic. A single eviction timer is pending at most: each access replaces
//! the previous timer, and a timer that fires does not reschedule itself.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::params;

/// Owner of the payload buffer and its eviction timer.
///
/// Cloning is cheap and every clone manages the same buffer.
#[derive(Debug, Clone)]
pub struct BufferManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    timeout: Duration,
    // Held across the check-then-fill so no reader sees a partial buffer.
    payload: tokio::sync::Mutex<Option<Bytes>>,
    last_access: Mutex<Option<Instant>>,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    /// Manager for a [`params::BUFFER_SIZE`] buffer evicted after [`params::BUFFER_TIMEOUT`].
    pub fn new() -> Self {
        Self::with_limits(params::BUFFER_SIZE, params::BUFFER_TIMEOUT)
    }

    /// Manager with a custom capacity and idle timeout.
    pub fn with_limits(capacity: usize, timeout: Duration) -> Self {
        BufferManager {
            inner: Arc::new(Inner {
                capacity,
                timeout,
                payload: tokio::sync::Mutex::new(None),
                last_access: Mutex::new(None),
                eviction: Mutex::new(None),
            }),
        }
    }

    /// Configured buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Idle time after which the buffer is released.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Return the payload, allocating and filling it first if it is absent or
    /// its length no longer matches the configured capacity.
    ///
    /// Concurrent callers wait for an in-progress fill and all observe the
    /// same buffer. The fill runs on the blocking pool.
    pub async fn ensure(&self) -> Result<Bytes> {
        let mut slot = self.inner.payload.lock().await;
        if let Some(payload) = slot.as_ref().filter(|p| p.len() == self.inner.capacity) {
            return Ok(payload.clone());
        }

        let capacity = self.inner.capacity;
        let payload = tokio::task::spawn_blocking(move || random_payload(capacity)).await?;
        info!(bytes = capacity, "initialized download buffer");
        *slot = Some(payload.clone());
        Ok(payload)
    }

    /// Record a download read at the current instant.
    pub fn touch(&self) {
        *lock(&self.inner.last_access) = Some(Instant::now());
    }

    /// Replace any pending eviction timer with one firing a full timeout from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_eviction(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;

        let mut pending = lock(&self.inner.eviction);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                BufferManager { inner }.evict_if_idle().await;
            }
        }));
    }

    /// Release the buffer if it has not been read for at least the timeout.
    ///
    /// Returns whether a buffer was released. A buffer that was never read
    /// through a download counts as idle.
    pub async fn evict_if_idle(&self) -> bool {
        let mut slot = self.inner.payload.lock().await;
        let Some(payload) = slot.as_ref() else {
            return false;
        };

        let last_access = *lock(&self.inner.last_access);
        let idle = last_access.is_none_or(|at| at.elapsed() >= self.inner.timeout);
        if !idle {
            debug!("download buffer still in use, keeping it");
            return false;
        }

        let bytes = payload.len();
        *slot = None;
        info!(
            bytes,
            idle_secs = self.inner.timeout.as_secs(),
            "cleared download buffer after inactivity"
        );
        true
    }

    /// Cancel any pending eviction timer and release the buffer unconditionally.
    pub async fn shutdown(&self) {
        if let Some(pending) = lock(&self.inner.eviction).take() {
            pending.abort();
        }
        if let Some(payload) = self.inner.payload.lock().await.take() {
            info!(bytes = payload.len(), "unloaded, cleared download buffer");
        }
    }

    /// Whether a buffer is currently held.
    pub async fn is_allocated(&self) -> bool {
        self.inner.payload.lock().await.is_some()
    }

    /// Whether an eviction timer is scheduled and has not yet fired.
    pub fn has_pending_eviction(&self) -> bool {
        lock(&self.inner.eviction)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

fn random_payload(capacity: usize) -> Bytes {
    let mut rng = StdRng::from_os_rng();
    let mut buf = vec![0u8; capacity];
    rng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
