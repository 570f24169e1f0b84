//! Memory admission control for buffered chunks
//!
//! The MemoryBufferManager owns the global byte budget. Downloads reserve their estimated
//! footprint up front and hold the reservation (a [`MemoryLease`]) until the reader has
//! decoded the chunk.
//!
//! # Algorithm
//!
//! - A request that fits and has nobody queued ahead of it is granted immediately
//! - Otherwise it joins a FIFO queue; releases grant from the head of the queue while the
//!   head fits, so a large request is never starved by a stream of small ones
//! - A request larger than the whole budget is granted once nothing else is leased
//! - Cancellation wakes every queued request with [`Error::Cancelled`]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Shared byte budget with FIFO admission
///
/// Cheap to clone; clones share the same budget.
#[derive(Clone)]
pub struct MemoryBufferManager {
    inner: Arc<BudgetInner>,
}

struct BudgetInner {
    limit: u64,
    state: Mutex<BudgetState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct BudgetState {
    leased: u64,
    outstanding: usize,
    peak: u64,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    id: u64,
    bytes: u64,
    grant: oneshot::Sender<MemoryLease>,
}

/// Exclusive reservation of bytes against the budget
///
/// Dropping the lease returns its bytes and wakes queued requests that now fit.
pub struct MemoryLease {
    bytes: u64,
    /// `None` once the bytes were returned by other means
    inner: Option<Arc<BudgetInner>>,
}

impl std::fmt::Debug for MemoryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLease")
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl MemoryLease {
    /// Number of bytes reserved
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut state = inner.lock();
            state.leased = state.leased.saturating_sub(self.bytes);
            state.outstanding = state.outstanding.saturating_sub(1);
            BudgetInner::grant_waiters(&inner, &mut state);
        }
    }
}

impl BudgetInner {
    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        // Critical sections never panic; recover the guard rather than poison the budget
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fits(&self, state: &BudgetState, bytes: u64) -> bool {
        if state.leased.saturating_add(bytes) <= self.limit {
            return true;
        }
        // Escape valve: an oversized request runs alone rather than never
        bytes > self.limit && state.leased == 0
    }

    fn record_grant(&self, state: &mut BudgetState, bytes: u64) {
        if bytes > self.limit {
            tracing::warn!(
                requested = bytes,
                limit = self.limit,
                "Chunk exceeds the whole memory budget, admitting it alone"
            );
        }
        state.leased += bytes;
        state.outstanding += 1;
        state.peak = state.peak.max(state.leased);
    }

    /// Grant queued requests from the head while they fit.
    ///
    /// The lease itself travels through the waiter's channel, so a requester that is
    /// dropped after the grant still returns the bytes when the channel drops it.
    fn grant_waiters(this: &Arc<Self>, state: &mut BudgetState) {
        while let Some(head) = state.waiters.front() {
            if !this.fits(state, head.bytes) {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            this.record_grant(state, waiter.bytes);
            let lease = MemoryLease {
                bytes: waiter.bytes,
                inner: Some(Arc::clone(this)),
            };
            if let Err(mut lease) = waiter.grant.send(lease) {
                // Requester went away; hand the bytes straight back. Disarm the lease
                // first, its drop would lock the state we are holding.
                lease.inner = None;
                state.leased -= waiter.bytes;
                state.outstanding -= 1;
            }
        }
    }
}

impl MemoryBufferManager {
    /// Create a budget of `limit` bytes that is cancelled together with `cancel`
    pub fn new(limit: u64, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                limit,
                state: Mutex::new(BudgetState::default()),
                cancel,
            }),
        }
    }

    /// Reserve `bytes`, waiting until they are available
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the pipeline is cancelled before the grant.
    pub async fn acquire(&self, bytes: u64) -> Result<MemoryLease> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (waiter_id, mut granted) = {
            let mut state = self.inner.lock();
            if state.waiters.is_empty() && self.inner.fits(&state, bytes) {
                self.inner.record_grant(&mut state, bytes);
                return Ok(self.lease(bytes));
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter {
                id,
                bytes,
                grant: tx,
            });
            tracing::debug!(
                requested = bytes,
                leased = state.leased,
                queued = state.waiters.len(),
                "Waiting for memory budget"
            );
            (id, rx)
        };

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => {
                let mut state = self.inner.lock();
                if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
                    state.waiters.remove(pos);
                    // The removed head may have been blocking smaller requests
                    BudgetInner::grant_waiters(&self.inner, &mut state);
                } else {
                    drop(state);
                    // Granted concurrently with cancellation; dropping it gives it back
                    drop(granted.try_recv());
                }
                Err(Error::Cancelled)
            }
            result = &mut granted => result.map_err(|_| Error::Cancelled),
        }
    }

    /// Return a lease to the budget
    ///
    /// Equivalent to dropping it; provided for call sites that want the release explicit.
    pub fn release(&self, lease: MemoryLease) {
        drop(lease);
    }

    /// Wake every queued request with a cancellation failure and refuse new ones
    ///
    /// Outstanding leases stay valid and are returned as their owners drop them.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.lock();
        state.waiters.clear();
    }

    /// Configured budget in bytes
    pub fn limit(&self) -> u64 {
        self.inner.limit
    }

    /// Bytes currently leased
    pub fn leased_bytes(&self) -> u64 {
        self.inner.lock().leased
    }

    /// Number of leases currently held
    pub fn outstanding_leases(&self) -> usize {
        self.inner.lock().outstanding
    }

    /// Highest number of bytes leased at once since creation
    pub fn peak_leased_bytes(&self) -> u64 {
        self.inner.lock().peak
    }

    /// Number of requests waiting for budget
    pub fn queued_requests(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    fn lease(&self, bytes: u64) -> MemoryLease {
        MemoryLease {
            bytes,
            inner: Some(Arc::clone(&self.inner)),
        }
    }
}
