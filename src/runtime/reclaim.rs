//! Durable reference bookkeeping and deferred release.
//!
//! Durable handles whose last local owner disappears cannot release their
//! foreign reference on the spot: the drop may happen on any thread, outside
//! any call scope. Instead a cleanup token is pushed onto a lock-free queue,
//! and the next scope to open on any thread drains it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;

use super::abi::ForeignRef;
use super::env::ForeignEnv;
use super::error::{BridgeError, Result};
use super::trace::{TRACE_REFS, Tracer, bridge_trace};

/// Multi-producer queue of durable references awaiting release.
#[derive(Debug, Default)]
pub struct ReclamationQueue {
    pending: Injector<ForeignRef>,
    enqueued: AtomicUsize,
}

impl ReclamationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, token: ForeignRef) {
        self.pending.push(token);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<ForeignRef> {
        loop {
            match self.pending.steal() {
                Steal::Success(token) => return Some(token),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Tokens pushed since creation.
    pub fn total_enqueued(&self) -> usize {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Pop every pending token and hand it to `release`. Returns how many
    /// tokens `release` accepted.
    pub fn drain(&self, mut release: impl FnMut(ForeignRef) -> bool) -> usize {
        let mut released = 0;
        while let Some(token) = self.pop() {
            if release(token) {
                released += 1;
            }
        }
        released
    }
}

/// The set of live durable references plus their reclamation queue.
///
/// Membership is the single source of truth for "not yet released": a
/// reference is deleted only by whoever removes it from the set, so explicit
/// release and queue drain never both delete it.
#[derive(Debug)]
pub struct DurableRegistry {
    live: Mutex<HashSet<ForeignRef>>,
    queue: ReclamationQueue,
    tracer: Tracer,
    check_duplicates: bool,
}

impl DurableRegistry {
    pub fn new(tracer: Tracer, check_duplicates: bool) -> Self {
        Self {
            live: Mutex::new(HashSet::new()),
            queue: ReclamationQueue::new(),
            tracer,
            check_duplicates,
        }
    }

    /// Create and record a durable reference for `reference`.
    pub(crate) fn register(
        &self,
        env: &dyn ForeignEnv,
        reference: ForeignRef,
        kind: &'static str,
    ) -> Result<ForeignRef> {
        // Held across the scan and the insert so two threads cannot both
        // register the same object.
        let mut live = self.live.lock();
        if self.check_duplicates {
            if let Some(existing) = live
                .iter()
                .copied()
                .find(|existing| env.is_same_object(*existing, reference))
            {
                tracing::error!(target: "tscl_bridge", ?reference, ?existing, "duplicate durable registration");
                return Err(BridgeError::DuplicateDurable(reference));
            }
        }
        let durable = env.new_durable_ref(reference);
        live.insert(durable);
        bridge_trace!(self.tracer, TRACE_REFS, "new durable {:#x} ({}) from {:#x}", durable, kind, reference);
        Ok(durable)
    }

    /// Delete `durable` if it is still registered. Returns whether this call
    /// deleted it.
    pub(crate) fn release(&self, env: &dyn ForeignEnv, durable: ForeignRef) -> bool {
        if !self.live.lock().remove(&durable) {
            return false;
        }
        bridge_trace!(self.tracer, TRACE_REFS, "delete durable {:#x}", durable);
        env.delete_durable_ref(durable);
        true
    }

    pub(crate) fn enqueue(&self, durable: ForeignRef) {
        self.queue.push(durable);
    }

    /// Release everything queued by dropped handles.
    pub fn reclaim(&self, env: &dyn ForeignEnv) -> usize {
        let released = self.queue.drain(|token| self.release(env, token));
        if released > 0 {
            tracing::debug!(target: "tscl_bridge", released, "reclaimed durable references");
        }
        released
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Tokens waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
