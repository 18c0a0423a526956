//! Cross-heap object handles.
//!
//! A `ScopedHandle` is either:
//! - scope-bound: the raw reference as handed out by the foreign heap, linked
//!   into the call scope that created it and invalidated when that scope
//!   closes
//! - durable: promoted to a durable foreign reference, valid until released
//!   explicitly or until the last local clone is dropped, at which point a
//!   cleanup token goes to the reclamation queue
//!
//! Clones share one liveness flag, so invalidation is visible through every
//! clone.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::abi::{ForeignRef, Object, Ref, RefKind};
use super::env::ForeignEnv;
use super::error::{BridgeError, Result};
use super::reclaim::DurableRegistry;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn next_owner() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// Ownership mode of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    ScopeBound,
    Durable,
}

/// Shared state of a scope-bound handle. The owning scope keeps one clone
/// so it can flip `live` when it closes.
#[derive(Debug)]
pub(crate) struct ScopeBoundState {
    reference: ForeignRef,
    live: AtomicBool,
}

impl ScopeBoundState {
    /// Returns whether this call did the invalidation.
    pub(crate) fn invalidate(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

/// Shared state of a durable handle.
pub(crate) struct DurableState {
    reference: ForeignRef,
    live: AtomicBool,
    registry: Arc<DurableRegistry>,
}

impl Drop for DurableState {
    fn drop(&mut self) {
        // Last local owner is gone; the foreign reference is released the
        // next time a scope drains the queue.
        if self.live.load(Ordering::Acquire) {
            self.registry.enqueue(self.reference);
        }
    }
}

impl fmt::Debug for DurableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableState")
            .field("reference", &self.reference)
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug, Clone)]
enum Repr {
    ScopeBound(Arc<ScopeBoundState>),
    Durable(Arc<DurableState>),
}

/// A reference to a foreign object, valid only as long as its ownership mode
/// allows.
pub struct ScopedHandle<K: RefKind = Object> {
    owner: u64,
    repr: Repr,
    _kind: PhantomData<K>,
}

impl<K: RefKind> ScopedHandle<K> {
    /// Wrap a raw reference without promotion. The caller links the returned
    /// state into the creating scope.
    pub(crate) fn scope_bound(reference: Ref<K>) -> (Self, Arc<ScopeBoundState>) {
        let state = Arc::new(ScopeBoundState {
            reference: reference.raw(),
            live: AtomicBool::new(true),
        });
        let handle = Self {
            owner: next_owner(),
            repr: Repr::ScopeBound(state.clone()),
            _kind: PhantomData,
        };
        (handle, state)
    }

    /// Promote `reference` to a durable foreign reference and register it.
    pub(crate) fn durable(
        env: &dyn ForeignEnv,
        registry: &Arc<DurableRegistry>,
        reference: Ref<K>,
    ) -> Result<Self> {
        let durable = registry.register(env, reference.raw(), K::NAME)?;
        Ok(Self {
            owner: next_owner(),
            repr: Repr::Durable(Arc::new(DurableState {
                reference: durable,
                live: AtomicBool::new(true),
                registry: registry.clone(),
            })),
            _kind: PhantomData,
        })
    }

    /// The foreign reference, if the handle is still valid.
    pub fn access(&self) -> Result<Ref<K>> {
        match &self.repr {
            Repr::ScopeBound(state) => {
                if state.live.load(Ordering::Acquire) {
                    Ok(Ref::new(state.reference))
                } else {
                    Err(BridgeError::scope_closed(state.reference))
                }
            }
            Repr::Durable(state) => {
                if state.live.load(Ordering::Acquire) {
                    Ok(Ref::new(state.reference))
                } else {
                    Err(BridgeError::released(state.reference))
                }
            }
        }
    }

    pub fn is_live(&self) -> bool {
        match &self.repr {
            Repr::ScopeBound(state) => state.live.load(Ordering::Acquire),
            Repr::Durable(state) => state.live.load(Ordering::Acquire),
        }
    }

    pub fn ownership(&self) -> Ownership {
        match self.repr {
            Repr::ScopeBound(_) => Ownership::ScopeBound,
            Repr::Durable(_) => Ownership::Durable,
        }
    }

    /// Identity of the local owner. Clones share it.
    pub fn owner_id(&self) -> u64 {
        self.owner
    }

    /// Release a durable handle's foreign reference. Releasing twice, or
    /// releasing a scope-bound handle, does nothing.
    pub fn release(&self, env: &dyn ForeignEnv) {
        if let Repr::Durable(state) = &self.repr
            && state.live.swap(false, Ordering::AcqRel)
        {
            state.registry.release(env, state.reference);
        }
    }

    /// Whether both handles name the same foreign object.
    pub fn same_object<K2: RefKind>(
        &self,
        other: &ScopedHandle<K2>,
        env: &dyn ForeignEnv,
    ) -> Result<bool> {
        let a = self.access()?.raw();
        let b = other.access()?.raw();
        Ok(a == b || env.is_same_object(a, b))
    }

    /// Reinterpret the nominal kind. Liveness is shared with `self`.
    pub fn cast<K2: RefKind>(&self) -> ScopedHandle<K2> {
        ScopedHandle {
            owner: self.owner,
            repr: self.repr.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: RefKind> Clone for ScopedHandle<K> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            repr: self.repr.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: RefKind> fmt::Debug for ScopedHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (reference, live) = match &self.repr {
            Repr::ScopeBound(s) => (s.reference, s.live.load(Ordering::Relaxed)),
            Repr::Durable(s) => (s.reference, s.live.load(Ordering::Relaxed)),
        };
        f.debug_struct("ScopedHandle")
            .field("kind", &K::NAME)
            .field("owner", &self.owner)
            .field("mode", &self.ownership())
            .field("reference", &reference)
            .field("live", &live)
            .finish()
    }
}
