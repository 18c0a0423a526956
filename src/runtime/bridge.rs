//! Process-wide bridge state.
//!
//! One `Bridge` is shared by every thread that crosses into the foreign heap.
//! Each such thread attaches once and keeps the returned `ThreadContext`.

use std::sync::Arc;

use super::abi::{Ref, RefKind};
use super::config::BridgeConfig;
use super::dispatch::{CallSite, DispatchCache};
use super::env::ForeignEnv;
use super::error::Result;
use super::exception::ExceptionBridge;
use super::frames::{BoundaryPredicate, StackFrame};
use super::handle::ScopedHandle;
use super::handle_table::HandleTable;
use super::reclaim::DurableRegistry;
use super::scope::ThreadContext;
use super::trace::{TraceSink, Tracer};

#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    tracer: Tracer,
    types: Arc<HandleTable>,
    durables: Arc<DurableRegistry>,
    exceptions: ExceptionBridge,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Self::builder().config(config).build()
    }

    /// Bridge configured from the process environment.
    pub fn from_env() -> Arc<Self> {
        Self::new(BridgeConfig::from_env())
    }

    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Per-thread state for the calling thread.
    pub fn attach(self: &Arc<Self>) -> ThreadContext {
        ThreadContext::new(self.clone())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn types(&self) -> &Arc<HandleTable> {
        &self.types
    }

    pub fn durables(&self) -> &Arc<DurableRegistry> {
        &self.durables
    }

    pub fn exceptions(&self) -> &ExceptionBridge {
        &self.exceptions
    }

    /// Promote `reference` to a durable handle.
    pub fn durable<K: RefKind>(
        &self,
        env: &dyn ForeignEnv,
        reference: Ref<K>,
    ) -> Result<ScopedHandle<K>> {
        ScopedHandle::durable(env, &self.durables, reference)
    }

    /// A dispatch cache for `C` sharing this bridge's type table.
    pub fn dispatch<C: CallSite>(&self) -> DispatchCache<C> {
        DispatchCache::new(self.types.clone())
    }
}

#[derive(Default)]
pub struct BridgeBuilder {
    config: BridgeConfig,
    sink: Option<TraceSink>,
    boundary: Option<Arc<BoundaryPredicate>>,
}

impl BridgeBuilder {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Also deliver trace lines and diagnostic dumps to `sink`.
    pub fn trace_sink(mut self, sink: TraceSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the boundary-frame predicate (default: `StackFrame::is_boundary`).
    pub fn boundary(
        mut self,
        predicate: impl Fn(&StackFrame) -> bool + Send + Sync + 'static,
    ) -> Self {
        let predicate: Arc<BoundaryPredicate> = Arc::new(predicate);
        self.boundary = Some(predicate);
        self
    }

    pub fn build(self) -> Arc<Bridge> {
        let mut tracer = Tracer::new(self.config.trace_level);
        if let Some(sink) = self.sink {
            tracer = tracer.with_sink(sink);
        }
        let boundary: Arc<BoundaryPredicate> = match self.boundary {
            Some(predicate) => predicate,
            None => Arc::new(StackFrame::is_boundary),
        };
        let types = Arc::new(HandleTable::new(tracer.clone()));
        let durables = Arc::new(DurableRegistry::new(
            tracer.clone(),
            self.config.check_duplicate_durables,
        ));
        let exceptions = ExceptionBridge::new(
            types.clone(),
            boundary,
            self.config.local_frame_skip,
            self.config.foreign_frame_skip,
            tracer.clone(),
        );
        tracing::debug!(target: "tscl_bridge", config = ?self.config, "bridge created");
        Arc::new(Bridge {
            config: self.config,
            tracer,
            types,
            durables,
            exceptions,
        })
    }
}
