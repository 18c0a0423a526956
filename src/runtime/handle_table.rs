//! Process-wide cache of foreign type handles.
//!
//! Entries are durable references keyed by source-format type name and live
//! for the whole process. Lookups take a read lock. Resolution happens with
//! no lock held, so a resolution that re-enters the table (through exception
//! translation, say) cannot deadlock; the first insert wins and a losing
//! thread deletes its own durable reference.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parking_lot::RwLock;

use super::abi::{Class, ForeignRef, Ref, binary_name};
use super::env::ForeignEnv;
use super::error::Result;
use super::exception::unresolved_symbol;
use super::scope::ThreadContext;
use super::trace::{TRACE_REFS, TRACE_SCOPES, Tracer, bridge_trace};

#[derive(Debug)]
pub struct HandleTable {
    entries: RwLock<HashMap<String, ForeignRef>>,
    tracer: Tracer,
}

impl HandleTable {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tracer,
        }
    }

    /// The cached type handle for `name`, resolving it on first use.
    pub fn get_or_resolve(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        name: &str,
    ) -> Result<Ref<Class>> {
        if let Some(cached) = self.get(name) {
            return Ok(cached);
        }

        let binary = binary_name(name);
        tracing::debug!(target: "tscl_bridge", type_name = name, "type cache miss");
        bridge_trace!(self.tracer, TRACE_SCOPES, "find type {}", binary);
        let local = env.find_type(&binary);
        if local.is_null() {
            return Err(unresolved_symbol(ctx, env, name.to_string()));
        }
        let durable = env.new_durable_ref(local);

        let mut entries = self.entries.write();
        match entries.entry(name.to_string()) {
            Entry::Occupied(winner) => {
                // Another thread resolved it first
                env.delete_durable_ref(durable);
                Ok(Ref::new(*winner.get()))
            }
            Entry::Vacant(slot) => {
                bridge_trace!(self.tracer, TRACE_REFS, "new durable {:#x} (type {})", durable, name);
                slot.insert(durable);
                Ok(Ref::new(durable))
            }
        }
    }

    /// The cached handle for `name`, without resolving.
    pub fn get(&self, name: &str) -> Option<Ref<Class>> {
        self.entries.read().get(name).copied().map(Ref::new)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
