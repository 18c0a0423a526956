//! Call-site resolution and typed invocation.
//!
//! A call site is a statically known foreign callable: owner type, name,
//! signature, and the kind of value it returns. `DispatchCache` resolves each
//! one once per process, keeping the first descriptor when threads race, and
//! invokes it through the primitive call gate, capturing any exception the
//! call leaves pending.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use super::abi::{BridgeValue, Class, ForeignRef, Object, Ref, ValueKind};
use super::env::{CallableId, ForeignEnv};
use super::error::{BridgeError, Result};
use super::exception::{ExceptionHandler, unresolved_symbol};
use super::handle::ScopedHandle;
use super::handle_table::HandleTable;
use super::scope::{CallScope, ThreadContext};
use super::trace::{TRACE_CALLS, TRACE_SCOPES, bridge_trace};

/// A statically known foreign callable.
pub trait CallSite: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Owning type, in source format (`a.b.C`).
    fn owner(self) -> &'static str;

    fn name(self) -> &'static str;

    /// Encoded signature, e.g. `(Ljava/lang/String;)V`.
    fn signature(self) -> Cow<'static, str>;

    fn return_kind(self) -> ValueKind;

    fn is_static(self) -> bool {
        true
    }
}

/// A resolved call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub owner: Ref<Class>,
    pub callable: CallableId,
    pub return_kind: ValueKind,
}

pub struct DispatchCache<C: CallSite> {
    types: Arc<HandleTable>,
    resolved: RwLock<HashMap<C, Descriptor>>,
}

impl<C: CallSite> DispatchCache<C> {
    pub fn new(types: Arc<HandleTable>) -> Self {
        Self {
            types,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// The descriptor for `site`, resolving owner type and callable on first
    /// use.
    pub fn resolve(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        site: C,
    ) -> Result<Descriptor> {
        if let Some(descriptor) = self.resolved.read().get(&site) {
            return Ok(*descriptor);
        }

        tracing::debug!(target: "tscl_bridge", call_site = ?site, "call-site cache miss");
        let owner = self.types.get_or_resolve(ctx, env, site.owner())?;
        let signature = site.signature();
        bridge_trace!(
            ctx.bridge().tracer(),
            TRACE_SCOPES,
            "find callable {}.{}{}",
            site.owner(),
            site.name(),
            signature
        );
        let Some(callable) =
            env.find_callable(owner.raw(), site.name(), &signature, site.is_static())
        else {
            return Err(unresolved_symbol(
                ctx,
                env,
                format!("{}.{}{}", site.owner(), site.name(), signature),
            ));
        };

        let descriptor = Descriptor {
            owner,
            callable,
            return_kind: site.return_kind(),
        };
        Ok(*self.resolved.write().entry(site).or_insert(descriptor))
    }

    pub fn is_resolved(&self, site: C) -> bool {
        self.resolved.read().contains_key(&site)
    }

    pub fn len(&self) -> usize {
        self.resolved.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke `site` and capture any exception it leaves pending.
    /// `receiver` is ignored for static call sites.
    pub fn call(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
    ) -> Result<BridgeValue> {
        self.call_with(scope, site, receiver, args, &ExceptionHandler::default())
    }

    /// `call`, letting `handler` swallow allow-listed exception types.
    pub fn call_with(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
        handler: &ExceptionHandler,
    ) -> Result<BridgeValue> {
        let ctx = scope.context();
        let env = scope.env();
        let descriptor = self.resolve(ctx, env, site)?;
        let receiver = if site.is_static() {
            ForeignRef::null()
        } else {
            receiver.unwrap_or_default()
        };
        bridge_trace!(
            ctx.bridge().tracer(),
            TRACE_CALLS,
            "call {}.{} with {} args",
            site.owner(),
            site.name(),
            args.len()
        );
        let value = env.invoke(descriptor.owner.raw(), descriptor.callable, receiver, args);
        ctx.bridge().exceptions().capture_pending(ctx, env, handler)?;
        Ok(value)
    }

    fn call_expecting(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
        expected: ValueKind,
    ) -> Result<BridgeValue> {
        if site.return_kind() != expected {
            return Err(mismatch(site, expected, site.return_kind()));
        }
        let value = self.call(scope, site, receiver, args)?;
        // A void call may legitimately return anything
        if expected != ValueKind::Void && value.kind() != expected {
            return Err(mismatch(site, expected, value.kind()));
        }
        Ok(value)
    }

    pub fn call_void(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
    ) -> Result<()> {
        self.call_expecting(scope, site, receiver, args, ValueKind::Void)
            .map(|_| ())
    }

    pub fn call_bool(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
    ) -> Result<bool> {
        let value = self.call_expecting(scope, site, receiver, args, ValueKind::Boolean)?;
        Ok(value.as_boolean().unwrap_or_default())
    }

    pub fn call_int(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
    ) -> Result<i32> {
        let value = self.call_expecting(scope, site, receiver, args, ValueKind::Int)?;
        Ok(value.as_int().unwrap_or_default())
    }

    pub fn call_double(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
    ) -> Result<f64> {
        let value = self.call_expecting(scope, site, receiver, args, ValueKind::Double)?;
        Ok(value.as_double().unwrap_or_default())
    }

    /// Object result bound to `scope`; `None` for null.
    pub fn call_object(
        &self,
        scope: &CallScope<'_>,
        site: C,
        receiver: Option<ForeignRef>,
        args: &[BridgeValue],
    ) -> Result<Option<ScopedHandle<Object>>> {
        let value = self.call_expecting(scope, site, receiver, args, ValueKind::Object)?;
        match value.as_ref().and_then(ForeignRef::non_null) {
            Some(raw) => scope.bind(Ref::<Object>::new(raw)).map(Some),
            None => Ok(None),
        }
    }
}

impl<C: CallSite> fmt::Debug for DispatchCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCache")
            .field("resolved", &self.len())
            .finish()
    }
}

fn mismatch<C: CallSite>(site: C, expected: ValueKind, got: ValueKind) -> BridgeError {
    BridgeError::ReturnKindMismatch {
        call_site: site.name(),
        expected,
        got,
    }
}
