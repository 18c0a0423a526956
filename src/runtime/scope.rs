//! Per-thread call scopes.
//!
//! Every crossing of the boundary, in either direction, runs inside a
//! `CallScope`. Scopes nest strictly: the stack lives in the thread's
//! `ThreadContext`, only the root scope pushes and pops a foreign reference
//! frame, and closing a scope invalidates every scope-bound handle created in
//! it.
//!
//! The context also keeps a shadow stack of local frames. A scope opened for
//! a call into the foreign heap pushes a boundary frame for its call site; an
//! entry-point scope pushes an ordinary frame. Embedders push their own
//! frames with `ThreadContext::push_frame`. Exception translation reads the
//! shadow stack as the local half of a merged stack trace.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;

use super::abi::{ContextId, ForeignRef, Ref, RefKind};
use super::bridge::Bridge;
use super::env::ForeignEnv;
use super::error::{BridgeError, Result};
use super::exception::LocalException;
use super::frames::{NATIVE_LINE, StackFrame};
use super::handle::{ScopeBoundState, ScopedHandle};
use super::trace::{TRACE_SCOPES, bridge_trace};

/// Line carried by an entry point's shadow frame.
const ENTRY_LINE: i32 = -1;

struct ScopeRecord {
    serial: u64,
    call_site: &'static str,
    handles: Vec<Arc<ScopeBoundState>>,
    /// Shadow stack height before this scope's frame.
    frame_height: usize,
}

#[derive(Default)]
struct ScopeStack {
    /// Root first, leaf last.
    records: Vec<ScopeRecord>,
    root_context: Option<ContextId>,
    next_serial: u64,
    frames: Vec<StackFrame>,
}

impl ScopeStack {
    fn position(&self, serial: u64) -> Option<usize> {
        self.records.iter().rposition(|r| r.serial == serial)
    }
}

/// Bridge state owned by one thread.
pub struct ThreadContext {
    bridge: Arc<Bridge>,
    stack: RefCell<ScopeStack>,
    reporting_failure: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadContext {
    pub(crate) fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            stack: RefCell::new(ScopeStack::default()),
            reporting_failure: Cell::new(false),
            _not_send: PhantomData,
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Open a scope for a call into the foreign heap at `call_site`
    /// (`Type.callable`).
    ///
    /// The root scope pushes a foreign reference frame and binds the thread to
    /// `env`'s context; nested scopes must use the same context. Pending
    /// durable releases are drained once the scope is open.
    pub fn open<'a>(
        &'a self,
        env: &'a dyn ForeignEnv,
        call_site: &'static str,
    ) -> Result<CallScope<'a>> {
        self.open_scope(env, call_site, NATIVE_LINE)
    }

    /// Open a scope for an entry point invoked by foreign code. Its shadow
    /// frame is an ordinary local frame, not a boundary.
    pub fn open_entry<'a>(
        &'a self,
        env: &'a dyn ForeignEnv,
        call_site: &'static str,
    ) -> Result<CallScope<'a>> {
        self.open_scope(env, call_site, ENTRY_LINE)
    }

    fn open_scope<'a>(
        &'a self,
        env: &'a dyn ForeignEnv,
        call_site: &'static str,
        line: i32,
    ) -> Result<CallScope<'a>> {
        let context = env.context_id();
        let (serial, depth) = {
            let mut stack = self.stack.borrow_mut();
            if let Some(root) = stack.root_context
                && root != context
            {
                return Err(BridgeError::MixedContext { root, got: context });
            }
            let depth = stack.records.len();
            if depth == 0 {
                env.push_frame(self.bridge.config().frame_capacity);
                stack.root_context = Some(context);
            }
            let serial = stack.next_serial;
            stack.next_serial += 1;
            let frame_height = stack.frames.len();
            let (type_name, callable) = split_call_site(call_site);
            stack.frames.push(StackFrame::new(type_name, callable, None, line));
            stack.records.push(ScopeRecord {
                serial,
                call_site,
                handles: Vec::new(),
                frame_height,
            });
            (serial, depth)
        };
        bridge_trace!(
            self.bridge.tracer(),
            TRACE_SCOPES,
            "{:indent$}open {} [{:?} depth {}]",
            "",
            call_site,
            context,
            depth,
            indent = depth * 2
        );
        self.bridge.durables().reclaim(env);

        Ok(CallScope {
            ctx: self,
            env,
            serial,
            depth,
            call_site,
            result: Cell::new(ForeignRef::null()),
            closed: Cell::new(false),
        })
    }

    /// Run `body` as an entry point invoked by foreign code.
    ///
    /// Opens a scope, and if `body` fails, raises the failure in the foreign
    /// heap before closing it and returns `default`. The foreign caller sees
    /// a pending exception, never a bridge error.
    pub fn enter<T>(
        &self,
        env: &dyn ForeignEnv,
        call_site: &'static str,
        default: T,
        body: impl FnOnce(&CallScope<'_>) -> Result<T>,
    ) -> T {
        let scope = match self.open_entry(env, call_site) {
            Ok(scope) => scope,
            Err(err) => {
                self.bridge.exceptions().raise(self, env, &err);
                return default;
            }
        };
        let value = match body(&scope) {
            Ok(value) => value,
            Err(err) => {
                self.bridge.exceptions().raise(self, env, &err);
                default
            }
        };
        if let Err(err) = scope.close() {
            self.bridge
                .exceptions()
                .dump(&LocalException::from_error(&err).with_frames(self.local_frames()));
        }
        value
    }

    /// `enter` for entry points returning an object. The result is copied
    /// out of the scope's reference frame; null on failure.
    pub fn enter_object(
        &self,
        env: &dyn ForeignEnv,
        call_site: &'static str,
        body: impl FnOnce(&CallScope<'_>) -> Result<ForeignRef>,
    ) -> ForeignRef {
        let scope = match self.open_entry(env, call_site) {
            Ok(scope) => scope,
            Err(err) => {
                self.bridge.exceptions().raise(self, env, &err);
                return ForeignRef::null();
            }
        };
        match body(&scope) {
            Ok(result) => scope.set_result(result),
            Err(err) => self.bridge.exceptions().raise(self, env, &err),
        }
        if let Err(err) = scope.close() {
            self.bridge
                .exceptions()
                .dump(&LocalException::from_error(&err).with_frames(self.local_frames()));
            return ForeignRef::null();
        }
        scope.take_result()
    }

    /// Number of open scopes on this thread.
    pub fn depth(&self) -> usize {
        self.stack.borrow().records.len()
    }

    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    /// Context the root scope is bound to, if one is open.
    pub fn root_context(&self) -> Option<ContextId> {
        self.stack.borrow().root_context
    }

    /// Call site of the leaf scope.
    pub fn current_call_site(&self) -> Option<&'static str> {
        self.stack.borrow().records.last().map(|r| r.call_site)
    }

    /// Wrap `raw` in a handle bound to the leaf scope.
    pub fn bind<K: RefKind>(&self, raw: Ref<K>) -> Result<ScopedHandle<K>> {
        let mut stack = self.stack.borrow_mut();
        let Some(leaf) = stack.records.last_mut() else {
            return Err(BridgeError::UnbalancedScope(
                "no call scope is open on this thread".to_string(),
            ));
        };
        let (handle, state) = ScopedHandle::scope_bound(raw);
        leaf.handles.push(state);
        Ok(handle)
    }

    /// Wrap `raw` in a handle bound to the root scope, which owns the
    /// reference frame and so outlives every nested scope.
    pub(crate) fn bind_root<K: RefKind>(&self, raw: Ref<K>) -> Result<ScopedHandle<K>> {
        let mut stack = self.stack.borrow_mut();
        let Some(root) = stack.records.first_mut() else {
            return Err(BridgeError::UnbalancedScope(
                "no call scope is open on this thread".to_string(),
            ));
        };
        let (handle, state) = ScopedHandle::scope_bound(raw);
        root.handles.push(state);
        Ok(handle)
    }

    // =========================================================================
    // Shadow stack
    // =========================================================================

    /// Push a local frame; it is popped when the guard drops.
    pub fn push_frame(&self, frame: StackFrame) -> FrameGuard<'_> {
        let mut stack = self.stack.borrow_mut();
        let height = stack.frames.len();
        stack.frames.push(frame);
        FrameGuard { ctx: self, height }
    }

    /// Local frames, innermost first.
    pub fn local_frames(&self) -> Vec<StackFrame> {
        self.stack.borrow().frames.iter().rev().cloned().collect()
    }

    // =========================================================================
    // Failure reporting guard
    // =========================================================================

    pub(crate) fn reporting_failure(&self) -> bool {
        self.reporting_failure.get()
    }

    pub(crate) fn begin_failure_report(&self) -> FailureReport<'_> {
        let previous = self.reporting_failure.replace(true);
        FailureReport {
            ctx: self,
            previous,
        }
    }

    fn close_scope(&self, scope: &CallScope<'_>) -> Result<usize> {
        if scope.closed.get() {
            return Err(BridgeError::UnbalancedScope(format!(
                "{} closed twice",
                scope.call_site
            )));
        }
        let (record, is_root) = {
            let mut stack = self.stack.borrow_mut();
            match stack.records.last() {
                Some(leaf) if leaf.serial == scope.serial => {}
                Some(leaf) => {
                    let reason = if stack.position(scope.serial).is_some() {
                        format!(
                            "{} closed while {} is still open",
                            scope.call_site, leaf.call_site
                        )
                    } else {
                        format!("{} is not on this thread's scope stack", scope.call_site)
                    };
                    return Err(BridgeError::UnbalancedScope(reason));
                }
                None => {
                    return Err(BridgeError::UnbalancedScope(format!(
                        "{} closed with no open scope",
                        scope.call_site
                    )));
                }
            }
            scope.closed.set(true);
            let Some(record) = stack.records.pop() else {
                unreachable!("leaf checked above");
            };
            stack.frames.truncate(record.frame_height);
            let is_root = stack.records.is_empty();
            if is_root {
                stack.root_context = None;
            }
            (record, is_root)
        };

        let invalidated = record
            .handles
            .iter()
            .filter(|state| state.invalidate())
            .count();
        if is_root {
            let copied = scope.env.pop_frame(scope.result.get());
            scope.result.set(copied);
        }
        bridge_trace!(
            self.bridge.tracer(),
            TRACE_SCOPES,
            "{:indent$}close {} [{} handles]",
            "",
            record.call_site,
            invalidated,
            indent = scope.depth * 2
        );
        Ok(invalidated)
    }

    /// Discard `scope` and every scope opened after it. Used when a scope is
    /// dropped while nested scopes are still open.
    fn unwind_to(&self, scope: &CallScope<'_>) {
        let (records, is_root) = {
            let mut stack = self.stack.borrow_mut();
            let Some(index) = stack.position(scope.serial) else {
                return;
            };
            let records = stack.records.split_off(index);
            stack.frames.truncate(records[0].frame_height);
            let is_root = stack.records.is_empty();
            if is_root {
                stack.root_context = None;
            }
            (records, is_root)
        };
        scope.closed.set(true);

        let invalidated: usize = records
            .iter()
            .map(|record| record.handles.iter().filter(|s| s.invalidate()).count())
            .sum();
        if is_root {
            scope.env.pop_frame(ForeignRef::null());
        }
        tracing::warn!(
            target: "tscl_bridge",
            call_site = scope.call_site,
            discarded = records.len(),
            invalidated,
            "unwound scope stack"
        );
    }
}

fn split_call_site(call_site: &str) -> (&str, &str) {
    match call_site.rsplit_once('.') {
        Some((type_name, callable)) => (type_name, callable),
        None => ("", call_site),
    }
}

/// An open boundary crossing. Closes itself on drop if not closed
/// explicitly.
pub struct CallScope<'a> {
    ctx: &'a ThreadContext,
    env: &'a dyn ForeignEnv,
    serial: u64,
    depth: usize,
    call_site: &'static str,
    result: Cell<ForeignRef>,
    closed: Cell<bool>,
}

impl<'a> CallScope<'a> {
    pub fn context(&self) -> &'a ThreadContext {
        self.ctx
    }

    pub fn env(&self) -> &'a dyn ForeignEnv {
        self.env
    }

    pub fn call_site(&self) -> &'static str {
        self.call_site
    }

    /// 0 for the root scope.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Wrap `raw` in a handle bound to this scope.
    pub fn bind<K: RefKind>(&self, raw: Ref<K>) -> Result<ScopedHandle<K>> {
        let mut stack = self.ctx.stack.borrow_mut();
        let Some(index) = stack.position(self.serial) else {
            return Err(BridgeError::scope_closed(raw.raw()));
        };
        let (handle, state) = ScopedHandle::scope_bound(raw);
        stack.records[index].handles.push(state);
        Ok(handle)
    }

    /// Reference to hand back to the caller once the scope closes. A root
    /// scope copies it out of the frame it releases.
    pub fn set_result(&self, value: impl Into<ForeignRef>) {
        self.result.set(value.into());
    }

    /// Before close: the value passed to `set_result`. After close of a root
    /// scope: the copied-out reference, valid in the caller's frame.
    pub fn take_result(&self) -> ForeignRef {
        self.result.replace(ForeignRef::null())
    }

    /// Close the scope, returning how many handles it invalidated.
    ///
    /// Fails with `UnbalancedScope` if the scope is not the innermost one, or
    /// was already closed.
    pub fn close(&self) -> Result<usize> {
        self.ctx.close_scope(self)
    }
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        if self.closed.get() {
            return;
        }
        if let Err(err) = self.ctx.close_scope(self) {
            tracing::error!(target: "tscl_bridge", call_site = self.call_site, error = %err, "scope dropped out of order");
            self.ctx.unwind_to(self);
        }
    }
}

impl std::fmt::Debug for CallScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallScope")
            .field("call_site", &self.call_site)
            .field("depth", &self.depth)
            .field("closed", &self.closed.get())
            .finish()
    }
}

/// Pops a frame pushed with `ThreadContext::push_frame`.
pub struct FrameGuard<'a> {
    ctx: &'a ThreadContext,
    height: usize,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.ctx.stack.borrow_mut().frames.truncate(self.height);
    }
}

pub(crate) struct FailureReport<'a> {
    ctx: &'a ThreadContext,
    previous: bool,
}

impl Drop for FailureReport<'_> {
    fn drop(&mut self) {
        self.ctx.reporting_failure.set(self.previous);
    }
}
