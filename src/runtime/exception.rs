//! Exception translation in both directions.
//!
//! Foreign to local: after every foreign call the pending exception, if any,
//! is cleared and wrapped in a `ForeignException` carrying its type, message,
//! and a stack trace merged with the local shadow stack. Allow-listed types
//! are swallowed instead.
//!
//! Local to foreign: a failure at an entry point is raised in the foreign
//! heap, either by re-throwing the original foreign exception or by creating
//! a new one whose trace interleaves both stacks.
//!
//! Everything goes through five helper callables on the foreign side
//! (`ExceptionHelper`). Translation never opens a scope of its own.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::abi::{BridgeValue, ForeignRef, Ref, Throwable, TypeDesc, ValueKind, method_signature};
use super::dispatch::{CallSite, DispatchCache};
use super::env::ForeignEnv;
use super::error::{BridgeError, Result};
use super::frames::{BoundaryPredicate, StackFrame, decode_stack, encode_stack, splice};
use super::handle::ScopedHandle;
use super::handle_table::HandleTable;
use super::scope::ThreadContext;
use super::trace::{TRACE_CALLS, Tracer, bridge_trace};

/// Type reported when the class-name helper gives nothing back.
pub const UNKNOWN_TYPE: &str = "<unknown>";

/// Foreign type holding the translation helpers.
pub const HELPER_TYPE: &str = "tscl.bridge.ExceptionSupport";

static STRING: TypeDesc = TypeDesc::Object("java.lang.String");
static THROWABLE: TypeDesc = TypeDesc::Object("java.lang.Throwable");
static STRING_ARRAY: TypeDesc = TypeDesc::Array(&STRING);

// =========================================================================
// Helper call sites
// =========================================================================

/// Foreign-side callables used for translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionHelper {
    /// `(Throwable) -> String`
    ClassName,
    /// `(Throwable) -> String`, may return null
    Message,
    /// `(Throwable) -> String[]` of encoded frames
    StackTrace,
    /// `(String) -> Throwable`
    Create,
    /// `(Throwable, String[]) -> Throwable`
    UpdateStackTrace,
}

impl CallSite for ExceptionHelper {
    fn owner(self) -> &'static str {
        HELPER_TYPE
    }

    fn name(self) -> &'static str {
        match self {
            ExceptionHelper::ClassName => "getClassName",
            ExceptionHelper::Message => "getMessage",
            ExceptionHelper::StackTrace => "getStackTrace",
            ExceptionHelper::Create => "createException",
            ExceptionHelper::UpdateStackTrace => "updateStackTrace",
        }
    }

    fn signature(self) -> Cow<'static, str> {
        let signature = match self {
            ExceptionHelper::ClassName | ExceptionHelper::Message => {
                method_signature(&[THROWABLE], STRING)
            }
            ExceptionHelper::StackTrace => method_signature(&[THROWABLE], STRING_ARRAY),
            ExceptionHelper::Create => method_signature(&[STRING], THROWABLE),
            ExceptionHelper::UpdateStackTrace => {
                method_signature(&[THROWABLE, STRING_ARRAY], THROWABLE)
            }
        };
        Cow::Owned(signature)
    }

    fn return_kind(self) -> ValueKind {
        ValueKind::Object
    }
}

// =========================================================================
// Exception values
// =========================================================================

/// Exception types to swallow rather than wrap.
#[derive(Debug, Clone, Default)]
pub struct ExceptionHandler {
    allowed: HashSet<String>,
}

impl ExceptionHandler {
    pub fn allowing<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow(mut self, type_name: impl Into<String>) -> Self {
        self.allowed.insert(type_name.into());
        self
    }

    pub fn is_allowed(&self, type_name: &str) -> bool {
        self.allowed.contains(type_name)
    }
}

/// An exception raised in the foreign heap.
#[derive(Debug, Clone)]
pub struct ForeignException {
    throwable: ScopedHandle<Throwable>,
    type_name: String,
    message: Option<String>,
    frames: Vec<StackFrame>,
    merged_stack: bool,
    suppressed: Vec<String>,
}

impl ForeignException {
    /// The original foreign exception object, bound to the root scope open
    /// when it was captured.
    pub fn throwable(&self) -> &ScopedHandle<Throwable> {
        &self.throwable
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Stack trace, innermost first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Whether `frames` interleaves local frames into the foreign trace.
    pub fn merged_stack(&self) -> bool {
        self.merged_stack
    }

    pub fn suppressed(&self) -> &[String] {
        &self.suppressed
    }

    pub fn add_suppressed(&mut self, failure: impl Into<String>) {
        self.suppressed.push(failure.into());
    }
}

impl fmt::Display for ForeignException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.type_name, message),
            None => f.write_str(&self.type_name),
        }
    }
}

impl std::error::Error for ForeignException {}

/// A local failure on its way into the foreign heap.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalException {
    kind: String,
    message: String,
    frames: Vec<StackFrame>,
    suppressed: Vec<String>,
}

impl LocalException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            frames: Vec::new(),
            suppressed: Vec::new(),
        }
    }

    /// Describe a bridge error, including its cause chain.
    pub fn from_error(err: &BridgeError) -> Self {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str("\nCaused by: ");
            message.push_str(&cause.to_string());
            source = std::error::Error::source(cause);
        }
        Self::new(format!("tscl.bridge.{}", err.kind_name()), message)
    }

    /// Attach the local stack, innermost first.
    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn suppressed(&self) -> &[String] {
        &self.suppressed
    }

    pub fn add_suppressed(&mut self, failure: impl Into<String>) {
        self.suppressed.push(failure.into());
    }
}

impl fmt::Display for LocalException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// =========================================================================
// Translation
// =========================================================================

pub struct ExceptionBridge {
    helpers: DispatchCache<ExceptionHelper>,
    boundary: Arc<BoundaryPredicate>,
    local_skip: usize,
    foreign_skip: usize,
    tracer: Tracer,
}

impl ExceptionBridge {
    pub fn new(
        types: Arc<HandleTable>,
        boundary: Arc<BoundaryPredicate>,
        local_skip: usize,
        foreign_skip: usize,
        tracer: Tracer,
    ) -> Self {
        Self {
            helpers: DispatchCache::new(types),
            boundary,
            local_skip,
            foreign_skip,
            tracer,
        }
    }

    /// Clear and wrap the pending foreign exception, if there is one.
    ///
    /// Returns `Ok` when nothing is pending or the pending type is allowed by
    /// `handler`. Otherwise returns `BridgeError::Foreign`. If the foreign
    /// trace already crosses the boundary it is kept as is; if not, the
    /// local shadow stack is spliced in after it.
    pub fn capture_pending(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        handler: &ExceptionHandler,
    ) -> Result<()> {
        if !env.exception_check() {
            return Ok(());
        }
        // Bound to the root scope so it can still be re-thrown once nested
        // scopes have closed. Left pending if there is no scope to own it.
        let raw = env.exception_occurred();
        let throwable = ctx.bind_root(Ref::<Throwable>::new(raw))?;
        env.exception_clear();

        let type_name = self
            .helper_string(ctx, env, ExceptionHelper::ClassName, raw)?
            .unwrap_or_else(|| UNKNOWN_TYPE.to_string());
        if handler.is_allowed(&type_name) {
            bridge_trace!(self.tracer, TRACE_CALLS, "swallowing allowed {}", type_name);
            return Ok(());
        }
        let message = self.helper_string(ctx, env, ExceptionHelper::Message, raw)?;
        let foreign = self.foreign_frames(ctx, env, raw)?;

        let (frames, merged_stack) = if foreign.iter().any(|frame| (self.boundary)(frame)) {
            (foreign, false)
        } else {
            let local = ctx.local_frames();
            let merged = splice(&foreign, &local, 0, self.local_skip, true, &*self.boundary);
            (merged, true)
        };
        bridge_trace!(self.tracer, TRACE_CALLS, "captured {} ({} frames)", type_name, frames.len());

        Err(ForeignException {
            throwable,
            type_name,
            message,
            frames,
            merged_stack,
            suppressed: Vec::new(),
        }
        .into())
    }

    /// Raise `err` in the foreign heap. Foreign exceptions are re-thrown;
    /// anything else becomes a new foreign exception.
    pub fn raise(&self, ctx: &ThreadContext, env: &dyn ForeignEnv, err: &BridgeError) {
        match err {
            BridgeError::Foreign(exception) => self.rethrow(ctx, env, exception),
            other => {
                let local = LocalException::from_error(other).with_frames(ctx.local_frames());
                self.raise_local(ctx, env, &local);
            }
        }
    }

    /// Re-throw a captured exception. A merged trace is written back first.
    pub fn rethrow(&self, ctx: &ThreadContext, env: &dyn ForeignEnv, exception: &ForeignException) {
        let raw = match exception.throwable.access() {
            Ok(raw) => raw.raw(),
            Err(_) => {
                // Its scope is gone; all that is left is the description.
                let message = exception.message.clone().unwrap_or_default();
                let local = LocalException::new(exception.type_name.clone(), message)
                    .with_frames(exception.frames.clone());
                self.raise_local(ctx, env, &local);
                return;
            }
        };
        if exception.merged_stack
            && let Err(failure) = self.update_stack(ctx, env, raw, &exception.frames)
        {
            let mut record = LocalException::new(
                exception.type_name.clone(),
                exception.message.clone().unwrap_or_default(),
            )
            .with_frames(exception.frames.clone());
            record.add_suppressed(failure.to_string());
            self.dump(&record);
        }
        bridge_trace!(self.tracer, TRACE_CALLS, "rethrow {}", exception.type_name);
        env.throw(raw);
    }

    /// Create and throw a foreign exception describing `exception`.
    ///
    /// If translation itself fails nothing is thrown; the failure is added to
    /// the exception's suppressed list and the result is dumped.
    pub fn raise_local(&self, ctx: &ThreadContext, env: &dyn ForeignEnv, exception: &LocalException) {
        if let Err(failure) = self.try_raise_local(ctx, env, exception) {
            let mut record = exception.clone();
            record.add_suppressed(failure.to_string());
            self.dump(&record);
        }
    }

    fn try_raise_local(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        exception: &LocalException,
    ) -> Result<()> {
        let message = env.new_string(&exception.to_string());
        let created = self
            .helper_call(ctx, env, ExceptionHelper::Create, &[message.into()])?
            .ok_or(BridgeError::Translation {
                helper: ExceptionHelper::Create.name(),
            })?;
        let foreign = self.foreign_frames(ctx, env, created)?;
        let merged = splice(
            &foreign,
            exception.frames(),
            self.foreign_skip,
            0,
            false,
            &*self.boundary,
        );
        self.update_stack(ctx, env, created, &merged)?;
        bridge_trace!(self.tracer, TRACE_CALLS, "throw {}", exception.kind);
        env.throw(created);
        Ok(())
    }

    /// Write a diagnostic record for an exception that could not be raised.
    pub fn dump(&self, exception: &LocalException) {
        let frames: Vec<String> = exception.frames.iter().map(ToString::to_string).collect();
        let record = json!({
            "event": "untranslated_exception",
            "timestamp": Utc::now().to_rfc3339(),
            "kind": exception.kind,
            "message": exception.message,
            "frames": frames,
            "suppressed": exception.suppressed,
        });
        self.tracer.dump(&format!("{record:#}"));
    }

    // =========================================================================
    // Helper plumbing
    // =========================================================================

    /// Invoke a helper. `Ok(None)` if it returned null or raised; a raised
    /// exception is cleared.
    fn helper_call(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        helper: ExceptionHelper,
        args: &[BridgeValue],
    ) -> Result<Option<ForeignRef>> {
        let descriptor = self.helpers.resolve(ctx, env, helper)?;
        bridge_trace!(self.tracer, TRACE_CALLS, "helper {}", helper.name());
        let value = env.invoke(descriptor.owner.raw(), descriptor.callable, ForeignRef::null(), args);
        if env.exception_check() {
            env.exception_clear();
            tracing::warn!(target: "tscl_bridge", helper = helper.name(), "exception translation helper raised");
            return Ok(None);
        }
        Ok(value.as_ref().and_then(ForeignRef::non_null))
    }

    fn helper_string(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        helper: ExceptionHelper,
        throwable: ForeignRef,
    ) -> Result<Option<String>> {
        let string = self.helper_call(ctx, env, helper, &[throwable.into()])?;
        Ok(string.and_then(|s| env.read_string(s)))
    }

    fn foreign_frames(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        throwable: ForeignRef,
    ) -> Result<Vec<StackFrame>> {
        let Some(array) =
            self.helper_call(ctx, env, ExceptionHelper::StackTrace, &[throwable.into()])?
        else {
            return Ok(Vec::new());
        };
        let records: Vec<String> = (0..env.array_length(array))
            .filter_map(|i| env.read_string(env.array_element(array, i)))
            .collect();
        Ok(decode_stack(&records))
    }

    fn update_stack(
        &self,
        ctx: &ThreadContext,
        env: &dyn ForeignEnv,
        throwable: ForeignRef,
        frames: &[StackFrame],
    ) -> Result<()> {
        let array = env.new_string_array(&encode_stack(frames));
        self.helper_call(
            ctx,
            env,
            ExceptionHelper::UpdateStackTrace,
            &[throwable.into(), array.into()],
        )?
        .map(|_| ())
        .ok_or(BridgeError::Translation {
            helper: ExceptionHelper::UpdateStackTrace.name(),
        })
    }
}

impl fmt::Debug for ExceptionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionBridge")
            .field("helpers", &self.helpers)
            .field("local_skip", &self.local_skip)
            .field("foreign_skip", &self.foreign_skip)
            .finish()
    }
}

/// Build the error for a failed symbol lookup.
///
/// If the lookup left an exception pending it becomes the error's cause.
/// While a cause is being translated on this thread, further lookup failures
/// come back bare (their pending exception dropped) so translation cannot
/// recurse into itself.
pub(crate) fn unresolved_symbol(
    ctx: &ThreadContext,
    env: &dyn ForeignEnv,
    symbol: String,
) -> BridgeError {
    if !env.exception_check() {
        return BridgeError::unresolved(symbol);
    }
    if ctx.reporting_failure() {
        env.exception_clear();
        tracing::warn!(target: "tscl_bridge", %symbol, "lookup failed while translating another failure");
        return BridgeError::unresolved(symbol);
    }

    let _report = ctx.begin_failure_report();
    match ctx
        .bridge()
        .exceptions()
        .capture_pending(ctx, env, &ExceptionHandler::default())
    {
        Err(BridgeError::Foreign(cause)) => BridgeError::UnresolvedSymbol {
            symbol,
            cause: Some(Box::new(cause)),
        },
        Err(nested) => {
            tracing::warn!(target: "tscl_bridge", %symbol, error = %nested, "could not translate lookup failure");
            BridgeError::unresolved(symbol)
        }
        Ok(()) => BridgeError::unresolved(symbol),
    }
}
