//! Bridge error taxonomy.
//!
//! Everything except `Foreign` is a violation of the bridge's usage
//! discipline and is never retried. `Foreign` is ordinary control flow: an
//! exception raised by foreign code, captured and ready to be re-raised.

use thiserror::Error;

use super::abi::{ContextId, ForeignRef, ValueKind};
use super::exception::ForeignException;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Use of a scope-bound handle after its scope closed, or of a released
    /// durable handle.
    #[error("invalid handle {reference:?}: {reason}")]
    InvalidHandle {
        reference: ForeignRef,
        reason: &'static str,
    },

    /// A scope was closed twice or out of stack order.
    #[error("unbalanced call scope: {0}")]
    UnbalancedScope(String),

    /// Two foreign execution contexts interleaved on one thread stack.
    #[error("cannot mix foreign contexts on one thread: root scope belongs to {root:?}, got {got:?}")]
    MixedContext { root: ContextId, got: ContextId },

    /// A foreign type or callable could not be found.
    #[error("unresolved foreign symbol {symbol}")]
    UnresolvedSymbol {
        symbol: String,
        #[source]
        cause: Option<Box<ForeignException>>,
    },

    /// A second durable handle was requested for an already registered
    /// foreign object.
    #[error("duplicate durable registration for {0:?}")]
    DuplicateDurable(ForeignRef),

    /// A call site returned a value of the wrong kind.
    #[error("call site {call_site} declared {expected} result, got {got}")]
    ReturnKindMismatch {
        call_site: &'static str,
        expected: ValueKind,
        got: ValueKind,
    },

    /// An exception-translation helper itself raised, or returned null.
    #[error("exception translation helper {helper} failed")]
    Translation { helper: &'static str },

    /// An exception raised by foreign code.
    #[error(transparent)]
    Foreign(#[from] ForeignException),
}

impl BridgeError {
    /// Whether this error is an invariant violation rather than a foreign
    /// runtime failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::Foreign(_))
    }

    pub(crate) fn scope_closed(reference: ForeignRef) -> Self {
        BridgeError::InvalidHandle {
            reference,
            reason: "owning call scope is closed",
        }
    }

    pub(crate) fn released(reference: ForeignRef) -> Self {
        BridgeError::InvalidHandle {
            reference,
            reason: "durable reference was released",
        }
    }

    pub(crate) fn unresolved(symbol: impl Into<String>) -> Self {
        BridgeError::UnresolvedSymbol {
            symbol: symbol.into(),
            cause: None,
        }
    }

    /// Variant name, used as the type of a translated exception.
    pub fn kind_name(&self) -> &'static str {
        match self {
            BridgeError::InvalidHandle { .. } => "InvalidHandle",
            BridgeError::UnbalancedScope(_) => "UnbalancedScope",
            BridgeError::MixedContext { .. } => "MixedContext",
            BridgeError::UnresolvedSymbol { .. } => "UnresolvedSymbol",
            BridgeError::DuplicateDurable(_) => "DuplicateDurable",
            BridgeError::ReturnKindMismatch { .. } => "ReturnKindMismatch",
            BridgeError::Translation { .. } => "Translation",
            BridgeError::Foreign(_) => "Foreign",
        }
    }

    /// The foreign exception, if this error carries one.
    pub fn as_foreign(&self) -> Option<&ForeignException> {
        match self {
            BridgeError::Foreign(e) => Some(e),
            _ => None,
        }
    }
}
