//! Cross-heap call bridge.
//!
//! Lets local code call into a foreign managed heap, and be called back from
//! it, through a narrow set of primitive operations (`ForeignEnv`). Layered
//! as:
//! - value and reference representation at the call gate (abi.rs)
//! - per-thread call scopes and scope-bound handles (scope.rs, handle.rs)
//! - durable references and their deferred release (reclaim.rs)
//! - process-wide type and call-site caches (handle_table.rs, dispatch.rs)
//! - exception translation in both directions (exception.rs, frames.rs)
//!
//! `Bridge` ties the shared pieces together; each thread works through its
//! own `ThreadContext`.

pub mod abi;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod exception;
pub mod frames;
pub mod handle;
pub mod handle_table;
pub mod reclaim;
pub mod scope;
pub mod trace;

#[cfg(test)]
pub(crate) mod sim;

pub use abi::{BridgeValue, ContextId, ForeignRef, Ref, RefKind, ValueKind};
pub use bridge::{Bridge, BridgeBuilder};
pub use config::BridgeConfig;
pub use dispatch::{CallSite, DispatchCache};
pub use env::{CallableId, ForeignEnv};
pub use error::{BridgeError, Result};
pub use exception::{ExceptionHandler, ForeignException, LocalException};
pub use frames::StackFrame;
pub use handle::{Ownership, ScopedHandle};
pub use scope::{CallScope, ThreadContext};
