//! tscl-bridge: calls between local code and a foreign managed heap.
//!
//! See `runtime` for the layering. Most embedders need only `Bridge`,
//! `ThreadContext`, `CallScope`, and a `DispatchCache` over their own call
//! sites.

pub mod runtime;

pub use runtime::*;
