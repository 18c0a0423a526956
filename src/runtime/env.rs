//! Primitive cross-heap operations.
//!
//! `ForeignEnv` is the seam to the foreign heap's native interface (one value
//! per attached foreign thread). The bridge only ever brackets these calls
//! with scope and exception handling; it never implements them itself.
//!
//! None of these operations report failure through their return value except
//! by returning null or `None`. A foreign failure leaves an exception pending,
//! which the caller must inspect with `exception_check`.

use super::abi::{BridgeValue, ContextId, ForeignRef};

/// Resolved foreign callable. Opaque, like `ForeignRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallableId(pub usize);

pub trait ForeignEnv {
    /// Identity of the execution context this environment belongs to.
    fn context_id(&self) -> ContextId;

    // =========================================================================
    // Reference frames
    // =========================================================================

    /// Push a reference frame. Local references created afterwards belong to
    /// it.
    fn push_frame(&self, capacity: usize);

    /// Pop the current reference frame, invalidating every local reference in
    /// it. If `result` is non-null it is copied into the parent frame and the
    /// new reference is returned.
    fn pop_frame(&self, result: ForeignRef) -> ForeignRef;

    /// Promote a reference to one that survives frame release.
    fn new_durable_ref(&self, reference: ForeignRef) -> ForeignRef;

    fn delete_durable_ref(&self, reference: ForeignRef);

    fn is_same_object(&self, a: ForeignRef, b: ForeignRef) -> bool;

    // =========================================================================
    // Symbol lookup and invocation
    // =========================================================================

    /// Look up a type descriptor by binary name. Null if absent.
    fn find_type(&self, binary_name: &str) -> ForeignRef;

    /// Look up a callable on `owner`. `None` if absent.
    fn find_callable(
        &self,
        owner: ForeignRef,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Option<CallableId>;

    /// The primitive call gate.
    fn invoke(
        &self,
        owner: ForeignRef,
        callable: CallableId,
        receiver: ForeignRef,
        args: &[BridgeValue],
    ) -> BridgeValue;

    // =========================================================================
    // Pending exception slot
    // =========================================================================

    fn exception_check(&self) -> bool;

    /// The pending exception, or null.
    fn exception_occurred(&self) -> ForeignRef;

    fn exception_clear(&self);

    /// Make `exception` the pending exception.
    fn throw(&self, exception: ForeignRef);

    // =========================================================================
    // Strings and arrays
    // =========================================================================

    fn new_string(&self, value: &str) -> ForeignRef;

    /// `None` for a null reference.
    fn read_string(&self, string: ForeignRef) -> Option<String>;

    fn new_string_array(&self, values: &[String]) -> ForeignRef;

    fn array_length(&self, array: ForeignRef) -> usize;

    fn array_element(&self, array: ForeignRef, index: usize) -> ForeignRef;
}
