//! Opaque foreign references and the packed value word used at the call gate
//!
//! The foreign heap hands out address-sized tokens that carry no type
//! information. This module provides:
//! - `ForeignRef`: the raw token (never dereferenced by the bridge)
//! - `Ref<K>`: a phantom-typed view so "class" and "string" references stay
//!   distinct at compile time without any runtime cost
//! - `BridgeValue`: a NaN-boxed 64-bit word used for packed arguments and
//!   raw call results
//!
//! Layout of `BridgeValue`:
//! - Numbers: Regular IEEE 754 f64 (if not a quiet NaN)
//! - Tagged values: 0x7FFC_xxxx_xxxx_xxxx (quiet NaN + payload)
//!
//! Tag encoding (bits 48-51 of the NaN payload):
//! - 0x0: Reference in bits 0-47
//! - 0x1: Boolean (bit 0: 0=false, 1=true)
//! - 0x2: Null reference
//! - 0x3: Void (no value)
//! - 0x4: Int (i32 in bits 0-31)

use std::fmt;
use std::marker::PhantomData;

/// Quiet NaN with signal bit clear and all exponent bits set.
const QNAN: u64 = 0x7FFC_0000_0000_0000;

/// Mask for the tag bits (bits 48-51)
const TAG_MASK: u64 = 0x000F_0000_0000_0000;

/// Mask for the reference/payload (bits 0-47)
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const TAG_REF: u64 = 0x0000_0000_0000_0000;
const TAG_BOOLEAN: u64 = 0x0001_0000_0000_0000;
const TAG_NULL: u64 = 0x0002_0000_0000_0000;
const TAG_VOID: u64 = 0x0003_0000_0000_0000;
const TAG_INT: u64 = 0x0004_0000_0000_0000;

// =========================================================================
// Foreign references
// =========================================================================

/// An opaque reference into the foreign heap.
///
/// Only equality is meaningful. Two distinct tokens may still name the same
/// foreign object; use `ForeignEnv::is_same_object` for identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ForeignRef(usize);

impl ForeignRef {
    /// The null reference.
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `None` for the null reference.
    #[inline]
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }
}

impl fmt::Debug for ForeignRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignRef(0x{:x})", self.0)
    }
}

impl fmt::LowerHex for ForeignRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Marker for the nominal kind of a foreign reference.
pub trait RefKind: Copy + 'static {
    /// Name used in trace output.
    const NAME: &'static str;
}

macro_rules! ref_kinds {
    ($($(#[$doc:meta])* $kind:ident => $name:literal),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $kind {}

            impl RefKind for $kind {
                const NAME: &'static str = $name;
            }
        )*
    };
}

ref_kinds! {
    /// Any foreign object.
    Object => "object",
    /// A foreign type descriptor.
    Class => "class",
    /// A foreign string.
    Str => "string",
    /// A foreign exception object.
    Throwable => "throwable",
    /// A foreign array of references.
    ObjectArray => "object[]",
}

/// A foreign reference tagged with its nominal kind.
#[repr(transparent)]
pub struct Ref<K: RefKind> {
    raw: ForeignRef,
    _kind: PhantomData<K>,
}

impl<K: RefKind> Ref<K> {
    #[inline]
    pub const fn new(raw: ForeignRef) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    #[inline]
    pub const fn raw(self) -> ForeignRef {
        self.raw
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.raw.is_null()
    }

    /// Forget the nominal kind.
    #[inline]
    pub const fn upcast(self) -> Ref<Object> {
        Ref::new(self.raw)
    }

    /// Reinterpret as another kind. Nothing is checked.
    #[inline]
    pub const fn cast<K2: RefKind>(self) -> Ref<K2> {
        Ref::new(self.raw)
    }
}

impl<K: RefKind> Clone for Ref<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: RefKind> Copy for Ref<K> {}

impl<K: RefKind> PartialEq for Ref<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K: RefKind> Eq for Ref<K> {}

impl<K: RefKind> std::hash::Hash for Ref<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: RefKind> fmt::Debug for Ref<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref<{}>(0x{:x})", K::NAME, self.raw)
    }
}

impl<K: RefKind> From<Ref<K>> for ForeignRef {
    fn from(r: Ref<K>) -> Self {
        r.raw
    }
}

/// Identity of a foreign execution context (one per attached foreign thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

// =========================================================================
// Packed values
// =========================================================================

/// A NaN-boxed argument or raw result word.
///
/// Designed to be:
/// - Passed in registers (single u64)
/// - Cheaply copied (Copy trait)
/// - Fast to classify (bit pattern comparison)
#[derive(Clone, Copy, PartialEq)]
#[repr(transparent)]
pub struct BridgeValue {
    bits: u64,
}

impl BridgeValue {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a number value from f64.
    #[inline]
    pub fn double(n: f64) -> Self {
        // Canonicalize NaN so it cannot collide with a tagged value
        if n.is_nan() {
            Self {
                bits: f64::NAN.to_bits(),
            }
        } else {
            Self { bits: n.to_bits() }
        }
    }

    #[inline]
    pub fn boolean(b: bool) -> Self {
        Self {
            bits: QNAN | TAG_BOOLEAN | (b as u64),
        }
    }

    #[inline]
    pub fn int(i: i32) -> Self {
        Self {
            bits: QNAN | TAG_INT | (i as u32 as u64),
        }
    }

    #[inline]
    pub const fn null() -> Self {
        Self {
            bits: QNAN | TAG_NULL,
        }
    }

    #[inline]
    pub const fn void() -> Self {
        Self {
            bits: QNAN | TAG_VOID,
        }
    }

    /// Box a foreign reference. The null reference boxes as `null()`.
    ///
    /// # Panics
    ///
    /// If the reference does not fit in the 48-bit payload.
    #[inline]
    pub fn reference(r: ForeignRef) -> Self {
        if r.is_null() {
            return Self::null();
        }
        let addr = r.as_usize() as u64;
        assert!(addr <= PAYLOAD_MASK, "Reference exceeds 48 bits");
        Self {
            bits: QNAN | TAG_REF | addr,
        }
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.bits
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[inline]
    pub fn is_double(self) -> bool {
        (self.bits & QNAN) != QNAN || self.bits == f64::NAN.to_bits()
    }

    #[inline]
    pub fn is_reference(self) -> bool {
        (self.bits & (QNAN | TAG_MASK)) == (QNAN | TAG_REF) && (self.bits & PAYLOAD_MASK) != 0
    }

    #[inline]
    pub fn is_boolean(self) -> bool {
        (self.bits & (QNAN | TAG_MASK)) == (QNAN | TAG_BOOLEAN)
    }

    #[inline]
    pub fn is_int(self) -> bool {
        (self.bits & (QNAN | TAG_MASK)) == (QNAN | TAG_INT)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.bits == (QNAN | TAG_NULL)
    }

    #[inline]
    pub fn is_void(self) -> bool {
        self.bits == (QNAN | TAG_VOID)
    }

    // =========================================================================
    // Extraction
    // =========================================================================

    #[inline]
    pub fn as_double(self) -> Option<f64> {
        self.is_double().then(|| f64::from_bits(self.bits))
    }

    #[inline]
    pub fn as_boolean(self) -> Option<bool> {
        self.is_boolean().then_some((self.bits & 1) != 0)
    }

    #[inline]
    pub fn as_int(self) -> Option<i32> {
        self.is_int().then_some(self.bits as u32 as i32)
    }

    /// The boxed reference; `Some(ForeignRef::null())` for a null value.
    #[inline]
    pub fn as_ref(self) -> Option<ForeignRef> {
        if self.is_null() {
            Some(ForeignRef::null())
        } else if self.is_reference() {
            Some(ForeignRef::from_usize((self.bits & PAYLOAD_MASK) as usize))
        } else {
            None
        }
    }

    /// Classification of this word, if it is not a double.
    pub fn kind(self) -> ValueKind {
        if self.is_void() {
            ValueKind::Void
        } else if self.is_boolean() {
            ValueKind::Boolean
        } else if self.is_int() {
            ValueKind::Int
        } else if self.is_null() || self.is_reference() {
            ValueKind::Object
        } else {
            ValueKind::Double
        }
    }
}

impl fmt::Debug for BridgeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            write!(f, "Void")
        } else if self.is_null() {
            write!(f, "Null")
        } else if let Some(b) = self.as_boolean() {
            write!(f, "Boolean({})", b)
        } else if let Some(i) = self.as_int() {
            write!(f, "Int({})", i)
        } else if self.is_reference() {
            write!(f, "Ref(0x{:x})", self.bits & PAYLOAD_MASK)
        } else if let Some(n) = self.as_double() {
            write!(f, "Double({})", n)
        } else {
            write!(f, "Unknown(0x{:016x})", self.bits)
        }
    }
}

impl Default for BridgeValue {
    fn default() -> Self {
        Self::void()
    }
}

impl From<ForeignRef> for BridgeValue {
    fn from(r: ForeignRef) -> Self {
        Self::reference(r)
    }
}

impl<K: RefKind> From<Ref<K>> for BridgeValue {
    fn from(r: Ref<K>) -> Self {
        Self::reference(r.raw())
    }
}

impl From<bool> for BridgeValue {
    fn from(b: bool) -> Self {
        Self::boolean(b)
    }
}

impl From<i32> for BridgeValue {
    fn from(i: i32) -> Self {
        Self::int(i)
    }
}

impl From<f64> for BridgeValue {
    fn from(n: f64) -> Self {
        Self::double(n)
    }
}

/// Expected classification of a call-site result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Void,
    Boolean,
    Int,
    Double,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Void => "void",
            ValueKind::Boolean => "boolean",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

// =========================================================================
// Signatures
// =========================================================================

/// A parameter or return type in a call-site signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDesc {
    Void,
    Boolean,
    Int,
    Long,
    Double,
    /// A reference type given by its source-format name, e.g. `java.lang.String`.
    Object(&'static str),
    /// An array of the inner type.
    Array(&'static TypeDesc),
}

impl TypeDesc {
    fn encode_into(&self, buf: &mut String) {
        match self {
            TypeDesc::Void => buf.push('V'),
            TypeDesc::Boolean => buf.push('Z'),
            TypeDesc::Int => buf.push('I'),
            TypeDesc::Long => buf.push('J'),
            TypeDesc::Double => buf.push('D'),
            TypeDesc::Object(name) => {
                buf.push('L');
                buf.push_str(&binary_name(name));
                buf.push(';');
            }
            TypeDesc::Array(inner) => {
                buf.push('[');
                inner.encode_into(buf);
            }
        }
    }
}

/// Converts a source-format type name (`a.b.C`) to binary format (`a/b/C`).
pub fn binary_name(name: &str) -> String {
    name.replace('.', "/")
}

/// Encodes a method descriptor: `(params)ret`.
pub fn method_signature(params: &[TypeDesc], ret: TypeDesc) -> String {
    let mut buf = String::from("(");
    for param in params {
        param.encode_into(&mut buf);
    }
    buf.push(')');
    ret.encode_into(&mut buf);
    buf
}
