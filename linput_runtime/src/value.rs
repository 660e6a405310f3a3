//! Script-visible values.
//!
//! A deliberately small value set: enough to carry arguments into native
//! calls and results back out. Values that own heap payloads are created
//! through the [`RuntimeGuard`], because handing memory to the runtime's
//! object system requires the runtime lock.

use crate::lock::RuntimeGuard;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

/// An opaque native address tagged with the kind of object it points to.
///
/// Capsules carry native references across the script boundary. The tag is
/// checked before the address is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capsule {
    tag: Arc<str>,
    address: NonZeroU64,
}

impl Capsule {
    /// The tag this capsule was created with.
    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The wrapped native address.
    #[inline]
    pub fn address(&self) -> NonZeroU64 {
        self.address
    }

    /// Return the address if the capsule carries `tag`.
    #[inline]
    pub fn address_if(&self, tag: &str) -> Option<NonZeroU64> {
        (&*self.tag == tag).then_some(self.address)
    }
}

/// A value exchanged with the scripting runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Bytes(Arc<[u8]>),
    Str(Arc<str>),
    Capsule(Capsule),
}

impl Value {
    #[inline]
    pub const fn none() -> Self {
        Value::None
    }

    #[inline]
    pub const fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    #[inline]
    pub const fn int(i: i64) -> Self {
        Value::Int(i)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Integer view. Booleans count as integers, as in Python.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Truth value for flag-like arguments (`bool` or `int`).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_capsule(&self) -> Option<&Capsule> {
        match self {
            Value::Capsule(c) => Some(c),
            _ => None,
        }
    }

    /// Runtime type name, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Capsule(_) => "PyCapsule",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Bytes(b) => write!(f, "<bytes len={}>", b.len()),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Capsule(c) => write!(f, "<capsule \"{}\" at {:#x}>", c.tag, c.address.get()),
        }
    }
}

// =============================================================================
// Allocation Under The Lock
// =============================================================================

impl RuntimeGuard<'_> {
    /// Hand a copy of `data` to the runtime as a `bytes` value.
    pub fn new_bytes(&mut self, data: &[u8]) -> Value {
        self.record_allocation(data.len());
        Value::Bytes(Arc::from(data))
    }

    /// Hand `bytes` to the runtime as a `str`, replacing invalid UTF-8.
    pub fn new_str(&mut self, bytes: &[u8]) -> Value {
        let text = String::from_utf8_lossy(bytes);
        self.record_allocation(text.len());
        Value::Str(Arc::from(text.as_ref()))
    }

    /// Wrap a native address in a capsule tagged `tag`.
    pub fn new_capsule(&mut self, tag: &str, address: NonZeroU64) -> Value {
        self.record_allocation(tag.len());
        Value::Capsule(Capsule {
            tag: Arc::from(tag),
            address,
        })
    }
}
