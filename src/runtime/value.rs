//! Runtime value representation.
//!
//! [`Value`] is what lives on the evaluation stack, in argument and local slots, in object
//! fields, and what crosses the dispatch boundary into shadow and interceptor code.
//! [`ValueKind`] is the static counterpart used in method parameter shapes.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr};

use crate::{DispatchError, Result};

/// Static kind of a value, as recorded in method parameter shapes and return kinds.
///
/// | Tag | Kind | Default value |
/// |-----|------|---------------|
/// | 0 | `void` | [`Value::Void`] |
/// | 1 | `int` | `Int(0)` |
/// | 2 | `bool` | `Bool(false)` |
/// | 3 | `str` | [`Value::Null`] |
/// | 4 | `object` | [`Value::Null`] |
/// | 5 | `any` | [`Value::Null`] |
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumIter,
    FromRepr,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// No value
    Void = 0,
    /// 64-bit signed integer
    Int = 1,
    /// Boolean
    Bool = 2,
    /// Immutable string
    Str = 3,
    /// Reference to a heap object
    Object = 4,
    /// Any value; matches every kind
    Any = 5,
}

impl ValueKind {
    /// The value a method of this return kind produces when it has no body to run.
    #[must_use]
    pub fn default_value(self) -> Value {
        match self {
            ValueKind::Void => Value::Void,
            ValueKind::Int => Value::Int(0),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Str | ValueKind::Object | ValueKind::Any => Value::Null,
        }
    }
}

/// Opaque handle to an object on a sandbox heap.
///
/// The id is stable for the object's lifetime and never reused within the process, which makes
/// it usable as the key of side tables such as the shadow binding index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(pub(crate) u64);

impl ObjectRef {
    /// Returns the internal ID of this reference.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A runtime value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    /// No value (void return).
    #[default]
    Void,
    /// The null reference.
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Immutable string.
    Str(Arc<str>),
    /// Reference to a heap object.
    Object(ObjectRef),
}

impl Value {
    /// Creates a string value.
    #[must_use]
    pub fn str(value: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(value.as_ref()))
    }

    /// Dynamic kind of this value. `Null` reports [`ValueKind::Object`].
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Void => ValueKind::Void,
            Value::Int(_) => ValueKind::Int,
            Value::Bool(_) => ValueKind::Bool,
            Value::Str(_) => ValueKind::Str,
            Value::Null | Value::Object(_) => ValueKind::Object,
        }
    }

    /// Returns `true` if this value may be passed where `kind` is expected.
    #[must_use]
    pub fn conforms_to(&self, kind: ValueKind) -> bool {
        match (self, kind) {
            (_, ValueKind::Any) => true,
            (Value::Null, ValueKind::Str | ValueKind::Object) => true,
            (value, kind) => value.kind() == kind,
        }
    }

    /// Extracts an integer.
    ///
    /// # Errors
    /// Returns [`DispatchError::TypeMismatch`] for any other kind.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(mismatch(ValueKind::Int, other)),
        }
    }

    /// Extracts a boolean. Integers are truthy when non-zero.
    ///
    /// # Errors
    /// Returns [`DispatchError::TypeMismatch`] for any other kind.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            other => Err(mismatch(ValueKind::Bool, other)),
        }
    }

    /// Extracts a string slice.
    ///
    /// # Errors
    /// Returns [`DispatchError::TypeMismatch`] for any other kind.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(v) => Ok(&**v),
            other => Err(mismatch(ValueKind::Str, other)),
        }
    }

    /// Extracts an object reference.
    ///
    /// # Errors
    /// Returns [`DispatchError::TypeMismatch`] for null and non-object values.
    pub fn as_object(&self) -> Result<ObjectRef> {
        match self {
            Value::Object(obj) => Ok(*obj),
            other => Err(mismatch(ValueKind::Object, other)),
        }
    }
}

fn mismatch(expected: ValueKind, found: &Value) -> crate::Error {
    DispatchError::TypeMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    }
    .into()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "\"{v}\""),
            Value::Object(obj) => write!(f, "object{obj}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl From<ObjectRef> for Value {
    fn from(value: ObjectRef) -> Self {
        Value::Object(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn kind_tags_round_trip() {
        for kind in ValueKind::iter() {
            assert_eq!(ValueKind::from_repr(kind as u8), Some(kind));
        }
        assert_eq!(ValueKind::from_repr(6), None);
    }

    #[test]
    fn defaults_conform_to_their_kind() {
        for kind in ValueKind::iter() {
            assert!(kind.default_value().conforms_to(kind), "{kind}");
        }
    }

    #[test]
    fn null_conforms_to_references_only() {
        assert!(Value::Null.conforms_to(ValueKind::Object));
        assert!(Value::Null.conforms_to(ValueKind::Str));
        assert!(!Value::Null.conforms_to(ValueKind::Int));
    }

    #[test]
    fn accessor_mismatch_reports_kinds() {
        let err = Value::str("x").as_int().unwrap_err();
        assert!(err.to_string().contains("expected int"));
    }
}
