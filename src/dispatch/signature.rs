//! Call-site descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    code::{CallKind, MethodRef},
    runtime::ValueKind,
};

/// Fully-qualified call signature: owning class, method name and parameter shape.
///
/// This is the exact-match key of the interceptor table and of policy-level intercept
/// lists. Two signatures are equal only if all three parts are equal; there is no
/// wildcard or prefix matching.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    /// Fully-qualified name of the declaring class
    pub owner: String,
    /// Method name
    pub name: String,
    /// Parameter kinds, receiver excluded
    #[serde(default)]
    pub params: Vec<ValueKind>,
}

impl MethodSignature {
    /// Creates a signature.
    #[must_use]
    pub fn new(owner: &str, name: &str, params: &[ValueKind]) -> Self {
        MethodSignature {
            owner: owner.to_string(),
            name: name.to_string(),
            params: params.to_vec(),
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}(", self.owner, self.name)?;
        for (i, kind) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{kind}")?;
        }
        write!(f, ")")
    }
}

/// The original target of a dispatched call, as seen by the dispatch handler.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallTarget {
    /// Exact signature of the original target
    pub signature: MethodSignature,
    /// Declared return kind
    pub returns: ValueKind,
    /// Whether a receiver is passed
    pub kind: CallKind,
}

impl CallTarget {
    /// Descriptor of a static call.
    #[must_use]
    pub fn static_call(owner: &str, name: &str, params: &[ValueKind], returns: ValueKind) -> Self {
        CallTarget {
            signature: MethodSignature::new(owner, name, params),
            returns,
            kind: CallKind::Static,
        }
    }

    /// Descriptor of an instance call.
    #[must_use]
    pub fn instance_call(
        owner: &str,
        name: &str,
        params: &[ValueKind],
        returns: ValueKind,
    ) -> Self {
        CallTarget {
            signature: MethodSignature::new(owner, name, params),
            returns,
            kind: CallKind::Instance,
        }
    }

    /// Descriptor built from a method-reference pool entry.
    #[must_use]
    pub fn from_ref(entry: &MethodRef, kind: CallKind) -> Self {
        CallTarget {
            signature: entry.signature(),
            returns: entry.returns,
            kind,
        }
    }

    /// Owning class of the target.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.signature.owner
    }

    /// Method name of the target.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.signature.name
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.kind, self.signature, self.returns)
    }
}
