//! Signature-keyed call interceptors.
//!
//! This module provides [`Interceptors`], the explicit override table consulted before any
//! shadow resolution. It is the documented way to handle calls the rewriter cannot redirect
//! in place, and a blunt instrument for pinning one operation regardless of the shadow map.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    dispatch::{CallContext, DispatchFn, MethodSignature},
    runtime::Value,
    Result,
};

/// Table of interceptors keyed by exact [`MethodSignature`].
///
/// A signature either has an exact entry or it is passed through; there is no prefix,
/// wildcard or super-class matching. Registering the same signature twice replaces the
/// earlier interceptor.
///
/// The table is a plain value: it is built before a sandbox activates and is read-only
/// once installed.
///
/// # Examples
///
/// ```rust
/// use shadowbox::dispatch::{Interceptors, MethodSignature};
/// use shadowbox::runtime::Value;
///
/// let interceptors = Interceptors::new()
///     .with(MethodSignature::new("app.Button", "click", &[]), |_| Ok(Value::Int(1)));
///
/// assert!(interceptors
///     .lookup(&MethodSignature::new("app.Button", "click", &[]))
///     .is_some());
/// assert_eq!(interceptors.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct Interceptors {
    table: HashMap<MethodSignature, DispatchFn>,
}

impl Interceptors {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `replacement` for `signature`, replacing any earlier registration.
    pub fn register<F>(&mut self, signature: MethodSignature, replacement: F)
    where
        F: Fn(&mut CallContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.table.insert(signature, Arc::new(replacement));
    }

    /// Builder form of [`Interceptors::register`].
    #[must_use]
    pub fn with<F>(mut self, signature: MethodSignature, replacement: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(signature, replacement);
        self
    }

    /// The interceptor registered for exactly `signature`.
    #[must_use]
    pub fn lookup(&self, signature: &MethodSignature) -> Option<&DispatchFn> {
        self.table.get(signature)
    }

    /// Registered signatures, sorted.
    #[must_use]
    pub fn signatures(&self) -> Vec<&MethodSignature> {
        let mut signatures: Vec<_> = self.table.keys().collect();
        signatures.sort();
        signatures
    }

    /// Number of registered interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors")
            .field("signatures", &self.signatures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ValueKind;

    #[test]
    fn lookup_is_exact() {
        let interceptors = Interceptors::new().with(
            MethodSignature::new("app.Button", "click", &[ValueKind::Int]),
            |_| Ok(Value::Void),
        );

        assert!(interceptors
            .lookup(&MethodSignature::new("app.Button", "click", &[ValueKind::Int]))
            .is_some());
        assert!(interceptors
            .lookup(&MethodSignature::new("app.Button", "click", &[]))
            .is_none());
        assert!(interceptors
            .lookup(&MethodSignature::new("app.ImageButton", "click", &[ValueKind::Int]))
            .is_none());
    }

    #[test]
    fn later_registration_replaces() {
        let signature = MethodSignature::new("app.Button", "click", &[]);
        let mut interceptors = Interceptors::new();
        interceptors.register(signature.clone(), |_| Ok(Value::Int(1)));
        interceptors.register(signature.clone(), |_| Ok(Value::Int(2)));
        assert_eq!(interceptors.len(), 1);
        assert_eq!(interceptors.signatures(), vec![&signature]);
    }
}
