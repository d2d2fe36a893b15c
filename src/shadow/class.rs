use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use crate::{
    code::CONSTRUCTOR_NAME,
    dispatch::{CallContext, DispatchFn},
    runtime::{Value, ValueKind},
    shadow::VersionRange,
    Result,
};

type StateFactory = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Name and parameter shape of a shadowed operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Method name
    pub name: String,
    /// Parameter kinds, receiver excluded
    pub params: Vec<ValueKind>,
}

impl MethodKey {
    /// Creates a key.
    #[must_use]
    pub fn new(name: &str, params: &[ValueKind]) -> Self {
        MethodKey {
            name: name.to_string(),
            params: params.to_vec(),
        }
    }
}

/// A shadow class: the replacement operations for one real class, plus the per-instance
/// state each bound shadow instance carries.
///
/// Operations are registered explicitly by name and parameter shape, so the set of
/// shadowed operations is known when the class is installed and is never discovered by
/// introspection at call time.
///
/// # Examples
///
/// ```rust
/// use shadowbox::shadow::ShadowClass;
/// use shadowbox::runtime::{Value, ValueKind};
///
/// #[derive(Default)]
/// struct Clicks(i64);
///
/// let shadow = ShadowClass::new("test.ButtonShadow", "app.Button")
///     .state(Clicks::default)
///     .method("click", &[], |ctx| {
///         let clicks = ctx.with_state(|s: &mut Clicks| {
///             s.0 += 1;
///             s.0
///         })?;
///         Ok(Value::Int(clicks))
///     });
///
/// assert!(shadow.implements_method("click", &[]));
/// assert!(!shadow.implements_method("click", &[ValueKind::Int]));
/// ```
pub struct ShadowClass {
    name: String,
    implements: String,
    versions: VersionRange,
    calls_real_code: bool,
    state: StateFactory,
    methods: HashMap<MethodKey, DispatchFn>,
}

impl ShadowClass {
    /// Starts a shadow class `name` for the real class `implements`.
    #[must_use]
    pub fn new(name: &str, implements: &str) -> Self {
        ShadowClass {
            name: name.to_string(),
            implements: implements.to_string(),
            versions: VersionRange::ANY,
            calls_real_code: true,
            state: Arc::new(|| Box::new(()) as Box<dyn Any + Send>),
            methods: HashMap::new(),
        }
    }

    /// Restricts the platform versions the shadow applies to.
    #[must_use]
    pub fn for_versions(mut self, versions: VersionRange) -> Self {
        self.versions = versions;
        self
    }

    /// Sets whether operations this shadow does not implement run the original body
    /// (`true`, the default) or return the default value of their return kind.
    #[must_use]
    pub fn calls_real_code(mut self, calls_real_code: bool) -> Self {
        self.calls_real_code = calls_real_code;
        self
    }

    /// Sets the factory for per-instance state.
    #[must_use]
    pub fn state<T, F>(mut self, factory: F) -> Self
    where
        T: Any + Send,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.state = Arc::new(move || Box::new(factory()) as Box<dyn Any + Send>);
        self
    }

    /// Adds an operation.
    #[must_use]
    pub fn method<F>(mut self, name: &str, params: &[ValueKind], f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(MethodKey::new(name, params), Arc::new(f));
        self
    }

    /// Adds a constructor replacement.
    #[must_use]
    pub fn constructor<F>(self, params: &[ValueKind], f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.method(CONSTRUCTOR_NAME, params, f)
    }

    /// Shadow class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Real class this shadow stands in for.
    #[must_use]
    pub fn implements(&self) -> &str {
        &self.implements
    }

    /// Applicable platform versions.
    #[must_use]
    pub fn versions(&self) -> VersionRange {
        self.versions
    }

    /// Whether unimplemented operations fall through to the original body.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        self.calls_real_code
    }

    /// Returns `true` if the shadow has an operation with this name and shape.
    #[must_use]
    pub fn implements_method(&self, name: &str, params: &[ValueKind]) -> bool {
        self.find(name, params).is_some()
    }

    pub(crate) fn find(&self, name: &str, params: &[ValueKind]) -> Option<&DispatchFn> {
        self.methods.get(&MethodKey::new(name, params))
    }

    pub(crate) fn new_state(&self) -> Box<dyn Any + Send> {
        (self.state)()
    }
}

impl fmt::Debug for ShadowClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort_by(|a, b| (&a.name, &a.params).cmp(&(&b.name, &b.params)));
        f.debug_struct("ShadowClass")
            .field("name", &self.name)
            .field("implements", &self.implements)
            .field("versions", &self.versions)
            .field("calls_real_code", &self.calls_real_code)
            .field("methods", &methods)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_are_keyed_by_shape() {
        let shadow = ShadowClass::new("test.S", "app.R")
            .method("size", &[], |_| Ok(Value::Int(1)))
            .method("size", &[ValueKind::Int], |_| Ok(Value::Int(2)))
            .constructor(&[], |_| Ok(Value::Void));
        assert!(shadow.implements_method("size", &[]));
        assert!(shadow.implements_method("size", &[ValueKind::Int]));
        assert!(shadow.implements_method(CONSTRUCTOR_NAME, &[]));
        assert!(!shadow.implements_method("size", &[ValueKind::Str]));
    }

    #[test]
    fn state_factory_builds_fresh_state() {
        let shadow = ShadowClass::new("test.S", "app.R").state(|| 41_i64);
        let mut state = shadow.new_state();
        *state.downcast_mut::<i64>().unwrap() += 1;
        assert_eq!(*state.downcast_ref::<i64>().unwrap(), 42);
        assert_eq!(*shadow.new_state().downcast_ref::<i64>().unwrap(), 41);
    }
}
