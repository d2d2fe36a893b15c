//! Sandboxes: one isolated universe of rewritten classes plus one dispatch configuration.
//!
//! A [`Sandbox`] moves through a fixed lifecycle:
//!
//! ```text
//! Created --install--> Configured --activate--> Active --teardown--> TornDown
//! ```
//!
//! - **Created**: the instrumentation policy is fixed and validated; nothing is loaded.
//! - **Configured**: a shadow map and interceptor table are installed into a fresh
//!   [`DispatchHandler`] over a fresh [`ModuleSpace`]. Installing again replaces both.
//! - **Active**: forced classes have been rewritten and defined, classes load (and are
//!   rewritten) on first use, and code runs with the handler bound to the calling thread.
//! - **TornDown**: bindings, objects and loaded classes are released. Every later
//!   operation fails with [`DispatchError::UsageAfterTeardown`].
//!
//! Sandboxes never share handlers, shadow maps or module spaces. Several may be active in
//! one process at the same time, each reached through its own thread-scoped binding.
//!
//! # Example
//!
//! ```rust
//! use shadowbox::prelude::*;
//!
//! # fn main() -> shadowbox::Result<()> {
//! let button = ClassBuilder::new("app.Button")
//!     .constructor(&[], |body| {
//!         body.ret();
//!     })
//!     .instance_method("label", &[], ValueKind::Str, |body| {
//!         body.ldstr("OK").ret();
//!     })
//!     .build()?;
//!
//! let shadow = ShadowClass::new("test.ButtonShadow", "app.Button")
//!     .method("label", &[], |_| Ok(Value::str("shadowed")));
//!
//! let mut sandbox = Sandbox::create(
//!     InstrumentationPolicy::default(),
//!     MemoryClassSource::new().with(button)?,
//! )?;
//! sandbox.install(
//!     ShadowMap::builder().add_shadow_class(shadow.into()).build(),
//!     Interceptors::new(),
//! )?;
//! sandbox.activate()?;
//!
//! let class = sandbox.load_class("app.Button")?;
//! let obj = class.new_instance(&[], vec![])?;
//! assert_eq!(class.call(obj, "label", &[], vec![])?, Value::str("shadowed"));
//!
//! sandbox.teardown();
//! # Ok(())
//! # }
//! ```

mod config;
pub mod scope;

use std::{fmt, sync::Arc};

use rayon::prelude::*;
use strum::Display;
use tracing::{debug, warn};

use crate::{
    code::CONSTRUCTOR_NAME,
    dispatch::{CallTarget, DispatchHandler, Interceptors, RegistrationHook, ShadowRegistration},
    rewriter::{InstrumentationPolicy, RewriteCache},
    runtime::{ClassSource, Heap, LoadedClass, MemoryClassSource, ModuleSpace, ObjectRef, Value, ValueKind},
    shadow::ShadowMap,
    DispatchError, Result,
};

pub use config::SandboxConfig;
pub use scope::SandboxScope;

/// Lifecycle state of a [`Sandbox`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SandboxState {
    /// Policy fixed, nothing installed
    Created,
    /// Shadow map and interceptors installed
    Configured,
    /// Classes may be loaded and executed
    Active,
    /// Released; unusable
    TornDown,
}

/// Counters describing what a sandbox has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SandboxStats {
    /// Classes defined in the module space
    pub classes_loaded: usize,
    /// Classes that were instrumented when defined
    pub rewrites: u64,
    /// Class loads answered from the rewrite cache
    pub cache_hits: u64,
    /// Live shadow bindings
    pub shadow_bindings: usize,
    /// Constructions that went through dispatch
    pub constructions: u64,
    /// Shadow classes that have had an instance created
    pub shadow_registrations: usize,
}

struct Installed {
    modules: Arc<ModuleSpace>,
    handler: Arc<DispatchHandler>,
}

/// One isolation unit.
pub struct Sandbox {
    policy: Arc<InstrumentationPolicy>,
    source: Arc<dyn ClassSource>,
    config: SandboxConfig,
    cache: Option<Arc<RewriteCache>>,
    on_registered: Option<RegistrationHook>,
    state: SandboxState,
    installed: Option<Installed>,
}

impl Sandbox {
    /// Creates a sandbox with the default configuration.
    ///
    /// # Errors
    /// Returns [`crate::RewriteError::PolicyConflict`] if the policy forces a class it also
    /// excludes.
    pub fn create(policy: InstrumentationPolicy, source: impl ClassSource + 'static) -> Result<Self> {
        Sandbox::builder(policy).source(source).build()
    }

    /// Starts configuring a sandbox.
    #[must_use]
    pub fn builder(policy: InstrumentationPolicy) -> SandboxBuilder {
        SandboxBuilder {
            policy,
            source: None,
            config: SandboxConfig::default(),
            cache: None,
            on_registered: None,
        }
    }

    fn require_state(&self, operation: &'static str, allowed: &[SandboxState]) -> Result<()> {
        if self.state == SandboxState::TornDown {
            return Err(DispatchError::UsageAfterTeardown.into());
        }
        if !allowed.contains(&self.state) {
            return Err(DispatchError::InvalidState {
                operation,
                state: self.state.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn active(&self, operation: &'static str) -> Result<&Installed> {
        self.require_state(operation, &[SandboxState::Active])?;
        self.installed.as_ref().ok_or_else(|| {
            DispatchError::InvalidState {
                operation,
                state: self.state.to_string(),
            }
            .into()
        })
    }

    /// Installs a shadow map and interceptor table into a new dispatch handler.
    ///
    /// Allowed before activation; installing again replaces the earlier configuration.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidState`] once active and
    /// [`DispatchError::UsageAfterTeardown`] after teardown.
    pub fn install(&mut self, shadow_map: ShadowMap, interceptors: Interceptors) -> Result<()> {
        self.require_state("install", &[SandboxState::Created, SandboxState::Configured])?;

        let modules = Arc::new(ModuleSpace::new(
            self.source.clone(),
            self.policy.clone(),
            self.cache.clone(),
        ));
        let generation = shadow_map.generation();
        let mut handler = DispatchHandler::new(
            modules.clone(),
            Arc::new(Heap::new()),
            Arc::new(shadow_map),
            Arc::new(interceptors),
            self.config.platform_version,
            self.config.limits(),
        );
        if let Some(hook) = &self.on_registered {
            handler = handler.on_shadow_registered(hook.clone());
        }

        self.installed = Some(Installed {
            modules,
            handler: Arc::new(handler),
        });
        self.state = SandboxState::Configured;
        debug!(
            generation,
            platform_version = self.config.platform_version,
            "sandbox configured"
        );
        Ok(())
    }

    /// Rewrites and defines every forced class, then makes the sandbox active.
    ///
    /// Forced classes are rewritten in parallel and defined only if all of them succeed.
    /// On failure the sandbox is torn down and the rewrite error returned, so no partially
    /// instrumented sandbox ever becomes active.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidState`] unless configured, and the first rewrite
    /// error of a forced class.
    pub fn activate(&mut self) -> Result<()> {
        self.require_state("activate", &[SandboxState::Configured])?;
        let Some(installed) = &self.installed else {
            return Err(DispatchError::InvalidState {
                operation: "activate",
                state: self.state.to_string(),
            }
            .into());
        };

        let modules = installed.modules.clone();
        let forced: Vec<&String> = self.policy.forced().iter().collect();
        let prepared: Result<Vec<Option<Arc<LoadedClass>>>> =
            forced.par_iter().map(|name| modules.prepare(name)).collect();

        match prepared {
            Ok(classes) => {
                let preloaded = classes.iter().flatten().count();
                modules.define_all(classes.into_iter().flatten().collect());
                self.state = SandboxState::Active;
                debug!(preloaded, "sandbox active");
                Ok(())
            }
            Err(error) => {
                warn!(%error, "activation failed, tearing sandbox down");
                self.teardown();
                Err(error)
            }
        }
    }

    /// Binds this sandbox to the current thread until the guard is dropped.
    ///
    /// # Errors
    /// Fails unless the sandbox is active.
    pub fn enter(&self) -> Result<SandboxScope> {
        Ok(scope::enter(self.active("enter")?.handler.clone()))
    }

    /// Runs `f` with this sandbox bound to the current thread.
    ///
    /// # Errors
    /// Fails unless the sandbox is active, and relays errors of `f`.
    pub fn run<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _scope = self.enter()?;
        f()
    }

    /// Loads `name`, rewriting it on first load.
    ///
    /// # Errors
    /// Returns [`DispatchError::UsageAfterTeardown`] after teardown,
    /// [`DispatchError::InvalidState`] before activation, and load or rewrite errors.
    pub fn load_class(&self, name: &str) -> Result<ClassHandle> {
        let installed = self.active("load_class")?;
        let class = installed.modules.load(name)?;
        Ok(ClassHandle {
            handler: installed.handler.clone(),
            class,
        })
    }

    /// Loads `name` relative to `package`; see [`resolve_class_name`].
    ///
    /// # Errors
    /// Same as [`Sandbox::load_class`].
    pub fn resolve_class(&self, package: &str, name: &str) -> Result<ClassHandle> {
        self.load_class(&resolve_class_name(package, name))
    }

    /// Platform version shadow mappings are resolved for.
    #[must_use]
    pub fn current_platform_version(&self) -> u32 {
        self.config.platform_version
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// The instrumentation policy.
    #[must_use]
    pub fn policy(&self) -> &InstrumentationPolicy {
        &self.policy
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The dispatch handler, once installed.
    ///
    /// # Errors
    /// Returns [`DispatchError::UsageAfterTeardown`] after teardown and
    /// [`DispatchError::InvalidState`] before installation.
    pub fn handler(&self) -> Result<Arc<DispatchHandler>> {
        self.require_state("handler", &[SandboxState::Configured, SandboxState::Active])?;
        self.installed
            .as_ref()
            .map(|installed| installed.handler.clone())
            .ok_or_else(|| {
                DispatchError::InvalidState {
                    operation: "handler",
                    state: self.state.to_string(),
                }
                .into()
            })
    }

    /// Shadow class registrations so far.
    #[must_use]
    pub fn registrations(&self) -> Vec<ShadowRegistration> {
        self.installed
            .as_ref()
            .map(|installed| installed.handler.registrations())
            .unwrap_or_default()
    }

    /// Current counters. All zero before installation and after teardown.
    #[must_use]
    pub fn stats(&self) -> SandboxStats {
        let Some(installed) = &self.installed else {
            return SandboxStats::default();
        };
        SandboxStats {
            classes_loaded: installed.modules.len(),
            rewrites: installed.modules.rewrites(),
            cache_hits: installed.modules.cache_hits(),
            shadow_bindings: installed.handler.binding_count(),
            constructions: installed.handler.constructions(),
            shadow_registrations: installed.handler.registrations().len(),
        }
    }

    /// Releases everything the sandbox owns. Later operations fail with
    /// [`DispatchError::UsageAfterTeardown`]; tearing down twice is a no-op.
    pub fn teardown(&mut self) {
        if self.state == SandboxState::TornDown {
            return;
        }
        if let Some(installed) = self.installed.take() {
            installed.handler.teardown();
            installed.modules.clear();
            scope::unbind_if(&installed.handler);
        }
        self.state = SandboxState::TornDown;
        debug!("sandbox torn down");
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Sandbox`].
pub struct SandboxBuilder {
    policy: InstrumentationPolicy,
    source: Option<Arc<dyn ClassSource>>,
    config: SandboxConfig,
    cache: Option<Arc<RewriteCache>>,
    on_registered: Option<RegistrationHook>,
}

impl SandboxBuilder {
    /// Sets where classes are loaded from. Defaults to an empty source.
    #[must_use]
    pub fn source(mut self, source: impl ClassSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Uses a source shared with other sandboxes.
    #[must_use]
    pub fn shared_source(mut self, source: Arc<dyn ClassSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the platform version.
    #[must_use]
    pub fn platform_version(mut self, version: u32) -> Self {
        self.config.platform_version = version;
        self
    }

    /// Uses `cache` instead of the process-wide rewrite cache.
    #[must_use]
    pub fn rewrite_cache(mut self, cache: Arc<RewriteCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Reports shadow class registrations to `hook`.
    #[must_use]
    pub fn on_shadow_registered<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ShadowRegistration) + Send + Sync + 'static,
    {
        self.on_registered = Some(Arc::new(hook));
        self
    }

    /// Validates the policy and creates the sandbox.
    ///
    /// # Errors
    /// Returns [`crate::RewriteError::PolicyConflict`] if the policy forces a class it also
    /// excludes.
    pub fn build(self) -> Result<Sandbox> {
        self.policy.validate()?;

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if self.config.use_rewrite_cache => Some(RewriteCache::global()),
            None => None,
        };

        debug!(
            policy = %self.policy.fingerprint(),
            platform_version = self.config.platform_version,
            "sandbox created"
        );
        Ok(Sandbox {
            policy: Arc::new(self.policy),
            source: self
                .source
                .unwrap_or_else(|| Arc::new(MemoryClassSource::new())),
            config: self.config,
            cache,
            on_registered: self.on_registered,
            state: SandboxState::Created,
            installed: None,
        })
    }
}

/// A class loaded into an active sandbox.
///
/// Calls made through the handle bind the sandbox to the calling thread for their duration
/// and go through dispatch, exactly as a rewritten call site would.
#[derive(Clone)]
pub struct ClassHandle {
    handler: Arc<DispatchHandler>,
    class: Arc<LoadedClass>,
}

impl ClassHandle {
    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.class.name()
    }

    /// Whether the defined code was instrumented.
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.class.is_instrumented()
    }

    /// The defined code object.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        self.class.code()
    }

    /// Declared method names, in declaration order.
    #[must_use]
    pub fn method_names(&self) -> Vec<&str> {
        self.class
            .image()
            .methods
            .iter()
            .map(|m| m.name.as_str())
            .collect()
    }

    fn target(&self, name: &str, params: &[ValueKind], instance: bool) -> Result<CallTarget> {
        if self.handler.is_torn_down() {
            return Err(DispatchError::UsageAfterTeardown.into());
        }
        let Some((class, index)) = self.handler.modules().find_method(self.name(), name, params)? else {
            return Err(DispatchError::MethodNotFound(format!("{}::{}", self.name(), name)).into());
        };
        let returns = class
            .image()
            .methods
            .get(index)
            .map_or(ValueKind::Void, |m| m.returns);
        Ok(if instance {
            CallTarget::instance_call(self.name(), name, params, returns)
        } else {
            CallTarget::static_call(self.name(), name, params, returns)
        })
    }

    /// Calls static method `name` through dispatch.
    ///
    /// # Errors
    /// Returns [`DispatchError::MethodNotFound`] if the class has no such method, and
    /// relays errors of whatever answers the call.
    pub fn call_static(&self, name: &str, params: &[ValueKind], args: Vec<Value>) -> Result<Value> {
        let target = self.target(name, params, false)?;
        let _scope = scope::enter(self.handler.clone());
        self.handler.invoke(&target, None, args)
    }

    /// Constructs an instance through dispatch.
    ///
    /// # Errors
    /// Relays errors of whatever answers the constructor.
    pub fn new_instance(&self, params: &[ValueKind], args: Vec<Value>) -> Result<ObjectRef> {
        let target = CallTarget::instance_call(self.name(), CONSTRUCTOR_NAME, params, ValueKind::Void);
        let _scope = scope::enter(self.handler.clone());
        self.handler.construct(&target, args)
    }

    /// Calls instance method `name` on `receiver` through dispatch.
    ///
    /// # Errors
    /// Returns [`DispatchError::MethodNotFound`] if the class has no such method, and
    /// relays errors of whatever answers the call.
    pub fn call(
        &self,
        receiver: ObjectRef,
        name: &str,
        params: &[ValueKind],
        args: Vec<Value>,
    ) -> Result<Value> {
        let target = self.target(name, params, true)?;
        let _scope = scope::enter(self.handler.clone());
        self.handler.invoke(&target, Some(receiver), args)
    }

    /// Runs the original body of `name` declared on this class or its supers, bypassing
    /// dispatch.
    ///
    /// # Errors
    /// Returns [`DispatchError::MethodNotFound`] if there is no such body, and relays
    /// errors the body raises.
    pub fn call_directly(
        &self,
        receiver: Option<ObjectRef>,
        name: &str,
        params: &[ValueKind],
        args: Vec<Value>,
    ) -> Result<Value> {
        let _scope = scope::enter(self.handler.clone());
        self.handler.directly_on(self.name(), name, params, receiver, args)
    }
}

impl fmt::Debug for ClassHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassHandle")
            .field("name", &self.name())
            .field("instrumented", &self.is_instrumented())
            .finish_non_exhaustive()
    }
}

/// Resolves a possibly relative class name against `package`.
///
/// `.Foo` and `Foo` name `package.Foo`; any other dotted name is already absolute.
///
/// ```rust
/// use shadowbox::sandbox::resolve_class_name;
///
/// assert_eq!(resolve_class_name("app", ".Button"), "app.Button");
/// assert_eq!(resolve_class_name("app", "Button"), "app.Button");
/// assert_eq!(resolve_class_name("app", "lib.widget.Button"), "lib.widget.Button");
/// ```
#[must_use]
pub fn resolve_class_name(package: &str, name: &str) -> String {
    if let Some(relative) = name.strip_prefix('.') {
        format!("{package}.{relative}")
    } else if name.contains('.') || package.is_empty() {
        name.to_string()
    } else {
        format!("{package}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::counter_class, Error, RewriteError};

    fn sandbox() -> Sandbox {
        Sandbox::builder(InstrumentationPolicy::default())
            .source(crate::test::source_of(vec![counter_class("app.Counter")]))
            .config(SandboxConfig::strict())
            .build()
            .unwrap()
    }

    #[test]
    fn lifecycle_is_linear() {
        let mut sandbox = sandbox();
        assert_eq!(sandbox.state(), SandboxState::Created);
        assert!(matches!(
            sandbox.load_class("app.Counter"),
            Err(Error::Dispatch(DispatchError::InvalidState { operation: "load_class", .. }))
        ));
        assert!(sandbox.activate().is_err());

        sandbox.install(ShadowMap::default(), Interceptors::new()).unwrap();
        sandbox.install(ShadowMap::default(), Interceptors::new()).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Configured);

        sandbox.activate().unwrap();
        assert_eq!(sandbox.state(), SandboxState::Active);
        assert!(matches!(
            sandbox.install(ShadowMap::default(), Interceptors::new()),
            Err(Error::Dispatch(DispatchError::InvalidState { operation: "install", .. }))
        ));

        sandbox.teardown();
        sandbox.teardown();
        assert_eq!(sandbox.state(), SandboxState::TornDown);
        assert!(matches!(
            sandbox.install(ShadowMap::default(), Interceptors::new()),
            Err(Error::Dispatch(DispatchError::UsageAfterTeardown))
        ));
    }

    #[test]
    fn conflicting_policy_aborts_creation() {
        let policy = InstrumentationPolicy::builder()
            .do_not_touch("app.")
            .force("app.Counter")
            .build();
        assert!(matches!(
            Sandbox::create(policy, MemoryClassSource::new()),
            Err(Error::Rewrite(RewriteError::PolicyConflict { .. }))
        ));
    }

    #[test]
    fn forced_classes_are_preloaded() {
        let policy = InstrumentationPolicy::builder().force("app.Counter").build();
        let mut sandbox = Sandbox::builder(policy)
            .source(crate::test::source_of(vec![counter_class("app.Counter")]))
            .config(SandboxConfig::strict())
            .build()
            .unwrap();
        sandbox.install(ShadowMap::default(), Interceptors::new()).unwrap();
        sandbox.activate().unwrap();
        assert_eq!(sandbox.stats().classes_loaded, 1);
        assert_eq!(sandbox.stats().rewrites, 1);
    }

    #[test]
    fn state_names() {
        assert_eq!(SandboxState::TornDown.to_string(), "torn_down");
        assert_eq!(SandboxState::Active.to_string(), "active");
    }

    #[test]
    fn relative_names() {
        assert_eq!(resolve_class_name("", "Button"), "Button");
        assert_eq!(resolve_class_name("app.ui", ".Button"), "app.ui.Button");
    }
}
