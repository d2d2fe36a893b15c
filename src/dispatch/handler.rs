//! The dispatch handler every rewritten call flows through.
//!
//! A [`DispatchHandler`] belongs to exactly one sandbox. It owns the sandbox's shadow map,
//! interceptor table and binding table, and shares the sandbox's heap and module space.
//! For each dispatched call it makes one routing decision:
//!
//! 1. an interceptor registered for the exact signature answers unconditionally
//! 2. otherwise, if the owning class has no shadow at the sandbox's platform version, the
//!    original body runs
//! 3. otherwise the receiver (or the class, for static calls) is bound to a shadow
//!    instance and the shadow operation with the same name and shape answers
//! 4. if the shadow lacks that operation, the original body runs, or the default value is
//!    returned when the mapping does not call real code
//!
//! Errors raised by interceptors, shadow operations or original bodies are returned as-is.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

use crate::{
    code::{CallKind, CONSTRUCTOR_NAME},
    dispatch::{BindingKey, BindingTable, CallContext, CallTarget, Interceptors, ShadowInstance},
    runtime::{
        ExecutionLimits, Heap, Interpreter, LoadedClass, ModuleSpace, ObjectRef, Value, ValueKind,
    },
    shadow::{InvalidationToken, ShadowClass, ShadowMap, ShadowMapping},
    DispatchError, Result,
};

/// Callback run the first time an instance of a shadow class is created.
pub type RegistrationHook = Arc<dyn Fn(&ShadowRegistration) + Send + Sync>;

/// Record of the first instance created for a shadow class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowRegistration {
    /// Shadow class name
    pub shadow: String,
    /// Real class the shadow stands in for
    pub real: String,
    /// What the first instance was bound to
    pub key: BindingKey,
    /// Arena id of the first instance
    pub instance: usize,
}

/// Resolution result for one owning class, valid while its token is current.
struct ClassPlan {
    token: InvalidationToken,
    resolved: Option<(ShadowMapping, Arc<ShadowClass>)>,
}

/// Routes dispatched calls to interceptors, shadows or original code.
pub struct DispatchHandler {
    modules: Arc<ModuleSpace>,
    heap: Arc<Heap>,
    map: Arc<ShadowMap>,
    interceptors: Arc<Interceptors>,
    platform_version: u32,
    limits: ExecutionLimits,
    bindings: BindingTable,
    plans: DashMap<String, Arc<ClassPlan>>,
    registered: DashSet<String>,
    registrations: boxcar::Vec<ShadowRegistration>,
    on_registered: Option<RegistrationHook>,
    instances: DashSet<ObjectRef>,
    constructions: AtomicU64,
    torn_down: AtomicBool,
}

impl DispatchHandler {
    /// Creates a handler over a sandbox's module space and heap.
    #[must_use]
    pub fn new(
        modules: Arc<ModuleSpace>,
        heap: Arc<Heap>,
        map: Arc<ShadowMap>,
        interceptors: Arc<Interceptors>,
        platform_version: u32,
        limits: ExecutionLimits,
    ) -> Self {
        DispatchHandler {
            modules,
            heap,
            map,
            interceptors,
            platform_version,
            limits,
            bindings: BindingTable::new(),
            plans: DashMap::new(),
            registered: DashSet::new(),
            registrations: boxcar::Vec::new(),
            on_registered: None,
            instances: DashSet::new(),
            constructions: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Sets the callback reported on each shadow class registration.
    #[must_use]
    pub fn on_shadow_registered(mut self, hook: RegistrationHook) -> Self {
        self.on_registered = Some(hook);
        self
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(DispatchError::UsageAfterTeardown.into());
        }
        Ok(())
    }

    /// Dispatches a call to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UsageAfterTeardown`] after teardown, resolution errors such
    /// as [`DispatchError::AmbiguousShadowMapping`], and relays errors of whatever answers
    /// the call unchanged.
    pub fn invoke(
        &self,
        target: &CallTarget,
        receiver: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.ensure_live()?;
        if target.kind == CallKind::Instance && receiver.is_none() {
            return Err(DispatchError::MissingReceiver(target.signature.to_string()).into());
        }

        if let Some(interceptor) = self.interceptors.lookup(&target.signature) {
            trace!(call = %target.signature, "intercepted");
            let mut ctx = CallContext::new(self, target, receiver, args, None);
            return interceptor(&mut ctx);
        }

        let plan = self.plan(target.owner())?;
        let Some((mapping, shadow)) = &plan.resolved else {
            trace!(call = %target.signature, "unshadowed");
            return self.call_original(target, receiver, args);
        };

        let key = match receiver {
            Some(obj) => BindingKey::Instance(obj),
            None => BindingKey::Class(target.owner().to_string()),
        };
        let instance = self.bind(key, shadow)?;
        // An object reached through a shadowed superclass keeps the shadow it was bound to.
        let bound = instance.class().clone();
        let falls_through = if Arc::ptr_eq(&bound, shadow) {
            mapping.falls_through()
        } else {
            bound.falls_through()
        };

        if let Some(operation) = bound.find(target.name(), &target.signature.params) {
            trace!(call = %target.signature, shadow = bound.name(), "shadowed");
            let mut ctx = CallContext::new(self, target, receiver, args, Some(instance));
            let value = operation(&mut ctx)?;
            return conform(target, value);
        }

        if falls_through {
            trace!(call = %target.signature, shadow = bound.name(), "falls through");
            self.call_original(target, receiver, args)
        } else {
            Ok(target.returns.default_value())
        }
    }

    /// Allocates a `target.owner()` instance, registers it and dispatches its constructor.
    ///
    /// # Errors
    /// Same as [`DispatchHandler::invoke`].
    pub fn construct(&self, target: &CallTarget, args: Vec<Value>) -> Result<ObjectRef> {
        self.ensure_live()?;
        let obj = self.heap.alloc(target.owner());
        self.register_instance(obj);
        self.invoke(target, Some(obj), args)?;
        Ok(obj)
    }

    /// Allocates a `target.owner()` instance and runs its original constructor.
    ///
    /// # Errors
    /// Relays constructor errors.
    pub fn construct_original(&self, target: &CallTarget, args: Vec<Value>) -> Result<ObjectRef> {
        self.ensure_live()?;
        let obj = self.heap.alloc(target.owner());
        self.call_original(target, Some(obj), args)?;
        Ok(obj)
    }

    /// Records a newly constructed real instance.
    pub fn register_instance(&self, obj: ObjectRef) {
        self.constructions.fetch_add(1, Ordering::Relaxed);
        self.instances.insert(obj);
        trace!(object = %obj, "registered instance");
    }

    /// Runs the original body of `target`, bypassing interceptors and shadows.
    ///
    /// Instance calls are looked up from the receiver's runtime class, so overriding
    /// bodies in subclasses run as they would without dispatch. Constructors are not
    /// virtual, and a missing parameterless constructor is a no-op.
    ///
    /// # Errors
    /// Returns [`DispatchError::MethodNotFound`] if no body exists, and relays errors the
    /// body raises.
    pub fn call_original(
        &self,
        target: &CallTarget,
        receiver: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.ensure_live()?;
        let params = &target.signature.params;

        if target.name() == CONSTRUCTOR_NAME {
            return match self.modules.find_method(target.owner(), CONSTRUCTOR_NAME, params)? {
                Some((class, index)) => self.run(&class, index, receiver, args),
                None if params.is_empty() => Ok(Value::Void),
                None => Err(DispatchError::MethodNotFound(target.signature.to_string()).into()),
            };
        }

        if let (CallKind::Instance, Some(obj)) = (target.kind, receiver) {
            let runtime_class = self.heap.class_of(obj)?;
            if let Some((class, index)) = self.modules.find_method(&runtime_class, target.name(), params)? {
                return self.run(&class, index, receiver, args);
            }
        }

        match self.modules.find_method(target.owner(), target.name(), params)? {
            Some((class, index)) => self.run(&class, index, receiver, args),
            None => Err(DispatchError::MethodNotFound(target.signature.to_string()).into()),
        }
    }

    /// Runs the original body of `owner::name(params)` without dispatch and without
    /// virtual lookup.
    ///
    /// # Errors
    /// Returns [`DispatchError::MethodNotFound`] if no body exists, and relays errors the
    /// body raises.
    pub fn directly_on(
        &self,
        owner: &str,
        name: &str,
        params: &[ValueKind],
        receiver: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.ensure_live()?;
        match self.modules.find_method(owner, name, params)? {
            Some((class, index)) => self.run(&class, index, receiver, args),
            None => Err(DispatchError::MethodNotFound(format!("{owner}::{name}")).into()),
        }
    }

    fn run(
        &self,
        class: &Arc<LoadedClass>,
        index: usize,
        receiver: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let method = class
            .image()
            .methods
            .get(index)
            .ok_or_else(|| DispatchError::MethodNotFound(format!("{}#{}", class.name(), index)))?;

        let mut frame_args = Vec::with_capacity(args.len() + 1);
        if !method.is_static() {
            let obj = receiver.ok_or_else(|| {
                DispatchError::MissingReceiver(format!("{}::{}", class.name(), method.name))
            })?;
            frame_args.push(Value::Object(obj));
        }
        frame_args.extend(args);

        Interpreter::new(self, self.limits).execute(class, index, frame_args)
    }

    fn plan(&self, owner: &str) -> Result<Arc<ClassPlan>> {
        if let Some(plan) = self.plans.get(owner) {
            if plan.token.is_current(&self.map) {
                return Ok(plan.clone());
            }
        }

        let resolved = match self.map.resolve(owner, self.platform_version)? {
            Some(mapping) => {
                let class = self
                    .map
                    .shadow_class(mapping.shadow())
                    .cloned()
                    .ok_or_else(|| DispatchError::ShadowClassNotFound(mapping.shadow().to_string()))?;
                Some((mapping.clone(), class))
            }
            None => None,
        };

        let plan = Arc::new(ClassPlan {
            token: self.map.token(),
            resolved,
        });
        self.plans.insert(owner.to_string(), plan.clone());
        Ok(plan)
    }

    fn bind(&self, key: BindingKey, shadow: &Arc<ShadowClass>) -> Result<Arc<ShadowInstance>> {
        let (instance, created) = self.bindings.get_or_bind(key, shadow)?;
        if created && self.registered.insert(shadow.name().to_string()) {
            let registration = ShadowRegistration {
                shadow: shadow.name().to_string(),
                real: shadow.implements().to_string(),
                key: instance.key().clone(),
                instance: instance.id(),
            };
            debug!(
                shadow = %registration.shadow,
                real = %registration.real,
                "registered shadow class"
            );
            if let Some(hook) = &self.on_registered {
                hook(&registration);
            }
            self.registrations.push(registration);
        }
        Ok(instance)
    }

    /// Ends the handler: later calls fail with [`DispatchError::UsageAfterTeardown`].
    ///
    /// Bindings, cached plans and the heap are released.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bindings.clear();
        self.plans.clear();
        self.instances.clear();
        self.heap.clear();
        debug!("dispatch handler torn down");
    }

    /// Returns `true` after [`DispatchHandler::teardown`].
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// The shared object heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The module space original bodies are loaded from.
    #[must_use]
    pub fn modules(&self) -> &Arc<ModuleSpace> {
        &self.modules
    }

    /// The installed shadow map.
    #[must_use]
    pub fn shadow_map(&self) -> &ShadowMap {
        &self.map
    }

    /// The installed interceptors.
    #[must_use]
    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    /// Platform version shadows are resolved for.
    #[must_use]
    pub fn platform_version(&self) -> u32 {
        self.platform_version
    }

    /// Shadow instance bound to `obj`, if any.
    #[must_use]
    pub fn shadow_of(&self, obj: ObjectRef) -> Option<Arc<ShadowInstance>> {
        self.bindings.get(&BindingKey::Instance(obj))
    }

    /// Number of live shadow bindings.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Shadow class registrations, in the order they happened.
    #[must_use]
    pub fn registrations(&self) -> Vec<ShadowRegistration> {
        self.registrations.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Number of constructions that went through dispatch.
    #[must_use]
    pub fn constructions(&self) -> u64 {
        self.constructions.load(Ordering::Relaxed)
    }

    /// Returns `true` if `obj` was constructed through dispatch.
    #[must_use]
    pub fn is_registered(&self, obj: ObjectRef) -> bool {
        self.instances.contains(&obj)
    }

    /// Number of cached class resolution plans.
    #[must_use]
    pub fn cached_plans(&self) -> usize {
        self.plans.len()
    }
}

impl fmt::Debug for DispatchHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandler")
            .field("platform_version", &self.platform_version)
            .field("shadow_map_generation", &self.map.generation())
            .field("interceptors", &self.interceptors.len())
            .field("bindings", &self.bindings.len())
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

fn conform(target: &CallTarget, value: Value) -> Result<Value> {
    if target.returns == ValueKind::Void {
        return Ok(Value::Void);
    }
    if value.conforms_to(target.returns) {
        Ok(value)
    } else {
        Err(DispatchError::TypeMismatch {
            expected: target.returns.to_string(),
            found: value.kind().to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        dispatch::MethodSignature,
        rewriter::InstrumentationPolicy,
        runtime::MemoryClassSource,
        test::{counter_class, source_of},
        Error,
    };

    const LIMITS: ExecutionLimits = ExecutionLimits {
        max_call_depth: 64,
        max_instructions: 0,
    };

    fn handler(map: ShadowMap, interceptors: Interceptors, version: u32) -> DispatchHandler {
        let source: MemoryClassSource = source_of(vec![counter_class("app.Counter")]);
        let modules = Arc::new(ModuleSpace::new(
            Arc::new(source),
            Arc::new(InstrumentationPolicy::default()),
            None,
        ));
        DispatchHandler::new(
            modules,
            Arc::new(Heap::new()),
            Arc::new(map),
            Arc::new(interceptors),
            version,
            LIMITS,
        )
    }

    fn increment() -> CallTarget {
        CallTarget::instance_call("app.Counter", "increment", &[ValueKind::Int], ValueKind::Int)
    }

    fn ctor() -> CallTarget {
        CallTarget::instance_call("app.Counter", CONSTRUCTOR_NAME, &[], ValueKind::Void)
    }

    #[test]
    fn unshadowed_calls_run_original() {
        let handler = handler(ShadowMap::default(), Interceptors::new(), 1);
        let obj = handler.construct(&ctor(), vec![]).unwrap();
        assert_eq!(handler.invoke(&increment(), Some(obj), vec![Value::Int(5)]).unwrap(), Value::Int(5));
        assert_eq!(handler.invoke(&increment(), Some(obj), vec![Value::Int(2)]).unwrap(), Value::Int(7));
        assert_eq!(handler.binding_count(), 0);
        assert_eq!(handler.constructions(), 1);
        assert!(handler.is_registered(obj));
    }

    #[test]
    fn shadow_answers_and_binds_once() {
        let shadow = ShadowClass::new("test.CounterShadow", "app.Counter")
            .state(|| 0_i64)
            .method("increment", &[ValueKind::Int], |ctx| {
                let by = ctx.arg(0)?.as_int()?;
                ctx.with_state(|n: &mut i64| {
                    *n += by * 10;
                    Value::Int(*n)
                })
            });
        let map = ShadowMap::builder().add_shadow_class(Arc::new(shadow)).build();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let hook: RegistrationHook =
            Arc::new(move |r: &ShadowRegistration| hook_seen.lock().unwrap().push(r.shadow.clone()));
        let handler = handler(map, Interceptors::new(), 1).on_shadow_registered(hook);

        let obj = handler.construct(&ctor(), vec![]).unwrap();
        assert_eq!(handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]).unwrap(), Value::Int(10));
        assert_eq!(handler.invoke(&increment(), Some(obj), vec![Value::Int(2)]).unwrap(), Value::Int(30));
        assert_eq!(handler.binding_count(), 1);
        assert_eq!(handler.shadow_of(obj).unwrap().class().name(), "test.CounterShadow");

        let other = handler.construct(&ctor(), vec![]).unwrap();
        handler.invoke(&increment(), Some(other), vec![Value::Int(1)]).unwrap();
        assert_eq!(handler.binding_count(), 2);
        assert_eq!(handler.registrations().len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["test.CounterShadow".to_string()]);
    }

    #[test]
    fn interceptor_wins_over_shadow() {
        let shadow = ShadowClass::new("test.CounterShadow", "app.Counter")
            .method("increment", &[ValueKind::Int], |_| Ok(Value::Int(-1)));
        let map = ShadowMap::builder().add_shadow_class(Arc::new(shadow)).build();
        let interceptors = Interceptors::new().with(
            MethodSignature::new("app.Counter", "increment", &[ValueKind::Int]),
            |_| Ok(Value::Int(99)),
        );
        let handler = handler(map, interceptors, 1);
        let obj = handler.construct(&ctor(), vec![]).unwrap();
        assert_eq!(handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]).unwrap(), Value::Int(99));
    }

    #[test]
    fn shadow_without_real_code_returns_defaults() {
        let shadow = ShadowClass::new("test.CounterShadow", "app.Counter").calls_real_code(false);
        let map = ShadowMap::builder().add_shadow_class(Arc::new(shadow)).build();
        let handler = handler(map, Interceptors::new(), 1);
        let obj = handler.construct(&ctor(), vec![]).unwrap();
        assert_eq!(handler.invoke(&increment(), Some(obj), vec![Value::Int(4)]).unwrap(), Value::Int(0));
    }

    #[test]
    fn shadow_result_must_conform() {
        let shadow = ShadowClass::new("test.CounterShadow", "app.Counter")
            .method("increment", &[ValueKind::Int], |_| Ok(Value::str("nope")));
        let map = ShadowMap::builder().add_shadow_class(Arc::new(shadow)).build();
        let handler = handler(map, Interceptors::new(), 1);
        let obj = handler.construct(&ctor(), vec![]).unwrap();
        assert!(matches!(
            handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]),
            Err(Error::Dispatch(DispatchError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn mapping_without_definition() {
        let map = ShadowMap::builder()
            .add(ShadowMapping::for_all_versions("app.Counter", "test.Missing"))
            .build();
        let handler = handler(map, Interceptors::new(), 1);
        let obj = handler.construct_original(&ctor(), vec![]).unwrap();
        assert!(matches!(
            handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]),
            Err(Error::Dispatch(DispatchError::ShadowClassNotFound(_)))
        ));
    }

    #[test]
    fn plans_are_cached_per_class() {
        let handler = handler(ShadowMap::default(), Interceptors::new(), 1);
        let obj = handler.construct(&ctor(), vec![]).unwrap();
        handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]).unwrap();
        handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]).unwrap();
        assert_eq!(handler.cached_plans(), 1);
    }

    #[test]
    fn shadow_errors_are_relayed() {
        let shadow = ShadowClass::new("test.CounterShadow", "app.Counter")
            .method("increment", &[ValueKind::Int], |_| Err(Error::Shadow("boom".into())));
        let map = ShadowMap::builder().add_shadow_class(Arc::new(shadow)).build();
        let handler = handler(map, Interceptors::new(), 1);
        let obj = handler.construct(&ctor(), vec![]).unwrap();
        assert!(matches!(
            handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]),
            Err(Error::Shadow(message)) if message == "boom"
        ));
    }

    #[test]
    fn teardown_rejects_calls() {
        let handler = handler(ShadowMap::default(), Interceptors::new(), 1);
        let obj = handler.construct(&ctor(), vec![]).unwrap();
        handler.teardown();
        assert!(handler.is_torn_down());
        assert!(matches!(
            handler.invoke(&increment(), Some(obj), vec![Value::Int(1)]),
            Err(Error::Dispatch(DispatchError::UsageAfterTeardown))
        ));
        assert_eq!(handler.heap().object_count(), 0);
    }
}
