use std::{any::Any, sync::Arc};

use crate::{
    code::CONSTRUCTOR_NAME,
    dispatch::{BindingKey, CallTarget, DispatchHandler, ShadowInstance},
    runtime::{Heap, ObjectRef, Value, ValueKind},
    shadow::ShadowClass,
    DispatchError, Result,
};

/// Signature shared by interceptors and shadow operations.
pub type DispatchFn = Arc<dyn Fn(&mut CallContext<'_>) -> Result<Value> + Send + Sync>;

/// What an interceptor or shadow operation sees of the call it answers.
///
/// The context gives access to the receiver and arguments of the intercepted call, to the
/// bound shadow instance's state, and to the two ways back into real code: running the
/// original body of the current target ([`CallContext::call_original`]) or of any specific
/// operation ([`CallContext::directly_on`]). Both bypass dispatch, so a shadow that calls
/// its own original never re-enters itself.
pub struct CallContext<'a> {
    handler: &'a DispatchHandler,
    target: &'a CallTarget,
    receiver: Option<ObjectRef>,
    args: Vec<Value>,
    shadow: Option<Arc<ShadowInstance>>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        handler: &'a DispatchHandler,
        target: &'a CallTarget,
        receiver: Option<ObjectRef>,
        args: Vec<Value>,
        shadow: Option<Arc<ShadowInstance>>,
    ) -> Self {
        CallContext {
            handler,
            target,
            receiver,
            args,
            shadow,
        }
    }

    /// The intercepted call's original target.
    #[must_use]
    pub fn target(&self) -> &CallTarget {
        self.target
    }

    /// The receiver, `None` for static calls.
    #[must_use]
    pub fn receiver(&self) -> Option<ObjectRef> {
        self.receiver
    }

    /// The receiver of an instance call.
    ///
    /// # Errors
    /// Returns [`DispatchError::MissingReceiver`] for static calls.
    pub fn this(&self) -> Result<ObjectRef> {
        self.receiver
            .ok_or_else(|| DispatchError::MissingReceiver(self.target.signature.to_string()).into())
    }

    /// Arguments, receiver excluded.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Argument `index`.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidSlot`] if there is no such argument.
    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| DispatchError::InvalidSlot(u8::try_from(index).unwrap_or(u8::MAX)).into())
    }

    /// The shadow class answering this call, `None` inside an interceptor.
    #[must_use]
    pub fn shadow_class(&self) -> Option<&Arc<ShadowClass>> {
        self.shadow.as_ref().map(|s| s.class())
    }

    /// What the answering shadow instance is bound to.
    #[must_use]
    pub fn binding(&self) -> Option<&BindingKey> {
        self.shadow.as_ref().map(|s| s.key())
    }

    /// Runs `f` on the shadow instance's state.
    ///
    /// # Errors
    /// Returns [`DispatchError::ShadowStateType`] if there is no shadow instance or its
    /// state is not a `T`.
    pub fn with_state<T: Any, R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        match &self.shadow {
            Some(instance) => instance.with_state(f),
            None => Err(DispatchError::ShadowStateType(self.target.signature.to_string()).into()),
        }
    }

    /// The sandbox's object heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        self.handler.heap()
    }

    /// Reads `field` of the receiver.
    ///
    /// # Errors
    /// Fails for static calls and dead receivers.
    pub fn get_field(&self, field: &str) -> Result<Value> {
        self.handler.heap().get_field(self.this()?, field)
    }

    /// Writes `field` of the receiver.
    ///
    /// # Errors
    /// Fails for static calls and dead receivers.
    pub fn set_field(&self, field: &str, value: Value) -> Result<()> {
        self.handler.heap().set_field(self.this()?, field, value)
    }

    /// Runs the original body of the current target with the original arguments.
    ///
    /// # Errors
    /// Relays whatever the original body raises.
    pub fn call_original(&self) -> Result<Value> {
        self.handler
            .call_original(self.target, self.receiver, self.args.clone())
    }

    /// Runs the original body of the current target with different arguments.
    ///
    /// # Errors
    /// Relays whatever the original body raises.
    pub fn call_original_with(&self, args: Vec<Value>) -> Result<Value> {
        self.handler.call_original(self.target, self.receiver, args)
    }

    /// Runs the original body of `owner::name(params)` without dispatch and without
    /// virtual lookup.
    ///
    /// # Errors
    /// Returns [`DispatchError::MethodNotFound`] if the operation does not exist, and
    /// relays whatever the body raises.
    pub fn directly_on(
        &self,
        owner: &str,
        name: &str,
        params: &[ValueKind],
        receiver: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.handler.directly_on(owner, name, params, receiver, args)
    }

    /// Performs a normal dispatched call, as rewritten code would.
    ///
    /// # Errors
    /// Relays errors from whatever answers the call.
    pub fn invoke(
        &self,
        target: &CallTarget,
        receiver: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.handler.invoke(target, receiver, args)
    }

    /// Constructs a `class` instance through dispatch.
    ///
    /// # Errors
    /// Relays errors from the answering constructor.
    pub fn new_object(&self, class: &str, params: &[ValueKind], args: Vec<Value>) -> Result<ObjectRef> {
        let target = CallTarget::instance_call(class, CONSTRUCTOR_NAME, params, ValueKind::Void);
        self.handler.construct(&target, args)
    }

    /// Platform version the sandbox resolves shadows for.
    #[must_use]
    pub fn platform_version(&self) -> u32 {
        self.handler.platform_version()
    }
}
