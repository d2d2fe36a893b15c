//! Call dispatch: the indirection point rewritten call sites route through.
//!
//! # Key Components
//!
//! - [`DispatchHandler`] - Per-sandbox router deciding interceptor, shadow or original
//! - [`Interceptors`] - Exact-signature overrides consulted before shadow resolution
//! - [`BindingTable`] - Side table binding real instances (or classes) to shadow instances
//! - [`CallContext`] - What interceptors and shadow operations see of a call
//! - [`MethodSignature`] / [`CallTarget`] - Call-site descriptors
//!
//! The handler never wraps errors: anything raised by an interceptor, a shadow operation
//! or an original body reaches the caller unchanged.

mod binding;
mod context;
mod handler;
mod interceptor;
mod signature;

pub use binding::{BindingKey, BindingTable, ShadowInstance};
pub use context::{CallContext, DispatchFn};
pub use handler::{DispatchHandler, RegistrationHook, ShadowRegistration};
pub use interceptor::Interceptors;
pub use signature::{CallTarget, MethodSignature};
