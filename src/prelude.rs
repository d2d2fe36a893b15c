//! # shadowbox Prelude
//!
//! This module provides the most commonly used types for setting up a sandbox, describing
//! shadows, and calling into loaded classes. Import it with `use shadowbox::prelude::*;`.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all shadowbox operations
pub use crate::Error;

/// The result type used throughout shadowbox
pub use crate::Result;

/// Rewriter and dispatch error categories
pub use crate::{DispatchError, RewriteError};

// ================================================================================================
// Sandbox
// ================================================================================================

pub use crate::sandbox::{ClassHandle, Sandbox, SandboxConfig, SandboxState, SandboxStats};

// ================================================================================================
// Instrumentation
// ================================================================================================

pub use crate::rewriter::{rewrite, InstrumentationPolicy, RewriteCache};

// ================================================================================================
// Shadows and Dispatch
// ================================================================================================

pub use crate::dispatch::{CallContext, CallTarget, Interceptors, MethodSignature};
pub use crate::shadow::{ShadowClass, ShadowMap, ShadowMapping, VersionRange};

// ================================================================================================
// Runtime and Code
// ================================================================================================

pub use crate::code::ClassBuilder;
pub use crate::runtime::{ClassSource, MemoryClassSource, ObjectRef, Value, ValueKind};
