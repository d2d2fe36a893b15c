//! Guest runtime: values, objects, loaded classes and the interpreter.
//!
//! This is the machinery a sandbox needs to actually run rewritten code: a [`Heap`] for
//! objects, a [`ModuleSpace`] that loads classes from a [`ClassSource`] through the
//! rewriter, and an [`Interpreter`] for method bodies.

mod heap;
mod interpreter;
mod loader;
mod value;

pub use heap::Heap;
pub use interpreter::{CallMode, CallRequest, ExecutionLimits, Frame, Interpreter, StepResult};
pub use loader::{ClassSource, LoadedClass, MemoryClassSource, ModuleSpace};
pub use value::{ObjectRef, Value, ValueKind};
