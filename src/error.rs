use thiserror::Error;

use crate::runtime::Value;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into three groups:
///
/// ## Decoding Errors
/// - [`Error::Malformed`] - A code object could not be parsed
/// - [`Error::OutOfBounds`] - A read would have run past the end of the input
///
/// ## Engine Errors
/// - [`Error::Rewrite`] - The code rewriter refused or failed to transform a class
/// - [`Error::Dispatch`] - A sandbox or dispatch usage error
/// - [`Error::Configuration`] - A configuration document could not be read
/// - [`Error::LockError`] - A poisoned lock was encountered
///
/// ## Relayed Errors
/// - [`Error::Thrown`] - A value thrown by guest code with the `throw` instruction
/// - [`Error::Shadow`] - An error raised by shadow or interceptor code
///
/// Relayed errors travel through the dispatch handler unchanged. The handler never wraps
/// them into one of the engine categories, so a caller sees exactly what the original or
/// shadow implementation produced.
///
/// # Examples
///
/// ```rust,no_run
/// use shadowbox::{DispatchError, Error};
///
/// fn report(err: &Error) {
///     match err {
///         Error::Dispatch(DispatchError::UsageAfterTeardown) => eprintln!("sandbox is gone"),
///         Error::Thrown(value) => eprintln!("guest threw {value}"),
///         other => eprintln!("{other}"),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The code object is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing a code object.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The code rewriter failed.
    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    /// A sandbox or dispatch usage error.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Guest code executed `throw`; the thrown value is carried unchanged.
    #[error("Guest code threw {0}")]
    Thrown(Value),

    /// Shadow or interceptor code reported a failure.
    #[error("{0}")]
    Shadow(String),

    /// A configuration document could not be parsed.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Failed to lock target.
    ///
    /// This error occurs when a mutex or rwlock was poisoned by a panicking holder.
    #[error("Failed to lock target")]
    LockError,
}

/// Failures of the code rewriter.
///
/// All of these are fatal to sandbox setup: a class is either fully rewritten or never
/// defined.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// The input is not a well-formed code object, or it declares a different class name
    /// than the one it was loaded under.
    #[error("Malformed code object for '{class}': {reason}")]
    MalformedInput {
        /// Name the class was requested under
        class: String,
        /// What the decoder rejected
        reason: String,
    },

    /// The class matches a do-not-touch prefix and is also forced into the intercept set.
    #[error("Class '{class}' is excluded by prefix '{prefix}' but also forced into instrumentation")]
    PolicyConflict {
        /// The conflicting class name
        class: String,
        /// The do-not-touch prefix it matches
        prefix: String,
    },

    /// The input already carries the instrumented marker. Rewriting is applied exactly once
    /// per class per sandbox.
    #[error("Class '{0}' has already been instrumented")]
    AlreadyInstrumented(String),
}

/// Sandbox lifecycle and dispatch failures raised by the engine itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The sandbox was torn down and must not be used again.
    #[error("Sandbox has been torn down")]
    UsageAfterTeardown,

    /// Two mappings cover the same platform version without a builder-order tie-break.
    #[error("Ambiguous shadow mapping for '{class}' at platform version {version}: '{first}' vs '{second}'")]
    AmbiguousShadowMapping {
        /// The real class
        class: String,
        /// The platform version being resolved
        version: u32,
        /// First competing shadow class
        first: String,
        /// Second competing shadow class
        second: String,
    },

    /// A version range with `min > max`.
    #[error("Invalid version range [{min}, {max}]")]
    InvalidVersionRange {
        /// Lower bound
        min: u32,
        /// Upper bound
        max: u32,
    },

    /// The operation is not allowed in the sandbox's current state.
    #[error("Operation '{operation}' is not allowed while the sandbox is {state}")]
    InvalidState {
        /// The rejected operation
        operation: &'static str,
        /// The state the sandbox was in
        state: String,
    },

    /// Rewritten code ran on a thread with no sandbox bound.
    #[error("No sandbox is active on the current thread")]
    NoActiveSandbox,

    /// The class source has no class with this name.
    #[error("Class '{0}' not found")]
    ClassNotFound(String),

    /// No method with this name and parameter shape exists on the class or its supers.
    #[error("Method '{0}' not found")]
    MethodNotFound(String),

    /// A mapping names a shadow class with no registered definition.
    #[error("Shadow class '{0}' has no registered definition")]
    ShadowClassNotFound(String),

    /// An instance call was made without a receiver object.
    #[error("Instance call to '{0}' has no receiver")]
    MissingReceiver(String),

    /// The object handle does not refer to a live object.
    #[error("Unknown object reference #{0}")]
    UnknownObject(u64),

    /// A value had the wrong kind for the operation.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The expected value kind
        expected: String,
        /// The value that was found
        found: String,
    },

    /// Guest code needed more operands than the evaluation stack holds.
    #[error("Evaluation stack underflow")]
    StackUnderflow,

    /// Argument or local slot outside the frame.
    #[error("Invalid slot {0}")]
    InvalidSlot(u8),

    /// The configured call depth was exceeded.
    #[error("Maximum call depth of {0} exceeded")]
    CallDepthExceeded(usize),

    /// The configured instruction budget was exhausted.
    #[error("Instruction limit of {0} exceeded")]
    InstructionLimitExceeded(u64),

    /// Shadow state was requested with a type that does not match the shadow's state.
    #[error("Shadow state of '{0}' has a different type")]
    ShadowStateType(String),
}
