// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # shadowbox
//!
//! Load-time code rewriting and shadow dispatch for running test code against a class
//! library whose behavior is partly substituted.
//!
//! `shadowbox` loads classes in its own binary class format, rewrites their call sites on
//! load so that every intercept-eligible call goes through a dispatch handler, and lets
//! that handler decide per call whether an explicit interceptor, a "shadow" replacement,
//! or the original method body answers. Each run happens inside a [`sandbox::Sandbox`]
//! that owns its own rewritten classes, shadow configuration and object heap.
//!
//! ## Features
//!
//! - **Deterministic rewriting** - the same input and policy always give byte-identical
//!   output, so rewritten code is cached across sandboxes
//! - **Layered shadow maps** - versioned real-to-shadow mappings with last-added-wins
//!   override semantics and generation-based cache invalidation
//! - **Transparent fall-through** - unshadowed calls run the true original body
//! - **Escape hatches** - shadow code can run any original body directly
//! - **Isolation** - sandboxes share nothing and may run concurrently on separate threads
//!
//! ## Quick Start
//!
//! ```rust
//! use shadowbox::prelude::*;
//!
//! # fn main() -> shadowbox::Result<()> {
//! // A real class, assembled in code for the example
//! let clock = ClassBuilder::new("app.Clock")
//!     .static_method("now", &[], ValueKind::Int, |body| {
//!         body.ldc(1_700_000_000).ret();
//!     })
//!     .build()?;
//!
//! // Its shadow, answering `now()` with a fixed value
//! let frozen = ShadowClass::new("test.FrozenClock", "app.Clock")
//!     .method("now", &[], |_| Ok(Value::Int(42)));
//!
//! let mut sandbox = Sandbox::create(
//!     InstrumentationPolicy::default(),
//!     MemoryClassSource::new().with(clock)?,
//! )?;
//! sandbox.install(
//!     ShadowMap::builder().add_shadow_class(frozen.into()).build(),
//!     Interceptors::new(),
//! )?;
//! sandbox.activate()?;
//!
//! let clock = sandbox.load_class("app.Clock")?;
//! assert_eq!(clock.call_static("now", &[], vec![])?, Value::Int(42));
//! assert_eq!(
//!     clock.call_directly(None, "now", &[], vec![])?,
//!     Value::Int(1_700_000_000)
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`code`] - the class-image binary format and an assembler for it
//! - [`rewriter`] - instrumentation policy, the rewriter and its cache
//! - [`shadow`] - shadow classes and the versioned shadow map
//! - [`dispatch`] - the dispatch handler, interceptors and shadow bindings
//! - [`runtime`] - values, heap, class loading and the interpreter
//! - [`sandbox`] - the isolation unit and its lifecycle
//! - [`prelude`] - re-exports of the commonly used types
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Errors raised by guest code
//! ([`Error::Thrown`]) and by shadow code ([`Error::Shadow`]) are relayed through dispatch
//! unchanged:
//!
//! ```rust,no_run
//! use shadowbox::{DispatchError, Error, RewriteError};
//!
//! fn describe(err: &Error) -> String {
//!     match err {
//!         Error::Rewrite(RewriteError::PolicyConflict { class, .. }) => {
//!             format!("{class} is both forced and excluded")
//!         }
//!         Error::Dispatch(DispatchError::UsageAfterTeardown) => "sandbox is gone".into(),
//!         Error::Thrown(value) => format!("guest threw {value}"),
//!         other => other.to_string(),
//!     }
//! }
//! ```
#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use shadowbox::prelude::*;
///
/// let policy = InstrumentationPolicy::builder().with_default_exclusions().build();
/// assert!(!policy.should_instrument("shadowbox.Internal"));
/// ```
pub mod prelude;

pub mod code;
pub mod dispatch;
pub mod rewriter;
pub mod runtime;
pub mod sandbox;
pub mod shadow;

/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::{DispatchError, Error, RewriteError};
