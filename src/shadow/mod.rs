//! Shadow classes and the versioned map that assigns them to real classes.
//!
//! - [`ShadowClass`] holds the replacement operations and the per-instance state factory
//! - [`ShadowMap`] decides which shadow class answers for a real class at a given platform
//!   version, and carries the generation counter cached dispatch decisions are checked
//!   against

mod class;
mod map;

pub use class::{MethodKey, ShadowClass};
pub use map::{InvalidationToken, ShadowMap, ShadowMapBuilder, ShadowMapping, VersionRange};
