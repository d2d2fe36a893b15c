//! Code rewriter.
//!
//! Rewriting turns every intercept-eligible call site of a class into a call through the
//! dispatch handler:
//!
//! | Original | Rewritten |
//! |----------|-----------|
//! | `call ref` | `invoke ref static` |
//! | `callvirt ref` | `invoke ref instance` |
//! | `newobj ref` | `invoke.new ref` |
//!
//! The handler receives the original target descriptor from the method-reference pool, so
//! the pool itself is never modified. Branches are re-resolved by decoding each body into an
//! instruction list and encoding it again, which keeps the transformation a pure function of
//! `(input, class name, policy)`: equal inputs always produce byte-identical outputs, which
//! is what makes [`RewriteCache`] sound.
//!
//! Rewritten images carry [`ClassFlags::INSTRUMENTED`]. Feeding such an image back into
//! [`rewrite`] is rejected with [`RewriteError::AlreadyInstrumented`].

mod cache;
mod policy;

pub use cache::RewriteCache;
pub use policy::{
    InstrumentationPolicy, InstrumentationPolicyBuilder, PolicyFingerprint, DEFAULT_DO_NOT_TOUCH,
};

use tracing::trace;

use crate::{
    code::{encode_body, CallKind, ClassFlags, ClassImage, Instruction},
    RewriteError,
};

/// Rewrites one class image according to `policy`.
///
/// Classes the policy does not instrument are returned byte-for-byte unchanged without
/// being parsed.
///
/// # Errors
///
/// - [`RewriteError::PolicyConflict`] if `class_name` is both excluded and forced
/// - [`RewriteError::MalformedInput`] if the image or one of its bodies cannot be decoded,
///   if it declares a different name than `class_name`, or if it already contains dispatch
///   opcodes without being flagged as instrumented
/// - [`RewriteError::AlreadyInstrumented`] if the image was rewritten before
///
/// # Examples
///
/// ```rust
/// use shadowbox::code::ClassBuilder;
/// use shadowbox::rewriter::{rewrite, InstrumentationPolicy};
/// use shadowbox::runtime::ValueKind;
///
/// let raw = ClassBuilder::new("platform.core.Widget")
///     .static_method("size", &[], ValueKind::Int, |asm| {
///         asm.call("platform.core.Metrics", "unit", &[], ValueKind::Int).ret();
///     })
///     .build()?;
///
/// let policy = InstrumentationPolicy::builder().do_not_touch("platform.core.").build();
/// assert_eq!(rewrite(&raw, "platform.core.Widget", &policy)?, raw);
/// # Ok::<(), shadowbox::Error>(())
/// ```
pub fn rewrite(
    raw: &[u8],
    class_name: &str,
    policy: &InstrumentationPolicy,
) -> Result<Vec<u8>, RewriteError> {
    if let Some(prefix) = policy.excluded_by(class_name) {
        if policy.is_forced(class_name) {
            return Err(RewriteError::PolicyConflict {
                class: class_name.to_string(),
                prefix: prefix.to_string(),
            });
        }
    }

    if !policy.should_instrument(class_name) {
        trace!(class = class_name, "class passes through unchanged");
        return Ok(raw.to_vec());
    }

    let malformed = |reason: String| RewriteError::MalformedInput {
        class: class_name.to_string(),
        reason,
    };

    let mut image = ClassImage::parse(raw).map_err(|e| malformed(e.to_string()))?;
    if image.name != class_name {
        return Err(malformed(format!("image declares class '{}'", image.name)));
    }
    if image.is_instrumented() {
        return Err(RewriteError::AlreadyInstrumented(class_name.to_string()));
    }

    let mut redirected = 0_usize;
    for method in image.methods.iter_mut().filter(|m| !m.is_native()) {
        let mut body = method
            .instructions()
            .map_err(|e| malformed(format!("method '{}': {}", method.name, e)))?;

        for instruction in &mut body {
            if instruction.is_dispatched() {
                return Err(malformed(format!(
                    "method '{}' contains '{}' but the class is not instrumented",
                    method.name, instruction
                )));
            }

            let Some(index) = instruction.method_ref() else {
                continue;
            };
            let target = image.pool.get(usize::from(index)).ok_or_else(|| {
                malformed(format!(
                    "method '{}' references missing pool entry {}",
                    method.name, index
                ))
            })?;
            if !policy.redirects(target) {
                continue;
            }

            *instruction = match instruction {
                Instruction::Call(_) => Instruction::Invoke {
                    method: index,
                    kind: CallKind::Static,
                },
                Instruction::Callvirt(_) => Instruction::Invoke {
                    method: index,
                    kind: CallKind::Instance,
                },
                _ => Instruction::InvokeNew(index),
            };
            redirected += 1;
        }

        method.code =
            encode_body(&body).map_err(|e| malformed(format!("method '{}': {}", method.name, e)))?;
    }

    image.flags |= ClassFlags::INSTRUMENTED;
    trace!(class = class_name, redirected, "rewrote class");
    image.to_bytes().map_err(|e| malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        code::{ClassBuilder, RefFlags},
        dispatch::MethodSignature,
        runtime::ValueKind,
        test::{caller_class, counter_class},
    };

    fn body_of(bytes: &[u8], method: &str) -> Vec<Instruction> {
        let image = ClassImage::parse(bytes).unwrap();
        image
            .methods
            .iter()
            .find(|m| m.name == method)
            .unwrap()
            .instructions()
            .unwrap()
    }

    #[test]
    fn excluded_class_is_byte_identical() {
        let raw = counter_class("platform.core.Widget");
        let policy = InstrumentationPolicy::builder()
            .do_not_touch("platform.core.")
            .build();
        assert_eq!(rewrite(&raw, "platform.core.Widget", &policy).unwrap(), raw);
    }

    #[test]
    fn excluded_garbage_passes_through() {
        let policy = InstrumentationPolicy::builder().do_not_touch("vendor.").build();
        assert_eq!(rewrite(b"junk", "vendor.Blob", &policy).unwrap(), b"junk");
    }

    #[test]
    fn calls_are_redirected() {
        let raw = caller_class("app.Caller", "app.Counter");
        let policy = InstrumentationPolicy::default();
        let out = rewrite(&raw, "app.Caller", &policy).unwrap();

        assert!(ClassImage::parse(&out).unwrap().is_instrumented());
        let body = body_of(&out, "run");
        assert!(body.contains(&Instruction::InvokeNew(0)));
        assert!(body.iter().any(|i| matches!(
            i,
            Instruction::Invoke {
                kind: CallKind::Instance,
                ..
            }
        )));
        assert!(!body
            .iter()
            .any(|i| matches!(i, Instruction::Call(_) | Instruction::Callvirt(_))));
    }

    #[test]
    fn intrinsic_calls_stay_unless_intercepted() {
        let raw = ClassBuilder::new("app.Clock")
            .static_method("read", &[], ValueKind::Int, |asm| {
                asm.call_intrinsic("sys.Time", "now", &[], ValueKind::Int).ret();
            })
            .build()
            .unwrap();

        let plain = InstrumentationPolicy::default();
        let out = rewrite(&raw, "app.Clock", &plain).unwrap();
        assert_eq!(body_of(&out, "read")[0], Instruction::Call(0));

        let intercepting = InstrumentationPolicy::builder()
            .intercept(MethodSignature::new("sys.Time", "now", &[]))
            .build();
        let out = rewrite(&raw, "app.Clock", &intercepting).unwrap();
        assert_eq!(
            body_of(&out, "read")[0],
            Instruction::Invoke {
                method: 0,
                kind: CallKind::Static
            }
        );
        assert!(ClassImage::parse(&out).unwrap().pool[0]
            .flags
            .contains(RefFlags::INTRINSIC));
    }

    #[test]
    fn rewriting_twice_is_rejected() {
        let raw = counter_class("app.Counter");
        let policy = InstrumentationPolicy::default();
        let once = rewrite(&raw, "app.Counter", &policy).unwrap();
        assert_eq!(
            rewrite(&once, "app.Counter", &policy),
            Err(RewriteError::AlreadyInstrumented("app.Counter".into()))
        );
    }

    #[test]
    fn output_is_deterministic() {
        let raw = caller_class("app.Caller", "app.Counter");
        let policy = InstrumentationPolicy::builder().with_default_exclusions().build();
        let a = rewrite(&raw, "app.Caller", &policy).unwrap();
        let b = rewrite(&raw, "app.Caller", &policy).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn name_mismatch_is_malformed() {
        let raw = counter_class("app.Counter");
        let result = rewrite(&raw, "app.Other", &InstrumentationPolicy::default());
        assert!(matches!(result, Err(RewriteError::MalformedInput { .. })));
    }

    #[test]
    fn truncated_input_is_malformed() {
        let raw = counter_class("app.Counter");
        let result = rewrite(&raw[..10], "app.Counter", &InstrumentationPolicy::default());
        assert!(matches!(result, Err(RewriteError::MalformedInput { .. })));
    }

    #[test]
    fn excluded_and_forced_conflicts() {
        let policy = InstrumentationPolicy::builder()
            .do_not_touch("platform.core.")
            .force("platform.core.Widget")
            .build();
        let raw = counter_class("platform.core.Widget");
        assert!(matches!(
            rewrite(&raw, "platform.core.Widget", &policy),
            Err(RewriteError::PolicyConflict { .. })
        ));
    }
}
