//! Instrumentation policy.
//!
//! The policy is fixed when a sandbox is created and decides, for every class the loader
//! defines, whether it is rewritten, and for every call site inside a rewritten class,
//! whether the call is routed through the dispatch handler.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{code::MethodRef, dispatch::MethodSignature, shadow::ShadowMap, RewriteError};

/// Namespaces the engine itself lives in. Rewriting them would route the dispatch machinery
/// through itself.
pub const DEFAULT_DO_NOT_TOUCH: &[&str] = &["shadowbox.", "sys."];

/// Which classes are rewritten and which call sites are redirected.
///
/// # Examples
///
/// ```rust
/// use shadowbox::rewriter::InstrumentationPolicy;
///
/// let policy = InstrumentationPolicy::builder()
///     .with_default_exclusions()
///     .do_not_touch("platform.core.")
///     .force("app.Legacy")
///     .build();
///
/// assert!(!policy.should_instrument("platform.core.Widget"));
/// assert!(policy.should_instrument("app.Button"));
/// assert!(policy.validate().is_ok());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentationPolicy {
    do_not_touch: Vec<String>,
    forced: BTreeSet<String>,
    instrument_only: Vec<String>,
    intercepted: BTreeSet<MethodSignature>,
}

impl InstrumentationPolicy {
    /// Starts an empty policy.
    #[must_use]
    pub fn builder() -> InstrumentationPolicyBuilder {
        InstrumentationPolicyBuilder {
            policy: InstrumentationPolicy::default(),
        }
    }

    /// Excluded name prefixes.
    #[must_use]
    pub fn do_not_touch(&self) -> &[String] {
        &self.do_not_touch
    }

    /// Classes forced into the intercept-eligible set.
    #[must_use]
    pub fn forced(&self) -> &BTreeSet<String> {
        &self.forced
    }

    /// Boundary-crossing signatures that are still routed through dispatch.
    #[must_use]
    pub fn intercepted(&self) -> &BTreeSet<MethodSignature> {
        &self.intercepted
    }

    /// The do-not-touch prefix `class_name` falls under, if any.
    #[must_use]
    pub fn excluded_by(&self, class_name: &str) -> Option<&str> {
        self.do_not_touch
            .iter()
            .find(|prefix| class_name.starts_with(prefix.as_str()))
            .map(String::as_str)
    }

    /// Returns `true` if `class_name` was explicitly forced.
    #[must_use]
    pub fn is_forced(&self, class_name: &str) -> bool {
        self.forced.contains(class_name)
    }

    /// Returns `true` if loading `class_name` rewrites it.
    ///
    /// Excluded classes are never rewritten. Otherwise a class is rewritten if it is forced,
    /// or if it matches the allow-list (an empty allow-list matches everything).
    #[must_use]
    pub fn should_instrument(&self, class_name: &str) -> bool {
        if self.excluded_by(class_name).is_some() {
            return false;
        }
        self.is_forced(class_name)
            || self.instrument_only.is_empty()
            || self
                .instrument_only
                .iter()
                .any(|prefix| class_name.starts_with(prefix.as_str()))
    }

    /// Returns `true` if a call to `target` inside a rewritten class goes through dispatch.
    ///
    /// Targets inside the loaded-module space are always redirected. Intrinsic targets and
    /// targets in do-not-touch namespaces cross the rewrite boundary and are only
    /// redirected when their signature is listed as intercepted.
    #[must_use]
    pub fn redirects(&self, target: &MethodRef) -> bool {
        if target.is_intrinsic() || self.excluded_by(&target.owner).is_some() {
            return self.intercepted.contains(&target.signature());
        }
        true
    }

    /// Checks that no forced class is also excluded.
    ///
    /// # Errors
    /// Returns [`RewriteError::PolicyConflict`] for the first conflicting class.
    pub fn validate(&self) -> Result<(), RewriteError> {
        for class in &self.forced {
            if let Some(prefix) = self.excluded_by(class) {
                return Err(RewriteError::PolicyConflict {
                    class: class.clone(),
                    prefix: prefix.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stable digest of the policy's canonical form.
    ///
    /// Prefix order and duplicates do not change the fingerprint; any change in meaning
    /// does.
    #[must_use]
    pub fn fingerprint(&self) -> PolicyFingerprint {
        fn update_str(hasher: &mut Sha1, value: &str) {
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }

        let canonical = |prefixes: &[String]| -> BTreeSet<String> {
            prefixes.iter().cloned().collect()
        };

        let mut hasher = Sha1::new();
        for (tag, section) in [
            (b'D', canonical(&self.do_not_touch)),
            (b'F', self.forced.clone()),
            (b'O', canonical(&self.instrument_only)),
        ] {
            hasher.update([tag]);
            hasher.update((section.len() as u64).to_le_bytes());
            for entry in &section {
                update_str(&mut hasher, entry);
            }
        }

        hasher.update([b'I']);
        hasher.update((self.intercepted.len() as u64).to_le_bytes());
        for signature in &self.intercepted {
            update_str(&mut hasher, &signature.owner);
            update_str(&mut hasher, &signature.name);
            hasher.update((signature.params.len() as u64).to_le_bytes());
            hasher.update(signature.params.iter().map(|k| *k as u8).collect::<Vec<_>>());
        }

        let mut digest = [0_u8; 20];
        digest.copy_from_slice(&hasher.finalize());
        PolicyFingerprint(digest)
    }
}

/// SHA-1 fingerprint of an [`InstrumentationPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyFingerprint([u8; 20]);

impl PolicyFingerprint {
    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PolicyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Builder for [`InstrumentationPolicy`].
#[derive(Clone, Debug)]
pub struct InstrumentationPolicyBuilder {
    policy: InstrumentationPolicy,
}

impl InstrumentationPolicyBuilder {
    /// Excludes every class whose name starts with `prefix`.
    #[must_use]
    pub fn do_not_touch(mut self, prefix: &str) -> Self {
        self.policy.do_not_touch.push(prefix.to_string());
        self
    }

    /// Excludes the engine's own namespaces, see [`DEFAULT_DO_NOT_TOUCH`].
    #[must_use]
    pub fn with_default_exclusions(mut self) -> Self {
        self.policy
            .do_not_touch
            .extend(DEFAULT_DO_NOT_TOUCH.iter().map(|p| (*p).to_string()));
        self
    }

    /// Forces `class_name` into the intercept-eligible set.
    #[must_use]
    pub fn force(mut self, class_name: &str) -> Self {
        self.policy.forced.insert(class_name.to_string());
        self
    }

    /// Forces every real class that carries a mapping in `map`.
    #[must_use]
    pub fn force_shadowed(mut self, map: &ShadowMap) -> Self {
        self.policy
            .forced
            .extend(map.real_classes().map(str::to_string));
        self
    }

    /// Restricts rewriting to classes starting with `prefix` (plus forced classes).
    #[must_use]
    pub fn instrument_only(mut self, prefix: &str) -> Self {
        self.policy.instrument_only.push(prefix.to_string());
        self
    }

    /// Routes a boundary-crossing call site through dispatch so an interceptor can answer
    /// it.
    #[must_use]
    pub fn intercept(mut self, signature: MethodSignature) -> Self {
        self.policy.intercepted.insert(signature);
        self
    }

    /// Finishes the policy. Use [`InstrumentationPolicy::validate`] to check it.
    #[must_use]
    pub fn build(self) -> InstrumentationPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{code::RefFlags, runtime::ValueKind};

    fn target(owner: &str, flags: RefFlags) -> MethodRef {
        MethodRef {
            owner: owner.to_string(),
            name: "now".to_string(),
            params: vec![],
            returns: ValueKind::Int,
            flags,
        }
    }

    #[test]
    fn conflict_is_detected() {
        let policy = InstrumentationPolicy::builder()
            .do_not_touch("platform.core.")
            .force("platform.core.Widget")
            .build();
        assert_eq!(
            policy.validate(),
            Err(RewriteError::PolicyConflict {
                class: "platform.core.Widget".into(),
                prefix: "platform.core.".into(),
            })
        );
    }

    #[test]
    fn allow_list_with_forced_class() {
        let policy = InstrumentationPolicy::builder()
            .instrument_only("app.")
            .force("lib.Helper")
            .build();
        assert!(policy.should_instrument("app.Button"));
        assert!(policy.should_instrument("lib.Helper"));
        assert!(!policy.should_instrument("lib.Other"));
    }

    #[test]
    fn boundary_targets_need_explicit_intercept() {
        let policy = InstrumentationPolicy::builder()
            .with_default_exclusions()
            .intercept(MethodSignature::new("sys.Clock", "now", &[]))
            .build();
        assert!(policy.redirects(&target("app.Clock", RefFlags::empty())));
        assert!(!policy.redirects(&target("app.Clock", RefFlags::INTRINSIC)));
        assert!(policy.redirects(&target("sys.Clock", RefFlags::INTRINSIC)));
        assert!(!policy.redirects(&target("shadowbox.Clock", RefFlags::empty())));
    }

    #[test]
    fn fingerprint_ignores_prefix_order() {
        let a = InstrumentationPolicy::builder()
            .do_not_touch("a.")
            .do_not_touch("b.")
            .build();
        let b = InstrumentationPolicy::builder()
            .do_not_touch("b.")
            .do_not_touch("a.")
            .do_not_touch("a.")
            .build();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_separates_sections() {
        let excluded = InstrumentationPolicy::builder().do_not_touch("app.").build();
        let allowed = InstrumentationPolicy::builder().instrument_only("app.").build();
        assert_ne!(excluded.fingerprint(), allowed.fingerprint());
        assert_eq!(excluded.fingerprint().to_string().len(), 40);
    }

    #[test]
    fn deserializes_from_toml() {
        let policy: InstrumentationPolicy = toml::from_str(
            r#"
            do_not_touch = ["platform.core."]
            forced = ["app.Legacy"]

            [[intercepted]]
            owner = "sys.Clock"
            name = "now"
            "#,
        )
        .unwrap();
        assert_eq!(policy.excluded_by("platform.core.X"), Some("platform.core."));
        assert!(policy.is_forced("app.Legacy"));
        assert!(policy
            .intercepted()
            .contains(&MethodSignature::new("sys.Clock", "now", &[])));
    }
}
