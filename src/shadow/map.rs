//! Versioned real-class to shadow-class mapping.
//!
//! A [`ShadowMap`] is an ordered overlay of [`ShadowMapping`]s. It is immutable once built;
//! changing it means deriving a new builder with [`ShadowMap::new_builder`], which keeps the
//! existing entries and stamps the result with the next generation.
//!
//! Overlapping mappings for the same real class are resolved by builder order: the entry
//! added last wins wherever its version range applies. Narrower ranges get no preference.
//!
//! # Examples
//!
//! ```rust
//! use shadowbox::shadow::{ShadowMap, ShadowMapping};
//!
//! let defaults = ShadowMap::builder()
//!     .add(ShadowMapping::new("app.Button", "test.ButtonShadow", 1, 5)?)
//!     .build();
//! assert_eq!(defaults.generation(), 1);
//! assert_eq!(defaults.resolve_name("app.Button", 3)?, Some("test.ButtonShadow"));
//! assert_eq!(defaults.resolve_name("app.Button", 7)?, None);
//!
//! let custom = defaults
//!     .new_builder()
//!     .add(ShadowMapping::new("app.Button", "test.FancyButton", 3, 4)?)
//!     .build();
//! assert_eq!(custom.generation(), 2);
//! assert_eq!(custom.resolve_name("app.Button", 3)?, Some("test.FancyButton"));
//! assert_eq!(custom.resolve_name("app.Button", 5)?, Some("test.ButtonShadow"));
//! # Ok::<(), shadowbox::Error>(())
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{shadow::ShadowClass, DispatchError};

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Inclusive range of platform versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VersionRange {
    min: u32,
    max: u32,
}

impl VersionRange {
    /// Every platform version.
    pub const ANY: VersionRange = VersionRange {
        min: 0,
        max: u32::MAX,
    };

    /// Creates `[min, max]`.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidVersionRange`] if `min > max`.
    pub fn new(min: u32, max: u32) -> Result<Self, DispatchError> {
        if min > max {
            return Err(DispatchError::InvalidVersionRange { min, max });
        }
        Ok(VersionRange { min, max })
    }

    /// Lowest covered version.
    #[must_use]
    pub fn min(&self) -> u32 {
        self.min
    }

    /// Highest covered version.
    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Returns `true` if `version` lies in the range.
    #[must_use]
    pub fn contains(&self, version: u32) -> bool {
        self.min <= version && version <= self.max
    }

    /// Returns `true` if every version of `other` lies in this range.
    #[must_use]
    pub fn covers(&self, other: &VersionRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        VersionRange::ANY
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// One real-class to shadow-class association.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowMapping {
    real: String,
    shadow: String,
    versions: VersionRange,
    calls_real_code: bool,
    order: u64,
}

impl ShadowMapping {
    /// Maps `real` to `shadow` for platform versions `[min, max]`.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidVersionRange`] if `min > max`.
    pub fn new(real: &str, shadow: &str, min: u32, max: u32) -> Result<Self, DispatchError> {
        Ok(Self::with_range(real, shadow, VersionRange::new(min, max)?))
    }

    /// Maps `real` to `shadow` for every platform version.
    #[must_use]
    pub fn for_all_versions(real: &str, shadow: &str) -> Self {
        Self::with_range(real, shadow, VersionRange::ANY)
    }

    /// Maps `real` to `shadow` for an already validated range.
    #[must_use]
    pub fn with_range(real: &str, shadow: &str, versions: VersionRange) -> Self {
        ShadowMapping {
            real: real.to_string(),
            shadow: shadow.to_string(),
            versions,
            calls_real_code: true,
            order: 0,
        }
    }

    /// Sets whether operations the shadow does not implement run the original body.
    #[must_use]
    pub fn calls_real_code(mut self, calls_real_code: bool) -> Self {
        self.calls_real_code = calls_real_code;
        self
    }

    /// The real class.
    #[must_use]
    pub fn real(&self) -> &str {
        &self.real
    }

    /// The shadow class.
    #[must_use]
    pub fn shadow(&self) -> &str {
        &self.shadow
    }

    /// Applicable platform versions.
    #[must_use]
    pub fn versions(&self) -> VersionRange {
        self.versions
    }

    /// Whether unimplemented operations fall through to the original body.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        self.calls_real_code
    }

    /// Position in builder order. Higher values were added later.
    #[must_use]
    pub fn order(&self) -> u64 {
        self.order
    }
}

/// Cache-validity handle for results computed against one [`ShadowMap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InvalidationToken {
    map_id: u64,
    generation: u64,
}

impl InvalidationToken {
    /// Returns `true` if results cached under this token are still valid for `map`.
    #[must_use]
    pub fn is_current(&self, map: &ShadowMap) -> bool {
        self.map_id == map.id && self.generation == map.generation
    }

    /// Generation the token was taken at.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Immutable, versioned overlay of shadow mappings plus their shadow class definitions.
#[derive(Clone, Debug)]
pub struct ShadowMap {
    id: u64,
    generation: u64,
    next_order: u64,
    entries: Vec<ShadowMapping>,
    classes: HashMap<String, Arc<ShadowClass>>,
}

impl Default for ShadowMap {
    /// An empty map at generation 0.
    fn default() -> Self {
        ShadowMap {
            id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            next_order: 0,
            entries: Vec::new(),
            classes: HashMap::new(),
        }
    }
}

impl ShadowMap {
    /// Starts a builder on an empty base.
    #[must_use]
    pub fn builder() -> ShadowMapBuilder {
        ShadowMap::default().new_builder()
    }

    /// Starts a builder that keeps this map's entries.
    #[must_use]
    pub fn new_builder(&self) -> ShadowMapBuilder {
        ShadowMapBuilder {
            base_generation: self.generation,
            next_order: self.next_order,
            entries: self.entries.clone(),
            classes: self.classes.clone(),
        }
    }

    /// Generation counter; 0 for an empty base, incremented by every build.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token for caching results computed against this map.
    #[must_use]
    pub fn token(&self) -> InvalidationToken {
        InvalidationToken {
            map_id: self.id,
            generation: self.generation,
        }
    }

    /// Resolves the mapping that answers for `real` at `version`.
    ///
    /// # Errors
    /// Returns [`DispatchError::AmbiguousShadowMapping`] if two covering entries carry the
    /// same builder order.
    pub fn resolve(
        &self,
        real: &str,
        version: u32,
    ) -> Result<Option<&ShadowMapping>, DispatchError> {
        let mut winner: Option<&ShadowMapping> = None;
        let mut tied: Option<&ShadowMapping> = None;

        for entry in self
            .entries
            .iter()
            .filter(|e| e.real == real && e.versions.contains(version))
        {
            match winner {
                Some(current) if entry.order < current.order => {}
                Some(current) if entry.order == current.order => tied = Some(entry),
                _ => {
                    winner = Some(entry);
                    tied = None;
                }
            }
        }

        if let (Some(first), Some(second)) = (winner, tied) {
            return Err(DispatchError::AmbiguousShadowMapping {
                class: real.to_string(),
                version,
                first: first.shadow.clone(),
                second: second.shadow.clone(),
            });
        }
        Ok(winner)
    }

    /// Resolves only the shadow class name.
    ///
    /// # Errors
    /// See [`ShadowMap::resolve`].
    pub fn resolve_name(&self, real: &str, version: u32) -> Result<Option<&str>, DispatchError> {
        Ok(self.resolve(real, version)?.map(ShadowMapping::shadow))
    }

    /// Registered definition of a shadow class.
    #[must_use]
    pub fn shadow_class(&self, name: &str) -> Option<&Arc<ShadowClass>> {
        self.classes.get(name)
    }

    /// All entries in builder order.
    #[must_use]
    pub fn mappings(&self) -> &[ShadowMapping] {
        &self.entries
    }

    /// Distinct real classes that carry at least one mapping, sorted by name.
    pub fn real_classes(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(|e| e.real.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds an entry without assigning builder order, to exercise ambiguity detection.
    #[cfg(test)]
    pub(crate) fn inject_unordered(&mut self, mapping: ShadowMapping) {
        self.entries.push(mapping);
    }
}

/// Builder for [`ShadowMap`].
#[derive(Clone, Debug)]
pub struct ShadowMapBuilder {
    base_generation: u64,
    next_order: u64,
    entries: Vec<ShadowMapping>,
    classes: HashMap<String, Arc<ShadowClass>>,
}

impl ShadowMapBuilder {
    /// Adds a mapping. It overrides earlier mappings of the same real class wherever the
    /// ranges overlap; earlier entries it fully covers are dropped.
    #[must_use]
    pub fn add(mut self, mut mapping: ShadowMapping) -> Self {
        mapping.order = self.next_order;
        self.next_order += 1;
        self.entries
            .retain(|e| e.real != mapping.real || !mapping.versions.covers(&e.versions));
        self.entries.push(mapping);
        self
    }

    /// Registers a shadow class definition and the mapping it declares.
    #[must_use]
    pub fn add_shadow_class(mut self, class: Arc<ShadowClass>) -> Self {
        let mapping = ShadowMapping::with_range(class.implements(), class.name(), class.versions())
            .calls_real_code(class.falls_through());
        self.classes.insert(class.name().to_string(), class);
        self.add(mapping)
    }

    /// Appends every entry and class definition of `other`, in `other`'s order, so they
    /// override this builder's entries.
    #[must_use]
    pub fn merge(mut self, other: &ShadowMap) -> Self {
        for (name, class) in &other.classes {
            self.classes.insert(name.clone(), class.clone());
        }
        for entry in &other.entries {
            self = self.add(entry.clone());
        }
        self
    }

    /// Finishes the map at the next generation.
    #[must_use]
    pub fn build(self) -> ShadowMap {
        ShadowMap {
            id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            generation: self.base_generation + 1,
            next_order: self.next_order,
            entries: self.entries,
            classes: self.classes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(real: &str, shadow: &str, min: u32, max: u32) -> ShadowMapping {
        ShadowMapping::new(real, shadow, min, max).unwrap()
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert_eq!(
            ShadowMapping::new("a.A", "s.A", 5, 1),
            Err(DispatchError::InvalidVersionRange { min: 5, max: 1 })
        );
    }

    #[test]
    fn later_entry_wins_over_narrower_one() {
        let map = ShadowMap::builder()
            .add(mapping("app.Button", "narrow", 3, 3))
            .add(mapping("app.Button", "wide", 1, 10))
            .build();
        assert_eq!(map.resolve_name("app.Button", 3).unwrap(), Some("wide"));
        // fully covered, so dropped
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn partial_override_keeps_the_rest() {
        let map = ShadowMap::builder()
            .add(mapping("app.Button", "base", 1, 10))
            .add(mapping("app.Button", "patch", 5, 20))
            .build();
        assert_eq!(map.resolve_name("app.Button", 2).unwrap(), Some("base"));
        assert_eq!(map.resolve_name("app.Button", 7).unwrap(), Some("patch"));
        assert_eq!(map.resolve_name("app.Button", 15).unwrap(), Some("patch"));
        assert_eq!(map.resolve_name("app.Button", 21).unwrap(), None);
    }

    #[test]
    fn generations_increase_along_derivations() {
        let first = ShadowMap::builder().build();
        let second = first.new_builder().build();
        let third = second.new_builder().build();
        assert_eq!(
            (first.generation(), second.generation(), third.generation()),
            (1, 2, 3)
        );
    }

    #[test]
    fn token_tracks_identity_and_generation() {
        let first = ShadowMap::builder().build();
        let token = first.token();
        assert!(token.is_current(&first));

        let derived = first.new_builder().build();
        assert!(!token.is_current(&derived));

        // same generation, different map
        let sibling = ShadowMap::builder().build();
        assert_eq!(sibling.generation(), first.generation());
        assert!(!token.is_current(&sibling));
    }

    #[test]
    fn merge_overrides_in_order() {
        let defaults = ShadowMap::builder()
            .add(mapping("app.Button", "default", 1, 10))
            .add(mapping("app.View", "view", 1, 10))
            .build();
        let overrides = ShadowMap::builder()
            .add(mapping("app.Button", "custom", 1, 10))
            .build();
        let merged = defaults.new_builder().merge(&overrides).build();
        assert_eq!(merged.resolve_name("app.Button", 4).unwrap(), Some("custom"));
        assert_eq!(merged.resolve_name("app.View", 4).unwrap(), Some("view"));
        assert_eq!(merged.real_classes().collect::<Vec<_>>(), ["app.Button", "app.View"]);
    }

    #[test]
    fn equal_order_is_ambiguous() {
        let mut map = ShadowMap::builder()
            .add(mapping("app.Button", "first", 1, 10))
            .build();
        map.inject_unordered(mapping("app.Button", "second", 1, 10));
        assert!(matches!(
            map.resolve("app.Button", 5),
            Err(DispatchError::AmbiguousShadowMapping { .. })
        ));
        // outside the injected entry's range nothing is ambiguous
        assert!(map.resolve("app.Button", 11).unwrap().is_none());
    }
}
