//! Class sources and the loaded-module space.
//!
//! A [`ClassSource`] serves raw class images by name. The [`ModuleSpace`] of a sandbox
//! pulls images from its source on first use, passes them through the rewriter under the
//! sandbox's fixed policy, and defines the result. Each class is defined at most once per
//! module space; a class whose rewrite or decoding fails is never defined.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use tracing::trace;

use crate::{
    code::{ClassImage, Instruction, MethodDef},
    rewriter::{rewrite, InstrumentationPolicy, PolicyFingerprint, RewriteCache},
    runtime::ValueKind,
    DispatchError, Result, RewriteError,
};

/// Provider of raw class images.
pub trait ClassSource: Send + Sync {
    /// Raw image of `name`, or `None` if the source does not have it.
    fn find(&self, name: &str) -> Option<Vec<u8>>;

    /// Names of all classes this source can serve, if it can enumerate them.
    fn class_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory [`ClassSource`].
#[derive(Clone, Debug, Default)]
pub struct MemoryClassSource {
    classes: HashMap<String, Vec<u8>>,
}

impl MemoryClassSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an image under an explicit name, without inspecting it.
    pub fn insert(&mut self, name: &str, raw: Vec<u8>) {
        self.classes.insert(name.to_string(), raw);
    }

    /// Adds an image under the name it declares.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] if the image
    /// cannot be parsed.
    pub fn add(&mut self, raw: Vec<u8>) -> Result<()> {
        let name = ClassImage::parse(&raw)?.name;
        self.classes.insert(name, raw);
        Ok(())
    }

    /// Builder-style [`MemoryClassSource::add`].
    ///
    /// # Errors
    /// See [`MemoryClassSource::add`].
    pub fn with(mut self, raw: Vec<u8>) -> Result<Self> {
        self.add(raw)?;
        Ok(self)
    }
}

impl ClassSource for MemoryClassSource {
    fn find(&self, name: &str) -> Option<Vec<u8>> {
        self.classes.get(name).cloned()
    }

    fn class_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A class defined in a module space, with its method bodies decoded.
#[derive(Debug)]
pub struct LoadedClass {
    image: ClassImage,
    code: Arc<[u8]>,
    bodies: Vec<Option<Arc<[Instruction]>>>,
}

impl LoadedClass {
    /// Decodes `code` and every method body in it.
    fn define(name: &str, code: Arc<[u8]>) -> std::result::Result<Self, RewriteError> {
        let malformed = |reason: String| RewriteError::MalformedInput {
            class: name.to_string(),
            reason,
        };

        let image = ClassImage::parse(&code).map_err(|e| malformed(e.to_string()))?;
        if image.name != name {
            return Err(malformed(format!("image declares class '{}'", image.name)));
        }

        let mut bodies = Vec::with_capacity(image.methods.len());
        for method in &image.methods {
            if method.is_native() {
                bodies.push(None);
                continue;
            }
            let body = method
                .instructions()
                .map_err(|e| malformed(format!("method '{}': {}", method.name, e)))?;
            if let Some(index) = body
                .iter()
                .filter_map(Instruction::method_ref)
                .find(|i| usize::from(*i) >= image.pool.len())
            {
                return Err(malformed(format!(
                    "method '{}' references missing pool entry {}",
                    method.name, index
                )));
            }
            bodies.push(Some(body.into()));
        }

        Ok(LoadedClass {
            image,
            code,
            bodies,
        })
    }

    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.image.name
    }

    /// Super class name.
    #[must_use]
    pub fn super_name(&self) -> Option<&str> {
        self.image.super_name.as_deref()
    }

    /// Decoded image.
    #[must_use]
    pub fn image(&self) -> &ClassImage {
        &self.image
    }

    /// The bytes that were defined, after rewriting.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Returns `true` if the defined code was rewritten.
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.image.is_instrumented()
    }

    /// Finds a method declared by this class (supers are not searched).
    #[must_use]
    pub fn method(&self, name: &str, params: &[ValueKind]) -> Option<(usize, &MethodDef)> {
        self.image
            .methods
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name && m.params == params)
    }

    pub(crate) fn body(&self, index: usize) -> Option<&Arc<[Instruction]>> {
        self.bodies.get(index).and_then(Option::as_ref)
    }
}

/// The classes rewritten and defined under one sandbox.
pub struct ModuleSpace {
    source: Arc<dyn ClassSource>,
    policy: Arc<InstrumentationPolicy>,
    fingerprint: PolicyFingerprint,
    cache: Option<Arc<RewriteCache>>,
    classes: DashMap<String, Arc<LoadedClass>>,
    rewrites: AtomicU64,
    cache_hits: AtomicU64,
}

impl ModuleSpace {
    /// Creates an empty module space that loads from `source` under `policy`.
    pub fn new(
        source: Arc<dyn ClassSource>,
        policy: Arc<InstrumentationPolicy>,
        cache: Option<Arc<RewriteCache>>,
    ) -> Self {
        ModuleSpace {
            fingerprint: policy.fingerprint(),
            source,
            policy,
            cache,
            classes: DashMap::new(),
            rewrites: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Returns the defined class `name`, loading and rewriting it on first use.
    ///
    /// # Errors
    /// Returns [`DispatchError::ClassNotFound`] if the source does not have the class, or
    /// the rewrite error that prevented it from being defined.
    pub fn load(&self, name: &str) -> Result<Arc<LoadedClass>> {
        if let Some(class) = self.classes.get(name) {
            return Ok(class.clone());
        }

        let class = self
            .prepare(name)?
            .ok_or_else(|| DispatchError::ClassNotFound(name.to_string()))?;

        // Racing loaders produce identical classes; the first one defined is kept.
        Ok(self
            .classes
            .entry(name.to_string())
            .or_insert(class)
            .clone())
    }

    /// Rewrites and decodes `name` without defining it. `None` if the source lacks it.
    pub(crate) fn prepare(&self, name: &str) -> Result<Option<Arc<LoadedClass>>> {
        let Some(raw) = self.source.find(name) else {
            return Ok(None);
        };

        let code: Arc<[u8]> = match &self.cache {
            Some(cache) => {
                let (code, hit) = cache.rewrite_with(&raw, name, &self.policy, self.fingerprint)?;
                if hit {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
                code
            }
            None => rewrite(&raw, name, &self.policy)?.into(),
        };

        let class = LoadedClass::define(name, code)?;
        if class.is_instrumented() {
            self.rewrites.fetch_add(1, Ordering::Relaxed);
        }
        trace!(class = name, instrumented = class.is_instrumented(), "prepared class");
        Ok(Some(Arc::new(class)))
    }

    /// Defines already prepared classes.
    pub(crate) fn define_all(&self, classes: Vec<Arc<LoadedClass>>) {
        for class in classes {
            self.classes
                .entry(class.name().to_string())
                .or_insert(class);
        }
    }

    /// Looks up a method on `class` or its super classes, loading them as needed.
    ///
    /// # Errors
    /// Returns a load error for any class on the super chain.
    pub fn find_method(
        &self,
        class: &str,
        name: &str,
        params: &[ValueKind],
    ) -> Result<Option<(Arc<LoadedClass>, usize)>> {
        let mut current = Some(class.to_string());
        let mut depth = 0_usize;
        while let Some(class_name) = current {
            let loaded = self.load(&class_name)?;
            if let Some((index, _)) = loaded.method(name, params) {
                return Ok(Some((loaded, index)));
            }
            depth += 1;
            if depth > self.classes.len() + 1 {
                return Err(malformed_error!("Cyclic super chain at '{}'", class_name));
            }
            current = loaded.super_name().map(str::to_string);
        }
        Ok(None)
    }

    /// Returns `true` if `child` is `ancestor` or derives from it.
    ///
    /// # Errors
    /// Returns a load error for any class on the super chain.
    pub fn is_subclass(&self, child: &str, ancestor: &str) -> Result<bool> {
        let mut current = Some(child.to_string());
        let mut depth = 0_usize;
        while let Some(class_name) = current {
            if class_name == ancestor {
                return Ok(true);
            }
            depth += 1;
            if depth > self.classes.len() + 1 {
                return Err(malformed_error!("Cyclic super chain at '{}'", class_name));
            }
            current = self.load(&class_name)?.super_name().map(str::to_string);
        }
        Ok(false)
    }

    /// The defined class `name`, if it has been loaded.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<LoadedClass>> {
        self.classes.get(name).map(|c| c.clone())
    }

    /// The policy classes are rewritten under.
    #[must_use]
    pub fn policy(&self) -> &InstrumentationPolicy {
        &self.policy
    }

    /// The class source.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn ClassSource> {
        &self.source
    }

    /// Number of defined classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` if no class has been defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Number of defined classes that were rewritten.
    #[must_use]
    pub fn rewrites(&self) -> u64 {
        self.rewrites.load(Ordering::Relaxed)
    }

    /// Number of classes whose rewritten code came from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Drops every defined class.
    pub fn clear(&self) {
        self.classes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{caller_class, counter_class, source_of},
        Error,
    };

    fn space(source: MemoryClassSource, policy: InstrumentationPolicy) -> ModuleSpace {
        ModuleSpace::new(Arc::new(source), Arc::new(policy), None)
    }

    #[test]
    fn loads_once() {
        let space = space(
            source_of(vec![counter_class("app.Counter")]),
            InstrumentationPolicy::default(),
        );
        let a = space.load("app.Counter").unwrap();
        let b = space.load("app.Counter").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_instrumented());
        assert_eq!(space.rewrites(), 1);
    }

    #[test]
    fn missing_class() {
        let space = space(MemoryClassSource::new(), InstrumentationPolicy::default());
        assert!(matches!(
            space.load("app.Nope"),
            Err(Error::Dispatch(DispatchError::ClassNotFound(_)))
        ));
    }

    #[test]
    fn broken_class_is_never_defined() {
        let mut source = MemoryClassSource::new();
        source.insert("app.Broken", vec![0xFF; 8]);
        let space = space(source, InstrumentationPolicy::default());
        assert!(matches!(
            space.load("app.Broken"),
            Err(Error::Rewrite(RewriteError::MalformedInput { .. }))
        ));
        assert!(space.get("app.Broken").is_none());
    }

    #[test]
    fn method_lookup_walks_supers() {
        let derived = crate::code::ClassBuilder::new("app.Derived")
            .extends("app.Counter")
            .build()
            .unwrap();
        let space = space(
            source_of(vec![counter_class("app.Counter"), derived]),
            InstrumentationPolicy::default(),
        );
        let (owner, _) = space
            .find_method("app.Derived", "increment", &[ValueKind::Int])
            .unwrap()
            .unwrap();
        assert_eq!(owner.name(), "app.Counter");
        assert!(space.is_subclass("app.Derived", "app.Counter").unwrap());
        assert!(!space.is_subclass("app.Counter", "app.Derived").unwrap());
    }

    #[test]
    fn excluded_classes_are_defined_verbatim() {
        let raw = caller_class("platform.core.Widget", "app.Counter");
        let space = space(
            source_of(vec![raw.clone()]),
            InstrumentationPolicy::builder()
                .do_not_touch("platform.core.")
                .build(),
        );
        let class = space.load("platform.core.Widget").unwrap();
        assert_eq!(class.code(), &raw[..]);
        assert!(!class.is_instrumented());
        assert_eq!(space.rewrites(), 0);
    }
}
