use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use dashmap::DashMap;
use sha1::{Digest, Sha1};

use crate::{
    rewriter::{rewrite, InstrumentationPolicy, PolicyFingerprint},
    RewriteError,
};

struct CacheEntry {
    input_digest: [u8; 20],
    output: Arc<[u8]>,
}

/// Rewritten-code cache keyed by `(class name, policy fingerprint)`.
///
/// Entries also remember a digest of the input they were produced from, and are only
/// reused when the input matches. The cache is an optimization: an empty cache, or no cache
/// at all, produces the same results.
///
/// A process-wide instance is available through [`RewriteCache::global`]; sandboxes share
/// it unless configured otherwise.
#[derive(Default)]
pub struct RewriteCache {
    entries: DashMap<(String, PolicyFingerprint), CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RewriteCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn global() -> Arc<RewriteCache> {
        static GLOBAL: OnceLock<Arc<RewriteCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(RewriteCache::new())).clone()
    }

    /// Returns the cached rewrite of `raw`, computing and storing it on a miss.
    ///
    /// # Errors
    /// Propagates [`rewrite`] errors; failures are never cached.
    pub fn rewrite(
        &self,
        raw: &[u8],
        class_name: &str,
        policy: &InstrumentationPolicy,
    ) -> Result<Arc<[u8]>, RewriteError> {
        self.rewrite_with(raw, class_name, policy, policy.fingerprint())
            .map(|(output, _)| output)
    }

    pub(crate) fn rewrite_with(
        &self,
        raw: &[u8],
        class_name: &str,
        policy: &InstrumentationPolicy,
        fingerprint: PolicyFingerprint,
    ) -> Result<(Arc<[u8]>, bool), RewriteError> {
        let digest = input_digest(raw);
        let key = (class_name.to_string(), fingerprint);

        if let Some(entry) = self.entries.get(&key) {
            if entry.input_digest == digest {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok((entry.output.clone(), true));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let output: Arc<[u8]> = rewrite(raw, class_name, policy)?.into();
        self.entries.insert(
            key,
            CacheEntry {
                input_digest: digest,
                output: output.clone(),
            },
        );
        Ok((output, false))
    }

    /// Number of lookups answered from the cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of lookups that had to rewrite.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of cached classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all entries. Counters are kept.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn input_digest(raw: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(raw);
    let mut digest = [0_u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::counter_class;

    #[test]
    fn second_lookup_hits() {
        let cache = RewriteCache::new();
        let policy = InstrumentationPolicy::default();
        let raw = counter_class("app.Counter");

        let first = cache.rewrite(&raw, "app.Counter", &policy).unwrap();
        let second = cache.rewrite(&raw, "app.Counter", &policy).unwrap();
        assert_eq!(first, second);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn changed_input_is_not_reused() {
        let cache = RewriteCache::new();
        let policy = InstrumentationPolicy::default();
        let a = counter_class("app.Counter");
        let b = crate::test::caller_class("app.Counter", "app.Other");

        cache.rewrite(&a, "app.Counter", &policy).unwrap();
        let out = cache.rewrite(&b, "app.Counter", &policy).unwrap();
        assert_eq!(&*out, &rewrite(&b, "app.Counter", &policy).unwrap()[..]);
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn policies_do_not_share_entries() {
        let cache = RewriteCache::new();
        let raw = counter_class("app.Counter");
        let plain = InstrumentationPolicy::default();
        let excluding = InstrumentationPolicy::builder().do_not_touch("app.").build();

        let rewritten = cache.rewrite(&raw, "app.Counter", &plain).unwrap();
        let untouched = cache.rewrite(&raw, "app.Counter", &excluding).unwrap();
        assert_ne!(rewritten, untouched);
        assert_eq!(&*untouched, &raw[..]);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = RewriteCache::new();
        let policy = InstrumentationPolicy::default();
        assert!(cache.rewrite(b"junk", "app.Junk", &policy).is_err());
        assert!(cache.is_empty());
    }
}
