//! Sandbox configuration.
//!
//! [`SandboxConfig`] is a plain struct with presets and `with_*` builder methods. It can also
//! be read from TOML, where every key is optional and missing keys keep their defaults:
//!
//! ```toml
//! platform_version = 28
//! max_call_depth = 256
//! max_instructions = 1000000
//! use_rewrite_cache = true
//! ```

use serde::{Deserialize, Serialize};

use crate::{runtime::ExecutionLimits, Error, Result};

/// Settings of one sandbox.
///
/// # Default Configuration
///
/// - platform version 1
/// - call depth limit of 512
/// - no instruction limit
/// - the process-wide rewrite cache is used
///
/// # Example
///
/// ```rust
/// use shadowbox::sandbox::SandboxConfig;
///
/// let config = SandboxConfig::strict().with_platform_version(28);
/// assert_eq!(config.platform_version, 28);
/// assert!(!config.use_rewrite_cache);
///
/// let config = SandboxConfig::from_toml_str("platform_version = 21").unwrap();
/// assert_eq!(config.platform_version, 21);
/// assert_eq!(config.max_call_depth, SandboxConfig::default().max_call_depth);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Platform version shadow mappings are resolved for.
    pub platform_version: u32,

    /// Maximum nesting of interpreted method bodies.
    pub max_call_depth: usize,

    /// Maximum instructions per outermost call, 0 for unlimited.
    pub max_instructions: u64,

    /// Share rewritten code through the process-wide rewrite cache.
    pub use_rewrite_cache: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            platform_version: 1,
            max_call_depth: 512,
            max_instructions: 0,
            use_rewrite_cache: true,
        }
    }
}

impl SandboxConfig {
    /// Tight limits and no shared cache, for tests that must not depend on earlier runs.
    #[must_use]
    pub fn strict() -> Self {
        SandboxConfig {
            max_call_depth: 64,
            max_instructions: 1_000_000,
            use_rewrite_cache: false,
            ..Default::default()
        }
    }

    /// Generous limits for long-running guest code.
    #[must_use]
    pub fn permissive() -> Self {
        SandboxConfig {
            max_call_depth: 4096,
            max_instructions: 0,
            ..Default::default()
        }
    }

    /// Sets the platform version.
    #[must_use]
    pub fn with_platform_version(mut self, version: u32) -> Self {
        self.platform_version = version;
        self
    }

    /// Sets the call depth limit.
    #[must_use]
    pub fn with_max_call_depth(mut self, max: usize) -> Self {
        self.max_call_depth = max;
        self
    }

    /// Sets the instruction limit, 0 for unlimited.
    #[must_use]
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }

    /// Enables or disables the process-wide rewrite cache.
    #[must_use]
    pub fn with_rewrite_cache(mut self, enabled: bool) -> Self {
        self.use_rewrite_cache = enabled;
        self
    }

    /// Reads a configuration from TOML.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for invalid TOML, unknown keys or mistyped values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// The interpreter limits this configuration implies.
    #[must_use]
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_call_depth: self.max_call_depth,
            max_instructions: self.max_instructions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        assert!(SandboxConfig::default().use_rewrite_cache);
        assert_eq!(SandboxConfig::strict().limits().max_call_depth, 64);
        assert_eq!(SandboxConfig::permissive().limits().max_instructions, 0);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = SandboxConfig::from_toml_str(
            "platform_version = 28\nmax_instructions = 500\nuse_rewrite_cache = false\n",
        )
        .unwrap();
        assert_eq!(
            config,
            SandboxConfig::default()
                .with_platform_version(28)
                .with_max_instructions(500)
                .with_rewrite_cache(false)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            SandboxConfig::from_toml_str("sdk = 3"),
            Err(Error::Configuration(_))
        ));
    }
}
