//! Runtime configuration: container sizing, fsync policy, and cache capacity, loadable from a
//! `toml` file and layered with environment overrides the same way `utils::feature_flags` does.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::WaxError;
use crate::wal::FsyncPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "value")]
pub enum FsyncPolicyConfig {
    None,
    Always,
    EveryBytes(u64),
}

impl From<FsyncPolicyConfig> for FsyncPolicy {
    fn from(value: FsyncPolicyConfig) -> Self {
        match value {
            FsyncPolicyConfig::None => FsyncPolicy::None,
            FsyncPolicyConfig::Always => FsyncPolicy::Always,
            FsyncPolicyConfig::EveryBytes(n) => FsyncPolicy::EveryBytes(n),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaxConfig {
    pub wal_capacity_bytes: u64,
    pub fsync_policy: FsyncPolicyConfig,
    pub embedding_cache_capacity: usize,
    pub default_vector_dimensions: Option<usize>,
}

impl Default for WaxConfig {
    fn default() -> Self {
        Self {
            wal_capacity_bytes: crate::container::DEFAULT_WAL_CAPACITY,
            fsync_policy: FsyncPolicyConfig::Always,
            embedding_cache_capacity: 4096,
            default_vector_dimensions: None,
        }
    }
}

impl WaxConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WaxError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| WaxError::DecodingError(format!("invalid config toml: {e}")))
    }

    /// Layers environment overrides over `defaults`: `WAX_WAL_CAPACITY_BYTES`,
    /// `WAX_FSYNC_POLICY` (`none` | `always` | an integer byte count for `every_bytes`),
    /// `WAX_EMBEDDING_CACHE_CAPACITY`.
    #[must_use]
    pub fn from_env_and_defaults(mut defaults: Self) -> Self {
        if let Ok(val) = std::env::var("WAX_WAL_CAPACITY_BYTES") {
            if let Ok(n) = val.parse() {
                defaults.wal_capacity_bytes = n;
            }
        }
        if let Ok(val) = std::env::var("WAX_FSYNC_POLICY") {
            defaults.fsync_policy = match val.as_str() {
                "none" => FsyncPolicyConfig::None,
                "always" => FsyncPolicyConfig::Always,
                n => n.parse().map(FsyncPolicyConfig::EveryBytes).unwrap_or(defaults.fsync_policy),
            };
        }
        if let Ok(val) = std::env::var("WAX_EMBEDDING_CACHE_CAPACITY") {
            if let Ok(n) = val.parse() {
                defaults.embedding_cache_capacity = n;
            }
        }
        defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_container_default_wal_capacity() {
        let config = WaxConfig::default();
        assert_eq!(config.wal_capacity_bytes, crate::container::DEFAULT_WAL_CAPACITY);
        assert_eq!(config.fsync_policy, FsyncPolicyConfig::Always);
    }

    #[test]
    #[allow(unsafe_code)]
    fn env_override_replaces_wal_capacity() {
        // SAFETY: test runs single-threaded within this process's env for this var.
        unsafe {
            std::env::set_var("WAX_WAL_CAPACITY_BYTES", "65536");
        }
        let config = WaxConfig::from_env_and_defaults(WaxConfig::default());
        unsafe {
            std::env::remove_var("WAX_WAL_CAPACITY_BYTES");
        }
        assert_eq!(config.wal_capacity_bytes, 65536);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = WaxConfig { wal_capacity_bytes: 1024, fsync_policy: FsyncPolicyConfig::EveryBytes(512), embedding_cache_capacity: 10, default_vector_dimensions: Some(384) };
        let text = toml::to_string(&config).unwrap();
        let decoded: WaxConfig = toml::from_str(&text).unwrap();
        assert_eq!(decoded.wal_capacity_bytes, 1024);
        assert_eq!(decoded.fsync_policy, FsyncPolicyConfig::EveryBytes(512));
    }
}
