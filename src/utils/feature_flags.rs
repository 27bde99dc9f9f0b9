//! Runtime feature flags registry.
//!
//! A simple global registry of feature switches toggled at runtime via the CLI, independent
//! of Cargo compile-time features.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Clone, Debug)]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
    pub description: String,
}

static FLAGS: LazyLock<RwLock<HashMap<String, FeatureFlag>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "recovery.auto_recover".to_string(),
        FeatureFlag {
            name: "recovery.auto_recover".to_string(),
            enabled: true,
            description: "Attempt dual-header/TOC repair automatically on open().".to_string(),
        },
    );
    map.insert(
        "require_on_device_providers".to_string(),
        FeatureFlag {
            name: "require_on_device_providers".to_string(),
            enabled: false,
            description: "Reject EmbeddingProvider implementations that report a non on-device execution mode.".to_string(),
        },
    );
    map.insert(
        "telemetry.adv".to_string(),
        FeatureFlag {
            name: "telemetry.adv".to_string(),
            enabled: false,
            description: "Verbose structured search/commit diagnostics via dev6!.".to_string(),
        },
    );
    map.insert(
        "allow_timeline_fallback_override".to_string(),
        FeatureFlag {
            name: "allow_timeline_fallback_override".to_string(),
            enabled: false,
            description: "When enabled, suppresses the automatic timeline-lane fallback that otherwise \
                           activates for constraint-only queries (no free text, no embedding) carrying a \
                           time range or entity filter."
                .to_string(),
        },
    );
    RwLock::new(map)
});

/// Enable or disable a feature flag. Returns true if the flag existed.
pub fn set(name: &str, enabled: bool) -> bool {
    let mut g = FLAGS.write();
    if let Some(f) = g.get_mut(name) {
        f.enabled = enabled;
        true
    } else {
        false
    }
}

/// Ensure a feature exists (register if missing) with provided default and description.
pub fn ensure(name: &str, default_enabled: bool, description: &str) {
    let mut g = FLAGS.write();
    g.entry(name.to_string()).or_insert_with(|| FeatureFlag {
        name: name.to_string(),
        enabled: default_enabled,
        description: description.to_string(),
    });
}

/// Returns whether a feature is enabled (false if unknown).
pub fn is_enabled(name: &str) -> bool {
    FLAGS.read().get(name).is_some_and(|f| f.enabled)
}

/// Get a feature by name.
pub fn get(name: &str) -> Option<FeatureFlag> {
    FLAGS.read().get(name).cloned()
}

/// List all known feature flags.
pub fn list() -> Vec<FeatureFlag> {
    FLAGS.read().values().cloned().collect()
}

/// Convenience accessor used by `container::recovery` on open.
pub fn recovery_auto_recover() -> bool {
    is_enabled("recovery.auto_recover")
}

/// Initialize runtime feature flags from environment variables.
/// - `WAX_REQUIRE_ON_DEVICE`: "1"/"true"/"yes" enables `require_on_device_providers`.
/// - `WAX_TELEMETRY_ADV`: "1"/"true"/"yes" enables `telemetry.adv`.
pub fn init_from_env() {
    if let Ok(v) = std::env::var("WAX_REQUIRE_ON_DEVICE") {
        let val = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        let _ = set("require_on_device_providers", val);
    }
    if let Ok(v) = std::env::var("WAX_TELEMETRY_ADV") {
        let val = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        let _ = set("telemetry.adv", val);
    }
}
