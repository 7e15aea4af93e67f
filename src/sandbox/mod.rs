//! Sandbox lifecycle: mount planning, secret injection, process spawn and
//! stream handling.

pub mod mounts;
pub mod runner;
pub mod secrets;

use std::collections::BTreeMap;

use relay_core::config::{Config, RuntimeProfile};
use relay_core::group::RegisteredGroup;

/// Deterministic process name used for stop requests, orphan cleanup, and
/// log correlation.
pub fn sandbox_name(folder: &str) -> String {
    let safe: String = folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("agent-{safe}-{}", chrono::Utc::now().timestamp_millis())
}

/// Name prefix matched during orphan cleanup.
pub const SANDBOX_NAME_PREFIX: &str = "agent-";

/// Resolve the runtime for a group: explicit group override, then the
/// runtime of the group's model, then the configured default.
pub fn resolve_runtime(group: &RegisteredGroup, config: &Config) -> String {
    if let Some(runtime) = &group.runtime {
        if config.runtimes.profiles.contains_key(runtime) {
            return runtime.clone();
        }
    }
    if let Some(model) = &group.model {
        if let Some(entry) = config.models.find(model) {
            if config.runtimes.profiles.contains_key(&entry.runtime) {
                return entry.runtime.clone();
            }
        }
    }
    config.runtimes.default_runtime.clone()
}

/// Image lookup for a runtime, falling back to the default profile.
pub fn image_for_runtime<'a>(
    profiles: &'a BTreeMap<String, RuntimeProfile>,
    runtime: &str,
    default_runtime: &str,
) -> Option<&'a str> {
    profiles
        .get(runtime)
        .or_else(|| profiles.get(default_runtime))
        .map(|p| p.image.as_str())
}
