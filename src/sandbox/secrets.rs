//! Secret loading and engine argument assembly.
//!
//! Secrets reach a sandbox through its stdin document only. They are read
//! fresh per invocation from the project `.env` (falling back to the
//! daemon's own environment) and are never placed in mounted files or the
//! container environment.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use super::mounts::MountSpec;

/// Collect the named secrets from `.env` and the process environment.
pub fn read_secrets(project_root: &Path, names: &[String]) -> HashMap<String, String> {
    let mut secrets = read_env_file(&project_root.join(".env"), names);
    for name in names {
        if secrets.contains_key(name) {
            continue;
        }
        if let Ok(value) = std::env::var(name) {
            if !value.trim().is_empty() {
                secrets.insert(name.clone(), value);
            }
        }
    }
    secrets
}

/// Parse a `.env` file for the requested keys. Nothing is exported into the
/// daemon's own environment.
fn read_env_file(path: &Path, names: &[String]) -> HashMap<String, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            debug!(path = %path.display(), ".env not found");
            return HashMap::new();
        }
    };

    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !names.iter().any(|n| n == key) {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        if !value.is_empty() {
            out.insert(key.to_string(), value.to_string());
        }
    }
    out
}

/// Assemble the container engine argument vector:
/// `run -i --rm --name {name} -e TZ=... -v host:guest[:ro]... {image}`.
pub fn engine_args(
    mounts: &[MountSpec],
    name: &str,
    image: &str,
    timezone: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-e".to_string(),
        format!("TZ={timezone}"),
    ];
    for mount in mounts {
        args.push("-v".to_string());
        let host = mount.host.to_string_lossy();
        if mount.read_only {
            args.push(format!("{host}:{}:ro", mount.guest));
        } else {
            args.push(format!("{host}:{}", mount.guest));
        }
    }
    args.push(image.to_string());
    args
}
