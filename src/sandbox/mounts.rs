//! Mount planning and validation.
//!
//! Every sandbox gets its group workspace, its IPC namespace, and (when
//! present) the runner source for its runtime. Anything further comes from
//! the group's `sandbox_config` and must survive the host allowlist plus a
//! hard deny-list of credential paths. The allowlist file lives outside the
//! project tree, so a sandbox can never widen its own permissions.

use std::path::{Path, PathBuf};

use relay_core::ipc::IPC_SUBDIRS;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Patterns that may never appear in a mounted path.
const DENY_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    ".netrc",
    ".npmrc",
    ".pypirc",
    ".env",
    "credentials",
    "id_rsa",
    "id_ed25519",
    "private_key",
];

/// One bind mount handed to the container engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host: PathBuf,
    pub guest: String,
    pub read_only: bool,
}

/// External allowlist controlling additional mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountAllowlist {
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default)]
    pub blocked_prefixes: Vec<String>,
    #[serde(default = "default_true")]
    pub non_main_read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default)]
    pub allow_read_write: bool,
}

/// Additional mount requested through a group's `sandbox_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraMount {
    pub host_path: String,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default = "default_true")]
    pub read_only: bool,
}

fn default_true() -> bool {
    true
}

/// Per-group sandbox settings carried in `RegisteredGroup::sandbox_config`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxSettings {
    #[serde(default)]
    pub extra_mounts: Vec<ExtraMount>,
    /// Hard-deadline override in milliseconds.
    pub deadline_ms: Option<u64>,
}

/// Load the allowlist, merging configured blocked prefixes. A missing or
/// unreadable file means additional mounts are refused outright.
pub fn load_allowlist(path: &Path, extra_blocked: &[String]) -> Option<MountAllowlist> {
    if !path.exists() {
        warn!(path = %path.display(), "mount allowlist not found, additional mounts disabled");
        return None;
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "mount allowlist unreadable, additional mounts disabled");
            return None;
        }
    };
    let mut allowlist: MountAllowlist = match serde_json::from_str(&raw) {
        Ok(a) => a,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "mount allowlist malformed, additional mounts disabled");
            return None;
        }
    };
    for prefix in extra_blocked {
        if !allowlist.blocked_prefixes.contains(prefix) {
            allowlist.blocked_prefixes.push(prefix.clone());
        }
    }
    info!(
        roots = allowlist.allowed_roots.len(),
        blocked = allowlist.blocked_prefixes.len(),
        "mount allowlist loaded"
    );
    Some(allowlist)
}

/// Build the full mount plan for one invocation. Creates the workspace and
/// IPC directories as a side effect.
pub fn build_mounts(
    folder: &str,
    is_main: bool,
    runtime: &str,
    project_root: &Path,
    groups_root: &Path,
    data_root: &Path,
    settings: Option<&SandboxSettings>,
    allowlist: Option<&MountAllowlist>,
) -> Vec<MountSpec> {
    let mut mounts = Vec::new();

    let group_dir = groups_root.join(folder);
    let _ = std::fs::create_dir_all(group_dir.join("logs"));
    mounts.push(MountSpec {
        host: group_dir,
        guest: "/workspace/group".into(),
        read_only: false,
    });

    if is_main {
        mounts.push(MountSpec {
            host: project_root.to_path_buf(),
            guest: "/workspace/project".into(),
            read_only: true,
        });
    } else {
        // Shared context is read-only outside the main group.
        let global_dir = groups_root.join("global");
        if global_dir.exists() {
            mounts.push(MountSpec {
                host: global_dir,
                guest: "/workspace/global".into(),
                read_only: true,
            });
        }
    }

    let ipc_dir = data_root.join("ipc").join(folder);
    for sub in IPC_SUBDIRS {
        let _ = std::fs::create_dir_all(ipc_dir.join(sub));
    }
    mounts.push(MountSpec {
        host: ipc_dir,
        guest: "/workspace/ipc".into(),
        read_only: false,
    });

    // Runner source is mounted over the image copy so edits on the host take
    // effect without a rebuild.
    let runner_src = project_root.join("agents").join(runtime).join("src");
    if runner_src.exists() {
        mounts.push(MountSpec {
            host: runner_src,
            guest: "/app/src".into(),
            read_only: true,
        });
    }

    if let Some(settings) = settings {
        if !settings.extra_mounts.is_empty() {
            match allowlist {
                Some(allowlist) => {
                    for request in &settings.extra_mounts {
                        match validate_extra_mount(request, is_main, allowlist) {
                            Ok(spec) => mounts.push(spec),
                            Err(reason) => {
                                warn!(folder, path = %request.host_path, reason, "extra mount rejected");
                            }
                        }
                    }
                }
                None => {
                    warn!(
                        folder,
                        count = settings.extra_mounts.len(),
                        "extra mounts requested but no allowlist loaded"
                    );
                }
            }
        }
    }

    mounts
}

/// Validate a single requested mount against the allowlist and deny-list.
pub fn validate_extra_mount(
    request: &ExtraMount,
    is_main: bool,
    allowlist: &MountAllowlist,
) -> Result<MountSpec, String> {
    let guest_name = match &request.guest_name {
        Some(name) => name.clone(),
        None => Path::new(&request.host_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mount".into()),
    };
    if guest_name.is_empty() || guest_name.contains("..") || guest_name.starts_with('/') {
        return Err(format!("invalid guest name \"{guest_name}\""));
    }

    // Resolve symlinks; a link into ~/.ssh must not pass as its link name.
    let real = std::fs::canonicalize(&request.host_path)
        .map_err(|_| format!("host path does not exist: \"{}\"", request.host_path))?;
    let real_str = real.to_string_lossy();

    for prefix in &allowlist.blocked_prefixes {
        if real_str.starts_with(prefix.as_str()) {
            return Err(format!("path is under blocked prefix \"{prefix}\""));
        }
    }
    for component in real.components() {
        let part = component.as_os_str().to_string_lossy();
        if let Some(pattern) = DENY_PATTERNS.iter().find(|p| part.contains(*p)) {
            return Err(format!("path matches denied pattern \"{pattern}\""));
        }
    }

    let root = allowlist
        .allowed_roots
        .iter()
        .find(|root| {
            std::fs::canonicalize(relay_core::shellexpand(&root.path))
                .map(|r| real.starts_with(&r))
                .unwrap_or(false)
        })
        .ok_or_else(|| format!("path \"{real_str}\" is not under any allowed root"))?;

    let mut read_only = request.read_only;
    if !read_only {
        if !is_main && allowlist.non_main_read_only {
            read_only = true;
        } else if !root.allow_read_write {
            read_only = true;
        }
    }

    Ok(MountSpec {
        host: real,
        guest: format!("/workspace/extra/{guest_name}"),
        read_only,
    })
}
