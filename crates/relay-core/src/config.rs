//! TOML configuration.
//!
//! Missing file falls back to defaults; missing sections fall back per
//! field. Secrets (bot tokens) come from the environment, never from the
//! config file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Top-level Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub relay: GeneralConfig,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub channel: ChannelConfig,
    pub runtimes: RuntimesConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub ipc: IpcConfig,
    pub mounts: MountPolicyConfig,
    pub query_adapter: QueryAdapterConfig,
    pub models: ModelCatalog,
}

/// General agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Assistant display name; `@{name}` is the default trigger token.
    pub name: String,
    /// Root for runtime data: IPC tree, sandbox session dirs.
    pub data_root: String,
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "Relay".into(),
            data_root: "data".into(),
            log_level: "info".into(),
        }
    }
}

/// HTTP surface location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Where the channel-adapter process reaches this daemon.
    pub callback_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7600".into(),
            callback_url: "http://127.0.0.1:7600".into(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection string, e.g. `sqlite:data/relay.db`.
    pub dsn: String,
    /// Per-group workspace root.
    pub groups_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite:data/relay.db".into(),
            groups_dir: "groups".into(),
        }
    }
}

/// Channel adapters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Overridden by `TELEGRAM_BOT_TOKEN` when set.
    pub bot_token: String,
}

/// Sandbox runtimes keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimesConfig {
    /// Container engine binary used to spawn sandboxes.
    pub engine: String,
    pub default_runtime: String,
    pub profiles: BTreeMap<String, RuntimeProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeProfile {
    pub image: String,
    pub default_model: String,
    /// Secret names injected via sandbox stdin.
    pub required_secrets: Vec<String>,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "claude".to_string(),
            RuntimeProfile {
                image: "relay-agent:latest".into(),
                default_model: "claude-opus-4-6".into(),
                required_secrets: vec!["CLAUDE_CODE_OAUTH_TOKEN".into()],
            },
        );
        profiles.insert(
            "gemini".to_string(),
            RuntimeProfile {
                image: "relay-agent-gemini:latest".into(),
                default_model: "gemini-3.1-pro".into(),
                required_secrets: vec![
                    "GEMINI_REFRESH_TOKEN".into(),
                    "GEMINI_OAUTH_CLIENT_ID".into(),
                    "GEMINI_OAUTH_CLIENT_SECRET".into(),
                ],
            },
        );
        profiles.insert(
            "codex".to_string(),
            RuntimeProfile {
                image: "relay-agent-codex:latest".into(),
                default_model: "gpt-5.3-codex".into(),
                required_secrets: vec![
                    "CODEX_OAUTH_ACCESS_TOKEN".into(),
                    "CODEX_OAUTH_REFRESH_TOKEN".into(),
                ],
            },
        );
        Self {
            engine: "docker".into(),
            default_runtime: "claude".into(),
            profiles,
        }
    }
}

/// Dispatch engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_sandboxes: usize,
    /// Message loop period.
    pub poll_interval_ms: u64,
    /// No meaningful frame for this long → IPC close sentinel.
    pub idle_timeout_ms: u64,
    /// From spawn; graceful stop, then forced kill.
    pub hard_deadline_ms: u64,
    /// Wait between the graceful stop request and the forced kill.
    pub stop_grace_ms: u64,
    /// How long shutdown waits for active sandboxes before detaching.
    pub shutdown_grace_ms: u64,
    pub main_group_folder: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sandboxes: 3,
            poll_interval_ms: 1000,
            idle_timeout_ms: 300_000,
            hard_deadline_ms: 1_800_000,
            stop_grace_ms: 15_000,
            shutdown_grace_ms: 30_000,
            main_group_folder: "main".into(),
        }
    }
}

/// Scheduled-task loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            timezone: "UTC".into(),
        }
    }
}

/// IPC watcher poll period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

/// Mount policy. The allowlist file lives outside the project tree so
/// sandboxes can never edit their own mount permissions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MountPolicyConfig {
    pub allowlist_path: Option<String>,
    /// Prefixes blocked unconditionally, merged with the built-in deny list.
    pub blocked_prefixes: Vec<String>,
}

/// Host-side query adapter (safe-exec over allowlisted CLIs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryAdapterConfig {
    pub enabled: bool,
    pub require_main_group_for_writes: bool,
    pub timeout_ms: u64,
    /// Allowed command signatures for read queries.
    pub read_allowlist: Vec<String>,
    /// Allowed command signatures for write queries.
    pub write_allowlist: Vec<String>,
}

impl Default for QueryAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_main_group_for_writes: true,
            timeout_ms: 10_000,
            read_allowlist: vec![
                "ic run current --json".into(),
                "ic run status --json".into(),
                "ic run phase --json".into(),
                "ic run artifact list --json".into(),
                "ic run artifact get --json".into(),
                "ic events tail --json".into(),
                "bd list --json".into(),
                "bd show --json".into(),
                "bd ready --json".into(),
            ],
            write_allowlist: vec![
                "bd create --json".into(),
                "bd update --json".into(),
                "bd close --json".into(),
                "ic run create --json".into(),
                "ic gate override --json".into(),
            ],
        }
    }
}

/// One selectable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub runtime: String,
    pub display_name: String,
}

/// The `/model` catalog. Configuration, not code: deployments trim or extend
/// it without rebuilding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCatalog {
    pub default: String,
    pub entries: Vec<ModelEntry>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            default: "claude-opus-4-6".into(),
            entries: vec![
                ModelEntry {
                    id: "claude-opus-4-6".into(),
                    runtime: "claude".into(),
                    display_name: "Claude Opus 4.6".into(),
                },
                ModelEntry {
                    id: "claude-sonnet-4-6".into(),
                    runtime: "claude".into(),
                    display_name: "Claude Sonnet 4.6".into(),
                },
                ModelEntry {
                    id: "gemini-3.1-pro".into(),
                    runtime: "gemini".into(),
                    display_name: "Gemini 3.1 Pro".into(),
                },
                ModelEntry {
                    id: "gemini-2.5-flash".into(),
                    runtime: "gemini".into(),
                    display_name: "Gemini 2.5 Flash".into(),
                },
                ModelEntry {
                    id: "gpt-5.3-codex".into(),
                    runtime: "codex".into(),
                    display_name: "GPT-5.3 Codex".into(),
                },
            ],
        }
    }
}

impl ModelCatalog {
    pub fn find(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|m| m.id == id)
    }
}

/// Expand `~` to the home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist.
pub fn load(path: &str) -> Result<Config, RelayError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!("config file not found at {}, using defaults", path.display());
        return Ok(Config::default().with_env_overrides());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", path.display())))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| RelayError::Config(format!("failed to parse config: {e}")))?;

    Ok(config.with_env_overrides())
}

impl Config {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("RELAY_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind_address = bind;
            }
        }
        if let Ok(dsn) = std::env::var("RELAY_STORE_DSN") {
            if !dsn.trim().is_empty() {
                self.store.dsn = dsn;
            }
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                let tg = self.channel.telegram.get_or_insert_with(Default::default);
                tg.enabled = true;
                tg.bot_token = token;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_three_runtime_profiles() {
        let cfg = Config::default();
        assert!(cfg.runtimes.profiles.contains_key("claude"));
        assert!(cfg.runtimes.profiles.contains_key("gemini"));
        assert!(cfg.runtimes.profiles.contains_key("codex"));
        assert_eq!(cfg.runtimes.engine, "docker");
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            bind_address = "127.0.0.1:9999"

            [orchestrator]
            max_concurrent_sandboxes = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.bind_address, "127.0.0.1:9999");
        assert_eq!(cfg.orchestrator.max_concurrent_sandboxes, 2);
        assert_eq!(cfg.orchestrator.main_group_folder, "main");
        assert_eq!(cfg.scheduler.timezone, "UTC");
    }

    #[test]
    fn catalog_lookup() {
        let catalog = ModelCatalog::default();
        assert!(catalog.find("claude-opus-4-6").is_some());
        assert!(catalog.find("nonexistent").is_none());
        assert_eq!(catalog.find(&catalog.default).unwrap().runtime, "claude");
    }

    #[test]
    fn query_adapter_defaults_restrict_writes() {
        let cfg = QueryAdapterConfig::default();
        assert!(cfg.require_main_group_for_writes);
        assert!(cfg.read_allowlist.iter().any(|s| s.starts_with("bd list")));
        assert!(cfg.read_allowlist.iter().any(|s| s.starts_with("ic run phase")));
        assert!(cfg.write_allowlist.iter().any(|s| s.starts_with("ic gate override")));
    }
}
