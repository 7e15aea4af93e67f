//! Process-wide shared state.
//!
//! Groups, sessions, per-group agent cursors, and sandbox-reported models
//! live in memory behind RW locks; the store is the durable backing. Reads
//! come from memory, writes go to both.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use relay_core::error::RelayError;
use relay_core::group::RegisteredGroup;
use relay_core::traits::Store;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Router-state key for the global inbound cursor.
pub const LAST_SEEN_KEY: &str = "last_seen_ts";
/// Router-state key for the per-group agent cursors (JSON map).
pub const AGENT_CURSORS_KEY: &str = "last_agent_ts";

pub struct SharedState {
    pub groups: RwLock<HashMap<String, RegisteredGroup>>,
    /// group folder → opaque sandbox session id.
    pub sessions: RwLock<HashMap<String, String>>,
    /// chat JID → timestamp of the last message a sandbox consumed.
    pub agent_cursors: RwLock<HashMap<String, String>>,
    /// group folder → model the sandbox last reported. Shown by `/status`.
    pub reported_models: RwLock<HashMap<String, String>>,
}

impl SharedState {
    /// Load groups, sessions, and cursors from the store.
    pub async fn load(store: &Arc<dyn Store>) -> Arc<Self> {
        let groups = match store.get_registered_groups().await {
            Ok(g) => {
                info!(count = g.len(), "loaded registered groups");
                g
            }
            Err(e) => {
                warn!(err = %e, "failed to load groups, starting empty");
                HashMap::new()
            }
        };
        let sessions = match store.get_all_sessions().await {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to load sessions, starting empty");
                HashMap::new()
            }
        };
        let agent_cursors = match store.get_router_state(AGENT_CURSORS_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(err = %e, "failed to load agent cursors, starting empty");
                HashMap::new()
            }
        };

        Arc::new(Self {
            groups: RwLock::new(groups),
            sessions: RwLock::new(sessions),
            agent_cursors: RwLock::new(agent_cursors),
            reported_models: RwLock::new(HashMap::new()),
        })
    }

    pub async fn group_by_jid(&self, jid: &str) -> Option<RegisteredGroup> {
        self.groups.read().await.get(jid).cloned()
    }

    pub async fn group_by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        self.groups
            .read()
            .await
            .values()
            .find(|g| g.folder == folder)
            .cloned()
    }

    pub async fn jid_for_folder(&self, folder: &str) -> Option<String> {
        self.group_by_folder(folder).await.map(|g| g.jid)
    }

    pub async fn upsert_group(
        &self,
        store: &Arc<dyn Store>,
        group: RegisteredGroup,
    ) -> Result<(), RelayError> {
        store.set_registered_group(&group).await?;
        self.groups.write().await.insert(group.jid.clone(), group);
        Ok(())
    }

    /// The per-group agent cursor; empty string means "everything is new".
    pub async fn agent_cursor(&self, jid: &str) -> String {
        self.agent_cursors
            .read()
            .await
            .get(jid)
            .cloned()
            .unwrap_or_default()
    }

    /// Advance (or roll back) the per-group cursor and persist the map.
    pub async fn set_agent_cursor(&self, store: &Arc<dyn Store>, jid: &str, ts: &str) {
        let json = {
            let mut cursors = self.agent_cursors.write().await;
            cursors.insert(jid.to_string(), ts.to_string());
            serde_json::to_string(&*cursors).unwrap_or_else(|_| "{}".into())
        };
        if let Err(e) = store.set_router_state(AGENT_CURSORS_KEY, &json).await {
            warn!(jid, err = %e, "failed to persist agent cursors");
        }
    }

    /// Remember the session a sandbox reported for its group.
    pub async fn record_session(&self, store: &Arc<dyn Store>, folder: &str, session_id: &str) {
        self.sessions
            .write()
            .await
            .insert(folder.to_string(), session_id.to_string());
        if let Err(e) = store.set_session(folder, session_id).await {
            warn!(folder, err = %e, "failed to persist session");
        }
    }

    pub async fn session_for(&self, folder: &str) -> Option<String> {
        self.sessions.read().await.get(folder).cloned()
    }

    /// Drop a group's session everywhere: memory, store, and the sandbox's
    /// own session files under the group workspace.
    pub async fn clear_session(&self, store: &Arc<dyn Store>, folder: &str, groups_root: &Path) {
        self.sessions.write().await.remove(folder);
        if let Err(e) = store.delete_session(folder).await {
            warn!(folder, err = %e, "failed to delete session from store");
        }
        let session_files = groups_root.join(folder).join(".sessions");
        if session_files.exists() {
            if let Err(e) = std::fs::remove_dir_all(&session_files) {
                warn!(folder, err = %e, "failed to remove session files");
            }
        }
    }

    pub async fn report_model(&self, folder: &str, model: &str) {
        self.reported_models
            .write()
            .await
            .insert(folder.to_string(), model.to_string());
    }

    pub async fn reported_model(&self, folder: &str) -> Option<String> {
        self.reported_models.read().await.get(folder).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::SqliteStore;

    fn group(jid: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.into(),
            name: folder.into(),
            folder: folder.into(),
            trigger: String::new(),
            added_at: relay_core::now_iso(),
            requires_trigger: None,
            runtime: None,
            model: None,
            sandbox_config: None,
        }
    }

    async fn store() -> Arc<dyn Store> {
        Arc::new(SqliteStore::connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn cursors_persist_and_reload() {
        let store = store().await;
        let state = SharedState::load(&store).await;
        assert_eq!(state.agent_cursor("tg:1").await, "");

        state
            .set_agent_cursor(&store, "tg:1", "2026-01-01T10:00:00.000Z")
            .await;

        let reloaded = SharedState::load(&store).await;
        assert_eq!(
            reloaded.agent_cursor("tg:1").await,
            "2026-01-01T10:00:00.000Z"
        );
    }

    #[tokio::test]
    async fn sessions_clear_removes_files() {
        let store = store().await;
        let state = SharedState::load(&store).await;
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("main/.sessions")).unwrap();
        std::fs::write(tmp.path().join("main/.sessions/current"), "sess-1").unwrap();

        state.record_session(&store, "main", "sess-1").await;
        assert_eq!(state.session_for("main").await.as_deref(), Some("sess-1"));

        state.clear_session(&store, "main", tmp.path()).await;
        assert!(state.session_for("main").await.is_none());
        assert!(store.get_all_sessions().await.unwrap().is_empty());
        assert!(!tmp.path().join("main/.sessions").exists());
    }

    #[tokio::test]
    async fn group_lookup_by_folder() {
        let store = store().await;
        let state = SharedState::load(&store).await;
        state.upsert_group(&store, group("tg:1", "main")).await.unwrap();
        state.upsert_group(&store, group("tg:2", "team")).await.unwrap();

        assert_eq!(state.jid_for_folder("team").await.as_deref(), Some("tg:2"));
        assert!(state.group_by_folder("missing").await.is_none());
        assert_eq!(
            state.group_by_jid("tg:1").await.unwrap().folder,
            "main"
        );
    }
}
