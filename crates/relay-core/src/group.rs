use serde::{Deserialize, Serialize};

/// A registered chat. JID and folder are both primary keys; the folder name
/// is the group's identity in the queue, the IPC tree, and sandbox mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    /// Custom trigger prefix in addition to `@AssistantName`. Empty = none.
    #[serde(default)]
    pub trigger: String,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_trigger: Option<bool>,
    /// Runtime override; falls back to the model's runtime, then the default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-group sandbox settings (additional mounts, deadline override).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_config: Option<serde_json::Value>,
}

impl RegisteredGroup {
    pub fn is_main(&self, main_folder: &str) -> bool {
        self.folder == main_folder
    }

    /// Whether messages for this group must match a trigger before a sandbox
    /// may act. The main group never requires one.
    pub fn needs_trigger(&self, main_folder: &str) -> bool {
        !self.is_main(main_folder) && self.requires_trigger.unwrap_or(true)
    }
}
