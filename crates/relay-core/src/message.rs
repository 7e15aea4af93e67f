use serde::{Deserialize, Serialize};

/// A chat message as the store sees it.
///
/// Inbound messages are written by the channel adapter; assistant replies are
/// written by the dispatcher with `is_from_assistant = true` so later prompts
/// can include them as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Channel-scoped message id.
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// ISO-8601 UTC; system-wide ordering is lexicographic over this field.
    pub timestamp: String,
    #[serde(default)]
    pub is_from_assistant: bool,
}

/// Chat metadata kept alongside messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    pub last_message_time: String,
    pub channel: Option<String>,
    pub is_group: bool,
}

/// Format a message batch into the prompt text a sandbox receives.
pub fn format_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.sender_name, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
