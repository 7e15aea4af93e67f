use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::group::RegisteredGroup;
use crate::message::ChatMessage;
use crate::task::{ScheduledTask, TaskRunLog, TaskStatus};

/// Messaging channel capability: the orchestrator's only view of a chat
/// backend. Concrete implementations (Telegram, WhatsApp, ...) are
/// registered at startup; routing picks the first channel that `owns` a JID.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name ("telegram", "whatsapp", ...).
    fn name(&self) -> &str;

    /// Whether this channel is responsible for the given JID.
    fn owns(&self, jid: &str) -> bool;

    /// Maximum text length a single message may carry.
    fn max_text_len(&self) -> usize {
        usize::MAX
    }

    /// Whether `edit` works; channels without editing get one final send.
    fn supports_edit(&self) -> bool {
        true
    }

    /// Send a message; returns the channel's message id when available.
    async fn send(&self, jid: &str, text: &str) -> Result<Option<String>, RelayError>;

    /// Replace the text of a previously sent message.
    async fn edit(&self, jid: &str, message_id: &str, text: &str) -> Result<bool, RelayError>;

    /// Toggle the typing indicator. Best effort.
    async fn set_typing(&self, _jid: &str, _on: bool) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Persistence capability consumed by the orchestrator. Timestamps are
/// ISO-8601 strings ordered lexicographically; `since` parameters are
/// exclusive lower bounds.
#[async_trait]
pub trait Store: Send + Sync {
    // Groups
    async fn get_registered_groups(&self) -> Result<HashMap<String, RegisteredGroup>, RelayError>;
    async fn set_registered_group(&self, group: &RegisteredGroup) -> Result<(), RelayError>;

    // Sessions
    async fn get_all_sessions(&self) -> Result<HashMap<String, String>, RelayError>;
    async fn set_session(&self, folder: &str, session_id: &str) -> Result<(), RelayError>;
    async fn delete_session(&self, folder: &str) -> Result<(), RelayError>;

    // Messages
    async fn store_message(&self, msg: &ChatMessage) -> Result<(), RelayError>;
    async fn store_chat_metadata(
        &self,
        jid: &str,
        name: Option<&str>,
        timestamp: &str,
        channel: Option<&str>,
        is_group: bool,
    ) -> Result<(), RelayError>;

    /// Inbound messages newer than `since` across the given JIDs, oldest
    /// first. Assistant replies are excluded.
    async fn get_new_messages(
        &self,
        jids: &[String],
        since: &str,
    ) -> Result<Vec<ChatMessage>, RelayError>;

    /// Inbound messages for one chat newer than `since`, oldest first.
    async fn get_messages_since(
        &self,
        jid: &str,
        since: &str,
    ) -> Result<Vec<ChatMessage>, RelayError>;

    // Cursor persistence
    async fn get_router_state(&self, key: &str) -> Result<Option<String>, RelayError>;
    async fn set_router_state(&self, key: &str, value: &str) -> Result<(), RelayError>;

    // Scheduled tasks
    async fn create_task(&self, task: &ScheduledTask) -> Result<(), RelayError>;
    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, RelayError>;
    async fn get_tasks_for_group(&self, folder: &str) -> Result<Vec<ScheduledTask>, RelayError>;

    /// Active tasks with `next_run <= now`, soonest first.
    async fn get_due_tasks(&self, now: &str) -> Result<Vec<ScheduledTask>, RelayError>;

    /// Transition a task's status, replacing `next_run` (null for paused,
    /// cancelled, and completed tasks). Returns false when the id is unknown.
    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        next_run: Option<&str>,
    ) -> Result<bool, RelayError>;

    async fn delete_task(&self, id: &str) -> Result<(), RelayError>;

    /// Record a completed run: sets `last_run`/`last_result`, stores the new
    /// `next_run`, and completes the task when there is none.
    async fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        summary: &str,
    ) -> Result<(), RelayError>;

    async fn log_task_run(&self, log: &TaskRunLog) -> Result<(), RelayError>;
}
