//! Row → domain type mapping.

use relay_core::error::RelayError;
use relay_core::group::RegisteredGroup;
use relay_core::message::ChatMessage;
use relay_core::task::{ContextMode, ScheduleKind, ScheduledTask, TaskStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(super) fn row_to_message(row: &SqliteRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        chat_jid: row.get("chat_jid"),
        sender: row.get::<Option<String>, _>("sender").unwrap_or_default(),
        sender_name: row.get::<Option<String>, _>("sender_name").unwrap_or_default(),
        content: row.get::<Option<String>, _>("content").unwrap_or_default(),
        timestamp: row.get("timestamp"),
        is_from_assistant: row.get::<i64, _>("is_from_assistant") != 0,
    }
}

pub(super) fn row_to_group(row: &SqliteRow) -> RegisteredGroup {
    let sandbox_config = row
        .get::<Option<String>, _>("sandbox_config")
        .and_then(|raw| serde_json::from_str(&raw).ok());
    RegisteredGroup {
        jid: row.get("jid"),
        name: row.get("name"),
        folder: row.get("folder"),
        trigger: row.get("trigger_pattern"),
        added_at: row.get("added_at"),
        requires_trigger: row
            .get::<Option<i64>, _>("requires_trigger")
            .map(|v| v != 0),
        runtime: row.get("runtime"),
        model: row.get("model"),
        sandbox_config,
    }
}

pub(super) fn row_to_task(row: &SqliteRow) -> Result<ScheduledTask, RelayError> {
    let kind_raw: String = row.get("schedule_kind");
    let schedule_kind = ScheduleKind::parse(&kind_raw)
        .ok_or_else(|| RelayError::Store(format!("unknown schedule kind: {kind_raw}")))?;
    let status_raw: String = row.get("status");
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| RelayError::Store(format!("unknown task status: {status_raw}")))?;
    let mode_raw: String = row.get("context_mode");

    Ok(ScheduledTask {
        id: row.get("id"),
        group_folder: row.get("group_folder"),
        chat_jid: row.get("chat_jid"),
        prompt: row.get("prompt"),
        schedule_kind,
        schedule_value: row.get("schedule_value"),
        context_mode: ContextMode::parse(&mode_raw).unwrap_or_default(),
        next_run: row.get("next_run"),
        last_run: row.get("last_run"),
        last_result: row.get("last_result"),
        status,
        created_at: row.get("created_at"),
    })
}
