//! The `Store` capability implemented over SQLite.

use std::collections::HashMap;

use async_trait::async_trait;
use relay_core::error::RelayError;
use relay_core::group::RegisteredGroup;
use relay_core::message::ChatMessage;
use relay_core::task::{ScheduledTask, TaskRunLog, TaskStatus};
use relay_core::traits::Store;
use relay_core::now_iso;

use super::rows::{row_to_group, row_to_message, row_to_task};
use super::SqliteStore;

fn store_err(op: &str) -> impl FnOnce(sqlx::Error) -> RelayError + '_ {
    move |e| RelayError::Store(format!("{op}: {e}"))
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_registered_groups(&self) -> Result<HashMap<String, RegisteredGroup>, RelayError> {
        let rows = sqlx::query("SELECT * FROM registered_groups")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("get_registered_groups"))?;
        Ok(rows
            .iter()
            .map(|r| {
                let g = row_to_group(r);
                (g.jid.clone(), g)
            })
            .collect())
    }

    async fn set_registered_group(&self, group: &RegisteredGroup) -> Result<(), RelayError> {
        let sandbox_config = group
            .sandbox_config
            .as_ref()
            .map(|v| v.to_string());
        sqlx::query(
            "INSERT INTO registered_groups
               (jid, name, folder, trigger_pattern, added_at, requires_trigger,
                runtime, model, sandbox_config)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (jid) DO UPDATE SET
               name = excluded.name,
               folder = excluded.folder,
               trigger_pattern = excluded.trigger_pattern,
               requires_trigger = excluded.requires_trigger,
               runtime = excluded.runtime,
               model = excluded.model,
               sandbox_config = excluded.sandbox_config",
        )
        .bind(&group.jid)
        .bind(&group.name)
        .bind(&group.folder)
        .bind(&group.trigger)
        .bind(&group.added_at)
        .bind(group.requires_trigger.map(i64::from))
        .bind(&group.runtime)
        .bind(&group.model)
        .bind(sandbox_config)
        .execute(&self.pool)
        .await
        .map_err(store_err("set_registered_group"))?;
        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<HashMap<String, String>, RelayError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT group_folder, session_id FROM sessions")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err("get_all_sessions"))?;
        Ok(rows.into_iter().collect())
    }

    async fn set_session(&self, folder: &str, session_id: &str) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO sessions (group_folder, session_id) VALUES (?, ?)
             ON CONFLICT (group_folder) DO UPDATE SET session_id = excluded.session_id",
        )
        .bind(folder)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(store_err("set_session"))?;
        Ok(())
    }

    async fn delete_session(&self, folder: &str) -> Result<(), RelayError> {
        sqlx::query("DELETE FROM sessions WHERE group_folder = ?")
            .bind(folder)
            .execute(&self.pool)
            .await
            .map_err(store_err("delete_session"))?;
        Ok(())
    }

    async fn store_message(&self, msg: &ChatMessage) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO messages
               (id, chat_jid, sender, sender_name, content, timestamp, is_from_assistant)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id, chat_jid) DO UPDATE SET
               content = excluded.content,
               is_from_assistant = excluded.is_from_assistant",
        )
        .bind(&msg.id)
        .bind(&msg.chat_jid)
        .bind(&msg.sender)
        .bind(&msg.sender_name)
        .bind(&msg.content)
        .bind(&msg.timestamp)
        .bind(i64::from(msg.is_from_assistant))
        .execute(&self.pool)
        .await
        .map_err(store_err("store_message"))?;
        Ok(())
    }

    async fn store_chat_metadata(
        &self,
        jid: &str,
        name: Option<&str>,
        timestamp: &str,
        channel: Option<&str>,
        is_group: bool,
    ) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO chats (jid, name, last_message_time, channel, is_group)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (jid) DO UPDATE SET
               name = COALESCE(excluded.name, chats.name),
               last_message_time = MAX(chats.last_message_time, excluded.last_message_time),
               channel = COALESCE(excluded.channel, chats.channel),
               is_group = excluded.is_group",
        )
        .bind(jid)
        .bind(name)
        .bind(timestamp)
        .bind(channel)
        .bind(i64::from(is_group))
        .execute(&self.pool)
        .await
        .map_err(store_err("store_chat_metadata"))?;
        Ok(())
    }

    async fn get_new_messages(
        &self,
        jids: &[String],
        since: &str,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        if jids.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = vec!["?"; jids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM messages
             WHERE timestamp > ? AND chat_jid IN ({placeholders})
               AND is_from_assistant = 0 AND content != '' AND content IS NOT NULL
             ORDER BY timestamp"
        );
        let mut query = sqlx::query(&sql).bind(since);
        for jid in jids {
            query = query.bind(jid);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("get_new_messages"))?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn get_messages_since(
        &self,
        jid: &str,
        since: &str,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE chat_jid = ? AND timestamp > ?
               AND is_from_assistant = 0 AND content != '' AND content IS NOT NULL
             ORDER BY timestamp",
        )
        .bind(jid)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("get_messages_since"))?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn get_router_state(&self, key: &str) -> Result<Option<String>, RelayError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM router_state WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err("get_router_state"))?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_router_state(&self, key: &str, value: &str) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO router_state (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err("set_router_state"))?;
        Ok(())
    }

    async fn create_task(&self, task: &ScheduledTask) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO scheduled_tasks
               (id, group_folder, chat_jid, prompt, schedule_kind, schedule_value,
                context_mode, next_run, last_run, last_result, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.group_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_kind.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(&task.next_run)
        .bind(&task.last_run)
        .bind(&task.last_result)
        .bind(task.status.as_str())
        .bind(&task.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err("create_task"))?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, RelayError> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("get_task"))?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_tasks_for_group(&self, folder: &str) -> Result<Vec<ScheduledTask>, RelayError> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks WHERE group_folder = ? ORDER BY created_at DESC",
        )
        .bind(folder)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("get_tasks_for_group"))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn get_due_tasks(&self, now: &str) -> Result<Vec<ScheduledTask>, RelayError> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
             ORDER BY next_run",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("get_due_tasks"))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        next_run: Option<&str>,
    ) -> Result<bool, RelayError> {
        let result = sqlx::query("UPDATE scheduled_tasks SET status = ?, next_run = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(next_run)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("set_task_status"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_task(&self, id: &str) -> Result<(), RelayError> {
        sqlx::query("DELETE FROM task_run_logs WHERE task_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("delete_task_logs"))?;
        sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err("delete_task"))?;
        Ok(())
    }

    async fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        summary: &str,
    ) -> Result<(), RelayError> {
        sqlx::query(
            "UPDATE scheduled_tasks
             SET next_run = ?, last_run = ?, last_result = ?,
                 status = CASE WHEN ? IS NULL THEN 'completed' ELSE status END
             WHERE id = ?",
        )
        .bind(next_run)
        .bind(now_iso())
        .bind(summary)
        .bind(next_run)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err("update_task_after_run"))?;
        Ok(())
    }

    async fn log_task_run(&self, log: &TaskRunLog) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, outcome, result, error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.task_id)
        .bind(&log.run_at)
        .bind(log.duration_ms)
        .bind(log.outcome.as_str())
        .bind(&log.result)
        .bind(&log.error)
        .execute(&self.pool)
        .await
        .map_err(store_err("log_task_run"))?;
        Ok(())
    }
}
