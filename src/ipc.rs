//! Filesystem IPC watcher.
//!
//! Polls every group's IPC namespace for outbound messages, task requests,
//! and host queries. Files are processed oldest-first; malformed JSON moves
//! to the group's `errors/` directory instead of being deleted, and every
//! response write is atomic.
//!
//! Authorization happens here: a non-main group's message may only reach its
//! own chat, task requests may only touch the emitting group's tasks, and
//! `register_group` is honored from the main group alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_core::group::RegisteredGroup;
use relay_core::ipc::{write_atomic, OutboundMessage, QueryRequest, TaskRequest};
use relay_core::message::ChatMessage;
use relay_core::now_iso;
use relay_core::sanitize::is_safe_folder;
use relay_core::task::{ScheduledTask, TaskStatus};
use relay_core::traits::{Channel, Store};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::channel_for;
use crate::queries::QueryAdapter;
use crate::scheduler::initial_next_run;
use crate::state::SharedState;

#[derive(Clone)]
pub struct IpcWatcherConfig {
    /// `{data_root}/ipc`.
    pub ipc_root: PathBuf,
    pub poll_interval: Duration,
    pub main_group_folder: String,
    pub assistant_name: String,
    pub timezone: String,
}

pub struct IpcWatcher {
    pub config: IpcWatcherConfig,
    pub store: Arc<dyn Store>,
    pub state: Arc<SharedState>,
    pub channels: Arc<Vec<Arc<dyn Channel>>>,
    pub queries: Arc<QueryAdapter>,
}

impl IpcWatcher {
    /// Run the polling loop until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let _ = std::fs::create_dir_all(&self.config.ipc_root);
        info!(root = %self.config.ipc_root.display(), "IPC watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every group directory.
    pub async fn poll_once(&self) {
        let folders = match std::fs::read_dir(&self.config.ipc_root) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(e) => {
                debug!(err = %e, "IPC root not readable");
                return;
            }
        };

        for folder in folders {
            // Directory names double as identity; ignore anything unsafe.
            if !is_safe_folder(&folder) {
                continue;
            }
            let is_main = folder == self.config.main_group_folder;
            let group_dir = self.config.ipc_root.join(&folder);

            self.process_messages(&group_dir, &folder, is_main).await;
            self.process_tasks(&group_dir, &folder, is_main).await;
            self.process_queries(&group_dir, &folder, is_main).await;
        }
    }

    /// `messages/`: outbound chat messages emitted by the sandbox.
    async fn process_messages(&self, group_dir: &Path, folder: &str, is_main: bool) {
        for path in json_files(&group_dir.join("messages")) {
            let msg: OutboundMessage = match read_json(&path) {
                Ok(m) => m,
                Err(e) => {
                    error!(path = %path.display(), err = %e, "malformed IPC message");
                    move_to_errors(group_dir, &path);
                    continue;
                }
            };

            if msg.chat_jid.is_empty() || msg.text.is_empty() {
                warn!(path = %path.display(), "IPC message missing chat_jid or text");
                move_to_errors(group_dir, &path);
                continue;
            }

            if !is_main && !self.jid_belongs_to(&msg.chat_jid, folder).await {
                warn!(
                    folder,
                    target = msg.chat_jid.as_str(),
                    "cross-group IPC message blocked"
                );
                remove_file(&path);
                continue;
            }

            match channel_for(&self.channels, &msg.chat_jid) {
                Some(channel) => match channel.send(&msg.chat_jid, &msg.text).await {
                    Ok(_) => {
                        let sender_name = msg
                            .sender
                            .clone()
                            .unwrap_or_else(|| self.config.assistant_name.clone());
                        let record = ChatMessage {
                            id: format!("ipc-{}", chrono::Utc::now().timestamp_micros()),
                            chat_jid: msg.chat_jid.clone(),
                            sender: "assistant".into(),
                            sender_name,
                            content: msg.text.clone(),
                            timestamp: now_iso(),
                            is_from_assistant: true,
                        };
                        if let Err(e) = self.store.store_message(&record).await {
                            warn!(err = %e, "failed to persist IPC outbound message");
                        }
                        debug!(folder, target = msg.chat_jid.as_str(), "IPC message delivered");
                        remove_file(&path);
                    }
                    Err(e) => {
                        // Transient channel failure: leave the file for the
                        // next poll.
                        warn!(err = %e, "IPC message delivery failed, will retry");
                    }
                },
                None => {
                    warn!(target = msg.chat_jid.as_str(), "no channel owns IPC message target");
                    move_to_errors(group_dir, &path);
                }
            }
        }
    }

    /// `tasks/`: task lifecycle requests.
    async fn process_tasks(&self, group_dir: &Path, folder: &str, is_main: bool) {
        for path in json_files(&group_dir.join("tasks")) {
            let request: TaskRequest = match read_json(&path) {
                Ok(r) => r,
                Err(e) => {
                    error!(path = %path.display(), err = %e, "malformed IPC task request");
                    move_to_errors(group_dir, &path);
                    continue;
                }
            };
            self.handle_task_request(request, folder, is_main).await;
            remove_file(&path);
        }
    }

    async fn handle_task_request(&self, request: TaskRequest, folder: &str, is_main: bool) {
        match request {
            TaskRequest::ScheduleTask {
                prompt,
                schedule_kind,
                schedule_value,
                context_mode,
                target_jid,
                created_by: _,
            } => {
                let own_jid = self.state.jid_for_folder(folder).await;
                let chat_jid = match (is_main, target_jid) {
                    (true, Some(target)) => {
                        if self.state.group_by_jid(&target).await.is_none() {
                            warn!(folder, target = target.as_str(),
                                "schedule_task refused: target chat not registered");
                            return;
                        }
                        target
                    }
                    (false, Some(target)) if Some(&target) != own_jid.as_ref() => {
                        warn!(folder, target = target.as_str(),
                            "schedule_task refused: non-main group targeting another chat");
                        return;
                    }
                    (_, _) => match own_jid {
                        Some(jid) => jid,
                        None => {
                            warn!(folder, "schedule_task refused: emitting group not registered");
                            return;
                        }
                    },
                };

                let Some(next_run) =
                    initial_next_run(schedule_kind, &schedule_value, &self.config.timezone)
                else {
                    warn!(folder, value = schedule_value.as_str(), "schedule_task refused: bad schedule");
                    return;
                };

                let task = ScheduledTask {
                    id: Uuid::new_v4().to_string(),
                    group_folder: folder.to_string(),
                    chat_jid,
                    prompt,
                    schedule_kind,
                    schedule_value,
                    context_mode,
                    next_run: Some(next_run),
                    last_run: None,
                    last_result: None,
                    status: TaskStatus::Active,
                    created_at: now_iso(),
                };
                match self.store.create_task(&task).await {
                    Ok(()) => info!(folder, task_id = task.id.as_str(), "task scheduled"),
                    Err(e) => error!(folder, err = %e, "failed to create task"),
                }
            }

            TaskRequest::PauseTask { task_id } => {
                self.transition_task(&task_id, folder, is_main, TaskStatus::Paused, None)
                    .await;
            }
            TaskRequest::ResumeTask { task_id } => {
                let Some(task) = self.owned_task(&task_id, folder, is_main).await else {
                    return;
                };
                let next_run =
                    initial_next_run(task.schedule_kind, &task.schedule_value, &self.config.timezone);
                self.transition_task(
                    &task_id,
                    folder,
                    is_main,
                    TaskStatus::Active,
                    next_run.as_deref(),
                )
                .await;
            }
            TaskRequest::CancelTask { task_id } => {
                self.transition_task(&task_id, folder, is_main, TaskStatus::Cancelled, None)
                    .await;
            }

            TaskRequest::RegisterGroup {
                jid,
                name,
                folder: new_folder,
                trigger,
            } => {
                if !is_main {
                    warn!(folder, "register_group refused: main group only");
                    return;
                }
                if !is_safe_folder(&new_folder) {
                    warn!(new_folder = new_folder.as_str(), "register_group refused: unsafe folder name");
                    return;
                }
                let group = RegisteredGroup {
                    jid: jid.clone(),
                    name,
                    folder: new_folder,
                    trigger,
                    added_at: now_iso(),
                    requires_trigger: None,
                    runtime: None,
                    model: None,
                    sandbox_config: None,
                };
                match self.state.upsert_group(&self.store, group).await {
                    Ok(()) => info!(jid = jid.as_str(), "group registered via IPC"),
                    Err(e) => error!(err = %e, "failed to register group"),
                }
            }
        }
    }

    async fn owned_task(&self, task_id: &str, folder: &str, is_main: bool) -> Option<ScheduledTask> {
        match self.store.get_task(task_id).await {
            Ok(Some(task)) if is_main || task.group_folder == folder => Some(task),
            Ok(Some(task)) => {
                warn!(
                    folder,
                    task_id,
                    owner = task.group_folder.as_str(),
                    "task request refused: not the owner"
                );
                None
            }
            Ok(None) => {
                warn!(folder, task_id, "task request for unknown task");
                None
            }
            Err(e) => {
                error!(task_id, err = %e, "task lookup failed");
                None
            }
        }
    }

    async fn transition_task(
        &self,
        task_id: &str,
        folder: &str,
        is_main: bool,
        status: TaskStatus,
        next_run: Option<&str>,
    ) {
        if self.owned_task(task_id, folder, is_main).await.is_none() {
            return;
        }
        match self.store.set_task_status(task_id, status, next_run).await {
            Ok(true) => info!(task_id, status = status.as_str(), "task transitioned"),
            Ok(false) => warn!(task_id, "task vanished during transition"),
            Err(e) => error!(task_id, err = %e, "task transition failed"),
        }
    }

    /// `queries/` → `responses/`: host lookups with a uuid round trip.
    async fn process_queries(&self, group_dir: &Path, folder: &str, is_main: bool) {
        let responses_dir = group_dir.join("responses");
        for path in json_files(&group_dir.join("queries")) {
            let query: QueryRequest = match read_json(&path) {
                Ok(q) => q,
                Err(e) => {
                    error!(path = %path.display(), err = %e, "malformed IPC query");
                    move_to_errors(group_dir, &path);
                    continue;
                }
            };

            if query.uuid.is_empty() || query.query_type.is_empty() {
                warn!(path = %path.display(), "IPC query missing uuid or type");
                move_to_errors(group_dir, &path);
                continue;
            }
            // The uuid becomes a filename in responses/; keep it on a leash.
            if query.uuid.contains('/') || query.uuid.contains("..") {
                warn!(folder, uuid = query.uuid.as_str(), "IPC query uuid rejected");
                move_to_errors(group_dir, &path);
                continue;
            }

            let reply = self
                .queries
                .execute(&query.query_type, &query.params, is_main)
                .await;

            let _ = std::fs::create_dir_all(&responses_dir);
            let response_path = responses_dir.join(format!("{}.json", query.uuid));
            match serde_json::to_string_pretty(&reply) {
                Ok(body) => {
                    if let Err(e) = write_atomic(&response_path, &body) {
                        error!(uuid = query.uuid.as_str(), err = %e, "failed to write query response");
                    }
                }
                Err(e) => error!(err = %e, "failed to encode query response"),
            }
            remove_file(&path);
            debug!(
                folder,
                uuid = query.uuid.as_str(),
                query_type = query.query_type.as_str(),
                status = reply.status.as_str(),
                "query answered"
            );
        }
    }

    async fn jid_belongs_to(&self, jid: &str, folder: &str) -> bool {
        self.state
            .group_by_jid(jid)
            .await
            .map(|g| g.folder == folder)
            .unwrap_or(false)
    }
}

/// Sorted `.json` files in a directory; `.tmp` files are in-flight writes
/// and are never returned.
fn json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, relay_core::error::RelayError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn move_to_errors(group_dir: &Path, path: &Path) {
    let errors_dir = group_dir.join("errors");
    let _ = std::fs::create_dir_all(&errors_dir);
    if let Some(name) = path.file_name() {
        if let Err(e) = std::fs::rename(path, errors_dir.join(name)) {
            error!(path = %path.display(), err = %e, "failed to quarantine IPC file");
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(path = %path.display(), err = %e, "failed to remove processed IPC file");
    }
}
