//! Dispatch callbacks: the message-batch path the queue invokes when a
//! group wins a slot, and the scheduled-task path the scheduler enqueues.
//!
//! Both funnel through one sandbox invocation: frames stream into the
//! accumulator, sessions and reported models land in shared state, the final
//! reply is persisted, and the per-group cursor only rolls back when nothing
//! reached the user.

use std::sync::Arc;
use std::time::Instant;

use relay_core::config::Config;
use relay_core::error::RelayError;
use relay_core::group::RegisteredGroup;
use relay_core::message::{format_prompt, ChatMessage};
use relay_core::now_iso;
use relay_core::protocol::{SandboxInput, SandboxStatus};
use relay_core::task::{RunOutcome, ScheduledTask, TaskRunLog};
use relay_core::traits::{Channel, Store};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::accumulator::StreamAccumulator;
use crate::message_loop::build_trigger_regex;
use crate::queue::{GroupQueue, MessageBatchFn, TaskFn};
use crate::sandbox::runner::{run_sandbox, FrameHook, RunnerConfig};
use crate::sandbox::{resolve_runtime, sandbox_name};
use crate::scheduler::{calculate_next_run, result_summary, DueTaskFn};
use crate::state::SharedState;

pub struct Dispatcher {
    pub config: Arc<Config>,
    pub runner: RunnerConfig,
    pub store: Arc<dyn Store>,
    pub queue: GroupQueue,
    pub state: Arc<SharedState>,
    pub channels: Arc<Vec<Arc<dyn Channel>>>,
}

/// What a finished invocation left behind.
struct InvocationOutcome {
    success: bool,
    delivered: bool,
    final_text: Option<String>,
    error: Option<String>,
}

/// First registered channel that owns the JID.
pub fn channel_for(
    channels: &[Arc<dyn Channel>],
    jid: &str,
) -> Option<Arc<dyn Channel>> {
    channels.iter().find(|c| c.owns(jid)).cloned()
}

impl Dispatcher {
    /// The queue's message-batch callback.
    pub fn message_batch_fn(self: Arc<Self>) -> MessageBatchFn {
        Arc::new(move |jid: String| {
            let dispatcher = self.clone();
            Box::pin(async move {
                match dispatcher.process_group_messages(&jid).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        error!(jid = jid.as_str(), err = %e, "message batch failed");
                        false
                    }
                }
            })
        })
    }

    /// Queue callback for a batch dropped after exhausting retries: the user
    /// gets one concise failure notice instead of silence.
    pub fn batch_dropped_fn(self: Arc<Self>) -> crate::queue::BatchDroppedFn {
        Arc::new(move |jid: String| {
            let dispatcher = self.clone();
            Box::pin(async move {
                if let Some(channel) = channel_for(&dispatcher.channels, &jid) {
                    let _ = channel
                        .send(&jid, "Request failed. Please try again.")
                        .await;
                }
            })
        })
    }

    /// Scheduler callback: wrap the task into a queue item for its chat.
    pub fn due_task_fn(self: Arc<Self>) -> DueTaskFn {
        Arc::new(move |task: ScheduledTask| {
            let dispatcher = self.clone();
            Box::pin(async move {
                let jid = task.chat_jid.clone();
                let task_id = task.id.clone();
                let runner = dispatcher.clone();
                let run: TaskFn = Box::new(move || {
                    Box::pin(async move {
                        runner.run_scheduled_task(task).await;
                    })
                });
                dispatcher.queue.enqueue_task(&jid, &task_id, run).await;
            })
        })
    }

    /// Process the pending message batch for one group. Returns false (for
    /// the queue's retry path) only when nothing was delivered.
    pub async fn process_group_messages(&self, jid: &str) -> Result<bool, RelayError> {
        let Some(group) = self.state.group_by_jid(jid).await else {
            // Unknown chat; nothing to do, not an error.
            return Ok(true);
        };
        let main_folder = &self.config.orchestrator.main_group_folder;

        let previous_cursor = self.state.agent_cursor(jid).await;
        let pending = self.store.get_messages_since(jid, &previous_cursor).await?;
        if pending.is_empty() {
            return Ok(true);
        }

        if group.needs_trigger(main_folder) {
            let trigger = group.trigger.trim();
            let pattern = build_trigger_regex(
                &self.config.relay.name,
                (!trigger.is_empty()).then_some(trigger),
            );
            if !pending.iter().any(|m| pattern.is_match(m.content.trim())) {
                return Ok(true);
            }
        }

        let prompt = format_prompt(&pending);
        let new_cursor = pending
            .last()
            .map(|m| m.timestamp.clone())
            .unwrap_or_default();

        // Optimistic advance; rolled back below if the run fails silently.
        self.state.set_agent_cursor(&self.store, jid, &new_cursor).await;

        info!(
            group = group.name.as_str(),
            messages = pending.len(),
            "processing message batch"
        );

        let session_id = self.state.session_for(&group.folder).await;
        let outcome = self
            .run_invocation(&group, jid, prompt, session_id, false)
            .await;

        if outcome.success {
            return Ok(true);
        }
        if outcome.delivered {
            // Output already reached the user; retrying would duplicate it.
            warn!(
                group = group.name.as_str(),
                err = outcome.error.as_deref().unwrap_or("unknown"),
                "sandbox failed after delivering output, keeping cursor"
            );
            return Ok(true);
        }

        warn!(
            group = group.name.as_str(),
            err = outcome.error.as_deref().unwrap_or("unknown"),
            "sandbox failed with no output, rolling back cursor"
        );
        self.state
            .set_agent_cursor(&self.store, jid, &previous_cursor)
            .await;
        Ok(false)
    }

    /// Execute one scheduled task inside a sandbox, then log the run and
    /// advance `next_run`.
    pub async fn run_scheduled_task(&self, task: ScheduledTask) {
        let started = Instant::now();

        let Some(group) = self.state.group_by_folder(&task.group_folder).await else {
            error!(
                task_id = task.id.as_str(),
                folder = task.group_folder.as_str(),
                "scheduled task references unknown group folder"
            );
            self.log_and_update(&task, started, None, Some("unknown group folder")).await;
            return;
        };

        // Cross-group tasks (created by main) must still point at a
        // registered chat.
        if self.state.group_by_jid(&task.chat_jid).await.is_none() {
            error!(
                task_id = task.id.as_str(),
                target = task.chat_jid.as_str(),
                "scheduled task targets an unregistered chat"
            );
            self.log_and_update(&task, started, None, Some("target chat is not registered")).await;
            return;
        }

        let session_id = match task.context_mode {
            relay_core::task::ContextMode::Group => {
                self.state.session_for(&task.group_folder).await
            }
            relay_core::task::ContextMode::Isolated => None,
        };

        self.write_ipc_snapshots(&task.group_folder).await;

        info!(
            task_id = task.id.as_str(),
            group = group.name.as_str(),
            "running scheduled task"
        );

        let prompt = format!("[SCHEDULED TASK] {}", task.prompt);
        let outcome = self
            .run_invocation(&group, &task.chat_jid, prompt, session_id, true)
            .await;

        let (result, error) = if outcome.success {
            (outcome.final_text, None)
        } else {
            (outcome.final_text, Some(outcome.error.unwrap_or_else(|| "unknown error".into())))
        };
        self.log_and_update(&task, started, result.as_deref(), error.as_deref()).await;
    }

    /// Spawn a sandbox for one prompt, routing its frames.
    async fn run_invocation(
        &self,
        group: &RegisteredGroup,
        chat_jid: &str,
        prompt: String,
        session_id: Option<String>,
        is_scheduled: bool,
    ) -> InvocationOutcome {
        let Some(channel) = channel_for(&self.channels, chat_jid) else {
            return InvocationOutcome {
                success: false,
                delivered: false,
                final_text: None,
                error: Some(format!("no channel owns {chat_jid}")),
            };
        };

        let main_folder = &self.config.orchestrator.main_group_folder;
        let is_main = group.is_main(main_folder);
        let runtime = resolve_runtime(group, &self.config);

        let input = SandboxInput {
            prompt,
            session_id,
            group_folder: group.folder.clone(),
            chat_jid: chat_jid.to_string(),
            is_main,
            is_scheduled: is_scheduled.then_some(true),
            assistant_name: Some(self.config.relay.name.clone()),
            model: group.model.clone(),
            secrets: None,
        };

        let name = sandbox_name(&group.folder);
        self.queue
            .register_process(chat_jid, &name, &group.folder)
            .await;
        let _ = channel.set_typing(chat_jid, true).await;

        let accumulator = Arc::new(StreamAccumulator::spawn(
            channel.clone(),
            chat_jid.to_string(),
        ));

        struct HookShared {
            finalized: bool,
            delivered: bool,
            final_text: Option<String>,
        }
        let hook_shared = Arc::new(Mutex::new(HookShared {
            finalized: false,
            delivered: false,
            final_text: None,
        }));

        let hook: FrameHook = {
            let state = self.state.clone();
            let store = self.store.clone();
            let queue = self.queue.clone();
            let channel = channel.clone();
            let accumulator = accumulator.clone();
            let shared = hook_shared.clone();
            let folder = group.folder.clone();
            let jid = chat_jid.to_string();
            let assistant_name = self.config.relay.name.clone();

            Arc::new(move |frame| {
                let state = state.clone();
                let store = store.clone();
                let queue = queue.clone();
                let channel = channel.clone();
                let accumulator = accumulator.clone();
                let shared = shared.clone();
                let folder = folder.clone();
                let jid = jid.clone();
                let assistant_name = assistant_name.clone();

                Box::pin(async move {
                    if let Some(sid) = &frame.new_session_id {
                        state.record_session(&store, &folder, sid).await;
                    }
                    if let Some(model) = &frame.model {
                        state.report_model(&folder, model).await;
                    }
                    if let Some(event) = frame.event {
                        accumulator.push_event(event).await;
                    }

                    if let Some(result) = frame.result {
                        let already_finalized = {
                            let mut s = shared.lock().await;
                            std::mem::replace(&mut s.finalized, true)
                        };
                        if already_finalized {
                            // A second final in the same run becomes its own
                            // message.
                            let clean = crate::accumulator::strip_internal_blocks(&result);
                            if !clean.is_empty() {
                                if channel.send(&jid, &clean).await.is_ok() {
                                    persist_reply(&store, &jid, &assistant_name, &clean).await;
                                    let mut s = shared.lock().await;
                                    s.delivered = true;
                                }
                            }
                        } else {
                            let report = accumulator.finalize(Some(result)).await;
                            if report.delivered {
                                persist_reply(&store, &jid, &assistant_name, &report.final_text)
                                    .await;
                                let mut s = shared.lock().await;
                                s.delivered = true;
                                s.final_text = Some(report.final_text);
                            }
                        }
                        // A final reply is an idle point; the queue may
                        // preempt us for waiting tasks.
                        queue.notify_idle(&jid).await;
                    }
                })
            })
        };

        let run = run_sandbox(
            &self.runner,
            group,
            &input,
            &runtime,
            is_main,
            &name,
            hook,
        )
        .await;
        let _ = channel.set_typing(chat_jid, false).await;

        // Flush whatever accumulated if the sandbox never sent a final.
        let tail_report = {
            let finalized = hook_shared.lock().await.finalized;
            if finalized {
                None
            } else {
                Some(accumulator.finalize(None).await)
            }
        };
        if let Some(report) = tail_report {
            if report.delivered {
                persist_reply(&self.store, chat_jid, &self.config.relay.name, &report.final_text)
                    .await;
                let mut s = hook_shared.lock().await;
                s.delivered = true;
                s.final_text = Some(report.final_text);
            }
        }

        let shared = hook_shared.lock().await;
        match run {
            Ok(report) => {
                if let Some(sid) = &report.new_session_id {
                    self.state.record_session(&self.store, &group.folder, sid).await;
                }
                InvocationOutcome {
                    success: report.status == SandboxStatus::Success,
                    delivered: shared.delivered,
                    final_text: shared.final_text.clone(),
                    error: report.error,
                }
            }
            Err(e) => InvocationOutcome {
                success: false,
                delivered: shared.delivered,
                final_text: shared.final_text.clone(),
                error: Some(e.to_string()),
            },
        }
    }

    /// Snapshot the group's tasks and the registered groups into its IPC
    /// namespace so the sandbox can answer questions about them offline.
    async fn write_ipc_snapshots(&self, folder: &str) {
        let ipc_dir = self.runner.data_root.join("ipc").join(folder);
        let _ = tokio::fs::create_dir_all(&ipc_dir).await;

        let tasks_json = match self.store.get_tasks_for_group(folder).await {
            Ok(tasks) => serde_json::to_string(&tasks).unwrap_or_else(|_| "[]".into()),
            Err(e) => {
                warn!(err = %e, "failed to snapshot tasks");
                "[]".into()
            }
        };
        let groups_json = {
            let groups = self.state.groups.read().await;
            let entries: Vec<_> = groups
                .values()
                .map(|g| {
                    serde_json::json!({ "jid": g.jid, "name": g.name, "folder": g.folder })
                })
                .collect();
            serde_json::to_string(&entries).unwrap_or_else(|_| "[]".into())
        };

        for (file, contents) in [
            ("current_tasks.json", tasks_json),
            ("available_groups.json", groups_json),
        ] {
            if let Err(e) = relay_core::ipc::write_atomic(&ipc_dir.join(file), &contents) {
                warn!(err = %e, file, "failed to write IPC snapshot");
            }
        }
    }

    async fn log_and_update(
        &self,
        task: &ScheduledTask,
        started: Instant,
        result: Option<&str>,
        error: Option<&str>,
    ) {
        let duration_ms = started.elapsed().as_millis() as i64;
        let outcome = if error.is_some() {
            RunOutcome::Error
        } else {
            RunOutcome::Success
        };

        if let Err(e) = self
            .store
            .log_task_run(&TaskRunLog {
                task_id: task.id.clone(),
                run_at: now_iso(),
                duration_ms,
                outcome,
                result: result.map(Into::into),
                error: error.map(Into::into),
            })
            .await
        {
            error!(task_id = task.id.as_str(), err = %e, "failed to log task run");
        }

        let next_run = calculate_next_run(
            task.schedule_kind,
            &task.schedule_value,
            &self.config.scheduler.timezone,
        );
        let summary = result_summary(result, error);
        if let Err(e) = self
            .store
            .update_task_after_run(&task.id, next_run.as_deref(), &summary)
            .await
        {
            error!(task_id = task.id.as_str(), err = %e, "failed to update task after run");
        }

        debug!(
            task_id = task.id.as_str(),
            outcome = outcome.as_str(),
            duration_ms,
            next_run = next_run.as_deref().unwrap_or("none"),
            "scheduled task finished"
        );
    }
}

async fn persist_reply(store: &Arc<dyn Store>, chat_jid: &str, assistant_name: &str, text: &str) {
    let msg = ChatMessage {
        id: format!("assistant-{}", chrono::Utc::now().timestamp_micros()),
        chat_jid: chat_jid.to_string(),
        sender: "assistant".into(),
        sender_name: assistant_name.to_string(),
        content: text.to_string(),
        timestamp: now_iso(),
        is_from_assistant: true,
    };
    if let Err(e) = store.store_message(&msg).await {
        warn!(chat_jid, err = %e, "failed to persist assistant reply");
    }
}
