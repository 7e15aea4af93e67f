//! Per-group serialization queue with a global concurrency cap.
//!
//! Within a group all work is strictly serial; across groups at most
//! `max_concurrent` sandboxes run, and saturated groups wait FIFO. Queued
//! scheduled tasks always run before a pending message batch. Follow-up
//! messages reach an active sandbox through its IPC `input/` directory
//! instead of spawning a second one.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_core::ipc::{self, FollowUp, CLOSE_SENTINEL};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 5;
const BASE_RETRY_MS: u64 = 5000;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback that processes the pending message batch for a group.
/// Returns true on success; false triggers the retry path.
pub type MessageBatchFn = Arc<dyn Fn(String) -> BoxFuture<bool> + Send + Sync>;

/// A queued scheduled-task execution.
pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

/// Invoked when a message batch is dropped after exhausting retries.
pub type BatchDroppedFn = Arc<dyn Fn(String) -> BoxFuture<()> + Send + Sync>;

struct QueuedTask {
    id: String,
    run: TaskFn,
}

#[derive(Default)]
struct GroupState {
    active: bool,
    /// The sandbox told us it reached an idle point.
    idle_waiting: bool,
    /// The current slot is a scheduled-task run (no follow-up piping).
    task_run: bool,
    /// At most one unserviced message-check per group.
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    sandbox_name: Option<String>,
    folder: Option<String>,
    retry_count: u32,
    /// Set by `kill_group`; suppresses the retry path for the current run.
    killed: bool,
}

struct Inner {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    max_concurrent: usize,
    waiting: VecDeque<String>,
    batch_fn: Option<MessageBatchFn>,
    batch_dropped_fn: Option<BatchDroppedFn>,
    shutting_down: bool,
}

impl Inner {
    fn entry(&mut self, jid: &str) -> &mut GroupState {
        self.groups.entry(jid.to_string()).or_default()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    engine: String,
    data_root: PathBuf,
    follow_up_seq: AtomicU64,
}

enum Work {
    Messages(String),
    Task(String, QueuedTask),
}

/// The queue handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct GroupQueue {
    shared: Arc<Shared>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, engine: String, data_root: PathBuf) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    groups: HashMap::new(),
                    active_count: 0,
                    max_concurrent,
                    waiting: VecDeque::new(),
                    batch_fn: None,
                    batch_dropped_fn: None,
                    shutting_down: false,
                }),
                engine,
                data_root,
                follow_up_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Set the callback invoked to process a group's message batch.
    pub async fn set_message_batch_fn(&self, f: MessageBatchFn) {
        self.shared.inner.lock().await.batch_fn = Some(f);
    }

    /// Set the callback invoked when a batch is dropped after max retries.
    pub async fn set_batch_dropped_fn(&self, f: BatchDroppedFn) {
        self.shared.inner.lock().await.batch_dropped_fn = Some(f);
    }

    /// Request message processing for a group. Coalesces into the single
    /// pending flag when the group is busy or the cap is saturated.
    pub async fn enqueue_message_check(&self, jid: &str) {
        let claimed = {
            let mut inner = self.shared.inner.lock().await;
            if inner.shutting_down {
                return;
            }
            let state = inner.entry(jid);
            if state.active {
                state.pending_messages = true;
                debug!(jid, "sandbox active, message check queued");
                return;
            }
            if inner.active_count >= inner.max_concurrent {
                let jid_owned = jid.to_string();
                inner.entry(jid).pending_messages = true;
                if !inner.waiting.contains(&jid_owned) {
                    inner.waiting.push_back(jid_owned);
                }
                debug!(jid, active = inner.active_count, "at cap, message check queued");
                return;
            }
            mark_active(&mut inner, jid, false);
            true
        };

        if claimed {
            spawn_work(self.shared.clone(), Work::Messages(jid.to_string()));
        }
    }

    /// Queue a scheduled-task run. Tasks take priority over message batches
    /// when the group next becomes free. Duplicate task ids are dropped.
    pub async fn enqueue_task(&self, jid: &str, task_id: &str, run: TaskFn) {
        let claimed = {
            let mut inner = self.shared.inner.lock().await;
            if inner.shutting_down {
                return;
            }
            let data_root = self.shared.data_root.clone();
            let state = inner.entry(jid);

            if state.pending_tasks.iter().any(|t| t.id == task_id) {
                debug!(jid, task_id, "task already queued, skipping");
                return;
            }

            if state.active {
                let close_folder = state.idle_waiting.then(|| state.folder.clone()).flatten();
                state.pending_tasks.push_back(QueuedTask {
                    id: task_id.to_string(),
                    run,
                });
                // An idle sandbox holding the slot is asked to wind down so
                // the task can take it.
                if let Some(folder) = close_folder {
                    write_close_sentinel(&data_root, &folder);
                }
                debug!(jid, task_id, "sandbox active, task queued");
                return;
            }

            if inner.active_count >= inner.max_concurrent {
                let jid_owned = jid.to_string();
                inner.entry(jid).pending_tasks.push_back(QueuedTask {
                    id: task_id.to_string(),
                    run,
                });
                if !inner.waiting.contains(&jid_owned) {
                    inner.waiting.push_back(jid_owned);
                }
                debug!(jid, task_id, "at cap, task queued");
                return;
            }

            mark_active(&mut inner, jid, true);
            Some(QueuedTask {
                id: task_id.to_string(),
                run,
            })
        };

        if let Some(task) = claimed {
            spawn_work(self.shared.clone(), Work::Task(jid.to_string(), task));
        }
    }

    /// Pipe a follow-up prompt into the group's running sandbox. Returns
    /// false when there is nothing to pipe into (caller dispatches normally).
    pub async fn send_follow_up(&self, jid: &str, text: &str) -> bool {
        let input_dir = {
            let inner = self.shared.inner.lock().await;
            let Some(state) = inner.groups.get(jid) else {
                return false;
            };
            if !state.active || state.task_run {
                return false;
            }
            let Some(folder) = state.folder.as_ref() else {
                return false;
            };
            self.shared.data_root.join("ipc").join(folder).join("input")
        };

        let seq = self.shared.follow_up_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{seq:04}.json", chrono::Utc::now().timestamp_millis());
        let payload = match serde_json::to_string(&FollowUp { text: text.into() }) {
            Ok(p) => p,
            Err(e) => {
                error!(err = %e, "failed to encode follow-up");
                return false;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&input_dir) {
            error!(err = %e, "failed to create IPC input dir");
            return false;
        }
        match ipc::write_atomic(&input_dir.join(name), &payload) {
            Ok(()) => true,
            Err(e) => {
                error!(err = %e, "failed to write follow-up file");
                false
            }
        }
    }

    /// Ask the group's sandbox to exit after draining its input. Used by the
    /// idle timer.
    pub async fn close_stdin(&self, jid: &str) {
        let inner = self.shared.inner.lock().await;
        if let Some(state) = inner.groups.get(jid) {
            if state.active {
                if let Some(folder) = &state.folder {
                    write_close_sentinel(&self.shared.data_root, folder);
                }
            }
        }
    }

    /// The sandbox reports an idle point. Preempts it when tasks are queued.
    pub async fn notify_idle(&self, jid: &str) {
        let mut inner = self.shared.inner.lock().await;
        let data_root = self.shared.data_root.clone();
        let state = inner.entry(jid);
        state.idle_waiting = true;
        if !state.pending_tasks.is_empty() {
            if let Some(folder) = state.folder.clone() {
                write_close_sentinel(&data_root, &folder);
            }
        }
    }

    /// Forceful stop of the group's sandbox (reset, model switch). The
    /// current run finishes with an error but is not retried.
    pub async fn kill_group(&self, jid: &str) -> bool {
        let name = {
            let mut inner = self.shared.inner.lock().await;
            let state = inner.entry(jid);
            match (state.active, state.sandbox_name.clone()) {
                (true, Some(name)) => {
                    state.killed = true;
                    name
                }
                _ => return false,
            }
        };

        match tokio::process::Command::new(&self.shared.engine)
            .args(["stop", &name])
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                info!(jid, sandbox = name.as_str(), "sandbox stopped");
                true
            }
            Ok(_) => {
                warn!(jid, sandbox = name.as_str(), "failed to stop sandbox");
                false
            }
            Err(e) => {
                error!(jid, sandbox = name.as_str(), err = %e, "engine stop error");
                false
            }
        }
    }

    pub async fn is_active(&self, jid: &str) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.groups.get(jid).map(|s| s.active).unwrap_or(false)
    }

    pub async fn active_count(&self) -> usize {
        self.shared.inner.lock().await.active_count
    }

    /// Called by the runner once the process exists, so the queue can tag
    /// follow-ups and later reach the process for stops.
    pub async fn register_process(&self, jid: &str, sandbox_name: &str, folder: &str) {
        let mut inner = self.shared.inner.lock().await;
        let state = inner.entry(jid);
        state.sandbox_name = Some(sandbox_name.to_string());
        state.folder = Some(folder.to_string());
    }

    /// Stop accepting work, wait up to `grace` for active sandboxes, then
    /// detach; in-flight conversations finish on their own idle timers.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.shutting_down = true;
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let active = self.active_count().await;
            if active == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let inner = self.shared.inner.lock().await;
        let detached: Vec<String> = inner
            .groups
            .values()
            .filter(|s| s.active)
            .filter_map(|s| s.sandbox_name.clone())
            .collect();
        info!(
            active = inner.active_count,
            detached = ?detached,
            "queue shut down (sandboxes detached, not killed)"
        );
    }
}

/// Mark a group as holding a slot. Caller must hold the lock and have
/// verified capacity.
fn mark_active(inner: &mut Inner, jid: &str, task_run: bool) {
    let state = inner.entry(jid);
    state.active = true;
    state.idle_waiting = false;
    state.task_run = task_run;
    state.killed = false;
    if !task_run {
        state.pending_messages = false;
    }
    inner.active_count += 1;
}

/// Pick the next runnable work item, preferring the just-freed group so its
/// backlog drains serially, then waiting groups FIFO. Tasks before messages.
fn claim_next(inner: &mut Inner, prefer: Option<&str>) -> Option<Work> {
    if inner.shutting_down || inner.active_count >= inner.max_concurrent {
        return None;
    }

    let mut candidates: Vec<String> = Vec::new();
    if let Some(jid) = prefer {
        candidates.push(jid.to_string());
    }
    while let Some(jid) = inner.waiting.pop_front() {
        candidates.push(jid);
    }

    let mut unclaimed = Vec::new();
    let mut picked = None;
    for jid in candidates {
        if picked.is_some() {
            unclaimed.push(jid);
            continue;
        }
        let state = inner.entry(&jid);
        if state.active {
            continue;
        }
        if let Some(task) = state.pending_tasks.pop_front() {
            mark_active(inner, &jid, true);
            picked = Some(Work::Task(jid, task));
        } else if state.pending_messages {
            mark_active(inner, &jid, false);
            picked = Some(Work::Messages(jid));
        }
    }
    // Untouched waiters keep their FIFO position.
    for jid in unclaimed.into_iter().rev() {
        inner.waiting.push_front(jid);
    }
    picked
}

fn spawn_work(shared: Arc<Shared>, work: Work) {
    tokio::spawn(async move {
        match work {
            Work::Messages(jid) => run_messages(shared, jid).await,
            Work::Task(jid, task) => run_task(shared, jid, task).await,
        }
    });
}

async fn run_messages(shared: Arc<Shared>, jid: String) {
    debug!(jid = jid.as_str(), "processing message batch");
    let batch_fn = shared.inner.lock().await.batch_fn.clone();
    let ok = match batch_fn {
        Some(f) => f(jid.clone()).await,
        None => {
            warn!(jid = jid.as_str(), "no message batch callback set");
            false
        }
    };
    finish(shared, jid, Some(ok)).await;
}

async fn run_task(shared: Arc<Shared>, jid: String, task: QueuedTask) {
    debug!(jid = jid.as_str(), task_id = task.id.as_str(), "running queued task");
    (task.run)().await;
    finish(shared, jid, None).await;
}

/// Release the slot, handle message-batch retry bookkeeping, then hand free
/// capacity to the next pending work items.
async fn finish(shared: Arc<Shared>, jid: String, batch_ok: Option<bool>) {
    let mut next = Vec::new();
    {
        let mut inner = shared.inner.lock().await;
        let state = inner.entry(&jid);
        let killed = std::mem::take(&mut state.killed);
        state.active = false;
        state.task_run = false;
        state.idle_waiting = false;
        state.sandbox_name = None;
        inner.active_count = inner.active_count.saturating_sub(1);

        match batch_ok {
            Some(true) => inner.entry(&jid).retry_count = 0,
            Some(false) if killed => {
                // A deliberate stop is not a failure worth retrying.
                inner.entry(&jid).retry_count = 0;
            }
            Some(false) => {
                let state = inner.entry(&jid);
                state.retry_count += 1;
                let retry = state.retry_count;
                if retry <= MAX_RETRIES {
                    let delay = Duration::from_millis(BASE_RETRY_MS * 2u64.pow(retry - 1));
                    info!(jid = jid.as_str(), retry, delay_ms = delay.as_millis() as u64,
                        "message batch failed, scheduling retry");
                    let queue = GroupQueue {
                        shared: shared.clone(),
                    };
                    let retry_jid = jid.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.enqueue_message_check(&retry_jid).await;
                    });
                } else {
                    error!(jid = jid.as_str(), retry,
                        "max retries exceeded, dropping batch until next inbound message");
                    state.retry_count = 0;
                    if let Some(dropped) = inner.batch_dropped_fn.clone() {
                        let dropped_jid = jid.clone();
                        tokio::spawn(async move {
                            dropped(dropped_jid).await;
                        });
                    }
                }
            }
            None => {}
        }

        while let Some(work) = claim_next(&mut inner, Some(&jid)) {
            next.push(work);
        }
    }

    for work in next {
        spawn_work(shared.clone(), work);
    }
}

fn write_close_sentinel(data_root: &std::path::Path, folder: &str) {
    let input_dir = data_root.join("ipc").join(folder).join("input");
    if let Err(e) = std::fs::create_dir_all(&input_dir) {
        error!(err = %e, "failed to create IPC input dir");
        return;
    }
    let _ = std::fs::write(input_dir.join(CLOSE_SENTINEL), "");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(max: usize, dir: &std::path::Path) -> GroupQueue {
        GroupQueue::new(max, "docker".into(), dir.to_path_buf())
    }

    /// Batch callback that parks until released, counting concurrent runs.
    fn gated_batch_fn(
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        release: Arc<tokio::sync::Notify>,
    ) -> MessageBatchFn {
        Arc::new(move |_jid| {
            let running = running.clone();
            let peak = peak.clone();
            let release = release.clone();
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                release.notified().await;
                running.fetch_sub(1, Ordering::SeqCst);
                true
            })
        })
    }

    #[tokio::test]
    async fn new_queue_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(3, dir.path());
        assert_eq!(q.active_count().await, 0);
        assert!(!q.is_active("tg:1").await);
    }

    #[tokio::test]
    async fn global_cap_is_never_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(2, dir.path());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());
        q.set_message_batch_fn(gated_batch_fn(running.clone(), peak.clone(), release.clone()))
            .await;

        q.enqueue_message_check("tg:a").await;
        q.enqueue_message_check("tg:b").await;
        q.enqueue_message_check("tg:c").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(q.active_count().await, 2);
        assert!(!q.is_active("tg:c").await);

        // Finish one; the waiter is promoted.
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(q.is_active("tg:c").await);
        assert!(peak.load(Ordering::SeqCst) <= 2);

        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.active_count().await, 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn within_group_work_is_serial() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(3, dir.path());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());
        q.set_message_batch_fn(gated_batch_fn(running.clone(), peak.clone(), release.clone()))
            .await;

        q.enqueue_message_check("tg:a").await;
        q.enqueue_message_check("tg:a").await;
        q.enqueue_message_check("tg:a").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One run at a time for the same group, no matter how many checks.
        assert_eq!(q.active_count().await, 1);
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(peak.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn queued_task_runs_before_pending_messages() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(1, dir.path());
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let order_m = order.clone();
        q.set_message_batch_fn(Arc::new(move |_jid| {
            let order = order_m.clone();
            Box::pin(async move {
                order.lock().await.push("messages");
                true
            })
        }))
        .await;

        // Occupy the only slot with another group so tg:a queues both kinds.
        let hold = Arc::new(tokio::sync::Notify::new());
        let hold_for_blocker = hold.clone();
        q.enqueue_task(
            "tg:blocker",
            "blocker",
            Box::new(move || {
                let hold = hold_for_blocker.clone();
                Box::pin(async move {
                    hold.notified().await;
                })
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.enqueue_message_check("tg:a").await;
        let order_t = order.clone();
        q.enqueue_task(
            "tg:a",
            "t1",
            Box::new(move || {
                let order = order_t.clone();
                Box::pin(async move {
                    order.lock().await.push("task");
                })
            }),
        )
        .await;

        hold.notify_waiters();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let order = order.lock().await;
        assert_eq!(order.as_slice(), ["task", "messages"]);
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(1, dir.path());
        let ran = Arc::new(AtomicUsize::new(0));

        // Block the slot so tasks queue rather than run.
        let hold = Arc::new(tokio::sync::Notify::new());
        let hold_b = hold.clone();
        q.enqueue_task(
            "tg:blocker",
            "blocker",
            Box::new(move || {
                let hold = hold_b.clone();
                Box::pin(async move {
                    hold.notified().await;
                })
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..3 {
            let ran = ran.clone();
            q.enqueue_task(
                "tg:a",
                "same-id",
                Box::new(move || {
                    let ran = ran.clone();
                    Box::pin(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;
        }

        hold.notify_waiters();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn follow_up_requires_registered_active_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(2, dir.path());
        assert!(!q.send_follow_up("tg:a", "hello").await);

        // Park a batch so the group stays active while we pipe.
        let release = Arc::new(tokio::sync::Notify::new());
        let release_b = release.clone();
        q.set_message_batch_fn(Arc::new(move |_| {
            let release = release_b.clone();
            Box::pin(async move {
                release.notified().await;
                true
            })
        }))
        .await;
        q.enqueue_message_check("tg:a").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.register_process("tg:a", "agent-main-1", "main").await;

        assert!(q.send_follow_up("tg:a", "more input").await);
        let input_dir = dir.path().join("ipc/main/input");
        let files: Vec<_> = std::fs::read_dir(&input_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .collect();
        assert_eq!(files.len(), 1);
        let payload = std::fs::read_to_string(files[0].path()).unwrap();
        assert!(payload.contains("more input"));

        release.notify_waiters();
    }

    #[tokio::test]
    async fn close_stdin_writes_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(2, dir.path());
        let release = Arc::new(tokio::sync::Notify::new());
        let release_b = release.clone();
        q.set_message_batch_fn(Arc::new(move |_| {
            let release = release_b.clone();
            Box::pin(async move {
                release.notified().await;
                true
            })
        }))
        .await;
        q.enqueue_message_check("tg:a").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.register_process("tg:a", "agent-main-1", "main").await;

        q.close_stdin("tg:a").await;
        assert!(dir.path().join("ipc/main/input/_close").exists());
        release.notify_waiters();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(3, dir.path());
        q.shutdown(Duration::from_millis(10)).await;
        q.enqueue_message_check("tg:a").await;
        assert!(!q.is_active("tg:a").await);
    }

    #[tokio::test]
    async fn failed_batch_retries_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(1, dir.path());
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_b = attempts.clone();
        q.set_message_batch_fn(Arc::new(move |_| {
            let attempts = attempts_b.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                false
            })
        }))
        .await;

        tokio::time::pause();
        q.enqueue_message_check("tg:a").await;
        // First attempt plus one retry after the 5 s base backoff.
        for _ in 0..60 {
            tokio::time::advance(Duration::from_millis(200)).await;
        }
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }
}
