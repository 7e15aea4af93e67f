//! Spawn one sandbox per invocation, stream its framed output, enforce the
//! idle and hard-deadline timers, and stop it cleanly.
//!
//! The idle timer never kills: it writes the IPC close sentinel and lets the
//! sandbox drain. The hard deadline requests a graceful engine stop and
//! forces termination only after the stop grace expires.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use relay_core::config::{Config, RuntimeProfile};
use relay_core::error::RelayError;
use relay_core::group::RegisteredGroup;
use relay_core::ipc::CLOSE_SENTINEL;
use relay_core::protocol::{FrameScanner, SandboxFrame, SandboxInput, SandboxStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::mounts::{build_mounts, MountAllowlist, MountSpec, SandboxSettings};
use super::secrets::{engine_args, read_secrets};
use super::{image_for_runtime, SANDBOX_NAME_PREFIX};

/// Cap on retained stdout/stderr for the run log.
const MAX_CAPTURE: usize = 1_048_576;

pub type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Called once per decoded frame, in stream order.
pub type FrameHook = Arc<dyn Fn(SandboxFrame) -> BoxFuture<()> + Send + Sync>;

/// Everything the runner needs, resolved once at startup.
#[derive(Clone)]
pub struct RunnerConfig {
    pub engine: String,
    pub project_root: PathBuf,
    pub groups_root: PathBuf,
    pub data_root: PathBuf,
    pub timezone: String,
    pub idle_timeout: Duration,
    pub hard_deadline: Duration,
    pub stop_grace: Duration,
    pub allowlist: Option<MountAllowlist>,
    pub profiles: BTreeMap<String, RuntimeProfile>,
    pub default_runtime: String,
}

impl RunnerConfig {
    pub fn from_config(
        config: &Config,
        project_root: PathBuf,
        allowlist: Option<MountAllowlist>,
    ) -> Self {
        Self {
            engine: config.runtimes.engine.clone(),
            groups_root: project_root.join(&config.store.groups_dir),
            data_root: project_root.join(&config.relay.data_root),
            project_root,
            timezone: config.scheduler.timezone.clone(),
            idle_timeout: Duration::from_millis(config.orchestrator.idle_timeout_ms),
            hard_deadline: Duration::from_millis(config.orchestrator.hard_deadline_ms),
            stop_grace: Duration::from_millis(config.orchestrator.stop_grace_ms),
            allowlist,
            profiles: config.runtimes.profiles.clone(),
            default_runtime: config.runtimes.default_runtime.clone(),
        }
    }
}

/// What one invocation amounted to once the process exited.
#[derive(Debug)]
pub struct RunReport {
    pub status: SandboxStatus,
    pub error: Option<String>,
    pub new_session_id: Option<String>,
    pub duration: Duration,
    /// At least one frame carried a non-null `result`.
    pub saw_final: bool,
    pub deadline_hit: bool,
}

/// Run one sandbox to completion. `name` is the engine-visible process name
/// (`agent-{folder}-{epoch_ms}`), minted by the caller so the queue can be
/// told about it before the first byte of output.
pub async fn run_sandbox(
    cfg: &RunnerConfig,
    group: &RegisteredGroup,
    input: &SandboxInput,
    runtime: &str,
    is_main: bool,
    name: &str,
    on_frame: FrameHook,
) -> Result<RunReport, RelayError> {
    let start = tokio::time::Instant::now();

    let settings: Option<SandboxSettings> = group
        .sandbox_config
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let hard_deadline = settings
        .as_ref()
        .and_then(|s| s.deadline_ms)
        .map(Duration::from_millis)
        .unwrap_or(cfg.hard_deadline);

    let mounts = build_mounts(
        &group.folder,
        is_main,
        runtime,
        &cfg.project_root,
        &cfg.groups_root,
        &cfg.data_root,
        settings.as_ref(),
        cfg.allowlist.as_ref(),
    );

    let image = image_for_runtime(&cfg.profiles, runtime, &cfg.default_runtime)
        .ok_or_else(|| RelayError::Sandbox(format!("no image for runtime {runtime}")))?;
    let args = engine_args(&mounts, name, image, &cfg.timezone);

    info!(
        group = group.name.as_str(),
        sandbox = name,
        runtime,
        mounts = mounts.len(),
        "spawning sandbox"
    );

    let mut child = Command::new(&cfg.engine)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RelayError::Sandbox(format!("failed to spawn sandbox: {e}")))?;

    // Secrets go into the stdin document and nowhere else.
    let mut doc = input.clone();
    let secret_names = cfg
        .profiles
        .get(runtime)
        .map(|p| p.required_secrets.clone())
        .unwrap_or_default();
    let secrets = read_secrets(&cfg.project_root, &secret_names);
    doc.secrets = (!secrets.is_empty()).then_some(secrets);
    let payload = serde_json::to_vec(&doc)?;
    drop(doc);

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await.map_err(RelayError::Io)?;
        stdin.shutdown().await.ok();
    }

    // Dedicated reader tasks; the select loop below stays cancel-safe.
    let stdout = child.stdout.take().expect("stdout piped");
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let stderr = child.stderr.take().expect("stderr piped");
    let stderr_log = Arc::new(std::sync::Mutex::new(String::new()));
    let stderr_capture = stderr_log.clone();
    let stderr_tag = group.folder.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if !line.trim().is_empty() {
                debug!(sandbox = stderr_tag.as_str(), "{line}");
            }
            let mut log = stderr_capture.lock().unwrap();
            if log.len() < MAX_CAPTURE {
                log.push_str(&line);
                log.push('\n');
            }
        }
    });

    let never = start + Duration::from_secs(86_400 * 365);
    let idle_sleep = tokio::time::sleep_until(start + cfg.idle_timeout);
    let hard_sleep = tokio::time::sleep_until(start + hard_deadline);
    let force_sleep = tokio::time::sleep_until(never);
    tokio::pin!(idle_sleep, hard_sleep, force_sleep);

    let mut scanner = FrameScanner::new();
    let mut stdout_log = String::new();
    let mut protocol_warned = false;
    let mut idle_fired = false;
    let mut deadline_hit = false;
    let mut force_fired = false;
    let mut saw_final = false;
    let mut new_session_id: Option<String> = None;

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => {
                let Some(line) = maybe_line else { break };
                if stdout_log.len() < MAX_CAPTURE {
                    stdout_log.push_str(&line);
                    stdout_log.push('\n');
                }

                let mut chunk = line;
                chunk.push('\n');
                for raw in scanner.push(&chunk) {
                    let frame: SandboxFrame = match serde_json::from_str(&raw) {
                        Ok(f) => f,
                        Err(e) => {
                            // One diagnostic per invocation; the stream keeps going.
                            if !protocol_warned {
                                warn!(group = group.name.as_str(), err = %e, "undecodable frame, skipping");
                                protocol_warned = true;
                            }
                            continue;
                        }
                    };

                    if let Some(sid) = &frame.new_session_id {
                        new_session_id = Some(sid.clone());
                    }
                    if frame.result.is_some() {
                        saw_final = true;
                    }
                    if frame.is_meaningful() {
                        idle_fired = false;
                        idle_sleep.as_mut().reset(tokio::time::Instant::now() + cfg.idle_timeout);
                    }
                    on_frame(frame).await;
                }
            }
            _ = &mut idle_sleep, if !idle_fired && !deadline_hit => {
                idle_fired = true;
                info!(sandbox = name, "idle timeout, requesting wind-down");
                write_close_sentinel(&cfg.data_root, &group.folder);
            }
            _ = &mut hard_sleep, if !deadline_hit => {
                deadline_hit = true;
                error!(sandbox = name, "hard deadline reached, requesting stop");
                let engine = cfg.engine.clone();
                let stop_name = name.to_string();
                tokio::spawn(async move {
                    stop_sandbox(&engine, &stop_name).await;
                });
                force_sleep.as_mut().reset(tokio::time::Instant::now() + cfg.stop_grace);
            }
            _ = &mut force_sleep, if deadline_hit && !force_fired => {
                force_fired = true;
                warn!(sandbox = name, "stop grace expired, killing");
                child.start_kill().ok();
            }
        }
    }

    // Stdout closed; give the process the stop grace to exit, then kill.
    let exit = match tokio::time::timeout(cfg.stop_grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(sandbox = name, err = %e, "wait failed");
            None
        }
        Err(_) => {
            child.start_kill().ok();
            child.wait().await.ok()
        }
    };

    let duration = start.elapsed();
    let exit_code = exit.and_then(|s| s.code());
    let exit_ok = exit.map(|s| s.success()).unwrap_or(false);
    let stderr_text = stderr_log.lock().unwrap().clone();

    write_run_log(
        &cfg.groups_root.join(&group.folder).join("logs"),
        name,
        &group.name,
        duration,
        exit_code,
        deadline_hit,
        saw_final,
        &mounts,
        &stdout_log,
        &stderr_text,
    )
    .await;

    // A deadline or bad exit after delivery is partial success: the reply is
    // already user-visible, so the batch must not rerun.
    let report = if deadline_hit && !saw_final {
        RunReport {
            status: SandboxStatus::Error,
            error: Some(format!(
                "sandbox hit hard deadline after {}ms",
                hard_deadline.as_millis()
            )),
            new_session_id: None,
            duration,
            saw_final,
            deadline_hit,
        }
    } else if !exit_ok && !saw_final {
        RunReport {
            status: SandboxStatus::Error,
            error: Some(format!(
                "sandbox exited with {}: {}",
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                tail(&stderr_text, 200)
            )),
            new_session_id: None,
            duration,
            saw_final,
            deadline_hit,
        }
    } else {
        if !exit_ok || deadline_hit {
            warn!(
                sandbox = name,
                exit_code = ?exit_code,
                deadline_hit,
                "sandbox ended badly after delivering output, keeping result"
            );
        }
        RunReport {
            status: SandboxStatus::Success,
            error: None,
            new_session_id,
            duration,
            saw_final,
            deadline_hit,
        }
    };

    info!(
        sandbox = name,
        duration_ms = duration.as_millis() as u64,
        status = ?report.status,
        saw_final,
        "sandbox finished"
    );
    Ok(report)
}

/// Graceful engine stop. Returns whether the engine accepted it.
pub async fn stop_sandbox(engine: &str, name: &str) -> bool {
    match Command::new(engine).args(["stop", name]).output().await {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            warn!(
                sandbox = name,
                stderr = String::from_utf8_lossy(&out.stderr).as_ref(),
                "engine stop refused"
            );
            false
        }
        Err(e) => {
            warn!(sandbox = name, err = %e, "engine stop failed");
            false
        }
    }
}

/// Stop leftover sandboxes from a previous daemon run.
pub async fn cleanup_orphans(engine: &str) {
    let output = match Command::new(engine)
        .args([
            "ps",
            "--filter",
            &format!("name={SANDBOX_NAME_PREFIX}"),
            "--format",
            "{{.Names}}",
        ])
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!(err = %e, "failed to list orphaned sandboxes");
            return;
        }
    };

    let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    for name in &names {
        stop_sandbox(engine, name).await;
    }
    if !names.is_empty() {
        info!(count = names.len(), "stopped orphaned sandboxes");
    }
}

fn write_close_sentinel(data_root: &Path, folder: &str) {
    let input_dir = data_root.join("ipc").join(folder).join("input");
    let _ = std::fs::create_dir_all(&input_dir);
    let _ = std::fs::write(input_dir.join(CLOSE_SENTINEL), "");
}

fn tail(text: &str, max: usize) -> &str {
    match text.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_run_log(
    logs_dir: &Path,
    name: &str,
    group_name: &str,
    duration: Duration,
    exit_code: Option<i32>,
    deadline_hit: bool,
    saw_final: bool,
    mounts: &[MountSpec],
    stdout_log: &str,
    stderr_log: &str,
) {
    let _ = tokio::fs::create_dir_all(logs_dir).await;
    let failed = deadline_hit || exit_code.unwrap_or(0) != 0;

    let mut lines = vec![
        format!("=== Sandbox Run {name}{} ===", if deadline_hit { " (DEADLINE)" } else { "" }),
        format!("Group: {group_name}"),
        format!("Duration: {}ms", duration.as_millis()),
        format!("Exit: {exit_code:?}"),
        format!("Delivered output: {saw_final}"),
        "=== Mounts ===".to_string(),
    ];
    for m in mounts {
        lines.push(format!(
            "{} -> {}{}",
            m.host.display(),
            m.guest,
            if m.read_only { " (ro)" } else { "" }
        ));
    }
    if failed {
        lines.push("=== Stderr ===".to_string());
        lines.push(stderr_log.to_string());
        lines.push("=== Stdout ===".to_string());
        lines.push(stdout_log.to_string());
    }

    let path = logs_dir.join(format!("{name}.log"));
    if let Err(e) = tokio::fs::write(&path, lines.join("\n")).await {
        warn!(path = %path.display(), err = %e, "failed to write run log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// A stand-in engine: a shell script that ignores the docker-style argv,
    /// drains stdin, and plays back a canned stdout.
    fn fake_engine(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-engine");
        let script = format!("#!/bin/sh\nif [ \"$1\" = stop ] || [ \"$1\" = ps ]; then exit 0; fi\ncat > /dev/null\n{body}\n");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn runner_config(tmp: &TempDir, engine: String) -> RunnerConfig {
        RunnerConfig {
            engine,
            project_root: tmp.path().to_path_buf(),
            groups_root: tmp.path().join("groups"),
            data_root: tmp.path().join("data"),
            timezone: "UTC".into(),
            idle_timeout: Duration::from_secs(30),
            hard_deadline: Duration::from_secs(60),
            stop_grace: Duration::from_millis(500),
            allowlist: None,
            profiles: Config::default().runtimes.profiles,
            default_runtime: "claude".into(),
        }
    }

    fn group() -> RegisteredGroup {
        RegisteredGroup {
            jid: "tg:1".into(),
            name: "Main".into(),
            folder: "main".into(),
            trigger: String::new(),
            added_at: String::new(),
            requires_trigger: None,
            runtime: None,
            model: None,
            sandbox_config: None,
        }
    }

    fn input() -> SandboxInput {
        SandboxInput {
            prompt: "[Alice]: hi".into(),
            session_id: None,
            group_folder: "main".into(),
            chat_jid: "tg:1".into(),
            is_main: true,
            is_scheduled: None,
            assistant_name: Some("Relay".into()),
            model: None,
            secrets: None,
        }
    }

    fn collecting_hook() -> (FrameHook, Arc<Mutex<Vec<SandboxFrame>>>) {
        let frames: Arc<Mutex<Vec<SandboxFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let hook: FrameHook = Arc::new(move |frame| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(frame);
            })
        });
        (hook, frames)
    }

    #[tokio::test]
    async fn success_run_decodes_frames_and_captures_session() {
        let tmp = TempDir::new().unwrap();
        let engine = fake_engine(
            tmp.path(),
            concat!(
                "echo 'boot noise'\n",
                "echo '---OUTPUT_START---'\n",
                "echo '{\"status\":\"success\",\"result\":null,\"new_session_id\":\"sess-9\"}'\n",
                "echo '---OUTPUT_END---'\n",
                "echo '---OUTPUT_START---'\n",
                "echo '{\"status\":\"success\",\"result\":\"hello\"}'\n",
                "echo '---OUTPUT_END---'\n",
            ),
        );
        let cfg = runner_config(&tmp, engine);
        let (hook, frames) = collecting_hook();

        let report = run_sandbox(&cfg, &group(), &input(), "claude", true, "agent-main-1", hook)
            .await
            .unwrap();

        assert_eq!(report.status, SandboxStatus::Success);
        assert!(report.saw_final);
        assert!(!report.deadline_hit);
        assert_eq!(report.new_session_id.as_deref(), Some("sess-9"));

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].result.as_deref(), Some("hello"));

        assert!(tmp.path().join("groups/main/logs/agent-main-1.log").exists());
    }

    #[tokio::test]
    async fn nonzero_exit_without_frames_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let engine = fake_engine(tmp.path(), "echo 'boom' >&2\nexit 3");
        let cfg = runner_config(&tmp, engine);
        let (hook, _) = collecting_hook();

        let report = run_sandbox(&cfg, &group(), &input(), "claude", true, "agent-main-2", hook)
            .await
            .unwrap();
        assert_eq!(report.status, SandboxStatus::Error);
        let err = report.error.unwrap();
        assert!(err.contains("exited with 3"), "{err}");
        assert!(err.contains("boom"));
    }

    #[tokio::test]
    async fn nonzero_exit_after_final_is_partial_success() {
        let tmp = TempDir::new().unwrap();
        let engine = fake_engine(
            tmp.path(),
            concat!(
                "echo '---OUTPUT_START---'\n",
                "echo '{\"status\":\"success\",\"result\":\"answer\"}'\n",
                "echo '---OUTPUT_END---'\n",
                "exit 1",
            ),
        );
        let cfg = runner_config(&tmp, engine);
        let (hook, _) = collecting_hook();

        let report = run_sandbox(&cfg, &group(), &input(), "claude", true, "agent-main-3", hook)
            .await
            .unwrap();
        assert_eq!(report.status, SandboxStatus::Success);
        assert!(report.saw_final);
    }

    #[tokio::test]
    async fn idle_timeout_writes_close_sentinel() {
        let tmp = TempDir::new().unwrap();
        let engine = fake_engine(tmp.path(), "sleep 1");
        let mut cfg = runner_config(&tmp, engine);
        cfg.idle_timeout = Duration::from_millis(150);
        let (hook, _) = collecting_hook();

        let report = run_sandbox(&cfg, &group(), &input(), "claude", true, "agent-main-4", hook)
            .await
            .unwrap();
        assert!(tmp.path().join("data/ipc/main/input/_close").exists());
        // A quiet clean exit is not an error.
        assert_eq!(report.status, SandboxStatus::Success);
        assert!(!report.saw_final);
    }

    #[tokio::test]
    async fn hard_deadline_without_output_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let engine = fake_engine(tmp.path(), "exec sleep 30");
        let mut cfg = runner_config(&tmp, engine);
        cfg.idle_timeout = Duration::from_secs(30);
        cfg.hard_deadline = Duration::from_millis(300);
        cfg.stop_grace = Duration::from_millis(200);
        let (hook, _) = collecting_hook();

        let started = std::time::Instant::now();
        let report = run_sandbox(&cfg, &group(), &input(), "claude", true, "agent-main-5", hook)
            .await
            .unwrap();
        assert!(report.deadline_hit);
        assert_eq!(report.status, SandboxStatus::Error);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn undecodable_frame_is_skipped_stream_continues() {
        let tmp = TempDir::new().unwrap();
        let engine = fake_engine(
            tmp.path(),
            concat!(
                "echo '---OUTPUT_START---'\n",
                "echo 'this is not json'\n",
                "echo '---OUTPUT_END---'\n",
                "echo '---OUTPUT_START---'\n",
                "echo '{\"status\":\"success\",\"result\":\"ok\"}'\n",
                "echo '---OUTPUT_END---'\n",
            ),
        );
        let cfg = runner_config(&tmp, engine);
        let (hook, frames) = collecting_hook();

        let report = run_sandbox(&cfg, &group(), &input(), "claude", true, "agent-main-6", hook)
            .await
            .unwrap();
        assert_eq!(report.status, SandboxStatus::Success);
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn tail_is_char_safe() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 10), "ab");
        let s = "héllo wörld";
        assert!(s.ends_with(tail(s, 4)));
    }
}
