//! HTTP surface for the channel-adapter process.
//!
//! `/v1/ingress` normalizes and accepts/rejects inbound messages,
//! `/v1/send` and `/v1/edit` delegate outbound traffic (chunk-and-persist),
//! and `/v1/commands` evaluates slash commands and applies their effects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::config::Config;
use relay_core::now_iso;
use relay_core::traits::{Channel, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::commands::{self, CommandContext, CommandEffect, CommandRequest, CommandResult};
use crate::dispatch::channel_for;
use crate::message_loop::build_trigger_regex;
use crate::queue::GroupQueue;
use crate::sandbox::resolve_runtime;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub queue: GroupQueue,
    pub state: Arc<SharedState>,
    pub channels: Arc<Vec<Arc<dyn Channel>>>,
    pub groups_root: PathBuf,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/ingress", post(ingress))
        .route("/v1/send", post(send))
        .route("/v1/edit", post(edit))
        .route("/v1/commands", post(handle_command))
        .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}

/// Serve until the shutdown signal fires.
pub async fn serve(
    state: AppState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind = state.config.server.bind_address.clone();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = bind.as_str(), "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        })
        .await?;
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "relay",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn readyz(State(state): State<AppState>) -> Json<Value> {
    let store_connected = state.store.get_router_state("last_seen_ts").await.is_ok();
    let groups = state.state.groups.read().await.len();
    let active = state.queue.active_count().await;
    let channels: Vec<&str> = state.channels.iter().map(|c| c.name()).collect();

    Json(json!({
        "status": "ready",
        "store_connected": store_connected,
        "registered_groups": groups,
        "active_sandboxes": active,
        "channels": channels,
        "query_adapter_enabled": state.config.query_adapter.enabled,
        "max_concurrent_sandboxes": state.config.orchestrator.max_concurrent_sandboxes,
        "callback_url": state.config.server.callback_url,
    }))
}

#[derive(Debug, Deserialize)]
struct IngressRequest {
    chat_jid: String,
    chat_name: Option<String>,
    chat_type: Option<String>,
    message_id: String,
    sender_id: Option<String>,
    sender_name: Option<String>,
    content: String,
    timestamp: String,
    #[serde(default)]
    persist: bool,
}

#[derive(Debug, Serialize)]
struct IngressResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

/// Normalize + accept/reject an inbound message. Persistence is optional so
/// adapters can dry-run the routing decision.
async fn ingress(
    State(state): State<AppState>,
    Json(request): Json<IngressRequest>,
) -> Json<IngressResponse> {
    if request.persist {
        let is_group = !matches!(request.chat_type.as_deref(), Some("private"));
        if let Err(e) = state
            .store
            .store_chat_metadata(
                &request.chat_jid,
                request.chat_name.as_deref(),
                &request.timestamp,
                Some("telegram"),
                is_group,
            )
            .await
        {
            error!(err = %e, "failed to persist chat metadata");
        }
        let msg = relay_core::message::ChatMessage {
            id: request.message_id.clone(),
            chat_jid: request.chat_jid.clone(),
            sender: request.sender_id.clone().unwrap_or_default(),
            sender_name: request.sender_name.clone().unwrap_or_else(|| "Unknown".into()),
            content: request.content.clone(),
            timestamp: request.timestamp.clone(),
            is_from_assistant: false,
        };
        if let Err(e) = state.store.store_message(&msg).await {
            error!(err = %e, "failed to persist inbound message");
        }
    }

    let Some(group) = state.state.group_by_jid(&request.chat_jid).await else {
        return Json(IngressResponse {
            accepted: false,
            reason: Some("unregistered_group".into()),
            group_name: None,
            group_folder: None,
            runtime: None,
            model: None,
        });
    };

    let main_folder = &state.config.orchestrator.main_group_folder;
    let trigger_required = group.needs_trigger(main_folder);
    let trigger = group.trigger.trim();
    let pattern = build_trigger_regex(
        &state.config.relay.name,
        (!trigger.is_empty()).then_some(trigger),
    );
    let trigger_present = pattern.is_match(request.content.trim());
    let accepted = !trigger_required || trigger_present;

    let runtime = resolve_runtime(&group, &state.config);
    let model = group.model.clone().or_else(|| {
        state
            .config
            .runtimes
            .profiles
            .get(&runtime)
            .map(|p| p.default_model.clone())
    });

    Json(IngressResponse {
        accepted,
        reason: (!accepted).then(|| "trigger_required".into()),
        group_name: Some(group.name),
        group_folder: Some(group.folder),
        runtime: Some(runtime),
        model,
    })
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    jid: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
}

/// Outbound send, persisted as an assistant reply.
async fn send(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> (StatusCode, Json<SendResponse>) {
    let Some(channel) = channel_for(&state.channels, &request.jid) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(SendResponse {
                ok: false,
                error: Some(format!("no channel owns {}", request.jid)),
                message_id: None,
            }),
        );
    };

    match channel.send(&request.jid, &request.text).await {
        Ok(message_id) => {
            let record = relay_core::message::ChatMessage {
                id: format!("api-{}", chrono::Utc::now().timestamp_micros()),
                chat_jid: request.jid.clone(),
                sender: "assistant".into(),
                sender_name: state.config.relay.name.clone(),
                content: request.text.clone(),
                timestamp: now_iso(),
                is_from_assistant: true,
            };
            if let Err(e) = state.store.store_message(&record).await {
                error!(err = %e, "failed to persist outbound send");
            }
            (
                StatusCode::OK,
                Json(SendResponse {
                    ok: true,
                    error: None,
                    message_id,
                }),
            )
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(SendResponse {
                ok: false,
                error: Some(e.to_string()),
                message_id: None,
            }),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct EditRequest {
    jid: String,
    message_id: String,
    text: String,
}

async fn edit(
    State(state): State<AppState>,
    Json(request): Json<EditRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(channel) = channel_for(&state.channels, &request.jid) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": format!("no channel owns {}", request.jid)})),
        );
    };
    match channel.edit(&request.jid, &request.message_id, &request.text).await {
        Ok(ok) => (StatusCode::OK, Json(json!({"ok": ok}))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"ok": false, "error": e.to_string()})),
        ),
    }
}

/// Evaluate a slash command, then apply its effects.
async fn handle_command(
    State(state): State<AppState>,
    Json(mut request): Json<CommandRequest>,
) -> Json<CommandResult> {
    // Enrich from shared state: sandbox activity and the model the sandbox
    // last reported.
    request.sandbox_active = state.queue.is_active(&request.chat_jid).await;
    if request.current_model.is_none() {
        if let Some(folder) = request.group_folder.as_deref() {
            request.current_model = match state.state.reported_model(folder).await {
                Some(m) => Some(m),
                None => state
                    .state
                    .group_by_folder(folder)
                    .await
                    .and_then(|g| g.model),
            };
        }
    }
    if request.session_id.is_none() {
        if let Some(folder) = request.group_folder.as_deref() {
            request.session_id = state.state.session_for(folder).await;
        }
    }

    let ctx = CommandContext {
        assistant_name: &state.config.relay.name,
        catalog: &state.config.models,
        started_at: state.started_at,
    };
    let result = commands::handle_command(&request, &ctx);

    if !result.effects.is_empty() {
        apply_effects(
            &state,
            &request.chat_jid,
            request.group_folder.as_deref(),
            &result.effects,
        )
        .await;
    }

    Json(result)
}

async fn apply_effects(
    state: &AppState,
    chat_jid: &str,
    group_folder: Option<&str>,
    effects: &[CommandEffect],
) {
    for effect in effects {
        match effect {
            CommandEffect::KillSandbox => {
                state.queue.kill_group(chat_jid).await;
            }
            CommandEffect::ClearSession => {
                if let Some(folder) = group_folder {
                    state
                        .state
                        .clear_session(&state.store, folder, &state.groups_root)
                        .await;
                }
            }
            CommandEffect::SwitchModel { model_id, runtime } => {
                let Some(mut group) = state.state.group_by_jid(chat_jid).await else {
                    continue;
                };
                group.model = Some(model_id.clone());
                group.runtime = Some(runtime.clone());
                if let Err(e) = state.state.upsert_group(&state.store, group).await {
                    error!(chat_jid, err = %e, "failed to persist model switch");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use relay_core::error::RelayError;
    use relay_core::group::RegisteredGroup;
    use relay_store::SqliteStore;
    use tower::ServiceExt;

    struct MockChannel {
        sent: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }
        fn owns(&self, jid: &str) -> bool {
            jid.starts_with("tg:")
        }
        async fn send(&self, jid: &str, text: &str) -> Result<Option<String>, RelayError> {
            self.sent
                .lock()
                .unwrap()
                .push((jid.to_string(), text.to_string()));
            Ok(Some("42".into()))
        }
        async fn edit(&self, _jid: &str, _id: &str, _text: &str) -> Result<bool, RelayError> {
            Ok(true)
        }
    }

    async fn app_state() -> (AppState, Arc<MockChannel>, tempfile::TempDir) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect_in_memory().await.unwrap());
        let state = SharedState::load(&store).await;
        let channel = Arc::new(MockChannel {
            sent: std::sync::Mutex::new(Vec::new()),
        });
        let channels: Arc<Vec<Arc<dyn Channel>>> = Arc::new(vec![channel.clone()]);
        let dir = tempfile::tempdir().unwrap();
        let app = AppState {
            started_at: Instant::now(),
            config: Arc::new(Config::default()),
            store,
            queue: GroupQueue::new(3, "docker".into(), dir.path().to_path_buf()),
            state,
            channels,
            groups_root: dir.path().join("groups"),
        };
        (app, channel, dir)
    }

    fn group(jid: &str, folder: &str, requires_trigger: bool) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.into(),
            name: folder.into(),
            folder: folder.into(),
            trigger: String::new(),
            added_at: now_iso(),
            requires_trigger: Some(requires_trigger),
            runtime: None,
            model: None,
            sandbox_config: None,
        }
    }

    async fn body_json(resp: axum::http::Response<Body>) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(path: &str, body: Value) -> Request<Body> {
        Request::post(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (state, _, _dir) = app_state().await;
        let app = build_router(state);
        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "relay");
    }

    #[tokio::test]
    async fn readyz_reports_counts() {
        let (state, _, _dir) = app_state().await;
        state
            .state
            .upsert_group(&state.store, group("tg:1", "main", false))
            .await
            .unwrap();
        let app = build_router(state);
        let resp = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["store_connected"], true);
        assert_eq!(body["registered_groups"], 1);
        assert_eq!(body["active_sandboxes"], 0);
    }

    #[tokio::test]
    async fn ingress_rejects_unregistered_chat() {
        let (state, _, _dir) = app_state().await;
        let app = build_router(state);
        let resp = app
            .oneshot(post(
                "/v1/ingress",
                json!({
                    "chat_jid": "tg:404", "message_id": "1", "content": "hi",
                    "timestamp": "2026-01-01T10:00:00.000Z"
                }),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["accepted"], false);
        assert_eq!(body["reason"], "unregistered_group");
    }

    #[tokio::test]
    async fn ingress_applies_trigger_gate() {
        let (state, _, _dir) = app_state().await;
        state
            .state
            .upsert_group(&state.store, group("tg:2", "team", true))
            .await
            .unwrap();
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(post(
                "/v1/ingress",
                json!({
                    "chat_jid": "tg:2", "message_id": "1", "content": "hello",
                    "timestamp": "2026-01-01T10:00:00.000Z"
                }),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["accepted"], false);
        assert_eq!(body["reason"], "trigger_required");

        let resp = app
            .oneshot(post(
                "/v1/ingress",
                json!({
                    "chat_jid": "tg:2", "message_id": "2", "content": "@Relay hello",
                    "timestamp": "2026-01-01T10:00:01.000Z"
                }),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["accepted"], true);
        assert_eq!(body["group_folder"], "team");
        assert_eq!(body["runtime"], "claude");
    }

    #[tokio::test]
    async fn ingress_persists_when_asked() {
        let (state, _, _dir) = app_state().await;
        state
            .state
            .upsert_group(&state.store, group("tg:1", "main", false))
            .await
            .unwrap();
        let store = state.store.clone();
        let app = build_router(state);

        let resp = app
            .oneshot(post(
                "/v1/ingress",
                json!({
                    "chat_jid": "tg:1", "message_id": "m1", "content": "hi there",
                    "sender_name": "Alice",
                    "timestamp": "2026-01-01T10:00:00.000Z", "persist": true
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let stored = store
            .get_messages_since("tg:1", "")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "hi there");
    }

    #[tokio::test]
    async fn send_delivers_and_persists() {
        let (state, channel, _dir) = app_state().await;
        let store = state.store.clone();
        let app = build_router(state);

        let resp = app
            .oneshot(post("/v1/send", json!({"jid": "tg:1", "text": "outbound"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["message_id"], "42");
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        // Assistant replies are excluded from inbound queries but stored.
        assert!(store.get_messages_since("tg:1", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_without_owning_channel_is_rejected() {
        let (state, _, _dir) = app_state().await;
        let app = build_router(state);
        let resp = app
            .oneshot(post("/v1/send", json!({"jid": "wa:1", "text": "x"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn command_reset_applies_clear_session_effect() {
        let (state, _, _dir) = app_state().await;
        state
            .state
            .upsert_group(&state.store, group("tg:1", "main", false))
            .await
            .unwrap();
        state.state.record_session(&state.store, "main", "sess-1").await;

        let shared = state.state.clone();
        let app = build_router(state);
        let resp = app
            .oneshot(post(
                "/v1/commands",
                json!({
                    "chat_jid": "tg:1", "command": "reset",
                    "group_name": "Main", "group_folder": "main"
                }),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert!(body["text"].as_str().unwrap().contains("Session cleared"));
        assert_eq!(body["effects"][0], "ClearSession");
        assert!(shared.session_for("main").await.is_none());
    }

    #[tokio::test]
    async fn command_model_switch_updates_group() {
        let (state, _, _dir) = app_state().await;
        state
            .state
            .upsert_group(&state.store, group("tg:1", "main", false))
            .await
            .unwrap();
        let shared = state.state.clone();
        let app = build_router(state);

        let resp = app
            .oneshot(post(
                "/v1/commands",
                json!({
                    "chat_jid": "tg:1", "command": "model", "args": "gemini-3.1-pro",
                    "group_name": "Main", "group_folder": "main"
                }),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert!(body["text"].as_str().unwrap().contains("Switched"));

        let group = shared.group_by_jid("tg:1").await.unwrap();
        assert_eq!(group.model.as_deref(), Some("gemini-3.1-pro"));
        assert_eq!(group.runtime.as_deref(), Some("gemini"));
    }

    #[tokio::test]
    async fn unknown_command_always_replies() {
        let (state, _, _dir) = app_state().await;
        let app = build_router(state);
        let resp = app
            .oneshot(post(
                "/v1/commands",
                json!({"chat_jid": "tg:1", "command": "nope"}),
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert!(body["text"].as_str().unwrap().contains("Unknown command"));
    }
}
