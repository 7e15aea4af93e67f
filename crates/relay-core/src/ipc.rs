//! Filesystem IPC formats exchanged between sandboxes and the host.
//!
//! Each group owns `{data_root}/ipc/{folder}/` with five subdirectories:
//! `input/` (host → sandbox follow-ups plus the close sentinel), `messages/`,
//! `tasks/`, `queries/` and `responses/`. Every write is atomic: a `.tmp`
//! file renamed into place, so readers never observe partial JSON.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::task::{ContextMode, ScheduleKind};

/// Sentinel file in `input/` asking a sandbox to exit after draining.
pub const CLOSE_SENTINEL: &str = "_close";

/// Subdirectories created in each group's IPC namespace.
pub const IPC_SUBDIRS: &[&str] = &["input", "messages", "tasks", "queries", "responses"];

/// A follow-up prompt piped into a running sandbox via `input/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub text: String,
}

/// Outbound chat message emitted by a sandbox via `messages/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub chat_jid: String,
    pub text: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub group_folder: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Task-lifecycle request emitted by a sandbox via `tasks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRequest {
    ScheduleTask {
        prompt: String,
        schedule_kind: ScheduleKind,
        schedule_value: String,
        #[serde(default)]
        context_mode: ContextMode,
        #[serde(default)]
        target_jid: Option<String>,
        #[serde(default)]
        created_by: Option<String>,
    },
    PauseTask {
        task_id: String,
    },
    ResumeTask {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: String,
    },
}

/// Host-side lookup request written into `queries/` as `{uuid}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub uuid: String,
    #[serde(rename = "type")]
    pub query_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Reply written into `responses/{uuid}.json`; the sandbox deletes it after
/// reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryReply {
    pub status: String,
    pub result: String,
}

impl QueryReply {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            status: "ok".into(),
            result: result.into(),
        }
    }

    pub fn error(result: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            result: result.into(),
        }
    }
}

/// Write `contents` to `path` atomically (temp file, then rename).
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
