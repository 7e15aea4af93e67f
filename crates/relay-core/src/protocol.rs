//! Sandbox wire protocol.
//!
//! Input is a single JSON document on the sandbox's stdin. Output is a byte
//! stream in which framed records are delimited by two fixed sentinel lines;
//! anything outside a frame is log noise and is ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel line opening a framed record on sandbox stdout.
pub const FRAME_START: &str = "---OUTPUT_START---";
/// Sentinel line closing a framed record.
pub const FRAME_END: &str = "---OUTPUT_END---";

/// The one JSON document written to sandbox stdin.
///
/// Secrets travel only here, never into mounted files or the environment of
/// child shells the sandbox spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Success,
    Error,
}

/// Incremental event inside a frame: a tool invocation starting, or a chunk
/// of assistant text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ToolStart {
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        tool_input: Option<String>,
    },
    TextDelta {
        #[serde(default)]
        text: Option<String>,
    },
}

/// One decoded framed record from sandbox stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFrame {
    pub status: SandboxStatus,
    /// Non-null marks a final reply for the invocation.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<StreamEvent>,
}

impl SandboxFrame {
    /// Frames that refresh the idle timer: a final result or a tool/text
    /// event. Session-keepalive frames (result null, no event) do not.
    pub fn is_meaningful(&self) -> bool {
        self.result.is_some() || self.event.is_some()
    }
}

/// Extract complete frame payloads from a buffer.
///
/// Returns the raw JSON between each complete sentinel pair plus the number
/// of bytes consumed. An unterminated frame stays in the buffer for the next
/// read; surrounding noise is skipped.
pub fn extract_frames(buf: &str) -> (Vec<String>, usize) {
    let mut payloads = Vec::new();
    let mut consumed = 0;
    let mut from = 0;

    loop {
        let Some(rel_start) = buf[from..].find(FRAME_START) else {
            break;
        };
        let after_start = from + rel_start + FRAME_START.len();
        let Some(rel_end) = buf[after_start..].find(FRAME_END) else {
            break;
        };
        let end = after_start + rel_end;
        payloads.push(buf[after_start..end].trim().to_string());
        consumed = end + FRAME_END.len();
        from = consumed;
    }

    (payloads, consumed)
}

/// Incremental scanner over a sandbox's stdout stream.
///
/// Feed it chunks as they arrive; it yields raw frame payloads as soon as a
/// closing sentinel is seen and tolerates partial lines, interleaved noise,
/// and multiple frames per chunk.
#[derive(Default)]
pub struct FrameScanner {
    buf: String,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk, returning any completed frame payloads.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let (payloads, consumed) = extract_frames(&self.buf);
        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        // Pure noise never becomes a frame; drop it so the buffer stays
        // bounded. The sentinels arrive on their own lines, so a retained
        // chunk that lacks the opening sentinel cannot be a partial frame.
        if !self.buf.contains(FRAME_START) && self.buf.ends_with('\n') {
            self.buf.clear();
        }
        payloads
    }
}
