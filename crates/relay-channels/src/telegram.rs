//! Telegram Bot API channel.
//!
//! Owns `tg:`-prefixed JIDs. Sends via `sendMessage`, progressive edits via
//! `editMessageText`, typing via `sendChatAction`.
//! Docs: <https://core.telegram.org/bots/api>

use async_trait::async_trait;
use relay_core::config::TelegramConfig;
use relay_core::error::RelayError;
use relay_core::traits::Channel;
use serde::Deserialize;
use tracing::debug;

/// Telegram's hard cap on message text length.
pub const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram channel using the Bot API.
pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TgEnvelope {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{API_BASE}/bot{}", config.bot_token),
        }
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<TgEnvelope, RelayError> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Channel(format!("telegram {method} failed: {e}")))?;
        let envelope: TgEnvelope = resp
            .json()
            .await
            .map_err(|e| RelayError::Channel(format!("telegram {method} parse failed: {e}")))?;
        if !envelope.ok {
            return Err(RelayError::Channel(format!(
                "telegram {method}: {}",
                envelope.description.as_deref().unwrap_or("ok=false")
            )));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn owns(&self, jid: &str) -> bool {
        jid.starts_with("tg:")
    }

    fn max_text_len(&self) -> usize {
        TELEGRAM_MAX_TEXT_CHARS
    }

    async fn send(&self, jid: &str, text: &str) -> Result<Option<String>, RelayError> {
        if text.trim().is_empty() {
            return Err(RelayError::Channel("refusing to send empty message".into()));
        }
        let chat_id = chat_id_of(jid);

        // Oversize texts go out as multiple messages; the id of the FIRST
        // chunk is returned so later edits target the visible head.
        let mut first_id = None;
        for chunk in split_chunks(text, TELEGRAM_MAX_TEXT_CHARS) {
            let envelope = self
                .call(
                    "sendMessage",
                    serde_json::json!({ "chat_id": chat_id, "text": chunk }),
                )
                .await?;
            if first_id.is_none() {
                first_id = envelope
                    .result
                    .as_ref()
                    .and_then(|v| v.get("message_id"))
                    .and_then(|v| v.as_i64())
                    .map(|id| id.to_string());
            }
        }
        debug!(jid, "telegram message sent");
        Ok(first_id)
    }

    async fn edit(&self, jid: &str, message_id: &str, text: &str) -> Result<bool, RelayError> {
        let chat_id = chat_id_of(jid);
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| RelayError::Channel(format!("invalid message id `{message_id}`")))?;
        let (text, _truncated) = truncate_chars(text, TELEGRAM_MAX_TEXT_CHARS);

        self.call(
            "editMessageText",
            serde_json::json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(true)
    }

    async fn set_typing(&self, jid: &str, on: bool) -> Result<(), RelayError> {
        if !on {
            // The Bot API has no explicit "stop typing"; the indicator decays.
            return Ok(());
        }
        self.call(
            "sendChatAction",
            serde_json::json!({ "chat_id": chat_id_of(jid), "action": "typing" }),
        )
        .await?;
        Ok(())
    }
}

/// `tg:123456` → `123456`.
fn chat_id_of(jid: &str) -> &str {
    jid.strip_prefix("tg:").unwrap_or(jid)
}

/// Split text into chunks of at most `max_chars` characters.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count >= max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Truncate to `max_chars` characters; returns whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    let mut out = String::new();
    for (i, c) in text.chars().enumerate() {
        if i >= max_chars {
            return (out, true);
        }
        out.push(c);
    }
    (out, false)
}
