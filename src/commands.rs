//! Slash command handlers.
//!
//! Handlers are pure: they return reply text plus declarative effects, and
//! the HTTP layer applies the effects (kill sandbox, clear session, switch
//! model). That keeps every command testable without a queue or a store.

use std::time::Instant;

use relay_core::config::{ModelCatalog, ModelEntry};
use serde::{Deserialize, Serialize};

/// Side effects the dispatcher applies after a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandEffect {
    /// Stop the group's active sandbox.
    KillSandbox,
    /// Forget the group's session (memory, store, session files).
    ClearSession,
    /// Move the group to a different model and runtime.
    SwitchModel { model_id: String, runtime: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<CommandEffect>,
}

impl CommandResult {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: None,
            effects: vec![],
        }
    }

    fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: Some("Markdown".into()),
            effects: vec![],
        }
    }
}

/// Request body for `POST /v1/commands`.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub chat_jid: String,
    pub command: String,
    #[serde(default)]
    pub args: String,
    pub group_name: Option<String>,
    pub group_folder: Option<String>,
    pub current_model: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub sandbox_active: bool,
}

pub struct CommandContext<'a> {
    pub assistant_name: &'a str,
    pub catalog: &'a ModelCatalog,
    pub started_at: Instant,
}

pub fn handle_command(request: &CommandRequest, ctx: &CommandContext) -> CommandResult {
    match request.command.as_str() {
        "help" => handle_help(ctx.assistant_name),
        "status" => handle_status(request, ctx),
        "model" => handle_model(request, ctx),
        "reset" | "new" => handle_reset(request),
        "ping" => CommandResult::plain("pong"),
        "chatid" => CommandResult::plain(format!("Chat ID: {}", request.chat_jid)),
        other => CommandResult::plain(format!("Unknown command: /{other}")),
    }
}

fn handle_help(assistant_name: &str) -> CommandResult {
    CommandResult::markdown(format!(
        "*{assistant_name} Commands*\n\
         \n\
         /help — Show this command list\n\
         /status — Show model, session, and sandbox state\n\
         /model — Show available models\n\
         /model <#> — Switch model by number\n\
         /model <name> — Switch model by name\n\
         /reset — Clear session and stop the running sandbox\n\
         /new — Start a fresh chat (alias for /reset)\n\
         /ping — Check if the bot is online\n\
         /chatid — Show this chat's registration ID"
    ))
}

fn handle_status(request: &CommandRequest, ctx: &CommandContext) -> CommandResult {
    if request.group_folder.is_none() {
        return CommandResult::plain("This chat is not registered.");
    }
    let name = request.group_name.as_deref().unwrap_or("Unknown");

    let model_id = request
        .current_model
        .as_deref()
        .unwrap_or(&ctx.catalog.default);
    let model_display = ctx
        .catalog
        .find(model_id)
        .map(|m| m.display_name.clone())
        .unwrap_or_else(|| model_id.to_string());

    let session = match request.session_id.as_deref() {
        Some(sid) if sid.chars().count() > 12 => {
            format!("`{}...`", sid.chars().take(12).collect::<String>())
        }
        Some(sid) => format!("`{sid}`"),
        None => "_none_".into(),
    };

    let minutes = ctx.started_at.elapsed().as_secs() / 60;
    let uptime = if minutes >= 60 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    };
    let sandbox = if request.sandbox_active { "active" } else { "idle" };

    CommandResult::markdown(format!(
        "*Status for {name}*\n\
         \n\
         Model: `{model_display}`\n\
         Session: {session}\n\
         Sandbox: {sandbox}\n\
         Assistant: {}\n\
         Uptime: {uptime}",
        ctx.assistant_name
    ))
}

fn handle_model(request: &CommandRequest, ctx: &CommandContext) -> CommandResult {
    if request.group_name.is_none() {
        return CommandResult::plain("This chat is not registered.");
    }
    let current_id = request
        .current_model
        .as_deref()
        .unwrap_or(&ctx.catalog.default);

    if request.args.is_empty() {
        let current_display = ctx
            .catalog
            .find(current_id)
            .map(|m| m.display_name.clone())
            .unwrap_or_else(|| current_id.to_string());
        let lines: Vec<String> = ctx
            .catalog
            .entries
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let active = if m.id == current_id { " (active)" } else { "" };
                format!(" {}. `{}` — {}{active}", i + 1, m.id, m.display_name)
            })
            .collect();
        return CommandResult::markdown(format!(
            "*Current model:* {current_display}\n\n{}\n\nSwitch: `/model <name>` or `/model <#>`",
            lines.join("\n")
        ));
    }

    let new_model = resolve_model(ctx.catalog, &request.args);
    if new_model.id == current_id {
        return CommandResult::markdown(format!("Already using `{}`.", new_model.display_name));
    }

    let prev_display = ctx
        .catalog
        .find(current_id)
        .map(|m| m.display_name.clone())
        .unwrap_or_else(|| current_id.to_string());

    CommandResult {
        text: format!(
            "Switched from {prev_display} to *{}*.\nThe next message starts a fresh session.",
            new_model.display_name
        ),
        parse_mode: Some("Markdown".into()),
        effects: vec![
            CommandEffect::KillSandbox,
            CommandEffect::ClearSession,
            CommandEffect::SwitchModel {
                model_id: new_model.id,
                runtime: new_model.runtime,
            },
        ],
    }
}

fn handle_reset(request: &CommandRequest) -> CommandResult {
    if request.group_name.is_none() {
        return CommandResult::plain("This chat is not registered.");
    }

    let mut parts = vec!["Session cleared."];
    let mut effects = vec![CommandEffect::ClearSession];
    if request.sandbox_active {
        parts.push("Running sandbox stopped.");
        effects.insert(0, CommandEffect::KillSandbox);
    }
    parts.push("Next message will start a fresh session.");

    CommandResult {
        text: parts.join(" "),
        parse_mode: None,
        effects,
    }
}

/// Resolve a `/model` argument: exact id, then catalog index, then substring
/// on id or display name, finally the raw id with a prefix-inferred runtime.
pub fn resolve_model(catalog: &ModelCatalog, args: &str) -> ModelEntry {
    let lower = args.trim().to_lowercase();

    if let Some(m) = catalog.entries.iter().find(|m| m.id == lower) {
        return m.clone();
    }
    if let Ok(n) = lower.parse::<usize>() {
        if n >= 1 && n <= catalog.entries.len() {
            return catalog.entries[n - 1].clone();
        }
    }
    if let Some(m) = catalog
        .entries
        .iter()
        .find(|m| m.id.contains(&lower) || m.display_name.to_lowercase().contains(&lower))
    {
        return m.clone();
    }

    ModelEntry {
        id: lower.clone(),
        runtime: runtime_for_model(catalog, &lower),
        display_name: args.trim().to_string(),
    }
}

/// Infer a runtime from the catalog, then from well-known id prefixes.
pub fn runtime_for_model(catalog: &ModelCatalog, model_id: &str) -> String {
    if let Some(entry) = catalog.find(model_id) {
        return entry.runtime.clone();
    }
    let id = model_id.to_lowercase();
    if id.starts_with("claude-") {
        "claude".into()
    } else if id.starts_with("gemini-") {
        "gemini".into()
    } else if id.starts_with("gpt-")
        || id.starts_with("codex-")
        || id.starts_with("o1-")
        || id.starts_with("o3-")
        || id.starts_with("o4-")
    {
        "codex".into()
    } else {
        catalog
            .find(&catalog.default)
            .map(|m| m.runtime.clone())
            .unwrap_or_else(|| "claude".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(catalog: &ModelCatalog) -> CommandContext<'_> {
        CommandContext {
            assistant_name: "Relay",
            catalog,
            started_at: Instant::now(),
        }
    }

    fn request(command: &str, args: &str) -> CommandRequest {
        CommandRequest {
            chat_jid: "tg:1".into(),
            command: command.into(),
            args: args.into(),
            group_name: Some("Test Group".into()),
            group_folder: Some("test-group".into()),
            current_model: Some("claude-opus-4-6".into()),
            session_id: Some("sess-abc123def456".into()),
            sandbox_active: false,
        }
    }

    #[test]
    fn help_lists_commands() {
        let catalog = ModelCatalog::default();
        let result = handle_command(&request("help", ""), &ctx(&catalog));
        assert!(result.text.contains("Relay Commands"));
        assert!(result.text.contains("/reset"));
        assert!(result.effects.is_empty());
    }

    #[test]
    fn status_shows_model_session_sandbox() {
        let catalog = ModelCatalog::default();
        let mut req = request("status", "");
        req.sandbox_active = true;
        let result = handle_command(&req, &ctx(&catalog));
        assert!(result.text.contains("Test Group"));
        assert!(result.text.contains("Claude Opus 4.6"));
        assert!(result.text.contains("sess-abc123d"));
        assert!(result.text.contains("active"));
        assert!(result.effects.is_empty());
    }

    #[test]
    fn status_unregistered() {
        let catalog = ModelCatalog::default();
        let mut req = request("status", "");
        req.group_name = None;
        req.group_folder = None;
        let result = handle_command(&req, &ctx(&catalog));
        assert!(result.text.contains("not registered"));
    }

    #[test]
    fn model_without_args_prints_catalog() {
        let catalog = ModelCatalog::default();
        let result = handle_command(&request("model", ""), &ctx(&catalog));
        assert!(result.text.contains("(active)"));
        assert!(result.text.contains("Gemini"));
        assert!(result.effects.is_empty());
    }

    #[test]
    fn model_switch_emits_all_three_effects_in_order() {
        let catalog = ModelCatalog::default();
        let result = handle_command(&request("model", "gemini-3.1-pro"), &ctx(&catalog));
        assert!(result.text.contains("Switched"));
        assert_eq!(
            result.effects,
            vec![
                CommandEffect::KillSandbox,
                CommandEffect::ClearSession,
                CommandEffect::SwitchModel {
                    model_id: "gemini-3.1-pro".into(),
                    runtime: "gemini".into(),
                },
            ]
        );
    }

    #[test]
    fn model_same_id_is_a_no_op() {
        let catalog = ModelCatalog::default();
        let result = handle_command(&request("model", "claude-opus-4-6"), &ctx(&catalog));
        assert!(result.text.contains("Already using"));
        assert!(result.effects.is_empty());
    }

    #[test]
    fn resolve_by_index_substring_and_prefix() {
        let catalog = ModelCatalog::default();
        assert_eq!(resolve_model(&catalog, "2").id, "claude-sonnet-4-6");
        assert_eq!(resolve_model(&catalog, "codex").id, "gpt-5.3-codex");
        // Unknown id keeps the raw id; runtime inferred from its prefix.
        let m = resolve_model(&catalog, "claude-haiku-4-5");
        assert_eq!(m.id, "claude-haiku-4-5");
        assert_eq!(m.runtime, "claude");
    }

    #[test]
    fn runtime_inference_prefixes() {
        let catalog = ModelCatalog::default();
        assert_eq!(runtime_for_model(&catalog, "gemini-x"), "gemini");
        assert_eq!(runtime_for_model(&catalog, "o4-mini"), "codex");
        assert_eq!(runtime_for_model(&catalog, "mystery"), "claude");
    }

    #[test]
    fn reset_effects_depend_on_active_sandbox() {
        let catalog = ModelCatalog::default();
        let mut req = request("reset", "");
        req.sandbox_active = true;
        let result = handle_command(&req, &ctx(&catalog));
        assert_eq!(
            result.effects,
            vec![CommandEffect::KillSandbox, CommandEffect::ClearSession]
        );
        assert!(result.text.contains("sandbox stopped"));

        let req = request("reset", "");
        let result = handle_command(&req, &ctx(&catalog));
        assert_eq!(result.effects, vec![CommandEffect::ClearSession]);
    }

    #[test]
    fn new_is_reset_alias() {
        let catalog = ModelCatalog::default();
        let result = handle_command(&request("new", ""), &ctx(&catalog));
        assert!(result.text.contains("Session cleared"));
    }

    #[test]
    fn ping_and_chatid_always_reply() {
        let catalog = ModelCatalog::default();
        assert_eq!(handle_command(&request("ping", ""), &ctx(&catalog)).text, "pong");
        assert!(handle_command(&request("chatid", ""), &ctx(&catalog))
            .text
            .contains("tg:1"));
    }

    #[test]
    fn unknown_command_still_replies() {
        let catalog = ModelCatalog::default();
        let result = handle_command(&request("frobnicate", ""), &ctx(&catalog));
        assert!(result.text.contains("Unknown command: /frobnicate"));
    }
}
