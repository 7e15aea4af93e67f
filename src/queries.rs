//! Host-side query adapter.
//!
//! Sandboxes ask the host about project state (run status, sprint phase,
//! open beads, artifacts) through `queries/` files; this adapter maps each
//! query type onto an allowlisted CLI invocation. The safe-exec primitive
//! runs a named binary with a fixed argument vector (never a shell) under a
//! timeout. Writes are accepted only from the main group when so
//! configured. One query type, `review_summary`, is answered from the
//! project filesystem instead of a CLI: it collects the newest review
//! verdict files directly.

use std::path::PathBuf;
use std::time::Duration;

use relay_core::config::QueryAdapterConfig;
use relay_core::ipc::QueryReply;
use tokio::process::Command;
use tracing::debug;

const STANDALONE_MSG: &str = "Query backend not available — Relay is running standalone.";

/// A resolved CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub bin: &'static str,
    /// Allowlist signature this plan is checked against.
    pub signature: &'static str,
    pub args: Vec<String>,
    pub write: bool,
}

pub struct QueryAdapter {
    config: QueryAdapterConfig,
    project_root: PathBuf,
}

impl QueryAdapter {
    pub fn new(config: QueryAdapterConfig, project_root: PathBuf) -> Self {
        Self {
            config,
            project_root,
        }
    }

    /// Execute one query on behalf of a group.
    pub async fn execute(
        &self,
        query_type: &str,
        params: &serde_json::Value,
        is_main: bool,
    ) -> QueryReply {
        if !self.config.enabled {
            return QueryReply::error("Query adapter is disabled.");
        }

        // Filesystem-backed read; no CLI involved.
        if query_type == "review_summary" {
            return self.review_summary();
        }

        let plan = match plan_query(query_type, params) {
            Ok(plan) => plan,
            Err(reason) => return QueryReply::error(reason),
        };

        if plan.write && self.config.require_main_group_for_writes && !is_main {
            return QueryReply::error("Write queries require main group privileges.");
        }

        let allowlist = if plan.write {
            &self.config.write_allowlist
        } else {
            &self.config.read_allowlist
        };
        if !allowlist.iter().any(|sig| sig == plan.signature) {
            return QueryReply::error(format!(
                "Query blocked by {} allowlist: {}",
                if plan.write { "write" } else { "read" },
                plan.signature
            ));
        }

        self.safe_exec(&plan).await
    }

    /// Run the plan's binary with its fixed argv, mapping every failure mode
    /// to an error reply so sandboxes degrade gracefully.
    async fn safe_exec(&self, plan: &QueryPlan) -> QueryReply {
        debug!(bin = plan.bin, args = ?plan.args, "executing query");
        let result = tokio::time::timeout(
            Duration::from_millis(self.config.timeout_ms),
            Command::new(plan.bin)
                .args(&plan.args)
                .current_dir(&self.project_root)
                .output(),
        )
        .await;

        match result {
            Err(_) => QueryReply::error(format!(
                "`{}` timed out after {}ms",
                plan.bin, self.config.timeout_ms
            )),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                QueryReply::error(STANDALONE_MSG)
            }
            Ok(Err(e)) => QueryReply::error(format!("failed to run `{}`: {e}", plan.bin)),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if output.status.success() {
                    return QueryReply::ok(stdout);
                }
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if !stderr.is_empty() {
                    QueryReply::error(stderr)
                } else if !stdout.is_empty() {
                    QueryReply::error(stdout)
                } else {
                    QueryReply::error(format!("`{}` exited with {}", plan.bin, output.status))
                }
            }
        }
    }

    /// Collect the newest review verdicts straight from the project tree.
    ///
    /// Verdict files are JSON documents dropped by review tooling under
    /// `docs/research/`; the three newest (by filename, which carries the
    /// timestamp) are returned as one JSON array.
    fn review_summary(&self) -> QueryReply {
        let search_dirs = [
            self.project_root.join("docs/research/flux-drive"),
            self.project_root.join("docs/research"),
        ];

        for dir in search_dirs {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.extension().and_then(|ext| ext.to_str()) == Some("json")
                        && p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.contains("verdict"))
                })
                .collect();
            files.sort_by(|a, b| b.cmp(a));

            let verdicts: Vec<String> = files
                .into_iter()
                .take(3)
                .filter_map(|f| std::fs::read_to_string(f).ok())
                .collect();
            if !verdicts.is_empty() {
                return QueryReply::ok(format!("[{}]", verdicts.join(",")));
            }
        }

        QueryReply::error("No review verdicts found.")
    }
}

fn str_param(params: &serde_json::Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Map a query type plus parameters onto a CLI plan.
pub fn plan_query(query_type: &str, params: &serde_json::Value) -> Result<QueryPlan, String> {
    match query_type {
        "run_status" => match str_param(params, "run_id") {
            Some(run_id) => Ok(QueryPlan {
                bin: "ic",
                signature: "ic run status --json",
                args: vec!["run".into(), "status".into(), run_id, "--json".into()],
                write: false,
            }),
            None => Ok(QueryPlan {
                bin: "ic",
                signature: "ic run current --json",
                args: vec!["run".into(), "current".into(), "--json".into()],
                write: false,
            }),
        },
        "sprint_phase" => Ok(QueryPlan {
            bin: "ic",
            signature: "ic run phase --json",
            args: vec!["run".into(), "phase".into(), "--json".into()],
            write: false,
        }),
        "spec_lookup" => match str_param(params, "artifact_id") {
            Some(artifact_id) => Ok(QueryPlan {
                bin: "ic",
                signature: "ic run artifact get --json",
                args: vec![
                    "run".into(),
                    "artifact".into(),
                    "get".into(),
                    artifact_id,
                    "--json".into(),
                ],
                write: false,
            }),
            None => Ok(QueryPlan {
                bin: "ic",
                signature: "ic run artifact list --json",
                args: vec![
                    "run".into(),
                    "artifact".into(),
                    "list".into(),
                    "--json".into(),
                ],
                write: false,
            }),
        },
        "run_events" => {
            let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(20);
            let mut args = vec![
                "events".into(),
                "tail".into(),
                "--json".into(),
                format!("--limit={limit}"),
            ];
            if let Some(since) = str_param(params, "since") {
                args.push(format!("--since={since}"));
            }
            Ok(QueryPlan {
                bin: "ic",
                signature: "ic events tail --json",
                args,
                write: false,
            })
        }
        "search_beads" => {
            if let Some(id) = str_param(params, "id") {
                return Ok(QueryPlan {
                    bin: "bd",
                    signature: "bd show --json",
                    args: vec!["show".into(), id, "--json".into()],
                    write: false,
                });
            }
            let mut args = vec!["list".into(), "--json".into()];
            if let Some(status) = str_param(params, "status") {
                args.push(format!("--status={status}"));
            }
            if let Some(query) = str_param(params, "query") {
                args.push(format!("--search={query}"));
            }
            Ok(QueryPlan {
                bin: "bd",
                signature: "bd list --json",
                args,
                write: false,
            })
        }
        "next_work" => Ok(QueryPlan {
            bin: "bd",
            signature: "bd ready --json",
            args: vec!["ready".into(), "--json".into()],
            write: false,
        }),

        "create_bead" => {
            let title = str_param(params, "title").filter(|t| !t.is_empty());
            let Some(title) = title else {
                return Err("create_bead requires a title".into());
            };
            let mut args = vec!["create".into(), "--title".into(), title, "--json".into()];
            if let Some(description) = str_param(params, "description") {
                args.push("--description".into());
                args.push(description);
            }
            if let Some(priority) = str_param(params, "priority") {
                args.push("--priority".into());
                args.push(priority);
            }
            Ok(QueryPlan {
                bin: "bd",
                signature: "bd create --json",
                args,
                write: true,
            })
        }
        "update_bead" => {
            let Some(id) = str_param(params, "id").filter(|v| !v.is_empty()) else {
                return Err("update_bead requires an id".into());
            };
            let mut args = vec!["update".into(), id, "--json".into()];
            for (key, flag) in [
                ("status", "--status"),
                ("priority", "--priority"),
                ("title", "--title"),
                ("notes", "--notes"),
            ] {
                if let Some(value) = str_param(params, key) {
                    args.push(flag.into());
                    args.push(value);
                }
            }
            Ok(QueryPlan {
                bin: "bd",
                signature: "bd update --json",
                args,
                write: true,
            })
        }
        "close_bead" => {
            let Some(id) = str_param(params, "id").filter(|v| !v.is_empty()) else {
                return Err("close_bead requires an id".into());
            };
            let mut args = vec!["close".into(), id, "--json".into()];
            if let Some(reason) = str_param(params, "reason") {
                args.push("--reason".into());
                args.push(reason);
            }
            Ok(QueryPlan {
                bin: "bd",
                signature: "bd close --json",
                args,
                write: true,
            })
        }
        "start_run" => {
            let mut args = vec!["run".into(), "create".into(), "--json".into()];
            if let Some(title) = str_param(params, "title") {
                args.push("--title".into());
                args.push(title);
            }
            if let Some(description) = str_param(params, "description") {
                args.push("--description".into());
                args.push(description);
            }
            Ok(QueryPlan {
                bin: "ic",
                signature: "ic run create --json",
                args,
                write: true,
            })
        }
        "approve_gate" => {
            let mut args = vec!["gate".into(), "override".into(), "--json".into()];
            if let Some(gate_id) = str_param(params, "gate_id") {
                args.push(gate_id);
            }
            if let Some(reason) = str_param(params, "reason") {
                args.push("--reason".into());
                args.push(reason);
            }
            Ok(QueryPlan {
                bin: "ic",
                signature: "ic gate override --json",
                args,
                write: true,
            })
        }

        unknown => Err(format!("Unknown query type: {unknown}")),
    }
}
