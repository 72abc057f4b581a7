//! Host-supplied tool handlers: memory operations and scheduler operations,
//! registered next to the built-in filesystem/shell tools at startup.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use valet_domain::cancel::CancelToken;
use valet_memory::{MemoryEntry, MemoryKind, MemoryPriority, MemoryStore};
use valet_tools::{ToolError, ToolHandler, ToolRegistry, ToolSpec};

use crate::scheduler::{ScheduleStore, ScheduledTask, TaskAction, Trigger};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct MemorySearchTool {
    store: Arc<MemoryStore>,
}

#[async_trait::async_trait]
impl ToolHandler for MemorySearchTool {
    async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
        let hits = self.store.search(Some(query), None, 0.0, limit);
        let items: Vec<Value> = hits
            .iter()
            .map(|e| {
                serde_json::json!({
                    "content": e.content,
                    "kind": e.kind,
                    "importance": e.importance,
                    "tags": e.tags,
                })
            })
            .collect();
        Ok(serde_json::json!({ "results": items, "count": items.len() }).to_string())
    }
}

struct MemorySaveTool {
    store: Arc<MemoryStore>,
}

fn parse_kind(s: &str) -> MemoryKind {
    match s {
        "preference" => MemoryKind::Preference,
        "rule" => MemoryKind::Rule,
        "skill" => MemoryKind::Skill,
        "persona_trait" => MemoryKind::PersonaTrait,
        "context" => MemoryKind::Context,
        "error" => MemoryKind::Error,
        _ => MemoryKind::Fact,
    }
}

fn parse_priority(s: &str) -> MemoryPriority {
    match s {
        "transient" => MemoryPriority::Transient,
        "short_term" => MemoryPriority::ShortTerm,
        "permanent" => MemoryPriority::Permanent,
        _ => MemoryPriority::LongTerm,
    }
}

#[async_trait::async_trait]
impl ToolHandler for MemorySaveTool {
    async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::validation("memory_save", "missing required argument: content"))?;
        let kind = parse_kind(args.get("kind").and_then(|v| v.as_str()).unwrap_or("fact"));
        let priority =
            parse_priority(args.get("priority").and_then(|v| v.as_str()).unwrap_or("long_term"));
        let importance = args
            .get("importance")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5);
        let tags: Vec<String> = args
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut entry = MemoryEntry::new(content, kind)
            .with_importance(importance)
            .with_priority(priority)
            .with_tags(tags);
        if let Some(dim) = args.get("dimension").and_then(|v| v.as_str()) {
            entry = entry.with_dimension(dim);
        }

        let id = self.store.add(entry);
        Ok(serde_json::json!({ "saved": true, "id": id }).to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ScheduleCreateTool {
    store: Arc<ScheduleStore>,
}

#[async_trait::async_trait]
impl ToolHandler for ScheduleCreateTool {
    async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::validation("schedule_create", "missing required argument: name"))?;
        let session = args
            .get("session")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::validation("schedule_create", "missing required argument: session")
            })?;

        let trigger = parse_trigger(&args)?;
        let prompt = args.get("prompt").and_then(|v| v.as_str());
        let reminder = args.get("reminder_message").and_then(|v| v.as_str());
        let action = match (prompt, reminder) {
            (Some(p), None) => TaskAction::Prompt(p.to_string()),
            (None, Some(m)) => TaskAction::Reminder(m.to_string()),
            (Some(_), Some(_)) => {
                return Err(ToolError::validation(
                    "schedule_create",
                    "'prompt' and 'reminder_message' are mutually exclusive; set exactly one",
                ));
            }
            (None, None) => {
                return Err(ToolError::validation(
                    "schedule_create",
                    "either 'prompt' or 'reminder_message' is required",
                ));
            }
        };

        let task = ScheduledTask::new(name, session, trigger, action);
        let id = task.id;
        self.store
            .add(task)
            .map_err(|e| ToolError::validation("schedule_create", e.to_string()))?;
        Ok(serde_json::json!({ "created": true, "id": id }).to_string())
    }
}

fn parse_trigger(args: &Value) -> Result<Trigger, ToolError> {
    let trigger_type = args
        .get("trigger_type")
        .and_then(|v| v.as_str())
        .unwrap_or("once");
    match trigger_type {
        "once" => {
            let run_at = args
                .get("run_at")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .ok_or_else(|| {
                    ToolError::validation("schedule_create", "once trigger needs RFC3339 'run_at'")
                })?;
            Ok(Trigger::Once {
                run_at: run_at.with_timezone(&Utc),
            })
        }
        "interval" => {
            let minutes = args
                .get("minutes")
                .and_then(|v| v.as_u64())
                .filter(|m| *m > 0)
                .ok_or_else(|| {
                    ToolError::validation("schedule_create", "interval trigger needs 'minutes' > 0")
                })?;
            Ok(Trigger::Interval { minutes })
        }
        "cron" => {
            let expr = args
                .get("cron")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ToolError::validation("schedule_create", "cron trigger needs 'cron' expression")
                })?;
            let timezone = args
                .get("timezone")
                .and_then(|v| v.as_str())
                .unwrap_or("UTC");
            Ok(Trigger::Cron {
                expr: expr.to_string(),
                timezone: timezone.to_string(),
            })
        }
        other => Err(ToolError::validation(
            "schedule_create",
            format!("unknown trigger_type '{other}'"),
        )),
    }
}

struct ScheduleListTool {
    store: Arc<ScheduleStore>,
}

#[async_trait::async_trait]
impl ToolHandler for ScheduleListTool {
    async fn call(&self, _args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let tasks = self.store.list();
        let items: Vec<Value> = tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "name": t.name,
                    "enabled": t.enabled,
                    "session": t.session,
                    "next_run_at": t.next_run_at,
                    "run_count": t.run_count,
                    "fail_count": t.fail_count,
                })
            })
            .collect();
        Ok(serde_json::json!({ "tasks": items, "count": items.len() }).to_string())
    }
}

struct ScheduleCancelTool {
    store: Arc<ScheduleStore>,
}

#[async_trait::async_trait]
impl ToolHandler for ScheduleCancelTool {
    async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let id = args
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .ok_or_else(|| ToolError::validation("schedule_cancel", "missing or invalid 'id'"))?;
        let removed = self.store.remove(&id);
        if removed {
            Ok(serde_json::json!({ "removed": true }).to_string())
        } else {
            Err(ToolError::not_found(
                "schedule_cancel",
                format!("no scheduled task with id {id}"),
            ))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn register(
    registry: &ToolRegistry,
    memory: Arc<MemoryStore>,
    schedules: Arc<ScheduleStore>,
) {
    registry.register(
        ToolSpec::new(
            "memory_search",
            "Search long-term memory for facts, preferences, and notes.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "limit": { "type": "integer", "description": "Max results (default 10)" }
                },
                "required": ["query"]
            }),
        )
        .category("memory")
        .parallel_safe(),
        Arc::new(MemorySearchTool {
            store: memory.clone(),
        }),
    );

    registry.register(
        ToolSpec::new(
            "memory_save",
            "Store a fact, preference, rule, or note in long-term memory.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string", "description": "Content to remember" },
                    "kind": { "type": "string", "enum": ["fact", "preference", "rule", "skill", "persona_trait", "context", "error"] },
                    "priority": { "type": "string", "enum": ["transient", "short_term", "long_term", "permanent"] },
                    "importance": { "type": "number", "description": "0.0 - 1.0" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "dimension": { "type": "string", "description": "Trait dimension for persona_trait entries" }
                },
                "required": ["content"]
            }),
        )
        .category("memory"),
        Arc::new(MemorySaveTool { store: memory }),
    );

    registry.register(
        ToolSpec::new(
            "schedule_create",
            "Create a scheduled task: a one-shot reminder, an interval job, or a cron job.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "session": { "type": "string", "description": "Target session id (channel:chat_id:user_id)" },
                    "trigger_type": { "type": "string", "enum": ["once", "interval", "cron"] },
                    "run_at": { "type": "string", "description": "RFC3339 time (once)" },
                    "minutes": { "type": "integer", "description": "Interval minutes (interval)" },
                    "cron": { "type": "string", "description": "5-field cron expression (cron)" },
                    "timezone": { "type": "string", "description": "IANA timezone for cron (default UTC)" },
                    "prompt": { "type": "string", "description": "Reinjected as a user turn when the task fires" },
                    "reminder_message": { "type": "string", "description": "Emitted verbatim to the session" }
                },
                "required": ["name", "session", "trigger_type"]
            }),
        )
        .category("scheduler")
        .catalog()
        .detailed_help(
            "Exactly one of 'prompt' (runs the reasoning loop as if the user \
             had typed it) or 'reminder_message' (delivered verbatim) must be \
             set. Once-triggers fire a single time; missed windows are \
             compacted into one catch-up run.",
        ),
        Arc::new(ScheduleCreateTool {
            store: schedules.clone(),
        }),
    );

    registry.register(
        ToolSpec::new(
            "schedule_list",
            "List scheduled tasks.",
            serde_json::json!({ "type": "object", "properties": {} }),
        )
        .category("scheduler")
        .catalog()
        .parallel_safe(),
        Arc::new(ScheduleListTool {
            store: schedules.clone(),
        }),
    );

    registry.register(
        ToolSpec::new(
            "schedule_cancel",
            "Delete a scheduled task by id.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "Task id from schedule_list" }
                },
                "required": ["id"]
            }),
        )
        .category("scheduler")
        .catalog(),
        Arc::new(ScheduleCancelTool { store: schedules }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_tool() -> ScheduleCreateTool {
        ScheduleCreateTool {
            store: Arc::new(ScheduleStore::in_memory()),
        }
    }

    #[tokio::test]
    async fn schedule_create_accepts_exactly_one_action() {
        let tool = create_tool();
        let out = tool
            .call(
                serde_json::json!({
                    "name": "sync",
                    "session": "cli:local:me",
                    "trigger_type": "interval",
                    "minutes": 30,
                    "prompt": "check inbox"
                }),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["created"], true);
    }

    #[tokio::test]
    async fn schedule_create_rejects_both_actions() {
        let tool = create_tool();
        let err = tool
            .call(
                serde_json::json!({
                    "name": "ambiguous",
                    "session": "cli:local:me",
                    "trigger_type": "interval",
                    "minutes": 30,
                    "prompt": "check inbox",
                    "reminder_message": "check your inbox"
                }),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("mutually exclusive"));
    }

    #[tokio::test]
    async fn schedule_create_rejects_neither_action() {
        let tool = create_tool();
        let err = tool
            .call(
                serde_json::json!({
                    "name": "empty",
                    "session": "cli:local:me",
                    "trigger_type": "interval",
                    "minutes": 30
                }),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("required"));
    }
}
