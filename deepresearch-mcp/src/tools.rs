//! The six-tool surface of the deep-research server.
//!
//! Each handler validates argument shapes and ranges, delegates to the
//! engine or the store read path, and maps engine errors to the uniform
//! `{success:false, error, message, hint?}` envelope. No lifecycle logic
//! lives here.

use crate::protocol::{CallToolResult, McpTool, ToolContent};
use deepresearch_core::{
    RenderOptions, ResearchEngine, ResearchError, StartOutcome, StartRequest, TokenUsage,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

/// Dispatches MCP tool calls to the research engine.
pub struct ToolSurface {
    engine: ResearchEngine,
}

impl ToolSurface {
    pub fn new(engine: ResearchEngine) -> Self {
        Self { engine }
    }

    /// Definitions for `tools/list`. Names and argument sets are part of the
    /// external contract.
    pub fn definitions() -> Vec<McpTool> {
        vec![
            McpTool {
                name: "start".into(),
                description: Some(
                    "Start a deep research task. Returns the full report if it completes \
                     within the synchronous budget, otherwise a task_id for polling."
                        .into(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The research question (3-10000 characters)"
                        },
                        "notify_on_done": {
                            "type": "boolean",
                            "description": "Send a desktop notification on completion",
                            "default": true
                        },
                        "max_wait_hours": {
                            "type": "integer",
                            "description": "Maximum hours to keep polling (1-24)",
                            "default": 8
                        },
                        "model": {
                            "type": "string",
                            "description": "Provider model override"
                        }
                    },
                    "required": ["query"]
                }),
            },
            McpTool {
                name: "status".into(),
                description: Some(
                    "Check the progress of a research task. Read-only; consumes no provider \
                     tokens."
                        .into(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string", "description": "Task id from start" }
                    },
                    "required": ["task_id"]
                }),
            },
            McpTool {
                name: "get".into(),
                description: Some("Fetch the completed report for a research task.".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string", "description": "Task id from start" },
                        "include_sources": {
                            "type": "boolean",
                            "description": "Include the source list",
                            "default": true
                        }
                    },
                    "required": ["task_id"]
                }),
            },
            McpTool {
                name: "cancel".into(),
                description: Some(
                    "Cancel a running research task, optionally preserving partial data."
                        .into(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string", "description": "Task id from start" },
                        "save_partial": {
                            "type": "boolean",
                            "description": "Preserve sources and progress gathered so far",
                            "default": true
                        }
                    },
                    "required": ["task_id"]
                }),
            },
            McpTool {
                name: "estimate".into(),
                description: Some(
                    "Estimate duration and cost for a research query before starting it. \
                     Pure; no provider calls."
                        .into(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "The research question" }
                    },
                    "required": ["query"]
                }),
            },
            McpTool {
                name: "save".into(),
                description: Some(
                    "Export a completed research report to a markdown file.".into(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string", "description": "Task id from start" },
                        "output_dir": {
                            "type": "string",
                            "description": "Directory for the report (default from config)"
                        },
                        "filename_prefix": {
                            "type": "string",
                            "description": "Filename prefix",
                            "default": "research"
                        },
                        "include_metadata": { "type": "boolean", "default": true },
                        "include_sources": { "type": "boolean", "default": true }
                    },
                    "required": ["task_id"]
                }),
            },
        ]
    }

    /// Whether a tool with this name exists on the surface.
    pub fn has_tool(name: &str) -> bool {
        matches!(
            name,
            "start" | "status" | "get" | "cancel" | "estimate" | "save"
        )
    }

    /// Execute one tool call. Errors become the uniform envelope with the
    /// MCP `isError` flag set; they never escape as protocol errors.
    pub async fn call(&self, name: &str, args: Value) -> CallToolResult {
        info!(tool = %name, "tool call");
        debug!(tool = %name, args = %args, "tool call arguments");

        let outcome = match name {
            "start" => self.start(args).await,
            "status" => self.status(args).await,
            "get" => self.get(args).await,
            "cancel" => self.cancel(args).await,
            "estimate" => self.estimate(args),
            "save" => self.save(args).await,
            _ => Err(ResearchError::InvalidInput {
                field: "tool",
                reason: format!("unknown tool: {name}"),
            }),
        };

        match outcome {
            Ok(value) => CallToolResult {
                content: vec![ToolContent::Text {
                    text: serde_json::to_string_pretty(&value)
                        .unwrap_or_else(|_| value.to_string()),
                }],
                is_error: None,
            },
            Err(e) => {
                let mut envelope = json!({
                    "success": false,
                    "error": e.kind(),
                    "message": e.to_string(),
                });
                if let Some(hint) = e.hint() {
                    envelope["hint"] = json!(hint);
                }
                CallToolResult {
                    content: vec![ToolContent::Text {
                        text: serde_json::to_string_pretty(&envelope)
                            .unwrap_or_else(|_| envelope.to_string()),
                    }],
                    is_error: Some(true),
                }
            }
        }
    }

    async fn start(&self, args: Value) -> Result<Value, ResearchError> {
        let query = required_str(&args, "query")?.to_string();
        let notify_on_done = optional_bool(&args, "notify_on_done")?.unwrap_or(true);
        let max_wait_hours = optional_u64(&args, "max_wait_hours")?.map(|h| h as u32);
        let model = optional_str(&args, "model")?.map(str::to_string);

        let outcome = self
            .engine
            .start(StartRequest {
                query,
                notify_on_done,
                max_wait_hours,
                model,
            })
            .await?;

        Ok(match outcome {
            StartOutcome::SyncCompleted { task, result } => json!({
                "mode": "sync",
                "status": "completed",
                "task_id": task.task_id.to_string(),
                "results": {
                    "report": result.report,
                    "sources": result.sources,
                    "metadata": result.metadata,
                },
            }),
            StartOutcome::AsyncStarted { task_id } => json!({
                "mode": "async",
                "status": "running_async",
                "task_id": task_id.to_string(),
                "message": "Research continues in the background; poll with the status tool.",
            }),
        })
    }

    async fn status(&self, args: Value) -> Result<Value, ResearchError> {
        let task_id = required_task_id(&args)?;
        let report = self.engine.status(&task_id).await?;
        let task = &report.task;

        let tokens = TokenUsage::new(task.tokens_in, task.tokens_out);
        let mut value = json!({
            "task_id": task.task_id.to_string(),
            "status": task.status.as_str(),
            "progress": task.progress,
            "current_action": task.current_action,
            "elapsed_minutes": round2(report.elapsed_minutes),
            "tokens": {
                "input": tokens.input,
                "output": tokens.output,
                "total": tokens.total(),
            },
            "cost_so_far": task.cost_usd,
        });
        if let Some(eta) = report.estimated_completion_minutes {
            value["estimated_completion_minutes"] = json!(round2(eta));
        }
        if let Some(stall) = report.stall {
            value["stall"] = json!({
                "is_hanging": stall.is_hanging,
                "reason": stall.reason,
                "confidence": stall.confidence,
                "recommendation": stall.recommendation,
            });
        }
        if let Some(error) = &task.error_message {
            value["error_message"] = json!(error);
        }
        Ok(value)
    }

    async fn get(&self, args: Value) -> Result<Value, ResearchError> {
        let task_id = required_task_id(&args)?;
        let include_sources = optional_bool(&args, "include_sources")?.unwrap_or(true);

        let (task, result) = self.engine.get(&task_id).await?;
        let mut value = json!({
            "task_id": task.task_id.to_string(),
            "query": task.query,
            "status": task.status.as_str(),
            "report": result.report,
            "metadata": result.metadata,
        });
        if include_sources {
            value["sources"] = json!(result.sources);
        }
        Ok(value)
    }

    async fn cancel(&self, args: Value) -> Result<Value, ResearchError> {
        let task_id = required_task_id(&args)?;
        let save_partial = optional_bool(&args, "save_partial")?.unwrap_or(true);

        let outcome = self.engine.cancel(&task_id, save_partial).await?;
        Ok(json!({
            "status": "cancelled",
            "task_id": outcome.task_id.to_string(),
            "partial_results_saved": outcome.partial_saved,
            "progress_at_cancellation": outcome.progress_at_cancellation,
            "cost_usd": outcome.cost_usd,
        }))
    }

    fn estimate(&self, args: Value) -> Result<Value, ResearchError> {
        let query = required_str(&args, "query")?;
        let estimate = self.engine.estimate(query);
        Ok(json!({
            "complexity": estimate.complexity.to_string(),
            "duration": {
                "min_minutes": estimate.min_minutes,
                "max_minutes": estimate.max_minutes,
                "likely_minutes": estimate.likely_minutes,
            },
            "cost": {
                "min_usd": estimate.min_usd,
                "max_usd": estimate.max_usd,
                "likely_usd": estimate.likely_usd,
            },
            "will_likely_go_async": estimate.will_likely_go_async,
            "recommendation": estimate.recommendation,
        }))
    }

    async fn save(&self, args: Value) -> Result<Value, ResearchError> {
        let task_id = required_task_id(&args)?;
        let output_dir = optional_str(&args, "output_dir")?.map(PathBuf::from);
        let prefix = optional_str(&args, "filename_prefix")?
            .unwrap_or("research")
            .to_string();
        let options = RenderOptions {
            include_metadata: optional_bool(&args, "include_metadata")?.unwrap_or(true),
            include_sources: optional_bool(&args, "include_sources")?.unwrap_or(true),
        };

        let saved = self
            .engine
            .save_to_markdown(&task_id, output_dir.as_deref(), &prefix, options)
            .await?;
        Ok(json!({
            "file_path": saved.file_path.display().to_string(),
            "filename": saved.filename,
            "file_size_kb": round2(saved.file_size_kb),
            "created_at": saved.created_at.to_rfc3339(),
            "sections_included": saved.sections_included,
        }))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn required_str<'a>(args: &'a Value, field: &'static str) -> Result<&'a str, ResearchError> {
    match args.get(field) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ResearchError::InvalidInput {
            field,
            reason: "must be a string".into(),
        }),
        None => Err(ResearchError::InvalidInput {
            field,
            reason: "is required".into(),
        }),
    }
}

fn optional_str<'a>(args: &'a Value, field: &'static str) -> Result<Option<&'a str>, ResearchError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ResearchError::InvalidInput {
            field,
            reason: "must be a string".into(),
        }),
    }
}

fn optional_bool(args: &Value, field: &'static str) -> Result<Option<bool>, ResearchError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ResearchError::InvalidInput {
            field,
            reason: "must be a boolean".into(),
        }),
    }
}

fn optional_u64(args: &Value, field: &'static str) -> Result<Option<u64>, ResearchError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or(ResearchError::InvalidInput {
            field,
            reason: "must be a non-negative integer".into(),
        }),
    }
}

fn required_task_id(args: &Value) -> Result<Uuid, ResearchError> {
    let raw = required_str(args, "task_id")?;
    Uuid::parse_str(raw).map_err(|_| ResearchError::InvalidInput {
        field: "task_id",
        reason: "must be a UUID".into(),
    })
}
