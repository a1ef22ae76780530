//! Core data model for research tasks, results, and estimates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a research task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet submitted to the provider.
    Pending,
    /// Submitted; the caller is still waiting inside the sync budget.
    RunningSync,
    /// Handed off to a background polling unit.
    RunningAsync,
    /// Finished successfully; a result row exists.
    Completed,
    /// Provider failure, expiry, or wall-clock timeout.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Whether this is a terminal state (the row is immutable afterwards,
    /// save for `error_message` bookkeeping).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Stable string form used in storage and tool responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::RunningSync => "running_sync",
            TaskStatus::RunningAsync => "running_async",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running_sync" => Some(TaskStatus::RunningSync),
            "running_async" => Some(TaskStatus::RunningAsync),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A research task tracked from submission to terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    /// Caller-visible identifier (UUID v4).
    pub task_id: Uuid,
    /// Opaque provider session handle, set once submission is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_handle: Option<String>,
    /// The research question. Immutable after creation.
    pub query: String,
    /// Provider model identifier.
    pub model: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Progress percentage, 0..=100, monotonically non-decreasing.
    pub progress: u8,
    /// Human-readable current step label.
    pub current_action: String,
    /// Whether to send a desktop notification on terminal transition.
    pub notify_on_done: bool,
    /// Absolute wall-clock bound in hours, measured from `created_at`.
    pub max_wait_hours: u32,
    /// Cumulative input tokens reported by the provider.
    pub tokens_in: u64,
    /// Cumulative output tokens reported by the provider.
    pub tokens_out: u64,
    /// Estimated cost in USD, derived from token usage.
    pub cost_usd: f64,
    /// Populated iff the task FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff the task is in a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchTask {
    /// Create a fresh PENDING task for a query.
    pub fn new(
        query: impl Into<String>,
        model: impl Into<String>,
        notify_on_done: bool,
        max_wait_hours: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            provider_handle: None,
            query: query.into(),
            model: model.into(),
            status: TaskStatus::Pending,
            progress: 0,
            current_action: String::new(),
            notify_on_done,
            max_wait_hours,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Minutes elapsed since the task was created.
    pub fn elapsed_minutes(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds() as f64 / 60_000.0
    }
}

/// A source referenced by the research report. Order within a result is
/// significant and preserved across storage round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    /// Relevance in 0.0..=1.0.
    #[serde(default)]
    pub relevance_score: f64,
}

/// Completed (or partially preserved) research output, one-to-one with a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub task_id: Uuid,
    /// Full markdown report. May be empty for a partial save.
    pub report: String,
    pub sources: Vec<Source>,
    /// Free-form metadata map: at least `duration_minutes`, `cost_usd`,
    /// `mode`, `model`, `started_at`, `completed_at` when finalized.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ResearchResult {
    pub fn new(task_id: Uuid, report: impl Into<String>, sources: Vec<Source>) -> Self {
        Self {
            task_id,
            report: report.into(),
            sources,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }
}

/// Token consumption with cost derivation at fixed per-million rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    /// Estimated USD cost given per-million-token rates.
    pub fn cost_usd(&self, input_per_million: f64, output_per_million: f64) -> f64 {
        self.input as f64 * input_per_million / 1_000_000.0
            + self.output as f64 * output_per_million / 1_000_000.0
    }
}

/// Query complexity band, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// Pre-submission cost and duration estimate. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    pub complexity: Complexity,
    pub min_minutes: f64,
    pub max_minutes: f64,
    pub likely_minutes: f64,
    pub min_usd: f64,
    pub max_usd: f64,
    pub likely_usd: f64,
    pub will_likely_go_async: bool,
    pub recommendation: String,
}
