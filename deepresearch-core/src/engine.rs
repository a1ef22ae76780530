//! The research lifecycle engine.
//!
//! Owns all non-initial writes to the state store and coordinates the
//! provider, the background executor, and the notifier to implement the
//! hybrid sync/async lifecycle: `start` races a short synchronous wait
//! against the sync budget, hands off to a background polling unit on
//! timeout, and recovers in-flight work from the store on process start.

use crate::config::{OverflowPolicy, ResearchConfig};
use crate::error::{ResearchError, Result};
use crate::estimator::CostEstimator;
use crate::executor::{BackgroundExecutor, UnitSignal};
use crate::hanging::{HangingDetector, HangingStatus};
use crate::notify::Notifier;
use crate::provider::{PollSnapshot, PollState, ResearchProvider, Submission};
use crate::render::{RenderOptions, ReportRenderer};
use crate::store::{StateStore, TaskUpdate};
use crate::types::{
    CostEstimate, ResearchResult, ResearchTask, Source, TaskStatus, TokenUsage,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Fixed message recorded when the provider discards a session.
pub const SESSION_DISCARDED_MESSAGE: &str =
    "The remote research session was discarded by the provider before completion";

/// Fixed message recorded for tasks that crashed before submission.
pub const INTERRUPTED_MESSAGE: &str = "interrupted before submission";

/// Interval at which the sync path re-reads the store while waiting.
const SYNC_WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// Parameters for `start`.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub query: String,
    pub notify_on_done: bool,
    /// 1..=24 hours; None takes the configured default.
    pub max_wait_hours: Option<u32>,
    /// None takes the configured default model.
    pub model: Option<String>,
}

/// Outcome of `start`: either the finished result (sync win) or a durable
/// handle for later polling.
#[derive(Debug)]
pub enum StartOutcome {
    SyncCompleted {
        task: ResearchTask,
        result: ResearchResult,
    },
    AsyncStarted {
        task_id: Uuid,
    },
}

/// Outcome of `cancel`.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub task_id: Uuid,
    /// Whether a running background unit was signalled.
    pub was_running: bool,
    pub partial_saved: bool,
    pub progress_at_cancellation: u8,
    pub cost_usd: f64,
}

/// Read model returned by `status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub task: ResearchTask,
    pub elapsed_minutes: f64,
    pub estimated_completion_minutes: Option<f64>,
    /// Stall diagnosis; present while the task is non-terminal.
    pub stall: Option<HangingStatus>,
}

/// Outcome of `save_to_markdown`.
#[derive(Debug, Clone)]
pub struct SavedReport {
    pub file_path: PathBuf,
    pub filename: String,
    pub file_size_kb: f64,
    pub created_at: DateTime<Utc>,
    pub sections_included: Vec<&'static str>,
}

/// Summary of a startup recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Tasks whose polling units were re-attached.
    pub resumed: Vec<Uuid>,
    /// Tasks marked FAILED because they never reached submission.
    pub failed_pre_submit: Vec<Uuid>,
}

struct EngineInner {
    store: Arc<StateStore>,
    provider: Arc<dyn ResearchProvider>,
    executor: BackgroundExecutor,
    notifier: Arc<dyn Notifier>,
    estimator: CostEstimator,
    detector: Mutex<HangingDetector>,
    /// Sources observed so far per in-flight task, for partial preservation.
    observed_sources: Mutex<HashMap<Uuid, Vec<Source>>>,
    config: ResearchConfig,
}

/// The orchestration core. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ResearchEngine {
    inner: Arc<EngineInner>,
}

impl ResearchEngine {
    pub fn new(
        store: Arc<StateStore>,
        provider: Arc<dyn ResearchProvider>,
        notifier: Arc<dyn Notifier>,
        config: ResearchConfig,
    ) -> Self {
        let executor = BackgroundExecutor::new(
            config.engine.max_background_tasks,
            config.engine.overflow_policy,
        );
        let estimator = CostEstimator::new(config.engine.sync_budget_secs);
        Self {
            inner: Arc::new(EngineInner {
                store,
                provider,
                executor,
                notifier,
                estimator,
                detector: Mutex::new(HangingDetector::default()),
                observed_sources: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Start a research task. Returns within the sync budget plus a small
    /// margin even if the provider never responds.
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome> {
        let query_chars = request.query.chars().count();
        if !(3..=10_000).contains(&query_chars) {
            return Err(ResearchError::InvalidInput {
                field: "query",
                reason: format!("length must be 3..=10000 characters, got {query_chars}"),
            });
        }
        let max_wait_hours = request
            .max_wait_hours
            .unwrap_or(self.inner.config.engine.default_max_wait_hours);
        if !(1..=24).contains(&max_wait_hours) {
            return Err(ResearchError::InvalidInput {
                field: "max_wait_hours",
                reason: format!("must be 1..=24, got {max_wait_hours}"),
            });
        }

        if self.inner.executor.overflow_policy() == OverflowPolicy::Reject
            && !self.inner.executor.has_capacity()
        {
            return Err(ResearchError::CapacityExceeded {
                max: self.inner.executor.max_units(),
            });
        }

        let model = request
            .model
            .unwrap_or_else(|| self.inner.config.provider.model.clone());
        let task = ResearchTask::new(
            request.query.clone(),
            model.clone(),
            request.notify_on_done,
            max_wait_hours,
        );
        let task_id = task.task_id;
        self.inner.store.save_task(&task).await?;
        info!(task_id = %task_id, query_chars, "research task created");

        let Submission { handle, .. } =
            match self.inner.provider.submit(&request.query, &model).await {
                Ok(submission) => submission,
                Err(e) => {
                    self.inner
                        .store
                        .update_task(
                            &task_id,
                            &TaskUpdate::new()
                                .status(TaskStatus::Failed)
                                .error_message(e.to_string())
                                .completed_at(Utc::now()),
                        )
                        .await?;
                    return Err(e);
                }
            };

        self.inner
            .store
            .update_task(
                &task_id,
                &TaskUpdate::new()
                    .provider_handle(handle.clone())
                    .status(TaskStatus::RunningSync)
                    .current_action("Research started"),
            )
            .await?;

        // A cancel may have landed while the submission was in flight; a
        // terminal row gets no polling unit.
        let current = self
            .inner
            .store
            .get_task(&task_id)
            .await?
            .ok_or(ResearchError::NotFound { task_id })?;
        if current.status.is_terminal() {
            return Err(ResearchError::AlreadyTerminal {
                task_id,
                status: current.status,
            });
        }

        self.spawn_polling_unit(task_id, handle, task.created_at)?;

        // Race the background unit against the sync budget by watching the
        // store; on timeout the sync path merely detaches.
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.inner.config.engine.sync_budget_secs);
        loop {
            tokio::time::sleep(SYNC_WATCH_INTERVAL).await;

            let current = self
                .inner
                .store
                .get_task(&task_id)
                .await?
                .ok_or(ResearchError::NotFound { task_id })?;
            match current.status {
                TaskStatus::Completed => {
                    let result = self
                        .inner
                        .store
                        .get_result(&task_id)
                        .await?
                        .ok_or(ResearchError::NotFound { task_id })?;
                    info!(task_id = %task_id, "research completed synchronously");
                    return Ok(StartOutcome::SyncCompleted {
                        task: current,
                        result,
                    });
                }
                TaskStatus::Failed => {
                    return Err(ResearchError::ProviderFailed {
                        message: current
                            .error_message
                            .unwrap_or_else(|| "research failed".into()),
                    });
                }
                TaskStatus::Cancelled => {
                    return Err(ResearchError::AlreadyTerminal {
                        task_id,
                        status: TaskStatus::Cancelled,
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                // Promote to async. Idempotent: a no-op if the unit finished
                // in the meantime (terminal rows never regress).
                self.inner
                    .store
                    .update_task(&task_id, &TaskUpdate::new().status(TaskStatus::RunningAsync))
                    .await?;
                let current = self
                    .inner
                    .store
                    .get_task(&task_id)
                    .await?
                    .ok_or(ResearchError::NotFound { task_id })?;
                if current.status == TaskStatus::Completed {
                    let result = self
                        .inner
                        .store
                        .get_result(&task_id)
                        .await?
                        .ok_or(ResearchError::NotFound { task_id })?;
                    return Ok(StartOutcome::SyncCompleted {
                        task: current,
                        result,
                    });
                }
                info!(task_id = %task_id, "sync budget elapsed, continuing in background");
                return Ok(StartOutcome::AsyncStarted { task_id });
            }
        }
    }

    /// Report current status, elapsed time, and a stall diagnosis.
    pub async fn status(&self, task_id: &Uuid) -> Result<StatusReport> {
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(ResearchError::NotFound { task_id: *task_id })?;

        let elapsed_minutes = task.elapsed_minutes();
        let (estimated_completion_minutes, stall) = if task.status.is_terminal() {
            (None, None)
        } else {
            let detector = self.inner.detector.lock().unwrap();
            (
                detector.estimate_remaining_minutes(task_id),
                Some(detector.analyze(task_id, Some(task.created_at))),
            )
        };

        Ok(StatusReport {
            task,
            elapsed_minutes,
            estimated_completion_minutes,
            stall,
        })
    }

    /// Fetch the finished result for a task.
    ///
    /// FAILED tasks surface their recorded error; non-terminal tasks and
    /// CANCELLED tasks without a partial save return `NotCompleted`.
    pub async fn get(&self, task_id: &Uuid) -> Result<(ResearchTask, ResearchResult)> {
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(ResearchError::NotFound { task_id: *task_id })?;

        match task.status {
            TaskStatus::Completed => {
                let result = self
                    .inner
                    .store
                    .get_result(task_id)
                    .await?
                    .ok_or(ResearchError::NotFound { task_id: *task_id })?;
                Ok((task, result))
            }
            TaskStatus::Cancelled => match self.inner.store.get_result(task_id).await? {
                Some(result) => Ok((task, result)),
                None => Err(ResearchError::NotCompleted {
                    task_id: *task_id,
                    status: task.status,
                    progress: task.progress,
                }),
            },
            TaskStatus::Failed => Err(ResearchError::ProviderFailed {
                message: task
                    .error_message
                    .unwrap_or_else(|| "research failed".into()),
            }),
            status => Err(ResearchError::NotCompleted {
                task_id: *task_id,
                status,
                progress: task.progress,
            }),
        }
    }

    /// Cooperatively cancel a task, optionally preserving partial data.
    pub async fn cancel(&self, task_id: &Uuid, save_partial: bool) -> Result<CancelOutcome> {
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(ResearchError::NotFound { task_id: *task_id })?;
        if task.status.is_terminal() {
            return Err(ResearchError::AlreadyTerminal {
                task_id: *task_id,
                status: task.status,
            });
        }

        let was_running = self.inner.executor.cancel(task_id, save_partial);

        let mut partial_saved = false;
        if save_partial {
            let sources = self
                .inner
                .observed_sources
                .lock()
                .unwrap()
                .get(task_id)
                .cloned()
                .unwrap_or_default();
            let mut result = ResearchResult::new(*task_id, "", sources);
            result.metadata = serde_json::json!({
                "duration_minutes": task.elapsed_minutes(),
                "cost_usd": task.cost_usd,
                "mode": "async",
                "model": task.model,
                "partial": true,
                "progress_at_cancellation": task.progress,
                "started_at": task.created_at.to_rfc3339(),
                "completed_at": Utc::now().to_rfc3339(),
            });
            self.inner.store.save_result(task_id, &result).await?;
            partial_saved = true;
        }

        self.inner
            .store
            .update_task(
                task_id,
                &TaskUpdate::new()
                    .status(TaskStatus::Cancelled)
                    .current_action("Cancelled")
                    .completed_at(Utc::now()),
            )
            .await?;
        self.forget_task(task_id);
        info!(task_id = %task_id, was_running, partial_saved, "task cancelled");

        Ok(CancelOutcome {
            task_id: *task_id,
            was_running,
            partial_saved,
            progress_at_cancellation: task.progress,
            cost_usd: task.cost_usd,
        })
    }

    /// Pure cost estimation; no state changes, no provider calls.
    pub fn estimate(&self, query: &str) -> CostEstimate {
        self.inner.estimator.estimate(query)
    }

    /// Render the task's result to a markdown file under
    /// `out_dir/YYYY-MM/{prefix}_{id8}_{YYYYMMDD_HHMMSS}.md`.
    pub async fn save_to_markdown(
        &self,
        task_id: &Uuid,
        out_dir: Option<&Path>,
        prefix: &str,
        options: RenderOptions,
    ) -> Result<SavedReport> {
        let (task, result) = self.get(task_id).await?;

        let out_dir = out_dir.unwrap_or_else(|| self.inner.config.storage.output_dir.as_path());
        let now = Utc::now();
        let month_dir = out_dir.join(now.format("%Y-%m").to_string());
        std::fs::create_dir_all(&month_dir).map_err(|e| ResearchError::Io {
            path: month_dir.clone(),
            source: e,
        })?;

        let content = ReportRenderer::render(&task, &result, options);
        let needed = content.len() as u64 + self.inner.config.storage.min_free_bytes;
        match fs2::available_space(&month_dir) {
            Ok(available) if available < needed => {
                return Err(ResearchError::Io {
                    path: month_dir,
                    source: std::io::Error::other(format!(
                        "insufficient disk space: need {} KB, {} KB available",
                        needed / 1024,
                        available / 1024
                    )),
                });
            }
            // An unsupported platform is not a reason to refuse the save.
            _ => {}
        }

        let id8: String = task_id.to_string().chars().take(8).collect();
        let filename = format!("{prefix}_{id8}_{}.md", now.format("%Y%m%d_%H%M%S"));
        let file_path = month_dir.join(&filename);
        atomic_write(&file_path, content.as_bytes()).map_err(|e| ResearchError::Io {
            path: file_path.clone(),
            source: e,
        })?;

        let file_size_kb = content.len() as f64 / 1024.0;
        info!(task_id = %task_id, path = %file_path.display(), "report saved");
        Ok(SavedReport {
            file_path,
            filename,
            file_size_kb,
            created_at: now,
            sections_included: ReportRenderer::sections_included(&result, options),
        })
    }

    /// Re-attach polling units to in-flight tasks after a restart.
    ///
    /// Idempotent: running it twice with no intervening change re-attaches
    /// the same units (replace-and-cancel keyed on task id) and repeats no
    /// terminal writes.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for (task_id, handle) in self.inner.store.get_incomplete_tasks().await? {
            match handle {
                Some(handle) => {
                    let Some(task) = self.inner.store.get_task(&task_id).await? else {
                        continue;
                    };
                    info!(task_id = %task_id, "re-attaching polling unit");
                    // A recovered task is past its sync window by definition.
                    self.inner
                        .store
                        .update_task(
                            &task_id,
                            &TaskUpdate::new().status(TaskStatus::RunningAsync),
                        )
                        .await?;
                    self.spawn_polling_unit(task_id, handle, task.created_at)?;
                    report.resumed.push(task_id);
                }
                None => {
                    warn!(task_id = %task_id, "task was interrupted before submission");
                    self.inner
                        .store
                        .update_task(
                            &task_id,
                            &TaskUpdate::new()
                                .status(TaskStatus::Failed)
                                .error_message(INTERRUPTED_MESSAGE)
                                .completed_at(Utc::now()),
                        )
                        .await?;
                    report.failed_pre_submit.push(task_id);
                }
            }
        }
        Ok(report)
    }

    /// Cancel all running units; used on graceful shutdown.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.inner.executor.cancel_all(timeout).await
    }

    /// Whether a background unit is active for the task.
    pub fn is_polling(&self, task_id: &Uuid) -> bool {
        self.inner.executor.is_running(task_id)
    }

    /// Ids of all tasks with an active background unit.
    pub fn polling_ids(&self) -> Vec<Uuid> {
        self.inner.executor.running_ids()
    }

    // ------------------------------------------------------------------
    // Background polling
    // ------------------------------------------------------------------

    fn spawn_polling_unit(
        &self,
        task_id: Uuid,
        handle: String,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.start(task_id, move |signal| async move {
            poll_until_terminal(inner, task_id, handle, created_at, signal).await;
        })
    }

    fn forget_task(&self, task_id: &Uuid) {
        self.inner.detector.lock().unwrap().clear(task_id);
        self.inner.observed_sources.lock().unwrap().remove(task_id);
    }
}

/// The per-task polling loop. Runs until the task reaches a terminal state
/// or cancellation is signalled; a cancelled unit exits without writing
/// (the engine's `cancel` owns the CANCELLED transition, and
/// replace-and-cancel during recovery must not mark tasks cancelled).
async fn poll_until_terminal(
    inner: Arc<EngineInner>,
    task_id: Uuid,
    handle: String,
    created_at: DateTime<Utc>,
    signal: UnitSignal,
) {
    let poll_interval = Duration::from_secs(inner.config.engine.poll_interval_secs);
    let mut last_progress: u8 = 0;
    let mut first = true;

    loop {
        if !first {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = signal.token().cancelled() => {
                    debug!(task_id = %task_id, "polling unit observed cancellation");
                    return;
                }
            }
        }
        first = false;

        let max_wait = chrono::Duration::hours(
            task_max_wait_hours(&inner, &task_id).await.unwrap_or(8) as i64,
        );
        if Utc::now() - created_at > max_wait {
            finalize_failed(
                &inner,
                &task_id,
                format!(
                    "research exceeded the maximum wait time of {} hours",
                    max_wait.num_hours()
                ),
            )
            .await;
            return;
        }

        let snapshot = tokio::select! {
            result = inner.provider.poll(&handle) => result,
            _ = signal.token().cancelled() => {
                debug!(task_id = %task_id, "cancelled during poll");
                return;
            }
        };

        match snapshot {
            Ok(snapshot) => match snapshot.state {
                PollState::Running => {
                    record_running(&inner, &task_id, &snapshot, &mut last_progress).await;
                }
                PollState::Completed => {
                    finalize_completed(&inner, &task_id, snapshot, created_at).await;
                    return;
                }
                PollState::Failed => {
                    let message = snapshot
                        .error
                        .unwrap_or_else(|| "the provider reported an unknown failure".into());
                    finalize_failed(&inner, &task_id, message).await;
                    return;
                }
                PollState::Expired => {
                    finalize_failed(&inner, &task_id, SESSION_DISCARDED_MESSAGE.to_string())
                        .await;
                    return;
                }
            },
            Err(e) => {
                // Transient poll failures are retried at the next interval;
                // the max-wait bound caps how long this can go on.
                warn!(task_id = %task_id, error = %e, "poll failed, will retry");
            }
        }
    }
}

async fn task_max_wait_hours(inner: &EngineInner, task_id: &Uuid) -> Option<u32> {
    inner
        .store
        .get_task(task_id)
        .await
        .ok()
        .flatten()
        .map(|t| t.max_wait_hours)
}

/// Apply a running snapshot: monotone progress, free-form action, cumulative
/// token/cost overwrite.
async fn record_running(
    inner: &EngineInner,
    task_id: &Uuid,
    snapshot: &PollSnapshot,
    last_progress: &mut u8,
) {
    let mut update = TaskUpdate::new();

    if let Some(progress) = snapshot.progress {
        if progress > *last_progress {
            *last_progress = progress;
            update.progress = Some(progress);
        }
    }
    if let Some(action) = &snapshot.current_action {
        update.current_action = Some(action.clone());
    }
    if let Some(tokens) = snapshot.tokens {
        update.tokens_in = Some(tokens.input);
        update.tokens_out = Some(tokens.output);
        update.cost_usd = Some(tokens.cost_usd(
            inner.config.provider.input_cost_per_million,
            inner.config.provider.output_cost_per_million,
        ));
    }

    if let Err(e) = inner.store.update_task(task_id, &update).await {
        warn!(task_id = %task_id, error = %e, "failed to record progress");
    }

    if !snapshot.sources_so_far.is_empty() {
        inner
            .observed_sources
            .lock()
            .unwrap()
            .insert(*task_id, snapshot.sources_so_far.clone());
    }

    // The provider's action label is the remote signal that actually varies
    // between polls; stall detection keys on it going unchanged.
    inner.detector.lock().unwrap().record(
        *task_id,
        *last_progress,
        snapshot.current_action.as_deref().unwrap_or(""),
        snapshot.current_action.as_deref().unwrap_or("running"),
    );
}

async fn finalize_completed(
    inner: &EngineInner,
    task_id: &Uuid,
    snapshot: PollSnapshot,
    created_at: DateTime<Utc>,
) {
    let Ok(Some(task)) = inner.store.get_task(task_id).await else {
        error!(task_id = %task_id, "task row vanished before completion");
        return;
    };
    if task.status.is_terminal() {
        // Lost the race with a concurrent cancel; the terminal row wins.
        return;
    }
    // Still inside the sync window means the caller gets the result
    // directly; only a detached task notifies.
    let async_mode = task.status != TaskStatus::RunningSync;
    let completed_at = Utc::now();
    let duration_minutes = (completed_at - created_at).num_milliseconds() as f64 / 60_000.0;

    let tokens = snapshot
        .tokens
        .unwrap_or(TokenUsage::new(task.tokens_in, task.tokens_out));
    let cost_usd = tokens.cost_usd(
        inner.config.provider.input_cost_per_million,
        inner.config.provider.output_cost_per_million,
    );

    let provider_result = snapshot.result.unwrap_or_default();
    let mut metadata = match provider_result.metadata {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    metadata.insert("duration_minutes".into(), serde_json::json!(duration_minutes));
    metadata.insert("cost_usd".into(), serde_json::json!(cost_usd));
    metadata.insert(
        "mode".into(),
        serde_json::json!(if async_mode { "async" } else { "sync" }),
    );
    metadata.insert("model".into(), serde_json::json!(task.model));
    metadata.insert("started_at".into(), serde_json::json!(created_at.to_rfc3339()));
    metadata.insert(
        "completed_at".into(),
        serde_json::json!(completed_at.to_rfc3339()),
    );

    let mut result = ResearchResult::new(*task_id, provider_result.report, provider_result.sources);
    result.metadata = serde_json::Value::Object(metadata);

    if let Err(e) = inner.store.save_result(task_id, &result).await {
        error!(task_id = %task_id, error = %e, "failed to persist result");
        finalize_failed(inner, task_id, format!("failed to persist result: {e}")).await;
        return;
    }
    if let Err(e) = inner
        .store
        .update_task(
            task_id,
            &TaskUpdate::new()
                .status(TaskStatus::Completed)
                .progress(100)
                .current_action("Research complete")
                .tokens(tokens.input, tokens.output)
                .cost_usd(cost_usd)
                .completed_at(completed_at),
        )
        .await
    {
        error!(task_id = %task_id, error = %e, "failed to finalize task");
        return;
    }

    inner.detector.lock().unwrap().clear(task_id);
    inner.observed_sources.lock().unwrap().remove(task_id);
    info!(task_id = %task_id, duration_minutes, "research completed");

    if async_mode && task.notify_on_done {
        inner
            .notifier
            .research_complete(&task_id.to_string(), duration_minutes)
            .await;
    }
}

async fn finalize_failed(inner: &EngineInner, task_id: &Uuid, message: String) {
    let task = inner.store.get_task(task_id).await.ok().flatten();
    if task.as_ref().map(|t| t.status.is_terminal()).unwrap_or(false) {
        return;
    }
    let async_mode = task
        .as_ref()
        .map(|t| t.status != TaskStatus::RunningSync)
        .unwrap_or(true);
    let notify = task.as_ref().map(|t| t.notify_on_done).unwrap_or(false);

    if let Err(e) = inner
        .store
        .update_task(
            task_id,
            &TaskUpdate::new()
                .status(TaskStatus::Failed)
                .error_message(message.clone())
                .completed_at(Utc::now()),
        )
        .await
    {
        error!(task_id = %task_id, error = %e, "failed to record failure");
    }
    inner.detector.lock().unwrap().clear(task_id);
    inner.observed_sources.lock().unwrap().remove(task_id);
    warn!(task_id = %task_id, message, "research failed");

    if async_mode && notify {
        inner
            .notifier
            .research_failed(&task_id.to_string(), &message)
            .await;
    }
}

/// Write to a `.tmp` sibling then rename into place, so a crash can never
/// leave a half-written report behind.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::provider::ProviderResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A scripted provider: yields the queued snapshots in order, repeating
    /// the last one forever.
    struct ScriptedProvider {
        submission_state: PollState,
        snapshots: Vec<PollSnapshot>,
        polls: AtomicUsize,
        fail_submit: bool,
    }

    impl ScriptedProvider {
        fn new(snapshots: Vec<PollSnapshot>) -> Self {
            Self {
                submission_state: PollState::Running,
                snapshots,
                polls: AtomicUsize::new(0),
                fail_submit: false,
            }
        }

        fn failing_submit() -> Self {
            Self {
                submission_state: PollState::Running,
                snapshots: vec![],
                polls: AtomicUsize::new(0),
                fail_submit: true,
            }
        }

        fn poll_count(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResearchProvider for ScriptedProvider {
        async fn submit(&self, _query: &str, _model: &str) -> Result<Submission> {
            if self.fail_submit {
                return Err(ResearchError::ProviderUnavailable {
                    message: "connection refused".into(),
                });
            }
            Ok(Submission {
                handle: "scripted-handle".into(),
                state: self.submission_state,
            })
        }

        async fn poll(&self, _handle: &str) -> Result<PollSnapshot> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            let index = n.min(self.snapshots.len().saturating_sub(1));
            self.snapshots
                .get(index)
                .cloned()
                .ok_or(ResearchError::ProviderUnavailable {
                    message: "no snapshot scripted".into(),
                })
        }
    }

    fn fast_config() -> ResearchConfig {
        let mut config = ResearchConfig::default();
        config.engine.sync_budget_secs = 1;
        config.engine.poll_interval_secs = 1;
        config
    }

    fn build_engine(
        provider: ScriptedProvider,
        config: ResearchConfig,
    ) -> (ResearchEngine, Arc<ScriptedProvider>, Arc<RecordingNotifier>) {
        let provider = Arc::new(provider);
        let notifier = Arc::new(RecordingNotifier::new());
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = ResearchEngine::new(
            store,
            Arc::clone(&provider) as Arc<dyn ResearchProvider>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            config,
        );
        (engine, provider, notifier)
    }

    fn completed_snapshot(report: &str) -> PollSnapshot {
        PollSnapshot::completed(ProviderResult {
            report: report.into(),
            sources: vec![],
            metadata: serde_json::json!({}),
        })
    }

    fn start_request(query: &str) -> StartRequest {
        StartRequest {
            query: query.into(),
            notify_on_done: true,
            max_wait_hours: Some(8),
            model: None,
        }
    }

    #[tokio::test]
    async fn test_query_length_bounds() {
        let (engine, _, _) = build_engine(ScriptedProvider::new(vec![]), fast_config());

        let err = engine.start(start_request("ab")).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidInput { field: "query", .. }));

        let err = engine
            .start(start_request(&"q".repeat(10_001)))
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::InvalidInput { field: "query", .. }));
    }

    #[tokio::test]
    async fn test_max_wait_hours_bounds() {
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![completed_snapshot("r")]),
            fast_config(),
        );

        for bad in [0, 25] {
            let mut request = start_request("valid query");
            request.max_wait_hours = Some(bad);
            let err = engine.start(request).await.unwrap_err();
            assert!(matches!(
                err,
                ResearchError::InvalidInput {
                    field: "max_wait_hours",
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn test_sync_completion() {
        let (engine, _, notifier) = build_engine(
            ScriptedProvider::new(vec![completed_snapshot("The answer is 4.")]),
            fast_config(),
        );

        let outcome = engine.start(start_request("What is 2+2?")).await.unwrap();
        let StartOutcome::SyncCompleted { task, result } = outcome else {
            panic!("expected sync completion");
        };
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
        assert_eq!(result.report, "The answer is 4.");
        assert_eq!(result.metadata["mode"], "sync");
        // No notification on the sync path.
        assert!(notifier.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_async_handoff_and_completion() {
        let running = PollSnapshot::running(20, "Searching the web");
        let (engine, _, notifier) = build_engine(
            ScriptedProvider::new(vec![
                running.clone(),
                running.clone(),
                running,
                completed_snapshot("Survey results"),
            ]),
            fast_config(),
        );

        let outcome = engine
            .start(start_request("Survey recent advances in X"))
            .await
            .unwrap();
        let StartOutcome::AsyncStarted { task_id } = outcome else {
            panic!("expected async handoff");
        };

        let report = engine.status(&task_id).await.unwrap();
        assert_eq!(report.task.status, TaskStatus::RunningAsync);

        // Let the background unit drive the task to completion.
        let mut done = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if engine.status(&task_id).await.unwrap().task.status == TaskStatus::Completed {
                done = true;
                break;
            }
        }
        assert!(done, "task never completed");

        let (task, result) = engine.get(&task_id).await.unwrap();
        assert_eq!(task.progress, 100);
        assert_eq!(result.report, "Survey results");
        assert_eq!(result.metadata["mode"], "async");

        // Exactly one completion notification was delivered.
        let deliveries = notifier.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "Deep Research Complete");
        // The unit evicted itself.
        for _ in 0..50 {
            if !engine.is_polling(&task_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.is_polling(&task_id));
    }

    #[tokio::test]
    async fn test_provider_failure_during_sync() {
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![PollSnapshot::failed("quota exhausted")]),
            fast_config(),
        );

        let err = engine.start(start_request("doomed query")).await.unwrap_err();
        assert!(matches!(err, ResearchError::ProviderFailed { .. }));
        assert!(err.to_string().contains("quota exhausted"));
    }

    #[tokio::test]
    async fn test_submit_failure_marks_task_failed() {
        let (engine, _, _) = build_engine(ScriptedProvider::failing_submit(), fast_config());

        let err = engine.start(start_request("unreachable")).await.unwrap_err();
        assert!(matches!(err, ResearchError::ProviderUnavailable { .. }));

        let tasks = engine.store().list_tasks(10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_is_monotone() {
        // The provider reports progress going backwards; the store must not.
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![
                PollSnapshot::running(40, "a"),
                PollSnapshot::running(25, "b"),
                PollSnapshot::running(60, "c"),
                completed_snapshot("done"),
            ]),
            fast_config(),
        );

        let outcome = engine.start(start_request("monotone test")).await.unwrap();
        let task_id = match outcome {
            StartOutcome::AsyncStarted { task_id } => task_id,
            StartOutcome::SyncCompleted { task, .. } => task.task_id,
        };

        let mut observed = Vec::new();
        for _ in 0..100 {
            let report = engine.status(&task_id).await.unwrap();
            observed.push(report.task.progress);
            if report.task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{observed:?}");
    }

    #[tokio::test]
    async fn test_stall_diagnostic_tracks_changing_remote_state() {
        // A healthy async run with a changing action label must not read as
        // stalled: the stall clock follows the remote signal, not elapsed
        // time since the first poll.
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![
                PollSnapshot::running(10, "Planning research"),
                PollSnapshot::running(20, "Searching the web"),
                PollSnapshot::running(30, "Writing the report"),
            ]),
            fast_config(),
        );
        let StartOutcome::AsyncStarted { task_id } = engine
            .start(start_request("healthy long run"))
            .await
            .unwrap()
        else {
            panic!("expected async handoff");
        };

        // Wait until the third distinct action has been observed.
        for _ in 0..100 {
            if engine.status(&task_id).await.unwrap().task.progress >= 30 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let report = engine.status(&task_id).await.unwrap();
        assert_eq!(report.task.current_action, "Writing the report");
        let stall = report.stall.expect("non-terminal task has a stall diagnosis");
        assert!(!stall.is_hanging, "{stall:?}");
        assert_eq!(stall.last_progress, 30);
        // The remote signal changed on every poll, so the stall clock trails
        // the elapsed clock by at least the earlier transitions.
        assert!(
            stall.status_stall_minutes * 60.0 + 1.0 < report.elapsed_minutes * 60.0,
            "stall {} min vs elapsed {} min",
            stall.status_stall_minutes,
            report.elapsed_minutes
        );

        engine.cancel(&task_id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_with_partial_save() {
        let sources = vec![
            Source {
                title: "S1".into(),
                url: "https://1".into(),
                snippet: String::new(),
                relevance_score: 0.5,
            },
            Source {
                title: "S2".into(),
                url: "https://2".into(),
                snippet: String::new(),
                relevance_score: 0.4,
            },
            Source {
                title: "S3".into(),
                url: "https://3".into(),
                snippet: String::new(),
                relevance_score: 0.3,
            },
        ];
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![
                PollSnapshot::running(65, "Reading").with_sources(sources.clone())
            ]),
            fast_config(),
        );

        let outcome = engine.start(start_request("cancel me")).await.unwrap();
        let StartOutcome::AsyncStarted { task_id } = outcome else {
            panic!("expected async handoff");
        };

        // Wait until the first running snapshot has been recorded.
        for _ in 0..100 {
            if engine.status(&task_id).await.unwrap().task.progress == 65 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let cancel = engine.cancel(&task_id, true).await.unwrap();
        assert!(cancel.was_running);
        assert!(cancel.partial_saved);
        assert_eq!(cancel.progress_at_cancellation, 65);

        let (task, result) = engine.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completed_at.is_some());
        assert_eq!(result.sources.len(), 3);
        assert_eq!(result.report, "");
        assert!(result.metadata["duration_minutes"].as_f64().unwrap() >= 0.0);
        assert_eq!(result.metadata["partial"], true);
    }

    #[tokio::test]
    async fn test_cancel_without_partial() {
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![PollSnapshot::running(10, "x")]),
            fast_config(),
        );
        let StartOutcome::AsyncStarted { task_id } =
            engine.start(start_request("cancel plain")).await.unwrap()
        else {
            panic!("expected async handoff");
        };

        let cancel = engine.cancel(&task_id, false).await.unwrap();
        assert!(!cancel.partial_saved);

        let err = engine.get(&task_id).await.unwrap_err();
        assert!(matches!(err, ResearchError::NotCompleted { .. }));
    }

    #[tokio::test]
    async fn test_cancel_terminal_task() {
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![completed_snapshot("done")]),
            fast_config(),
        );
        let StartOutcome::SyncCompleted { task, .. } =
            engine.start(start_request("finish fast")).await.unwrap()
        else {
            panic!("expected sync completion");
        };

        let err = engine.cancel(&task.task_id, true).await.unwrap_err();
        assert!(matches!(err, ResearchError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let (engine, _, _) = build_engine(ScriptedProvider::new(vec![]), fast_config());
        let err = engine.cancel(&Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, ResearchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_expired_session_fails_task() {
        let (engine, _, notifier) = build_engine(
            ScriptedProvider::new(vec![
                PollSnapshot::running(10, "x"),
                PollSnapshot::running(10, "x"),
                PollSnapshot::expired(),
            ]),
            fast_config(),
        );
        let StartOutcome::AsyncStarted { task_id } =
            engine.start(start_request("doomed session")).await.unwrap()
        else {
            panic!("expected async handoff");
        };

        let mut failed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let task = engine.status(&task_id).await.unwrap().task;
            if task.status == TaskStatus::Failed {
                assert_eq!(task.error_message.as_deref(), Some(SESSION_DISCARDED_MESSAGE));
                failed = true;
                break;
            }
        }
        assert!(failed, "task never failed");

        let err = engine.get(&task_id).await.unwrap_err();
        assert!(err.to_string().contains("discarded"));
        assert_eq!(notifier.deliveries().len(), 1);
        assert_eq!(notifier.deliveries()[0].0, "Deep Research Failed");
    }

    #[tokio::test]
    async fn test_recovery_reattaches_and_fails_presubmit() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());

        // T1: in-flight with a handle, progress 40.
        let mut t1 = ResearchTask::new("recover me", "m", true, 8);
        t1.status = TaskStatus::RunningAsync;
        t1.provider_handle = Some("h1".into());
        t1.progress = 40;
        store.save_task(&t1).await.unwrap();

        // T2: crashed before submission.
        let mut t2 = ResearchTask::new("never submitted", "m", false, 8);
        t2.status = TaskStatus::RunningSync;
        store.save_task(&t2).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![PollSnapshot::running(45, "resumed")]));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = ResearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&provider) as Arc<dyn ResearchProvider>,
            notifier as Arc<dyn Notifier>,
            fast_config(),
        );

        let report = engine.recover_on_startup().await.unwrap();
        assert_eq!(report.resumed, vec![t1.task_id]);
        assert_eq!(report.failed_pre_submit, vec![t2.task_id]);

        assert!(engine.is_polling(&t1.task_id));
        let recovered = store.get_task(&t2.task_id).await.unwrap().unwrap();
        assert_eq!(recovered.status, TaskStatus::Failed);
        assert_eq!(recovered.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

        // Wait for the resumed unit to poll the stored handle.
        for _ in 0..100 {
            if provider.poll_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(provider.poll_count() > 0);

        // Status of the resumed task is preserved, progress still monotone.
        let t1_now = store.get_task(&t1.task_id).await.unwrap().unwrap();
        assert_eq!(t1_now.status, TaskStatus::RunningAsync);
        assert!(t1_now.progress >= 40);

        // Idempotent: a second pass re-attaches the same set without
        // duplicate terminal writes.
        let second = engine.recover_on_startup().await.unwrap();
        assert_eq!(second.resumed, vec![t1.task_id]);
        assert!(second.failed_pre_submit.is_empty());
        assert_eq!(engine.polling_ids(), vec![t1.task_id]);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_recovery_with_expired_session() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut task = ResearchTask::new("expired on recovery", "m", false, 8);
        task.status = TaskStatus::RunningAsync;
        task.provider_handle = Some("gone".into());
        store.save_task(&task).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![PollSnapshot::expired()]));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = ResearchEngine::new(
            Arc::clone(&store),
            provider as Arc<dyn ResearchProvider>,
            notifier as Arc<dyn Notifier>,
            fast_config(),
        );

        engine.recover_on_startup().await.unwrap();
        let mut failed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let now = store.get_task(&task.task_id).await.unwrap().unwrap();
            if now.status == TaskStatus::Failed {
                assert_eq!(now.error_message.as_deref(), Some(SESSION_DISCARDED_MESSAGE));
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_status_unknown_task() {
        let (engine, _, _) = build_engine(ScriptedProvider::new(vec![]), fast_config());
        let err = engine.status(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ResearchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_on_running_task_not_completed() {
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![PollSnapshot::running(5, "x")]),
            fast_config(),
        );
        let StartOutcome::AsyncStarted { task_id } =
            engine.start(start_request("still running")).await.unwrap()
        else {
            panic!("expected async handoff");
        };
        let err = engine.get(&task_id).await.unwrap_err();
        assert!(matches!(
            err,
            ResearchError::NotCompleted {
                status: TaskStatus::RunningAsync,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_save_to_markdown() {
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![completed_snapshot("# Deep findings")]),
            fast_config(),
        );
        let StartOutcome::SyncCompleted { task, .. } =
            engine.start(start_request("save me")).await.unwrap()
        else {
            panic!("expected sync completion");
        };

        let dir = tempfile::TempDir::new().unwrap();
        let saved = engine
            .save_to_markdown(
                &task.task_id,
                Some(dir.path()),
                "research",
                RenderOptions::default(),
            )
            .await
            .unwrap();

        assert!(saved.file_path.exists());
        assert!(saved.filename.starts_with("research_"));
        assert!(saved.filename.ends_with(".md"));
        assert!(saved.file_size_kb > 0.0);
        assert_eq!(saved.sections_included, vec!["metadata", "findings"]);

        // Placed under a YYYY-MM month directory.
        let month = saved.file_path.parent().unwrap().file_name().unwrap();
        let month = month.to_string_lossy();
        assert_eq!(month.len(), 7);
        assert_eq!(&month[4..5], "-");

        let content = std::fs::read_to_string(&saved.file_path).unwrap();
        assert!(content.contains("# Deep findings"));
        // No temp file left behind.
        assert!(!saved.file_path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_save_requires_result() {
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![PollSnapshot::running(5, "x")]),
            fast_config(),
        );
        let StartOutcome::AsyncStarted { task_id } =
            engine.start(start_request("not done yet")).await.unwrap()
        else {
            panic!("expected async handoff");
        };

        let dir = tempfile::TempDir::new().unwrap();
        let err = engine
            .save_to_markdown(&task_id, Some(dir.path()), "research", RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::NotCompleted { .. }));
        engine.cancel(&task_id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_estimate_is_pure() {
        let (engine, _, _) = build_engine(ScriptedProvider::new(vec![]), fast_config());
        let a = engine.estimate("price of bitcoin right now?");
        let b = engine.estimate("price of bitcoin right now?");
        assert_eq!(a.complexity, b.complexity);
        assert_eq!(a.likely_minutes, b.likely_minutes);
        assert!(engine.store().list_tasks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_policy_capacity() {
        let mut config = fast_config();
        config.engine.max_background_tasks = 1;
        config.engine.overflow_policy = OverflowPolicy::Reject;
        let (engine, _, _) = build_engine(
            ScriptedProvider::new(vec![PollSnapshot::running(5, "slow")]),
            config,
        );

        let StartOutcome::AsyncStarted { task_id } =
            engine.start(start_request("occupies the slot")).await.unwrap()
        else {
            panic!("expected async handoff");
        };

        let err = engine.start(start_request("one too many")).await.unwrap_err();
        assert!(matches!(err, ResearchError::CapacityExceeded { max: 1 }));

        engine.cancel(&task_id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_returns_within_budget_when_provider_hangs() {
        /// Provider whose polls never resolve.
        struct HangingProvider;

        #[async_trait]
        impl ResearchProvider for HangingProvider {
            async fn submit(&self, _query: &str, _model: &str) -> Result<Submission> {
                Ok(Submission {
                    handle: "hang".into(),
                    state: PollState::Running,
                })
            }
            async fn poll(&self, _handle: &str) -> Result<PollSnapshot> {
                std::future::pending().await
            }
        }

        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = ResearchEngine::new(
            store,
            Arc::new(HangingProvider) as Arc<dyn ResearchProvider>,
            notifier as Arc<dyn Notifier>,
            fast_config(),
        );

        let started = std::time::Instant::now();
        let outcome = engine.start(start_request("hanging provider")).await.unwrap();
        assert!(matches!(outcome, StartOutcome::AsyncStarted { .. }));
        // sync_budget (1s) plus the 2s margin allowed by the contract.
        assert!(started.elapsed() < Duration::from_secs(3));

        engine.shutdown(Duration::from_secs(1)).await;
    }
}
