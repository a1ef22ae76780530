//! # Deep Research Core
//!
//! Orchestration core for the deep-research MCP server: the hybrid
//! sync/async task lifecycle engine, the durable SQLite state store, the
//! background polling executor, cost estimation, report rendering, and
//! desktop notification.

pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod executor;
pub mod hanging;
pub mod notify;
pub mod provider;
pub mod render;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{load_config, OverflowPolicy, ResearchConfig};
pub use engine::{
    CancelOutcome, RecoveryReport, ResearchEngine, SavedReport, StartOutcome, StartRequest,
    StatusReport, INTERRUPTED_MESSAGE, SESSION_DISCARDED_MESSAGE,
};
pub use error::{ResearchError, Result};
pub use estimator::CostEstimator;
pub use executor::BackgroundExecutor;
pub use hanging::{HangingDetector, HangingStatus};
pub use notify::{DesktopNotifier, Notifier, RecordingNotifier, Urgency};
pub use provider::{
    HttpProvider, PollSnapshot, PollState, ProviderResult, ResearchProvider, Submission,
    UnavailableProvider,
};
pub use render::{RenderOptions, ReportRenderer, TEMPLATE_VERSION};
pub use store::{StateStore, TaskUpdate};
pub use types::{
    Complexity, CostEstimate, ResearchResult, ResearchTask, Source, TaskStatus, TokenUsage,
};
