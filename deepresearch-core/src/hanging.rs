//! Stall detection for long-running research tasks.
//!
//! Tracks progress snapshots per task and classifies whether a task is
//! still making headway or has hung. Provider-reported progress can be
//! synthetic, so the primary signal is how long the remote state has gone
//! unchanged; total elapsed time provides the hard bounds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Snapshots retained per task.
const MAX_SNAPSHOTS: usize = 100;

/// A single progress observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Display progress 0..=100; may be synthetic.
    pub progress: u8,
    pub action: String,
    /// Remote session state at observation time (e.g. "running").
    pub remote_state: String,
}

/// Result of a stall analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HangingStatus {
    pub is_hanging: bool,
    pub reason: String,
    /// Confidence in 0.0..=1.0.
    pub confidence: f64,
    pub elapsed_minutes: f64,
    pub last_progress: u8,
    /// Minutes since the remote state last changed.
    pub status_stall_minutes: f64,
    pub recommendation: String,
}

/// Detects stuck research tasks from their progress history.
pub struct HangingDetector {
    stall_threshold_minutes: f64,
    concern_minutes: f64,
    excessive_minutes: f64,
    history: HashMap<Uuid, Vec<ProgressSnapshot>>,
}

impl Default for HangingDetector {
    fn default() -> Self {
        Self::new(15.0, 30.0, 60.0)
    }
}

impl HangingDetector {
    pub fn new(stall_threshold_minutes: f64, concern_minutes: f64, excessive_minutes: f64) -> Self {
        Self {
            stall_threshold_minutes,
            concern_minutes,
            excessive_minutes,
            history: HashMap::new(),
        }
    }

    /// Record a progress observation for a task.
    pub fn record(&mut self, task_id: Uuid, progress: u8, action: &str, remote_state: &str) {
        let snapshots = self.history.entry(task_id).or_default();
        snapshots.push(ProgressSnapshot {
            timestamp: Utc::now(),
            progress,
            action: action.to_string(),
            remote_state: remote_state.to_string(),
        });
        if snapshots.len() > MAX_SNAPSHOTS {
            let excess = snapshots.len() - MAX_SNAPSHOTS;
            snapshots.drain(..excess);
        }
    }

    /// Drop the history for a finished task.
    pub fn clear(&mut self, task_id: &Uuid) {
        self.history.remove(task_id);
    }

    pub fn history(&self, task_id: &Uuid) -> &[ProgressSnapshot] {
        self.history.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Analyze a task's history for hang patterns.
    pub fn analyze(&self, task_id: &Uuid, created_at: Option<DateTime<Utc>>) -> HangingStatus {
        let history = self.history(task_id);
        let now = Utc::now();

        let elapsed_minutes = created_at
            .or_else(|| history.first().map(|s| s.timestamp))
            .map(|start| (now - start).num_milliseconds() as f64 / 60_000.0)
            .unwrap_or(0.0);

        if history.len() < 2 {
            return HangingStatus {
                is_hanging: false,
                reason: "Insufficient progress data".into(),
                confidence: 0.0,
                elapsed_minutes,
                last_progress: history.last().map(|s| s.progress).unwrap_or(0),
                status_stall_minutes: 0.0,
                recommendation: "Continue monitoring".into(),
            };
        }

        let last_progress = history[history.len() - 1].progress;
        let status_stall_minutes = Self::status_stall_minutes(history);

        if elapsed_minutes > self.excessive_minutes {
            return HangingStatus {
                is_hanging: true,
                reason: format!(
                    "Excessive duration: {elapsed_minutes:.0} min (expected 5-40 min)"
                ),
                confidence: 0.95,
                elapsed_minutes,
                last_progress,
                status_stall_minutes,
                recommendation: "Cancel task - almost certainly hung".into(),
            };
        }

        if status_stall_minutes > self.stall_threshold_minutes {
            let confidence =
                (0.5 + (status_stall_minutes / self.excessive_minutes) * 0.4).min(0.9);
            return HangingStatus {
                is_hanging: true,
                reason: format!("Remote state unchanged for {status_stall_minutes:.0} min"),
                confidence,
                elapsed_minutes,
                last_progress,
                status_stall_minutes,
                recommendation: "Consider cancelling - no provider response change detected"
                    .into(),
            };
        }

        if last_progress >= 90 && status_stall_minutes > 10.0 {
            return HangingStatus {
                is_hanging: true,
                reason: format!(
                    "Stuck at {last_progress}% for {status_stall_minutes:.0} min"
                ),
                confidence: 0.8,
                elapsed_minutes,
                last_progress,
                status_stall_minutes,
                recommendation: "Cancel task - finalization appears hung".into(),
            };
        }

        if elapsed_minutes > self.concern_minutes && last_progress < 50 {
            return HangingStatus {
                is_hanging: false,
                reason: format!("Slow progress: {last_progress}% after {elapsed_minutes:.0} min"),
                confidence: 0.4,
                elapsed_minutes,
                last_progress,
                status_stall_minutes,
                recommendation: "Monitor closely - slower than expected".into(),
            };
        }

        HangingStatus {
            is_hanging: false,
            reason: "Task progressing normally".into(),
            confidence: 0.1,
            elapsed_minutes,
            last_progress,
            status_stall_minutes,
            recommendation: "Continue - within expected parameters".into(),
        }
    }

    /// Minutes since the remote state last changed. Falls back to progress
    /// changes when no state strings were recorded.
    fn status_stall_minutes(history: &[ProgressSnapshot]) -> f64 {
        let last = &history[history.len() - 1];
        if last.remote_state.is_empty() {
            return Self::progress_stall_minutes(history);
        }

        let mut last_change = last.timestamp;
        for snapshot in history[..history.len() - 1].iter().rev() {
            if !snapshot.remote_state.is_empty() && snapshot.remote_state != last.remote_state {
                break;
            }
            last_change = snapshot.timestamp;
        }
        (last.timestamp - last_change).num_milliseconds() as f64 / 60_000.0
    }

    fn progress_stall_minutes(history: &[ProgressSnapshot]) -> f64 {
        let last = &history[history.len() - 1];
        let mut last_change = last.timestamp;
        for snapshot in history[..history.len() - 1].iter().rev() {
            if snapshot.progress != last.progress {
                break;
            }
            last_change = snapshot.timestamp;
        }
        (last.timestamp - last_change).num_milliseconds() as f64 / 60_000.0
    }

    /// Progress rate in percent per minute, if computable.
    pub fn progress_rate(&self, task_id: &Uuid) -> Option<f64> {
        let history = self.history(task_id);
        if history.len() < 2 {
            return None;
        }
        let first = &history[0];
        let last = &history[history.len() - 1];
        let delta = last.progress as f64 - first.progress as f64;
        let minutes = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 60_000.0;
        if minutes <= 0.0 {
            return None;
        }
        Some(delta / minutes)
    }

    /// Estimated minutes to completion, if the rate is positive.
    pub fn estimate_remaining_minutes(&self, task_id: &Uuid) -> Option<f64> {
        let history = self.history(task_id);
        let rate = self.progress_rate(task_id)?;
        if rate <= 0.0 {
            return None;
        }
        let remaining = 100.0 - history.last()?.progress as f64;
        Some(remaining / rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn backdated(detector: &mut HangingDetector, task_id: Uuid, entries: &[(i64, u8, &str)]) {
        // (minutes_ago, progress, remote_state)
        let snapshots = detector.history.entry(task_id).or_default();
        for (minutes_ago, progress, state) in entries {
            snapshots.push(ProgressSnapshot {
                timestamp: Utc::now() - Duration::minutes(*minutes_ago),
                progress: *progress,
                action: String::new(),
                remote_state: state.to_string(),
            });
        }
    }

    #[test]
    fn test_insufficient_data() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        detector.record(id, 10, "starting", "running");
        let status = detector.analyze(&id, None);
        assert!(!status.is_hanging);
        assert_eq!(status.reason, "Insufficient progress data");
        assert_eq!(status.last_progress, 10);
    }

    #[test]
    fn test_normal_progress() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        backdated(
            &mut detector,
            id,
            &[(10, 20, "planning"), (5, 40, "searching"), (1, 60, "writing")],
        );
        let status = detector.analyze(&id, None);
        assert!(!status.is_hanging);
        assert!(status.confidence < 0.2);
    }

    #[test]
    fn test_excessive_duration() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        backdated(&mut detector, id, &[(90, 30, "running"), (1, 35, "running")]);
        let status = detector.analyze(&id, Some(Utc::now() - Duration::minutes(90)));
        assert!(status.is_hanging);
        assert!(status.reason.contains("Excessive duration"));
        assert!(status.confidence > 0.9);
    }

    #[test]
    fn test_stalled_remote_state() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        backdated(
            &mut detector,
            id,
            &[(25, 40, "running"), (20, 40, "running"), (1, 40, "running")],
        );
        let status = detector.analyze(&id, Some(Utc::now() - Duration::minutes(25)));
        assert!(status.is_hanging);
        assert!(status.reason.contains("unchanged"));
        assert!(status.status_stall_minutes > 15.0);
    }

    #[test]
    fn test_stuck_at_finalization() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        backdated(
            &mut detector,
            id,
            &[(14, 60, "running"), (12, 95, "finalizing"), (1, 95, "finalizing")],
        );
        let status = detector.analyze(&id, Some(Utc::now() - Duration::minutes(14)));
        assert!(status.is_hanging);
        assert!(status.reason.contains("Stuck at 95%"));
    }

    #[test]
    fn test_progress_rate_and_estimate() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        backdated(&mut detector, id, &[(10, 20, "running"), (0, 60, "running")]);
        let rate = detector.progress_rate(&id).unwrap();
        assert!((rate - 4.0).abs() < 0.5);
        let remaining = detector.estimate_remaining_minutes(&id).unwrap();
        assert!(remaining > 5.0 && remaining < 15.0);
    }

    #[test]
    fn test_history_bounded() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        for i in 0..250 {
            detector.record(id, (i % 100) as u8, "", "running");
        }
        assert_eq!(detector.history(&id).len(), MAX_SNAPSHOTS);
    }

    #[test]
    fn test_clear() {
        let mut detector = HangingDetector::default();
        let id = Uuid::new_v4();
        detector.record(id, 10, "", "running");
        detector.clear(&id);
        assert!(detector.history(&id).is_empty());
    }
}
