//! Best-effort desktop notifications with a graceful fallback chain.
//!
//! Delivery degrades through three tiers: the `notify-rust` library first,
//! then the platform notification CLI (`notify-send` on Linux, `osascript`
//! on macOS, a PowerShell toast on Windows), and finally a log-only sink.
//! `notify` never returns an error and never panics; the boolean only
//! reports whether a desktop delivery was attempted successfully.

use async_trait::async_trait;
use tracing::{debug, info, warn};

const APPLICATION_NAME: &str = "Deep Research";

/// Notification urgency, mapped onto platform hints where supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

/// Fire-and-forget notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Attempt to deliver a notification. Must never fail.
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> bool;

    /// Terminal-success convenience wrapper.
    async fn research_complete(&self, task_id: &str, duration_minutes: f64) -> bool {
        let short_id: String = task_id.chars().take(8).collect();
        let body = format!("Task {short_id} finished in {duration_minutes:.1} minutes");
        self.notify("Deep Research Complete", &body, Urgency::Normal)
            .await
    }

    /// Terminal-failure convenience wrapper.
    async fn research_failed(&self, task_id: &str, error: &str) -> bool {
        let short_id: String = task_id.chars().take(8).collect();
        let brief: String = error.chars().take(100).collect();
        let body = format!("Task {short_id}: {brief}");
        self.notify("Deep Research Failed", &body, Urgency::Critical)
            .await
    }
}

/// Desktop notifier: `notify-rust` first, platform CLI as fallback.
#[derive(Debug, Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    pub fn new() -> Self {
        Self
    }

    /// First tier: the `notify-rust` library. `show()` can block on the
    /// platform backend, so it runs on the blocking pool.
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    async fn send_library(&self, title: &str, body: &str, urgency: Urgency) -> bool {
        let title = title.to_string();
        let body = body.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut notification = notify_rust::Notification::new();
            notification
                .appname(APPLICATION_NAME)
                .summary(&title)
                .body(&body);
            // Urgency hints are only honored by the XDG backend.
            #[cfg(all(unix, not(target_os = "macos")))]
            notification.urgency(match urgency {
                Urgency::Low => notify_rust::Urgency::Low,
                Urgency::Normal => notify_rust::Urgency::Normal,
                Urgency::Critical => notify_rust::Urgency::Critical,
            });
            #[cfg(not(all(unix, not(target_os = "macos"))))]
            let _ = urgency;
            notification.show().map(|_| ())
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                debug!("notification delivered via notify-rust");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "notify-rust delivery failed, trying CLI fallback");
                false
            }
            Err(e) => {
                warn!(error = %e, "notify-rust task failed, trying CLI fallback");
                false
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    async fn send_library(&self, _title: &str, _body: &str, _urgency: Urgency) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    async fn send_platform(&self, title: &str, body: &str, urgency: Urgency) -> bool {
        let mut cmd = tokio::process::Command::new("notify-send");
        cmd.arg("-a").arg(APPLICATION_NAME);
        match urgency {
            Urgency::Low => {
                cmd.arg("-u").arg("low");
            }
            Urgency::Critical => {
                cmd.arg("-u").arg("critical");
            }
            Urgency::Normal => {}
        }
        cmd.arg(title).arg(body);
        run_quiet(cmd, "notify-send").await
    }

    #[cfg(target_os = "macos")]
    async fn send_platform(&self, title: &str, body: &str, _urgency: Urgency) -> bool {
        let safe_title = title.replace('"', "\\\"");
        let safe_body = body.replace('"', "\\\"");
        let script =
            format!("display notification \"{safe_body}\" with title \"{safe_title}\"");
        let mut cmd = tokio::process::Command::new("osascript");
        cmd.arg("-e").arg(script);
        run_quiet(cmd, "osascript").await
    }

    #[cfg(target_os = "windows")]
    async fn send_platform(&self, title: &str, body: &str, _urgency: Urgency) -> bool {
        let safe_title = title.replace('\'', "''");
        let safe_body = body.replace('\'', "''");
        let script = format!(
            "New-BurntToastNotification -Text '{safe_title}', '{safe_body}'"
        );
        let mut cmd = tokio::process::Command::new("powershell");
        cmd.arg("-Command").arg(script);
        run_quiet(cmd, "powershell").await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    async fn send_platform(&self, _title: &str, _body: &str, _urgency: Urgency) -> bool {
        false
    }
}

/// Run a notification command, swallowing every failure mode.
#[allow(dead_code)]
async fn run_quiet(mut cmd: tokio::process::Command, name: &str) -> bool {
    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    match cmd.status().await {
        Ok(status) if status.success() => {
            debug!(command = name, "notification delivered");
            true
        }
        Ok(status) => {
            warn!(command = name, code = ?status.code(), "notification command failed");
            false
        }
        Err(e) => {
            warn!(command = name, error = %e, "notification command unavailable");
            false
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> bool {
        if self.send_library(title, body, urgency).await {
            return true;
        }
        if self.send_platform(title, body, urgency).await {
            return true;
        }
        // Final fallback: the notification is at least visible in the logs.
        info!(title, body, ?urgency, "NOTIFICATION");
        false
    }
}

/// Notifier that records deliveries without touching the desktop. For tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    deliveries: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(String, String)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, body: &str, _urgency: Urgency) -> bool {
        self.deliveries
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        true
    }
}
