//! Out-of-band alerts for runs that did not fully succeed

use crate::models::{truncate_chars, RunOutcome, RunRecord, ALERT_ERROR_CHARS};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Message emitted when a run ends partial or failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub title: String,
    /// `"<first failing source>: <truncated error>"`
    pub message: String,
}

impl Alert {
    /// Alert for a record, or `None` when the run succeeded
    pub fn from_record(record: &RunRecord) -> Option<Self> {
        if !record.outcome.needs_alert() {
            return None;
        }

        let message = match &record.first_failure {
            Some(name) => {
                let error = record
                    .per_source
                    .get(name)
                    .and_then(|s| s.error.as_deref())
                    .or(record.error.as_deref())
                    .unwrap_or("unknown error");
                format!("{}: {}", name, truncate_chars(error, ALERT_ERROR_CHARS))
            }
            None => truncate_chars(
                record.error.as_deref().unwrap_or("unknown error"),
                ALERT_ERROR_CHARS,
            ),
        };

        let title = match record.outcome {
            RunOutcome::Failure => "Ragsync run failed",
            _ => "Ragsync run partially failed",
        };

        Some(Self {
            run_id: record.run_id,
            outcome: record.outcome,
            title: title.to_string(),
            message,
        })
    }
}

/// Delivers alerts. Delivery is best effort and never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

/// Writes alerts to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) {
        warn!(run_id = %alert.run_id, outcome = %alert.outcome, "{}: {}", alert.title, alert.message);
    }
}

/// Logs, then shows a desktop notification where the platform has one
pub struct DesktopNotifier;

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, alert: &Alert) {
        LogNotifier.notify(alert).await;

        let Some(mut command) = desktop_command(&alert.title, &alert.message) else {
            return;
        };
        command.kill_on_drop(true);
        match tokio::time::timeout(NOTIFY_TIMEOUT, command.output()).await {
            Ok(Ok(out)) if out.status.success() => debug!("Desktop notification sent"),
            Ok(Ok(out)) => debug!("Notifier exited with {}", out.status),
            Ok(Err(e)) => debug!("Desktop notification unavailable: {}", e),
            Err(_) => debug!("Desktop notification timed out"),
        }
    }
}

#[cfg(target_os = "macos")]
fn desktop_command(title: &str, message: &str) -> Option<tokio::process::Command> {
    let script = format!(
        "display notification \"{}\" with title \"{}\"",
        escape_applescript(message),
        escape_applescript(title)
    );
    let mut command = tokio::process::Command::new("osascript");
    command.arg("-e").arg(script);
    Some(command)
}

#[cfg(target_os = "linux")]
fn desktop_command(title: &str, message: &str) -> Option<tokio::process::Command> {
    let mut command = tokio::process::Command::new("notify-send");
    command.arg("--app-name=ragsync").arg(title).arg(message);
    Some(command)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn desktop_command(_title: &str, _message: &str) -> Option<tokio::process::Command> {
    None
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
