//! Best-effort notification fan-out (mail/chat/audio), modelled directly on
//! the teacher's `WebhookClient::send_event`: fire-and-forget, failures are
//! logged and never propagated into the pulse.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub mail_enabled: bool,
    pub chat_webhook_url: Option<String>,
    pub audio_cues_enabled: bool,
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            mail_enabled: false,
            chat_webhook_url: None,
            audio_cues_enabled: false,
            timeout: Duration::from_secs(10),
        }
    }
}

/// The task-status-change events a notifier fans out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    TaskBlocked { task_id: String, reason: String },
    TaskFailed { task_id: String, reason: String },
    TaskDeployed { task_id: String, pr_url: Option<String> },
    TaskVerified { task_id: String },
    BatchComplete { batch_name: String },
}

#[derive(Debug, Serialize)]
struct NotifyPayload<'a> {
    timestamp: DateTime<Utc>,
    event: &'a NotifyEvent,
}

/// Fan-out target for notifications. Implementations must never let a
/// delivery failure escape as an `Err` that aborts the pulse — the trait's
/// single method swallows its own errors and only logs them, matching §7's
/// "best-effort writes are always non-fatal" rule.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotifyEvent);
}

/// The default notifier: an optional chat webhook POST plus (host-specific,
/// best-effort) mail/audio cues. Every channel failure is caught and logged,
/// never returned to the caller.
pub struct FanOutNotifier {
    config: NotifyConfig,
    client: reqwest::blocking::Client,
}

impl FanOutNotifier {
    pub fn new(config: NotifyConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

impl Notifier for FanOutNotifier {
    fn notify(&self, event: &NotifyEvent) {
        if let Some(url) = &self.config.chat_webhook_url {
            let payload = NotifyPayload {
                timestamp: Utc::now(),
                event,
            };
            if let Err(e) = self.client.post(url).json(&payload).send() {
                tracing::warn!(error = %e, "chat webhook delivery failed, continuing");
            }
        }
        if self.config.mail_enabled {
            tracing::debug!(?event, "mail notification requested (mail relay out of scope)");
        }
        if self.config.audio_cues_enabled {
            tracing::debug!(?event, "audio cue requested");
        }
    }
}

/// A notifier that records events in memory instead of sending anything,
/// for tests.
#[derive(Default)]
pub struct RecordingNotifier {
    events: std::sync::Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &NotifyEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_notifier_stores_events_in_order() {
        let notifier = RecordingNotifier::new();
        notifier.notify(&NotifyEvent::TaskBlocked {
            task_id: "t1".to_string(),
            reason: "auth_error".to_string(),
        });
        notifier.notify(&NotifyEvent::TaskVerified {
            task_id: "t1".to_string(),
        });
        assert_eq!(notifier.events().len(), 2);
    }
}
