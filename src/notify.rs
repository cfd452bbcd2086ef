use crate::config::NotifyConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{NotifyPolicy, WorkspaceStatus};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub workspace_id: String,
    pub workspace_title: String,
    pub run_id: String,
    pub run_type: String,
    pub status: WorkspaceStatus,
    pub previous_status: WorkspaceStatus,
    pub policy: NotifyPolicy,
    pub exit_code: Option<i32>,
    pub duration_secs: u64,
    pub summary: String,
}

impl Notification {
    pub fn title(&self) -> String {
        let outcome = match self.status {
            WorkspaceStatus::Failed => "failed",
            WorkspaceStatus::NeedsInput => "needs input",
            WorkspaceStatus::Idle => "finished",
        };
        format!("{}: {} {}", self.workspace_title, self.run_type, outcome)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> AppResult<()>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        tracing::info!(
            workspace_id = %notification.workspace_id,
            run_id = %notification.run_id,
            status = notification.status.as_str(),
            summary = %notification.summary,
            "{}",
            notification.title()
        );
        Ok(())
    }
}

#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| AppError::Internal(format!("failed to build webhook client: {}", error)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        let body = serde_json::json!({
            "title": notification.title(),
            "notification": notification,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|error| AppError::Io(format!("webhook request failed: {}", error)))?;
        if !response.status().is_success() {
            return Err(AppError::Io(format!(
                "webhook responded with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub fn notifier_from_config(config: &NotifyConfig) -> AppResult<Arc<dyn Notifier>> {
    match config.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(Arc::new(WebhookNotifier::new(
            url,
            Duration::from_millis(config.timeout_ms),
        )?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Sends without awaiting. Failures are logged and never reach the caller.
pub fn spawn_detached(notifier: Arc<dyn Notifier>, notification: Notification) {
    let span = tracing::info_span!(
        "run_notification",
        run_id = %notification.run_id,
        workspace_id = %notification.workspace_id
    );
    tokio::spawn(
        async move {
            if let Err(error) = notifier.send(&notification).await {
                tracing::warn!(error = %error, "failed to deliver run notification");
            }
        }
        .instrument(span),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: WorkspaceStatus) -> Notification {
        Notification {
            workspace_id: "ws-1".to_string(),
            workspace_title: "api".to_string(),
            run_id: "run-1".to_string(),
            run_type: "test".to_string(),
            status,
            previous_status: WorkspaceStatus::Idle,
            policy: NotifyPolicy::All,
            exit_code: Some(1),
            duration_secs: 4,
            summary: "Error: boom".to_string(),
        }
    }

    #[test]
    fn title_names_the_outcome() {
        assert_eq!(sample(WorkspaceStatus::Failed).title(), "api: test failed");
        assert_eq!(sample(WorkspaceStatus::NeedsInput).title(), "api: test needs input");
    }

    #[test]
    fn config_without_webhook_uses_log_notifier() {
        assert!(notifier_from_config(&NotifyConfig::default()).is_ok());
        let blank = NotifyConfig {
            webhook_url: Some("  ".to_string()),
            ..NotifyConfig::default()
        };
        assert!(notifier_from_config(&blank).is_ok());
    }

    #[tokio::test]
    async fn unreachable_webhook_reports_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(500))
            .expect("client");
        assert!(notifier.send(&sample(WorkspaceStatus::Failed)).await.is_err());
    }
}
