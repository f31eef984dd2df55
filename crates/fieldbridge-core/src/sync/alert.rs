//! Operator alerts for failures that need a human, such as rejected credentials.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::AlertConfig;

/// Delivers operator alerts.
pub trait Alerter: Send + Sync {
    fn alert(&self, subject: &str, message: &str);
}

impl<T: Alerter + ?Sized> Alerter for Arc<T> {
    fn alert(&self, subject: &str, message: &str) {
        (**self).alert(subject, message);
    }
}

impl<T: Alerter + ?Sized> Alerter for Box<T> {
    fn alert(&self, subject: &str, message: &str) {
        (**self).alert(subject, message);
    }
}

/// Writes alerts to the log at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, subject: &str, message: &str) {
        tracing::error!(target: "fieldbridge::alert", subject, "{message}");
    }
}

/// Versioned JSON body POSTed by [`WebhookAlerter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub version: String,
    pub source: String,
    pub subject: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertPayload {
    pub fn new(subject: &str, message: &str) -> Self {
        Self {
            version: "1.0".to_string(),
            source: "fieldbridge".to_string(),
            subject: subject.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Logs each alert and POSTs it to a webhook.
///
/// Delivery runs on its own thread with a blocking client and finishes before
/// `alert` returns. Delivery failures are logged, never returned.
#[derive(Debug, Clone)]
pub struct WebhookAlerter {
    url: String,
    timeout: Duration,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    /// `None` when no webhook is configured.
    pub fn from_config(config: &AlertConfig) -> Option<Self> {
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), Duration::from_secs(config.timeout_secs)))
    }

    fn deliver(url: &str, timeout: Duration, payload: &AlertPayload) -> Result<(), String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        let resp = client.post(url).json(payload).send().map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("webhook answered HTTP {}", status.as_u16()));
        }
        Ok(())
    }
}

impl Alerter for WebhookAlerter {
    fn alert(&self, subject: &str, message: &str) {
        LogAlerter.alert(subject, message);

        let payload = AlertPayload::new(subject, message);
        let url = self.url.clone();
        let timeout = self.timeout;
        let delivery = std::thread::spawn(move || Self::deliver(&url, timeout, &payload));
        match delivery.join() {
            Ok(Ok(())) => tracing::debug!(url = %self.url, subject, "alert delivered"),
            Ok(Err(e)) => tracing::warn!(url = %self.url, error = %e, "alert webhook delivery failed"),
            Err(_) => tracing::warn!(url = %self.url, "alert webhook delivery thread panicked"),
        }
    }
}

/// Keeps alerts in memory.
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<(String, String)>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far as `(subject, message)`.
    pub fn alerts(&self) -> Vec<(String, String)> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Alerter for RecordingAlerter {
    fn alert(&self, subject: &str, message: &str) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push((subject.to_string(), message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_recorder_sees_alerts() {
        let recorder = Arc::new(RecordingAlerter::new());
        let boxed: Box<dyn Alerter> = Box::new(recorder.clone());
        boxed.alert("auth", "token rejected");
        LogAlerter.alert("auth", "token rejected");
        assert_eq!(
            recorder.alerts(),
            vec![("auth".to_string(), "token rejected".to_string())]
        );
    }

    #[test]
    fn webhook_receives_alert_payload() {
        let mut server = mockito::Server::new();
        let hook = server
            .mock("POST", "/hooks/ops")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "version": "1.0",
                "source": "fieldbridge",
                "subject": "CRM authentication failed",
            })))
            .with_status(204)
            .expect(1)
            .create();

        let alerter = WebhookAlerter::from_config(&AlertConfig {
            webhook_url: Some(format!("{}/hooks/ops", server.url())),
            timeout_secs: 5,
        })
        .unwrap();
        alerter.alert("CRM authentication failed", "token rejected");
        hook.assert();
    }

    #[tokio::test]
    async fn webhook_failure_does_not_panic_inside_runtime() {
        let alerter = WebhookAlerter::new("http://127.0.0.1:9/hooks", Duration::from_secs(1));
        let boxed: Box<dyn Alerter> = Box::new(alerter);
        boxed.alert("auth", "token rejected");
        assert!(WebhookAlerter::from_config(&AlertConfig::default()).is_none());
    }
}
