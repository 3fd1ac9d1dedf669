//! Webhook alerts for finished scans and newly discovered subdomains.
//!
//! When a webhook URL is configured, every alert is one JSON POST of
//! `{message, severity, details}`. Without a URL the alert is only logged.
//! Delivery failures are logged and never affect the scan.

use crate::aggregate::ScanStats;
use crate::scheduler::ScanEvent;
use crate::state::{ScanId, ScanStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Medium,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub message: String,
    pub severity: AlertSeverity,
    pub details: serde_json::Value,
}

impl Alert {
    /// The alert to raise for an event, if any.
    pub fn for_event(event: &ScanEvent) -> Option<Self> {
        match event {
            ScanEvent::ScanFinished {
                scan_id,
                status,
                stats,
            } => Some(Self::scan_finished(*scan_id, *status, stats)),
            ScanEvent::NewSubdomains {
                scan_id,
                target,
                hosts,
            } if !hosts.is_empty() => Some(Self {
                message: format!("Found {} new subdomains!", hosts.len()),
                severity: AlertSeverity::Medium,
                details: serde_json::json!({
                    "scan_id": scan_id,
                    "target": target,
                    "subdomains": hosts,
                }),
            }),
            _ => None,
        }
    }

    fn scan_finished(scan_id: ScanId, status: ScanStatus, stats: &ScanStats) -> Self {
        let severity = match status {
            ScanStatus::Failed => AlertSeverity::Critical,
            ScanStatus::Partial => AlertSeverity::Warning,
            _ => AlertSeverity::Info,
        };
        Self {
            message: format!("Scan {} finished: {}", scan_id, status),
            severity,
            details: serde_json::json!({
                "scan_id": scan_id,
                "status": status,
                "stats": stats,
            }),
        }
    }
}

/// Sends alerts to the configured webhook.
#[derive(Debug, Clone)]
pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.webhook_url.as_deref()
    }

    pub async fn send(&self, alert: &Alert) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::info!(
                severity = ?alert.severity,
                details = %alert.details,
                "{}",
                alert.message
            );
            return Ok(());
        };

        self.client
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(alert)
            .send()
            .await
            .context("Failed to send webhook alert")?
            .error_for_status()
            .context("Webhook returned error status")?;
        tracing::debug!(url = %url, "Webhook alert delivered");
        Ok(())
    }

    /// Forward alerts for scan events until the event channel closes.
    pub fn spawn(self, mut events: broadcast::Receiver<ScanEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(alert) = Alert::for_event(&event)
                            && let Err(e) = self.send(&alert).await
                        {
                            tracing::warn!(error = %format!("{:#}", e), "Alert delivery failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Alert listener lagged behind scan events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(status: ScanStatus) -> ScanEvent {
        ScanEvent::ScanFinished {
            scan_id: ScanId::new(),
            status,
            stats: ScanStats {
                subdomains: 3,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_alert_severity_follows_status() {
        assert_eq!(
            Alert::for_event(&finished(ScanStatus::Failed)).unwrap().severity,
            AlertSeverity::Critical
        );
        assert_eq!(
            Alert::for_event(&finished(ScanStatus::Partial)).unwrap().severity,
            AlertSeverity::Warning
        );
        let alert = Alert::for_event(&finished(ScanStatus::Completed)).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Info);
        assert_eq!(alert.details["stats"]["subdomains"], 3);
        assert_eq!(alert.details["status"], "completed");
    }

    #[test]
    fn test_new_subdomains_raise_medium_alert() {
        let event = ScanEvent::NewSubdomains {
            scan_id: ScanId::new(),
            target: "example.com".into(),
            hosts: vec!["a.example.com".into(), "b.example.com".into()],
        };
        let alert = Alert::for_event(&event).unwrap();
        assert_eq!(alert.message, "Found 2 new subdomains!");
        assert_eq!(alert.severity, AlertSeverity::Medium);
        assert_eq!(alert.details["target"], "example.com");
        assert_eq!(alert.details["subdomains"][1], "b.example.com");
        assert_eq!(serde_json::to_value(alert.severity).unwrap(), "medium");

        let none = ScanEvent::NewSubdomains {
            scan_id: ScanId::new(),
            target: "example.com".into(),
            hosts: vec![],
        };
        assert!(Alert::for_event(&none).is_none());
    }

    #[test]
    fn test_no_alert_for_progress_events() {
        let event = ScanEvent::Submitted {
            scan_id: ScanId::new(),
            target: "example.com".into(),
            profile: "quick".into(),
            stages: vec![],
        };
        assert!(Alert::for_event(&event).is_none());
    }

    #[test]
    fn test_blank_webhook_is_disabled() {
        assert!(Notifier::new(Some("  ".into())).webhook_url().is_none());
    }

    #[tokio::test]
    async fn test_send_without_webhook_only_logs() {
        let alert = Alert::for_event(&finished(ScanStatus::Completed)).unwrap();
        assert!(Notifier::new(None).send(&alert).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let alert = Alert::for_event(&finished(ScanStatus::Failed)).unwrap();
        let notifier = Notifier::new(Some("http://127.0.0.1:9/hook".into()));
        assert!(notifier.send(&alert).await.is_err());
    }
}
