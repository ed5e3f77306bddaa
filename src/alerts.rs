//! Operator alerts.
//!
//! Components raise [`Alert`]s through an [`AlertSink`]; the service wires a
//! fan-out of a tracing sink, an in-memory log for the status API and,
//! when configured, a chat webhook.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Something an operator should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    /// A producer went silent. `silent_for_ms` is `None` if it never reported.
    ProducerDown {
        producer_id: u32,
        silent_for_ms: Option<i64>,
    },
    ProducerRecovered {
        producer_id: u32,
    },
    FeedReconnected {
        attempts: u32,
    },
    FeedFatal {
        reason: String,
    },
    ServiceStarted {
        bookmaker_id: String,
        products: Vec<String>,
    },
}

/// Coarse urgency used for log level and webhook prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Alert {
    pub fn severity(&self) -> Severity {
        match self {
            Alert::ProducerDown { .. } | Alert::FeedFatal { .. } => Severity::Critical,
            Alert::FeedReconnected { .. } => Severity::Warning,
            Alert::ProducerRecovered { .. } | Alert::ServiceStarted { .. } => Severity::Info,
        }
    }

    /// One-line human readable text.
    pub fn message(&self) -> String {
        match self {
            Alert::ProducerDown {
                producer_id,
                silent_for_ms: Some(ms),
            } => format!("Producer {} is down (no alive for {}ms)", producer_id, ms),
            Alert::ProducerDown {
                producer_id,
                silent_for_ms: None,
            } => format!("Producer {} is down (never reported)", producer_id),
            Alert::ProducerRecovered { producer_id } => {
                format!("Producer {} recovered", producer_id)
            }
            Alert::FeedReconnected { attempts } => {
                format!("Feed connection re-established after {} attempt(s)", attempts)
            }
            Alert::FeedFatal { reason } => format!("Feed connection lost for good: {}", reason),
            Alert::ServiceStarted {
                bookmaker_id,
                products,
            } => format!(
                "Feed service started for bookmaker {} (recovery products: {})",
                bookmaker_id,
                products.join(", ")
            ),
        }
    }
}

/// Destination for alerts. Must not block the caller.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Logs alerts at a level matching their severity.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &Alert) {
        let message = alert.message();
        match alert.severity() {
            Severity::Critical => tracing::error!(alert = ?alert, "{}", message),
            Severity::Warning => tracing::warn!(alert = ?alert, "{}", message),
            Severity::Info => tracing::info!(alert = ?alert, "{}", message),
        }
    }
}

/// Timestamped alert kept by [`RecentAlerts`].
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub alert: Alert,
}

/// Bounded in-memory log of the most recent alerts.
pub struct RecentAlerts {
    capacity: usize,
    records: Mutex<VecDeque<AlertRecord>>,
}

impl RecentAlerts {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Newest last.
    pub fn records(&self) -> Vec<AlertRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.records.lock().iter().map(|r| r.alert.clone()).collect()
    }
}

impl AlertSink for RecentAlerts {
    fn notify(&self, alert: &Alert) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(AlertRecord {
            at: Utc::now(),
            severity: alert.severity(),
            message: alert.message(),
            alert: alert.clone(),
        });
    }
}

/// Posts alerts to a chat webhook as `{"msg_type":"text","content":{"text":..}}`.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    fn body(alert: &Alert) -> serde_json::Value {
        let prefix = match alert.severity() {
            Severity::Critical => "[CRITICAL] ",
            Severity::Warning => "[WARNING] ",
            Severity::Info => "",
        };
        serde_json::json!({
            "msg_type": "text",
            "content": { "text": format!("{}{}", prefix, alert.message()) },
        })
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, alert: &Alert) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime; webhook alert dropped");
            return;
        };
        let request = self.client.post(&self.url).json(&Self::body(alert));
        runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => tracing::warn!(status = %resp.status(), "alert webhook rejected message"),
                Err(e) => tracing::warn!(error = %e, "alert webhook unreachable"),
            }
        });
    }
}

/// Forwards every alert to each inner sink.
#[derive(Default)]
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AlertSink for FanoutAlertSink {
    fn notify(&self, alert: &Alert) {
        for sink in &self.sinks {
            sink.notify(alert);
        }
    }
}
