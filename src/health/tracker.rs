//! Per-producer heartbeat tracking and the bet-acceptance gate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::{Alert, AlertSink};
use crate::config::HealthConfig;

/// Last heartbeat seen from one producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerStatus {
    pub producer_id: u32,

    /// Producer timestamp of the newest heartbeat, epoch milliseconds.
    pub last_alive_at: i64,

    /// Local time the newest heartbeat arrived.
    pub received_at: DateTime<Utc>,

    pub subscribed: bool,
}

/// Health verdict for one producer at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    Down,
}

/// Status plus verdict, as reported by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerReport {
    pub producer_id: u32,
    pub verdict: Verdict,

    /// `None` for an expected producer that has never reported.
    pub status: Option<ProducerStatus>,
    pub millis_since_alive: Option<i64>,
}

/// Answer of the bet-acceptance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BetAcceptance {
    pub accepting: bool,
    pub reason: String,
}

/// Tracks producer heartbeats and raises an alert on every health transition.
pub struct ProducerHealthTracker {
    down_threshold_ms: i64,
    warmup_ms: i64,
    started_at_ms: i64,
    expected: Vec<u32>,
    producers: RwLock<BTreeMap<u32, ProducerStatus>>,

    /// Last verdict announced per producer, so each transition alerts once.
    announced: Mutex<HashMap<u32, Verdict>>,
    alerts: Arc<dyn AlertSink>,
    resubscribe: Option<mpsc::UnboundedSender<u32>>,
}

/// Milliseconds since the epoch, wall clock.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl ProducerHealthTracker {
    /// # Arguments
    ///
    /// * `config` - Threshold and warm-up settings
    /// * `expected` - Producers that count as down until they first report
    /// * `alerts` - Receives one alert per health transition
    pub fn new(config: &HealthConfig, expected: Vec<u32>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            down_threshold_ms: config.down_threshold.as_millis() as i64,
            warmup_ms: config.warmup.as_millis() as i64,
            started_at_ms: now_millis(),
            expected,
            producers: RwLock::new(BTreeMap::new()),
            announced: Mutex::new(HashMap::new()),
            alerts,
            resubscribe: None,
        }
    }

    /// Pin the start instant used for the warm-up grace period.
    pub fn with_started_at(mut self, started_at_ms: i64) -> Self {
        self.started_at_ms = started_at_ms;
        self
    }

    /// Emit a producer id whenever it reports `subscribed=0` after being subscribed.
    pub fn with_resubscribe(mut self, tx: mpsc::UnboundedSender<u32>) -> Self {
        self.resubscribe = Some(tx);
        self
    }

    pub fn down_threshold(&self) -> Duration {
        Duration::from_millis(self.down_threshold_ms.max(0) as u64)
    }

    /// Record a heartbeat. Stale heartbeats never move `last_alive_at` backwards.
    pub fn record_alive(&self, producer_id: u32, timestamp: i64, subscribed: bool) {
        let previous_subscribed = {
            let mut producers = self.producers.write();
            let entry = producers.entry(producer_id);
            match entry {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(ProducerStatus {
                        producer_id,
                        last_alive_at: timestamp,
                        received_at: Utc::now(),
                        subscribed,
                    });
                    tracing::info!(producer_id, timestamp, subscribed, "first alive from producer");
                    None
                }
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    let status = slot.get_mut();
                    let previous = status.subscribed;
                    if timestamp >= status.last_alive_at {
                        status.last_alive_at = timestamp;
                        status.received_at = Utc::now();
                        status.subscribed = subscribed;
                    } else {
                        tracing::debug!(
                            producer_id,
                            timestamp,
                            last = status.last_alive_at,
                            "ignoring out-of-order alive"
                        );
                        return;
                    }
                    Some(previous)
                }
            }
        };

        if !subscribed && previous_subscribed != Some(false) {
            tracing::warn!(producer_id, "producer reports this client as unsubscribed");
            if let Some(tx) = &self.resubscribe {
                let _ = tx.send(producer_id);
            }
        }
    }

    pub fn status(&self, producer_id: u32) -> Option<ProducerStatus> {
        self.producers.read().get(&producer_id).cloned()
    }

    pub fn statuses(&self) -> Vec<ProducerStatus> {
        self.producers.read().values().cloned().collect()
    }

    pub fn is_healthy(&self, producer_id: u32) -> bool {
        self.is_healthy_at(producer_id, now_millis())
    }

    /// A producer is healthy if its newest heartbeat is within the down threshold.
    /// Unknown producers are unhealthy.
    pub fn is_healthy_at(&self, producer_id: u32, now_ms: i64) -> bool {
        self.producers
            .read()
            .get(&producer_id)
            .is_some_and(|s| now_ms - s.last_alive_at <= self.down_threshold_ms)
    }

    pub fn can_accept_bets(&self) -> BetAcceptance {
        self.can_accept_bets_at(now_millis())
    }

    /// Bets are accepted only while every known producer is healthy and, past
    /// warm-up, every expected producer has reported.
    pub fn can_accept_bets_at(&self, now_ms: i64) -> BetAcceptance {
        let reports = self.reports_at(now_ms);
        for report in &reports {
            if report.verdict == Verdict::Down {
                let reason = match report.millis_since_alive {
                    Some(ms) => format!(
                        "Producer {} is down (last alive {}ms ago)",
                        report.producer_id, ms
                    ),
                    None => format!("Producer {} is down (never reported)", report.producer_id),
                };
                return BetAcceptance {
                    accepting: false,
                    reason,
                };
            }
        }

        BetAcceptance {
            accepting: true,
            reason: "All producers are healthy".to_string(),
        }
    }

    fn in_warmup(&self, now_ms: i64) -> bool {
        now_ms - self.started_at_ms < self.warmup_ms
    }

    /// Verdicts for every known producer plus expected ones past warm-up.
    pub fn reports_at(&self, now_ms: i64) -> Vec<ProducerReport> {
        let producers = self.producers.read();
        let mut reports: Vec<ProducerReport> = producers
            .values()
            .map(|s| {
                let age = now_ms - s.last_alive_at;
                ProducerReport {
                    producer_id: s.producer_id,
                    verdict: if age <= self.down_threshold_ms {
                        Verdict::Healthy
                    } else {
                        Verdict::Down
                    },
                    status: Some(s.clone()),
                    millis_since_alive: Some(age),
                }
            })
            .collect();

        if !self.in_warmup(now_ms) {
            for id in &self.expected {
                if !producers.contains_key(id) {
                    reports.push(ProducerReport {
                        producer_id: *id,
                        verdict: Verdict::Down,
                        status: None,
                        millis_since_alive: None,
                    });
                }
            }
            reports.sort_by_key(|r| r.producer_id);
        }
        reports
    }

    /// Evaluate every producer and alert on transitions since the last check.
    ///
    /// # Returns
    ///
    /// Alerts raised by this check
    pub fn check_at(&self, now_ms: i64) -> Vec<Alert> {
        let reports = self.reports_at(now_ms);
        let mut announced = self.announced.lock();
        let mut raised = Vec::new();

        for report in reports {
            let previous = announced.insert(report.producer_id, report.verdict);
            let alert = match (previous, report.verdict) {
                (Some(Verdict::Down), Verdict::Healthy) => Some(Alert::ProducerRecovered {
                    producer_id: report.producer_id,
                }),
                (previous, Verdict::Down) if previous != Some(Verdict::Down) => {
                    Some(Alert::ProducerDown {
                        producer_id: report.producer_id,
                        silent_for_ms: report.millis_since_alive,
                    })
                }
                _ => None,
            };
            if let Some(alert) = alert {
                self.alerts.notify(&alert);
                raised.push(alert);
            }
        }
        raised
    }

    /// Run [`check_at`](Self::check_at) every `interval` after the warm-up
    /// grace period, until cancelled.
    pub fn spawn_monitor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let warmup = Duration::from_millis(self.warmup_ms.max(0) as u64);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + warmup;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("producer health monitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.check_at(now_millis());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecentAlerts;

    const T0: i64 = 1_700_000_000_000;

    fn tracker(expected: Vec<u32>, log: Arc<RecentAlerts>) -> ProducerHealthTracker {
        let config = HealthConfig {
            down_threshold: Duration::from_secs(20),
            warmup: Duration::from_secs(30),
            ..HealthConfig::default()
        };
        ProducerHealthTracker::new(&config, expected, log).with_started_at(T0)
    }

    #[test]
    fn test_unknown_producer_is_unhealthy() {
        let t = tracker(Vec::new(), Arc::new(RecentAlerts::new(4)));
        assert!(!t.is_healthy_at(1, T0));
    }

    #[test]
    fn test_threshold_boundary() {
        let t = tracker(Vec::new(), Arc::new(RecentAlerts::new(4)));
        t.record_alive(1, T0, true);

        assert!(t.is_healthy_at(1, T0 + 20_000));
        assert!(!t.is_healthy_at(1, T0 + 20_001));
    }

    #[test]
    fn test_out_of_order_heartbeat_ignored() {
        let t = tracker(Vec::new(), Arc::new(RecentAlerts::new(4)));
        t.record_alive(1, T0 + 5_000, true);
        t.record_alive(1, T0, true);

        assert_eq!(t.status(1).unwrap().last_alive_at, T0 + 5_000);
    }

    #[test]
    fn test_one_alert_per_transition() {
        let log = Arc::new(RecentAlerts::new(16));
        let t = tracker(Vec::new(), log.clone());
        t.record_alive(1, T0, true);

        assert!(t.check_at(T0 + 19_999).is_empty());
        assert_eq!(t.check_at(T0 + 20_001).len(), 1);
        assert!(t.check_at(T0 + 25_000).is_empty());

        t.record_alive(1, T0 + 26_000, true);
        assert_eq!(
            t.check_at(T0 + 26_500),
            vec![Alert::ProducerRecovered { producer_id: 1 }]
        );
        assert_eq!(log.alerts().len(), 2);
    }

    #[test]
    fn test_first_healthy_check_is_silent() {
        let log = Arc::new(RecentAlerts::new(4));
        let t = tracker(Vec::new(), log.clone());
        t.record_alive(3, T0, true);

        assert!(t.check_at(T0 + 1).is_empty());
        assert!(log.alerts().is_empty());
    }

    #[test]
    fn test_gate_names_down_producer() {
        let t = tracker(Vec::new(), Arc::new(RecentAlerts::new(4)));
        t.record_alive(1, T0, true);
        t.record_alive(3, T0 + 10_000, true);

        let verdict = t.can_accept_bets_at(T0 + 25_000);

        assert!(!verdict.accepting);
        assert!(verdict.reason.contains("Producer 1 is down"));

        let verdict = t.can_accept_bets_at(T0 + 15_000);
        assert!(verdict.accepting);
        assert_eq!(verdict.reason, "All producers are healthy");
    }

    #[test]
    fn test_gate_open_with_nothing_tracked() {
        let t = tracker(Vec::new(), Arc::new(RecentAlerts::new(4)));

        let verdict = t.can_accept_bets_at(T0 + 60_000);

        assert!(verdict.accepting);
        assert_eq!(verdict.reason, "All producers are healthy");
    }

    #[test]
    fn test_gate_closed_when_expected_producer_never_reports() {
        let t = tracker(vec![3], Arc::new(RecentAlerts::new(4)));

        // warm-up still running
        assert!(t.can_accept_bets_at(T0 + 29_000).accepting);

        let verdict = t.can_accept_bets_at(T0 + 31_000);
        assert!(!verdict.accepting);
        assert_eq!(verdict.reason, "Producer 3 is down (never reported)");
    }

    #[test]
    fn test_expected_producer_down_after_warmup() {
        let log = Arc::new(RecentAlerts::new(4));
        let t = tracker(vec![1, 3], log.clone());
        t.record_alive(1, T0 + 1_000, true);

        assert!(t.can_accept_bets_at(T0 + 10_000).accepting);
        assert!(t.check_at(T0 + 10_000).is_empty());

        t.record_alive(1, T0 + 30_000, true);
        let verdict = t.can_accept_bets_at(T0 + 31_000);
        assert!(!verdict.accepting);
        assert!(verdict.reason.contains("Producer 3"));
        assert_eq!(
            t.check_at(T0 + 31_000),
            vec![Alert::ProducerDown {
                producer_id: 3,
                silent_for_ms: None
            }]
        );
    }

    #[test]
    fn test_unsubscribed_signals_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = tracker(Vec::new(), Arc::new(RecentAlerts::new(4))).with_resubscribe(tx);

        t.record_alive(1, T0, true);
        t.record_alive(1, T0 + 10_000, false);
        t.record_alive(1, T0 + 20_000, false);
        t.record_alive(1, T0 + 30_000, true);
        t.record_alive(1, T0 + 40_000, false);

        assert_eq!(rx.try_recv().ok(), Some(1));
        assert_eq!(rx.try_recv().ok(), Some(1));
        assert!(rx.try_recv().is_err());
    }
}
