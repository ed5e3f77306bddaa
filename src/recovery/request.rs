//! Recovery request records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a recovery request asks the vendor to replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RecoveryScope {
    /// Full state of a product since `after`.
    Product,
    /// Odds of a single event.
    Event { entity_id: String },
    /// Stateful messages (settlements, cancels) of a single event.
    StatefulMessages { entity_id: String },
}

impl RecoveryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryScope::Product => "product",
            RecoveryScope::Event { .. } => "event",
            RecoveryScope::StatefulMessages { .. } => "stateful_messages",
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        match self {
            RecoveryScope::Product => None,
            RecoveryScope::Event { entity_id } | RecoveryScope::StatefulMessages { entity_id } => {
                Some(entity_id)
            }
        }
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Initiated,
    RateLimited,
    Completed,
    Failed,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Initiated => "initiated",
            RecoveryOutcome::RateLimited => "rate_limited",
            RecoveryOutcome::Completed => "completed",
            RecoveryOutcome::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryOutcome::Completed | RecoveryOutcome::Failed)
    }

    /// `Initiated -> {RateLimited, Completed, Failed}`, `RateLimited -> {Completed, Failed}`.
    pub fn can_become(&self, next: RecoveryOutcome) -> bool {
        match self {
            RecoveryOutcome::Initiated => next != RecoveryOutcome::Initiated,
            RecoveryOutcome::RateLimited => next.is_terminal(),
            RecoveryOutcome::Completed | RecoveryOutcome::Failed => false,
        }
    }
}

/// One recovery call and what became of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    /// Unique per coordinator; sent to the vendor and echoed in `snapshot_complete`.
    pub request_id: u64,
    pub product: String,
    pub producer_id: u32,
    #[serde(flatten)]
    pub scope: RecoveryScope,
    pub node_id: u32,

    /// Epoch milliseconds the vendor replays from; `None` lets the vendor choose.
    pub after: Option<i64>,
    pub requested_at: DateTime<Utc>,
    pub outcome: RecoveryOutcome,
    pub detail: Option<String>,

    /// Request whose rate limit this one retries.
    pub retry_of: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryRequest {
    pub fn new(
        request_id: u64,
        product: impl Into<String>,
        producer_id: u32,
        scope: RecoveryScope,
        node_id: u32,
        after: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            product: product.into(),
            producer_id,
            scope,
            node_id,
            after,
            requested_at: now,
            outcome: RecoveryOutcome::Initiated,
            detail: None,
            retry_of: None,
            updated_at: now,
        }
    }

    pub fn retrying(mut self, retry_of: Option<u64>) -> Self {
        self.retry_of = retry_of;
        self
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// # Returns
    ///
    /// `false` (and no change) for an illegal transition
    pub fn transition(&mut self, next: RecoveryOutcome, detail: Option<String>) -> bool {
        if !self.outcome.can_become(next) {
            return false;
        }
        self.outcome = next;
        if detail.is_some() {
            self.detail = detail;
        }
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RecoveryRequest {
        RecoveryRequest::new(1, "pre", 3, RecoveryScope::Product, 1, None)
    }

    #[test]
    fn test_rate_limited_then_completed() {
        let mut r = request();

        assert!(r.transition(RecoveryOutcome::RateLimited, None));
        assert!(r.transition(RecoveryOutcome::Completed, Some("snapshot".into())));
        assert_eq!(r.detail.as_deref(), Some("snapshot"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut r = request();
        assert!(r.transition(RecoveryOutcome::Failed, None));

        assert!(!r.transition(RecoveryOutcome::Completed, None));
        assert!(!r.transition(RecoveryOutcome::RateLimited, None));
        assert_eq!(r.outcome, RecoveryOutcome::Failed);
    }

    #[test]
    fn test_rate_limited_cannot_reinitiate() {
        let mut r = request();
        r.transition(RecoveryOutcome::RateLimited, None);

        assert!(!r.transition(RecoveryOutcome::Initiated, None));
        assert!(!r.transition(RecoveryOutcome::RateLimited, None));
    }

    #[test]
    fn test_scope_serializes_flat() {
        let r = RecoveryRequest::new(
            9,
            "liveodds",
            1,
            RecoveryScope::Event {
                entity_id: "sr:match:1".into(),
            },
            1,
            None,
        );

        let json = serde_json::to_value(&r).unwrap();

        assert_eq!(json["scope"], "event");
        assert_eq!(json["entity_id"], "sr:match:1");
        assert_eq!(json["outcome"], "initiated");
    }
}
