//! Record of the current broker session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Connector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

/// Snapshot of the live (or last) broker session.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSession {
    /// Changes on every successful (re)connect.
    pub session_id: Option<Uuid>,
    pub host: String,
    pub virtual_host: Option<String>,
    pub routing_keys: Vec<String>,
    pub queue_name: Option<String>,
    pub state: SessionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub reconnects: u64,
}

impl FeedSession {
    pub fn new(host: impl Into<String>, routing_keys: Vec<String>) -> Self {
        Self {
            session_id: None,
            host: host.into(),
            virtual_host: None,
            routing_keys,
            queue_name: None,
            state: SessionState::Disconnected,
            connected_at: None,
            last_activity_at: None,
            reconnects: 0,
        }
    }

    /// Enter `Connected` with a fresh session id.
    pub fn connected(&mut self, virtual_host: &str, queue_name: &str) {
        let now = Utc::now();
        self.session_id = Some(Uuid::new_v4());
        self.virtual_host = Some(virtual_host.to_string());
        self.queue_name = Some(queue_name.to_string());
        self.state = SessionState::Connected;
        self.connected_at = Some(now);
        self.last_activity_at = Some(now);
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Some(Utc::now());
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_id_per_connect() {
        let mut session = FeedSession::new("mq:5671", vec!["#".into()]);
        assert!(!session.is_connected());

        session.connected("/unifiedfeed/1", "amq.gen-1");
        let first = session.session_id;
        session.connected("/unifiedfeed/1", "amq.gen-2");

        assert!(session.is_connected());
        assert_ne!(first, session.session_id);
        assert_eq!(session.queue_name.as_deref(), Some("amq.gen-2"));
    }
}
