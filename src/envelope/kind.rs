//! Closed set of feed message kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a feed message, derived from the routing key or the document root tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Alive,
    SnapshotComplete,
    OddsChange,
    BetStop,
    BetSettlement,
    RollbackBetSettlement,
    BetCancel,
    RollbackBetCancel,
    FixtureChange,
    Unknown,
}

impl MessageKind {
    /// Every kind, in counter-index order.
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Alive,
        MessageKind::SnapshotComplete,
        MessageKind::OddsChange,
        MessageKind::BetStop,
        MessageKind::BetSettlement,
        MessageKind::RollbackBetSettlement,
        MessageKind::BetCancel,
        MessageKind::RollbackBetCancel,
        MessageKind::FixtureChange,
        MessageKind::Unknown,
    ];

    /// Vendor wire name (root tag and routing-key segment).
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Alive => "alive",
            MessageKind::SnapshotComplete => "snapshot_complete",
            MessageKind::OddsChange => "odds_change",
            MessageKind::BetStop => "bet_stop",
            MessageKind::BetSettlement => "bet_settlement",
            MessageKind::RollbackBetSettlement => "rollback_bet_settlement",
            MessageKind::BetCancel => "bet_cancel",
            MessageKind::RollbackBetCancel => "rollback_bet_cancel",
            MessageKind::FixtureChange => "fixture_change",
            MessageKind::Unknown => "unknown",
        }
    }

    /// Resolve a wire name. `unknown` itself is not a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "alive" => MessageKind::Alive,
            "snapshot_complete" => MessageKind::SnapshotComplete,
            "odds_change" => MessageKind::OddsChange,
            "bet_stop" => MessageKind::BetStop,
            "bet_settlement" => MessageKind::BetSettlement,
            "rollback_bet_settlement" => MessageKind::RollbackBetSettlement,
            "bet_cancel" => MessageKind::BetCancel,
            "rollback_bet_cancel" => MessageKind::RollbackBetCancel,
            "fixture_change" => MessageKind::FixtureChange,
            _ => return None,
        };
        Some(kind)
    }

    /// Position in [`MessageKind::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Control messages are consumed by this subsystem rather than business handlers.
    pub fn is_control(&self) -> bool {
        matches!(self, MessageKind::Alive | MessageKind::SnapshotComplete)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_for_every_wire_kind() {
        for kind in MessageKind::ALL {
            if kind == MessageKind::Unknown {
                assert_eq!(MessageKind::from_name(kind.as_str()), None);
            } else {
                assert_eq!(MessageKind::from_name(kind.as_str()), Some(kind));
            }
        }
    }

    #[test]
    fn test_index_matches_all_order() {
        for (i, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
