//! Producer liveness.

pub mod tracker;

pub use tracker::{
    now_millis, BetAcceptance, ProducerHealthTracker, ProducerReport, ProducerStatus, Verdict,
};
