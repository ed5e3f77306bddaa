//! # Oddsfeed: Vendor Sports-Odds Feed Session and Recovery
//!
//! Oddsfeed keeps a bookmaker connected to a vendor's AMQP odds feed and
//! keeps the data it receives trustworthy.
//!
//! ## Features
//!
//! - **Feed connector**: identity lookup, TLS AMQP session with an exclusive queue, automatic reconnect with exponential backoff
//! - **Classification and routing**: cheap kind detection from routing key or root tag, kind-keyed handler registry
//! - **Producer health**: per-producer heartbeat tracking, one alert per health transition, bet-acceptance gate
//! - **Recovery coordination**: full, per-product and per-event recovery with rate-limit aware retries and `snapshot_complete` correlation
//! - **Ambient plumbing**: YAML + env configuration, Postgres audit log (feature: `postgres`), NATS JetStream forwarding, status HTTP API
//!
//! ## Example: configuration file
//!
//! ```yaml
//! access_token: "<token>"
//! messaging_host: stgmq.betradar.com:5671
//! routing_keys: ["#"]
//! health:
//!   down_threshold: 20
//!   check_interval: 5
//! recovery:
//!   after_hours: 10
//!   products:
//!     - name: liveodds
//!       producer_id: 1
//!       omit_after: true
//!     - name: pre
//!       producer_id: 3
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod alerts;

// Feed session
pub mod connector;
pub mod envelope;
pub mod health;
pub mod recovery;
pub mod supervisor;

// Vendor HTTP API
pub mod vendor;

// Status HTTP API
pub mod api;

// Diesel ORM runtime infrastructure
#[cfg(feature = "postgres")]
pub mod diesel_runtime;

// NATS JetStream integration
pub mod nats;

// Re-export key types
pub use config::FeedConfig;
pub use error::{ApiError, ConfigError, FeedError, RecoveryError, StoreError};
pub use alerts::{Alert, AlertSink};

pub use connector::{AmqpTransport, BookmakerIdentity, FeedConnector, FeedSession, SessionState};
pub use envelope::{classify, Dispatcher, HandlerRegistry, MessageEnvelope, MessageHandler, MessageKind, RawDelivery};
pub use health::{BetAcceptance, ProducerHealthTracker, ProducerStatus};
pub use recovery::{RecoveryCoordinator, RecoveryOutcome, RecoveryRequest, TriggerOutcome};
pub use supervisor::{FeedSessionSupervisor, SupervisorParts};
pub use vendor::VendorApiClient;

// Re-export diesel_runtime types
#[cfg(feature = "postgres")]
pub use diesel_runtime::{Database, DatabaseConfig};

// Re-export nats types
pub use nats::{ForwardingHandler, NatsForwarder};
