//! Broker transport and identity seams.
//!
//! The connector only talks to these traits; [`super::amqp`] provides the
//! production transport and tests substitute scripted ones.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::envelope::RawDelivery;
use crate::error::FeedError;

/// Bookmaker account as reported by the vendor's identity endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookmakerIdentity {
    pub bookmaker_id: String,
    pub virtual_host: String,
}

/// Resolves the bookmaker identity that selects the broker virtual host.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn whoami(&self) -> Result<BookmakerIdentity, FeedError>;
}

/// Everything needed to open a broker session.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    /// `host:port`
    pub host: String,
    pub virtual_host: String,
    pub access_token: String,
    pub heartbeat_secs: u16,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request; no reconnect.
    Graceful,
    /// Transport fault; the connector reconnects.
    Error(String),
}

/// An open broker session with its exclusive queue bound.
#[async_trait]
pub trait BrokerSession: Send {
    fn queue_name(&self) -> &str;

    /// Take the delivery stream. Returns `None` after the first call.
    fn take_deliveries(&mut self) -> Option<mpsc::Receiver<RawDelivery>>;

    /// Resolves when the session ends.
    async fn closed(&mut self) -> CloseReason;

    /// Release the session. Idempotent.
    async fn close(&mut self);
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Connect, declare the exclusive queue, bind every routing key and
    /// start consuming.
    async fn open(
        &self,
        target: &ConnectionTarget,
        routing_keys: &[String],
    ) -> Result<Box<dyn BrokerSession>, FeedError>;
}
