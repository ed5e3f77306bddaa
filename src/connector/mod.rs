//! Broker connectivity for the vendor feed.

pub mod amqp;
pub mod backoff;
pub mod feed;
pub mod session;
pub mod transport;

pub use amqp::AmqpTransport;
pub use backoff::Backoff;
pub use feed::{ConnectorEvent, FeedConnector};
pub use session::{FeedSession, SessionState};
pub use transport::{
    BookmakerIdentity, BrokerSession, BrokerTransport, CloseReason, ConnectionTarget,
    IdentityResolver,
};
