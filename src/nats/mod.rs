/// NATS JetStream integration module
///
/// Optional downstream sink for classified feed envelopes

pub mod client;

pub use client::{ForwardedEnvelope, ForwardingHandler, NatsForwarder};
