//! NATS JetStream forwarder for classified feed envelopes
//!
//! Envelopes are handed over through a bounded queue so the consume loop
//! never waits on NATS, then published to `<prefix>.<kind>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ForwarderConfig;
use crate::envelope::{MessageEnvelope, MessageHandler};

/// What lands on the stream.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardedEnvelope {
    /// Unique message ID for tracking
    pub message_id: Uuid,
    pub forwarded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub envelope: MessageEnvelope,
}

impl ForwardedEnvelope {
    pub fn new(envelope: MessageEnvelope) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            forwarded_at: Utc::now(),
            envelope,
        }
    }
}

/// Subject for an envelope kind.
pub fn subject_for(prefix: &str, envelope: &MessageEnvelope) -> String {
    format!("{}.{}", prefix, envelope.kind.as_str())
}

#[derive(Clone)]
pub struct NatsForwarder {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    subject_prefix: String,
}

impl NatsForwarder {
    /// Connect to NATS and make sure the stream exists
    pub async fn connect(config: &ForwarderConfig) -> Result<Self, async_nats::Error> {
        let client = async_nats::connect(&config.url).await?;
        tracing::info!("Connected to NATS at {}", config.url);

        let jetstream = jetstream::new(client.clone());

        let _stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![format!("{}.>", config.subject_prefix)],
                max_age: Duration::from_secs(24 * 60 * 60),
                max_bytes: 1024 * 1024 * 1024,
                storage: jetstream::stream::StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await?;

        tracing::info!("JetStream stream '{}' ready", config.stream_name);

        Ok(Self {
            client,
            jetstream,
            subject_prefix: config.subject_prefix.clone(),
        })
    }

    /// Publish one envelope and wait for the JetStream ack
    pub async fn publish(&self, forwarded: &ForwardedEnvelope) -> Result<(), async_nats::Error> {
        let subject = subject_for(&self.subject_prefix, &forwarded.envelope);
        let payload = serde_json::to_vec(forwarded)?;

        let ack = self.jetstream.publish(subject.clone(), payload.into()).await?;
        ack.await?;

        tracing::trace!(
            "Published message {} to JetStream subject {}",
            forwarded.message_id,
            subject
        );
        Ok(())
    }

    /// Check if the NATS connection is active
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Drain `rx` into JetStream until cancelled or every sender is gone.
    pub fn spawn(
        self,
        mut rx: mpsc::Receiver<ForwardedEnvelope>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => next,
                };
                let Some(forwarded) = next else { break };
                if let Err(e) = self.publish(&forwarded).await {
                    tracing::warn!(
                        message_id = %forwarded.message_id,
                        kind = %forwarded.envelope.kind,
                        error = %e,
                        "failed to forward envelope"
                    );
                }
            }
            tracing::info!("NATS forwarder stopped");
        })
    }
}

/// Handler that queues every envelope for the forwarder, shedding when full.
pub struct ForwardingHandler {
    tx: mpsc::Sender<ForwardedEnvelope>,
    dropped: Arc<AtomicU64>,
}

impl ForwardingHandler {
    /// Returns the handler and the receiver to pass to [`NatsForwarder::spawn`].
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ForwardedEnvelope>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MessageHandler for ForwardingHandler {
    fn handle(&self, envelope: &MessageEnvelope) {
        if self
            .tx
            .try_send(ForwardedEnvelope::new(envelope.clone()))
            .is_err()
        {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                tracing::warn!(dropped, "forward queue full; shedding envelopes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{classify, RawDelivery};

    #[test]
    fn test_subject_uses_kind() {
        let envelope = classify(&RawDelivery::new("-.-.-.alive.-.-.-.-", "<alive/>"));
        assert_eq!(subject_for("feed", &envelope), "feed.alive");
    }

    #[test]
    fn test_handler_sheds_when_full() {
        let (handler, mut rx) = ForwardingHandler::channel(1);
        let envelope = classify(&RawDelivery::new("x", "<odds_change/>"));

        handler.handle(&envelope);
        handler.handle(&envelope);

        assert_eq!(handler.dropped(), 1);
        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.envelope.kind, crate::envelope::MessageKind::OddsChange);
    }

    #[test]
    fn test_forwarded_json_is_flat() {
        let envelope = classify(&RawDelivery::new(
            "hi.-.live.bet_stop.1.sr:match.9.-",
            r#"<bet_stop product="1" timestamp="3"/>"#,
        ));
        let json = serde_json::to_value(ForwardedEnvelope::new(envelope)).unwrap();

        assert_eq!(json["kind"], "bet_stop");
        assert_eq!(json["entity_id"], "sr:match:9");
        assert!(json["message_id"].is_string());
    }
}
