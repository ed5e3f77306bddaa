//! AMQP transport over lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::transport::{BrokerSession, BrokerTransport, CloseReason, ConnectionTarget};
use crate::config::{FEED_EXCHANGE, PREFETCH_COUNT};
use crate::envelope::RawDelivery;
use crate::error::FeedError;

const DEFAULT_PORT: u16 = 5671;

/// Deliveries buffered between the broker consumer and the dispatch task.
const DELIVERY_BUFFER: usize = PREFETCH_COUNT as usize * 10;

/// Production transport: TLS AMQP, token as username with an empty password.
#[derive(Debug, Default, Clone)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

/// `amqps://<token>:@<host>:<port>/<vhost>?heartbeat=<secs>`
pub fn connection_uri(target: &ConnectionTarget) -> AMQPUri {
    let (host, port) = match target.host.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(DEFAULT_PORT)),
        None => (target.host.clone(), DEFAULT_PORT),
    };

    AMQPUri {
        scheme: AMQPScheme::AMQPS,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: target.access_token.clone(),
                password: String::new(),
            },
            host,
            port,
        },
        vhost: target.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(target.heartbeat_secs),
            ..Default::default()
        },
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn open(
        &self,
        target: &ConnectionTarget,
        routing_keys: &[String],
    ) -> Result<Box<dyn BrokerSession>, FeedError> {
        let connection =
            Connection::connect_uri(connection_uri(target), ConnectionProperties::default())
                .await?;
        tracing::info!(host = %target.host, vhost = %target.virtual_host, "AMQP connection open");

        let (close_tx, close_rx) = mpsc::channel::<CloseReason>(4);
        let on_error = close_tx.clone();
        connection.on_error(move |err| {
            let _ = on_error.try_send(CloseReason::Error(err.to_string()));
        });

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        // server-named, exclusive, auto-delete: vanishes with the connection
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let queue_name = queue.name().as_str().to_string();

        for key in routing_keys {
            channel
                .queue_bind(
                    &queue_name,
                    FEED_EXCHANGE,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            tracing::info!(queue = %queue_name, routing_key = %key, "queue bound");
        }

        let mut consumer = channel
            .basic_consume(
                &queue_name,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let pump = tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let raw = RawDelivery::new(delivery.routing_key.as_str(), delivery.data);
                        if tx.send(raw).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = close_tx.try_send(CloseReason::Error(e.to_string()));
                        return;
                    }
                }
            }
            let _ = close_tx.try_send(CloseReason::Error("consumer cancelled".to_string()));
        });

        Ok(Box::new(AmqpSession {
            connection: Some(connection),
            channel: Some(channel),
            queue_name,
            deliveries: Some(rx),
            close_rx,
            pump,
        }))
    }
}

struct AmqpSession {
    connection: Option<Connection>,
    channel: Option<Channel>,
    queue_name: String,
    deliveries: Option<mpsc::Receiver<RawDelivery>>,
    close_rx: mpsc::Receiver<CloseReason>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn take_deliveries(&mut self) -> Option<mpsc::Receiver<RawDelivery>> {
        self.deliveries.take()
    }

    async fn closed(&mut self) -> CloseReason {
        match self.close_rx.recv().await {
            Some(reason) => reason,
            None => CloseReason::Error("connection dropped".to_string()),
        }
    }

    async fn close(&mut self) {
        self.pump.abort();
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close(200, "closing").await {
                tracing::debug!(error = %e, "channel close");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "closing").await {
                tracing::debug!(error = %e, "connection close");
            }
            tracing::info!(queue = %self.queue_name, "AMQP connection closed");
        }
    }
}
