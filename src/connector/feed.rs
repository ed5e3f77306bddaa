//! Broker session ownership and automatic reconnection.
//!
//! [`FeedConnector::connect_initial`] opens the first session, each attempt
//! bounded by the connect timeout; identity failures there are fatal.
//! [`FeedConnector::run`] then consumes and monitors the session, tearing it
//! down and reconnecting with exponential backoff whenever the transport
//! fails, until stopped or the retry ceiling is reached.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::session::{FeedSession, SessionState};
use super::transport::{
    BookmakerIdentity, BrokerSession, BrokerTransport, CloseReason, ConnectionTarget,
    IdentityResolver,
};
use crate::config::ConnectorConfig;
use crate::envelope::{classify, Dispatcher};
use crate::error::FeedError;

/// Lifecycle notifications for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// A new session replaced a lost one after `attempts` tries.
    Reconnected { attempts: u32 },
    /// Reconnection gave up; the connector is done.
    Fatal { reason: String },
}

/// Owns the broker session and keeps it alive.
pub struct FeedConnector {
    transport: Arc<dyn BrokerTransport>,
    identity: Arc<dyn IdentityResolver>,
    cached_identity: Mutex<Option<BookmakerIdentity>>,
    access_token: String,
    routing_keys: Vec<String>,
    config: ConnectorConfig,
    session: Arc<RwLock<FeedSession>>,
    consume_task: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    events: mpsc::UnboundedSender<ConnectorEvent>,
}

impl FeedConnector {
    /// # Arguments
    ///
    /// * `transport` - Opens broker sessions
    /// * `identity` - Resolves the virtual host on every connect
    /// * `host` - Broker `host:port`
    /// * `access_token` - Broker login
    /// * `routing_keys` - Patterns bound to the session queue
    /// * `config` - Timeout and backoff settings
    ///
    /// # Returns
    ///
    /// The connector and the receiver of its lifecycle events
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        identity: Arc<dyn IdentityResolver>,
        host: impl Into<String>,
        access_token: impl Into<String>,
        routing_keys: Vec<String>,
        config: ConnectorConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            transport,
            identity,
            cached_identity: Mutex::new(None),
            access_token: access_token.into(),
            session: Arc::new(RwLock::new(FeedSession::new(host, routing_keys.clone()))),
            routing_keys,
            config,
            consume_task: Mutex::new(None),
            stop: CancellationToken::new(),
            events,
        });
        (connector, rx)
    }

    /// Use an identity already resolved by the caller for the first connect.
    pub fn prime_identity(&self, identity: BookmakerIdentity) {
        *self.cached_identity.lock() = Some(identity);
    }

    pub fn session(&self) -> FeedSession {
        self.session.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_connected()
    }

    /// Open the first session, retrying transport faults with backoff.
    ///
    /// # Errors
    ///
    /// * [`FeedError::Identity`] - never retried
    /// * [`FeedError::RetriesExhausted`] - retry ceiling reached
    /// * [`FeedError::Stopped`] - stopped while waiting
    pub async fn connect_initial(&self) -> Result<Box<dyn BrokerSession>, FeedError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            let attempt = tokio::time::timeout(self.config.connect_timeout, self.open_session())
                .await
                .unwrap_or_else(|_| Err(FeedError::Timeout(self.config.connect_timeout)));
            match attempt {
                Ok(session) => return Ok(session),
                Err(e) if e.is_identity() => {
                    self.set_state(SessionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    let Some(delay) = backoff.next_delay() else {
                        self.set_state(SessionState::Disconnected);
                        return Err(FeedError::RetriesExhausted {
                            attempts: backoff.attempts(),
                            last_error: e.to_string(),
                        });
                    };
                    tracing::warn!(error = %e, ?delay, attempt = backoff.attempts(), "initial connect failed; retrying");
                    tokio::select! {
                        _ = self.stop.cancelled() => return Err(FeedError::Stopped),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connect attempt. Only the first connect adds `connect_timeout`;
    /// reconnects rely on the transport's own timeouts.
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, FeedError> {
        self.set_state(SessionState::Connecting);

        let cached = self.cached_identity.lock().take();
        let identity = match cached {
            Some(identity) => identity,
            None => self.identity.whoami().await?,
        };
        let target = ConnectionTarget {
            host: self.session.read().host.clone(),
            virtual_host: identity.virtual_host.clone(),
            access_token: self.access_token.clone(),
            heartbeat_secs: self.config.heartbeat_secs,
        };

        let opened = self.transport.open(&target, &self.routing_keys).await?;

        self.session
            .write()
            .connected(&target.virtual_host, opened.queue_name());
        tracing::info!(
            bookmaker_id = %identity.bookmaker_id,
            vhost = %target.virtual_host,
            queue = %opened.queue_name(),
            "feed session connected"
        );
        Ok(opened)
    }

    /// Consume `session` and keep the connector alive until stopped.
    ///
    /// Deliveries are classified and dispatched in arrival order on a single
    /// task per session.
    pub fn run(
        self: Arc<Self>,
        session: Box<dyn BrokerSession>,
        dispatcher: Arc<Dispatcher>,
    ) -> JoinHandle<Result<(), FeedError>> {
        tokio::spawn(async move { self.monitor(session, dispatcher).await })
    }

    async fn monitor(
        self: Arc<Self>,
        mut session: Box<dyn BrokerSession>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<(), FeedError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            self.start_consuming(session.as_mut(), Arc::clone(&dispatcher));

            let reason = tokio::select! {
                _ = self.stop.cancelled() => None,
                reason = session.closed() => Some(reason),
            };

            let cause = match reason {
                None | Some(CloseReason::Graceful) => {
                    self.teardown(session.as_mut()).await;
                    self.set_state(SessionState::Disconnected);
                    tracing::info!("feed connector stopped");
                    return Ok(());
                }
                Some(CloseReason::Error(cause)) => cause,
            };

            tracing::warn!(error = %cause, "feed connection lost");
            self.set_state(SessionState::Disconnected);
            self.teardown(session.as_mut()).await;

            match self.reconnect(&mut backoff, cause).await {
                Ok((next, attempts)) => {
                    session = next;
                    self.session.write().reconnects += 1;
                    let _ = self.events.send(ConnectorEvent::Reconnected { attempts });
                }
                Err(FeedError::Stopped) => {
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "feed connector giving up");
                    self.set_state(SessionState::Disconnected);
                    let _ = self.events.send(ConnectorEvent::Fatal {
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
    }

    async fn reconnect(
        &self,
        backoff: &mut Backoff,
        mut last_error: String,
    ) -> Result<(Box<dyn BrokerSession>, u32), FeedError> {
        loop {
            let Some(delay) = backoff.next_delay() else {
                return Err(FeedError::RetriesExhausted {
                    attempts: backoff.attempts(),
                    last_error,
                });
            };
            tracing::info!(attempt = backoff.attempts(), ?delay, "reconnecting");
            tokio::select! {
                _ = self.stop.cancelled() => return Err(FeedError::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }

            // identity failures now count as transient
            let attempt = tokio::select! {
                _ = self.stop.cancelled() => return Err(FeedError::Stopped),
                attempt = self.open_session() => attempt,
            };
            match attempt {
                Ok(session) => {
                    let attempts = backoff.attempts();
                    backoff.reset();
                    tracing::info!(attempts, "feed connection re-established");
                    return Ok((session, attempts));
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = backoff.attempts(), "reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }
    }

    fn start_consuming(&self, session: &mut dyn BrokerSession, dispatcher: Arc<Dispatcher>) {
        let Some(mut deliveries) = session.take_deliveries() else {
            return;
        };
        let record = Arc::clone(&self.session);
        let task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                record.write().touch();
                let envelope = classify(&delivery);
                dispatcher.dispatch(&envelope);
            }
        });
        if let Some(previous) = self.consume_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop dispatching deliveries; the session stays open.
    pub fn stop_consuming(&self) {
        if let Some(task) = self.consume_task.lock().take() {
            task.abort();
        }
    }

    async fn teardown(&self, session: &mut dyn BrokerSession) {
        self.stop_consuming();
        session.close().await;
    }

    /// Close the session and end the monitor loop. Idempotent.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            self.set_state(SessionState::Draining);
            self.stop.cancel();
        }
    }

    fn set_state(&self, state: SessionState) {
        self.session.write().state = state;
    }
}
