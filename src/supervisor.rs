//! Top-level lifecycle of the feed session.
//!
//! Startup: resolve the bookmaker identity, connect, start consuming, start
//! the producer health timer and, after a settle delay, request a full
//! recovery. Every reconnect abandons the old session's outstanding
//! recoveries and requests a fresh full recovery. Shutdown runs in reverse.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::{Alert, AlertSink};
use crate::config::FeedConfig;
use crate::connector::{
    BookmakerIdentity, BrokerTransport, ConnectorEvent, FeedConnector, IdentityResolver,
};
use crate::envelope::{Dispatcher, HandlerRegistry, MessageHandler, MessageKind, MessageStats};
use crate::error::FeedError;
use crate::health::ProducerHealthTracker;
use crate::recovery::{RecoveryApi, RecoveryCoordinator, RecoveryStore};

const STATS_PERIOD: Duration = Duration::from_secs(60);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Collaborators the supervisor wires together.
pub struct SupervisorParts {
    pub identity: Arc<dyn IdentityResolver>,
    pub transport: Arc<dyn BrokerTransport>,
    pub recovery_api: Arc<dyn RecoveryApi>,
    pub store: Arc<dyn RecoveryStore>,
    pub alerts: Arc<dyn AlertSink>,
}

struct Running {
    connector: Arc<FeedConnector>,
    monitor: Option<JoinHandle<Result<(), FeedError>>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the connector, tracker and coordinator for one feed.
pub struct FeedSessionSupervisor {
    config: FeedConfig,
    identity: Arc<dyn IdentityResolver>,
    transport: Arc<dyn BrokerTransport>,
    alerts: Arc<dyn AlertSink>,
    tracker: Arc<ProducerHealthTracker>,
    coordinator: Arc<RecoveryCoordinator>,
    stats: Arc<MessageStats>,
    handlers: Option<HandlerRegistry>,
    resubscribe: Option<mpsc::UnboundedReceiver<u32>>,
    cancel: CancellationToken,
    running: Option<Running>,
}

impl FeedSessionSupervisor {
    pub fn new(config: FeedConfig, parts: SupervisorParts) -> Self {
        let (resubscribe_tx, resubscribe_rx) = mpsc::unbounded_channel();
        let tracker = ProducerHealthTracker::new(
            &config.health,
            config.expected_producers(),
            Arc::clone(&parts.alerts),
        )
        .with_resubscribe(resubscribe_tx);
        let coordinator =
            RecoveryCoordinator::new(parts.recovery_api, parts.store, config.recovery.clone());

        Self {
            identity: parts.identity,
            transport: parts.transport,
            alerts: parts.alerts,
            tracker: Arc::new(tracker),
            coordinator,
            stats: Arc::new(MessageStats::new()),
            handlers: Some(HandlerRegistry::new()),
            resubscribe: Some(resubscribe_rx),
            cancel: CancellationToken::new(),
            running: None,
            config,
        }
    }

    /// Register a business handler. Only effective before [`start`](Self::start).
    pub fn register_handler(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        match self.handlers.as_mut() {
            Some(registry) => registry.register(kind, handler),
            None => tracing::warn!(%kind, "handler registered after start; ignored"),
        }
    }

    /// Register a handler for every kind. Only effective before [`start`](Self::start).
    pub fn register_all(&mut self, handler: Arc<dyn MessageHandler>) {
        match self.handlers.as_mut() {
            Some(registry) => registry.register_all(handler),
            None => tracing::warn!("catch-all handler registered after start; ignored"),
        }
    }

    pub fn tracker(&self) -> Arc<ProducerHealthTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn coordinator(&self) -> Arc<RecoveryCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn stats(&self) -> Arc<MessageStats> {
        Arc::clone(&self.stats)
    }

    pub fn connector(&self) -> Option<Arc<FeedConnector>> {
        self.running.as_ref().map(|r| Arc::clone(&r.connector))
    }

    /// Bring the feed up.
    ///
    /// # Returns
    ///
    /// The resolved bookmaker identity
    ///
    /// # Errors
    ///
    /// Identity failures and initial connect failures are fatal
    pub async fn start(&mut self) -> Result<BookmakerIdentity, FeedError> {
        if self.running.is_some() {
            return Err(FeedError::Transport("supervisor already started".to_string()));
        }

        let identity = match self.identity.whoami().await {
            Ok(identity) => identity,
            Err(e) => {
                self.alerts.notify(&Alert::FeedFatal {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        tracing::info!(
            bookmaker_id = %identity.bookmaker_id,
            vhost = %identity.virtual_host,
            "bookmaker identity resolved"
        );

        let (connector, events) = FeedConnector::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.identity),
            self.config.messaging_host.clone(),
            self.config.access_token.clone(),
            self.config.routing_keys.clone(),
            self.config.connector.clone(),
        );
        connector.prime_identity(identity.clone());

        let session = match connector.connect_initial().await {
            Ok(session) => session,
            Err(e) => {
                self.alerts.notify(&Alert::FeedFatal {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let registry = self.handlers.take().unwrap_or_default();
        let dispatcher = Dispatcher::new(registry, Arc::clone(&self.tracker))
            .with_completions(self.coordinator.clone())
            .with_stats(Arc::clone(&self.stats));
        let monitor = Arc::clone(&connector).run(session, Arc::new(dispatcher));

        let mut tasks = vec![
            Arc::clone(&self.tracker)
                .spawn_monitor(self.config.health.check_interval, self.cancel.child_token()),
            Arc::clone(&self.stats).spawn_reporter(STATS_PERIOD, self.cancel.child_token()),
        ];

        if self.config.recovery.auto_recovery {
            tasks.push(spawn_full_recovery(
                Arc::clone(&self.coordinator),
                self.config.recovery.settle_delay,
                self.cancel.child_token(),
            ));
        }

        tasks.push(tokio::spawn(supervise(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.alerts),
            self.config.recovery.auto_recovery,
            self.config.recovery.settle_delay,
            events,
            self.resubscribe.take(),
            self.cancel.child_token(),
        )));

        self.alerts.notify(&Alert::ServiceStarted {
            bookmaker_id: identity.bookmaker_id.clone(),
            products: self
                .config
                .recovery
                .products
                .iter()
                .map(|p| p.name.clone())
                .collect(),
        });

        self.running = Some(Running {
            connector,
            monitor: Some(monitor),
            tasks,
        });
        Ok(identity)
    }

    /// Resolves when the connector exits: after [`stop`](Self::stop) or on a
    /// fatal reconnect failure. Cancel-safe.
    pub async fn wait(&mut self) -> Result<(), FeedError> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        let Some(monitor) = running.monitor.as_mut() else {
            return Ok(());
        };
        let result = monitor.await;
        running.monitor = None;
        match result {
            Ok(outcome) => outcome,
            Err(e) => Err(FeedError::Transport(format!("connector task failed: {}", e))),
        }
    }

    /// Stop consuming, stop the health timer, cancel recovery retries and
    /// close the broker session, in that order. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        tracing::info!("stopping feed session");

        running.connector.stop_consuming();
        self.cancel.cancel();
        self.coordinator.shutdown();
        running.connector.stop();

        if let Some(monitor) = running.monitor.take() {
            match tokio::time::timeout(STOP_GRACE, monitor).await {
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "connector ended with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "connector task failed"),
                Err(_) => tracing::warn!("connector did not stop within grace period"),
                Ok(Ok(Ok(()))) => {}
            }
        }
        for task in running.tasks {
            task.abort();
        }
        tracing::info!("feed session stopped");
    }
}

/// Request a full recovery once the settle delay has passed.
fn spawn_full_recovery(
    coordinator: Arc<RecoveryCoordinator>,
    settle: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(settle) => {}
        }
        if let Err(e) = coordinator.trigger_full_recovery().await {
            tracing::error!(error = %e, "full recovery failed");
        }
    })
}

/// React to connector events and unsubscribed producers.
async fn supervise(
    coordinator: Arc<RecoveryCoordinator>,
    alerts: Arc<dyn AlertSink>,
    auto_recovery: bool,
    settle: Duration,
    mut events: mpsc::UnboundedReceiver<ConnectorEvent>,
    mut resubscribe: Option<mpsc::UnboundedReceiver<u32>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            Some(event) = events.recv() => match event {
                ConnectorEvent::Reconnected { attempts } => {
                    alerts.notify(&Alert::FeedReconnected { attempts });
                    coordinator.abandon_outstanding("feed session replaced").await;
                    if auto_recovery {
                        spawn_full_recovery(Arc::clone(&coordinator), settle, cancel.child_token());
                    }
                }
                ConnectorEvent::Fatal { reason } => {
                    alerts.notify(&Alert::FeedFatal { reason });
                }
            },
            Some(producer_id) = next_resubscribe(&mut resubscribe) => {
                match coordinator.config().product_for_producer(producer_id) {
                    Some(product) => {
                        let name = product.name.clone();
                        match coordinator.trigger_product_recovery(&name).await {
                            Ok(outcome) => tracing::info!(producer_id, product = %name, ?outcome, "resubscribe recovery"),
                            Err(e) => tracing::error!(producer_id, product = %name, error = %e, "resubscribe recovery failed"),
                        }
                    }
                    None => tracing::warn!(producer_id, "unsubscribed producer has no recovery product"),
                }
            }
        }
    }
}

async fn next_resubscribe(rx: &mut Option<mpsc::UnboundedReceiver<u32>>) -> Option<u32> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
