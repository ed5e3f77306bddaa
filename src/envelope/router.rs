//! Handler registry and dispatcher for classified envelopes.
//!
//! Control messages (`alive`, `snapshot_complete`) are routed to the
//! health tracker and the recovery coordinator before any business handler
//! sees them. Handlers run inline on the consume task, so they must not
//! block; anything slow should hand off to its own task.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::classifier::MessageEnvelope;
use super::kind::MessageKind;
use crate::health::ProducerHealthTracker;

/// Business handler for one or more message kinds.
pub trait MessageHandler: Send + Sync {
    /// Handle an envelope. Must return promptly.
    fn handle(&self, envelope: &MessageEnvelope);
}

/// Closures are handlers too
impl<F> MessageHandler for F
where
    F: Fn(&MessageEnvelope) + Send + Sync,
{
    fn handle(&self, envelope: &MessageEnvelope) {
        self(envelope)
    }
}

/// Receives `snapshot_complete` correlation ids.
pub trait CompletionSink: Send + Sync {
    fn snapshot_complete(&self, request_id: u64, producer_id: Option<u32>);
}

/// Kind-keyed handler table.
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Vec<Arc<dyn MessageHandler>>>,
    catch_all: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            catch_all: Vec::new(),
        }
    }

    /// Register a handler for one kind. Several handlers per kind run in
    /// registration order.
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Register a handler that sees every envelope, `unknown` included.
    pub fn register_all(&mut self, handler: Arc<dyn MessageHandler>) {
        self.catch_all.push(handler);
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        !self.catch_all.is_empty() || self.handlers.get(&kind).is_some_and(|h| !h.is_empty())
    }

    /// Kinds with a dedicated handler.
    pub fn registered_kinds(&self) -> Vec<MessageKind> {
        let mut kinds: Vec<MessageKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    fn handlers_for(&self, kind: MessageKind) -> impl Iterator<Item = &Arc<dyn MessageHandler>> {
        self.handlers
            .get(&kind)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-kind message counters.
pub struct MessageStats {
    by_kind: [AtomicU64; MessageKind::ALL.len()],
    unhandled: AtomicU64,
    total: AtomicU64,
}

/// Point-in-time copy of [`MessageStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub unknown: u64,
    pub unhandled: u64,
    pub by_kind: BTreeMap<String, u64>,
}

impl MessageStats {
    pub fn new() -> Self {
        Self {
            by_kind: Default::default(),
            unhandled: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn record(&self, kind: MessageKind) {
        self.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, kind: MessageKind) -> u64 {
        self.by_kind[kind.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let by_kind = MessageKind::ALL
            .iter()
            .map(|k| (k.as_str().to_string(), self.count(*k)))
            .filter(|(_, n)| *n > 0)
            .collect();

        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            unknown: self.count(MessageKind::Unknown),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            by_kind,
        }
    }

    /// Log a snapshot every `period` until cancelled.
    pub fn spawn_reporter(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snap = self.snapshot();
                        tracing::info!(
                            total = snap.total,
                            unknown = snap.unknown,
                            unhandled = snap.unhandled,
                            by_kind = ?snap.by_kind,
                            "feed message stats"
                        );
                    }
                }
            }
        })
    }
}

impl Default for MessageStats {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to a dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Delivered to this many business handlers.
    Handled(usize),
    /// Consumed by the subsystem only.
    Control,
    /// Counted and dropped.
    Unhandled,
}

/// Routes envelopes to the tracker, the recovery coordinator and handlers.
pub struct Dispatcher {
    registry: HandlerRegistry,
    tracker: Arc<ProducerHealthTracker>,
    completions: Option<Arc<dyn CompletionSink>>,
    stats: Arc<MessageStats>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, tracker: Arc<ProducerHealthTracker>) -> Self {
        Self {
            registry,
            tracker,
            completions: None,
            stats: Arc::new(MessageStats::new()),
        }
    }

    pub fn with_completions(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.completions = Some(sink);
        self
    }

    pub fn with_stats(mut self, stats: Arc<MessageStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<MessageStats> {
        Arc::clone(&self.stats)
    }

    /// Route one envelope.
    ///
    /// # Arguments
    ///
    /// * `envelope` - Output of the classifier
    ///
    /// # Returns
    ///
    /// How the envelope was consumed
    pub fn dispatch(&self, envelope: &MessageEnvelope) -> Dispatched {
        self.stats.record(envelope.kind);

        match envelope.kind {
            MessageKind::Alive => match envelope.producer_id {
                Some(producer_id) => self.tracker.record_alive(
                    producer_id,
                    envelope.timestamp,
                    envelope.subscribed.unwrap_or(true),
                ),
                None => tracing::warn!(
                    routing_key = %envelope.routing_key,
                    "alive message without a product attribute"
                ),
            },
            MessageKind::SnapshotComplete => match (envelope.request_id, &self.completions) {
                (Some(request_id), Some(sink)) => {
                    sink.snapshot_complete(request_id, envelope.producer_id)
                }
                (None, _) => tracing::warn!(
                    routing_key = %envelope.routing_key,
                    "snapshot_complete without a request_id"
                ),
                _ => {}
            },
            MessageKind::Unknown => tracing::warn!(
                routing_key = %envelope.routing_key,
                bytes = envelope.payload.len(),
                "unclassified feed message"
            ),
            _ => {}
        }

        let mut delivered = 0;
        for handler in self.registry.handlers_for(envelope.kind) {
            handler.handle(envelope);
            delivered += 1;
        }

        if delivered > 0 {
            Dispatched::Handled(delivered)
        } else if envelope.kind.is_control() {
            Dispatched::Control
        } else {
            self.stats.record_unhandled();
            Dispatched::Unhandled
        }
    }
}
