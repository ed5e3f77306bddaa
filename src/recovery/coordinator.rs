//! Recovery coordinator.
//!
//! Issues full, per-product and per-event recovery requests, honours the
//! vendor's rate limit with background retries and resolves requests when
//! the matching `snapshot_complete` arrives.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::api::{ApiReply, RecoveryApi, RecoveryCall, ReplyClass};
use super::request::{RecoveryOutcome, RecoveryRequest, RecoveryScope};
use super::store::RecoveryStore;
use crate::config::{ProductConfig, RecoveryConfig};
use crate::envelope::CompletionSink;
use crate::error::RecoveryError;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Result of a product recovery trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Vendor accepted; `snapshot_complete` will follow.
    Initiated { request_id: u64 },
    /// Vendor rate-limited the request; a retry runs after `retry_in`.
    RateLimited { request_id: u64, retry_in_secs: u64 },
    /// An earlier request for the product is still in flight or queued for retry.
    Suppressed { pending: Option<u64> },
}

/// Per-product results of a full recovery.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FullRecoveryReport {
    pub products: BTreeMap<String, TriggerOutcome>,
}

struct Ledger {
    next_id: u64,
    requests: BTreeMap<u64, RecoveryRequest>,
}

impl Ledger {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Product-scope request still awaiting `snapshot_complete`.
    fn outstanding(&self, product: &str) -> Option<u64> {
        self.requests
            .values()
            .rev()
            .find(|r| {
                r.product == product
                    && r.scope == RecoveryScope::Product
                    && r.outcome == RecoveryOutcome::Initiated
            })
            .map(|r| r.request_id)
    }

    /// Apply `outcome` to a request and every rate-limited ancestor.
    /// Returns the changed records.
    fn resolve_chain(
        &mut self,
        request_id: u64,
        outcome: RecoveryOutcome,
        detail: &str,
    ) -> Vec<RecoveryRequest> {
        let mut changed = Vec::new();
        let mut cursor = Some(request_id);
        while let Some(id) = cursor {
            let Some(request) = self.requests.get_mut(&id) else {
                break;
            };
            if request.transition(outcome, Some(detail.to_string())) {
                changed.push(request.clone());
            }
            cursor = request.retry_of;
        }
        changed
    }
}

/// Issues and tracks vendor recovery requests.
pub struct RecoveryCoordinator {
    api: Arc<dyn RecoveryApi>,
    store: Arc<dyn RecoveryStore>,
    config: RecoveryConfig,
    ledger: RwLock<Ledger>,
    retries: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RecoveryCoordinator {
    /// Request ids start at the current unix time so restarts don't reuse them.
    pub fn new(
        api: Arc<dyn RecoveryApi>,
        store: Arc<dyn RecoveryStore>,
        config: RecoveryConfig,
    ) -> Arc<Self> {
        let seed = Utc::now().timestamp().max(1) as u64;
        Self::with_first_request_id(api, store, config, seed)
    }

    pub fn with_first_request_id(
        api: Arc<dyn RecoveryApi>,
        store: Arc<dyn RecoveryStore>,
        config: RecoveryConfig,
        first_request_id: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            store,
            config,
            ledger: RwLock::new(Ledger {
                next_id: first_request_id,
                requests: BTreeMap::new(),
            }),
            retries: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Trigger product recovery for every configured product.
    ///
    /// Rate-limited and suppressed products are not failures; their outcome is
    /// in the report.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::Partial`] naming every product that failed outright
    pub async fn trigger_full_recovery(self: &Arc<Self>) -> Result<FullRecoveryReport, RecoveryError> {
        tracing::info!(
            products = ?self.config.products.iter().map(|p| &p.name).collect::<Vec<_>>(),
            "starting full recovery"
        );
        let mut report = FullRecoveryReport::default();
        let mut failures = Vec::new();

        for product in &self.config.products {
            match self.trigger_product_recovery(&product.name).await {
                Ok(outcome) => {
                    report.products.insert(product.name.clone(), outcome);
                }
                Err(e) => {
                    tracing::error!(product = %product.name, error = %e, "product recovery failed");
                    failures.push(format!("{}: {}", product.name, e));
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(outcomes = ?report.products, "full recovery triggered");
            Ok(report)
        } else {
            Err(RecoveryError::Partial { failures })
        }
    }

    /// Trigger recovery for one product unless one is already in flight or
    /// waiting on a rate-limit retry.
    pub async fn trigger_product_recovery(
        self: &Arc<Self>,
        product: &str,
    ) -> Result<TriggerOutcome, RecoveryError> {
        let product = self
            .config
            .product(product)
            .cloned()
            .ok_or_else(|| RecoveryError::UnknownProduct(product.to_string()))?;

        if self.retries.lock().contains_key(&product.name) {
            tracing::info!(product = %product.name, "recovery retry already scheduled; skipping");
            return Ok(TriggerOutcome::Suppressed { pending: None });
        }

        let request = {
            let mut ledger = self.ledger.write();
            if let Some(pending) = ledger.outstanding(&product.name) {
                tracing::info!(product = %product.name, pending, "recovery already in flight; skipping");
                return Ok(TriggerOutcome::Suppressed {
                    pending: Some(pending),
                });
            }
            self.register(&mut ledger, &product, RecoveryScope::Product, None)
        };

        let outcome = self.issue(request).await?;
        if let TriggerOutcome::RateLimited { request_id, .. } = outcome {
            self.schedule_retry(product, request_id);
        }
        Ok(outcome)
    }

    /// Ask the vendor to replay the odds of one event.
    pub async fn trigger_event_recovery(
        &self,
        product: &str,
        entity_id: &str,
    ) -> Result<u64, RecoveryError> {
        self.trigger_event_scoped(
            product,
            RecoveryScope::Event {
                entity_id: entity_id.to_string(),
            },
        )
        .await
    }

    /// Ask the vendor to replay settlements and cancellations of one event.
    pub async fn trigger_stateful_messages_recovery(
        &self,
        product: &str,
        entity_id: &str,
    ) -> Result<u64, RecoveryError> {
        self.trigger_event_scoped(
            product,
            RecoveryScope::StatefulMessages {
                entity_id: entity_id.to_string(),
            },
        )
        .await
    }

    async fn trigger_event_scoped(
        &self,
        product: &str,
        scope: RecoveryScope,
    ) -> Result<u64, RecoveryError> {
        let product = self
            .config
            .product(product)
            .cloned()
            .ok_or_else(|| RecoveryError::UnknownProduct(product.to_string()))?;

        let request = {
            let mut ledger = self.ledger.write();
            self.register(&mut ledger, &product, scope, None)
        };
        let request_id = request.request_id;

        match self.issue(request).await? {
            TriggerOutcome::Initiated { .. } => {
                // no snapshot_complete follows an event-scoped replay
                let changed = self.ledger.write().resolve_chain(
                    request_id,
                    RecoveryOutcome::Completed,
                    "accepted by vendor",
                );
                self.persist_all(changed).await;
                Ok(request_id)
            }
            TriggerOutcome::RateLimited { .. } => {
                let changed = self.ledger.write().resolve_chain(
                    request_id,
                    RecoveryOutcome::Failed,
                    "rate limited",
                );
                self.persist_all(changed).await;
                Err(RecoveryError::Rejected {
                    product: product.name,
                    status: 429,
                    body: "rate limited".to_string(),
                })
            }
            TriggerOutcome::Suppressed { .. } => Ok(request_id),
        }
    }

    /// Resolve a request (and any rate-limited requests it retried) as completed.
    ///
    /// # Returns
    ///
    /// `false` if the id is unknown or already terminal
    pub fn complete(&self, request_id: u64) -> bool {
        let changed = self.ledger.write().resolve_chain(
            request_id,
            RecoveryOutcome::Completed,
            "snapshot_complete received",
        );
        if changed.is_empty() {
            tracing::debug!(request_id, "snapshot_complete for unknown or finished request");
            return false;
        }
        tracing::info!(request_id, resolved = changed.len(), "recovery completed");
        self.persist_detached(changed);
        true
    }

    /// Fail every request still awaiting `snapshot_complete`; its session is gone.
    ///
    /// # Returns
    ///
    /// Number of requests abandoned
    pub async fn abandon_outstanding(&self, reason: &str) -> usize {
        let changed: Vec<RecoveryRequest> = {
            let mut ledger = self.ledger.write();
            let ids: Vec<u64> = ledger
                .requests
                .values()
                .filter(|r| r.outcome == RecoveryOutcome::Initiated)
                .map(|r| r.request_id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let request = ledger.requests.get_mut(&id)?;
                    request
                        .transition(RecoveryOutcome::Failed, Some(reason.to_string()))
                        .then(|| request.clone())
                })
                .collect()
        };
        let count = changed.len();
        if count > 0 {
            tracing::warn!(count, reason, "abandoning outstanding recovery requests");
        }
        self.persist_all(changed).await;
        count
    }

    /// Cancel pending retries. Further triggers still work but nothing is retried.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (product, handle) in self.retries.lock().drain() {
            tracing::debug!(product = %product, "cancelling recovery retry");
            handle.abort();
        }
    }

    pub fn request(&self, request_id: u64) -> Option<RecoveryRequest> {
        self.ledger.read().requests.get(&request_id).cloned()
    }

    /// All requests, oldest first.
    pub fn requests(&self) -> Vec<RecoveryRequest> {
        self.ledger.read().requests.values().cloned().collect()
    }

    /// Products with a rate-limit retry waiting to fire.
    pub fn pending_retries(&self) -> Vec<String> {
        let mut products: Vec<String> = self.retries.lock().keys().cloned().collect();
        products.sort();
        products
    }

    fn register(
        &self,
        ledger: &mut Ledger,
        product: &ProductConfig,
        scope: RecoveryScope,
        retry_of: Option<u64>,
    ) -> RecoveryRequest {
        let after = match scope {
            RecoveryScope::Product => self.after_for(product, Utc::now().timestamp_millis()),
            _ => None,
        };
        let request = RecoveryRequest::new(
            ledger.allocate(),
            &product.name,
            product.producer_id,
            scope,
            self.config.node_id,
            after,
        )
        .retrying(retry_of);
        ledger.requests.insert(request.request_id, request.clone());
        request
    }

    /// Start of the replay window, clamped to the product's ceiling.
    pub fn after_for(&self, product: &ProductConfig, now_ms: i64) -> Option<i64> {
        if product.omit_after || self.config.after_hours == 0 {
            return None;
        }
        let mut hours = self.config.after_hours;
        if hours > product.max_window_hours {
            tracing::warn!(
                product = %product.name,
                requested = hours,
                ceiling = product.max_window_hours,
                "recovery window exceeds vendor ceiling; clamping"
            );
            hours = product.max_window_hours;
        }
        Some(now_ms - i64::from(hours) * HOUR_MS)
    }

    /// Send a registered request and record the vendor's answer.
    async fn issue(&self, request: RecoveryRequest) -> Result<TriggerOutcome, RecoveryError> {
        let request_id = request.request_id;
        let call = RecoveryCall {
            product: request.product.clone(),
            scope: request.scope.clone(),
            request_id,
            node_id: request.node_id,
            after: request.after,
        };
        self.persist(&request).await;

        tracing::info!(
            product = %call.product,
            scope = call.scope.as_str(),
            request_id,
            node_id = call.node_id,
            after = ?call.after,
            retry_of = ?request.retry_of,
            "sending recovery request"
        );

        let reply = match self.api.initiate(&call).await {
            Ok(reply) => reply,
            Err(e) => {
                let changed = self.ledger.write().resolve_chain(
                    request_id,
                    RecoveryOutcome::Failed,
                    &e.to_string(),
                );
                self.persist_all(changed).await;
                return Err(RecoveryError::Api {
                    product: call.product,
                    source: e,
                });
            }
        };

        match reply.class() {
            ReplyClass::Accepted => {
                tracing::info!(
                    product = %call.product,
                    request_id,
                    status = reply.status,
                    "recovery accepted"
                );
                let updated = self.annotate(request_id, format!("accepted ({})", reply.status));
                if let Some(request) = updated {
                    self.persist(&request).await;
                }
                Ok(TriggerOutcome::Initiated { request_id })
            }
            ReplyClass::RateLimited => {
                tracing::warn!(product = %call.product, request_id, "recovery rate limited");
                let updated = {
                    let mut ledger = self.ledger.write();
                    ledger.requests.get_mut(&request_id).and_then(|r| {
                        r.transition(RecoveryOutcome::RateLimited, Some(reply.body.clone()))
                            .then(|| r.clone())
                    })
                };
                if let Some(request) = updated {
                    self.persist(&request).await;
                }
                Ok(TriggerOutcome::RateLimited {
                    request_id,
                    retry_in_secs: self.config.rate_limit_cooldown.as_secs(),
                })
            }
            ReplyClass::Rejected => {
                let ApiReply { status, body } = reply;
                tracing::error!(product = %call.product, request_id, status, body = %body, "recovery rejected");
                let changed = self.ledger.write().resolve_chain(
                    request_id,
                    RecoveryOutcome::Failed,
                    &format!("status {}", status),
                );
                self.persist_all(changed).await;
                Err(RecoveryError::Rejected {
                    product: call.product,
                    status,
                    body,
                })
            }
        }
    }

    fn annotate(&self, request_id: u64, detail: String) -> Option<RecoveryRequest> {
        let mut ledger = self.ledger.write();
        let request = ledger.requests.get_mut(&request_id)?;
        request.detail = Some(detail);
        request.updated_at = Utc::now();
        Some(request.clone())
    }

    /// Retry a rate-limited product after the cool-down, escalating the
    /// cool-down while the vendor keeps refusing.
    fn schedule_retry(self: &Arc<Self>, product: ProductConfig, rate_limited_id: u64) {
        if self.shutdown.is_cancelled() {
            return;
        }
        // held across spawn so the task can't remove its entry before it exists
        let mut retries = self.retries.lock();
        let this = Arc::clone(self);
        let name = product.name.clone();
        let handle = tokio::spawn(async move {
            let mut delay = this.config.rate_limit_cooldown;
            let mut retry_of = rate_limited_id;
            loop {
                tracing::info!(product = %product.name, retry_of, ?delay, "recovery retry scheduled");
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let request = {
                    let mut ledger = this.ledger.write();
                    this.register(&mut ledger, &product, RecoveryScope::Product, Some(retry_of))
                };
                match this.issue(request).await {
                    Ok(TriggerOutcome::RateLimited { request_id, .. }) => {
                        retry_of = request_id;
                        delay = this.config.escalated_cooldown;
                    }
                    Ok(_) => break,
                    Err(e) => {
                        tracing::error!(product = %product.name, error = %e, "recovery retry failed");
                        break;
                    }
                }
            }
            this.retries.lock().remove(&product.name);
        });
        retries.insert(name, handle);
    }

    async fn persist(&self, request: &RecoveryRequest) {
        if let Err(e) = self.store.save(request).await {
            tracing::warn!(request_id = request.request_id, error = %e, "failed to persist recovery request");
        }
    }

    async fn persist_all(&self, requests: Vec<RecoveryRequest>) {
        for request in &requests {
            self.persist(request).await;
        }
    }

    /// Persist from a synchronous context.
    fn persist_detached(&self, requests: Vec<RecoveryRequest>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime; recovery transition not persisted");
            return;
        };
        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            for request in &requests {
                if let Err(e) = store.save(request).await {
                    tracing::warn!(request_id = request.request_id, error = %e, "failed to persist recovery request");
                }
            }
        });
    }
}

impl CompletionSink for RecoveryCoordinator {
    fn snapshot_complete(&self, request_id: u64, producer_id: Option<u32>) {
        tracing::info!(request_id, producer_id = ?producer_id, "snapshot_complete received");
        self.complete(request_id);
    }
}

impl Drop for RecoveryCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
