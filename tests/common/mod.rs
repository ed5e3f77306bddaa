//! Scripted stand-ins for the broker, the identity endpoint and the recovery API.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use oddsfeed::config::HealthConfig;
use oddsfeed::connector::{
    BookmakerIdentity, BrokerSession, BrokerTransport, CloseReason, ConnectionTarget,
    IdentityResolver,
};
use oddsfeed::envelope::RawDelivery;
use oddsfeed::error::{ApiError, FeedError};
use oddsfeed::recovery::{ApiReply, RecoveryApi, RecoveryCall};

/// Handle on a session the mock transport opened.
#[derive(Clone)]
pub struct SessionControl {
    deliveries: mpsc::Sender<RawDelivery>,
    close: mpsc::Sender<CloseReason>,
    closed: Arc<AtomicBool>,
    pub target: ConnectionTarget,
}

impl SessionControl {
    pub async fn deliver(&self, routing_key: &str, body: &str) {
        self.deliveries
            .send(RawDelivery::new(routing_key, body))
            .await
            .expect("session consumer gone");
    }

    /// Simulate a transport fault.
    pub async fn fail(&self, reason: &str) {
        let _ = self.close.send(CloseReason::Error(reason.to_string())).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockSession {
    queue: String,
    deliveries: Option<mpsc::Receiver<RawDelivery>>,
    close_rx: mpsc::Receiver<CloseReason>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerSession for MockSession {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn take_deliveries(&mut self) -> Option<mpsc::Receiver<RawDelivery>> {
        self.deliveries.take()
    }

    async fn closed(&mut self) -> CloseReason {
        match self.close_rx.recv().await {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One scripted outcome of [`MockTransport::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Open,
    Fail,
    /// Never completes, like a broker that accepts TCP but never answers.
    Hang,
}

/// Opens sessions according to a script; an exhausted script always succeeds.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Step>>,
    opens: Mutex<Vec<Instant>>,
    sessions: Mutex<Vec<SessionControl>>,
}

impl MockTransport {
    /// `true` = open succeeds, `false` = transport error.
    pub fn new(script: &[bool]) -> Arc<Self> {
        let steps: Vec<Step> = script
            .iter()
            .map(|ok| if *ok { Step::Open } else { Step::Fail })
            .collect();
        Self::scripted(&steps)
    }

    pub fn scripted(script: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            ..Default::default()
        })
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }

    pub fn session(&self, index: usize) -> SessionControl {
        self.sessions.lock()[index].clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn open(
        &self,
        target: &ConnectionTarget,
        _routing_keys: &[String],
    ) -> Result<Box<dyn BrokerSession>, FeedError> {
        self.opens.lock().push(Instant::now());
        let step = self.script.lock().pop_front().unwrap_or(Step::Open);
        match step {
            Step::Open => {}
            Step::Fail => return Err(FeedError::Transport("connection refused".to_string())),
            Step::Hang => std::future::pending::<()>().await,
        }

        let (tx, rx) = mpsc::channel(64);
        let (close_tx, close_rx) = mpsc::channel(4);
        let closed = Arc::new(AtomicBool::new(false));
        let mut sessions = self.sessions.lock();
        let queue = format!("amq.gen-{}", sessions.len());
        sessions.push(SessionControl {
            deliveries: tx,
            close: close_tx,
            closed: closed.clone(),
            target: target.clone(),
        });

        Ok(Box::new(MockSession {
            queue,
            deliveries: Some(rx),
            close_rx,
            closed,
        }))
    }
}

/// Identity endpoint returning a fixed bookmaker, or failing.
pub struct StaticIdentity {
    fail: bool,
    calls: AtomicUsize,
}

impl StaticIdentity {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn whoami(&self) -> Result<BookmakerIdentity, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FeedError::Identity("401 Unauthorized".to_string()));
        }
        Ok(BookmakerIdentity {
            bookmaker_id: "12345".to_string(),
            virtual_host: "/unifiedfeed/12345".to_string(),
        })
    }
}

/// Recovery API replying from a script of statuses (202 once exhausted).
#[derive(Default)]
pub struct ScriptedRecoveryApi {
    replies: Mutex<VecDeque<(u16, String)>>,
    calls: Mutex<Vec<(Instant, RecoveryCall)>>,
}

impl ScriptedRecoveryApi {
    pub fn new(replies: &[(u16, &str)]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .iter()
                    .map(|(status, body)| (*status, body.to_string()))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecoveryCall> {
        self.calls.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl RecoveryApi for ScriptedRecoveryApi {
    async fn initiate(&self, call: &RecoveryCall) -> Result<ApiReply, ApiError> {
        self.calls.lock().push((Instant::now(), call.clone()));
        let (status, body) = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or((202, String::new()));
        Ok(ApiReply { status, body })
    }
}

pub fn health_config() -> HealthConfig {
    HealthConfig::default()
}

pub fn alive(producer_id: u32, timestamp: i64, subscribed: bool) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><alive product="{}" timestamp="{}" subscribed="{}"/>"#,
        producer_id,
        timestamp,
        if subscribed { 1 } else { 0 }
    )
}

pub fn snapshot_complete(producer_id: u32, request_id: u64) -> String {
    format!(
        r#"<snapshot_complete product="{}" request_id="{}" timestamp="1"/>"#,
        producer_id, request_id
    )
}
