//! Recovery coordination against a scripted vendor API.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::ScriptedRecoveryApi;
use oddsfeed::config::RecoveryConfig;
use oddsfeed::recovery::{
    MemoryRecoveryStore, RecoveryCoordinator, RecoveryOutcome, RecoveryScope, TriggerOutcome,
};

const TOO_MANY: &str = "<response><message>Too many requests</message></response>";

fn coordinator(
    api: Arc<ScriptedRecoveryApi>,
    store: Arc<MemoryRecoveryStore>,
) -> Arc<RecoveryCoordinator> {
    RecoveryCoordinator::with_first_request_id(api, store, RecoveryConfig::default(), 100)
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_escalates_then_recovers() {
    let api = ScriptedRecoveryApi::new(&[(403, TOO_MANY), (403, TOO_MANY), (202, "")]);
    let store = Arc::new(MemoryRecoveryStore::new());
    let coordinator = coordinator(api.clone(), store.clone());

    let first = coordinator.trigger_product_recovery("pre").await.unwrap();
    assert!(matches!(
        first,
        TriggerOutcome::RateLimited {
            request_id: 100,
            retry_in_secs: 900
        }
    ));
    assert_eq!(coordinator.pending_retries(), vec!["pre".to_string()]);

    // at most one retry per product
    let duplicate = coordinator.trigger_product_recovery("pre").await.unwrap();
    assert!(matches!(duplicate, TriggerOutcome::Suppressed { .. }));

    tokio::time::sleep(Duration::from_secs(901)).await;
    assert_eq!(api.calls().len(), 2);
    tokio::time::sleep(Duration::from_secs(1801)).await;
    assert_eq!(api.calls().len(), 3);

    let times = api.call_times();
    let first_wait = times[1] - times[0];
    let second_wait = times[2] - times[1];
    assert!(first_wait >= Duration::from_secs(900) && first_wait < Duration::from_secs(901));
    assert!(second_wait >= first_wait * 2 && second_wait < first_wait * 2 + Duration::from_secs(1));

    let calls = api.calls();
    assert_eq!(
        calls.iter().map(|c| c.request_id).collect::<Vec<_>>(),
        vec![100, 101, 102]
    );
    assert!(coordinator.pending_retries().is_empty());

    let last = coordinator.request(102).unwrap();
    assert_eq!(last.outcome, RecoveryOutcome::Initiated);
    assert_eq!(last.retry_of, Some(101));
    assert_eq!(coordinator.request(101).unwrap().retry_of, Some(100));

    // the final snapshot_complete settles the whole retry chain
    assert!(coordinator.complete(102));
    for id in [100, 101, 102] {
        assert_eq!(
            coordinator.request(id).unwrap().outcome,
            RecoveryOutcome::Completed
        );
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        store.latest(100).map(|r| r.outcome),
        Some(RecoveryOutcome::Completed)
    );
}

#[tokio::test]
async fn test_full_recovery_uses_product_specific_after() {
    let api = ScriptedRecoveryApi::new(&[]);
    let coordinator = coordinator(api.clone(), Arc::new(MemoryRecoveryStore::new()));

    let report = coordinator.trigger_full_recovery().await.unwrap();

    assert_eq!(report.products.len(), 2);
    let calls = api.calls();
    let live = calls.iter().find(|c| c.product == "liveodds").unwrap();
    let pre = calls.iter().find(|c| c.product == "pre").unwrap();
    assert_eq!(live.after, None);
    assert!(pre.after.is_some());
    assert_eq!(pre.scope, RecoveryScope::Product);
    assert!(pre.query().iter().any(|(k, _)| *k == "after"));
    assert!(!live.query().iter().any(|(k, _)| *k == "after"));
}

#[tokio::test]
async fn test_request_ids_never_repeat() {
    let api = ScriptedRecoveryApi::new(&[]);
    let coordinator = RecoveryCoordinator::new(
        api.clone(),
        Arc::new(MemoryRecoveryStore::new()),
        RecoveryConfig::default(),
    );

    for round in 0..5 {
        coordinator.trigger_full_recovery().await.unwrap();
        coordinator
            .trigger_event_recovery("liveodds", &format!("sr:match:{}", round))
            .await
            .unwrap();
        coordinator.abandon_outstanding("test round").await;
    }

    let ids: Vec<u64> = api.calls().iter().map(|c| c.request_id).collect();
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 15);
    assert_eq!(unique.len(), ids.len());
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_event_and_stateful_recovery_paths() {
    let api = ScriptedRecoveryApi::new(&[]);
    let coordinator = coordinator(api.clone(), Arc::new(MemoryRecoveryStore::new()));

    let odds = coordinator
        .trigger_event_recovery("pre", "sr:match:42")
        .await
        .unwrap();
    let stateful = coordinator
        .trigger_stateful_messages_recovery("pre", "sr:match:42")
        .await
        .unwrap();

    let calls = api.calls();
    assert_eq!(calls[0].path(), "/pre/odds/events/sr:match:42/initiate_request");
    assert_eq!(
        calls[1].path(),
        "/pre/stateful_messages/events/sr:match:42/initiate_request"
    );
    assert_eq!(calls[0].after, None);
    assert_eq!(
        coordinator.request(odds).unwrap().outcome,
        RecoveryOutcome::Completed
    );
    assert_eq!(
        coordinator.request(stateful).unwrap().outcome,
        RecoveryOutcome::Completed
    );
}

#[tokio::test]
async fn test_any_success_status_initiates() {
    let api = ScriptedRecoveryApi::new(&[(204, ""), (200, "<response/>")]);
    let coordinator = coordinator(api.clone(), Arc::new(MemoryRecoveryStore::new()));

    let pre = coordinator.trigger_product_recovery("pre").await.unwrap();
    let live = coordinator.trigger_product_recovery("liveodds").await.unwrap();

    assert!(matches!(pre, TriggerOutcome::Initiated { request_id: 100 }));
    assert!(matches!(live, TriggerOutcome::Initiated { request_id: 101 }));
    assert_eq!(
        coordinator.request(100).unwrap().outcome,
        RecoveryOutcome::Initiated
    );
    assert!(coordinator.pending_retries().is_empty());
}
