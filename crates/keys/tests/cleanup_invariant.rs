//! Every operation releases its connection exactly once, whatever the outcome.

use keyledger_keys::{KeyError, KeyOrchestrator, KeyResult, Reply, Representation};
use keyledger_ledger::{
    ConnectionError, Identity, LedgerOp, MemoryLedger, RegistryKind, Resource, SessionStats,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    List,
    ListResolved,
    Create,
    CreateByTransaction,
    Get,
    GetResolved,
    Delete,
    Update,
}

const ALL_OPS: [Op; 8] = [
    Op::List,
    Op::ListResolved,
    Op::Create,
    Op::CreateByTransaction,
    Op::Get,
    Op::GetResolved,
    Op::Delete,
    Op::Update,
];

const FAULTS: [LedgerOp; 12] = [
    LedgerOp::Registry,
    LedgerOp::Exists,
    LedgerOp::Get,
    LedgerOp::Resolve,
    LedgerOp::GetAll,
    LedgerOp::ResolveAll,
    LedgerOp::Add,
    LedgerOp::Update,
    LedgerOp::Remove,
    LedgerOp::Serialize,
    LedgerOp::SubmitTransaction,
    LedgerOp::Disconnect,
];

fn setup() -> (MemoryLedger, KeyOrchestrator) {
    let ledger = MemoryLedger::new();
    ledger.register_participant("u1");
    ledger
        .seed(Resource::new(RegistryKind::Keys, "k1").with_value("scope", json!("read")))
        .unwrap();
    (ledger.clone(), KeyOrchestrator::new(Arc::new(ledger)))
}

fn u1() -> Identity {
    Identity::new("u1")
}

/// Runs `op` against `existing` for reads and mutations and `fresh` for creates.
async fn run(keys: &KeyOrchestrator, op: Op, existing: &str, fresh: &str) -> KeyResult<Reply> {
    match op {
        Op::List => keys.list(&u1(), Representation::Unresolved).await,
        Op::ListResolved => keys.list(&u1(), Representation::Resolved).await,
        Op::Create => keys.create(&u1(), json!({"id": fresh, "scope": "read"})).await,
        Op::CreateByTransaction => {
            keys.create_by_transaction(&u1(), json!({"id": fresh, "scope": "read"}))
                .await
        }
        Op::Get => keys.get(&u1(), existing, Representation::Unresolved).await,
        Op::GetResolved => keys.get(&u1(), existing, Representation::Resolved).await,
        Op::Delete => keys.delete(&u1(), existing).await,
        Op::Update => keys.update(&u1(), existing, json!({"scope": "write"})).await,
    }
}

/// Ledger calls made by a successful run of `op` against a non-empty registry.
fn touches(op: Op, call: LedgerOp) -> bool {
    match call {
        LedgerOp::Connect | LedgerOp::Registry | LedgerOp::Disconnect => true,
        LedgerOp::Exists => !matches!(op, Op::List | Op::ListResolved),
        LedgerOp::Get => matches!(op, Op::Get | Op::Update),
        LedgerOp::Resolve => op == Op::GetResolved,
        LedgerOp::GetAll => op == Op::List,
        LedgerOp::ResolveAll => op == Op::ListResolved,
        LedgerOp::Add => op == Op::Create,
        LedgerOp::Update => op == Op::Update,
        LedgerOp::Remove => op == Op::Delete,
        LedgerOp::Serialize => matches!(op, Op::List | Op::Get | Op::Update),
        LedgerOp::SubmitTransaction => op == Op::CreateByTransaction,
    }
}

fn assert_released_once(stats: SessionStats, context: &str) {
    assert_eq!(stats.opened, 1, "{context}: sessions opened");
    assert_eq!(stats.disconnect_calls, 1, "{context}: disconnect calls");
    assert_eq!(stats.closed, 1, "{context}: sessions closed");
}

#[tokio::test]
async fn test_success_releases_once() {
    for op in ALL_OPS {
        let (ledger, keys) = setup();
        let result = run(&keys, op, "k1", "k2").await;
        assert!(result.is_ok(), "{op:?}: {result:?}");
        assert_released_once(ledger.session_stats(), &format!("{op:?}"));
    }
}

#[tokio::test]
async fn test_conflict_releases_once() {
    for op in [Op::Create, Op::CreateByTransaction] {
        let (ledger, keys) = setup();
        let result = run(&keys, op, "k1", "k1").await;
        assert!(matches!(result, Err(KeyError::Conflict(_))), "{op:?}");
        assert_released_once(ledger.session_stats(), &format!("{op:?}"));
    }
}

#[tokio::test]
async fn test_not_found_releases_once() {
    for op in [Op::Get, Op::GetResolved, Op::Delete, Op::Update] {
        let (ledger, keys) = setup();
        let result = run(&keys, op, "missing", "k2").await;
        assert!(matches!(result, Err(KeyError::NotFound { .. })), "{op:?}");
        assert_released_once(ledger.session_stats(), &format!("{op:?}"));
    }
}

#[tokio::test]
async fn test_failing_ledger_call_releases_once() {
    for fault in FAULTS {
        for op in ALL_OPS {
            let (ledger, keys) = setup();
            ledger.inject_fault(fault);
            let result = run(&keys, op, "k1", "k2").await;
            let context = format!("{op:?} with failing {fault:?}");

            if fault == LedgerOp::Disconnect || !touches(op, fault) {
                assert!(result.is_ok(), "{context}: {result:?}");
            } else {
                assert!(
                    matches!(result, Err(KeyError::Internal(_))),
                    "{context}: {result:?}"
                );
            }
            assert_released_once(ledger.session_stats(), &context);
        }
    }
}

#[tokio::test]
async fn test_failed_connect_opens_nothing() {
    for op in ALL_OPS {
        let (ledger, keys) = setup();
        ledger.inject_fault(LedgerOp::Connect);
        let result = run(&keys, op, "k1", "k2").await;
        assert!(
            matches!(result, Err(KeyError::Connection(ConnectionError::Unreachable(_)))),
            "{op:?}: {result:?}"
        );
        let stats = ledger.session_stats();
        assert_eq!(stats.opened, 0);
        assert_eq!(stats.disconnect_calls, 0);
    }
}

#[tokio::test]
async fn test_abandoned_operation_releases_once() {
    let (ledger, keys) = setup();
    let identity = u1();
    let in_flight = keys.connections().scoped(&identity, |_conn| {
        Box::pin(async move {
            std::future::pending::<()>().await;
            Ok(())
        })
    });
    let timed_out = tokio::time::timeout(Duration::from_millis(20), in_flight).await;
    assert!(timed_out.is_err());

    for _ in 0..16 {
        if ledger.session_stats().open() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_released_once(ledger.session_stats(), "abandoned");
}

#[tokio::test]
async fn test_sessions_are_never_reused() {
    let (ledger, keys) = setup();
    for op in ALL_OPS {
        let _ = run(&keys, op, "k1", "k-fresh").await;
    }
    let stats = ledger.session_stats();
    assert_eq!(stats.opened, ALL_OPS.len() as u64);
    assert_eq!(stats.closed, stats.opened);
    assert_eq!(stats.disconnect_calls, stats.opened);
}
