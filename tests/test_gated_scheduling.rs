//! Integration tests for height-gated scheduling
//!
//! Tests cover:
//! - Price task gated on the reserve-snapshot writer inside a task runner
//! - Gate timeout surfacing as a runner error
//!
//! Time is paused; the runner uses a clock that follows tokio's virtual time.

use amm_price_feed::memory_store::MemoryStore;
use amm_price_feed::price_engine::PriceEngine;
use amm_price_feed::router::Router;
use amm_price_feed::scheduler::{HeightGate, Schedule, SchedulerError, Task, TaskRunner, TokioClock};
use amm_price_feed::tasks::{LiquidityProgressTask, PriceTask};
use amm_price_feed::types::{AssetLeg, Height, Pair, Token, TxKind, TxRecord};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REF: &str = "REF";

fn swap(tx_id: &str, height: Height, a: (&str, &str), b: (&str, &str)) -> TxRecord {
    TxRecord {
        tx_id: tx_id.to_string(),
        height,
        kind: TxKind::Swap,
        legs: [AssetLeg::new(a.0, a.1, 0), AssetLeg::new(b.0, b.1, 0)],
    }
}

struct Pipeline {
    store: Arc<MemoryStore>,
    cancel: CancellationToken,
    runner: TaskRunner,
}

async fn pipeline(gate_timeout: Option<Duration>) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    for (i, (a, b)) in [("X", "Y"), ("Y", REF)].into_iter().enumerate() {
        store.add_pair(Pair::new(format!("pool{}", i), a, b));
        store.set_decimals(a, 0);
        store.set_decimals(b, 0);
    }
    store.set_reserves(10, "Y", REF, "10000", "20000");
    store.set_reserves(10, "X", "Y", "10000", "40000");
    store.add_tx(swap("tx1", 10, (REF, "100"), ("Y", "-50")));
    store.add_tx(swap("tx2", 11, ("X", "100"), ("Y", "-300")));

    let router = Arc::new(Router::new(store.clone(), 3));
    router.update().await.unwrap();
    let engine = Arc::new(PriceEngine::new(store.clone(), router, Token::from(REF), Decimal::from(1000)));

    let cancel = CancellationToken::new();
    let clock = Arc::new(TokioClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
    let liquidity: Arc<dyn Task> = Arc::new(LiquidityProgressTask::new(store.clone()));
    let gate = HeightGate::new(vec![liquidity.clone()], Duration::from_secs(1), cancel.clone()).with_timeout(gate_timeout);
    let prices = PriceTask::new(engine, cancel.clone()).with_gate(gate);

    let mut runner = TaskRunner::new(cancel.clone()).with_clock(clock);
    runner.add(liquidity, Schedule::Interval(Duration::from_secs(1)));
    runner.add(Arc::new(prices), Schedule::Interval(Duration::from_secs(1)));

    Pipeline { store, cancel, runner }
}

/// Test that the price task waits for reserves of a height before pricing it
#[tokio::test(start_paused = true)]
async fn test_price_task_waits_for_reserve_snapshots() {
    let Pipeline { store, cancel, runner } = pipeline(None).await;
    let run = tokio::spawn(runner.run());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(store.price_of(&Token::from("Y"), 10).is_some(), "height 10 has reserves");
    assert!(store.price_of(&Token::from("X"), 11).is_none(), "height 11 must wait");

    store.set_reserves(11, "Y", REF, "10000", "20000");
    tokio::time::sleep(Duration::from_secs(5)).await;
    let x = store.price_of(&Token::from("X"), 11).expect("height 11 priced once reserves arrive");
    assert_eq!(x.price, Decimal::from(6));

    cancel.cancel();
    assert!(run.await.unwrap().is_ok());
}

/// Test that shutdown during a gate wait stops the runner cleanly
#[tokio::test(start_paused = true)]
async fn test_shutdown_while_gated_is_clean() {
    let Pipeline { store, cancel, runner } = pipeline(None).await;
    let run = tokio::spawn(runner.run());

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();

    assert!(run.await.unwrap().is_ok());
    assert!(store.price_of(&Token::from("X"), 11).is_none());
}

/// Test that a gate timeout stops every task and is reported
#[tokio::test(start_paused = true)]
async fn test_gate_timeout_fails_the_runner() {
    let Pipeline { runner, .. } = pipeline(Some(Duration::from_secs(30))).await;

    let err = runner.run().await.unwrap_err();
    match err {
        SchedulerError::Task { task, error } => {
            assert_eq!(task, "prices");
            assert!(format!("{:#}", error).contains("height 11"));
        }
        other => panic!("unexpected error: {}", other),
    }
}
