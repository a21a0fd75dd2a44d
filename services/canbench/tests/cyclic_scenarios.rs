//! Cyclic transmission against the loopback adapter

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use canbench::driver::LoopbackDriver;
use canbench::{
    CyclicScheduler, SignalValueStore, SweepPlan, Transceiver, TransceiverSession, TxOutcome,
};
use signal_db::{Message, Signal};

fn message_m() -> Message {
    Message::new("M", 0x100, 1).with_signal(
        Signal::new("S", 0, 8)
            .with_scaling(0.5, 0.0)
            .with_range(0.0, 100.0),
    )
}

/// Two signals that must always be written together
fn paired() -> Message {
    Message::new("Pair", 0x200, 2)
        .with_signal(Signal::new("A", 0, 8))
        .with_signal(Signal::new("B", 8, 8))
}

fn active_session() -> (LoopbackDriver, Arc<TransceiverSession>) {
    let driver = LoopbackDriver::new();
    let session = TransceiverSession::new(Box::new(driver.clone()));
    session.connect().unwrap();
    (driver, Arc::new(session))
}

// ============================================================================
// Failure tolerance
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_transmit_never_halts_the_job() {
    let (driver, session) = active_session();
    driver.transmit_result(Some(0));

    let values = Arc::new(SignalValueStore::new());
    values.reset(&message_m());
    let scheduler = CyclicScheduler::new(session.clone(), values);
    scheduler
        .start(&message_m(), Duration::from_millis(100))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(scheduler.is_running("M"));
    let stats = scheduler.stats("M").unwrap();
    scheduler.shutdown().await;

    assert!(stats.ticks >= 10, "only {} ticks", stats.ticks);
    // the snapshot may land between a tick starting and its transmit ending
    assert!(stats.transmit_failures + 1 >= stats.ticks);
    assert_eq!(stats.sent, 0);
    assert!(stats.last_error.is_some());

    let failed = session
        .log()
        .entries()
        .iter()
        .filter(|e| e.outcome == TxOutcome::Failed { code: 0 })
        .count();
    assert!(failed >= 10, "only {} failed entries", failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_job_keeps_logging() {
    let session = Arc::new(TransceiverSession::offline());
    let values = Arc::new(SignalValueStore::new());
    let scheduler = CyclicScheduler::new(session.clone(), values);
    scheduler
        .start(&message_m(), Duration::from_millis(10))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = scheduler.stats("M").unwrap();
    scheduler.shutdown().await;

    assert!(stats.offline > 0);
    assert_eq!(stats.transmit_failures, 0);
    assert!(session
        .log()
        .entries()
        .iter()
        .all(|e| e.outcome == TxOutcome::Offline));
}

// ============================================================================
// Live values
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_value_record_is_never_torn() {
    let (driver, session) = active_session();
    let values = Arc::new(SignalValueStore::new());
    values.reset(&paired());

    let scheduler = CyclicScheduler::new(session.clone(), values.clone());
    scheduler.start(&paired(), Duration::from_millis(1)).unwrap();

    let writer = {
        let values = values.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..2000_u32 {
                let v = f64::from(i % 256);
                values.set_many("Pair", [("A", v), ("B", v)]);
            }
        })
    };
    writer.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    scheduler.shutdown().await;

    let sent = driver.sent();
    assert!(!sent.is_empty());
    for frame in sent {
        assert_eq!(frame.data[0], frame.data[1], "torn record {:?}", frame.data);
    }
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_walks_the_range_then_stops() {
    let (driver, session) = active_session();
    let values = Arc::new(SignalValueStore::new());
    values.reset(&message_m());

    let scheduler = CyclicScheduler::new(session.clone(), values.clone());
    scheduler
        .start_sweep(
            &message_m(),
            Duration::from_millis(5),
            SweepPlan::new("S", 0.0, 2.0, 0.5),
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), scheduler.wait("M"))
        .await
        .unwrap();
    assert!(!scheduler.is_running("M"));

    let payloads: Vec<u8> = driver.sent().iter().map(|f| f.data[0]).collect();
    assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    assert_eq!(values.get("M", "S"), Some(2.0));
}
