use bankfeed::{EngineOptions, EngineState, EventKind, MockLogSource, RawLog, Reconciler};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn deposit_log(block: u64, tx: &str, amount: &str, timestamp_secs: i64) -> RawLog {
    RawLog::new(
        block,
        tx,
        0,
        json!({ "user": "0x1111", "amount": amount, "timestamp": timestamp_secs }),
    )
}

fn withdraw_log(block: u64, tx: &str, amount: &str, timestamp_secs: i64) -> RawLog {
    RawLog::new(
        block,
        tx,
        0,
        json!({ "user": "0x1111", "amount": amount, "timestamp": timestamp_secs }),
    )
}

fn callback_log(block: u64, tx: &str, amount: &str) -> RawLog {
    RawLog::new(
        block,
        tx,
        0,
        json!({ "user": "0x1111", "receiver": "0x2222", "amount": amount }),
    )
}

fn fast_options() -> EngineOptions {
    EngineOptions {
        backfill_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

async fn wait_for_change(changes: &mut tokio::sync::watch::Receiver<u64>) {
    timeout(Duration::from_secs(5), changes.changed())
        .await
        .expect("timed out waiting for a record-set change")
        .expect("engine dropped");
}

async fn wait_for_subscribers(mock: &MockLogSource, kind: EventKind, n: usize) {
    timeout(Duration::from_secs(5), async {
        while mock.subscriber_count(kind) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("feed was never opened");
}

async fn wait_for_queries(mock: &MockLogSource, n: usize) {
    timeout(Duration::from_secs(5), async {
        while mock.queries().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected range queries were never issued");
}

#[tokio::test]
async fn seeds_from_backfill_and_reconciles_live_push() {
    // The documented end-to-end scenario: a deposit and a later withdrawal
    // in history, then a timestampless callback transfer pushed live.
    let mock = Arc::new(
        MockLogSource::new()
            .with_log(
                EventKind::Deposit,
                deposit_log(100, "0xd1", "1500000000000000000", 1_000),
            )
            .with_log(
                EventKind::Withdraw,
                withdraw_log(105, "0xw1", "500000000000000000", 2_000),
            ),
    );
    let engine = Reconciler::new(mock.clone(), fast_options());
    let mut changes = engine.changes();

    engine.start(&EventKind::all()).await.unwrap();
    assert_eq!(engine.state(), EngineState::Live);
    changes.borrow_and_update();

    let window = engine.window(0, 10);
    assert_eq!(window.len(), 2);
    assert_eq!(window[0].kind, EventKind::Withdraw);
    assert_eq!(window[0].amount.to_canonical_string(), "0.5");
    assert_eq!(window[1].kind, EventKind::Deposit);
    assert_eq!(window[1].amount.to_canonical_string(), "1.5");
    assert!(window[0].occurred_at > window[1].occurred_at);

    wait_for_subscribers(&mock, EventKind::CallbackTransfer, 1).await;
    mock.push(
        EventKind::CallbackTransfer,
        vec![callback_log(110, "0xc1", "250000000000000000")],
    )
    .await;
    wait_for_change(&mut changes).await;

    // Observation time is later than both on-chain timestamps, so the
    // callback transfer becomes the new head of the view.
    let window = engine.window(0, 10);
    assert_eq!(window.len(), 3);
    assert_eq!(window[0].kind, EventKind::CallbackTransfer);
    assert_eq!(window[0].amount.to_canonical_string(), "0.25");
}

#[tokio::test]
async fn dedups_by_source_id_across_backfill_and_push() {
    // The same log twice in history, and redelivered again over the feed.
    let raw = deposit_log(100, "0xd1", "1000000000000000000", 1_000);
    let mock = Arc::new(
        MockLogSource::new()
            .with_log(EventKind::Deposit, raw.clone())
            .with_log(EventKind::Deposit, raw.clone()),
    );
    let engine = Reconciler::new(mock.clone(), fast_options());
    let mut changes = engine.changes();

    engine.start(&[EventKind::Deposit]).await.unwrap();
    assert_eq!(engine.size(), 1);
    changes.borrow_and_update();

    wait_for_subscribers(&mock, EventKind::Deposit, 1).await;
    mock.push(EventKind::Deposit, vec![raw.clone()]).await;
    mock.push(EventKind::Deposit, vec![raw]).await;
    mock.push(
        EventKind::Deposit,
        vec![deposit_log(101, "0xd2", "1000000000000000000", 1_001)],
    )
    .await;
    wait_for_change(&mut changes).await;

    // Only the genuinely new record landed.
    assert_eq!(engine.size(), 2);
}

#[tokio::test]
async fn malformed_push_entry_does_not_poison_the_batch() {
    let mock = Arc::new(MockLogSource::new().with_head(50));
    let engine = Reconciler::new(mock.clone(), fast_options());
    let mut changes = engine.changes();

    engine.start(&[EventKind::Deposit]).await.unwrap();
    changes.borrow_and_update();
    wait_for_subscribers(&mock, EventKind::Deposit, 1).await;

    let malformed = RawLog::new(60, "0xbad", 0, json!({ "user": "0x1111" }));
    mock.push(
        EventKind::Deposit,
        vec![
            deposit_log(60, "0xd1", "1000000000000000000", 1_000),
            malformed,
            deposit_log(61, "0xd2", "2000000000000000000", 1_001),
        ],
    )
    .await;
    wait_for_change(&mut changes).await;

    assert_eq!(engine.size(), 2);
    let ids: Vec<String> = engine
        .window(0, 10)
        .into_iter()
        .map(|r| r.source_id)
        .collect();
    assert!(ids.contains(&"0xd1:0".to_string()));
    assert!(ids.contains(&"0xd2:0".to_string()));
}

#[tokio::test]
async fn window_is_ordered_for_every_offset() {
    let mut mock = MockLogSource::new();
    for i in 0..7u64 {
        // Deliberately unsorted timestamps.
        let ts = [5, 1, 9, 3, 7, 2, 8][i as usize];
        mock = mock.with_log(
            EventKind::Deposit,
            deposit_log(100 + i, &format!("0x{:02x}", i), "1000000000000000000", ts),
        );
    }
    let engine = Reconciler::new(Arc::new(mock), fast_options());
    engine.start(&[EventKind::Deposit]).await.unwrap();

    let total = engine.size();
    assert_eq!(total, 7);
    for offset in 0..total {
        for count in 1..=total {
            let window = engine.window(offset, count);
            for pair in window.windows(2) {
                assert!(pair[0].occurred_at >= pair[1].occurred_at);
            }
        }
    }

    // Past the end: no error, just whatever exists.
    assert_eq!(engine.window(5, 10).len(), 2);
    assert_eq!(engine.window(100, 10).len(), 0);
}

#[tokio::test]
async fn refresh_atomically_replaces_the_set() {
    let mock = Arc::new(MockLogSource::new().with_log(
        EventKind::Deposit,
        deposit_log(100, "0xd1", "1000000000000000000", 1_000),
    ));
    let engine = Reconciler::new(mock.clone(), fast_options());
    let mut changes = engine.changes();

    engine.start(&[EventKind::Deposit]).await.unwrap();
    changes.borrow_and_update();
    wait_for_subscribers(&mock, EventKind::Deposit, 1).await;

    // A pushed record that a later backfill does not return, as after a
    // chain reorg.
    mock.push(
        EventKind::Deposit,
        vec![deposit_log(120, "0xorphan", "1000000000000000000", 3_000)],
    )
    .await;
    wait_for_change(&mut changes).await;
    assert_eq!(engine.size(), 2);

    engine.refresh().await.unwrap();
    assert_eq!(engine.state(), EngineState::Live);

    let ids: Vec<String> = engine
        .window(0, 10)
        .into_iter()
        .map(|r| r.source_id)
        .collect();
    assert_eq!(ids, vec!["0xd1:0".to_string()]);
}

#[tokio::test]
async fn failed_refresh_keeps_the_previous_set() {
    let mock = Arc::new(MockLogSource::new().with_log(
        EventKind::Deposit,
        deposit_log(100, "0xd1", "1000000000000000000", 1_000),
    ));
    let engine = Reconciler::new(mock.clone(), fast_options());

    engine.start(&[EventKind::Deposit]).await.unwrap();
    // Initial backfill plus the feed's gap query.
    wait_for_queries(&mock, 2).await;

    mock.fail_next_queries(5);
    let err = engine.refresh().await.unwrap_err();
    assert!(err.to_string().contains("unavailable"));

    assert_eq!(engine.state(), EngineState::Live);
    assert_eq!(engine.size(), 1);
    assert_eq!(engine.window(0, 10)[0].source_id, "0xd1:0");
}

#[tokio::test]
async fn failed_start_is_terminal_until_retried() {
    let mock = Arc::new(MockLogSource::new().with_log(
        EventKind::Deposit,
        deposit_log(100, "0xd1", "1000000000000000000", 1_000),
    ));
    mock.fail_next_queries(1);

    let engine = Reconciler::new(mock.clone(), fast_options());
    assert_eq!(engine.state(), EngineState::Uninitialized);

    engine.start(&[EventKind::Deposit]).await.unwrap_err();
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(engine.size(), 0);

    // A fresh start is the caller's retry path.
    engine.start(&[EventKind::Deposit]).await.unwrap();
    assert_eq!(engine.state(), EngineState::Live);
    assert_eq!(engine.size(), 1);

    // And a second start while live is rejected.
    assert!(engine.start(&[EventKind::Deposit]).await.is_err());
}

#[tokio::test]
async fn refresh_requires_a_live_engine() {
    let engine = Reconciler::new(Arc::new(MockLogSource::new()), fast_options());
    assert!(engine.refresh().await.is_err());
}

#[tokio::test]
async fn dropped_feed_is_reopened_and_the_gap_backfilled() {
    let mock = Arc::new(MockLogSource::new().with_head(10));
    let engine = Reconciler::new(mock.clone(), fast_options());
    let mut changes = engine.changes();

    engine.start(&[EventKind::Deposit]).await.unwrap();
    wait_for_subscribers(&mock, EventKind::Deposit, 1).await;
    assert_eq!(engine.size(), 0);

    // Events land while the connection is down.
    mock.set_logs(
        EventKind::Deposit,
        vec![deposit_log(15, "0xgap", "1000000000000000000", 5_000)],
    );
    mock.close_feeds(EventKind::Deposit);

    // The reconciler reopens the feed and recovers the gap without a push.
    wait_for_change(&mut changes).await;
    assert_eq!(engine.size(), 1);
    assert_eq!(engine.window(0, 1)[0].source_id, "0xgap:0");
    assert_eq!(mock.subscriber_count(EventKind::Deposit), 1);
}

#[tokio::test]
async fn subscribe_failures_after_start_are_retried() {
    let mock = Arc::new(MockLogSource::new().with_head(10));
    mock.fail_next_subscribes(2);

    let engine = Reconciler::new(mock.clone(), fast_options());
    engine.start(&[EventKind::Deposit]).await.unwrap();
    assert_eq!(engine.state(), EngineState::Live);

    // Backoff eventually gets the feed open.
    timeout(Duration::from_secs(10), async {
        while mock.subscriber_count(EventKind::Deposit) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("feed never recovered");
}

#[tokio::test]
async fn shutdown_stops_all_feeds() {
    let mock = Arc::new(MockLogSource::new().with_head(10));
    let engine = Reconciler::new(mock.clone(), fast_options());
    engine.start(&EventKind::all()).await.unwrap();
    wait_for_subscribers(&mock, EventKind::Deposit, 1).await;

    engine.shutdown();
    // Aborted feed tasks drop their subscriptions; pushing afterwards must
    // not grow the set.
    let before = engine.size();
    mock.push(
        EventKind::Deposit,
        vec![deposit_log(50, "0xlate", "1000000000000000000", 9_000)],
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.size(), before);
}
