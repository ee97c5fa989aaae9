//! Mock log source for testing without a chain.

use super::{LogSource, RawLog, SourceError, Subscription};
use crate::domain::EventKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Mock log source backed by scripted per-kind logs.
///
/// Failure injection, a range-span limit, and a query delay let tests drive
/// the engine through every error path; `push` feeds live subscribers.
#[derive(Debug, Default)]
pub struct MockLogSource {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    logs: HashMap<EventKind, Vec<RawLog>>,
    head: u64,
    range_limit: Option<u64>,
    query_failures: u32,
    subscribe_failures: u32,
    query_delay: Option<Duration>,
    queries: Vec<(EventKind, u64, u64)>,
    feeds: HashMap<EventKind, Vec<mpsc::Sender<Vec<RawLog>>>>,
}

impl MockLogSource {
    /// Create a new mock source with no logs and head at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one historical log of the given kind.
    pub fn with_log(self, kind: EventKind, raw: RawLog) -> Self {
        {
            let mut inner = self.lock();
            inner.head = inner.head.max(raw.block_number);
            inner.logs.entry(kind).or_default().push(raw);
        }
        self
    }

    /// Set the head block explicitly (otherwise the highest log block).
    pub fn with_head(self, head: u64) -> Self {
        self.lock().head = head;
        self
    }

    /// Reject range queries spanning more than `limit` blocks.
    pub fn with_range_limit(self, limit: u64) -> Self {
        self.lock().range_limit = Some(limit);
        self
    }

    /// Make the next `n` range queries fail with `Unavailable`.
    pub fn fail_next_queries(&self, n: u32) {
        self.lock().query_failures = n;
    }

    /// Make the next `n` subscribe calls fail with `Unavailable`.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.lock().subscribe_failures = n;
    }

    /// Delay every successful range query by `delay`.
    pub fn set_query_delay(&self, delay: Duration) {
        self.lock().query_delay = Some(delay);
    }

    /// Replace the scripted history for one kind.
    pub fn set_logs(&self, kind: EventKind, logs: Vec<RawLog>) {
        let mut inner = self.lock();
        for raw in &logs {
            inner.head = inner.head.max(raw.block_number);
        }
        inner.logs.insert(kind, logs);
    }

    /// Deliver a live batch to every open feed of the given kind.
    pub async fn push(&self, kind: EventKind, batch: Vec<RawLog>) {
        let senders = self.lock().feeds.get(&kind).cloned().unwrap_or_default();
        for tx in senders {
            let _ = tx.send(batch.clone()).await;
        }
    }

    /// Drop every open feed of the given kind, as a connection reset would.
    pub fn close_feeds(&self, kind: EventKind) {
        self.lock().feeds.remove(&kind);
    }

    /// Number of currently open feeds for the given kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().feeds.get(&kind).map_or(0, |f| f.len())
    }

    /// Every range query issued so far, as `(kind, from, resolved_to)`.
    pub fn queries(&self) -> Vec<(EventKind, u64, u64)> {
        self.lock().queries.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LogSource for MockLogSource {
    async fn latest_block(&self) -> Result<u64, SourceError> {
        Ok(self.lock().head)
    }

    async fn query_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<RawLog>, SourceError> {
        let (delay, result) = {
            let mut inner = self.lock();
            let to = to_block.unwrap_or(inner.head);
            inner.queries.push((kind, from_block, to));

            if inner.query_failures > 0 {
                inner.query_failures -= 1;
                return Err(SourceError::Unavailable("injected failure".to_string()));
            }
            if let Some(limit) = inner.range_limit {
                if to.saturating_sub(from_block) > limit {
                    return Err(SourceError::RangeTooLarge);
                }
            }

            let logs = inner
                .logs
                .get(&kind)
                .map(|logs| {
                    logs.iter()
                        .filter(|l| l.block_number >= from_block && l.block_number <= to)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (inner.query_delay, logs)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(result)
    }

    async fn subscribe(&self, kind: EventKind) -> Result<Subscription, SourceError> {
        let mut inner = self.lock();
        if inner.subscribe_failures > 0 {
            inner.subscribe_failures -= 1;
            return Err(SourceError::Unavailable("injected failure".to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        inner.feeds.entry(kind).or_default().push(tx);
        Ok(Subscription::from_receiver(rx))
    }
}
