//! Chain log source abstraction: historical range queries plus live push feeds.

use crate::domain::EventKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod mock;
pub mod rpc;

pub use mock::MockLogSource;
pub use rpc::RpcLogSource;

/// One raw log entry as delivered by the source, before normalization.
///
/// `args` holds the kind-specific decoded fields as a JSON object; a field
/// the decoder could not produce is simply absent, and the normalizer
/// decides whether that makes the log malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    /// Block the log was emitted in.
    pub block_number: u64,
    /// Transaction hash; may be empty when the source omits it.
    pub tx_hash: String,
    /// Position of the log within its transaction.
    pub log_index: u32,
    /// Kind-specific decoded fields.
    pub args: serde_json::Value,
}

impl RawLog {
    pub fn new(block_number: u64, tx_hash: &str, log_index: u32, args: serde_json::Value) -> Self {
        Self {
            block_number,
            tx_hash: tx_hash.to_string(),
            log_index,
            args,
        }
    }
}

/// Chain log source capability.
///
/// Implementations must handle their own transport-level retry; the engine
/// treats a returned error as the query having failed.
#[async_trait]
pub trait LogSource: Send + Sync + fmt::Debug {
    /// Current head block of the chain.
    async fn latest_block(&self) -> Result<u64, SourceError>;

    /// Fetch all logs of one kind in `[from_block, to_block]`.
    ///
    /// `to_block = None` means the current head. A source may reject an
    /// overly broad span with [`SourceError::RangeTooLarge`]; callers split
    /// and retry.
    async fn query_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<RawLog>, SourceError>;

    /// Open a push feed of new logs of one kind, starting at the head.
    ///
    /// The feed yields batches; it ends when the source loses the feed, and
    /// must be re-openable.
    async fn subscribe(&self, kind: EventKind) -> Result<Subscription, SourceError>;
}

/// Live push feed of raw log batches.
///
/// Dropping the subscription cancels its producer task, so no listener is
/// left polling after the consumer goes away.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Vec<RawLog>>,
    producer: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Build a feed from a plain channel (no producer task to cancel).
    pub fn from_receiver(rx: mpsc::Receiver<Vec<RawLog>>) -> Self {
        Self { rx, producer: None }
    }

    /// Build a feed whose producer task is cancelled when the feed is dropped.
    pub fn with_producer(rx: mpsc::Receiver<Vec<RawLog>>, producer: JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer),
        }
    }

    /// Wait for the next batch. Returns `None` when the feed has ended.
    pub async fn next_batch(&mut self) -> Option<Vec<RawLog>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Error type for log source operations.
#[derive(Debug, Clone)]
pub enum SourceError {
    /// The source cannot currently be reached (network or node failure).
    Unavailable(String),
    /// The requested block span is broader than the source accepts.
    RangeTooLarge,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(msg) => write!(f, "source unavailable: {}", msg),
            SourceError::RangeTooLarge => write!(f, "range too large"),
        }
    }
}

impl std::error::Error for SourceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "source unavailable: connection refused");
        assert_eq!(SourceError::RangeTooLarge.to_string(), "range too large");
    }

    #[tokio::test]
    async fn test_subscription_yields_batches_then_ends() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::from_receiver(rx);

        let raw = RawLog::new(1, "0xaa", 0, serde_json::json!({}));
        tx.send(vec![raw.clone()]).await.unwrap();
        drop(tx);

        assert_eq!(sub.next_batch().await, Some(vec![raw]));
        assert_eq!(sub.next_batch().await, None);
    }

    #[tokio::test]
    async fn test_subscription_drop_cancels_producer() {
        let (tx, rx) = mpsc::channel::<Vec<RawLog>>(1);
        let producer = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        let sub = Subscription::with_producer(rx, producer);
        let handle = sub.producer.as_ref().unwrap().abort_handle();
        drop(sub);

        for _ in 0..20 {
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());
    }
}
