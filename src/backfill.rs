//! Historical backfill: bounded or unbounded range queries per event kind.

use crate::domain::{EventKind, Record, TimeMs};
use crate::error::FetchError;
use crate::normalize::Normalizer;
use crate::source::{LogSource, RawLog, SourceError};
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a full backfill pass.
#[derive(Debug)]
pub struct BackfillOutcome {
    /// Normalized records, concatenated in kind order.
    pub records: Vec<Record>,
    /// Head block the backfill ran to; seeds the live-feed watermark.
    pub head: u64,
}

/// Issues historical range queries against the log source and normalizes
/// the results.
#[derive(Debug, Clone)]
pub struct BackfillFetcher {
    source: Arc<dyn LogSource>,
    normalizer: Normalizer,
    timeout: Duration,
}

impl BackfillFetcher {
    pub fn new(source: Arc<dyn LogSource>, normalizer: Normalizer, timeout: Duration) -> Self {
        Self {
            source,
            normalizer,
            timeout,
        }
    }

    /// Fetch and normalize every log of the given kinds in
    /// `[from_block, to_block]` (`None` = current head).
    ///
    /// All-or-nothing: if any kind's query fails, the whole call fails and
    /// no partial results are surfaced. A record set silently missing one
    /// kind would look complete without being complete.
    pub async fn fetch_all(
        &self,
        kinds: &[EventKind],
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<BackfillOutcome, FetchError> {
        let head = match to_block {
            Some(block) => block,
            None => self
                .source
                .latest_block()
                .await
                .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?,
        };

        debug!(
            "Backfilling {} kinds over blocks [{}, {}]",
            kinds.len(),
            from_block,
            head
        );

        let observed_at = TimeMs::now();
        let queries = kinds
            .iter()
            .map(|&kind| self.fetch_kind(kind, from_block, head));
        let per_kind = future::try_join_all(queries).await?;

        let mut records = Vec::new();
        for (&kind, raws) in kinds.iter().zip(&per_kind) {
            records.extend(self.normalizer.normalize_batch(kind, raws, observed_at));
        }

        Ok(BackfillOutcome { records, head })
    }

    /// One kind's range query, with a bounded wait and recursive bisection
    /// when the source rejects the span as too large.
    async fn fetch_kind(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, FetchError> {
        let query = self.source.query_range(kind, from, Some(to));
        match tokio::time::timeout(self.timeout, query).await {
            Err(_) => {
                warn!(
                    "{} range query [{}, {}] did not complete within {:?}",
                    kind, from, to, self.timeout
                );
                Err(FetchError::Timeout(self.timeout.as_millis() as u64))
            }
            Ok(Ok(raws)) => Ok(raws),
            Ok(Err(SourceError::Unavailable(msg))) => Err(FetchError::SourceUnavailable(msg)),
            Ok(Err(SourceError::RangeTooLarge)) => {
                if from >= to {
                    return Err(FetchError::RangeExhausted { from, to });
                }
                let mid = from + (to - from) / 2;
                debug!("Splitting {} range [{}, {}] at {}", kind, from, to, mid);
                let mut left = Box::pin(self.fetch_kind(kind, from, mid)).await?;
                let right = Box::pin(self.fetch_kind(kind, mid + 1, to)).await?;
                left.extend(right);
                Ok(left)
            }
        }
    }
}
