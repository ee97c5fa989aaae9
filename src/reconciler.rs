//! Live reconciler: owns the merged record set, seeds it from a full
//! backfill, and folds per-kind push feeds into one ordered, deduplicated
//! view.

use crate::backfill::{BackfillFetcher, BackfillOutcome};
use crate::config::Config;
use crate::domain::ordering::newest_first;
use crate::domain::{EventKind, Record, RecordOrderingKey, TimeMs};
use crate::error::FetchError;
use crate::normalize::Normalizer;
use crate::source::{LogSource, RawLog};
use backoff::ExponentialBackoff;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Backfilling,
    Live,
    Refreshing,
    /// The initial backfill failed; only a fresh `start` makes progress.
    Failed,
}

/// Reconciler tunables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// First block of the backfill range.
    pub from_block: u64,
    /// Fixed-point scale of the token amounts.
    pub token_decimals: u32,
    /// Bounded wait per backfill range query.
    pub backfill_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            from_block: 0,
            token_decimals: 18,
            backfill_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            from_block: config.from_block,
            token_decimals: config.token_decimals,
            backfill_timeout: Duration::from_millis(config.backfill_timeout_ms),
        }
    }
}

/// The reconciliation engine.
///
/// `start` seeds the record set from a full backfill and opens one live feed
/// per tracked kind; afterwards the set only grows, until `refresh` rebuilds
/// it from scratch. All mutations pass through one guarded critical section
/// and are applied a whole batch at a time.
pub struct Reconciler {
    core: Arc<Core>,
    feeds: Mutex<Vec<JoinHandle<()>>>,
}

struct Core {
    source: Arc<dyn LogSource>,
    fetcher: BackfillFetcher,
    normalizer: Normalizer,
    options: EngineOptions,
    kinds: Mutex<Vec<EventKind>>,
    set: Mutex<RecordSet>,
    state: Mutex<EngineState>,
    notify: watch::Sender<u64>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn LogSource>, options: EngineOptions) -> Self {
        let normalizer = Normalizer::new(options.token_decimals);
        let fetcher = BackfillFetcher::new(source.clone(), normalizer, options.backfill_timeout);
        let (notify, _) = watch::channel(0);
        Self {
            core: Arc::new(Core {
                source,
                fetcher,
                normalizer,
                options,
                kinds: Mutex::new(Vec::new()),
                set: Mutex::new(RecordSet::default()),
                state: Mutex::new(EngineState::Uninitialized),
                notify,
            }),
            feeds: Mutex::new(Vec::new()),
        }
    }

    /// Backfill the full history for `kinds`, seed the record set, and open
    /// one live feed per kind.
    ///
    /// Fails (terminally, until called again) only if the backfill fails;
    /// feed drops after a successful start are retried with backoff.
    pub async fn start(&self, kinds: &[EventKind]) -> Result<(), FetchError> {
        {
            let mut state = self.core.lock_state();
            match *state {
                EngineState::Uninitialized | EngineState::Failed => {
                    *state = EngineState::Backfilling
                }
                _ => return Err(FetchError::AlreadyStarted),
            }
        }

        let outcome = match self
            .core
            .fetcher
            .fetch_all(kinds, self.core.options.from_block, None)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                *self.core.lock_state() = EngineState::Failed;
                return Err(e);
            }
        };

        let BackfillOutcome { records, head } = outcome;
        info!(
            "Backfill complete: {} records up to block {}",
            records.len(),
            head
        );

        *self.core.lock_kinds() = kinds.to_vec();
        self.core.apply(move |set| set.insert_batch(records) > 0);
        *self.core.lock_state() = EngineState::Live;

        let mut feeds = self.lock_feeds();
        for &kind in kinds {
            feeds.push(tokio::spawn(run_feed(self.core.clone(), kind, head)));
        }
        Ok(())
    }

    /// Re-run the full backfill and atomically replace the record set.
    ///
    /// On failure the previous set is kept untouched and the error is
    /// surfaced; a record only visible through a since-reverted state
    /// disappears on success.
    pub async fn refresh(&self) -> Result<(), FetchError> {
        {
            let mut state = self.core.lock_state();
            match *state {
                EngineState::Live => *state = EngineState::Refreshing,
                _ => return Err(FetchError::NotLive),
            }
        }

        let kinds = self.core.lock_kinds().clone();
        let result = self
            .core
            .fetcher
            .fetch_all(&kinds, self.core.options.from_block, None)
            .await;

        let outcome = match result {
            Ok(outcome) => {
                self.core.apply(move |set| {
                    set.replace(outcome.records);
                    true
                });
                Ok(())
            }
            Err(e) => {
                warn!("Refresh failed, keeping previous record set: {}", e);
                Err(e)
            }
        };

        *self.core.lock_state() = EngineState::Live;
        outcome
    }

    /// Immutable slice of the sorted record set. Requests past the end
    /// return what exists; never an error.
    pub fn window(&self, offset: usize, count: usize) -> Vec<Record> {
        self.core.lock_set().window(offset, count)
    }

    /// Current total record count.
    pub fn size(&self) -> usize {
        self.core.lock_set().len()
    }

    pub fn state(&self) -> EngineState {
        *self.core.lock_state()
    }

    /// Change feed: the value ticks on every record-set mutation.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.core.notify.subscribe()
    }

    /// Stop all live feeds. In-flight backfills are abandoned by their
    /// callers; no listener survives shutdown.
    pub fn shutdown(&self) {
        for feed in self.lock_feeds().drain(..) {
            feed.abort();
        }
    }

    fn lock_feeds(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Core {
    /// Run one mutation inside the critical section; bump the revision and
    /// notify watchers only when the closure reports an actual change.
    fn apply<F>(&self, mutate: F)
    where
        F: FnOnce(&mut RecordSet) -> bool,
    {
        let revision = {
            let mut set = self.lock_set();
            if !mutate(&mut set) {
                return;
            }
            set.revision += 1;
            set.revision
        };
        self.notify.send_replace(revision);
    }

    // Lock recovery keeps the last fully applied batch.
    fn lock_set(&self) -> MutexGuard<'_, RecordSet> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_kinds(&self) -> MutexGuard<'_, Vec<EventKind>> {
        self.kinds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One kind's feed loop: subscribe with backoff, cover the gap since the
/// last observed block, then drain the feed until it closes.
async fn run_feed(core: Arc<Core>, kind: EventKind, seed_watermark: u64) {
    let mut last_block = seed_watermark;
    loop {
        let from = last_block.saturating_add(1);
        let source = core.source.clone();
        let wait = core.options.backfill_timeout;
        let result = backoff::future::retry(reconnect_backoff(), move || {
            let source = source.clone();
            async move {
                let sub = source
                    .subscribe(kind)
                    .await
                    .map_err(backoff::Error::transient)?;
                // The gap query runs after the feed is open, so nothing falls
                // between them; the overlap is absorbed by dedup.
                let gap = tokio::time::timeout(wait, source.query_range(kind, from, None))
                    .await
                    .map_err(|_| {
                        backoff::Error::transient(crate::source::SourceError::Unavailable(
                            "gap query timed out".to_string(),
                        ))
                    })?
                    .map_err(backoff::Error::transient)?;
                Ok((sub, gap))
            }
        })
        .await;

        let (mut sub, gap) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!("{} feed could not be reopened: {}", kind, e);
                return;
            }
        };

        if !gap.is_empty() {
            debug!("{}: {} gap logs since block {}", kind, gap.len(), from);
            apply_batch(&core, kind, gap, &mut last_block);
        }

        while let Some(batch) = sub.next_batch().await {
            apply_batch(&core, kind, batch, &mut last_block);
        }

        warn!("{} feed closed, reopening", kind);
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: None,
        ..Default::default()
    }
}

fn apply_batch(core: &Core, kind: EventKind, raws: Vec<RawLog>, last_block: &mut u64) {
    for raw in &raws {
        *last_block = (*last_block).max(raw.block_number);
    }
    let records = core.normalizer.normalize_batch(kind, &raws, TimeMs::now());
    if records.is_empty() {
        return;
    }
    debug!("{}: merging {} pushed records", kind, records.len());
    core.apply(move |set| set.insert_batch(records) > 0);
}

/// The engine's record set: sorted newest-first, unique by `source_id`.
#[derive(Debug, Default)]
struct RecordSet {
    records: Vec<StoredRecord>,
    ids: HashSet<String>,
    next_seq: u64,
    revision: u64,
}

#[derive(Debug)]
struct StoredRecord {
    seq: u64,
    record: Record,
}

impl StoredRecord {
    fn key(&self) -> RecordOrderingKey {
        RecordOrderingKey::new(self.record.occurred_at, self.seq)
    }
}

impl RecordSet {
    /// Insert every record whose `source_id` is new; first insertion wins.
    /// Returns the number inserted.
    fn insert_batch(&mut self, batch: Vec<Record>) -> usize {
        let mut inserted = 0;
        for record in batch {
            if !self.ids.insert(record.source_id.clone()) {
                continue;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.records.push(StoredRecord { seq, record });
            inserted += 1;
        }
        if inserted > 0 {
            self.records.sort_by(|a, b| newest_first(&a.key(), &b.key()));
        }
        inserted
    }

    /// Discard everything and re-seed from `batch`.
    fn replace(&mut self, batch: Vec<Record>) {
        self.records.clear();
        self.ids.clear();
        self.insert_batch(batch);
    }

    fn window(&self, offset: usize, count: usize) -> Vec<Record> {
        self.records
            .iter()
            .skip(offset)
            .take(count)
            .map(|s| s.record.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
