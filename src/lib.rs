pub mod backfill;
pub mod config;
pub mod domain;
pub mod error;
pub mod normalize;
pub mod pager;
pub mod reconciler;
pub mod source;

pub use backfill::{BackfillFetcher, BackfillOutcome};
pub use config::Config;
pub use domain::{Address, Decimal, EventKind, Record, TimeMs};
pub use error::FetchError;
pub use normalize::{NormalizeError, Normalizer};
pub use pager::Pager;
pub use reconciler::{EngineOptions, EngineState, Reconciler};
pub use source::{LogSource, MockLogSource, RawLog, RpcLogSource, SourceError, Subscription};
