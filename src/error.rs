use thiserror::Error;

/// Failures surfaced to the consumer from `start` and `refresh`.
///
/// All variants are retryable by calling the failed operation again; the
/// engine never replaces the record set on a failed pass.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("log source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("range query timed out after {0}ms")]
    Timeout(u64),
    #[error("blocks [{from}, {to}] rejected as too large and cannot be split further")]
    RangeExhausted { from: u64, to: u64 },
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine is not live")]
    NotLive,
}
