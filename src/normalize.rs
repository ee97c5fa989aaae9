//! Event normalizer: raw logs to canonical records.

use crate::domain::{Address, Decimal, EventKind, Record, TimeMs};
use crate::source::RawLog;
use thiserror::Error;
use tracing::warn;

/// Maps raw logs of any tracked kind into canonical [`Record`]s.
///
/// Pure mapping: the observation clock reading used for timestampless kinds
/// is supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    scale: u32,
}

/// A log that cannot be normalized for its kind.
///
/// One malformed log is a data-integrity anomaly, not a batch failure;
/// batch normalization skips it and keeps the rest.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{kind} log is missing required field `{field}`")]
    MissingField { kind: EventKind, field: &'static str },
    #[error("{kind} log has invalid `{field}`: {reason}")]
    InvalidField {
        kind: EventKind,
        field: &'static str,
        reason: String,
    },
}

impl Normalizer {
    /// Create a normalizer for a token with the given fixed-point scale.
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    /// Normalize one raw log of the given kind.
    ///
    /// `observed_at` is used as `occurred_at` for kinds without an on-chain
    /// timestamp.
    pub fn normalize(
        &self,
        kind: EventKind,
        raw: &RawLog,
        observed_at: TimeMs,
    ) -> Result<Record, NormalizeError> {
        let actor = require_str(kind, raw, "user")?;

        let amount_raw = require_str(kind, raw, "amount")?;
        let amount =
            Decimal::from_fixed_point(amount_raw, self.scale).map_err(|e| {
                NormalizeError::InvalidField {
                    kind,
                    field: "amount",
                    reason: e.to_string(),
                }
            })?;

        let occurred_at = if kind.carries_timestamp() {
            let secs = raw
                .args
                .get("timestamp")
                .and_then(|v| v.as_i64())
                .ok_or(NormalizeError::MissingField {
                    kind,
                    field: "timestamp",
                })?;
            TimeMs::from_secs(secs)
        } else {
            observed_at
        };

        let tx_hash = if raw.tx_hash.trim().is_empty() {
            None
        } else {
            Some(raw.tx_hash.clone())
        };

        Ok(Record::new(
            kind,
            Address::new(actor.to_string()),
            amount,
            occurred_at,
            raw.block_number,
            raw.log_index,
            tx_hash,
        ))
    }

    /// Normalize a batch, skipping malformed entries with a warning.
    pub fn normalize_batch(
        &self,
        kind: EventKind,
        raws: &[RawLog],
        observed_at: TimeMs,
    ) -> Vec<Record> {
        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            match self.normalize(kind, raw, observed_at) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping malformed {} log at block {}: {}", kind, raw.block_number, e);
                }
            }
        }
        records
    }
}

fn require_str<'a>(
    kind: EventKind,
    raw: &'a RawLog,
    field: &'static str,
) -> Result<&'a str, NormalizeError> {
    raw.args
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or(NormalizeError::MissingField { kind, field })
}
