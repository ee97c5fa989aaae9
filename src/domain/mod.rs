//! Domain types and determinism layer for the ledger event engine.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: TimeMs, Address
//! - The canonical Record type and the tracked EventKind set
//! - Stable record ordering for the newest-first reconciled view

pub mod decimal;
pub mod ordering;
pub mod primitives;
pub mod record;

pub use decimal::{Decimal, FixedPointError};
pub use ordering::RecordOrderingKey;
pub use primitives::{Address, TimeMs};
pub use record::{EventKind, Record};
