//! Canonical ledger event record and the tracked event kinds.

use crate::domain::{Address, Decimal, TimeMs};
use serde::{Deserialize, Serialize};

/// Tracked ledger event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `Deposited(address indexed user, uint256 amount, uint256 timestamp)`
    Deposit,
    /// `Withdrawn(address indexed user, uint256 amount, uint256 timestamp)`
    Withdraw,
    /// `TokensReceived(address indexed user, address receiver, uint256 amount)`
    ///
    /// Carries no on-chain timestamp; records of this kind are stamped with
    /// the engine's observation time.
    CallbackTransfer,
}

impl EventKind {
    /// All tracked kinds, in canonical order.
    pub fn all() -> [EventKind; 3] {
        [
            EventKind::Deposit,
            EventKind::Withdraw,
            EventKind::CallbackTransfer,
        ]
    }

    /// Solidity event name as emitted by the ledger contract.
    pub fn event_name(&self) -> &'static str {
        match self {
            EventKind::Deposit => "Deposited",
            EventKind::Withdraw => "Withdrawn",
            EventKind::CallbackTransfer => "TokensReceived",
        }
    }

    /// Canonical event signature, input to the topic hash.
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::Deposit => "Deposited(address,uint256,uint256)",
            EventKind::Withdraw => "Withdrawn(address,uint256,uint256)",
            EventKind::CallbackTransfer => "TokensReceived(address,address,uint256)",
        }
    }

    /// Whether logs of this kind carry their own timestamp field.
    pub fn carries_timestamp(&self) -> bool {
        !matches!(self, EventKind::CallbackTransfer)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EventKind::Deposit => "deposit",
            EventKind::Withdraw => "withdraw",
            EventKind::CallbackTransfer => "callback_transfer",
        };
        write!(f, "{}", label)
    }
}

/// Canonical representation of one ledger event.
///
/// Immutable once normalized; `source_id` is the deduplication key and is
/// unique within the engine's record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable unique identifier for the underlying log entry.
    ///
    /// Priority: `tx_hash:log_index` > hash of deterministic fields.
    pub source_id: String,
    /// Event kind.
    pub kind: EventKind,
    /// Acting user address.
    pub actor: Address,
    /// Human-scaled exact amount.
    pub amount: Decimal,
    /// Event time in milliseconds since Unix epoch.
    pub occurred_at: TimeMs,
    /// Block the log was emitted in, kept for reconnect gap tracking.
    pub block_number: u64,
    /// Transaction hash when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl Record {
    /// Create a new Record and compute its `source_id`.
    pub fn new(
        kind: EventKind,
        actor: Address,
        amount: Decimal,
        occurred_at: TimeMs,
        block_number: u64,
        log_index: u32,
        tx_hash: Option<String>,
    ) -> Self {
        let tx_hash = normalize_tx_hash(tx_hash);
        let source_id = Self::compute_source_id(
            kind,
            &actor,
            &amount,
            block_number,
            log_index,
            tx_hash.as_deref(),
        );
        Self {
            source_id,
            kind,
            actor,
            amount,
            occurred_at,
            block_number,
            tx_hash,
        }
    }

    /// Compute a stable unique key for this event.
    ///
    /// A transaction can emit more than one tracked event, so the key pairs
    /// the transaction hash with the log position. When the source delivers
    /// no transaction hash, the key falls back to a SHA-256 over the
    /// deterministic fields, truncated to 128 bits; the birthday bound keeps
    /// collisions out of reach for realistic event counts. The observation
    /// timestamp is deliberately excluded so redelivered logs hash alike.
    pub fn compute_source_id(
        kind: EventKind,
        actor: &Address,
        amount: &Decimal,
        block_number: u64,
        log_index: u32,
        tx_hash: Option<&str>,
    ) -> String {
        if let Some(tx) = tx_hash.filter(|s| !s.trim().is_empty()) {
            return format!("{}:{}", tx.trim().to_lowercase(), log_index);
        }

        use sha2::{Digest, Sha256};

        fn hash_var(hasher: &mut Sha256, data: &str) {
            hasher.update((data.len() as u32).to_le_bytes());
            hasher.update(data.as_bytes());
        }

        let mut hasher = Sha256::new();
        hash_var(&mut hasher, kind.event_name());
        hash_var(&mut hasher, actor.as_str());
        hash_var(&mut hasher, &amount.to_canonical_string());
        hasher.update(block_number.to_le_bytes());
        hasher.update(log_index.to_le_bytes());

        let hash = hasher.finalize();
        format!("hash:{}", hex::encode(&hash[..16]))
    }
}

fn normalize_tx_hash(tx_hash: Option<String>) -> Option<String> {
    tx_hash
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
}
