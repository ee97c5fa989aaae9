//! JSON-RPC log source: `eth_getLogs` for history, a polled log filter as
//! the push feed.

use super::{LogSource, RawLog, SourceError, Subscription};
use crate::config::Config;
use crate::domain::EventKind;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Keccak-256 topic hash of a canonical event signature.
pub fn event_topic(signature: &str) -> String {
    use sha3::{Digest, Keccak256};
    format!("0x{}", hex::encode(Keccak256::digest(signature.as_bytes())))
}

/// Log source speaking JSON-RPC over HTTP to an Ethereum-style node.
#[derive(Debug, Clone)]
pub struct RpcLogSource {
    client: Client,
    url: String,
    contract: String,
    poll_interval: Duration,
}

impl RpcLogSource {
    pub fn new(url: String, contract: String, poll_interval: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            contract,
            poll_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.rpc_url.clone(),
            config.contract_address.clone(),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, SourceError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .post(&self.url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(SourceError::Unavailable(e.to_string())))?;

            let status = response.status();
            if status == 429 || status.is_server_error() {
                return Err(backoff::Error::transient(SourceError::Unavailable(
                    format!("HTTP {}", status),
                )));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(SourceError::Unavailable(
                    format!("HTTP {}", status),
                )));
            }

            let body: Value = response.json().await.map_err(|e| {
                backoff::Error::permanent(SourceError::Unavailable(format!(
                    "invalid response: {}",
                    e
                )))
            })?;

            if let Some(error) = body.get("error") {
                let message = error
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown RPC error");
                return Err(backoff::Error::permanent(classify_rpc_error(message)));
            }

            Ok(body.get("result").cloned().unwrap_or(Value::Null))
        })
        .await
    }

    fn topic_for(&self, kind: EventKind) -> String {
        event_topic(kind.signature())
    }

    /// Drain an installed filter until the consumer goes away or the node
    /// keeps failing. A closed feed tells the reconciler to reopen; the
    /// replacement subscription installs a fresh filter.
    async fn poll_filter(&self, kind: EventKind, filter_id: String, tx: mpsc::Sender<Vec<RawLog>>) {
        const MAX_CONSECUTIVE_FAILURES: u32 = 5;
        let mut failures = 0u32;

        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.call("eth_getFilterChanges", json!([filter_id])).await {
                Err(e) => {
                    failures += 1;
                    warn!(
                        "{} filter poll failed ({}/{}): {}",
                        kind, failures, MAX_CONSECUTIVE_FAILURES, e
                    );
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        break;
                    }
                }
                Ok(result) => {
                    failures = 0;
                    let entries = match result.as_array() {
                        Some(entries) => entries,
                        None => continue,
                    };
                    let raws: Vec<RawLog> = entries
                        .iter()
                        .filter_map(|entry| decode_log(kind, entry))
                        .collect();
                    if raws.is_empty() {
                        continue;
                    }
                    if tx.send(raws).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = self.call("eth_uninstallFilter", json!([filter_id])).await;
    }
}

/// Node phrasing varies; anything complaining about query breadth maps to
/// `RangeTooLarge` so the backfill can split the span.
fn classify_rpc_error(message: &str) -> SourceError {
    let lower = message.to_lowercase();
    if lower.contains("range") || lower.contains("too many") || lower.contains("limit") {
        SourceError::RangeTooLarge
    } else {
        SourceError::Unavailable(message.to_string())
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn latest_block(&self) -> Result<u64, SourceError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        result
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| SourceError::Unavailable("malformed eth_blockNumber".to_string()))
    }

    async fn query_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<RawLog>, SourceError> {
        let to = match to_block {
            Some(block) => format!("0x{:x}", block),
            None => "latest".to_string(),
        };
        debug!(
            "Fetching {} logs for blocks [0x{:x}, {}]",
            kind, from_block, to
        );

        let filter = json!({
            "address": self.contract,
            "topics": [self.topic_for(kind)],
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": to
        });
        let result = self.call("eth_getLogs", json!([filter])).await?;

        let entries = result
            .as_array()
            .ok_or_else(|| SourceError::Unavailable("expected array of logs".to_string()))?;

        let mut raws = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_log(kind, entry) {
                Some(raw) => raws.push(raw),
                None => warn!("Skipping undecodable {} log entry", kind),
            }
        }
        Ok(raws)
    }

    async fn subscribe(&self, kind: EventKind) -> Result<Subscription, SourceError> {
        let filter = json!({
            "address": self.contract,
            "topics": [self.topic_for(kind)],
            "fromBlock": "latest"
        });
        let filter_id = self
            .call("eth_newFilter", json!([filter]))
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SourceError::Unavailable("malformed eth_newFilter".to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        let source = self.clone();
        let producer = tokio::spawn(async move {
            source.poll_filter(kind, filter_id, tx).await;
        });
        Ok(Subscription::with_producer(rx, producer))
    }
}

/// Decode one `eth_getLogs` entry into a [`RawLog`].
///
/// Envelope fields are mandatory; a kind-specific field that fails to decode
/// is left out of `args`, and the normalizer reports it.
fn decode_log(kind: EventKind, entry: &Value) -> Option<RawLog> {
    let block_number = entry
        .get("blockNumber")
        .and_then(|v| v.as_str())
        .and_then(parse_hex_u64)?;
    let log_index = entry
        .get("logIndex")
        .and_then(|v| v.as_str())
        .and_then(parse_hex_u64)? as u32;
    let tx_hash = entry
        .get("transactionHash")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let topics: Vec<&str> = entry
        .get("topics")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|t| t.as_str()).collect())
        .unwrap_or_default();
    let data = entry
        .get("data")
        .and_then(|v| v.as_str())
        .map(decode_hex_bytes)
        .unwrap_or_default();

    let mut args = serde_json::Map::new();
    if let Some(user) = topics.get(1).and_then(|t| topic_address(t)) {
        args.insert("user".to_string(), Value::String(user));
    }
    match kind {
        EventKind::Deposit | EventKind::Withdraw => {
            if let Some(amount) = word_u128(&data, 0) {
                args.insert("amount".to_string(), Value::String(amount.to_string()));
            }
            if let Some(timestamp) = word_u128(&data, 1).and_then(|v| i64::try_from(v).ok()) {
                args.insert("timestamp".to_string(), json!(timestamp));
            }
        }
        EventKind::CallbackTransfer => {
            if let Some(receiver) = word_address(&data, 0) {
                args.insert("receiver".to_string(), Value::String(receiver));
            }
            if let Some(amount) = word_u128(&data, 1) {
                args.insert("amount".to_string(), Value::String(amount.to_string()));
            }
        }
    }

    Some(RawLog::new(
        block_number,
        &tx_hash,
        log_index,
        Value::Object(args),
    ))
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn decode_hex_bytes(s: &str) -> Vec<u8> {
    hex::decode(s.trim_start_matches("0x")).unwrap_or_default()
}

fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    let start = index * 32;
    data.get(start..start + 32)
}

/// uint256 word as u128. Values above u128 stay undecoded; they exceed the
/// engine's representable amount range anyway.
fn word_u128(data: &[u8], index: usize) -> Option<u128> {
    let w = word(data, index)?;
    if w[..16].iter().any(|&b| b != 0) {
        return None;
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&w[16..]);
    Some(u128::from_be_bytes(bytes))
}

fn word_address(data: &[u8], index: usize) -> Option<String> {
    let w = word(data, index)?;
    Some(format!("0x{}", hex::encode(&w[12..])))
}

fn topic_address(topic: &str) -> Option<String> {
    let bytes = decode_hex_bytes(topic);
    if bytes.len() != 32 {
        return None;
    }
    Some(format!("0x{}", hex::encode(&bytes[12..])))
}
