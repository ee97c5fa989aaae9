use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub contract_address: String,
    pub token_decimals: u32,
    pub from_block: u64,
    pub poll_interval_ms: u64,
    pub backfill_timeout_ms: u64,
    pub page_size: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let rpc_url = env_map
            .get("RPC_URL")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("RPC_URL".to_string()))?;

        let contract_address = env_map
            .get("CONTRACT_ADDRESS")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("CONTRACT_ADDRESS".to_string()))?;

        let token_decimals = parse_with_default(&env_map, "TOKEN_DECIMALS", 18u32)?;
        let from_block = parse_with_default(&env_map, "FROM_BLOCK", 0u64)?;
        let poll_interval_ms = parse_with_default(&env_map, "POLL_INTERVAL_MS", 2000u64)?;
        let backfill_timeout_ms = parse_with_default(&env_map, "BACKFILL_TIMEOUT_MS", 30_000u64)?;
        let page_size = parse_with_default(&env_map, "PAGE_SIZE", 20usize)?;

        if page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "PAGE_SIZE".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            rpc_url,
            contract_address,
            token_decimals,
            from_block,
            poll_interval_ms,
            backfill_timeout_ms,
            page_size,
        })
    }
}

fn parse_with_default<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        None => Ok(default),
        Some(s) => s.parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(key.to_string(), format!("cannot parse `{}`", s))
        }),
    }
}
