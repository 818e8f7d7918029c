use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AppConfig {
    pub(crate) ledger: LedgerConfig,
    pub(crate) api: ApiConfig,
    pub(crate) scheduler: SchedulerConfig,
    pub(crate) lanes: LanesConfig,
    pub(crate) start_time_file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct LedgerConfig {
    pub(crate) network: String,
    pub(crate) program_id: String,
    pub(crate) initializer_key: String,
    pub(crate) withdrawer_key: String,
    pub(crate) game_token: String,
    pub(crate) rpc_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) cycle_poll_seconds: u64,
    pub(crate) stagger_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct LanesConfig {
    pub(crate) period_hours: Vec<u32>,
    pub(crate) ticket_price: Vec<u64>,
    pub(crate) max_tickets: Vec<u32>,
    pub(crate) dev_fee_bps: Vec<u16>,
}

// Defaults mirror the 10-lane production tables.
const DEFAULT_PERIOD_HOURS: [u32; 10] = [1, 2, 4, 6, 8, 12, 24, 48, 72, 168];
const DEFAULT_TICKET_PRICE: [u64; 10] = [100, 200, 400, 500, 800, 1_000, 2_000, 4_000, 5_000, 10_000];
const DEFAULT_MAX_TICKETS: [u32; 10] = [100, 100, 100, 200, 200, 200, 500, 500, 500, 1_000];
const DEFAULT_DEV_FEE_BPS: [u16; 10] = [500, 500, 500, 500, 500, 500, 500, 500, 500, 500];

pub(crate) fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        ledger: LedgerConfig {
            network: env_required("NETWORK")?,
            program_id: env_required("PROGRAM_ID")?,
            initializer_key: env_required("INITIALIZER_PRIVATE_KEY")?,
            withdrawer_key: env_string("WITHDRAW_PRIVATE_KEY", ""),
            game_token: env_required("GAME_TOKEN")?,
            rpc_timeout_seconds: env_u64("RPC_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("HTTP_PORT", 5005),
        },
        scheduler: SchedulerConfig {
            cycle_poll_seconds: env_u64("CYCLE_POLL_SECS", 60),
            stagger_seconds: env_u64("STAGGER_SECS", 5),
        },
        lanes: LanesConfig {
            period_hours: env_list("LANE_PERIOD_HOURS", &DEFAULT_PERIOD_HOURS)?,
            ticket_price: env_list("LANE_TICKET_PRICE", &DEFAULT_TICKET_PRICE)?,
            max_tickets: env_list("LANE_MAX_TICKETS", &DEFAULT_MAX_TICKETS)?,
            dev_fee_bps: env_list("LANE_DEV_FEE_BPS", &DEFAULT_DEV_FEE_BPS)?,
        },
        start_time_file: env_string("START_TIME_FILE", "start_times.json"),
    };
    if !cfg.ledger.network.starts_with("http") {
        return Err(anyhow!("Invalid NETWORK URL; it must start with http: or https:"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_list<T: std::str::FromStr + Clone>(key: &str, default: &[T]) -> Result<Vec<T>> {
    match std::env::var(key) {
        Ok(raw) => parse_list(&raw, key),
        Err(_) => Ok(default.to_vec()),
    }
}

// A lane table with a dropped entry would silently shift every later
// lane's values, so any unparseable entry is a startup error.
fn parse_list<T: std::str::FromStr>(raw: &str, key: &str) -> Result<Vec<T>> {
    let mut parts = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let value = entry
            .parse::<T>()
            .map_err(|_| anyhow!("invalid entry {entry:?} in {key}"))?;
        parts.push(value);
    }
    if parts.is_empty() {
        return Err(anyhow!("{key} is set but contains no entries"));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parses_trimmed_entries() {
        let prices: Vec<u64> = parse_list("100, 200 ,300", "LANE_TICKET_PRICE").unwrap();
        assert_eq!(prices, vec![100, 200, 300]);
    }

    #[test]
    fn list_rejects_unparseable_entries() {
        let err = parse_list::<u64>("100,abc,300", "LANE_TICKET_PRICE").unwrap_err();
        assert!(err.to_string().contains("\"abc\""));
    }

    #[test]
    fn list_rejects_empty_value() {
        assert!(parse_list::<u32>(" , ", "LANE_PERIOD_HOURS").is_err());
    }
}
