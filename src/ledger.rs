use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::LedgerConfig;

/// One time-boxed lottery instance, owned and mutated only by the on-chain
/// program. The orchestrator references rounds by lane period + max id, never
/// by a stored identifier across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Round {
    pub(crate) id: u64,
    pub(crate) lane_index: u8,
    pub(crate) period_secs: i64,
    #[serde(default)]
    pub(crate) participants: Vec<String>,
    #[serde(default)]
    pub(crate) winners: Vec<String>,
    pub(crate) state: RoundState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum RoundState {
    Open,
    Ended,
    Settled,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GlobalState {
    pub(crate) initialized: bool,
}

/// Classified outcome of an end-round call. The orchestrator branches on
/// these tags only; wording of remote errors never leaves the adapter.
#[derive(Debug, Clone)]
pub(crate) enum EndOutcome {
    Ended { winners: Vec<String> },
    AlreadyEnded,
    NotEnoughParticipants,
}

#[derive(Debug, Error)]
pub(crate) enum LedgerError {
    #[error("transient ledger error: {0}")]
    Transient(String),
    #[error("ledger error: {0}")]
    Unknown(String),
}

#[async_trait]
pub(crate) trait LedgerClient: Send + Sync {
    async fn query_global_state(&self) -> Result<GlobalState, LedgerError>;
    async fn create_global_bookkeeping(&self) -> Result<(), LedgerError>;
    async fn query_open_rounds(&self) -> Result<Vec<Round>, LedgerError>;
    async fn query_round_counter(&self) -> Result<u64, LedgerError>;
    #[allow(clippy::too_many_arguments)]
    async fn create_round(
        &self,
        id: u64,
        lane_index: u8,
        period_secs: i64,
        ticket_price: u64,
        max_tickets: u32,
        dev_fee_bps: u16,
        start_time_ms: i64,
    ) -> Result<(), LedgerError>;
    async fn end_round(&self, round: &Round) -> Result<EndOutcome, LedgerError>;
    async fn payout_prize(
        &self,
        round: &Round,
        winner1_account: &str,
        winner2_account: &str,
        winner3_account: &str,
    ) -> Result<(), LedgerError>;
    async fn refund(&self, round: &Round, participant_account: &str) -> Result<(), LedgerError>;
    async fn set_round_state(&self, round: &Round, state: RoundState) -> Result<(), LedgerError>;
    async fn resolve_or_create_token_account(&self, owner_pubkey: &str) -> Result<String, LedgerError>;
}

// Program error codes reported by the gateway (custom errors start at 6000).
const CODE_ALREADY_ENDED: i64 = 6001;
const CODE_NOT_ENOUGH_PARTICIPANTS: i64 = 6002;

#[derive(Debug, Deserialize)]
struct GatewayEnvelope {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// HTTP adapter against the ledger gateway. All remote error classification
/// lives here: structured program codes first, message keywords as fallback.
pub(crate) struct GatewayLedgerClient {
    http: Client,
    endpoint: String,
    program_id: String,
    admin_key: String,
    withdraw_key: String,
    game_token: String,
}

impl GatewayLedgerClient {
    pub(crate) fn new(cfg: &LedgerConfig) -> Result<Self, LedgerError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.rpc_timeout_seconds))
            .build()
            .map_err(|e| LedgerError::Unknown(format!("http client: {e}")))?;
        // Payouts and refunds are signed by the withdraw authority when one
        // is configured; everything else uses the initializer key.
        let withdraw_key = if cfg.withdrawer_key.is_empty() {
            cfg.initializer_key.clone()
        } else {
            cfg.withdrawer_key.clone()
        };
        Ok(Self {
            http,
            endpoint: format!("{}/rpc", cfg.network.trim_end_matches('/')),
            program_id: cfg.program_id.clone(),
            admin_key: cfg.initializer_key.clone(),
            withdraw_key,
            game_token: cfg.game_token.clone(),
        })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, LedgerError> {
        let body = json!({
            "program": self.program_id,
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(LedgerError::Transient(format!("gateway status {status}")));
        }
        if !status.is_success() {
            return Err(LedgerError::Unknown(format!("gateway status {status}")));
        }
        let envelope: GatewayEnvelope = resp.json().await.map_err(from_reqwest)?;
        if let Some(err) = envelope.error {
            return Err(LedgerError::Unknown(format!("{} (code {})", err.message, err.code)));
        }
        envelope
            .result
            .ok_or_else(|| LedgerError::Unknown("gateway reply had no result".to_string()))
    }

    async fn call_end(&self, params: serde_json::Value) -> Result<EndOutcome, LedgerError> {
        let body = json!({
            "program": self.program_id,
            "method": "end_lottery",
            "params": params,
        });
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(LedgerError::Transient(format!("gateway status {status}")));
        }
        if !status.is_success() {
            return Err(LedgerError::Unknown(format!("gateway status {status}")));
        }
        let envelope: GatewayEnvelope = resp.json().await.map_err(from_reqwest)?;
        if let Some(err) = envelope.error {
            return classify_end_error(err.code, &err.message);
        }
        let winners = envelope
            .result
            .as_ref()
            .and_then(|r| r.get("winners"))
            .and_then(|w| serde_json::from_value::<Vec<String>>(w.clone()).ok())
            .unwrap_or_default();
        Ok(EndOutcome::Ended { winners })
    }
}

fn from_reqwest(e: reqwest::Error) -> LedgerError {
    if e.is_timeout() || e.is_connect() {
        LedgerError::Transient(e.to_string())
    } else {
        LedgerError::Unknown(e.to_string())
    }
}

fn classify_end_error(code: i64, message: &str) -> Result<EndOutcome, LedgerError> {
    match code {
        CODE_ALREADY_ENDED => return Ok(EndOutcome::AlreadyEnded),
        CODE_NOT_ENOUGH_PARTICIPANTS => return Ok(EndOutcome::NotEnoughParticipants),
        _ => {}
    }
    // Older gateways omit codes; fall back on the message once, here only.
    let lower = message.to_ascii_lowercase();
    if lower.contains("already ended") {
        Ok(EndOutcome::AlreadyEnded)
    } else if lower.contains("not enough") {
        Ok(EndOutcome::NotEnoughParticipants)
    } else {
        Err(LedgerError::Unknown(format!("{message} (code {code})")))
    }
}

#[async_trait]
impl LedgerClient for GatewayLedgerClient {
    async fn query_global_state(&self) -> Result<GlobalState, LedgerError> {
        let result = self.call("get_global_state", json!({"admin": self.admin_key})).await?;
        serde_json::from_value(result).map_err(|e| LedgerError::Unknown(format!("global state decode: {e}")))
    }

    async fn create_global_bookkeeping(&self) -> Result<(), LedgerError> {
        self.call(
            "initialize",
            json!({"admin": self.admin_key, "game_token": self.game_token}),
        )
        .await
        .map(|_| ())
    }

    async fn query_open_rounds(&self) -> Result<Vec<Round>, LedgerError> {
        let result = self.call("get_open_lotteries", json!({})).await?;
        serde_json::from_value(result).map_err(|e| LedgerError::Unknown(format!("rounds decode: {e}")))
    }

    async fn query_round_counter(&self) -> Result<u64, LedgerError> {
        let result = self.call("get_lottery_counter", json!({})).await?;
        result
            .get("count")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| LedgerError::Unknown("counter reply had no count".to_string()))
    }

    async fn create_round(
        &self,
        id: u64,
        lane_index: u8,
        period_secs: i64,
        ticket_price: u64,
        max_tickets: u32,
        dev_fee_bps: u16,
        start_time_ms: i64,
    ) -> Result<(), LedgerError> {
        self.call(
            "create_lottery",
            json!({
                "admin": self.admin_key,
                "id": id,
                "time_frame_index": lane_index,
                "time_frame": period_secs,
                "ticket_price": ticket_price,
                "max_tickets": max_tickets,
                "dev_fee_bps": dev_fee_bps,
                "start_time_ms": start_time_ms,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn end_round(&self, round: &Round) -> Result<EndOutcome, LedgerError> {
        self.call_end(json!({"admin": self.admin_key, "id": round.id})).await
    }

    async fn payout_prize(
        &self,
        round: &Round,
        winner1_account: &str,
        winner2_account: &str,
        winner3_account: &str,
    ) -> Result<(), LedgerError> {
        self.call(
            "prize_distribution",
            json!({
                "authority": self.withdraw_key,
                "id": round.id,
                "winner1_token_account": winner1_account,
                "winner2_token_account": winner2_account,
                "winner3_token_account": winner3_account,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn refund(&self, round: &Round, participant_account: &str) -> Result<(), LedgerError> {
        self.call(
            "refund",
            json!({"authority": self.withdraw_key, "id": round.id, "participant_token_account": participant_account}),
        )
        .await
        .map(|_| ())
    }

    async fn set_round_state(&self, round: &Round, state: RoundState) -> Result<(), LedgerError> {
        self.call(
            "set_lottery_state",
            json!({"admin": self.admin_key, "id": round.id, "state": state}),
        )
        .await
        .map(|_| ())
    }

    async fn resolve_or_create_token_account(&self, owner_pubkey: &str) -> Result<String, LedgerError> {
        let result = self
            .call(
                "resolve_token_account",
                json!({"owner": owner_pubkey, "mint": self.game_token, "payer": self.admin_key}),
            )
            .await?;
        result
            .get("address")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| LedgerError::Unknown("token account reply had no address".to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_error_classifies_by_code() {
        assert!(matches!(
            classify_end_error(CODE_ALREADY_ENDED, "whatever"),
            Ok(EndOutcome::AlreadyEnded)
        ));
        assert!(matches!(
            classify_end_error(CODE_NOT_ENOUGH_PARTICIPANTS, "whatever"),
            Ok(EndOutcome::NotEnoughParticipants)
        ));
    }

    #[test]
    fn end_error_falls_back_on_message_keywords() {
        assert!(matches!(
            classify_end_error(0, "Lottery Already Ended"),
            Ok(EndOutcome::AlreadyEnded)
        ));
        assert!(matches!(
            classify_end_error(0, "Not enough tickets sold"),
            Ok(EndOutcome::NotEnoughParticipants)
        ));
        assert!(matches!(
            classify_end_error(0, "account constraint violated"),
            Err(LedgerError::Unknown(_))
        ));
    }

    #[test]
    fn round_state_serializes_screaming_snake() {
        let s = serde_json::to_string(&RoundState::Open).unwrap();
        assert_eq!(s, "\"OPEN\"");
    }
}
