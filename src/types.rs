//! Core types for the x402 payment lifecycle

use crate::{Result, X402PayError};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Wire protocol version sent as `X-Protocol-Version` on verify/settle
pub const PROTOCOL_VERSION: &str = "1.0";

/// Envelope version embedded in payment metadata
pub const PAYLOAD_VERSION: &str = "1.0";

/// Status of a settlement transaction
///
/// Transitions are monotonic: once a transaction is reported `Confirmed` or
/// `Failed` it never goes back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    /// Terminal statuses never revert
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }
}

impl Default for TxStatus {
    fn default() -> Self {
        TxStatus::Pending
    }
}

/// How a payment reached the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementMethod {
    /// Settled by the facilitator from a signed payment intent
    #[serde(rename = "x402")]
    X402,
    /// Direct ERC-20 transfer submitted by the wallet (fallback path)
    #[serde(rename = "direct")]
    Direct,
}

/// Metadata attached to a payment intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    #[serde(rename = "paymentId")]
    pub payment_id: Uuid,
    #[serde(rename = "initiatedAt")]
    pub initiated_at: DateTime<Utc>,
    pub version: String,
}

impl PaymentMetadata {
    pub fn new() -> Self {
        Self {
            payment_id: Uuid::new_v4(),
            initiated_at: Utc::now(),
            version: PAYLOAD_VERSION.to_string(),
        }
    }
}

impl Default for PaymentMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A payment intent, immutable once created
///
/// Created by [`crate::client::PaymentClient::initiate_payment`]. A fresh one
/// must be created if the deadline lapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDetails {
    /// Registry name of the target chain
    pub chain: String,
    /// Lowercase token symbol
    pub token: String,
    /// Recipient wallet address
    pub to: String,
    /// Amount in the token's minor units, as a decimal integer string
    pub amount: String,
    /// Unix seconds after which the intent is no longer settleable
    pub deadline: i64,
    pub metadata: PaymentMetadata,
}

impl PaymentDetails {
    /// Whether the settlement deadline has lapsed
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.deadline
    }
}

/// The EIP-712 `Payment` message that gets signed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMessage {
    /// Recipient wallet address
    pub to: String,
    /// Amount in minor units (uint256, decimal string)
    pub amount: String,
    /// Token contract address
    pub token: String,
    /// Unix seconds (uint256)
    pub deadline: u64,
    /// Unique per signing call (uint256, 0x-prefixed hex)
    pub nonce: String,
}

/// Signed payment payload, the versioned wire envelope sent to the facilitator
///
/// Consumed exactly once by verify/settle and treated as opaque after
/// base64 encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub payment: PaymentMessage,
    pub signature: String,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
    /// Unix seconds at signing time
    pub timestamp: i64,
}

impl SignedPayload {
    /// Encode the payload to its base64(JSON) wire form
    pub fn to_base64(&self) -> Result<String> {
        use base64::{engine::general_purpose, Engine as _};
        let json = serde_json::to_string(self)?;
        Ok(general_purpose::STANDARD.encode(json))
    }

    /// Decode a base64-encoded payload
    pub fn from_base64(encoded: &str) -> Result<Self> {
        use base64::{engine::general_purpose, Engine as _};
        let decoded = general_purpose::STANDARD.decode(encoded)?;
        let payload: SignedPayload = serde_json::from_slice(&decoded)?;
        Ok(payload)
    }
}

/// Facilitator verification outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    #[serde(default)]
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Raw settle response body from the facilitator
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SettleWire {
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    #[serde(default)]
    pub status: TxStatus,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<u64>,
}

/// Raw status response body from the facilitator
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatusWire {
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    #[serde(default)]
    pub status: TxStatus,
    pub confirmations: Option<u64>,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<u64>,
}

/// Result of a settlement or status poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResult {
    #[serde(rename = "txHash")]
    pub tx_hash: String,
    pub status: TxStatus,
    #[serde(rename = "blockNumber", skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
    #[serde(rename = "explorerUrl")]
    pub explorer_url: String,
    pub method: SettlementMethod,
}

/// Convert a USD amount to the token's minor units, truncating (never
/// rounding up) any fraction below one minor unit.
///
/// For USDC (6 decimals): 1 USD = 1_000_000 units.
pub fn to_token_units(amount_usd: Decimal, decimals: u8) -> Result<String> {
    if amount_usd <= Decimal::ZERO {
        return Err(X402PayError::validation("Payment amount must be positive"));
    }
    let scaled = amount_usd
        .checked_mul(unit_factor(decimals)?)
        .ok_or_else(|| X402PayError::validation("Payment amount is too large"))?;
    Ok(scaled.trunc().normalize().to_string())
}

/// Convert minor units back to a USD-denominated decimal amount
pub fn from_token_units(units: &str, decimals: u8) -> Result<Decimal> {
    let amount = Decimal::from_str(units)
        .map_err(|_| X402PayError::validation(format!("Invalid token amount: {}", units)))?;
    Ok((amount / unit_factor(decimals)?).normalize())
}

fn unit_factor(decimals: u8) -> Result<Decimal> {
    if decimals > 28 {
        return Err(X402PayError::config(format!(
            "Token decimals out of range: {}",
            decimals
        )));
    }
    Ok(Decimal::from_i128_with_scale(
        10i128.pow(decimals as u32),
        0,
    ))
}

/// Format a USD amount for display: `$12.34`
pub fn format_usd(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("${:.2}", rounded)
}

/// Format a token amount in minor units for display: `12.34 USDC`
pub fn format_token_amount(units: &str, decimals: u8, symbol: &str) -> Result<String> {
    let amount = from_token_units(units, decimals)?;
    Ok(format!("{} {}", amount, symbol.to_uppercase()))
}

/// Shorten a wallet address for display: `0x1234...5678`
pub fn format_address(address: &str, chars: usize) -> String {
    if address.len() <= chars * 2 + 2 {
        return address.to_string();
    }
    format!(
        "{}...{}",
        &address[..chars + 2],
        &address[address.len() - chars..]
    )
}

/// Whether a string is a well-formed Ethereum address
pub fn is_valid_eth_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}
