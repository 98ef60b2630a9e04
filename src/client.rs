//! Payment lifecycle orchestration
//!
//! [`PaymentClient`] drives a payment from intent to settled transaction:
//! initiate (pure validation), sign (wallet), verify and settle
//! (facilitator), status polling, and the direct-transfer fallback when the
//! facilitator is down.

use crate::config::{PaymentConfig, Registry};
use crate::connector::WalletConnector;
use crate::signer::PaymentSigner;
use crate::transfer::FallbackTransfer;
use crate::types::{
    from_token_units, to_token_units, PaymentDetails, PaymentMetadata, SettleWire,
    SettlementMethod, SignedPayload, StatusWire, TransactionResult, TxStatus, VerifyOutcome,
    PROTOCOL_VERSION,
};
use crate::{Result, X402PayError};
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const PROTOCOL_HEADER: &str = "X-Protocol-Version";

/// Client for executing x402 payments against a facilitator service
pub struct PaymentClient {
    config: PaymentConfig,
    registry: Arc<Registry>,
    connector: Arc<WalletConnector>,
    signer: PaymentSigner,
    fallback: FallbackTransfer,
    http: reqwest::Client,
    /// Terminal statuses already observed per transaction hash. Status
    /// reads never regress below a pinned terminal state, whatever the
    /// facilitator replays.
    terminal: Mutex<HashMap<String, TxStatus>>,
}

impl PaymentClient {
    pub fn new(
        config: PaymentConfig,
        registry: Arc<Registry>,
        connector: Arc<WalletConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| X402PayError::network(format!("Failed to build HTTP client: {}", e)))?;
        let signer = PaymentSigner::new(
            registry.clone(),
            connector.clone(),
            config.verifying_contract.clone(),
        );
        let fallback = FallbackTransfer::with_polling(
            registry.clone(),
            connector.clone(),
            config.confirmation_poll_interval,
            config.confirmation_poll_attempts,
        );
        Ok(Self {
            config,
            registry,
            connector,
            signer,
            fallback,
            http,
            terminal: Mutex::new(HashMap::new()),
        })
    }

    pub fn connector(&self) -> &Arc<WalletConnector> {
        &self.connector
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create a payment intent. Pure validation, no wallet or network I/O.
    ///
    /// `chain` and `token` default to the configured defaults; the amount
    /// must fall within the configured limits.
    pub fn initiate_payment(
        &self,
        amount_usd: Decimal,
        chain: Option<&str>,
        token: Option<&str>,
    ) -> Result<PaymentDetails> {
        let chain = chain.unwrap_or(&self.config.default_chain);
        let token = token.unwrap_or(&self.config.default_token).to_lowercase();

        self.registry.chain(chain)?;
        let token_config = self.registry.token(&token)?;
        self.registry.token_address(&token, chain)?;

        let limits = &self.config.limits;
        if amount_usd < limits.min_amount_usd {
            return Err(X402PayError::validation(format!(
                "Amount {} is below the minimum of {} USD",
                amount_usd, limits.min_amount_usd
            )));
        }
        if amount_usd > limits.max_amount_usd {
            return Err(X402PayError::validation(format!(
                "Amount {} exceeds the maximum of {} USD",
                amount_usd, limits.max_amount_usd
            )));
        }

        let details = PaymentDetails {
            chain: chain.to_string(),
            token,
            to: self.config.recipient.clone(),
            amount: to_token_units(amount_usd, token_config.decimals)?,
            deadline: Utc::now().timestamp()
                + (self.config.default_deadline_minutes * 60) as i64,
            metadata: PaymentMetadata::new(),
        };
        tracing::debug!(
            payment_id = %details.metadata.payment_id,
            chain = %details.chain,
            token = %details.token,
            amount = %details.amount,
            "payment initiated"
        );
        Ok(details)
    }

    /// Sign a payment intent with the connected wallet
    pub async fn sign_payment(&self, details: &PaymentDetails) -> Result<SignedPayload> {
        self.signer.sign_payment(details).await
    }

    /// Token balance of a wallet on a chain, in whole tokens
    pub async fn token_balance(
        &self,
        token: &str,
        wallet: &str,
        chain: &str,
    ) -> Result<Decimal> {
        let token_config = self.registry.token(token)?;
        let address = self.registry.token_address(token, chain)?.to_string();
        let raw = self.fallback.token_balance(&address, wallet).await?;
        from_token_units(&raw.to_string(), token_config.decimals)
    }

    /// Probe the facilitator's health endpoint.
    ///
    /// Never errors: any failure to get a success response reads as
    /// "unhealthy".
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.config.facilitator_base());
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "facilitator unhealthy");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "facilitator unreachable");
                false
            }
        }
    }

    /// Ask the facilitator to verify a signed payload without settling it
    pub async fn verify_payment(&self, payload: &SignedPayload) -> Result<VerifyOutcome> {
        let url = format!("{}/verify", self.config.facilitator_base());
        let response = self
            .http
            .post(&url)
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .json(&json!({ "payload": payload.to_base64()? }))
            .send()
            .await
            .map_err(|e| X402PayError::network(format!("Verify request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(X402PayError::network(format!(
                "Facilitator verify returned {}",
                response.status()
            )));
        }
        let outcome: VerifyOutcome = response
            .json()
            .await
            .map_err(|e| X402PayError::network(format!("Malformed verify response: {}", e)))?;
        Ok(outcome)
    }

    /// Submit a verified payload for on-chain settlement
    pub async fn settle_payment(
        &self,
        payload: &SignedPayload,
        chain: &str,
    ) -> Result<TransactionResult> {
        let chain_config = self.registry.chain(chain)?;
        let url = format!("{}/settle", self.config.facilitator_base());
        let response = self
            .http
            .post(&url)
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .json(&json!({ "payload": payload.to_base64()?, "chain": chain }))
            .send()
            .await
            .map_err(|e| X402PayError::network(format!("Settle request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // A 5xx is a facilitator outage, not a settlement verdict.
            if status.is_server_error() {
                return Err(X402PayError::network(format!(
                    "Facilitator settle returned {}: {}",
                    status, body
                )));
            }
            return Err(X402PayError::settlement(format!(
                "Facilitator rejected settlement ({}): {}",
                status, body
            )));
        }
        let wire: SettleWire = response
            .json()
            .await
            .map_err(|e| X402PayError::network(format!("Malformed settle response: {}", e)))?;

        self.pin_terminal(&wire.tx_hash, wire.status);
        tracing::info!(tx_hash = %wire.tx_hash, status = ?wire.status, "payment settled");
        Ok(TransactionResult {
            explorer_url: chain_config.tx_url(&wire.tx_hash),
            tx_hash: wire.tx_hash,
            status: wire.status,
            block_number: wire.block_number,
            confirmations: None,
            method: SettlementMethod::X402,
        })
    }

    /// Read the settlement status of a transaction.
    ///
    /// Once a terminal status has been observed for a hash, later reads
    /// never report it as pending again.
    pub async fn payment_status(&self, tx_hash: &str, chain: &str) -> Result<TransactionResult> {
        let chain_config = self.registry.chain(chain)?;
        let url = format!(
            "{}/status/{}",
            self.config.facilitator_base(),
            utf8_percent_encode(tx_hash, NON_ALPHANUMERIC)
        );
        let response = self
            .http
            .get(&url)
            .query(&[("chain", chain)])
            .send()
            .await
            .map_err(|e| X402PayError::network(format!("Status request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(X402PayError::network(format!(
                "Facilitator status returned {}",
                response.status()
            )));
        }
        let wire: StatusWire = response
            .json()
            .await
            .map_err(|e| X402PayError::network(format!("Malformed status response: {}", e)))?;

        let status = self.reconcile_status(&wire.tx_hash, wire.status);
        Ok(TransactionResult {
            explorer_url: chain_config.tx_url(&wire.tx_hash),
            tx_hash: wire.tx_hash,
            status,
            block_number: wire.block_number,
            confirmations: wire.confirmations,
            method: SettlementMethod::X402,
        })
    }

    /// Run the full x402 flow: initiate, sign, verify, settle.
    ///
    /// Stops at the first failure; a declined signature never produces a
    /// network call, and a connection change between steps aborts with
    /// [`X402PayError::StaleConnection`].
    pub async fn execute_payment(
        &self,
        amount_usd: Decimal,
        chain: Option<&str>,
        token: Option<&str>,
    ) -> Result<TransactionResult> {
        let details = self.initiate_payment(amount_usd, chain, token)?;
        self.execute_with_details(&details).await
    }

    /// Like [`execute_payment`](Self::execute_payment), but falls back to a
    /// direct token transfer when the facilitator health probe fails.
    ///
    /// The fallback decision is taken once, up front; errors on the chosen
    /// path propagate rather than silently re-routing.
    pub async fn execute_payment_with_fallback(
        &self,
        amount_usd: Decimal,
        chain: Option<&str>,
        token: Option<&str>,
    ) -> Result<TransactionResult> {
        let details = self.initiate_payment(amount_usd, chain, token)?;
        if self.check_health().await {
            self.execute_with_details(&details).await
        } else {
            tracing::warn!(
                payment_id = %details.metadata.payment_id,
                "facilitator unavailable, falling back to direct transfer"
            );
            self.fallback.transfer(&details).await
        }
    }

    async fn execute_with_details(&self, details: &PaymentDetails) -> Result<TransactionResult> {
        let epoch = self.connector.connection_epoch();
        let payload = self.signer.sign_payment(details).await?;

        self.connector.ensure_current(epoch)?;
        let outcome = self.verify_payment(&payload).await?;
        if !outcome.valid {
            return Err(X402PayError::verification_failed(
                outcome
                    .reason
                    .unwrap_or_else(|| "payload rejected".to_string()),
            ));
        }

        self.connector.ensure_current(epoch)?;
        self.settle_payment(&payload, &details.chain).await
    }

    fn pin_terminal(&self, tx_hash: &str, status: TxStatus) {
        if status.is_terminal() {
            self.terminal
                .lock()
                .unwrap()
                .insert(tx_hash.to_string(), status);
        }
    }

    fn reconcile_status(&self, tx_hash: &str, reported: TxStatus) -> TxStatus {
        let mut terminal = self.terminal.lock().unwrap();
        match terminal.get(tx_hash) {
            Some(&pinned) if !reported.is_terminal() => {
                tracing::warn!(
                    tx_hash,
                    ?pinned,
                    ?reported,
                    "facilitator reported a regressed status; keeping terminal state"
                );
                pinned
            }
            _ => {
                if reported.is_terminal() {
                    terminal.insert(tx_hash.to_string(), reported);
                }
                reported
            }
        }
    }
}
