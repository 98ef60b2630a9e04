//! Direct ERC-20 transfer fallback
//!
//! When the facilitator is down, payments fall back to a plain `transfer`
//! submitted through the wallet. The transfer is pre-flighted with a
//! `balanceOf` check so an underfunded signer fails before a wallet prompt
//! ever appears, then confirmed by polling for the transaction receipt.

use crate::config::Registry;
use crate::connector::{hex_quantity, WalletConnector};
use crate::types::{
    from_token_units, to_token_units, PaymentDetails, PaymentMetadata, SettlementMethod,
    TransactionResult, TxStatus,
};
use crate::{Result, X402PayError};
use chrono::Utc;
use ethereum_types::U256;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

// ERC-20 function selectors
const SELECTOR_BALANCE_OF: &str = "0x70a08231";
const SELECTOR_TRANSFER: &str = "0xa9059cbb";
const SELECTOR_ALLOWANCE: &str = "0xdd62ed3e";
const SELECTOR_APPROVE: &str = "0x095ea7b3";

/// ABI-encode an address as a 32-byte word
fn encode_address(address: &str) -> Result<String> {
    let hex = address
        .strip_prefix("0x")
        .filter(|h| h.len() == 40 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| X402PayError::validation(format!("Invalid address: {}", address)))?;
    Ok(format!("{:0>64}", hex.to_lowercase()))
}

/// ABI-encode a decimal amount string as a uint256 word
fn encode_u256(amount: &str) -> Result<String> {
    let value = U256::from_dec_str(amount)
        .map_err(|_| X402PayError::validation(format!("Invalid token amount: {}", amount)))?;
    Ok(format!("{:064x}", value))
}

/// `balanceOf(address)` calldata
pub(crate) fn balance_of_call(holder: &str) -> Result<String> {
    Ok(format!("{}{}", SELECTOR_BALANCE_OF, encode_address(holder)?))
}

/// `transfer(address,uint256)` calldata
pub(crate) fn transfer_call(to: &str, amount: &str) -> Result<String> {
    Ok(format!(
        "{}{}{}",
        SELECTOR_TRANSFER,
        encode_address(to)?,
        encode_u256(amount)?
    ))
}

/// `allowance(address,address)` calldata
pub(crate) fn allowance_call(owner: &str, spender: &str) -> Result<String> {
    Ok(format!(
        "{}{}{}",
        SELECTOR_ALLOWANCE,
        encode_address(owner)?,
        encode_address(spender)?
    ))
}

/// `approve(address,uint256)` calldata
pub(crate) fn approve_call(spender: &str, amount: &str) -> Result<String> {
    Ok(format!(
        "{}{}{}",
        SELECTOR_APPROVE,
        encode_address(spender)?,
        encode_u256(amount)?
    ))
}

/// Submits token transfers directly through the connected wallet
pub struct FallbackTransfer {
    registry: Arc<Registry>,
    connector: Arc<WalletConnector>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl FallbackTransfer {
    pub fn new(registry: Arc<Registry>, connector: Arc<WalletConnector>) -> Self {
        Self::with_polling(registry, connector, Duration::from_secs(2), 60)
    }

    pub fn with_polling(
        registry: Arc<Registry>,
        connector: Arc<WalletConnector>,
        poll_interval: Duration,
        poll_attempts: u32,
    ) -> Self {
        Self {
            registry,
            connector,
            poll_interval,
            poll_attempts,
        }
    }

    /// Current token balance of a holder, in minor units
    pub async fn token_balance(&self, token_address: &str, holder: &str) -> Result<U256> {
        let provider = self.connector.provider_handle()?;
        let data = balance_of_call(holder)?;
        let response = provider
            .request(
                "eth_call",
                json!([{ "to": token_address, "data": data }, "latest"]),
            )
            .await?;
        hex_quantity(&response)
    }

    /// Current allowance granted by `owner` to `spender`, in minor units
    pub async fn allowance(
        &self,
        token_address: &str,
        owner: &str,
        spender: &str,
    ) -> Result<U256> {
        let provider = self.connector.provider_handle()?;
        let data = allowance_call(owner, spender)?;
        let response = provider
            .request(
                "eth_call",
                json!([{ "to": token_address, "data": data }, "latest"]),
            )
            .await?;
        hex_quantity(&response)
    }

    /// Submit an `approve` for `spender`, returning the transaction hash
    pub async fn approve(
        &self,
        token_address: &str,
        spender: &str,
        amount: &str,
    ) -> Result<String> {
        let connection = self
            .connector
            .connection()
            .ok_or_else(|| X402PayError::validation("No wallet connected"))?;
        let provider = self.connector.provider_handle()?;
        let data = approve_call(spender, amount)?;
        let response = provider
            .request(
                "eth_sendTransaction",
                json!([{
                    "from": connection.address,
                    "to": token_address,
                    "data": data,
                }]),
            )
            .await?;
        tx_hash_from(&response)
    }

    /// Send a USD-denominated amount of a token straight to a recipient.
    ///
    /// Convenience wrapper that builds a one-hour payment intent and runs
    /// [`transfer`](Self::transfer).
    pub async fn send_token_direct(
        &self,
        token: &str,
        recipient: &str,
        amount_usd: Decimal,
        chain: &str,
    ) -> Result<TransactionResult> {
        let token_config = self.registry.token(token)?;
        let details = PaymentDetails {
            chain: chain.to_string(),
            token: token.to_lowercase(),
            to: recipient.to_string(),
            amount: to_token_units(amount_usd, token_config.decimals)?,
            deadline: Utc::now().timestamp() + 3600,
            metadata: PaymentMetadata::new(),
        };
        self.transfer(&details).await
    }

    /// Transfer the payment amount straight to the recipient.
    ///
    /// Pre-flights the signer's balance, submits the transfer, then polls
    /// for the receipt. A mined-but-reverted transfer comes back as a
    /// [`TxStatus::Failed`] result rather than an error so the caller still
    /// gets the transaction hash.
    pub async fn transfer(&self, details: &PaymentDetails) -> Result<TransactionResult> {
        let connection = self
            .connector
            .connection()
            .ok_or_else(|| X402PayError::validation("No wallet connected"))?;
        let chain = self.registry.chain(&details.chain)?;
        let token = self.registry.token(&details.token)?;
        let token_address = self
            .registry
            .token_address(&details.token, &details.chain)?
            .to_string();

        let required = U256::from_dec_str(&details.amount)
            .map_err(|_| X402PayError::validation(format!("Invalid amount: {}", details.amount)))?;
        let available = self.token_balance(&token_address, &connection.address).await?;
        if available < required {
            return Err(X402PayError::InsufficientBalance {
                token: token.symbol.to_uppercase(),
                available: from_token_units(&available.to_string(), token.decimals)?.to_string(),
                required: from_token_units(&details.amount, token.decimals)?.to_string(),
            });
        }

        let provider = self.connector.provider_handle()?;
        let data = transfer_call(&details.to, &details.amount)?;
        let response = provider
            .request(
                "eth_sendTransaction",
                json!([{
                    "from": connection.address,
                    "to": token_address,
                    "data": data,
                }]),
            )
            .await?;
        let tx_hash = tx_hash_from(&response)?;
        tracing::info!(
            payment_id = %details.metadata.payment_id,
            tx_hash = %tx_hash,
            "direct transfer submitted"
        );

        let receipt = self.wait_for_receipt(&tx_hash).await?;
        let status = match receipt["status"].as_str() {
            Some("0x1") => TxStatus::Confirmed,
            _ => TxStatus::Failed,
        };
        let block_number = receipt["blockNumber"]
            .as_str()
            .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok());

        Ok(TransactionResult {
            explorer_url: chain.tx_url(&tx_hash),
            tx_hash,
            status,
            block_number,
            confirmations: matches!(status, TxStatus::Confirmed).then_some(1),
            method: SettlementMethod::Direct,
        })
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<Value> {
        let provider = self.connector.provider_handle()?;
        for attempt in 0..self.poll_attempts {
            let receipt = provider
                .request("eth_getTransactionReceipt", json!([tx_hash]))
                .await?;
            if !receipt.is_null() {
                return Ok(receipt);
            }
            tracing::debug!(tx_hash, attempt, "transaction not yet mined");
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(X402PayError::settlement(format!(
            "Transaction {} not confirmed after {} attempts",
            tx_hash, self.poll_attempts
        )))
    }
}

fn tx_hash_from(response: &Value) -> Result<String> {
    response
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| X402PayError::network("malformed transaction hash response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryStore;
    use crate::provider::mock::MockProvider;
    use crate::provider::WalletProvider;
    use crate::types::PaymentMetadata;
    use chrono::Utc;

    const RECIPIENT: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";
    const SENDER: &str = "0x857b06519E91e3A54538791bDbb0E22373e36b66";
    const USDC_BASE: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

    fn sample_details() -> PaymentDetails {
        PaymentDetails {
            chain: "base".to_string(),
            token: "usdc".to_string(),
            to: RECIPIENT.to_string(),
            amount: "10000000".to_string(), // 10 USDC
            deadline: Utc::now().timestamp() + 3600,
            metadata: PaymentMetadata::new(),
        }
    }

    async fn connected_transfer(provider: Arc<MockProvider>) -> FallbackTransfer {
        provider.expect("eth_requestAccounts", Ok(json!([SENDER])));
        provider.expect("eth_chainId", Ok(json!("0x2105")));
        let registry = Arc::new(Registry::defaults());
        let connector = WalletConnector::new(
            Some(provider as Arc<dyn WalletProvider>),
            registry.clone(),
            Arc::new(MemoryStore::new()),
        );
        connector.connect().await.unwrap();
        FallbackTransfer::with_polling(registry, connector, Duration::from_millis(1), 3)
    }

    #[test]
    fn test_calldata_encoding() {
        let data = transfer_call(RECIPIENT, "1000000").unwrap();
        assert_eq!(
            data,
            "0xa9059cbb\
             000000000000000000000000209693bc6afc0c5328ba36faf03c514ef312287c\
             00000000000000000000000000000000000000000000000000000000000f4240"
        );

        let data = balance_of_call(SENDER).unwrap();
        assert!(data.starts_with("0x70a08231"));
        assert_eq!(data.len(), 10 + 64);

        assert!(encode_address("0x1234").is_err());
        assert!(encode_u256("not-a-number").is_err());
    }

    #[test]
    fn test_approve_and_allowance_calldata() {
        let data = approve_call(RECIPIENT, "5000000").unwrap();
        assert!(data.starts_with("0x095ea7b3"));
        assert_eq!(data.len(), 10 + 64 * 2);

        let data = allowance_call(SENDER, RECIPIENT).unwrap();
        assert!(data.starts_with("0xdd62ed3e"));
        assert_eq!(data.len(), 10 + 64 * 2);
    }

    #[tokio::test]
    async fn test_insufficient_balance_names_amounts() {
        let provider = Arc::new(MockProvider::new());
        // 3.5 USDC available, 10 required.
        provider.expect("eth_call", Ok(json!("0x3567e0")));
        let transfer = connected_transfer(provider.clone()).await;

        let err = transfer.transfer(&sample_details()).await.unwrap_err();
        match err {
            X402PayError::InsufficientBalance {
                token,
                available,
                required,
            } => {
                assert_eq!(token, "USDC");
                assert_eq!(available, "3.5");
                assert_eq!(required, "10");
            }
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
        // The wallet never saw a transaction prompt.
        assert_eq!(provider.call_count("eth_sendTransaction"), 0);
    }

    #[tokio::test]
    async fn test_transfer_confirmed() {
        let provider = Arc::new(MockProvider::new());
        provider.expect("eth_call", Ok(json!("0x5f5e100"))); // 100 USDC
        provider.expect("eth_sendTransaction", Ok(json!("0xabc123")));
        provider.expect("eth_getTransactionReceipt", Ok(Value::Null));
        provider.expect(
            "eth_getTransactionReceipt",
            Ok(json!({ "status": "0x1", "blockNumber": "0x12" })),
        );
        let transfer = connected_transfer(provider.clone()).await;

        let result = transfer.transfer(&sample_details()).await.unwrap();
        assert_eq!(result.tx_hash, "0xabc123");
        assert_eq!(result.status, TxStatus::Confirmed);
        assert_eq!(result.block_number, Some(0x12));
        assert_eq!(result.method, SettlementMethod::Direct);
        assert_eq!(result.explorer_url, "https://basescan.org/tx/0xabc123");

        // The transfer went to the token contract, from the signer.
        let send = &provider.calls_of("eth_sendTransaction")[0];
        assert_eq!(send[0]["to"], json!(USDC_BASE));
        assert_eq!(send[0]["from"], json!(SENDER));
    }

    #[tokio::test]
    async fn test_reverted_transfer_is_a_failed_result() {
        let provider = Arc::new(MockProvider::new());
        provider.expect("eth_call", Ok(json!("0x5f5e100")));
        provider.expect("eth_sendTransaction", Ok(json!("0xdead")));
        provider.expect(
            "eth_getTransactionReceipt",
            Ok(json!({ "status": "0x0", "blockNumber": "0x10" })),
        );
        let transfer = connected_transfer(provider).await;

        let result = transfer.transfer(&sample_details()).await.unwrap();
        assert_eq!(result.status, TxStatus::Failed);
        assert_eq!(result.tx_hash, "0xdead");
        assert_eq!(result.confirmations, None);
    }

    #[tokio::test]
    async fn test_receipt_polling_gives_up() {
        let provider = Arc::new(MockProvider::new());
        provider.expect("eth_call", Ok(json!("0x5f5e100")));
        provider.expect("eth_sendTransaction", Ok(json!("0xslow")));
        for _ in 0..3 {
            provider.expect("eth_getTransactionReceipt", Ok(Value::Null));
        }
        let transfer = connected_transfer(provider).await;

        assert!(matches!(
            transfer.transfer(&sample_details()).await.unwrap_err(),
            X402PayError::Settlement { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_token_direct_converts_usd() {
        let provider = Arc::new(MockProvider::new());
        provider.expect("eth_call", Ok(json!("0x5f5e100")));
        provider.expect("eth_sendTransaction", Ok(json!("0xusd")));
        provider.expect(
            "eth_getTransactionReceipt",
            Ok(json!({ "status": "0x1", "blockNumber": "0x9" })),
        );
        let transfer = connected_transfer(provider.clone()).await;

        let amount = Decimal::from_str_exact("12.34").unwrap();
        let result = transfer
            .send_token_direct("usdc", RECIPIENT, amount, "base")
            .await
            .unwrap();
        assert_eq!(result.status, TxStatus::Confirmed);

        // 12.34 USD at 6 decimals = 12_340_000 minor units.
        let send = &provider.calls_of("eth_sendTransaction")[0];
        let data = send[0]["data"].as_str().unwrap();
        assert!(data.ends_with(&format!("{:064x}", 12_340_000u64)));
    }

    #[tokio::test]
    async fn test_transfer_requires_connection() {
        let registry = Arc::new(Registry::defaults());
        let connector = WalletConnector::new(
            Some(Arc::new(MockProvider::new()) as Arc<dyn WalletProvider>),
            registry.clone(),
            Arc::new(MemoryStore::new()),
        );
        let transfer = FallbackTransfer::new(registry, connector);

        assert!(matches!(
            transfer.transfer(&sample_details()).await.unwrap_err(),
            X402PayError::Validation { .. }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_pair_rejected_before_any_rpc() {
        let provider = Arc::new(MockProvider::new());
        let transfer = connected_transfer(provider.clone()).await;

        let mut details = sample_details();
        details.token = "usdt".to_string(); // not deployed on base
        assert!(matches!(
            transfer.transfer(&details).await.unwrap_err(),
            X402PayError::Config { .. }
        ));
        assert_eq!(provider.call_count("eth_call"), 0);
    }
}
