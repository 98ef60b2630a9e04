//! EIP-712 payment signing
//!
//! Builds the typed-data structure for a payment intent and asks the
//! connected wallet to sign it with `eth_signTypedData_v4`. The signer never
//! sees key material; the wallet renders the structured fields and returns a
//! signature.

use crate::config::Registry;
use crate::connector::WalletConnector;
use crate::types::{PaymentDetails, PaymentMessage, SignedPayload};
use crate::{Result, X402PayError};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// EIP-712 domain name shared with the facilitator
pub const EIP712_DOMAIN_NAME: &str = "x402 Payment Protocol";

/// EIP-712 domain version
pub const EIP712_DOMAIN_VERSION: &str = "1";

/// The full typed-data structure passed to `eth_signTypedData_v4`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedData {
    pub types: Value,
    pub domain: Value,
    #[serde(rename = "primaryType")]
    pub primary_type: String,
    pub message: PaymentMessage,
}

/// Build the typed-data structure for a payment message.
///
/// Pure: the same inputs always produce the same structure, so a wallet
/// shows identical fields for identical payments.
pub fn build_typed_data(
    chain_id: u64,
    verifying_contract: &str,
    message: &PaymentMessage,
) -> TypedData {
    TypedData {
        types: json!({
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" },
                { "name": "chainId", "type": "uint256" },
                { "name": "verifyingContract", "type": "address" },
            ],
            "Payment": [
                { "name": "to", "type": "address" },
                { "name": "amount", "type": "uint256" },
                { "name": "token", "type": "address" },
                { "name": "deadline", "type": "uint256" },
                { "name": "nonce", "type": "uint256" },
            ],
        }),
        domain: json!({
            "name": EIP712_DOMAIN_NAME,
            "version": EIP712_DOMAIN_VERSION,
            "chainId": chain_id,
            "verifyingContract": verifying_contract,
        }),
        primary_type: "Payment".to_string(),
        message: message.clone(),
    }
}

/// Generate a random 256-bit nonce as a 0x-prefixed hex string
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}

/// Signs payment intents with the connected wallet
pub struct PaymentSigner {
    registry: Arc<Registry>,
    connector: Arc<WalletConnector>,
    verifying_contract: String,
}

impl PaymentSigner {
    pub fn new(
        registry: Arc<Registry>,
        connector: Arc<WalletConnector>,
        verifying_contract: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            connector,
            verifying_contract: verifying_contract.into(),
        }
    }

    /// Sign a payment intent, producing the payload the facilitator consumes.
    ///
    /// Requires a live connection whose active chain matches the intent's
    /// target chain; a declined wallet prompt surfaces as
    /// [`X402PayError::WalletRejected`].
    pub async fn sign_payment(&self, details: &PaymentDetails) -> Result<SignedPayload> {
        if details.is_expired() {
            return Err(X402PayError::validation(
                "Payment deadline has passed; create a new payment",
            ));
        }

        let connection = self
            .connector
            .connection()
            .ok_or_else(|| X402PayError::validation("No wallet connected"))?;
        let chain = self.registry.chain(&details.chain)?;
        if connection.chain_id != chain.chain_id {
            return Err(X402PayError::validation(format!(
                "Wallet is on chain {} but the payment targets {} ({})",
                connection.chain_id, details.chain, chain.chain_id
            )));
        }
        let token_address = self.registry.token_address(&details.token, &details.chain)?;

        let message = PaymentMessage {
            to: details.to.clone(),
            amount: details.amount.clone(),
            token: token_address.to_string(),
            deadline: details.deadline as u64,
            nonce: generate_nonce(),
        };
        let typed = build_typed_data(chain.chain_id, &self.verifying_contract, &message);

        let provider = self.connector.provider_handle()?;
        // v4 takes the typed data as a JSON string, not a nested object.
        let params = json!([connection.address, serde_json::to_string(&typed)?]);
        let response = provider.request("eth_signTypedData_v4", params).await?;
        let signature = response
            .as_str()
            .ok_or_else(|| X402PayError::Provider {
                code: -32603,
                message: "malformed signature response".to_string(),
            })?
            .to_string();

        tracing::debug!(
            payment_id = %details.metadata.payment_id,
            chain = %details.chain,
            "payment signed"
        );

        Ok(SignedPayload {
            payment: message,
            signature,
            chain_id: chain.chain_id,
            timestamp: Utc::now().timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryStore;
    use crate::provider::mock::MockProvider;
    use crate::provider::{ProviderError, WalletProvider, ERR_USER_REJECTED};
    use crate::types::PaymentMetadata;

    const RECIPIENT: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";
    const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
    const SIGNER_ADDR: &str = "0x857b06519E91e3A54538791bDbb0E22373e36b66";

    fn sample_message() -> PaymentMessage {
        PaymentMessage {
            to: RECIPIENT.to_string(),
            amount: "25000000".to_string(),
            token: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_string(),
            deadline: 1_900_000_000,
            nonce: "0xf3746613c2d920b5fdabc0856f2aeb2d4f88ee6037b8cc5d04a71a4462f13480"
                .to_string(),
        }
    }

    fn sample_details(deadline: i64) -> PaymentDetails {
        PaymentDetails {
            chain: "base".to_string(),
            token: "usdc".to_string(),
            to: RECIPIENT.to_string(),
            amount: "25000000".to_string(),
            deadline,
            metadata: PaymentMetadata::new(),
        }
    }

    async fn connected_signer(provider: Arc<MockProvider>) -> PaymentSigner {
        provider.expect("eth_requestAccounts", Ok(json!([SIGNER_ADDR])));
        provider.expect("eth_chainId", Ok(json!("0x2105")));
        let registry = Arc::new(Registry::defaults());
        let connector = WalletConnector::new(
            Some(provider as Arc<dyn WalletProvider>),
            registry.clone(),
            Arc::new(MemoryStore::new()),
        );
        connector.connect().await.unwrap();
        PaymentSigner::new(registry, connector, CONTRACT)
    }

    #[test]
    fn test_typed_data_shape() {
        let typed = build_typed_data(8453, CONTRACT, &sample_message());

        assert_eq!(typed.primary_type, "Payment");
        assert_eq!(typed.domain["name"], json!(EIP712_DOMAIN_NAME));
        assert_eq!(typed.domain["version"], json!("1"));
        assert_eq!(typed.domain["chainId"], json!(8453));
        assert_eq!(typed.domain["verifyingContract"], json!(CONTRACT));

        let payment_fields: Vec<&str> = typed.types["Payment"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            payment_fields,
            vec!["to", "amount", "token", "deadline", "nonce"]
        );
    }

    #[test]
    fn test_typed_data_is_deterministic() {
        let message = sample_message();
        let a = serde_json::to_string(&build_typed_data(8453, CONTRACT, &message)).unwrap();
        let b = serde_json::to_string(&build_typed_data(8453, CONTRACT, &message)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_nonce_format_and_uniqueness() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert!(a.starts_with("0x"));
        assert_eq!(a.len(), 66);
        assert!(a[2..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_sign_payment_success() {
        let provider = Arc::new(MockProvider::new());
        provider.expect("eth_signTypedData_v4", Ok(json!("0xsigned")));
        let signer = connected_signer(provider.clone()).await;

        let details = sample_details(Utc::now().timestamp() + 3600);
        let payload = signer.sign_payment(&details).await.unwrap();

        assert_eq!(payload.signature, "0xsigned");
        assert_eq!(payload.chain_id, 8453);
        assert_eq!(payload.payment.to, RECIPIENT);
        assert_eq!(payload.payment.amount, "25000000");
        assert_eq!(
            payload.payment.token,
            "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
        );

        // The wallet saw [address, typed-data-as-string].
        let calls = provider.calls_of("eth_signTypedData_v4");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], json!(SIGNER_ADDR));
        let typed: TypedData = serde_json::from_str(calls[0][1].as_str().unwrap()).unwrap();
        assert_eq!(typed.domain["name"], json!(EIP712_DOMAIN_NAME));
        assert_eq!(typed.message.nonce, payload.payment.nonce);
    }

    #[tokio::test]
    async fn test_sign_rejection_maps_to_wallet_rejected() {
        let provider = Arc::new(MockProvider::new());
        provider.expect(
            "eth_signTypedData_v4",
            Err(ProviderError::new(ERR_USER_REJECTED, "User rejected")),
        );
        let signer = connected_signer(provider).await;

        let details = sample_details(Utc::now().timestamp() + 3600);
        assert!(matches!(
            signer.sign_payment(&details).await.unwrap_err(),
            X402PayError::WalletRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_sign_expired_intent_never_reaches_wallet() {
        let provider = Arc::new(MockProvider::new());
        let signer = connected_signer(provider.clone()).await;

        let details = sample_details(Utc::now().timestamp() - 1);
        assert!(matches!(
            signer.sign_payment(&details).await.unwrap_err(),
            X402PayError::Validation { .. }
        ));
        assert_eq!(provider.call_count("eth_signTypedData_v4"), 0);
    }

    #[tokio::test]
    async fn test_sign_requires_matching_chain() {
        let provider = Arc::new(MockProvider::new());
        let signer = connected_signer(provider).await;

        // Wallet is on base (8453); payment targets ethereum (1).
        let mut details = sample_details(Utc::now().timestamp() + 3600);
        details.chain = "ethereum".to_string();

        let err = signer.sign_payment(&details).await.unwrap_err();
        match err {
            X402PayError::Validation { message } => {
                assert!(message.contains("8453"));
                assert!(message.contains("ethereum"));
            }
            other => panic!("expected Validation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sign_without_connection() {
        let registry = Arc::new(Registry::defaults());
        let connector = WalletConnector::new(
            Some(Arc::new(MockProvider::new()) as Arc<dyn WalletProvider>),
            registry.clone(),
            Arc::new(MemoryStore::new()),
        );
        let signer = PaymentSigner::new(registry, connector, CONTRACT);

        let details = sample_details(Utc::now().timestamp() + 3600);
        assert!(matches!(
            signer.sign_payment(&details).await.unwrap_err(),
            X402PayError::Validation { .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_signature_response() {
        let provider = Arc::new(MockProvider::new());
        provider.expect("eth_signTypedData_v4", Ok(json!({ "not": "a string" })));
        let signer = connected_signer(provider).await;

        let details = sample_details(Utc::now().timestamp() + 3600);
        assert!(matches!(
            signer.sign_payment(&details).await.unwrap_err(),
            X402PayError::Provider { .. }
        ));
    }
}
