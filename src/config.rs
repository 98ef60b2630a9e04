//! Static chain/token registry and payment configuration
//!
//! Pure data loaded at startup: supported chains, supported tokens with
//! per-chain contract addresses, and the payment limits. Lookups never
//! return a partial config silently; a missing chain, token, or pair is a
//! [`X402PayError::Config`] naming what was not found.

use crate::{Result, X402PayError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Native currency of a chain (for `wallet_addEthereumChain`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Configuration for a supported blockchain network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Registry key, e.g. "base"
    pub name: String,
    /// Human-readable display name, e.g. "Base"
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// EIP-155 chain id
    #[serde(rename = "chainId")]
    pub chain_id: u64,
    #[serde(rename = "rpcUrl")]
    pub rpc_url: String,
    #[serde(rename = "explorerUrl")]
    pub explorer_url: String,
    #[serde(rename = "nativeCurrency")]
    pub native_currency: NativeCurrency,
}

impl ChainConfig {
    /// Block-explorer URL for a transaction on this chain
    pub fn tx_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_url.trim_end_matches('/'), tx_hash)
    }
}

/// Configuration for a supported stablecoin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Lowercase registry key, e.g. "usdc"
    pub symbol: String,
    pub name: String,
    /// Must match the deployed contract's `decimals()`
    pub decimals: u8,
    /// Contract address per chain name; absent key = unsupported pair
    pub addresses: HashMap<String, String>,
}

impl TokenConfig {
    /// Contract address on the given chain, if the token is deployed there
    pub fn address_on(&self, chain: &str) -> Option<&str> {
        self.addresses.get(chain).map(String::as_str)
    }
}

/// Payment amount limits in USD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentLimits {
    #[serde(rename = "minAmount")]
    pub min_amount_usd: Decimal,
    #[serde(rename = "maxAmount")]
    pub max_amount_usd: Decimal,
    #[serde(rename = "dailyLimit")]
    pub daily_limit_usd: Decimal,
}

impl Default for PaymentLimits {
    fn default() -> Self {
        Self {
            min_amount_usd: Decimal::from(1),
            max_amount_usd: Decimal::from(10_000),
            daily_limit_usd: Decimal::from(50_000),
        }
    }
}

/// Static lookup of supported chains and tokens
#[derive(Debug, Clone)]
pub struct Registry {
    chains: HashMap<String, ChainConfig>,
    tokens: HashMap<String, TokenConfig>,
}

impl Registry {
    /// Build a registry from explicit chain and token lists
    ///
    /// Chain ids must be globally unique across the registry.
    pub fn new(chains: Vec<ChainConfig>, tokens: Vec<TokenConfig>) -> Result<Self> {
        let mut chain_map = HashMap::new();
        let mut seen_ids = HashMap::new();
        for chain in chains {
            if let Some(other) = seen_ids.insert(chain.chain_id, chain.name.clone()) {
                return Err(X402PayError::config(format!(
                    "Duplicate chain id {} shared by '{}' and '{}'",
                    chain.chain_id, other, chain.name
                )));
            }
            chain_map.insert(chain.name.clone(), chain);
        }

        let mut token_map = HashMap::new();
        for token in tokens {
            token_map.insert(token.symbol.to_lowercase(), token);
        }

        Ok(Self {
            chains: chain_map,
            tokens: token_map,
        })
    }

    /// Registry mirroring the stock deployment: Base, Ethereum and
    /// Base Sepolia, with USDC everywhere and USDT on Ethereum mainnet.
    pub fn defaults() -> Self {
        let chains = vec![
            ChainConfig {
                name: "base".to_string(),
                display_name: "Base".to_string(),
                chain_id: 8453,
                rpc_url: "https://mainnet.base.org".to_string(),
                explorer_url: "https://basescan.org".to_string(),
                native_currency: NativeCurrency {
                    name: "Ethereum".to_string(),
                    symbol: "ETH".to_string(),
                    decimals: 18,
                },
            },
            ChainConfig {
                name: "ethereum".to_string(),
                display_name: "Ethereum".to_string(),
                chain_id: 1,
                rpc_url: "https://eth.llamarpc.com".to_string(),
                explorer_url: "https://etherscan.io".to_string(),
                native_currency: NativeCurrency {
                    name: "Ethereum".to_string(),
                    symbol: "ETH".to_string(),
                    decimals: 18,
                },
            },
            ChainConfig {
                name: "base-sepolia".to_string(),
                display_name: "Base Sepolia".to_string(),
                chain_id: 84532,
                rpc_url: "https://sepolia.base.org".to_string(),
                explorer_url: "https://sepolia.basescan.org".to_string(),
                native_currency: NativeCurrency {
                    name: "Ethereum".to_string(),
                    symbol: "ETH".to_string(),
                    decimals: 18,
                },
            },
        ];

        let tokens = vec![
            TokenConfig {
                symbol: "usdc".to_string(),
                name: "USD Coin".to_string(),
                decimals: 6,
                addresses: HashMap::from([
                    (
                        "base".to_string(),
                        "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_string(),
                    ),
                    (
                        "ethereum".to_string(),
                        "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
                    ),
                    (
                        "base-sepolia".to_string(),
                        "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
                    ),
                ]),
            },
            TokenConfig {
                symbol: "usdt".to_string(),
                name: "Tether USD".to_string(),
                decimals: 6,
                addresses: HashMap::from([(
                    "ethereum".to_string(),
                    "0xdAC17F958D2ee523a2206206994597C13D831ec7".to_string(),
                )]),
            },
        ];

        // Static data is validated at build time by tests; unique ids hold.
        Self::new(chains, tokens).expect("default registry is valid")
    }

    /// Look up a chain by registry name
    pub fn chain(&self, name: &str) -> Result<&ChainConfig> {
        self.chains
            .get(name)
            .ok_or_else(|| X402PayError::config(format!("Unsupported chain: {}", name)))
    }

    /// Look up a token by symbol (case-insensitive)
    pub fn token(&self, symbol: &str) -> Result<&TokenConfig> {
        self.tokens
            .get(&symbol.to_lowercase())
            .ok_or_else(|| X402PayError::config(format!("Unsupported token: {}", symbol)))
    }

    /// Contract address for a token on a chain
    pub fn token_address(&self, symbol: &str, chain: &str) -> Result<&str> {
        let token = self.token(symbol)?;
        token.address_on(chain).ok_or_else(|| {
            X402PayError::config(format!(
                "Token {} not available on {}",
                token.symbol, chain
            ))
        })
    }

    pub fn is_chain_supported(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    pub fn is_token_supported(&self, symbol: &str) -> bool {
        self.tokens.contains_key(&symbol.to_lowercase())
    }

    /// All chain names in the registry
    pub fn chain_names(&self) -> Vec<&str> {
        self.chains.keys().map(String::as_str).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Configuration surface of the payment client
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Base URL of the facilitator service
    pub facilitator_url: String,
    /// Wallet address that receives payments
    pub recipient: String,
    /// Contract the EIP-712 domain binds signatures to
    pub verifying_contract: String,
    pub default_chain: String,
    pub default_token: String,
    pub limits: PaymentLimits,
    /// Settlement deadline applied to fresh payment intents
    pub default_deadline_minutes: u64,
    /// Timeout applied to facilitator HTTP calls
    pub request_timeout: Duration,
    /// Direct-transfer confirmation polling
    pub confirmation_poll_interval: Duration,
    pub confirmation_poll_attempts: u32,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            facilitator_url: "https://facilitator.coinbase.com".to_string(),
            recipient: "0x0000000000000000000000000000000000000000".to_string(),
            verifying_contract: "0x0000000000000000000000000000000000000000".to_string(),
            default_chain: "base".to_string(),
            default_token: "usdc".to_string(),
            limits: PaymentLimits::default(),
            default_deadline_minutes: 60,
            request_timeout: Duration::from_secs(30),
            confirmation_poll_interval: Duration::from_secs(2),
            confirmation_poll_attempts: 60,
        }
    }
}

impl PaymentConfig {
    /// Validate the configuration before any I/O happens
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.facilitator_url)
            .map_err(|e| X402PayError::config(format!("Invalid facilitator URL: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(X402PayError::config(
                "Facilitator URL must use http or https",
            ));
        }
        if !crate::types::is_valid_eth_address(&self.recipient) {
            return Err(X402PayError::config(format!(
                "Invalid recipient address: {}",
                self.recipient
            )));
        }
        if self.limits.min_amount_usd > self.limits.max_amount_usd {
            return Err(X402PayError::config(
                "Minimum payment amount exceeds the maximum",
            ));
        }
        if self.default_deadline_minutes == 0 {
            return Err(X402PayError::config("Deadline must be at least one minute"));
        }
        Ok(())
    }

    /// Facilitator base URL without a trailing slash
    pub fn facilitator_base(&self) -> &str {
        self.facilitator_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_lookups() {
        let registry = Registry::defaults();

        let base = registry.chain("base").unwrap();
        assert_eq!(base.chain_id, 8453);
        assert_eq!(base.explorer_url, "https://basescan.org");

        let usdc = registry.token("USDC").unwrap();
        assert_eq!(usdc.decimals, 6);

        assert_eq!(
            registry.token_address("usdc", "base").unwrap(),
            "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
        );
    }

    #[test]
    fn test_tx_url() {
        let registry = Registry::defaults();
        assert_eq!(
            registry.chain("base").unwrap().tx_url("0xabc"),
            "https://basescan.org/tx/0xabc"
        );

        let mut chain = registry.chain("base").unwrap().clone();
        chain.explorer_url = "https://basescan.org/".to_string();
        assert_eq!(chain.tx_url("0xabc"), "https://basescan.org/tx/0xabc");
    }

    #[test]
    fn test_unknown_chain_is_config_error() {
        let registry = Registry::defaults();
        let err = registry.chain("solana").unwrap_err();
        match err {
            X402PayError::Config { message } => assert!(message.contains("solana")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_token_and_missing_pair() {
        let registry = Registry::defaults();

        assert!(matches!(
            registry.token("dai").unwrap_err(),
            X402PayError::Config { .. }
        ));

        // USDT exists but is not deployed on base.
        let err = registry.token_address("usdt", "base").unwrap_err();
        match err {
            X402PayError::Config { message } => {
                assert!(message.contains("usdt"));
                assert!(message.contains("base"));
            }
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_support_predicates() {
        let registry = Registry::defaults();
        assert!(registry.is_chain_supported("base-sepolia"));
        assert!(!registry.is_chain_supported("polygon"));
        assert!(registry.is_token_supported("UsDt"));
        assert!(!registry.is_token_supported("dai"));
    }

    #[test]
    fn test_duplicate_chain_id_rejected() {
        let mut chains = vec![
            Registry::defaults().chain("base").unwrap().clone(),
            Registry::defaults().chain("ethereum").unwrap().clone(),
        ];
        chains[1].chain_id = 8453;

        let err = Registry::new(chains, vec![]).unwrap_err();
        assert!(matches!(err, X402PayError::Config { .. }));
        assert!(err.to_string().contains("8453"));
    }

    #[test]
    fn test_payment_config_validation() {
        assert!(PaymentConfig::default().validate().is_ok());

        let mut config = PaymentConfig::default();
        config.facilitator_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = PaymentConfig::default();
        config.recipient = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = PaymentConfig::default();
        config.limits.min_amount_usd = Decimal::from(100);
        config.limits.max_amount_usd = Decimal::from(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_facilitator_base_trims_slash() {
        let config = PaymentConfig {
            facilitator_url: "https://pay.example.com/".to_string(),
            ..PaymentConfig::default()
        };
        assert_eq!(config.facilitator_base(), "https://pay.example.com");
    }
}
