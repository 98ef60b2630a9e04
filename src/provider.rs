//! Injected wallet provider abstraction
//!
//! Models the EIP-1193 surface the payment layer consumes: a `request`
//! method speaking JSON-RPC, `accountsChanged`/`chainChanged` events, and a
//! best-effort disconnect. Concrete providers are discovered handles; the
//! connector never reaches into ambient globals.

use crate::X402PayError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// EIP-1193 error code: the user rejected the request
pub const ERR_USER_REJECTED: i64 = 4001;

/// EIP-3085/EIP-3326 error code: the chain is unknown to the wallet
pub const ERR_UNRECOGNIZED_CHAIN: i64 = 4902;

/// Error surfaced by a wallet provider, with the provider's message attached
#[derive(Debug, Clone, Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The user dismissed the wallet prompt
    pub fn is_user_rejection(&self) -> bool {
        self.code == ERR_USER_REJECTED
    }

    /// The wallet does not know the requested chain
    pub fn is_unrecognized_chain(&self) -> bool {
        self.code == ERR_UNRECOGNIZED_CHAIN
    }
}

impl From<ProviderError> for X402PayError {
    fn from(err: ProviderError) -> Self {
        if err.is_user_rejection() {
            X402PayError::WalletRejected {
                message: err.message,
            }
        } else {
            X402PayError::Provider {
                code: err.code,
                message: err.message,
            }
        }
    }
}

/// Static facts about a discovered provider handle
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// Display name, e.g. "MetaMask"
    pub name: String,
    /// Whether the provider marks itself as a recognized wallet
    /// (the `isMetaMask` / `isCoinbaseWallet` style flags)
    pub known_wallet: bool,
}

/// Event pushed by the provider
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Active accounts changed; an empty list is semantically a disconnect
    AccountsChanged(Vec<String>),
    /// Active chain changed
    ChainChanged(u64),
}

/// A connected wallet provider (EIP-1193 shaped)
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Identification and capability flags
    fn info(&self) -> ProviderInfo;

    /// Issue a JSON-RPC request through the wallet
    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, ProviderError>;

    /// Subscribe to account/chain change events
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Best-effort provider-side disconnect; not all wallets support one
    async fn disconnect(&self) -> std::result::Result<(), ProviderError> {
        Ok(())
    }
}

/// A named predicate used to rank discovered provider handles
pub struct CapabilityProbe {
    pub name: &'static str,
    pub matches: fn(&ProviderInfo) -> bool,
}

/// Default selection order: a provider explicitly marked as a known wallet
/// wins over the first generic provider present.
pub fn default_probes() -> Vec<CapabilityProbe> {
    vec![
        CapabilityProbe {
            name: "known-wallet",
            matches: |info| info.known_wallet,
        },
        CapabilityProbe {
            name: "any",
            matches: |_| true,
        },
    ]
}

/// Pick a provider from the discovered handles using the given probe order
pub fn detect_provider_with(
    probes: &[CapabilityProbe],
    handles: &[Arc<dyn WalletProvider>],
) -> Option<Arc<dyn WalletProvider>> {
    for probe in probes {
        if let Some(handle) = handles.iter().find(|h| (probe.matches)(&h.info())) {
            tracing::debug!(
                probe = probe.name,
                provider = %handle.info().name,
                "selected wallet provider"
            );
            return Some(handle.clone());
        }
    }
    None
}

/// Pick a provider from the discovered handles using the default probe order
pub fn detect_provider(handles: &[Arc<dyn WalletProvider>]) -> Option<Arc<dyn WalletProvider>> {
    detect_provider_with(&default_probes(), handles)
}
