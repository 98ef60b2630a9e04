//! # x402-pay - stablecoin payments through the user's wallet
//!
//! A client-side implementation of the x402 payment flow: payments are
//! signed as EIP-712 typed data by the user's wallet and settled by a
//! facilitator service, with a direct ERC-20 transfer fallback when the
//! facilitator is unavailable.

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod provider;
pub mod signer;
pub mod transfer;
pub mod types;

// Re-exports for convenience
pub use client::PaymentClient;
pub use config::{ChainConfig, PaymentConfig, PaymentLimits, Registry, TokenConfig};
pub use connector::{
    ConnectionEvent, ConnectionState, ConnectionStore, FileStore, MemoryStore, Subscription,
    WalletConnection, WalletConnector,
};
pub use error::{Result, X402PayError};
pub use provider::{ProviderError, ProviderEvent, ProviderInfo, WalletProvider};
pub use signer::PaymentSigner;
pub use transfer::FallbackTransfer;
pub use types::*;

/// Current version of the x402-pay library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
