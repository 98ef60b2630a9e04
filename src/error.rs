//! Error types for the x402-pay library

use thiserror::Error;

/// Result type alias for payment operations
pub type Result<T> = std::result::Result<T, X402PayError>;

/// Main error type for payment operations
///
/// Every failure a caller may want to handle programmatically has its own
/// variant; no kind is ever coerced into a bare string.
#[derive(Error, Debug)]
pub enum X402PayError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 encoding/decoding error
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Payment request rejected before any wallet or network call
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// No injected wallet provider was detected
    #[error("No wallet provider detected")]
    NoProvider,

    /// The user declined a connect or signing prompt in the wallet
    #[error("Wallet request rejected: {message}")]
    WalletRejected { message: String },

    /// The wallet provider returned an error the client does not translate
    #[error("Wallet provider error {code}: {message}")]
    Provider { code: i64, message: String },

    /// Wallet account or chain changed while a payment was in flight
    #[error("Wallet connection is stale: {message}")]
    StaleConnection { message: String },

    /// Facilitator unreachable or responded with a non-success status
    #[error("Network error: {message}")]
    Network { message: String },

    /// Facilitator inspected the payload and reported it invalid
    #[error("Payment verification failed: {reason}")]
    VerificationFailed { reason: String },

    /// Settlement transaction failed or reverted
    #[error("Payment settlement failed: {reason}")]
    Settlement { reason: String },

    /// Direct-transfer path: signer balance below the requested amount
    #[error("Insufficient {token} balance: have {available}, need {required}")]
    InsufficientBalance {
        token: String,
        available: String,
        required: String,
    },

    /// Unknown chain/token lookup or malformed configuration
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl X402PayError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a wallet-rejected error
    pub fn wallet_rejected(message: impl Into<String>) -> Self {
        Self::WalletRejected {
            message: message.into(),
        }
    }

    /// Create a stale-connection error
    pub fn stale_connection(message: impl Into<String>) -> Self {
        Self::StaleConnection {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a verification-failed error
    pub fn verification_failed(reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            reason: reason.into(),
        }
    }

    /// Create a settlement error
    pub fn settlement(reason: impl Into<String>) -> Self {
        Self::Settlement {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_detail() {
        let err = X402PayError::validation("amount below minimum");
        assert_eq!(err.to_string(), "Validation error: amount below minimum");

        let err = X402PayError::InsufficientBalance {
            token: "USDC".to_string(),
            available: "3.50".to_string(),
            required: "10".to_string(),
        };
        assert!(err.to_string().contains("3.50"));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_error_kinds_are_distinguishable() {
        let errors = vec![
            X402PayError::validation("x"),
            X402PayError::NoProvider,
            X402PayError::wallet_rejected("x"),
            X402PayError::stale_connection("x"),
            X402PayError::network("x"),
            X402PayError::verification_failed("x"),
            X402PayError::settlement("x"),
            X402PayError::config("x"),
        ];
        // Matching on the variant must be enough for a UI to branch on.
        for err in errors {
            match err {
                X402PayError::Validation { .. }
                | X402PayError::NoProvider
                | X402PayError::WalletRejected { .. }
                | X402PayError::StaleConnection { .. }
                | X402PayError::Network { .. }
                | X402PayError::VerificationFailed { .. }
                | X402PayError::Settlement { .. }
                | X402PayError::Config { .. } => {}
                other => panic!("unexpected kind: {:?}", other),
            }
        }
    }
}
