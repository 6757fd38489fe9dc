// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaucetError {
    // Target address failed validation (zero address, parse failure)
    InvalidAddress(String),
    // Session balance or requested claim is below the configured minimum
    AmountTooLow(String),
    // Claim requested on a session that is not in the claimable state
    NotClaimable(String),
    // Operation not allowed in the session's current lifecycle state
    InvalidState(String),
    // A concurrent claim for the same session won the race
    RaceClaiming(String),
    // A gating module rejected the session; code/message come from the module
    ModuleRejected {
        module: String,
        code: String,
        message: String,
    },
    // Session deadline elapsed
    SessionTimeout,
    // Wallet RPC is not reachable / not ready
    WalletUnreachable(String),
    // Wallet balance cannot cover the claim
    OutOfFunds(String),
    // Transaction build/sign/submit failure
    SubmissionFailed(String),
    // Confirmation watch resolved with a failure
    ConfirmationFailed(String),
    // Session store failure
    StorageError(String),
    // Internal invariant violation
    InternalError(String),
    // Uncategorized error
    Generic(String),
}

impl FaucetError {
    /// Stable caller-facing code, surfaced verbatim at the API boundary.
    pub fn error_code(&self) -> &str {
        match self {
            FaucetError::InvalidAddress(_) => "INVALID_ADDR",
            FaucetError::AmountTooLow(_) => "AMOUNT_TOO_LOW",
            FaucetError::NotClaimable(_) => "NOT_CLAIMABLE",
            FaucetError::InvalidState(_) => "INVALID_STATE",
            FaucetError::RaceClaiming(_) => "RACE_CLAIMING",
            FaucetError::ModuleRejected { code, .. } => code,
            FaucetError::SessionTimeout => "SESSION_TIMEOUT",
            FaucetError::WalletUnreachable(_) => "WALLET_UNREACHABLE",
            FaucetError::OutOfFunds(_) => "OUT_OF_FUNDS",
            FaucetError::SubmissionFailed(_) => "SUBMISSION_FAILED",
            FaucetError::ConfirmationFailed(_) => "CONFIRMATION_FAILED",
            FaucetError::StorageError(_) => "STORAGE_ERROR",
            FaucetError::InternalError(_) => "INTERNAL_ERROR",
            FaucetError::Generic(_) => "GENERIC",
        }
    }

    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            FaucetError::InvalidAddress(_) => "invalid_address",
            FaucetError::AmountTooLow(_) => "amount_too_low",
            FaucetError::NotClaimable(_) => "not_claimable",
            FaucetError::InvalidState(_) => "invalid_state",
            FaucetError::RaceClaiming(_) => "race_claiming",
            FaucetError::ModuleRejected { .. } => "module_rejected",
            FaucetError::SessionTimeout => "session_timeout",
            FaucetError::WalletUnreachable(_) => "wallet_unreachable",
            FaucetError::OutOfFunds(_) => "out_of_funds",
            FaucetError::SubmissionFailed(_) => "submission_failed",
            FaucetError::ConfirmationFailed(_) => "confirmation_failed",
            FaucetError::StorageError(_) => "storage_error",
            FaucetError::InternalError(_) => "internal_error",
            FaucetError::Generic(_) => "generic",
        }
    }
}

impl fmt::Display for FaucetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaucetError::InvalidAddress(msg) => write!(f, "invalid target address: {}", msg),
            FaucetError::AmountTooLow(msg) => write!(f, "amount too low: {}", msg),
            FaucetError::NotClaimable(msg) => write!(f, "session is not claimable: {}", msg),
            FaucetError::InvalidState(msg) => write!(f, "invalid session state: {}", msg),
            FaucetError::RaceClaiming(id) => {
                write!(f, "session {} is already being claimed", id)
            }
            FaucetError::ModuleRejected {
                module,
                code,
                message,
            } => write!(f, "rejected by module {} ({}): {}", module, code, message),
            FaucetError::SessionTimeout => write!(f, "session timed out"),
            FaucetError::WalletUnreachable(msg) => {
                write!(f, "wallet RPC unreachable: {}", msg)
            }
            FaucetError::OutOfFunds(msg) => write!(f, "wallet is out of funds: {}", msg),
            FaucetError::SubmissionFailed(msg) => {
                write!(f, "transaction submission failed: {}", msg)
            }
            FaucetError::ConfirmationFailed(msg) => {
                write!(f, "transaction confirmation failed: {}", msg)
            }
            FaucetError::StorageError(msg) => write!(f, "storage error: {}", msg),
            FaucetError::InternalError(msg) => write!(f, "internal error: {}", msg),
            FaucetError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        // These codes are part of the public API surface - callers match on
        // them and changing them breaks clients.
        let cases = vec![
            (FaucetError::InvalidAddress("x".into()), "INVALID_ADDR"),
            (FaucetError::AmountTooLow("x".into()), "AMOUNT_TOO_LOW"),
            (FaucetError::NotClaimable("x".into()), "NOT_CLAIMABLE"),
            (FaucetError::InvalidState("x".into()), "INVALID_STATE"),
            (FaucetError::RaceClaiming("x".into()), "RACE_CLAIMING"),
            (FaucetError::SessionTimeout, "SESSION_TIMEOUT"),
            (FaucetError::OutOfFunds("x".into()), "OUT_OF_FUNDS"),
        ];
        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "code for {:?}", error);
        }
    }

    #[test]
    fn test_module_rejection_preserves_code() {
        let err = FaucetError::ModuleRejected {
            module: "captcha".to_string(),
            code: "CAPTCHA_REQUIRED".to_string(),
            message: "solve the captcha first".to_string(),
        };
        assert_eq!(err.error_code(), "CAPTCHA_REQUIRED");
        let display = format!("{}", err);
        assert!(display.contains("captcha"));
        assert!(display.contains("solve the captcha first"));
    }

    #[test]
    fn test_wallet_unreachable_message() {
        // Persisted claim errors are matched against "RPC ... unreachable"
        // by operators; keep the wording.
        let display = format!("{}", FaucetError::WalletUnreachable("timeout".into()));
        assert!(display.contains("RPC"));
        assert!(display.contains("unreachable"));
    }

    #[test]
    fn test_error_type_valid_prometheus_labels() {
        let errors = vec![
            FaucetError::InvalidAddress("x".into()),
            FaucetError::ModuleRejected {
                module: "m".into(),
                code: "C".into(),
                message: "m".into(),
            },
            FaucetError::SessionTimeout,
            FaucetError::WalletUnreachable("x".into()),
            FaucetError::Generic("x".into()),
        ];
        for error in errors {
            let label = error.error_type();
            assert!(!label.is_empty());
            for c in label.chars() {
                assert!(
                    c.is_ascii_lowercase() || c == '_',
                    "label '{}' contains invalid char '{}'",
                    label,
                    c
                );
            }
        }
    }
}
