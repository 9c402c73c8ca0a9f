use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionQueueError {
    #[error("not initialized: run 'actionq init'")]
    NotInitialized,

    #[error("invalid amount '{0}': expected a positive integer of native units")]
    InvalidAmount(String),

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("insufficient funds in wallet {wallet_id}: need {needed}, have {available}")]
    InsufficientFunds {
        wallet_id: String,
        needed: String,
        available: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("transaction {0} was dropped")]
    TxDropped(String),

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("program already queued: {0}")]
    ProgramExists(String),

    #[error("queue db error: {0}")]
    QueueDb(String),

    #[error("queue db {0} is held by another process")]
    QueueLocked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ActionQueueError {
    /// Transient errors are retried on a later tick; everything else is
    /// terminal for the action that raised it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Io(_) | Self::QueueLocked(_))
    }

    /// Stable tag recorded in `done` effects.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidProgram(_) => "invalid_program",
            Self::WalletNotFound(_) => "wallet_not_found",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::PolicyNotFound(_) => "policy_not_found",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Network(_) => "network",
            Self::TxDropped(_) => "tx_dropped",
            Self::ProgramNotFound(_) => "program_not_found",
            Self::ProgramExists(_) => "program_exists",
            Self::QueueDb(_) => "queue_db",
            Self::QueueLocked(_) => "queue_locked",
            Self::Io(_) => "io",
            Self::Yaml(_) => "yaml",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, ActionQueueError>;

/// Serialisable snapshot of an error that terminated an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectError {
    pub kind: String,
    pub message: String,
}

impl From<&ActionQueueError> for EffectError {
    fn from(e: &ActionQueueError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for EffectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_io_and_lock_contention_are_transient() {
        assert!(ActionQueueError::Network("timeout".into()).is_transient());
        assert!(ActionQueueError::QueueLocked("queue.db".into()).is_transient());
        assert!(!ActionQueueError::QueueDb("corrupt".into()).is_transient());
        assert!(!ActionQueueError::PolicyNotFound("aave".into()).is_transient());
        assert!(!ActionQueueError::InsufficientFunds {
            wallet_id: "w".into(),
            needed: "10".into(),
            available: "1".into(),
        }
        .is_transient());
    }

    #[test]
    fn effect_error_keeps_kind_and_message() {
        let err = ActionQueueError::WalletNotFound("abc".into());
        let snapshot = EffectError::from(&err);
        assert_eq!(snapshot.kind, "wallet_not_found");
        assert_eq!(snapshot.message, "wallet not found: abc");
    }
}
