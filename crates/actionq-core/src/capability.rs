//! The account/wallet surface the engine drives.
//!
//! Everything that touches a chain, a provider, or key material sits behind
//! [`AccountCapability`]. The engine never signs or broadcasts on its own.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::push::PushEventBoard;
use crate::types::{AmountFor, LoanKind, PendingTxMap, WalletTx};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "count", rename_all = "snake_case")]
pub enum TxConfirmations {
    Unconfirmed,
    Confirmed(u32),
    Dropped,
}

impl TxConfirmations {
    pub fn count(self) -> u32 {
        match self {
            Self::Confirmed(n) => n,
            Self::Unconfirmed | Self::Dropped => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendTarget {
    pub public_address: String,
    pub native_amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub spend_targets: Vec<SpendTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiatOrder {
    pub wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub native_amount: String,
    pub deposit_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub from_wallet_id: String,
    pub to_wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_token_id: Option<String>,
    pub native_amount: String,
    pub amount_for: AmountFor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapQuote {
    pub request: SwapRequest,
    pub plugin_id: String,
    pub from_native_amount: String,
    pub to_native_amount: String,
    pub network_fee: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRequest {
    pub kind: LoanKind,
    pub borrow_plugin_id: String,
    pub wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub native_amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_token_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanEstimate {
    pub network_fee: String,
}

// ---------------------------------------------------------------------------
// AccountCapability
// ---------------------------------------------------------------------------

/// Opaque wallet, market, and provider access for one account.
///
/// Read methods must not mutate anything; dry-runs rely on that.
#[async_trait]
pub trait AccountCapability: Send + Sync {
    async fn receive_address(&self, wallet_id: &str, token_id: Option<&str>) -> Result<String>;

    async fn balance(&self, wallet_id: &str, address: &str, token_id: Option<&str>)
        -> Result<Decimal>;

    /// Rate for a pair such as `BTC_iso:USD`.
    async fn exchange_rate(&self, currency_pair: &str) -> Result<Decimal>;

    async fn tx_confirmations(&self, wallet_id: &str, tx_id: &str) -> Result<TxConfirmations>;

    /// Snapshot of unconfirmed transactions across every wallet.
    async fn pending_txs(&self) -> Result<PendingTxMap>;

    async fn make_spend(&self, wallet_id: &str, request: &SpendRequest) -> Result<WalletTx>;

    async fn sign_tx(&self, wallet_id: &str, tx: WalletTx) -> Result<WalletTx>;

    async fn broadcast_tx(&self, wallet_id: &str, tx: WalletTx) -> Result<WalletTx>;

    async fn save_tx(&self, wallet_id: &str, tx: &WalletTx) -> Result<()>;

    async fn broadcast_raw(&self, wallet_id: &str, tx_id: &str, raw_tx: &str) -> Result<WalletTx>;

    /// Place a fiat purchase paying out to `order.deposit_address`.
    async fn fiat_buy(&self, order: &FiatOrder) -> Result<()>;

    /// Deposit address for selling into a fiat account.
    async fn fiat_sell_address(
        &self,
        account_id: &str,
        wallet_id: &str,
        token_id: Option<&str>,
    ) -> Result<String>;

    async fn swap_quote(&self, request: &SwapRequest) -> Result<SwapQuote>;

    /// Execute a quote. Returns the source-side transaction.
    async fn approve_swap(&self, quote: &SwapQuote) -> Result<WalletTx>;

    async fn loan_estimate(&self, request: &LoanRequest) -> Result<LoanEstimate>;

    /// Execute a lending action. Returns the broadcast transactions in order.
    async fn loan_approve(&self, request: &LoanRequest) -> Result<Vec<WalletTx>>;
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Everything the evaluator and checker need, cheap to clone.
#[derive(Clone)]
pub struct ExecutionContext {
    pub account: Arc<dyn AccountCapability>,
    pub push_events: Arc<PushEventBoard>,
    pub config: Arc<EngineConfig>,
}

impl ExecutionContext {
    pub fn new(account: Arc<dyn AccountCapability>, config: EngineConfig) -> Self {
        Self {
            account,
            push_events: Arc::new(PushEventBoard::default()),
            config: Arc::new(config),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_count_defaults_to_zero() {
        assert_eq!(TxConfirmations::Confirmed(3).count(), 3);
        assert_eq!(TxConfirmations::Unconfirmed.count(), 0);
        assert_eq!(TxConfirmations::Dropped.count(), 0);
    }
}
