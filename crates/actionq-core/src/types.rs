use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::effect::ActionEffect;

// ---------------------------------------------------------------------------
// ActionOp
// ---------------------------------------------------------------------------

/// One node of a program's operation tree.
///
/// Ops are pure descriptions and never carry runtime state; progress lives
/// in the [`ActionEffect`] tree recorded on [`ActionProgramState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionOp {
    /// Run children strictly in order.
    Seq { actions: Vec<ActionOp> },
    /// Run children independently; complete once all are done.
    Par { actions: Vec<ActionOp> },
    BroadcastTx(BroadcastTxOp),
    WyreBuy(WyreBuyOp),
    WyreSell(WyreSellOp),
    LoanBorrow(LoanOp),
    LoanDeposit(LoanOp),
    LoanRepay(LoanOp),
    LoanWithdraw(LoanOp),
    Swap(SwapOp),
}

impl ActionOp {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Seq { .. } => "seq",
            Self::Par { .. } => "par",
            Self::BroadcastTx(_) => "broadcast-tx",
            Self::WyreBuy(_) => "wyre-buy",
            Self::WyreSell(_) => "wyre-sell",
            Self::LoanBorrow(_) => "loan-borrow",
            Self::LoanDeposit(_) => "loan-deposit",
            Self::LoanRepay(_) => "loan-repay",
            Self::LoanWithdraw(_) => "loan-withdraw",
            Self::Swap(_) => "swap",
        }
    }

    /// The lending action a `loan-*` op asks for.
    pub fn loan_kind(&self) -> Option<(LoanKind, &LoanOp)> {
        match self {
            Self::LoanBorrow(op) => Some((LoanKind::Borrow, op)),
            Self::LoanDeposit(op) => Some((LoanKind::Deposit, op)),
            Self::LoanRepay(op) => Some((LoanKind::Repay, op)),
            Self::LoanWithdraw(op) => Some((LoanKind::Withdraw, op)),
            _ => None,
        }
    }
}

/// Broadcast an already-signed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastTxOp {
    pub wallet_id: String,
    pub tx_id: String,
    /// Hex-encoded signed transaction.
    pub raw_tx: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WyreBuyOp {
    pub wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub native_amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WyreSellOp {
    pub wyre_account_id: String,
    pub wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub native_amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanOp {
    pub borrow_plugin_id: String,
    pub wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub native_amount: String,
    /// Repay only: pay the debt with a different token held in the wallet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_token_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanKind {
    Borrow,
    Deposit,
    Repay,
    Withdraw,
}

impl LoanKind {
    /// Borrowing and withdrawing add funds to the wallet; the others spend.
    pub fn credits_wallet(self) -> bool {
        matches!(self, Self::Borrow | Self::Withdraw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Borrow => "borrow",
            Self::Deposit => "deposit",
            Self::Repay => "repay",
            Self::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for LoanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapOp {
    pub from_wallet_id: String,
    pub to_wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_token_id: Option<String>,
    pub native_amount: String,
    /// Which side of the swap `native_amount` is denominated in.
    #[serde(default)]
    pub amount_for: AmountFor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountFor {
    #[default]
    From,
    To,
}

// ---------------------------------------------------------------------------
// ActionProgram / ActionProgramState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProgram {
    pub program_id: String,
    pub action_op: ActionOp,
    /// Leaves complete without touching any wallet or provider.
    #[serde(default)]
    pub mock_mode: bool,
}

/// Mutable execution record for one program. Only the scheduler writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProgramState {
    pub client_id: String,
    pub program_id: String,
    /// Absent until the first execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<ActionEffect>,
    /// Whether the recorded effect has been observed true.
    #[serde(default)]
    pub effective: bool,
    /// An execution is in flight.
    #[serde(default)]
    pub executing: bool,
    pub last_execution_time: DateTime<Utc>,
    pub next_execution_time: DateTime<Utc>,
}

impl ActionProgramState {
    /// Fresh state for a newly queued program, due immediately.
    pub fn new(
        client_id: impl Into<String>,
        program_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            program_id: program_id.into(),
            effect: None,
            effective: false,
            executing: false,
            last_execution_time: now,
            next_execution_time: now,
        }
    }

    pub fn is_done(&self) -> bool {
        self.effect.as_ref().is_some_and(ActionEffect::is_done)
    }

    pub fn is_cancelled(&self) -> bool {
        self.effect.as_ref().is_some_and(ActionEffect::is_cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionQueueItem {
    pub program: ActionProgram,
    pub state: ActionProgramState,
}

/// Queue entries keyed by program id. A lookup table, not a priority queue.
pub type ActionQueueMap = HashMap<String, ActionQueueItem>;

// ---------------------------------------------------------------------------
// Transactions / execution output
// ---------------------------------------------------------------------------

/// A wallet transaction as reported by the account capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTx {
    pub tx_id: String,
    pub wallet_id: String,
    pub currency_code: String,
    pub native_amount: String,
    pub network_fee: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_tx: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastTx {
    pub wallet_id: String,
    pub network_fee: String,
    pub tx: WalletTx,
}

impl From<WalletTx> for BroadcastTx {
    fn from(tx: WalletTx) -> Self {
        Self {
            wallet_id: tx.wallet_id.clone(),
            network_fee: tx.network_fee.clone(),
            tx,
        }
    }
}

/// Unconfirmed transactions per wallet id, snapshotted by the caller.
pub type PendingTxMap = HashMap<String, Vec<WalletTx>>;

/// What an executed (or previewed) action wants watched, and what it sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub effect: ActionEffect,
    #[serde(default)]
    pub broadcast_txs: Vec<BroadcastTx>,
}

impl ExecutionOutput {
    pub fn watch(effect: ActionEffect) -> Self {
        Self {
            effect,
            broadcast_txs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_uses_kebab_case_tags() {
        let op = ActionOp::Seq {
            actions: vec![ActionOp::WyreBuy(WyreBuyOp {
                wallet_id: "w1".into(),
                token_id: None,
                native_amount: "1000".into(),
            })],
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "seq");
        assert_eq!(json["actions"][0]["type"], "wyre-buy");
        assert!(json["actions"][0].get("token_id").is_none());
    }

    #[test]
    fn program_parses_from_yaml_with_defaults() {
        let yaml = r#"
program_id: p1
action_op:
  type: swap
  from_wallet_id: btc
  to_wallet_id: eth
  native_amount: "5000"
"#;
        let program: ActionProgram = serde_yaml::from_str(yaml).unwrap();
        assert!(!program.mock_mode);
        match program.action_op {
            ActionOp::Swap(op) => assert_eq!(op.amount_for, AmountFor::From),
            other => panic!("expected swap, got {other:?}"),
        }
    }

    #[test]
    fn loan_kind_direction() {
        assert!(LoanKind::Borrow.credits_wallet());
        assert!(LoanKind::Withdraw.credits_wallet());
        assert!(!LoanKind::Repay.credits_wallet());
        assert!(!LoanKind::Deposit.credits_wallet());
    }

    #[test]
    fn new_state_is_idle_and_due() {
        let now = Utc::now();
        let state = ActionProgramState::new("client", "p1", now);
        assert!(state.effect.is_none());
        assert!(!state.effective);
        assert!(!state.executing);
        assert_eq!(state.next_execution_time, now);
        assert!(!state.is_done());
    }
}
