//! Human-readable progress for a program, derived from its op and effect
//! trees without any I/O.

use serde::{Deserialize, Serialize};

use crate::effect::ActionEffect;
use crate::types::{ActionOp, ActionProgram, ActionProgramState, LoanKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Pending,
    Active,
    Done,
    Cancelled,
    Failed(String),
}

impl DisplayStatus {
    pub fn label(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDisplayInfo {
    pub title: String,
    pub message: String,
    pub status: DisplayStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<ActionDisplayInfo>,
}

pub fn program_display(program: &ActionProgram, state: &ActionProgramState) -> ActionDisplayInfo {
    op_display(&program.action_op, state.effect.as_ref(), None)
}

/// `inherited` is set when an ancestor already reached a terminal state.
fn op_display(
    op: &ActionOp,
    effect: Option<&ActionEffect>,
    inherited: Option<&DisplayStatus>,
) -> ActionDisplayInfo {
    let status = match inherited {
        Some(status) => status.clone(),
        None => status_of(effect),
    };
    let terminal = status.is_terminal().then_some(&status);

    let steps = match op {
        ActionOp::Seq { actions } => {
            let (op_index, slots) = match effect {
                Some(ActionEffect::Seq {
                    op_index,
                    child_effects,
                }) => (*op_index, child_effects.as_slice()),
                _ => (0, &[][..]),
            };
            actions
                .iter()
                .enumerate()
                .map(|(i, child)| {
                    let slot = slots.get(i).and_then(Option::as_ref);
                    if terminal.is_none() && i < op_index {
                        op_display(child, slot, Some(&DisplayStatus::Done))
                    } else {
                        op_display(child, slot, terminal)
                    }
                })
                .collect()
        }
        ActionOp::Par { actions } => {
            let slots = match effect {
                Some(ActionEffect::Par { child_effects }) => child_effects.as_slice(),
                _ => &[][..],
            };
            actions
                .iter()
                .enumerate()
                .map(|(i, child)| op_display(child, slots.get(i), terminal))
                .collect()
        }
        _ => Vec::new(),
    };

    let mut message = describe_op(op);
    if let (DisplayStatus::Active, Some(effect)) = (&status, effect) {
        if let Some(waiting) = describe_wait(effect) {
            message = format!("{message}; waiting for {waiting}");
        }
    }
    if let DisplayStatus::Failed(reason) = &status {
        message = format!("{message}; failed: {reason}");
    }

    ActionDisplayInfo {
        title: title_of(op).to_string(),
        message,
        status,
        steps,
    }
}

fn status_of(effect: Option<&ActionEffect>) -> DisplayStatus {
    match effect {
        None => DisplayStatus::Pending,
        Some(ActionEffect::Done {
            error: Some(e), ..
        }) => DisplayStatus::Failed(e.message.clone()),
        Some(ActionEffect::Done {
            cancelled: true, ..
        }) => DisplayStatus::Cancelled,
        Some(ActionEffect::Done { .. }) => DisplayStatus::Done,
        Some(_) => DisplayStatus::Active,
    }
}

fn title_of(op: &ActionOp) -> &'static str {
    match op {
        ActionOp::Seq { .. } => "Run in order",
        ActionOp::Par { .. } => "Run together",
        ActionOp::BroadcastTx(_) => "Broadcast transaction",
        ActionOp::WyreBuy(_) => "Buy crypto",
        ActionOp::WyreSell(_) => "Sell crypto",
        ActionOp::Swap(_) => "Swap",
        ActionOp::LoanBorrow(_) => "Borrow",
        ActionOp::LoanDeposit(_) => "Deposit collateral",
        ActionOp::LoanRepay(_) => "Repay loan",
        ActionOp::LoanWithdraw(_) => "Withdraw collateral",
    }
}

fn asset(wallet_id: &str, token_id: Option<&str>) -> String {
    match token_id {
        Some(token) => format!("{token} in {wallet_id}"),
        None => wallet_id.to_string(),
    }
}

fn describe_op(op: &ActionOp) -> String {
    match op {
        ActionOp::Seq { actions } => format!("{} steps, one after another", actions.len()),
        ActionOp::Par { actions } => format!("{} steps at once", actions.len()),
        ActionOp::BroadcastTx(op) => format!("send {} from {}", op.tx_id, op.wallet_id),
        ActionOp::WyreBuy(op) => format!(
            "buy {} into {}",
            op.native_amount,
            asset(&op.wallet_id, op.token_id.as_deref())
        ),
        ActionOp::WyreSell(op) => format!(
            "sell {} from {} via {}",
            op.native_amount,
            asset(&op.wallet_id, op.token_id.as_deref()),
            op.wyre_account_id
        ),
        ActionOp::Swap(op) => format!(
            "swap {} from {} to {}",
            op.native_amount,
            asset(&op.from_wallet_id, op.from_token_id.as_deref()),
            asset(&op.to_wallet_id, op.to_token_id.as_deref())
        ),
        other => match other.loan_kind() {
            Some((kind, op)) => {
                let direction = match kind {
                    LoanKind::Borrow | LoanKind::Withdraw => "into",
                    LoanKind::Deposit | LoanKind::Repay => "from",
                };
                format!(
                    "{kind} {} {direction} {} on {}",
                    op.native_amount,
                    asset(&op.wallet_id, op.token_id.as_deref()),
                    op.borrow_plugin_id
                )
            }
            None => other.type_name().to_string(),
        },
    }
}

fn describe_wait(effect: &ActionEffect) -> Option<String> {
    match effect {
        ActionEffect::AddressBalance {
            address,
            above_amount,
            below_amount,
            ..
        } => Some(match (above_amount, below_amount) {
            (Some(above), Some(below)) => {
                format!("balance of {address} between {above} and {below}")
            }
            (Some(above), None) => format!("balance of {address} above {above}"),
            (None, Some(below)) => format!("balance of {address} below {below}"),
            (None, None) => format!("balance of {address}"),
        }),
        ActionEffect::PriceLevel {
            currency_pair,
            above_rate,
            below_rate,
        } => Some(match (above_rate, below_rate) {
            (Some(above), _) => format!("{currency_pair} above {above}"),
            (None, Some(below)) => format!("{currency_pair} below {below}"),
            (None, None) => currency_pair.clone(),
        }),
        ActionEffect::TxConfs {
            tx_id,
            confirmations,
            ..
        } => Some(format!("{confirmations} confirmation(s) of {tx_id}")),
        ActionEffect::PushEvent { event_id, .. } => Some(format!("event {event_id}")),
        _ => None,
    }
}
