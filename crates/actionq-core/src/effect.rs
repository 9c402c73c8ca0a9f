//! Runtime-observable conditions that mark an op as complete.

use serde::{Deserialize, Serialize};

use crate::error::{ActionQueueError, EffectError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionEffect {
    /// Progress through a `seq` op. One slot per child; `None` marks a child
    /// that has not been executed yet.
    Seq {
        op_index: usize,
        child_effects: Vec<Option<ActionEffect>>,
    },
    /// Progress through a `par` op, one effect per child.
    Par { child_effects: Vec<ActionEffect> },
    AddressBalance {
        wallet_id: String,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        above_amount: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        below_amount: Option<String>,
    },
    PriceLevel {
        currency_pair: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        above_rate: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        below_rate: Option<String>,
    },
    TxConfs {
        tx_id: String,
        wallet_id: String,
        confirmations: u32,
    },
    /// Wait for an externally signalled event, then for `effect` if present.
    PushEvent {
        event_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        effect: Option<Box<ActionEffect>>,
    },
    /// Terminal. Never re-evaluated.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<EffectError>,
        #[serde(default)]
        cancelled: bool,
    },
}

impl ActionEffect {
    pub fn done() -> Self {
        Self::Done {
            error: None,
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self::Done {
            error: None,
            cancelled: true,
        }
    }

    pub fn failed(err: &ActionQueueError) -> Self {
        Self::Done {
            error: Some(err.into()),
            cancelled: false,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// `done` without error or cancellation.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Done {
                error: None,
                cancelled: false
            }
        )
    }

    /// `done` with an error or a cancellation.
    pub fn is_aborted(&self) -> bool {
        self.is_done() && !self.is_success()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Done { cancelled: true, .. })
    }

    pub fn error(&self) -> Option<&EffectError> {
        match self {
            Self::Done { error, .. } => error.as_ref(),
            _ => None,
        }
    }

    /// Leaf conditions: observed true means the op that produced them is complete.
    pub fn is_condition(&self) -> bool {
        matches!(
            self,
            Self::AddressBalance { .. }
                | Self::PriceLevel { .. }
                | Self::TxConfs { .. }
                | Self::PushEvent { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Seq { .. } => "seq",
            Self::Par { .. } => "par",
            Self::AddressBalance { .. } => "address-balance",
            Self::PriceLevel { .. } => "price-level",
            Self::TxConfs { .. } => "tx-confs",
            Self::PushEvent { .. } => "push-event",
            Self::Done { .. } => "done",
        }
    }
}

/// Fold child effects of a `par` into the parent effect.
///
/// The first aborted child (lowest index) wins; all-success collapses to
/// `done`; anything else stays a `par`.
pub fn collapse_par(child_effects: Vec<ActionEffect>) -> ActionEffect {
    if let Some(aborted) = child_effects.iter().find(|e| e.is_aborted()) {
        return aborted.clone();
    }
    if child_effects.iter().all(ActionEffect::is_success) {
        return ActionEffect::done();
    }
    ActionEffect::Par { child_effects }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confs(tx: &str) -> ActionEffect {
        ActionEffect::TxConfs {
            tx_id: tx.into(),
            wallet_id: "w".into(),
            confirmations: 1,
        }
    }

    #[test]
    fn done_serializes_with_type_tag() {
        let json = serde_json::to_value(ActionEffect::cancelled()).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["cancelled"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn seq_placeholder_slots_round_trip_as_null() {
        let effect = ActionEffect::Seq {
            op_index: 1,
            child_effects: vec![Some(ActionEffect::done()), None],
        };
        let json = serde_json::to_string(&effect).unwrap();
        assert!(json.contains("null"));
        let back: ActionEffect = serde_json::from_str(&json).unwrap();
        assert_eq!(back, effect);
    }

    #[test]
    fn failed_records_error_kind() {
        let err = ActionQueueError::PolicyNotFound("aave".into());
        let effect = ActionEffect::failed(&err);
        assert!(effect.is_aborted());
        assert_eq!(effect.error().unwrap().kind, "policy_not_found");
    }

    #[test]
    fn collapse_par_waits_for_every_child() {
        let effect = collapse_par(vec![ActionEffect::done(), confs("a")]);
        assert_eq!(effect.type_name(), "par");
        assert!(collapse_par(vec![ActionEffect::done(), ActionEffect::done()]).is_success());
    }

    #[test]
    fn collapse_par_first_failure_wins() {
        let first = ActionEffect::failed(&ActionQueueError::Network("a".into()));
        let second = ActionEffect::failed(&ActionQueueError::TxDropped("b".into()));
        let effect = collapse_par(vec![confs("x"), first.clone(), second]);
        assert_eq!(effect, first);
    }
}
