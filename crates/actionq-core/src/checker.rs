//! Effect checker: decides whether a recorded effect currently holds and how
//! long the scheduler should wait before asking again.

use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::debug;

use crate::amount::{parse_bound, within_bounds};
use crate::capability::{ExecutionContext, TxConfirmations};
use crate::effect::{collapse_par, ActionEffect};
use crate::error::{ActionQueueError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct EffectCheckResult {
    /// Advisory wait before the next check.
    pub delay: Duration,
    pub is_effective: bool,
    /// Replacement for the checked effect, applied once it is effective.
    pub updated_effect: Option<ActionEffect>,
}

impl EffectCheckResult {
    fn ready() -> Self {
        Self {
            delay: Duration::ZERO,
            is_effective: true,
            updated_effect: None,
        }
    }

    fn waiting(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            is_effective: false,
            updated_effect: None,
        }
    }

    fn holds(is_effective: bool, delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            is_effective,
            updated_effect: None,
        }
    }
}

/// Check `effect` against live account state.
///
/// Composite effects only look at their active children: the current slot
/// of a `seq`, every non-done child of a `par`. `done` is always effective.
pub fn check_action_effect<'a>(
    ctx: &'a ExecutionContext,
    effect: &'a ActionEffect,
) -> BoxFuture<'a, Result<EffectCheckResult>> {
    async move {
        let poll = &ctx.config.poll;
        match effect {
            ActionEffect::Seq {
                op_index,
                child_effects,
            } => {
                // An empty slot is a child waiting to be executed.
                let Some(Some(active)) = child_effects.get(*op_index) else {
                    return Ok(EffectCheckResult::ready());
                };
                let result = check_action_effect(ctx, active).await?;
                let updated_effect = result.updated_effect.map(|child| {
                    if child.is_aborted() {
                        return child;
                    }
                    let mut slots = child_effects.clone();
                    slots[*op_index] = Some(child);
                    ActionEffect::Seq {
                        op_index: *op_index,
                        child_effects: slots,
                    }
                });
                Ok(EffectCheckResult {
                    delay: result.delay,
                    is_effective: result.is_effective,
                    updated_effect,
                })
            }

            ActionEffect::Par { child_effects } => {
                let active: Vec<usize> = (0..child_effects.len())
                    .filter(|&i| !child_effects[i].is_done())
                    .collect();
                if active.is_empty() {
                    return Ok(EffectCheckResult::ready());
                }

                let results =
                    join_all(active.iter().map(|&i| check_action_effect(ctx, &child_effects[i])))
                        .await;

                let mut delay: Option<Duration> = None;
                let mut is_effective = true;
                let mut slots: Option<Vec<ActionEffect>> = None;
                // Index order, so the lowest failing child is reported.
                for (&i, result) in active.iter().zip(results) {
                    let result = result?;
                    delay = Some(delay.map_or(result.delay, |d| d.min(result.delay)));
                    is_effective &= result.is_effective;
                    if let Some(child) = result.updated_effect {
                        slots.get_or_insert_with(|| child_effects.clone())[i] = child;
                    }
                }

                let updated_effect = slots.map(collapse_par);
                if updated_effect.as_ref().is_some_and(ActionEffect::is_aborted) {
                    return Ok(EffectCheckResult {
                        delay: Duration::ZERO,
                        is_effective: true,
                        updated_effect,
                    });
                }
                Ok(EffectCheckResult {
                    delay: delay.unwrap_or(Duration::ZERO),
                    is_effective,
                    updated_effect,
                })
            }

            ActionEffect::AddressBalance {
                wallet_id,
                address,
                token_id,
                above_amount,
                below_amount,
            } => {
                let above = above_amount.as_deref().map(parse_bound).transpose()?;
                let below = below_amount.as_deref().map(parse_bound).transpose()?;
                let balance = ctx
                    .account
                    .balance(wallet_id, address, token_id.as_deref())
                    .await?;
                let holds = within_bounds(balance, above, below);
                debug!(wallet_id = %wallet_id, %balance, holds, "checked address balance");
                Ok(EffectCheckResult::holds(holds, poll.address_balance_ms))
            }

            ActionEffect::PriceLevel {
                currency_pair,
                above_rate,
                below_rate,
            } => {
                let above = above_rate.as_deref().map(parse_bound).transpose()?;
                let below = below_rate.as_deref().map(parse_bound).transpose()?;
                let rate = ctx.account.exchange_rate(currency_pair).await?;
                let holds = within_bounds(rate, above, below);
                debug!(currency_pair = %currency_pair, %rate, holds, "checked price level");
                Ok(EffectCheckResult::holds(holds, poll.price_level_ms))
            }

            ActionEffect::TxConfs {
                tx_id,
                wallet_id,
                confirmations,
            } => {
                let status = ctx.account.tx_confirmations(wallet_id, tx_id).await?;
                if status == TxConfirmations::Dropped {
                    let err = ActionQueueError::TxDropped(tx_id.clone());
                    return Ok(EffectCheckResult {
                        delay: Duration::ZERO,
                        is_effective: true,
                        updated_effect: Some(ActionEffect::failed(&err)),
                    });
                }
                let count = status.count();
                debug!(tx_id = %tx_id, count, target = confirmations, "checked tx confirmations");
                if count >= *confirmations {
                    return Ok(EffectCheckResult::holds(true, 0));
                }
                let delay_ms = if confirmations - count <= 1 {
                    poll.tx_confs_near_ms
                } else {
                    poll.tx_confs_ms
                };
                Ok(EffectCheckResult::waiting(delay_ms))
            }

            ActionEffect::PushEvent { event_id, effect } => {
                if !ctx.push_events.is_signaled(event_id) {
                    return Ok(EffectCheckResult::waiting(poll.push_event_ms));
                }
                match effect {
                    None => Ok(EffectCheckResult::ready()),
                    Some(nested) => {
                        let result = check_action_effect(ctx, nested).await?;
                        Ok(EffectCheckResult {
                            delay: result.delay,
                            is_effective: result.is_effective,
                            updated_effect: Some(
                                result
                                    .updated_effect
                                    .unwrap_or_else(|| nested.as_ref().clone()),
                            ),
                        })
                    }
                }
            }

            ActionEffect::Done { .. } => Ok(EffectCheckResult::ready()),
        }
    }
    .boxed()
}
