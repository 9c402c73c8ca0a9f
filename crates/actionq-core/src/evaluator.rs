//! Action evaluator: compiles an op plus its recorded progress into an
//! [`ExecutableAction`] the scheduler can dry-run and execute.
//!
//! Evaluation itself is synchronous and does no I/O; it only validates the
//! op and picks the child that should run next. All wallet and provider
//! traffic happens inside `dryrun` and `execute`.

use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::amount::{checked_add, checked_mul, checked_sub, parse_native, to_native_string};
use crate::capability::{
    ExecutionContext, FiatOrder, LoanRequest, SpendRequest, SpendTarget, SwapQuote, SwapRequest,
};
use crate::effect::{collapse_par, ActionEffect};
use crate::error::{ActionQueueError, Result};
use crate::types::{
    ActionOp, ActionProgram, ActionProgramState, BroadcastTx, BroadcastTxOp, ExecutionOutput,
    LoanKind, LoanOp, PendingTxMap, SwapOp, WalletTx, WyreBuyOp, WyreSellOp,
};

/// A runnable unit produced by [`evaluate_action`].
#[async_trait]
pub trait ExecutableAction: Send + Sync {
    /// Preview execution without side effects.
    ///
    /// `None` means running now would be redundant or would collide with a
    /// pending transaction. Previews never report broadcast transactions.
    async fn dryrun(&self, pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>>;

    /// Perform the real side effect.
    async fn execute(&self) -> Result<ExecutionOutput>;
}

/// Compile `program` at its current progress into an executable unit.
pub fn evaluate_action(
    ctx: &ExecutionContext,
    program: &ActionProgram,
    state: &ActionProgramState,
) -> Result<Box<dyn ExecutableAction>> {
    validate_op(&program.action_op)?;
    evaluate_op(
        ctx,
        &program.action_op,
        state.effect.as_ref(),
        state.effective,
        program.mock_mode,
    )
}

/// Static checks that need no I/O: non-empty composites, well-formed
/// positive amounts, distinct swap endpoints.
pub fn validate_op(op: &ActionOp) -> Result<()> {
    match op {
        ActionOp::Seq { actions } | ActionOp::Par { actions } => {
            if actions.is_empty() {
                return Err(ActionQueueError::InvalidProgram(format!(
                    "{} op has no actions",
                    op.type_name()
                )));
            }
            actions.iter().try_for_each(validate_op)
        }
        ActionOp::BroadcastTx(op) => {
            if op.tx_id.is_empty() || op.raw_tx.is_empty() {
                return Err(ActionQueueError::InvalidProgram(
                    "broadcast-tx needs tx_id and raw_tx".into(),
                ));
            }
            Ok(())
        }
        ActionOp::WyreBuy(op) => parse_native(&op.native_amount).map(drop),
        ActionOp::WyreSell(op) => parse_native(&op.native_amount).map(drop),
        ActionOp::LoanBorrow(op)
        | ActionOp::LoanDeposit(op)
        | ActionOp::LoanRepay(op)
        | ActionOp::LoanWithdraw(op) => parse_native(&op.native_amount).map(drop),
        ActionOp::Swap(op) => {
            parse_native(&op.native_amount)?;
            if op.from_wallet_id == op.to_wallet_id && op.from_token_id == op.to_token_id {
                return Err(ActionQueueError::CurrencyMismatch {
                    expected: "distinct swap source and destination".into(),
                    actual: format!("{} -> {}", op.from_wallet_id, op.to_wallet_id),
                });
            }
            Ok(())
        }
    }
}

fn evaluate_op(
    ctx: &ExecutionContext,
    op: &ActionOp,
    effect: Option<&ActionEffect>,
    effective: bool,
    mock: bool,
) -> Result<Box<dyn ExecutableAction>> {
    if let Some(done @ ActionEffect::Done { .. }) = effect {
        return Ok(Box::new(Settled(done.clone())));
    }
    match op {
        ActionOp::Seq { actions } => evaluate_seq(ctx, actions, effect, effective, mock),
        ActionOp::Par { actions } => evaluate_par(ctx, actions, effect, effective, mock),
        leaf => evaluate_leaf(ctx, leaf, effect, effective, mock),
    }
}

// ---------------------------------------------------------------------------
// seq
// ---------------------------------------------------------------------------

fn evaluate_seq(
    ctx: &ExecutionContext,
    actions: &[ActionOp],
    effect: Option<&ActionEffect>,
    effective: bool,
    mock: bool,
) -> Result<Box<dyn ExecutableAction>> {
    let len = actions.len();
    let (mut op_index, mut slots) = match effect {
        None => (0, vec![None; len]),
        Some(ActionEffect::Seq {
            op_index,
            child_effects,
        }) => (*op_index, child_effects.clone()),
        Some(other) => return Err(mismatched("seq", other)),
    };
    slots.resize(len, None);

    // Skip over children that are already finished so the next one is
    // targeted directly and nothing completed runs twice.
    while op_index < len {
        match &slots[op_index] {
            Some(child) if child.is_aborted() => return Ok(Box::new(Settled(child.clone()))),
            Some(child) if child.is_success() => op_index += 1,
            Some(child) if effective && child.is_condition() => {
                slots[op_index] = Some(ActionEffect::done());
                op_index += 1;
            }
            _ => break,
        }
    }
    if op_index >= len {
        return Ok(Box::new(Settled(ActionEffect::done())));
    }

    let child = evaluate_op(
        ctx,
        &actions[op_index],
        slots[op_index].as_ref(),
        effective,
        mock,
    )?;
    Ok(Box::new(SeqAction {
        op_index,
        slots,
        child,
    }))
}

struct SeqAction {
    op_index: usize,
    slots: Vec<Option<ActionEffect>>,
    child: Box<dyn ExecutableAction>,
}

impl SeqAction {
    /// Fold the active child's new effect into the sequence effect.
    fn wrap(&self, child_effect: ActionEffect) -> ActionEffect {
        if child_effect.is_aborted() {
            return child_effect;
        }
        let mut slots = self.slots.clone();
        if child_effect.is_success() {
            if self.op_index + 1 >= slots.len() {
                return ActionEffect::done();
            }
            slots[self.op_index] = Some(child_effect);
            return ActionEffect::Seq {
                op_index: self.op_index + 1,
                child_effects: slots,
            };
        }
        slots[self.op_index] = Some(child_effect);
        ActionEffect::Seq {
            op_index: self.op_index,
            child_effects: slots,
        }
    }
}

#[async_trait]
impl ExecutableAction for SeqAction {
    async fn dryrun(&self, pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        let Some(output) = self.child.dryrun(pending_txs).await? else {
            return Ok(None);
        };
        Ok(Some(ExecutionOutput {
            effect: self.wrap(output.effect),
            broadcast_txs: output.broadcast_txs,
        }))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        let output = self.child.execute().await?;
        Ok(ExecutionOutput {
            effect: self.wrap(output.effect),
            broadcast_txs: output.broadcast_txs,
        })
    }
}

// ---------------------------------------------------------------------------
// par
// ---------------------------------------------------------------------------

fn evaluate_par(
    ctx: &ExecutionContext,
    actions: &[ActionOp],
    effect: Option<&ActionEffect>,
    effective: bool,
    mock: bool,
) -> Result<Box<dyn ExecutableAction>> {
    let prior: Vec<Option<ActionEffect>> = match effect {
        None => vec![None; actions.len()],
        Some(ActionEffect::Par { child_effects }) if child_effects.len() == actions.len() => {
            child_effects.iter().cloned().map(Some).collect()
        }
        Some(other) => return Err(mismatched("par", other)),
    };

    let mut children = Vec::with_capacity(actions.len());
    for (op, child_effect) in actions.iter().zip(&prior) {
        let child = match child_effect {
            Some(e) if e.is_done() => None,
            _ => Some(evaluate_op(ctx, op, child_effect.as_ref(), effective, mock)?),
        };
        children.push(child);
    }
    if children.iter().all(Option::is_none) {
        return Ok(Box::new(Settled(collapse_par(
            prior.into_iter().flatten().collect(),
        ))));
    }

    Ok(Box::new(ParAction { prior, children }))
}

struct ParAction {
    prior: Vec<Option<ActionEffect>>,
    /// `None` for children that were already done.
    children: Vec<Option<Box<dyn ExecutableAction>>>,
}

impl ParAction {
    fn finished(&self, index: usize) -> ActionEffect {
        self.prior[index].clone().unwrap_or_else(ActionEffect::done)
    }
}

#[async_trait]
impl ExecutableAction for ParAction {
    async fn dryrun(&self, pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        let previews = join_all(self.children.iter().map(|child| async move {
            match child {
                Some(child) => child.dryrun(pending_txs).await.map(Some),
                None => Ok(None),
            }
        }))
        .await;

        let mut effects = Vec::with_capacity(previews.len());
        let mut broadcast_txs = Vec::new();
        for (index, preview) in previews.into_iter().enumerate() {
            match preview? {
                Some(Some(output)) => {
                    effects.push(output.effect);
                    broadcast_txs.extend(output.broadcast_txs);
                }
                // Any active child that must wait holds back the whole fan-out.
                Some(None) => return Ok(None),
                None => effects.push(self.finished(index)),
            }
        }
        Ok(Some(ExecutionOutput {
            effect: collapse_par(effects),
            broadcast_txs,
        }))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        let results = join_all(self.children.iter().map(|child| async move {
            match child {
                Some(child) => Some(child.execute().await),
                None => None,
            }
        }))
        .await;

        let mut effects = Vec::with_capacity(results.len());
        let mut broadcast_txs = Vec::new();
        let mut first_error: Option<ActionQueueError> = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(output)) => {
                    effects.push(output.effect);
                    broadcast_txs.extend(output.broadcast_txs);
                }
                Some(Err(e)) => {
                    warn!(child = index, error = %e, "parallel child failed");
                    effects.push(ActionEffect::failed(&e));
                    first_error.get_or_insert(e);
                }
                None => effects.push(self.finished(index)),
            }
        }
        // Siblings may already have broadcast; report them alongside the failure.
        if let Some(e) = first_error {
            return Ok(ExecutionOutput {
                effect: ActionEffect::failed(&e),
                broadcast_txs,
            });
        }
        Ok(ExecutionOutput {
            effect: collapse_par(effects),
            broadcast_txs,
        })
    }
}

// ---------------------------------------------------------------------------
// Leaves
// ---------------------------------------------------------------------------

fn evaluate_leaf(
    ctx: &ExecutionContext,
    op: &ActionOp,
    effect: Option<&ActionEffect>,
    effective: bool,
    mock: bool,
) -> Result<Box<dyn ExecutableAction>> {
    match effect {
        // The condition this op was waiting on has been observed.
        Some(_) if effective => return Ok(Box::new(Settled(ActionEffect::done()))),
        Some(current) => return Ok(Box::new(Waiting(current.clone()))),
        None => {}
    }
    if mock {
        return Ok(Box::new(MockAction {
            op_type: op.type_name(),
        }));
    }

    let ctx = ctx.clone();
    let action: Box<dyn ExecutableAction> = match op {
        ActionOp::BroadcastTx(op) => Box::new(BroadcastTxAction {
            ctx,
            op: op.clone(),
        }),
        ActionOp::WyreBuy(op) => Box::new(WyreBuyAction {
            ctx,
            op: op.clone(),
        }),
        ActionOp::WyreSell(op) => Box::new(WyreSellAction {
            ctx,
            op: op.clone(),
        }),
        ActionOp::Swap(op) => Box::new(SwapAction {
            ctx,
            op: op.clone(),
        }),
        other => match other.loan_kind() {
            Some((kind, op)) => Box::new(LoanAction {
                ctx,
                kind,
                op: op.clone(),
            }),
            None => {
                return Err(ActionQueueError::InvalidProgram(format!(
                    "{} is not a leaf op",
                    other.type_name()
                )))
            }
        },
    };
    Ok(action)
}

fn mismatched(op_type: &str, effect: &ActionEffect) -> ActionQueueError {
    ActionQueueError::InvalidProgram(format!(
        "{op_type} op cannot resume from a {} effect",
        effect.type_name()
    ))
}

fn has_pending(pending_txs: &PendingTxMap, wallet_id: &str) -> bool {
    pending_txs.get(wallet_id).is_some_and(|txs| !txs.is_empty())
}

/// Watch for the balance to grow to at least `current + amount`.
fn balance_rises(
    wallet_id: &str,
    address: String,
    token_id: Option<String>,
    current: Decimal,
    amount: Decimal,
) -> Result<ActionEffect> {
    let above = checked_sub(checked_add(current, amount)?, Decimal::ONE)?;
    Ok(ActionEffect::AddressBalance {
        wallet_id: wallet_id.to_string(),
        address,
        token_id,
        above_amount: Some(to_native_string(above)),
        below_amount: None,
    })
}

/// Watch for the balance to drop to at most `current - amount`.
fn balance_falls(
    wallet_id: &str,
    address: String,
    token_id: Option<String>,
    current: Decimal,
    amount: Decimal,
) -> Result<ActionEffect> {
    let below = checked_add(checked_sub(current, amount)?, Decimal::ONE)?;
    Ok(ActionEffect::AddressBalance {
        wallet_id: wallet_id.to_string(),
        address,
        token_id,
        above_amount: None,
        below_amount: Some(to_native_string(below)),
    })
}

fn tx_confs(ctx: &ExecutionContext, tx: &WalletTx) -> ActionEffect {
    ActionEffect::TxConfs {
        tx_id: tx.tx_id.clone(),
        wallet_id: tx.wallet_id.clone(),
        confirmations: ctx.config.tx_confirmations,
    }
}

/// An op whose outcome is already known.
struct Settled(ActionEffect);

#[async_trait]
impl ExecutableAction for Settled {
    async fn dryrun(&self, _pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        Ok(Some(ExecutionOutput::watch(self.0.clone())))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        Ok(ExecutionOutput::watch(self.0.clone()))
    }
}

/// A leaf still waiting on its effect; never re-executes.
///
/// The scheduler polls instead of evaluating while an effect is pending, so
/// only direct callers of [`evaluate_action`] reach this. It keeps them from
/// repeating a side effect that is already under watch.
struct Waiting(ActionEffect);

#[async_trait]
impl ExecutableAction for Waiting {
    async fn dryrun(&self, _pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        Ok(None)
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        Ok(ExecutionOutput::watch(self.0.clone()))
    }
}

struct MockAction {
    op_type: &'static str,
}

#[async_trait]
impl ExecutableAction for MockAction {
    async fn dryrun(&self, _pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        Ok(Some(ExecutionOutput::watch(ActionEffect::done())))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        debug!(op = self.op_type, "mock execution");
        Ok(ExecutionOutput::watch(ActionEffect::done()))
    }
}

// ---------------------------------------------------------------------------
// broadcast-tx
// ---------------------------------------------------------------------------

struct BroadcastTxAction {
    ctx: ExecutionContext,
    op: BroadcastTxOp,
}

impl BroadcastTxAction {
    fn effect(&self) -> ActionEffect {
        ActionEffect::TxConfs {
            tx_id: self.op.tx_id.clone(),
            wallet_id: self.op.wallet_id.clone(),
            confirmations: self.ctx.config.tx_confirmations,
        }
    }
}

#[async_trait]
impl ExecutableAction for BroadcastTxAction {
    async fn dryrun(&self, pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        let already_pending = pending_txs
            .get(&self.op.wallet_id)
            .is_some_and(|txs| txs.iter().any(|tx| tx.tx_id == self.op.tx_id));
        if already_pending {
            return Ok(None);
        }
        Ok(Some(ExecutionOutput::watch(self.effect())))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        let account = &self.ctx.account;
        let tx = account
            .broadcast_raw(&self.op.wallet_id, &self.op.tx_id, &self.op.raw_tx)
            .await?;
        account.save_tx(&self.op.wallet_id, &tx).await?;
        Ok(ExecutionOutput {
            effect: self.effect(),
            broadcast_txs: vec![BroadcastTx::from(tx)],
        })
    }
}

// ---------------------------------------------------------------------------
// wyre-buy
// ---------------------------------------------------------------------------

struct WyreBuyAction {
    ctx: ExecutionContext,
    op: WyreBuyOp,
}

impl WyreBuyAction {
    async fn watch(&self) -> Result<(String, ActionEffect)> {
        let amount = parse_native(&self.op.native_amount)?;
        let token_id = self.op.token_id.as_deref();
        let account = &self.ctx.account;
        let address = account.receive_address(&self.op.wallet_id, token_id).await?;
        let current = account.balance(&self.op.wallet_id, &address, token_id).await?;
        let effect = balance_rises(
            &self.op.wallet_id,
            address.clone(),
            self.op.token_id.clone(),
            current,
            amount,
        )?;
        Ok((address, effect))
    }
}

#[async_trait]
impl ExecutableAction for WyreBuyAction {
    async fn dryrun(&self, _pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        let (_, effect) = self.watch().await?;
        Ok(Some(ExecutionOutput::watch(effect)))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        let (deposit_address, effect) = self.watch().await?;
        self.ctx
            .account
            .fiat_buy(&FiatOrder {
                wallet_id: self.op.wallet_id.clone(),
                token_id: self.op.token_id.clone(),
                native_amount: self.op.native_amount.clone(),
                deposit_address,
            })
            .await?;
        Ok(ExecutionOutput::watch(effect))
    }
}

// ---------------------------------------------------------------------------
// wyre-sell
// ---------------------------------------------------------------------------

struct WyreSellAction {
    ctx: ExecutionContext,
    op: WyreSellOp,
}

#[async_trait]
impl ExecutableAction for WyreSellAction {
    async fn dryrun(&self, pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        if has_pending(pending_txs, &self.op.wallet_id) {
            return Ok(None);
        }
        let amount = parse_native(&self.op.native_amount)?;
        let token_id = self.op.token_id.as_deref();
        let account = &self.ctx.account;
        let address = account.receive_address(&self.op.wallet_id, token_id).await?;
        let current = account.balance(&self.op.wallet_id, &address, token_id).await?;
        if current < amount {
            return Err(ActionQueueError::InsufficientFunds {
                wallet_id: self.op.wallet_id.clone(),
                needed: self.op.native_amount.clone(),
                available: to_native_string(current),
            });
        }
        let effect = balance_falls(
            &self.op.wallet_id,
            address,
            self.op.token_id.clone(),
            current,
            amount,
        )?;
        Ok(Some(ExecutionOutput::watch(effect)))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        let account = &self.ctx.account;
        let wallet_id = &self.op.wallet_id;
        let deposit = account
            .fiat_sell_address(&self.op.wyre_account_id, wallet_id, self.op.token_id.as_deref())
            .await?;
        let request = SpendRequest {
            token_id: self.op.token_id.clone(),
            spend_targets: vec![SpendTarget {
                public_address: deposit,
                native_amount: self.op.native_amount.clone(),
            }],
        };
        let unsigned = account.make_spend(wallet_id, &request).await?;
        let signed = account.sign_tx(wallet_id, unsigned).await?;
        let tx = account.broadcast_tx(wallet_id, signed).await?;
        account.save_tx(wallet_id, &tx).await?;
        Ok(ExecutionOutput {
            effect: tx_confs(&self.ctx, &tx),
            broadcast_txs: vec![BroadcastTx::from(tx)],
        })
    }
}

// ---------------------------------------------------------------------------
// loan-*
// ---------------------------------------------------------------------------

struct LoanAction {
    ctx: ExecutionContext,
    kind: LoanKind,
    op: LoanOp,
}

impl LoanAction {
    fn request(&self) -> LoanRequest {
        LoanRequest {
            kind: self.kind,
            borrow_plugin_id: self.op.borrow_plugin_id.clone(),
            wallet_id: self.op.wallet_id.clone(),
            token_id: self.op.token_id.clone(),
            native_amount: self.op.native_amount.clone(),
            from_token_id: self.op.from_token_id.clone(),
        }
    }

    /// The token whose balance moves in the wallet.
    fn watched_token(&self) -> Option<String> {
        match self.kind {
            LoanKind::Repay => self.op.from_token_id.clone().or(self.op.token_id.clone()),
            _ => self.op.token_id.clone(),
        }
    }
}

#[async_trait]
impl ExecutableAction for LoanAction {
    async fn dryrun(&self, pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        if has_pending(pending_txs, &self.op.wallet_id) {
            return Ok(None);
        }
        let amount = parse_native(&self.op.native_amount)?;
        let account = &self.ctx.account;
        let estimate = account.loan_estimate(&self.request()).await?;
        debug!(kind = %self.kind, fee = %estimate.network_fee, "loan estimate");

        let token_id = self.watched_token();
        let address = account
            .receive_address(&self.op.wallet_id, token_id.as_deref())
            .await?;
        let current = account
            .balance(&self.op.wallet_id, &address, token_id.as_deref())
            .await?;
        let effect = if self.kind.credits_wallet() {
            balance_rises(&self.op.wallet_id, address, token_id, current, amount)?
        } else {
            balance_falls(&self.op.wallet_id, address, token_id, current, amount)?
        };
        Ok(Some(ExecutionOutput::watch(effect)))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        let account = &self.ctx.account;
        let txs = account.loan_approve(&self.request()).await?;
        for tx in &txs {
            account.save_tx(&tx.wallet_id, tx).await?;
        }
        let effect = match txs.last() {
            Some(last) => tx_confs(&self.ctx, last),
            None => ActionEffect::done(),
        };
        Ok(ExecutionOutput {
            effect,
            broadcast_txs: txs.into_iter().map(BroadcastTx::from).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// swap
// ---------------------------------------------------------------------------

struct SwapAction {
    ctx: ExecutionContext,
    op: SwapOp,
}

impl SwapAction {
    fn request(&self) -> SwapRequest {
        SwapRequest {
            from_wallet_id: self.op.from_wallet_id.clone(),
            to_wallet_id: self.op.to_wallet_id.clone(),
            from_token_id: self.op.from_token_id.clone(),
            to_token_id: self.op.to_token_id.clone(),
            native_amount: self.op.native_amount.clone(),
            amount_for: self.op.amount_for,
        }
    }

    /// Quote, then describe the destination balance the swap should produce.
    async fn quote_and_watch(&self) -> Result<(SwapQuote, ActionEffect)> {
        let account = &self.ctx.account;
        let quote = account.swap_quote(&self.request()).await?;
        let to_amount = parse_native(&quote.to_native_amount)?;
        let keep = Decimal::ONE - self.ctx.config.slippage();
        let min_received = checked_mul(to_amount, keep)?.floor();

        let to_token = self.op.to_token_id.as_deref();
        let address = account
            .receive_address(&self.op.to_wallet_id, to_token)
            .await?;
        let current = account
            .balance(&self.op.to_wallet_id, &address, to_token)
            .await?;
        let effect = balance_rises(
            &self.op.to_wallet_id,
            address,
            self.op.to_token_id.clone(),
            current,
            min_received.max(Decimal::ONE),
        )?;
        Ok((quote, effect))
    }
}

#[async_trait]
impl ExecutableAction for SwapAction {
    async fn dryrun(&self, pending_txs: &PendingTxMap) -> Result<Option<ExecutionOutput>> {
        if has_pending(pending_txs, &self.op.from_wallet_id) {
            return Ok(None);
        }
        let (_, effect) = self.quote_and_watch().await?;
        Ok(Some(ExecutionOutput::watch(effect)))
    }

    async fn execute(&self) -> Result<ExecutionOutput> {
        let (quote, effect) = self.quote_and_watch().await?;
        let account = &self.ctx.account;
        let tx = account.approve_swap(&quote).await?;
        account.save_tx(&self.op.from_wallet_id, &tx).await?;
        Ok(ExecutionOutput {
            effect,
            broadcast_txs: vec![BroadcastTx::from(tx)],
        })
    }
}
