//! Program scheduler.
//!
//! [`ActionQueue`] owns every [`ActionProgramState`] and is the only thing
//! that mutates one. Each tick a due program either executes its next
//! action (evaluate, dry-run, execute) or polls the effect it is waiting
//! on. Work for a single program never overlaps: the `executing` flag is
//! set before any await and cleared when the result is committed.

use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::checker::check_action_effect;
use crate::capability::ExecutionContext;
use crate::db::QueueStore;
use crate::effect::ActionEffect;
use crate::error::{ActionQueueError, EffectError, Result};
use crate::evaluator::{evaluate_action, validate_op};
use crate::types::{
    ActionProgram, ActionProgramState, ActionQueueItem, ActionQueueMap, PendingTxMap,
};

// ---------------------------------------------------------------------------
// TickOutcome / QueueEvent
// ---------------------------------------------------------------------------

/// What a single tick did to a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Not due, already in flight, or already done.
    Skipped,
    /// Backed off: dry-run asked to wait, or a transient failure.
    Deferred,
    /// An action ran and its effect is now being watched.
    Executed,
    Polled { effective: bool },
    /// The program reached a terminal `done` effect on this tick.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Scheduled {
        program_id: String,
    },
    Updated {
        program_id: String,
    },
    Completed {
        program_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<EffectError>,
    },
    Cancelled {
        program_id: String,
    },
}

// ---------------------------------------------------------------------------
// ActionQueue
// ---------------------------------------------------------------------------

pub struct ActionQueue {
    ctx: ExecutionContext,
    items: Mutex<ActionQueueMap>,
    store: Option<Box<dyn QueueStore>>,
    /// Programs whose last write to the store failed.
    unsaved: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<QueueEvent>,
}

impl ActionQueue {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self::from_map(ctx, ActionQueueMap::new())
    }

    /// Rehydrate from a persisted map. Nothing can be in flight after a
    /// restart, so `executing` is cleared on every entry.
    pub fn from_map(ctx: ExecutionContext, mut map: ActionQueueMap) -> Self {
        for item in map.values_mut() {
            item.state.executing = false;
        }
        let (events, _) = broadcast::channel(64);
        Self {
            ctx,
            items: Mutex::new(map),
            store: None,
            unsaved: Mutex::new(BTreeSet::new()),
            events,
        }
    }

    /// Load every program and push event from `store` and write through to
    /// it from then on.
    pub fn from_store(ctx: ExecutionContext, store: impl QueueStore + 'static) -> Result<Self> {
        ctx.push_events.extend(store.signaled_events()?);
        let map = store.load_map()?;
        Ok(Self::from_map(ctx, map).with_store(store))
    }

    /// Persist every state change to `store`.
    pub fn with_store(mut self, store: impl QueueStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, program_id: &str) -> Option<ActionQueueItem> {
        self.lock().get(program_id).cloned()
    }

    /// Snapshot of the whole queue, suitable for persisting elsewhere.
    pub fn snapshot(&self) -> ActionQueueMap {
        self.lock().clone()
    }

    /// Queue a new program, due at `now`.
    pub fn schedule(&self, program: ActionProgram, now: DateTime<Utc>) -> Result<()> {
        validate_op(&program.action_op)?;
        if self.lock().contains_key(&program.program_id) {
            return Err(ActionQueueError::ProgramExists(program.program_id));
        }
        let state = ActionProgramState::new(self.ctx.client_id(), &program.program_id, now);
        let item = ActionQueueItem { program, state };
        if let Some(store) = &self.store {
            if !store.insert_new(&item)? {
                return Err(ActionQueueError::ProgramExists(item.program.program_id));
            }
        }
        self.lock()
            .insert(item.program.program_id.clone(), item.clone());
        info!(program_id = %item.program.program_id, op = item.program.action_op.type_name(), "program scheduled");
        let _ = self.events.send(QueueEvent::Scheduled {
            program_id: item.program.program_id,
        });
        Ok(())
    }

    /// Replace the effect tree with a cancelled `done`. An execute already in
    /// flight is not interrupted, but its result is discarded.
    pub fn cancel(&self, program_id: &str) -> Result<()> {
        let item = {
            let mut items = self.lock();
            let item = items
                .get_mut(program_id)
                .ok_or_else(|| ActionQueueError::ProgramNotFound(program_id.to_string()))?;
            item.state.effect = Some(ActionEffect::cancelled());
            item.state.effective = false;
            item.clone()
        };
        self.write_back(&item)?;
        info!(program_id = %program_id, "program cancelled");
        let _ = self.events.send(QueueEvent::Cancelled {
            program_id: program_id.to_string(),
        });
        Ok(())
    }

    /// Drop every program whose effect is terminal, returning their ids.
    pub fn prune_done(&self) -> Result<Vec<String>> {
        let removed: Vec<String> = {
            let mut items = self.lock();
            let done: Vec<String> = items
                .values()
                .filter(|item| item.state.is_done())
                .map(|item| item.program.program_id.clone())
                .collect();
            for id in &done {
                items.remove(id);
            }
            done
        };
        if let Some(db) = &self.store {
            for id in &removed {
                db.remove(id)?;
            }
        }
        Ok(removed)
    }

    /// Mark a push event as fired. Returns true on the first signal.
    pub fn signal_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let fresh = self.ctx.push_events.signal(event_id);
        if let Some(db) = &self.store {
            db.signal_event(event_id, now)?;
        }
        debug!(event_id = %event_id, fresh, "push event signalled");
        Ok(fresh)
    }

    // -----------------------------------------------------------------------
    // Ticking
    // -----------------------------------------------------------------------

    /// Advance one program by at most one step.
    ///
    /// Store failures never leave the program claimed: a step that cannot
    /// be recorded before it starts is deferred, and a result that cannot
    /// be written afterwards is kept in memory and written on the next
    /// [`run_once`](Self::run_once).
    pub async fn tick_program(
        &self,
        program_id: &str,
        now: DateTime<Utc>,
        pending_txs: &PendingTxMap,
    ) -> Result<TickOutcome> {
        let item = {
            let mut items = self.lock();
            let item = items
                .get_mut(program_id)
                .ok_or_else(|| ActionQueueError::ProgramNotFound(program_id.to_string()))?;
            let state = &item.state;
            if state.is_done() || state.executing || state.next_execution_time > now {
                return Ok(TickOutcome::Skipped);
            }
            item.state.executing = true;
            item.clone()
        };

        let (state, outcome) = if item.state.effect.is_none() || item.state.effective {
            // Record the in-flight flag so a crash mid-execute is visible on restart.
            match self.write_back(&item) {
                Ok(stored) if stored.state.is_cancelled() => {
                    return Ok(self.adopt_cancellation(program_id, stored));
                }
                Ok(_) => self.execute_step(&item, now, pending_txs).await,
                Err(e) => {
                    warn!(program_id = %program_id, error = %e, "could not record step start; will retry");
                    let mut items = self.lock();
                    if let Some(current) = items.get_mut(program_id) {
                        current.state.executing = false;
                        current.state.next_execution_time = later(now, self.ctx.config.retry_delay());
                    }
                    return Ok(TickOutcome::Deferred);
                }
            }
        } else {
            self.poll_step(&item, now).await
        };
        Ok(self.commit(program_id, state, outcome))
    }

    /// Tick every program that is due at `now`, earliest first. A failure
    /// on one program is logged and does not hold back the rest.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        pending_txs: &PendingTxMap,
    ) -> Vec<(String, TickOutcome)> {
        let due: Vec<String> = {
            let items = self.lock();
            let mut due: Vec<&ActionQueueItem> = items
                .values()
                .filter(|item| {
                    !item.state.is_done()
                        && !item.state.executing
                        && item.state.next_execution_time <= now
                })
                .collect();
            due.sort_by_key(|item| item.state.next_execution_time);
            due.into_iter()
                .map(|item| item.program.program_id.clone())
                .collect()
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for program_id in due {
            match self.tick_program(&program_id, now, pending_txs).await {
                Ok(outcome) => outcomes.push((program_id, outcome)),
                Err(e) => warn!(program_id = %program_id, error = %e, "tick failed"),
            }
        }
        outcomes
    }

    /// One scheduler pass: retry unsaved results, pick up what other
    /// processes changed in the store, snapshot pending transactions, tick.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Vec<(String, TickOutcome)>> {
        self.flush_unsaved();
        if let Err(e) = self.sync_from_store() {
            warn!(error = %e, "could not read queue store; ticking from memory");
        }
        let pending_txs = match self.ctx.account.pending_txs().await {
            Ok(pending) => pending,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "could not snapshot pending transactions; skipping tick");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(self.tick(now, &pending_txs).await)
    }

    /// Tick every `tick_interval_ms` until `shutdown` flips to true. A failed
    /// pass is logged and retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.ctx.config.tick_interval();
        info!(interval_ms = interval.as_millis() as u64, "scheduler started");
        if let Some(store) = &self.store {
            match store.startup_recovery() {
                Ok(0) => {}
                Ok(count) => warn!(count, "cleared stale executing flags"),
                Err(e) => warn!(error = %e, "startup recovery failed"),
            }
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once(Utc::now()).await {
                Ok(outcomes) => {
                    for (program_id, outcome) in outcomes {
                        debug!(program_id = %program_id, ?outcome, "tick");
                    }
                }
                Err(e) => warn!(error = %e, "scheduler pass failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Merge what other processes wrote to the store: new programs,
    /// cancellations, pruned programs and push events.
    fn sync_from_store(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        self.ctx.push_events.extend(store.signaled_events()?);
        let stored = store.load_map()?;

        let mut events = Vec::new();
        {
            let mut items = self.lock();
            items.retain(|id, item| item.state.executing || stored.contains_key(id));
            for (program_id, theirs) in stored {
                match items.entry(program_id.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(theirs);
                        events.push(QueueEvent::Scheduled { program_id });
                    }
                    Entry::Occupied(mut slot) => {
                        let ours = slot.get_mut();
                        if theirs.state.is_cancelled() && !ours.state.is_cancelled() {
                            ours.state.effect = theirs.state.effect;
                            ours.state.effective = false;
                            events.push(QueueEvent::Cancelled { program_id });
                        }
                    }
                }
            }
        }
        for event in events {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn flush_unsaved(&self) {
        let pending: Vec<String> = self.unsaved_lock().iter().cloned().collect();
        for program_id in pending {
            let Some(item) = self.get(&program_id) else {
                self.unsaved_lock().remove(&program_id);
                continue;
            };
            if item.state.executing {
                continue;
            }
            match self.write_back(&item) {
                Ok(stored) if stored.state.is_cancelled() && !item.state.is_cancelled() => {
                    self.adopt_cancellation(&program_id, stored);
                }
                Ok(_) => debug!(program_id = %program_id, "unsaved state written"),
                Err(e) => warn!(program_id = %program_id, error = %e, "state still unsaved"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn execute_step(
        &self,
        item: &ActionQueueItem,
        now: DateTime<Utc>,
        pending_txs: &PendingTxMap,
    ) -> (ActionProgramState, TickOutcome) {
        let program_id = &item.program.program_id;
        let mut state = item.state.clone();
        state.executing = false;
        state.last_execution_time = now;

        let action = match evaluate_action(&self.ctx, &item.program, &item.state) {
            Ok(action) => action,
            Err(e) => return self.pre_execute_failure(program_id, state, e, now),
        };
        match action.dryrun(pending_txs).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(program_id = %program_id, "dry-run asked to wait");
                state.next_execution_time = later(now, self.ctx.config.retry_delay());
                return (state, TickOutcome::Deferred);
            }
            Err(e) => return self.pre_execute_failure(program_id, state, e, now),
        }

        match action.execute().await {
            Ok(output) => {
                for broadcast in &output.broadcast_txs {
                    info!(
                        program_id = %program_id,
                        wallet_id = %broadcast.wallet_id,
                        tx_id = %broadcast.tx.tx_id,
                        "transaction broadcast"
                    );
                }
                let completed = output.effect.is_done();
                state.effect = Some(output.effect);
                state.effective = false;
                state.next_execution_time = now;
                if completed {
                    (state, TickOutcome::Completed)
                } else {
                    info!(program_id = %program_id, "action executed");
                    (state, TickOutcome::Executed)
                }
            }
            Err(e) => {
                // Side effects may have started; never retry an execute.
                error!(program_id = %program_id, error = %e, "execution failed");
                state.effect = Some(ActionEffect::failed(&e));
                state.effective = false;
                (state, TickOutcome::Completed)
            }
        }
    }

    fn pre_execute_failure(
        &self,
        program_id: &str,
        mut state: ActionProgramState,
        e: ActionQueueError,
        now: DateTime<Utc>,
    ) -> (ActionProgramState, TickOutcome) {
        if e.is_transient() {
            warn!(program_id = %program_id, error = %e, "transient failure; will retry");
            state.next_execution_time = later(now, self.ctx.config.retry_delay());
            return (state, TickOutcome::Deferred);
        }
        error!(program_id = %program_id, error = %e, "program rejected");
        state.effect = Some(ActionEffect::failed(&e));
        state.effective = false;
        (state, TickOutcome::Completed)
    }

    async fn poll_step(
        &self,
        item: &ActionQueueItem,
        now: DateTime<Utc>,
    ) -> (ActionProgramState, TickOutcome) {
        let program_id = &item.program.program_id;
        let mut state = item.state.clone();
        state.executing = false;
        state.last_execution_time = now;

        let Some(effect) = &item.state.effect else {
            return (state, TickOutcome::Skipped);
        };
        match check_action_effect(&self.ctx, effect).await {
            Ok(result) => {
                state.next_execution_time = later(now, result.delay);
                if result.is_effective {
                    state.effective = true;
                    if let Some(updated) = result.updated_effect {
                        state.effect = Some(updated);
                    }
                }
                debug!(
                    program_id = %program_id,
                    effect = effect.type_name(),
                    effective = result.is_effective,
                    delay_ms = result.delay.as_millis() as u64,
                    "effect polled"
                );
                if state.is_done() {
                    (state, TickOutcome::Completed)
                } else {
                    let effective = result.is_effective;
                    (state, TickOutcome::Polled { effective })
                }
            }
            Err(e) => {
                warn!(program_id = %program_id, error = %e, "effect check failed; will retry");
                state.next_execution_time = later(now, self.ctx.config.retry_delay());
                (state, TickOutcome::Deferred)
            }
        }
    }

    /// Write a step's result back. A cancellation recorded while the step
    /// was in flight, here or by another process, wins over whatever the
    /// step produced.
    fn commit(
        &self,
        program_id: &str,
        state: ActionProgramState,
        outcome: TickOutcome,
    ) -> TickOutcome {
        let (item, outcome) = {
            let mut items = self.lock();
            let Some(current) = items.get_mut(program_id) else {
                return outcome;
            };
            if current.state.is_cancelled() {
                current.state.executing = false;
                (current.clone(), TickOutcome::Skipped)
            } else {
                current.state = state;
                (current.clone(), outcome)
            }
        };
        match self.write_back(&item) {
            Ok(stored) if stored.state.is_cancelled() && !item.state.is_cancelled() => {
                return self.adopt_cancellation(program_id, stored);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(program_id = %program_id, error = %e, "could not save step result; will retry");
            }
        }

        let program_id = program_id.to_string();
        match outcome {
            TickOutcome::Completed => {
                let error = item
                    .state
                    .effect
                    .as_ref()
                    .and_then(ActionEffect::error)
                    .cloned();
                match &error {
                    Some(e) => info!(program_id = %program_id, error = %e, "program failed"),
                    None => info!(program_id = %program_id, "program completed"),
                }
                let _ = self.events.send(QueueEvent::Completed { program_id, error });
            }
            TickOutcome::Executed | TickOutcome::Polled { effective: true } => {
                let _ = self.events.send(QueueEvent::Updated { program_id });
            }
            _ => {}
        }
        outcome
    }

    /// Take over a cancellation found in the store.
    fn adopt_cancellation(&self, program_id: &str, stored: ActionQueueItem) -> TickOutcome {
        if let Some(current) = self.lock().get_mut(program_id) {
            current.state = stored.state;
        }
        info!(program_id = %program_id, "program cancelled elsewhere");
        let _ = self.events.send(QueueEvent::Cancelled {
            program_id: program_id.to_string(),
        });
        TickOutcome::Skipped
    }

    /// Write `item` through to the store, returning the record the store
    /// kept. Failed writes are remembered for [`flush_unsaved`](Self::flush_unsaved).
    fn write_back(&self, item: &ActionQueueItem) -> Result<ActionQueueItem> {
        let Some(store) = &self.store else {
            return Ok(item.clone());
        };
        let program_id = &item.program.program_id;
        match store.write_back(item) {
            Ok(stored) => {
                self.unsaved_lock().remove(program_id);
                Ok(stored)
            }
            Err(e) => {
                self.unsaved_lock().insert(program_id.clone());
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActionQueueMap> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unsaved_lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.unsaved.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `now + delay`, saturating at the latest representable time.
fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        AccountCapability, FiatOrder, LoanEstimate, LoanRequest, SpendRequest, SwapQuote,
        SwapRequest, TxConfirmations,
    };
    use crate::config::{EngineConfig, PollConfig};
    use crate::db::{ActionQueueDb, SharedQueueDb};
    use crate::simulator::{SimFixture, SimulatedAccount};
    use crate::types::{ActionOp, WalletTx, WyreBuyOp, WyreSellOp};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Simulated account with two knobs: fail every spend, or hold fiat
    /// orders until released.
    #[derive(Default)]
    struct ScriptedAccount {
        inner: SimulatedAccount,
        fail_spend: bool,
        fiat_gate: Option<Arc<Notify>>,
    }

    impl ScriptedAccount {
        fn sample() -> Self {
            Self {
                inner: SimulatedAccount::new(SimFixture::sample()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl AccountCapability for ScriptedAccount {
        async fn receive_address(&self, wallet_id: &str, token_id: Option<&str>) -> Result<String> {
            self.inner.receive_address(wallet_id, token_id).await
        }
        async fn balance(
            &self,
            wallet_id: &str,
            address: &str,
            token_id: Option<&str>,
        ) -> Result<Decimal> {
            self.inner.balance(wallet_id, address, token_id).await
        }
        async fn exchange_rate(&self, currency_pair: &str) -> Result<Decimal> {
            self.inner.exchange_rate(currency_pair).await
        }
        async fn tx_confirmations(&self, wallet_id: &str, tx_id: &str) -> Result<TxConfirmations> {
            self.inner.tx_confirmations(wallet_id, tx_id).await
        }
        async fn pending_txs(&self) -> Result<PendingTxMap> {
            self.inner.pending_txs().await
        }
        async fn make_spend(&self, wallet_id: &str, request: &SpendRequest) -> Result<WalletTx> {
            if self.fail_spend {
                return Err(ActionQueueError::InsufficientFunds {
                    wallet_id: wallet_id.into(),
                    needed: "100".into(),
                    available: "0".into(),
                });
            }
            self.inner.make_spend(wallet_id, request).await
        }
        async fn sign_tx(&self, wallet_id: &str, tx: WalletTx) -> Result<WalletTx> {
            self.inner.sign_tx(wallet_id, tx).await
        }
        async fn broadcast_tx(&self, wallet_id: &str, tx: WalletTx) -> Result<WalletTx> {
            self.inner.broadcast_tx(wallet_id, tx).await
        }
        async fn save_tx(&self, wallet_id: &str, tx: &WalletTx) -> Result<()> {
            self.inner.save_tx(wallet_id, tx).await
        }
        async fn broadcast_raw(
            &self,
            wallet_id: &str,
            tx_id: &str,
            raw_tx: &str,
        ) -> Result<WalletTx> {
            self.inner.broadcast_raw(wallet_id, tx_id, raw_tx).await
        }
        async fn fiat_buy(&self, order: &FiatOrder) -> Result<()> {
            if let Some(gate) = &self.fiat_gate {
                gate.notified().await;
            }
            self.inner.fiat_buy(order).await
        }
        async fn fiat_sell_address(
            &self,
            account_id: &str,
            wallet_id: &str,
            token_id: Option<&str>,
        ) -> Result<String> {
            self.inner
                .fiat_sell_address(account_id, wallet_id, token_id)
                .await
        }
        async fn swap_quote(&self, request: &SwapRequest) -> Result<SwapQuote> {
            self.inner.swap_quote(request).await
        }
        async fn approve_swap(&self, quote: &SwapQuote) -> Result<WalletTx> {
            self.inner.approve_swap(quote).await
        }
        async fn loan_estimate(&self, request: &LoanRequest) -> Result<LoanEstimate> {
            self.inner.loan_estimate(request).await
        }
        async fn loan_approve(&self, request: &LoanRequest) -> Result<Vec<WalletTx>> {
            self.inner.loan_approve(request).await
        }
    }

    /// Real store whose writes can be switched off.
    struct FlakyStore {
        inner: ActionQueueDb,
        fail_writes: Arc<AtomicBool>,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(ActionQueueError::QueueDb("disk full".into()));
            }
            Ok(())
        }
    }

    impl QueueStore for FlakyStore {
        fn insert_new(&self, item: &ActionQueueItem) -> Result<bool> {
            self.check()?;
            self.inner.insert_new(item)
        }
        fn write_back(&self, item: &ActionQueueItem) -> Result<ActionQueueItem> {
            self.check()?;
            self.inner.write_back(item)
        }
        fn remove(&self, program_id: &str) -> Result<bool> {
            self.check()?;
            self.inner.remove(program_id)
        }
        fn load_map(&self) -> Result<ActionQueueMap> {
            self.inner.load_map()
        }
        fn startup_recovery(&self) -> Result<u32> {
            self.check()?;
            self.inner.startup_recovery()
        }
        fn signal_event(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool> {
            self.check()?;
            self.inner.signal_event(event_id, at)
        }
        fn signaled_events(&self) -> Result<Vec<String>> {
            self.inner.signaled_events()
        }
    }

    fn immediate_config() -> EngineConfig {
        EngineConfig {
            poll: PollConfig::immediate(),
            ..Default::default()
        }
    }

    fn queue_with(account: ScriptedAccount) -> ActionQueue {
        ActionQueue::new(ExecutionContext::new(Arc::new(account), immediate_config()))
    }

    fn buy(amount: &str) -> ActionOp {
        ActionOp::WyreBuy(WyreBuyOp {
            wallet_id: "btc-wallet".into(),
            token_id: None,
            native_amount: amount.into(),
        })
    }

    fn sell(amount: &str) -> ActionOp {
        ActionOp::WyreSell(WyreSellOp {
            wyre_account_id: "wyre-main".into(),
            wallet_id: "btc-wallet".into(),
            token_id: None,
            native_amount: amount.into(),
        })
    }

    fn program(id: &str, op: ActionOp) -> ActionProgram {
        ActionProgram {
            program_id: id.into(),
            action_op: op,
            mock_mode: false,
        }
    }

    async fn tick(queue: &ActionQueue, id: &str, now: DateTime<Utc>) -> TickOutcome {
        queue
            .tick_program(id, now, &PendingTxMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn execute_error_becomes_terminal_done() {
        let queue = queue_with(ScriptedAccount {
            fail_spend: true,
            ..ScriptedAccount::sample()
        });
        let now = Utc::now();
        queue.schedule(program("p", sell("100")), now).unwrap();

        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Completed);
        let state = queue.get("p").unwrap().state;
        let error = state.effect.as_ref().unwrap().error().unwrap();
        assert_eq!(error.kind, "insufficient_funds");
        assert!(!state.executing);
        // Terminal: later ticks do nothing.
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn seq_advances_without_reexecuting_finished_children() {
        let queue = queue_with(ScriptedAccount::sample());
        let now = Utc::now();
        let op = ActionOp::Seq {
            actions: vec![buy("10"), buy("20")],
        };
        queue.schedule(program("p", op), now).unwrap();

        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Executed);
        assert_eq!(
            tick(&queue, "p", now).await,
            TickOutcome::Polled { effective: true }
        );
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Executed);
        match queue.get("p").unwrap().state.effect.unwrap() {
            ActionEffect::Seq { op_index, .. } => assert_eq!(op_index, 1),
            other => panic!("expected seq, got {other:?}"),
        }
        assert_eq!(
            tick(&queue, "p", now).await,
            TickOutcome::Polled { effective: true }
        );
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Completed);
        assert!(queue.get("p").unwrap().state.effect.unwrap().is_success());
    }

    #[tokio::test]
    async fn par_completes_once_every_child_is_done() {
        let queue = queue_with(ScriptedAccount::sample());
        let now = Utc::now();
        let op = ActionOp::Par {
            actions: vec![buy("10"), buy("20")],
        };
        queue.schedule(program("p", op), now).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(tick(&queue, "p", now).await);
        }
        assert_eq!(
            outcomes,
            vec![
                TickOutcome::Executed,
                TickOutcome::Polled { effective: true },
                TickOutcome::Completed,
                TickOutcome::Skipped,
            ]
        );
    }

    #[tokio::test]
    async fn cancel_mid_pending_stops_all_ticks() {
        let queue = queue_with(ScriptedAccount::sample());
        let mut events = queue.subscribe();
        let now = Utc::now();
        queue.schedule(program("p", buy("10")), now).unwrap();
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Executed);

        queue.cancel("p").unwrap();
        let state = queue.get("p").unwrap().state;
        assert!(state.effect.as_ref().unwrap().is_cancelled());
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Skipped);
        assert_eq!(queue.get("p").unwrap().state, state);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&QueueEvent::Cancelled {
            program_id: "p".into()
        }));
    }

    #[tokio::test]
    async fn cancellation_wins_over_in_flight_execute() {
        let gate = Arc::new(Notify::new());
        let queue = Arc::new(queue_with(ScriptedAccount {
            fiat_gate: Some(gate.clone()),
            ..ScriptedAccount::sample()
        }));
        let now = Utc::now();
        queue.schedule(program("p", buy("10")), now).unwrap();

        let ticking = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .tick_program("p", now, &PendingTxMap::new())
                    .await
                    .unwrap()
            })
        };
        // Wait until the tick has claimed the program.
        while !queue.get("p").unwrap().state.executing {
            tokio::task::yield_now().await;
        }
        // A second tick must not re-enter.
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Skipped);

        queue.cancel("p").unwrap();
        gate.notify_one();
        assert_eq!(ticking.await.unwrap(), TickOutcome::Skipped);

        let state = queue.get("p").unwrap().state;
        assert!(state.effect.unwrap().is_cancelled());
        assert!(!state.executing);
    }

    #[tokio::test]
    async fn pending_tx_defers_spend() {
        let queue = queue_with(ScriptedAccount::sample());
        let now = Utc::now();
        queue.schedule(program("p", sell("100")), now).unwrap();

        let mut pending = PendingTxMap::new();
        pending.insert(
            "btc-wallet".into(),
            vec![WalletTx {
                tx_id: "other".into(),
                wallet_id: "btc-wallet".into(),
                currency_code: "BTC".into(),
                native_amount: "5".into(),
                network_fee: "0".into(),
                signed_tx: None,
            }],
        );
        let outcome = queue.tick_program("p", now, &pending).await.unwrap();
        assert_eq!(outcome, TickOutcome::Deferred);

        let state = queue.get("p").unwrap().state;
        assert!(state.effect.is_none());
        assert_eq!(state.next_execution_time, now + chrono::Duration::seconds(5));
        // Not due again until the retry delay has passed.
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn transient_check_failure_retries_instead_of_failing() {
        let ctx = ExecutionContext::new(Arc::new(ScriptedAccount::sample()), immediate_config());
        let now = Utc::now();
        let mut state = ActionProgramState::new("local", "p", now);
        state.effect = Some(ActionEffect::PriceLevel {
            currency_pair: "DOGE_iso:USD".into(),
            above_rate: Some("1".into()),
            below_rate: None,
        });
        let mut map = ActionQueueMap::new();
        map.insert(
            "p".into(),
            ActionQueueItem {
                program: program("p", buy("10")),
                state,
            },
        );
        let queue = ActionQueue::from_map(ctx, map);

        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Deferred);
        let state = queue.get("p").unwrap().state;
        assert!(!state.is_done());
        assert!(!state.executing);
    }

    #[tokio::test]
    async fn non_transient_dryrun_error_is_terminal() {
        let queue = queue_with(ScriptedAccount::sample());
        let now = Utc::now();
        queue
            .schedule(program("p", sell("999999999")), now)
            .unwrap();
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Completed);
        let effect = queue.get("p").unwrap().state.effect.unwrap();
        assert_eq!(effect.error().unwrap().kind, "insufficient_funds");
    }

    #[test]
    fn duplicate_and_invalid_programs_are_rejected() {
        let queue = queue_with(ScriptedAccount::sample());
        let now = Utc::now();
        queue.schedule(program("p", buy("10")), now).unwrap();
        let err = queue.schedule(program("p", buy("10")), now).unwrap_err();
        assert_eq!(err.kind(), "program_exists");
        let err = queue.schedule(program("q", buy("-3")), now).unwrap_err();
        assert_eq!(err.kind(), "invalid_amount");
        assert_eq!(queue.cancel("nope").unwrap_err().kind(), "program_not_found");
    }

    #[tokio::test]
    async fn prune_removes_only_finished_programs() {
        let dir = TempDir::new().unwrap();
        let db = ActionQueueDb::open(&dir.path().join("queue.db")).unwrap();
        let ctx = ExecutionContext::new(Arc::new(ScriptedAccount::sample()), immediate_config());
        let queue = ActionQueue::new(ctx).with_store(db);
        let now = Utc::now();
        queue.schedule(program("a", buy("10")), now).unwrap();
        queue.schedule(program("b", buy("10")), now).unwrap();
        queue.cancel("a").unwrap();

        assert_eq!(queue.prune_done().unwrap(), vec!["a".to_string()]);
        assert!(queue.get("a").is_none());
        assert!(queue.get("b").is_some());
    }

    #[tokio::test]
    async fn rehydrated_queue_resumes_from_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let now = Utc::now();
        let account = Arc::new(SimulatedAccount::new(SimFixture::sample()));
        {
            let ctx = ExecutionContext::new(account.clone(), immediate_config());
            let queue = ActionQueue::new(ctx).with_store(ActionQueueDb::open(&path).unwrap());
            queue.schedule(program("p", buy("10")), now).unwrap();
            queue.tick(now, &PendingTxMap::new()).await;
            queue.signal_event("kyc", now).unwrap();
        }

        let ctx = ExecutionContext::new(account.clone(), immediate_config());
        let queue = ActionQueue::from_store(ctx, ActionQueueDb::open(&path).unwrap()).unwrap();
        assert!(queue.context().push_events.is_signaled("kyc"));
        let item = queue.get("p").unwrap();
        assert_eq!(item.state.effect.unwrap().type_name(), "address-balance");
        assert!(!item.state.executing);

        let outcomes = queue.run_once(now).await.unwrap();
        assert_eq!(outcomes, vec![("p".to_string(), TickOutcome::Polled { effective: true })]);
        // Only one buy was ever placed.
        assert_eq!(account.balance_of("btc-wallet", "BTC"), Decimal::from(5_000_010));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let queue = queue_with(ScriptedAccount::sample());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        queue.run(rx).await;
    }

    #[tokio::test]
    async fn failed_step_start_write_defers_instead_of_wedging() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let fail_writes = Arc::new(AtomicBool::new(false));
        let store = FlakyStore {
            inner: ActionQueueDb::open(&path).unwrap(),
            fail_writes: fail_writes.clone(),
        };
        let account = Arc::new(SimulatedAccount::new(SimFixture::sample()));
        let ctx = ExecutionContext::new(account.clone(), immediate_config());
        let queue = ActionQueue::new(ctx).with_store(store);
        let now = Utc::now();
        queue.schedule(program("a", buy("10")), now).unwrap();
        queue.schedule(program("b", buy("20")), now).unwrap();

        fail_writes.store(true, Ordering::SeqCst);
        let outcomes = queue.tick(now, &PendingTxMap::new()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, o)| *o == TickOutcome::Deferred));
        for id in ["a", "b"] {
            let state = queue.get(id).unwrap().state;
            assert!(!state.executing);
            assert!(state.effect.is_none());
        }
        assert_eq!(account.balance_of("btc-wallet", "BTC"), Decimal::from(5_000_000));

        fail_writes.store(false, Ordering::SeqCst);
        let retry_at = now + chrono::Duration::seconds(5);
        let outcomes = queue.run_once(retry_at).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, o)| *o == TickOutcome::Executed));
        assert_eq!(account.balance_of("btc-wallet", "BTC"), Decimal::from(5_000_030));
    }

    #[tokio::test]
    async fn unsaved_step_result_is_written_on_next_pass() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let fail_writes = Arc::new(AtomicBool::new(false));
        let store = FlakyStore {
            inner: ActionQueueDb::open(&path).unwrap(),
            fail_writes: fail_writes.clone(),
        };
        let ctx = ExecutionContext::new(Arc::new(ScriptedAccount::sample()), immediate_config());
        let queue = ActionQueue::new(ctx).with_store(store);
        let now = Utc::now();
        queue.schedule(program("p", buy("10")), now).unwrap();
        assert_eq!(tick(&queue, "p", now).await, TickOutcome::Executed);

        // The poll has nothing to record up front; only its result is lost.
        fail_writes.store(true, Ordering::SeqCst);
        assert_eq!(
            tick(&queue, "p", now).await,
            TickOutcome::Polled { effective: true }
        );
        assert!(!queue.get("p").unwrap().state.executing);

        fail_writes.store(false, Ordering::SeqCst);
        queue.run_once(now).await.unwrap();
        let stored = queue.store.as_ref().unwrap().load_map().unwrap();
        assert!(stored["p"].state.effective || stored["p"].state.is_done());
    }

    #[tokio::test]
    async fn changes_from_other_processes_are_picked_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let now = Utc::now();
        let ctx = ExecutionContext::new(Arc::new(ScriptedAccount::sample()), immediate_config());
        let queue = ActionQueue::new(ctx).with_store(SharedQueueDb::new(&path));
        let mut events = queue.subscribe();
        queue.schedule(program("a", buy("10")), now).unwrap();
        assert_eq!(tick(&queue, "a", now).await, TickOutcome::Executed);

        // A second handle on the same file, as `actionq program ...` would open.
        {
            let ctx = ExecutionContext::new(Arc::new(ScriptedAccount::sample()), immediate_config());
            let other = ActionQueue::from_store(ctx, SharedQueueDb::new(&path)).unwrap();
            other.schedule(program("b", buy("20")), now).unwrap();
            other.cancel("a").unwrap();
            other.signal_event("kyc", now).unwrap();
        }

        let outcomes = queue.run_once(now).await.unwrap();
        assert_eq!(outcomes, vec![("b".to_string(), TickOutcome::Executed)]);
        assert!(queue.get("a").unwrap().state.is_cancelled());
        assert!(queue.context().push_events.is_signaled("kyc"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&QueueEvent::Cancelled {
            program_id: "a".into()
        }));
        assert!(seen.contains(&QueueEvent::Scheduled {
            program_id: "b".into()
        }));
    }

    #[tokio::test]
    async fn cancellation_stored_during_a_step_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let gate = Arc::new(Notify::new());
        let ctx = ExecutionContext::new(
            Arc::new(ScriptedAccount {
                fiat_gate: Some(gate.clone()),
                ..ScriptedAccount::sample()
            }),
            immediate_config(),
        );
        let queue = Arc::new(ActionQueue::new(ctx).with_store(SharedQueueDb::new(&path)));
        let now = Utc::now();
        queue.schedule(program("p", buy("10")), now).unwrap();

        let ticking = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .tick_program("p", now, &PendingTxMap::new())
                    .await
                    .unwrap()
            })
        };
        while !queue.get("p").unwrap().state.executing {
            tokio::task::yield_now().await;
        }
        {
            let ctx = ExecutionContext::new(Arc::new(ScriptedAccount::sample()), immediate_config());
            let other = ActionQueue::from_store(ctx, SharedQueueDb::new(&path)).unwrap();
            other.cancel("p").unwrap();
        }
        gate.notify_one();
        assert_eq!(ticking.await.unwrap(), TickOutcome::Skipped);

        let state = queue.get("p").unwrap().state;
        assert!(state.is_cancelled());
        assert!(!state.executing);
        let stored = SharedQueueDb::new(&path).load_map().unwrap();
        assert!(stored["p"].state.is_cancelled());
    }

    #[test]
    fn later_saturates_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(later(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
        assert_eq!(later(now, Duration::from_millis(u64::MAX)), DateTime::<Utc>::MAX_UTC);
        assert_eq!(later(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
