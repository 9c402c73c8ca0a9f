//! Fixture-driven in-memory account.
//!
//! Backs `actionq run` and the engine tests with deterministic wallet,
//! market, and provider behaviour. Spends move balances immediately and every
//! confirmation lookup advances the looked-up transaction by one block.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{checked_add, checked_mul, to_native_string};
use crate::capability::{
    AccountCapability, FiatOrder, LoanEstimate, LoanRequest, SpendRequest, SwapQuote,
    SwapRequest, TxConfirmations,
};
use crate::error::{ActionQueueError, Result};
use crate::types::{AmountFor, PendingTxMap, WalletTx};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimFixture {
    #[serde(default)]
    pub wallets: BTreeMap<String, SimWallet>,
    /// Exchange rates keyed by currency pair, e.g. `BTC_iso:USD`.
    #[serde(default)]
    pub rates: BTreeMap<String, String>,
    /// Native-amount multipliers keyed by `FROM/TO` currency codes.
    #[serde(default)]
    pub swap_rates: BTreeMap<String, String>,
    #[serde(default)]
    pub loan_plugins: Vec<String>,
    /// Fiat account id to deposit address.
    #[serde(default)]
    pub fiat_accounts: BTreeMap<String, String>,
    #[serde(default)]
    pub txs: BTreeMap<String, SimTx>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimWallet {
    pub currency_code: String,
    pub address: String,
    /// Native balances keyed by token id, or by the wallet's own currency code.
    #[serde(default)]
    pub balances: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimTx {
    pub wallet_id: String,
    pub currency_code: String,
    pub native_amount: String,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub saved: bool,
}

impl SimFixture {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// A small two-wallet fixture written by `actionq init`.
    pub fn sample() -> Self {
        let mut wallets = BTreeMap::new();
        wallets.insert(
            "btc-wallet".to_string(),
            SimWallet {
                currency_code: "BTC".into(),
                address: "bc1qsimulated0btc".into(),
                balances: BTreeMap::from([("BTC".to_string(), "5000000".to_string())]),
            },
        );
        wallets.insert(
            "eth-wallet".to_string(),
            SimWallet {
                currency_code: "ETH".into(),
                address: "0xsimulated0eth".into(),
                balances: BTreeMap::from([
                    ("ETH".to_string(), "2000000000000000000".to_string()),
                    ("USDC".to_string(), "0".to_string()),
                ]),
            },
        );
        Self {
            wallets,
            rates: BTreeMap::from([
                ("BTC_iso:USD".to_string(), "30000".to_string()),
                ("ETH_iso:USD".to_string(), "2000".to_string()),
            ]),
            swap_rates: BTreeMap::from([("BTC/ETH".to_string(), "150000000".to_string())]),
            loan_plugins: vec!["aave-polygon".to_string()],
            fiat_accounts: BTreeMap::from([(
                "wyre-main".to_string(),
                "bc1qsimulated0wyre".to_string(),
            )]),
            txs: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SimulatedAccount
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SimulatedAccount {
    state: Mutex<SimFixture>,
}

impl SimulatedAccount {
    pub fn new(fixture: SimFixture) -> Self {
        Self {
            state: Mutex::new(fixture),
        }
    }

    pub fn snapshot(&self) -> SimFixture {
        self.lock().clone()
    }

    /// Record a transaction as if it had been broadcast elsewhere.
    pub fn insert_tx(&self, wallet_id: &str, tx_id: &str, confirmations: u32) {
        let mut state = self.lock();
        let currency_code = state
            .wallets
            .get(wallet_id)
            .map(|w| w.currency_code.clone())
            .unwrap_or_default();
        state.txs.insert(
            tx_id.to_string(),
            SimTx {
                wallet_id: wallet_id.to_string(),
                currency_code,
                native_amount: "0".into(),
                confirmations,
                saved: false,
            },
        );
    }

    pub fn set_balance(&self, wallet_id: &str, code: &str, native_amount: &str) {
        let mut state = self.lock();
        if let Some(wallet) = state.wallets.get_mut(wallet_id) {
            wallet
                .balances
                .insert(code.to_string(), native_amount.to_string());
        }
    }

    pub fn balance_of(&self, wallet_id: &str, code: &str) -> Decimal {
        let state = self.lock();
        state
            .wallets
            .get(wallet_id)
            .and_then(|w| w.balances.get(code))
            .and_then(|b| Decimal::from_str(b).ok())
            .unwrap_or(Decimal::ZERO)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimFixture> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn wallet<'a>(state: &'a SimFixture, wallet_id: &str) -> Result<&'a SimWallet> {
    state
        .wallets
        .get(wallet_id)
        .ok_or_else(|| ActionQueueError::WalletNotFound(wallet_id.to_string()))
}

fn code_for(state: &SimFixture, wallet_id: &str, token_id: Option<&str>) -> Result<String> {
    let w = wallet(state, wallet_id)?;
    Ok(token_id.unwrap_or(&w.currency_code).to_string())
}

fn balance_in(state: &SimFixture, wallet_id: &str, code: &str) -> Result<Decimal> {
    let w = wallet(state, wallet_id)?;
    Ok(w.balances
        .get(code)
        .and_then(|b| Decimal::from_str(b).ok())
        .unwrap_or(Decimal::ZERO))
}

fn adjust(state: &mut SimFixture, wallet_id: &str, code: &str, delta: Decimal) -> Result<()> {
    let current = balance_in(state, wallet_id, code)?;
    let next = checked_add(current, delta)?;
    if next < Decimal::ZERO {
        return Err(ActionQueueError::InsufficientFunds {
            wallet_id: wallet_id.to_string(),
            needed: to_native_string(-delta),
            available: to_native_string(current),
        });
    }
    let w = state
        .wallets
        .get_mut(wallet_id)
        .ok_or_else(|| ActionQueueError::WalletNotFound(wallet_id.to_string()))?;
    w.balances.insert(code.to_string(), to_native_string(next));
    Ok(())
}

fn require_funds(state: &SimFixture, wallet_id: &str, code: &str, needed: Decimal) -> Result<()> {
    let available = balance_in(state, wallet_id, code)?;
    if available < needed {
        return Err(ActionQueueError::InsufficientFunds {
            wallet_id: wallet_id.to_string(),
            needed: to_native_string(needed),
            available: to_native_string(available),
        });
    }
    Ok(())
}

fn parse(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|_| ActionQueueError::InvalidAmount(s.to_string()))
}

fn record_tx(state: &mut SimFixture, wallet_id: &str, code: &str, native_amount: &str) -> WalletTx {
    let tx_id = Uuid::new_v4().simple().to_string();
    state.txs.insert(
        tx_id.clone(),
        SimTx {
            wallet_id: wallet_id.to_string(),
            currency_code: code.to_string(),
            native_amount: native_amount.to_string(),
            confirmations: 0,
            saved: false,
        },
    );
    WalletTx {
        tx_id,
        wallet_id: wallet_id.to_string(),
        currency_code: code.to_string(),
        native_amount: native_amount.to_string(),
        network_fee: "0".into(),
        signed_tx: None,
    }
}

fn swap_amounts(state: &SimFixture, request: &SwapRequest) -> Result<(String, String, Decimal, Decimal)> {
    let from_code = code_for(state, &request.from_wallet_id, request.from_token_id.as_deref())?;
    let to_code = code_for(state, &request.to_wallet_id, request.to_token_id.as_deref())?;
    let key = format!("{from_code}/{to_code}");
    let rate = state
        .swap_rates
        .get(&key)
        .map(|r| parse(r))
        .transpose()?
        .filter(|r| *r > Decimal::ZERO)
        .ok_or_else(|| ActionQueueError::PolicyNotFound(format!("swap pair {key}")))?;
    let amount = parse(&request.native_amount)?;
    let (from_amount, to_amount) = match request.amount_for {
        AmountFor::From => (amount, checked_mul(amount, rate)?.floor()),
        AmountFor::To => {
            let from = amount
                .checked_div(rate)
                .ok_or_else(|| ActionQueueError::InvalidAmount(format!("{amount} / {rate}")))?;
            (from.ceil(), amount)
        }
    };
    Ok((from_code, to_code, from_amount, to_amount))
}

fn loan_debit_code(state: &SimFixture, request: &LoanRequest) -> Result<String> {
    let token = request
        .from_token_id
        .as_deref()
        .or(request.token_id.as_deref());
    code_for(state, &request.wallet_id, token)
}

fn check_loan(state: &SimFixture, request: &LoanRequest) -> Result<()> {
    if !state.loan_plugins.contains(&request.borrow_plugin_id) {
        return Err(ActionQueueError::PolicyNotFound(
            request.borrow_plugin_id.clone(),
        ));
    }
    wallet(state, &request.wallet_id)?;
    if !request.kind.credits_wallet() {
        let code = loan_debit_code(state, request)?;
        require_funds(state, &request.wallet_id, &code, parse(&request.native_amount)?)?;
    }
    Ok(())
}

#[async_trait]
impl AccountCapability for SimulatedAccount {
    async fn receive_address(&self, wallet_id: &str, _token_id: Option<&str>) -> Result<String> {
        let state = self.lock();
        Ok(wallet(&state, wallet_id)?.address.clone())
    }

    async fn balance(
        &self,
        wallet_id: &str,
        _address: &str,
        token_id: Option<&str>,
    ) -> Result<Decimal> {
        let state = self.lock();
        let code = code_for(&state, wallet_id, token_id)?;
        balance_in(&state, wallet_id, &code)
    }

    async fn exchange_rate(&self, currency_pair: &str) -> Result<Decimal> {
        let state = self.lock();
        let rate = state
            .rates
            .get(currency_pair)
            .ok_or_else(|| ActionQueueError::Network(format!("no rate for {currency_pair}")))?;
        parse(rate)
    }

    async fn tx_confirmations(&self, _wallet_id: &str, tx_id: &str) -> Result<TxConfirmations> {
        let mut state = self.lock();
        let Some(tx) = state.txs.get_mut(tx_id) else {
            return Ok(TxConfirmations::Dropped);
        };
        let current = tx.confirmations;
        tx.confirmations += 1;
        Ok(if current == 0 {
            TxConfirmations::Unconfirmed
        } else {
            TxConfirmations::Confirmed(current)
        })
    }

    async fn pending_txs(&self) -> Result<PendingTxMap> {
        let state = self.lock();
        let mut map = PendingTxMap::new();
        for (tx_id, tx) in state.txs.iter().filter(|(_, tx)| tx.confirmations == 0) {
            map.entry(tx.wallet_id.clone()).or_default().push(WalletTx {
                tx_id: tx_id.clone(),
                wallet_id: tx.wallet_id.clone(),
                currency_code: tx.currency_code.clone(),
                native_amount: tx.native_amount.clone(),
                network_fee: "0".into(),
                signed_tx: None,
            });
        }
        Ok(map)
    }

    async fn make_spend(&self, wallet_id: &str, request: &SpendRequest) -> Result<WalletTx> {
        let state = self.lock();
        let code = code_for(&state, wallet_id, request.token_id.as_deref())?;
        let mut total = Decimal::ZERO;
        for target in &request.spend_targets {
            total = checked_add(total, parse(&target.native_amount)?)?;
        }
        require_funds(&state, wallet_id, &code, total)?;
        Ok(WalletTx {
            tx_id: Uuid::new_v4().simple().to_string(),
            wallet_id: wallet_id.to_string(),
            currency_code: code,
            native_amount: to_native_string(total),
            network_fee: "0".into(),
            signed_tx: None,
        })
    }

    async fn sign_tx(&self, _wallet_id: &str, mut tx: WalletTx) -> Result<WalletTx> {
        tx.signed_tx = Some(format!("signed:{}", tx.tx_id));
        Ok(tx)
    }

    async fn broadcast_tx(&self, wallet_id: &str, tx: WalletTx) -> Result<WalletTx> {
        if tx.signed_tx.is_none() {
            return Err(ActionQueueError::InvalidProgram(format!(
                "transaction {} is not signed",
                tx.tx_id
            )));
        }
        let mut state = self.lock();
        adjust(&mut state, wallet_id, &tx.currency_code, -parse(&tx.native_amount)?)?;
        state.txs.insert(
            tx.tx_id.clone(),
            SimTx {
                wallet_id: wallet_id.to_string(),
                currency_code: tx.currency_code.clone(),
                native_amount: tx.native_amount.clone(),
                confirmations: 0,
                saved: false,
            },
        );
        Ok(tx)
    }

    async fn save_tx(&self, _wallet_id: &str, tx: &WalletTx) -> Result<()> {
        let mut state = self.lock();
        if let Some(record) = state.txs.get_mut(&tx.tx_id) {
            record.saved = true;
        }
        Ok(())
    }

    async fn broadcast_raw(&self, wallet_id: &str, tx_id: &str, _raw_tx: &str) -> Result<WalletTx> {
        let mut state = self.lock();
        let code = wallet(&state, wallet_id)?.currency_code.clone();
        state.txs.insert(
            tx_id.to_string(),
            SimTx {
                wallet_id: wallet_id.to_string(),
                currency_code: code.clone(),
                native_amount: "0".into(),
                confirmations: 0,
                saved: false,
            },
        );
        Ok(WalletTx {
            tx_id: tx_id.to_string(),
            wallet_id: wallet_id.to_string(),
            currency_code: code,
            native_amount: "0".into(),
            network_fee: "0".into(),
            signed_tx: None,
        })
    }

    async fn fiat_buy(&self, order: &FiatOrder) -> Result<()> {
        let mut state = self.lock();
        let code = code_for(&state, &order.wallet_id, order.token_id.as_deref())?;
        adjust(&mut state, &order.wallet_id, &code, parse(&order.native_amount)?)
    }

    async fn fiat_sell_address(
        &self,
        account_id: &str,
        wallet_id: &str,
        _token_id: Option<&str>,
    ) -> Result<String> {
        let state = self.lock();
        wallet(&state, wallet_id)?;
        state
            .fiat_accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| ActionQueueError::PolicyNotFound(format!("fiat account {account_id}")))
    }

    async fn swap_quote(&self, request: &SwapRequest) -> Result<SwapQuote> {
        let state = self.lock();
        let (from_code, _, from_amount, to_amount) = swap_amounts(&state, request)?;
        require_funds(&state, &request.from_wallet_id, &from_code, from_amount)?;
        Ok(SwapQuote {
            request: request.clone(),
            plugin_id: "simswap".into(),
            from_native_amount: to_native_string(from_amount),
            to_native_amount: to_native_string(to_amount),
            network_fee: "0".into(),
        })
    }

    async fn approve_swap(&self, quote: &SwapQuote) -> Result<WalletTx> {
        let mut state = self.lock();
        let request = &quote.request;
        let (from_code, to_code, from_amount, to_amount) = swap_amounts(&state, request)?;
        adjust(&mut state, &request.from_wallet_id, &from_code, -from_amount)?;
        adjust(&mut state, &request.to_wallet_id, &to_code, to_amount)?;
        Ok(record_tx(
            &mut state,
            &request.from_wallet_id,
            &from_code,
            &to_native_string(from_amount),
        ))
    }

    async fn loan_estimate(&self, request: &LoanRequest) -> Result<LoanEstimate> {
        let state = self.lock();
        check_loan(&state, request)?;
        Ok(LoanEstimate {
            network_fee: "0".into(),
        })
    }

    async fn loan_approve(&self, request: &LoanRequest) -> Result<Vec<WalletTx>> {
        let mut state = self.lock();
        check_loan(&state, request)?;
        let amount = parse(&request.native_amount)?;
        let code = if request.kind.credits_wallet() {
            let code = code_for(&state, &request.wallet_id, request.token_id.as_deref())?;
            adjust(&mut state, &request.wallet_id, &code, amount)?;
            code
        } else {
            let code = loan_debit_code(&state, request)?;
            adjust(&mut state, &request.wallet_id, &code, -amount)?;
            code
        };
        Ok(vec![record_tx(
            &mut state,
            &request.wallet_id,
            &code,
            &request.native_amount,
        )])
    }
}
