//! In-memory venue for paper trading and tests.
//!
//! Implements [`MarketFeed`], [`ExecutionAdapter`] and [`AccountSource`] over
//! simulated balances. Faults can be queued per pair to exercise partial
//! fills, rejected closes and lost confirmations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, Signed};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::traits::{AccountSource, ExecutionAdapter, MarketFeed};
use super::types::*;
use crate::error::{DataError, ExecutionError};

/// Simulated hedge held by the venue. Quantities are signed.
#[derive(Debug, Clone)]
pub struct PaperPosition {
    pub pair: String,
    pub perp_qty: Decimal,
    pub perp_entry_price: Decimal,
    pub spot_qty: Decimal,
    pub spot_entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub funding_received: Decimal,
}

impl PaperPosition {
    fn is_flat(&self) -> bool {
        self.perp_qty.is_zero() && self.spot_qty.is_zero()
    }
}

/// Fault to inject into the next execution call for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecFault {
    /// Open or close is refused outright.
    Reject,
    /// Open fills the perp leg only.
    SpotLegRejected,
    /// Close flattens the spot leg only.
    PerpCloseStuck,
    /// The call executes but the caller sees a timeout.
    ConfirmationLost,
}

/// Account ledger of the paper venue.
#[derive(Debug, Clone)]
pub struct PaperAccount {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub positions: HashMap<String, PaperPosition>,
    pub total_funding_received: Decimal,
    pub total_trading_fees: Decimal,
    pub order_count: u64,
}

/// Intents and fills kept for de-duplication and inspection.
const DEFAULT_INTENT_MEMORY: usize = 10_000;

#[derive(Debug)]
struct PaperState {
    account: PaperAccount,
    /// Successful fills by correlation id
    completed: HashMap<IntentId, Fill>,
    /// Insertion order of `completed`, oldest first
    completed_order: VecDeque<IntentId>,
    intent_log: VecDeque<ExecutionIntent>,
}

impl PaperState {
    fn log_intent(&mut self, intent: ExecutionIntent, memory: usize) {
        while self.intent_log.len() >= memory {
            self.intent_log.pop_front();
        }
        self.intent_log.push_back(intent);
    }

    /// Forgets the oldest fills beyond `memory`.
    fn remember(&mut self, id: IntentId, fill: Fill, memory: usize) {
        if self.completed.insert(id, fill).is_none() {
            self.completed_order.push_back(id);
        }
        while self.completed_order.len() > memory {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}

/// Paper trading venue.
pub struct PaperVenue {
    state: Arc<RwLock<PaperState>>,
    market: Arc<RwLock<HashMap<String, MarketSnapshot>>>,
    feed_faults: Arc<RwLock<HashMap<String, VecDeque<DataError>>>>,
    exec_faults: Arc<RwLock<HashMap<String, VecDeque<ExecFault>>>>,
    feed_delays: Arc<RwLock<HashMap<String, Duration>>>,
    order_id_counter: AtomicU64,
    /// Taker fee per leg
    fee_rate: Decimal,
    /// Price impact applied against the taker on every fill
    fill_slippage: Decimal,
    intent_memory: usize,
}

impl PaperVenue {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState {
                account: PaperAccount {
                    initial_balance,
                    balance: initial_balance,
                    positions: HashMap::new(),
                    total_funding_received: Decimal::ZERO,
                    total_trading_fees: Decimal::ZERO,
                    order_count: 0,
                },
                completed: HashMap::new(),
                completed_order: VecDeque::new(),
                intent_log: VecDeque::new(),
            })),
            market: Arc::new(RwLock::new(HashMap::new())),
            feed_faults: Arc::new(RwLock::new(HashMap::new())),
            exec_faults: Arc::new(RwLock::new(HashMap::new())),
            feed_delays: Arc::new(RwLock::new(HashMap::new())),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.0004), // 0.04% taker fee
            fill_slippage: dec!(0.0002),
            intent_memory: DEFAULT_INTENT_MEMORY,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_fill_slippage(mut self, slippage: Decimal) -> Self {
        self.fill_slippage = slippage;
        self
    }

    /// Bound on remembered intents and fills. At least one is kept.
    pub fn with_intent_memory(mut self, memory: usize) -> Self {
        self.intent_memory = memory.max(1);
        self
    }

    /// Replace the market snapshot for a pair.
    pub async fn set_snapshot(&self, snapshot: MarketSnapshot) {
        self.market
            .write()
            .await
            .insert(snapshot.pair.clone(), snapshot);
    }

    /// Convenience setter used by tests and the paper loop.
    pub async fn set_market(
        &self,
        pair: &str,
        funding_rate: Decimal,
        mark_price: Decimal,
        spot_price: Decimal,
        timestamp: DateTime<Utc>,
    ) {
        self.set_snapshot(MarketSnapshot {
            pair: pair.to_string(),
            funding_rate,
            mark_price,
            spot_price,
            timestamp,
        })
        .await;
    }

    /// Fail the next snapshot fetch for `pair` with `error`.
    pub async fn inject_feed_failure(&self, pair: &str, error: DataError) {
        self.feed_faults
            .write()
            .await
            .entry(pair.to_string())
            .or_default()
            .push_back(error);
    }

    /// Apply `fault` to the next open or close for `pair`.
    pub async fn inject_fault(&self, pair: &str, fault: ExecFault) {
        self.exec_faults
            .write()
            .await
            .entry(pair.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Delay every snapshot fetch for `pair`.
    pub async fn set_feed_delay(&self, pair: &str, delay: Duration) {
        self.feed_delays
            .write()
            .await
            .insert(pair.to_string(), delay);
    }

    pub async fn account(&self) -> PaperAccount {
        self.state.read().await.account.clone()
    }

    /// Recent intents received, in arrival order, including de-duplicated
    /// repeats.
    pub async fn intent_log(&self) -> Vec<ExecutionIntent> {
        self.state.read().await.intent_log.iter().cloned().collect()
    }

    /// Credit or debit funding on every open hedge at the current rates.
    /// Returns the amount per pair.
    pub async fn settle_funding(&self) -> HashMap<String, Decimal> {
        let mut state = self.state.write().await;
        let market = self.market.read().await;
        let account = &mut state.account;

        let mut per_pair = HashMap::new();
        let mut total = Decimal::ZERO;

        for (pair, position) in account.positions.iter_mut() {
            let Some(snapshot) = market.get(pair) else {
                continue;
            };
            // Short perp (negative qty) with positive rate receives
            let funding = -position.perp_qty * snapshot.mark_price * snapshot.funding_rate;
            position.funding_received += funding;
            total += funding;
            per_pair.insert(pair.clone(), funding);
        }

        account.balance += total;
        account.total_funding_received += total;

        if !per_pair.is_empty() {
            info!(
                funding_this_period = %total,
                total_funding = %account.total_funding_received,
                balance = %account.balance,
                "Paper funding settled"
            );
        }

        per_pair
    }

    /// Move every pair's market one step along a mean-reverting random walk,
    /// with occasional funding spikes.
    pub async fn drift_market<R: Rng>(&self, rng: &mut R, now: DateTime<Utc>) {
        let mut market = self.market.write().await;

        for snapshot in market.values_mut() {
            let noise = rng.gen_range(-0.00004..0.00004);
            let spike = if rng.gen_bool(0.03) {
                rng.gen_range(-0.0012..0.0012)
            } else {
                0.0
            };
            let price_move = rng.gen_range(-0.002..0.002);
            let basis = rng.gen_range(-0.0002..0.0002);

            let decimal = |v: f64| Decimal::from_f64(v).unwrap_or_default();

            snapshot.funding_rate =
                (snapshot.funding_rate * dec!(0.85) + decimal(noise + spike)).round_dp(8);
            snapshot.mark_price =
                (snapshot.mark_price * (Decimal::ONE + decimal(price_move))).round_dp(4);
            snapshot.spot_price =
                (snapshot.mark_price * (Decimal::ONE + decimal(basis))).round_dp(4);
            snapshot.timestamp = now;
        }
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn take_fault(&self, pair: &str) -> Option<ExecFault> {
        self.exec_faults
            .write()
            .await
            .get_mut(pair)
            .and_then(|queue| queue.pop_front())
    }

    async fn snapshot_for(&self, pair: &str) -> Result<MarketSnapshot, ExecutionError> {
        self.market
            .read()
            .await
            .get(pair)
            .cloned()
            .ok_or_else(|| ExecutionError::Rejected(format!("no market for {pair}")))
    }

    /// Taker price: buys fill above the reference, sells below.
    fn taker_price(&self, reference: Decimal, buying: bool) -> Decimal {
        if buying {
            reference * (Decimal::ONE + self.fill_slippage)
        } else {
            reference * (Decimal::ONE - self.fill_slippage)
        }
    }

    /// Execute one leg against the account. `signed_qty` is the change in
    /// position; reducing trades realize pnl into the balance.
    /// Returns (fill price, fee).
    fn execute_leg(
        &self,
        account: &mut PaperAccount,
        snapshot: &MarketSnapshot,
        leg: HedgeLeg,
        signed_qty: Decimal,
        now: DateTime<Utc>,
    ) -> (Decimal, Decimal) {
        let reference = match leg {
            HedgeLeg::Perp => snapshot.mark_price,
            HedgeLeg::Spot => snapshot.spot_price,
        };
        let price = self.taker_price(reference, signed_qty > Decimal::ZERO);
        let fee = signed_qty.abs() * price * self.fee_rate;

        let position = account
            .positions
            .entry(snapshot.pair.clone())
            .or_insert_with(|| PaperPosition {
                pair: snapshot.pair.clone(),
                perp_qty: Decimal::ZERO,
                perp_entry_price: Decimal::ZERO,
                spot_qty: Decimal::ZERO,
                spot_entry_price: Decimal::ZERO,
                opened_at: now,
                funding_received: Decimal::ZERO,
            });

        let (qty, entry) = match leg {
            HedgeLeg::Perp => (&mut position.perp_qty, &mut position.perp_entry_price),
            HedgeLeg::Spot => (&mut position.spot_qty, &mut position.spot_entry_price),
        };

        // Reducing trades realize pnl against the entry price
        let mut realized = Decimal::ZERO;
        if !qty.is_zero() && qty.is_sign_positive() != signed_qty.is_sign_positive() {
            let closed = signed_qty.abs().min(qty.abs());
            realized = closed * (price - *entry) * qty.signum();
        } else {
            *entry = price;
        }
        *qty += signed_qty;

        account.balance += realized - fee;
        account.total_trading_fees += fee;
        account.order_count += 1;

        debug!(
            order_id = self.next_order_id(),
            pair = %snapshot.pair,
            %leg,
            qty = %signed_qty,
            %price,
            %fee,
            "Paper order executed"
        );

        (price, fee)
    }
}

#[async_trait]
impl MarketFeed for PaperVenue {
    async fn get_snapshot(&self, pair: &str) -> Result<MarketSnapshot, DataError> {
        let delay = self.feed_delays.read().await.get(pair).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fault = self
            .feed_faults
            .write()
            .await
            .get_mut(pair)
            .and_then(|queue| queue.pop_front());
        if let Some(error) = fault {
            return Err(error);
        }

        self.market
            .read()
            .await
            .get(pair)
            .cloned()
            .ok_or_else(|| DataError::Unavailable {
                pair: pair.to_string(),
                reason: "pair not quoted".to_string(),
            })
    }
}

#[async_trait]
impl ExecutionAdapter for PaperVenue {
    async fn open_hedge(&self, intent: &OpenHedge) -> Result<Fill, ExecutionError> {
        {
            let mut state = self.state.write().await;
            state.log_intent(ExecutionIntent::Open(intent.clone()), self.intent_memory);
            if let Some(fill) = state.completed.get(&intent.id) {
                debug!(intent = %intent.id, "Duplicate open intent, returning original fill");
                return Ok(fill.clone());
            }
        }

        let fault = self.take_fault(&intent.pair).await;
        if fault == Some(ExecFault::Reject) {
            return Err(ExecutionError::Rejected("paper venue refused open".into()));
        }

        let snapshot = self.snapshot_for(&intent.pair).await?;
        if snapshot.mark_price <= Decimal::ZERO || snapshot.spot_price <= Decimal::ZERO {
            return Err(ExecutionError::Rejected(format!(
                "no valid price for {}",
                intent.pair
            )));
        }

        let now = Utc::now();
        let qty = (intent.notional / snapshot.mark_price).round_dp(6);
        let perp_delta = intent.perp_side.sign() * qty;

        let mut state = self.state.write().await;
        let (perp_price, perp_fee) =
            self.execute_leg(&mut state.account, &snapshot, HedgeLeg::Perp, perp_delta, now);

        if fault == Some(ExecFault::SpotLegRejected) {
            warn!(pair = %intent.pair, "Paper spot leg rejected after perp fill");
            return Err(ExecutionError::PartialFill {
                filled: LegFill {
                    leg: HedgeLeg::Perp,
                    price: perp_price,
                    qty,
                },
            });
        }

        let (spot_price, spot_fee) =
            self.execute_leg(&mut state.account, &snapshot, HedgeLeg::Spot, -perp_delta, now);

        let fill = Fill {
            perp_price,
            spot_price,
            perp_qty: qty,
            spot_qty: qty,
            fees: perp_fee + spot_fee,
        };
        state.remember(intent.id, fill.clone(), self.intent_memory);

        info!(
            pair = %intent.pair,
            side = %intent.perp_side,
            %qty,
            %perp_price,
            %spot_price,
            "Paper hedge opened"
        );

        if fault == Some(ExecFault::ConfirmationLost) {
            return Err(ExecutionError::Timeout);
        }
        Ok(fill)
    }

    async fn close_hedge(&self, intent: &CloseHedge) -> Result<Fill, ExecutionError> {
        {
            let mut state = self.state.write().await;
            state.log_intent(ExecutionIntent::Close(intent.clone()), self.intent_memory);
            if let Some(fill) = state.completed.get(&intent.id) {
                debug!(intent = %intent.id, "Duplicate close intent, returning original fill");
                return Ok(fill.clone());
            }
        }

        let fault = self.take_fault(&intent.pair).await;
        if fault == Some(ExecFault::Reject) {
            return Err(ExecutionError::Rejected("paper venue refused close".into()));
        }

        let snapshot = self.snapshot_for(&intent.pair).await?;
        let now = Utc::now();

        let mut state = self.state.write().await;
        let (perp_qty, spot_qty) = state
            .account
            .positions
            .get(&intent.pair)
            .map(|p| (p.perp_qty, p.spot_qty))
            .unwrap_or_default();

        let mut fill = Fill {
            perp_price: snapshot.mark_price,
            spot_price: snapshot.spot_price,
            perp_qty: Decimal::ZERO,
            spot_qty: Decimal::ZERO,
            fees: Decimal::ZERO,
        };

        if intent.legs.includes(HedgeLeg::Spot) && !spot_qty.is_zero() {
            let (price, fee) =
                self.execute_leg(&mut state.account, &snapshot, HedgeLeg::Spot, -spot_qty, now);
            fill.spot_price = price;
            fill.spot_qty = spot_qty.abs();
            fill.fees += fee;
        }

        if fault == Some(ExecFault::PerpCloseStuck) && intent.legs.includes(HedgeLeg::Perp) {
            warn!(pair = %intent.pair, "Paper perp close stuck after spot close");
            return Err(ExecutionError::PartialClose {
                closed: HedgeLeg::Spot,
            });
        }

        if intent.legs.includes(HedgeLeg::Perp) && !perp_qty.is_zero() {
            let (price, fee) =
                self.execute_leg(&mut state.account, &snapshot, HedgeLeg::Perp, -perp_qty, now);
            fill.perp_price = price;
            fill.perp_qty = perp_qty.abs();
            fill.fees += fee;
        }

        if state
            .account
            .positions
            .get(&intent.pair)
            .is_some_and(PaperPosition::is_flat)
        {
            state.account.positions.remove(&intent.pair);
        }
        state.remember(intent.id, fill.clone(), self.intent_memory);

        info!(pair = %intent.pair, legs = ?intent.legs, "Paper hedge closed");

        if fault == Some(ExecFault::ConfirmationLost) {
            return Err(ExecutionError::Timeout);
        }
        Ok(fill)
    }

    async fn lookup(&self, id: IntentId) -> Result<Option<Fill>, ExecutionError> {
        Ok(self.state.read().await.completed.get(&id).cloned())
    }
}

#[async_trait]
impl AccountSource for PaperVenue {
    async fn equity(&self) -> anyhow::Result<Decimal> {
        let state = self.state.read().await;
        let market = self.market.read().await;

        let unrealized: Decimal = state
            .account
            .positions
            .values()
            .filter_map(|p| {
                market.get(&p.pair).map(|m| {
                    p.perp_qty * (m.mark_price - p.perp_entry_price)
                        + p.spot_qty * (m.spot_price - p.spot_entry_price)
                })
            })
            .sum();

        Ok(state.account.balance + unrealized)
    }
}
