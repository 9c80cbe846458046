//! Position lifecycle for one pair.
//!
//! A [`PositionStateMachine`] owns its [`Position`] exclusively and moves it
//! through IDLE → OPENING → OPEN → CLOSING → CLOSED. The machine never talks
//! to a venue: it emits [`ExecutionIntent`]s and is fed the results back
//! through [`PositionStateMachine::on_open_result`] and
//! [`PositionStateMachine::on_close_result`].
//!
//! Result handlers only change state. Any intent a new state needs is
//! emitted by the next [`PositionStateMachine::advance`], which the
//! orchestrator calls on the same tick the result is drained.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::detector::Signal;
use crate::error::{DenyReason, ExecutionError, TransitionError};
use crate::exchange::{
    CloseHedge, ExecutionIntent, Fill, HedgeLeg, HedgeLegs, IntentId, MarketSnapshot, OpenHedge,
    PerpSide,
};
use crate::risk::{AlertSeverity, RiskAlert, RiskAlertType, RiskDecision};
use crate::utils::decimal::relative_gap;

/// Parameters of the position lifecycle.
#[derive(Debug, Clone)]
pub struct PositionConfig {
    /// Close once the collected rate falls below this
    pub close_threshold: Decimal,
    /// Max leg notional mismatch accepted at entry
    pub slippage_pct: Decimal,
    /// Max leg notional mismatch tolerated while open
    pub hedge_drift_tolerance_pct: Decimal,
    pub funding_interval: Duration,
    pub order_timeout: Duration,
    pub close_retry_base: Duration,
    pub close_retry_max: Duration,
    pub close_alert_after_attempts: u32,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            close_threshold: dec!(0.00005),
            slippage_pct: dec!(0.001),
            hedge_drift_tolerance_pct: dec!(0.02),
            funding_interval: Duration::hours(1),
            order_timeout: Duration::seconds(10),
            close_retry_base: Duration::seconds(2),
            close_retry_max: Duration::seconds(300),
            close_alert_after_attempts: 5,
        }
    }
}

impl PositionConfig {
    /// Delay before close attempt `attempts + 1`, given `attempts` failures.
    pub fn close_backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(30);
        let millis = self
            .close_retry_base
            .num_milliseconds()
            .saturating_mul(1i64 << shift);
        Duration::milliseconds(millis).min(self.close_retry_max)
    }

    fn stall_after(&self) -> Duration {
        self.order_timeout * 2
    }
}

/// Why a position is being closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum CloseReason {
    /// Collected funding fell below the close threshold
    FundingFaded { collected_rate: Decimal },
    RiskDenied { reason: DenyReason },
    /// Portfolio-wide unwind after a circuit breaker trip
    ForcedUnwind,
    HedgeDrift { drift: Decimal },
    /// Open failed with one or both legs possibly filled
    OpenFailed { error: String },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::FundingFaded { collected_rate } => {
                write!(f, "funding faded to {collected_rate}")
            }
            CloseReason::RiskDenied { reason } => write!(f, "risk denied: {reason}"),
            CloseReason::ForcedUnwind => write!(f, "forced unwind"),
            CloseReason::HedgeDrift { drift } => write!(f, "hedge drift {drift}"),
            CloseReason::OpenFailed { error } => write!(f, "open failed: {error}"),
        }
    }
}

/// Lifecycle state of a pair position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Idle,
    Opening {
        intent: IntentId,
        dispatched_at: DateTime<Utc>,
    },
    Open,
    Closing {
        intent: IntentId,
        reason: CloseReason,
        legs: HedgeLegs,
        /// Failed attempts so far
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        /// Set while a close intent is with the venue
        in_flight_since: Option<DateTime<Utc>>,
    },
    Closed {
        reason: CloseReason,
        at: DateTime<Utc>,
    },
}

impl PositionState {
    pub fn name(&self) -> &'static str {
        match self {
            PositionState::Idle => "IDLE",
            PositionState::Opening { .. } => "OPENING",
            PositionState::Open => "OPEN",
            PositionState::Closing { .. } => "CLOSING",
            PositionState::Closed { .. } => "CLOSED",
        }
    }
}

/// A hedged pair position. Sizes are unsigned; the perp direction is
/// `perp_side` and the spot leg is always the opposite.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub pair: String,
    pub opened_at: DateTime<Utc>,
    pub perp_side: PerpSide,
    pub perp_size: Decimal,
    pub spot_size: Decimal,
    pub entry_perp_price: Decimal,
    pub entry_spot_price: Decimal,
    pub capital_allocated: Decimal,
    pub cumulative_funding_collected: Decimal,
    /// Relative gap between the leg notionals at current marks
    pub unrealized_hedge_drift: Decimal,
    pub mark_price: Decimal,
    pub spot_price: Decimal,
    pub last_funding_rate: Decimal,
    pub fees_paid: Decimal,
    /// PnL of legs already closed
    pub closed_leg_pnl: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub next_funding_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(pair: &str, perp_side: PerpSide, capital: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            pair: pair.to_string(),
            opened_at: now,
            perp_side,
            perp_size: Decimal::ZERO,
            spot_size: Decimal::ZERO,
            entry_perp_price: Decimal::ZERO,
            entry_spot_price: Decimal::ZERO,
            capital_allocated: capital,
            cumulative_funding_collected: Decimal::ZERO,
            unrealized_hedge_drift: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            spot_price: Decimal::ZERO,
            last_funding_rate: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            closed_leg_pnl: Decimal::ZERO,
            realized_pnl: None,
            next_funding_at: None,
        }
    }

    /// PnL of `leg` if closed at `exit`.
    fn leg_pnl(&self, leg: HedgeLeg, exit: Decimal) -> Decimal {
        match leg {
            HedgeLeg::Perp => self.perp_side.sign() * self.perp_size * (exit - self.entry_perp_price),
            HedgeLeg::Spot => -self.perp_side.sign() * self.spot_size * (exit - self.entry_spot_price),
        }
    }

    /// Unrealized price PnL of both open legs at current marks.
    pub fn hedge_pnl(&self) -> Decimal {
        self.leg_pnl(HedgeLeg::Perp, self.mark_price) + self.leg_pnl(HedgeLeg::Spot, self.spot_price)
    }

    /// Hedge PnL plus funding, less fees.
    pub fn mark_to_market(&self) -> Decimal {
        self.closed_leg_pnl + self.hedge_pnl() + self.cumulative_funding_collected - self.fees_paid
    }

    fn leg_notionals(&self) -> (Decimal, Decimal) {
        (self.perp_size * self.mark_price, self.spot_size * self.spot_price)
    }

    fn close_leg(&mut self, leg: HedgeLeg, exit: Decimal) {
        self.closed_leg_pnl += self.leg_pnl(leg, exit);
        match leg {
            HedgeLeg::Perp => self.perp_size = Decimal::ZERO,
            HedgeLeg::Spot => self.spot_size = Decimal::ZERO,
        }
    }
}

/// First funding boundary strictly after `after`, aligned to the epoch.
fn next_funding_boundary(after: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.num_seconds().max(1);
    let next = (after.timestamp().div_euclid(step) + 1) * step;
    DateTime::from_timestamp(next, 0).unwrap_or(after + interval)
}

/// One state change, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub pair: String,
    pub from: &'static str,
    pub to: &'static str,
    pub at: DateTime<Utc>,
    pub intent: Option<IntentId>,
    pub detail: String,
}

/// Side effects a machine queues for the orchestrator.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Transition(TransitionRecord),
    FundingAccrued {
        pair: String,
        amount: Decimal,
        funding_rate: Decimal,
        cumulative: Decimal,
        at: DateTime<Utc>,
    },
    Alert(RiskAlert),
}

/// Per-tick inputs to [`PositionStateMachine::advance`].
#[derive(Debug, Clone)]
pub struct AdvanceInput {
    pub now: DateTime<Utc>,
    /// Funding rate observed this tick; `None` when the pair's snapshot failed
    pub funding_rate: Option<Decimal>,
    pub risk: RiskDecision,
    pub force_unwind: bool,
}

/// Read-only projection for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub pair: String,
    pub state: &'static str,
    pub perp_side: Option<PerpSide>,
    pub perp_size: Decimal,
    pub spot_size: Decimal,
    pub entry_perp_price: Decimal,
    pub entry_spot_price: Decimal,
    pub capital_allocated: Decimal,
    pub funding_collected: Decimal,
    pub hedge_drift: Decimal,
    pub mark_to_market: Decimal,
    pub close_attempts: u32,
}

/// Drives one pair's position.
#[derive(Debug)]
pub struct PositionStateMachine {
    pair: String,
    config: PositionConfig,
    state: PositionState,
    position: Option<Position>,
    /// Close reason requested while an open was in flight
    pending_unwind: Option<CloseReason>,
    /// Open whose outcome was never confirmed and is being reconciled
    unconfirmed_open: Option<IntentId>,
    close_alert_raised: bool,
    events: Vec<PositionEvent>,
}

impl PositionStateMachine {
    pub fn new(pair: &str, config: PositionConfig) -> Self {
        Self {
            pair: pair.to_string(),
            config,
            state: PositionState::Idle,
            position: None,
            pending_unwind: None,
            unconfirmed_open: None,
            close_alert_raised: false,
            events: Vec::new(),
        }
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, PositionState::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, PositionState::Closed { .. })
    }

    /// Drain the queued events.
    pub fn take_events(&mut self) -> Vec<PositionEvent> {
        std::mem::take(&mut self.events)
    }

    /// IDLE → OPENING. Returns the open intent: perp and spot each get half
    /// of `capital`.
    pub fn begin_open(
        &mut self,
        signal: &Signal,
        capital: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ExecutionIntent, TransitionError> {
        if !self.is_idle() {
            return Err(self.illegal("open"));
        }
        let Some(perp_side) = signal.direction.perp_side() else {
            return Err(self.illegal("open without a signal"));
        };

        let mut position = Position::new(&self.pair, perp_side, capital, now);
        position.last_funding_rate = signal.raw_rate;
        self.position = Some(position);
        self.pending_unwind = None;
        self.unconfirmed_open = None;
        self.close_alert_raised = false;

        let intent = OpenHedge {
            id: IntentId::new(),
            pair: self.pair.clone(),
            perp_side,
            notional: capital / dec!(2),
        };

        info!(
            pair = %self.pair,
            side = %perp_side,
            %capital,
            notional_per_leg = %intent.notional,
            rate = %signal.raw_rate,
            zscore = %signal.zscore,
            intent = %intent.id,
            "Opening hedge"
        );

        self.transition(
            PositionState::Opening {
                intent: intent.id,
                dispatched_at: now,
            },
            now,
            Some(intent.id),
            format!("{perp_side} perp, {capital} allocated"),
        );

        Ok(ExecutionIntent::Open(intent))
    }

    /// Fold the venue's answer to the open intent into the state.
    pub fn on_open_result(
        &mut self,
        intent: IntentId,
        result: Result<Fill, ExecutionError>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        // Late answer to an open already being reconciled
        if matches!(self.state, PositionState::Closing { .. }) && self.unconfirmed_open == Some(intent) {
            return match result {
                Ok(fill) => self.adopt_open_fill(intent, fill, now),
                Err(err) => {
                    debug!(pair = %self.pair, %intent, error = %err, "Late open failure ignored");
                    Ok(())
                }
            };
        }
        let PositionState::Opening { intent: pending, .. } = &self.state else {
            return Err(self.illegal("accept an open result"));
        };
        if *pending != intent {
            return Err(self.unknown(intent));
        }
        let Some(position) = self.position.as_mut() else {
            return Err(self.illegal("accept an open result without a position"));
        };

        match result {
            Ok(fill) => {
                position.perp_size = fill.perp_qty;
                position.spot_size = fill.spot_qty;
                position.entry_perp_price = fill.perp_price;
                position.entry_spot_price = fill.spot_price;
                position.mark_price = fill.perp_price;
                position.spot_price = fill.spot_price;
                position.fees_paid += fill.fees;
                position.opened_at = now;
                position.next_funding_at =
                    Some(next_funding_boundary(now, self.config.funding_interval));

                let drift = relative_gap(fill.perp_notional(), fill.spot_notional());
                position.unrealized_hedge_drift = drift;

                info!(
                    pair = %self.pair,
                    perp_qty = %fill.perp_qty,
                    perp_price = %fill.perp_price,
                    spot_qty = %fill.spot_qty,
                    spot_price = %fill.spot_price,
                    fees = %fill.fees,
                    %drift,
                    "Hedge filled"
                );

                if drift > self.config.slippage_pct {
                    warn!(
                        pair = %self.pair,
                        %drift,
                        tolerance = %self.config.slippage_pct,
                        "Entry legs mismatched beyond slippage, unwinding"
                    );
                    self.begin_close(HedgeLegs::Both, CloseReason::HedgeDrift { drift }, now);
                } else if let Some(reason) = self.pending_unwind.take() {
                    self.transition(PositionState::Open, now, Some(intent), "filled".into());
                    self.begin_close(HedgeLegs::Both, reason, now);
                } else {
                    self.transition(PositionState::Open, now, Some(intent), "filled".into());
                }
            }
            Err(ExecutionError::PartialFill { filled }) => {
                match filled.leg {
                    HedgeLeg::Perp => {
                        position.perp_size = filled.qty;
                        position.entry_perp_price = filled.price;
                        position.mark_price = filled.price;
                    }
                    HedgeLeg::Spot => {
                        position.spot_size = filled.qty;
                        position.entry_spot_price = filled.price;
                        position.spot_price = filled.price;
                    }
                }
                error!(
                    pair = %self.pair,
                    leg = %filled.leg,
                    qty = %filled.qty,
                    "Partial fill, unwinding the filled leg"
                );
                let reason = CloseReason::OpenFailed {
                    error: format!("partial fill: {} leg only", filled.leg),
                };
                self.begin_close(HedgeLegs::only(filled.leg), reason, now);
            }
            Err(ExecutionError::Rejected(message)) => {
                warn!(pair = %self.pair, %message, "Open rejected, nothing filled");
                self.position = None;
                self.transition(
                    PositionState::Idle,
                    now,
                    Some(intent),
                    format!("rejected: {message}"),
                );
            }
            Err(err) => {
                // Venue state unknown; reconcile by closing whatever exists
                error!(pair = %self.pair, error = %err, "Open unconfirmed, reconciling");
                self.unconfirmed_open = Some(intent);
                let reason = CloseReason::OpenFailed {
                    error: err.to_string(),
                };
                self.begin_close(HedgeLegs::Both, reason, now);
            }
        }

        Ok(())
    }

    /// Book the entry of an open that was reported unconfirmed but did trade.
    /// The reconciling close stays in place; only sizes, entry prices and
    /// fees are taken from `fill`.
    pub fn adopt_open_fill(
        &mut self,
        intent: IntentId,
        fill: Fill,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !matches!(self.state, PositionState::Closing { .. }) {
            return Err(self.illegal("adopt an open fill"));
        }
        if self.unconfirmed_open != Some(intent) {
            return Err(self.unknown(intent));
        }
        let Some(position) = self.position.as_mut() else {
            return Err(self.illegal("adopt an open fill without a position"));
        };
        self.unconfirmed_open = None;

        position.perp_size = fill.perp_qty;
        position.spot_size = fill.spot_qty;
        position.entry_perp_price = fill.perp_price;
        position.entry_spot_price = fill.spot_price;
        if position.mark_price.is_zero() {
            position.mark_price = fill.perp_price;
        }
        if position.spot_price.is_zero() {
            position.spot_price = fill.spot_price;
        }
        position.fees_paid += fill.fees;
        position.opened_at = now;
        position.unrealized_hedge_drift = relative_gap(fill.perp_notional(), fill.spot_notional());

        warn!(
            pair = %self.pair,
            %intent,
            perp_qty = %fill.perp_qty,
            spot_qty = %fill.spot_qty,
            fees = %fill.fees,
            "Recovered fill for unconfirmed open"
        );

        Ok(())
    }

    /// Update marks from a fresh snapshot. While OPEN this also tracks hedge
    /// drift and accrues funding at each elapsed funding boundary.
    pub fn observe(&mut self, snapshot: &MarketSnapshot, now: DateTime<Utc>) {
        if snapshot.pair != self.pair {
            return;
        }
        let is_open = matches!(self.state, PositionState::Open);
        let interval = self.config.funding_interval;
        let Some(position) = self.position.as_mut() else {
            return;
        };

        position.mark_price = snapshot.mark_price;
        position.spot_price = snapshot.spot_price;
        position.last_funding_rate = snapshot.funding_rate;

        if !is_open {
            return;
        }

        let (perp_notional, spot_notional) = position.leg_notionals();
        position.unrealized_hedge_drift = relative_gap(perp_notional, spot_notional);

        while let Some(due) = position.next_funding_at.filter(|due| *due <= now) {
            let collected = position.perp_side.collected_rate(snapshot.funding_rate);
            let amount = collected * position.perp_size * snapshot.mark_price;
            position.cumulative_funding_collected += amount;
            position.next_funding_at = Some(due + interval);

            debug!(
                pair = %self.pair,
                %amount,
                rate = %snapshot.funding_rate,
                cumulative = %position.cumulative_funding_collected,
                "Funding accrued"
            );
            self.events.push(PositionEvent::FundingAccrued {
                pair: self.pair.clone(),
                amount,
                funding_rate: snapshot.funding_rate,
                cumulative: position.cumulative_funding_collected,
                at: due,
            });
        }
    }

    /// Evaluate transitions for this tick. Returns the intent to dispatch,
    /// if any.
    pub fn advance(&mut self, input: &AdvanceInput) -> Option<ExecutionIntent> {
        let now = input.now;

        match &self.state {
            PositionState::Idle | PositionState::Closed { .. } => None,
            PositionState::Opening {
                intent,
                dispatched_at,
            } => {
                let intent = *intent;
                // The open completes first; the result handler then closes
                if input.force_unwind {
                    self.pending_unwind = Some(CloseReason::ForcedUnwind);
                } else if let RiskDecision::Deny(reason) = &input.risk {
                    if self.pending_unwind.is_none() {
                        self.pending_unwind = Some(CloseReason::RiskDenied {
                            reason: reason.clone(),
                        });
                    }
                }
                if now - *dispatched_at > self.config.stall_after() {
                    warn!(pair = %self.pair, %intent, "Open stalled, treating as timeout");
                    if let Err(err) = self.on_open_result(intent, Err(ExecutionError::Timeout), now) {
                        error!(pair = %self.pair, error = %err, "Stall handling failed");
                    }
                    return self.dispatch_close(now);
                }
                None
            }
            PositionState::Open => {
                let reason = self.close_reason(input)?;
                self.begin_close(HedgeLegs::Both, reason, now);
                self.dispatch_close(now)
            }
            PositionState::Closing {
                intent,
                in_flight_since: Some(since),
                ..
            } => {
                if now - *since <= self.config.stall_after() {
                    return None;
                }
                let intent = *intent;
                warn!(pair = %self.pair, %intent, "Close stalled, treating as timeout");
                if let Err(err) = self.on_close_result(intent, Err(ExecutionError::Timeout), now) {
                    error!(pair = %self.pair, error = %err, "Stall handling failed");
                }
                self.dispatch_close(now)
            }
            PositionState::Closing { .. } => self.dispatch_close(now),
        }
    }

    /// Fold the venue's answer to a close intent into the state.
    pub fn on_close_result(
        &mut self,
        intent: IntentId,
        result: Result<Fill, ExecutionError>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let PositionState::Closing {
            intent: pending,
            reason,
            legs,
            attempts,
            ..
        } = &self.state
        else {
            return Err(self.illegal("accept a close result"));
        };
        if *pending != intent {
            return Err(self.unknown(intent));
        }
        let (reason, legs, attempts) = (reason.clone(), *legs, *attempts);

        match result {
            Ok(fill) => {
                if let Some(position) = self.position.as_mut() {
                    for leg in [HedgeLeg::Perp, HedgeLeg::Spot] {
                        if !legs.includes(leg) {
                            continue;
                        }
                        let (qty, price, mark) = match leg {
                            HedgeLeg::Perp => (fill.perp_qty, fill.perp_price, position.mark_price),
                            HedgeLeg::Spot => (fill.spot_qty, fill.spot_price, position.spot_price),
                        };
                        let exit = if qty.is_zero() { mark } else { price };
                        position.close_leg(leg, exit);
                    }
                    position.fees_paid += fill.fees;
                    let realized = position.closed_leg_pnl + position.cumulative_funding_collected
                        - position.fees_paid;
                    position.realized_pnl = Some(realized);

                    info!(
                        pair = %self.pair,
                        %reason,
                        %realized,
                        funding = %position.cumulative_funding_collected,
                        fees = %position.fees_paid,
                        "Hedge closed"
                    );
                }

                self.transition(
                    PositionState::Closed {
                        reason: reason.clone(),
                        at: now,
                    },
                    now,
                    Some(intent),
                    reason.to_string(),
                );
            }
            Err(ExecutionError::PartialClose { closed }) => {
                if let Some(position) = self.position.as_mut() {
                    let exit = match closed {
                        HedgeLeg::Perp => position.mark_price,
                        HedgeLeg::Spot => position.spot_price,
                    };
                    position.close_leg(closed, exit);
                }

                match legs.without(closed) {
                    Some(remaining) => {
                        warn!(
                            pair = %self.pair,
                            %closed,
                            remaining = ?remaining,
                            "Partial close, retrying remaining leg"
                        );
                        self.schedule_retry(intent, reason, remaining, attempts + 1, now);
                    }
                    None => {
                        // The leg that closed was the only one left
                        self.state = PositionState::Closing {
                            intent,
                            reason: reason.clone(),
                            legs,
                            attempts,
                            next_attempt_at: now,
                            in_flight_since: None,
                        };
                        return self.on_close_result(intent, Ok(self.empty_fill()), now);
                    }
                }
            }
            Err(err) => {
                warn!(
                    pair = %self.pair,
                    error = %err,
                    attempt = attempts + 1,
                    "Close failed, will retry"
                );
                self.schedule_retry(intent, reason, legs, attempts + 1, now);
            }
        }

        Ok(())
    }

    pub fn view(&self) -> PositionView {
        let position = self.position.as_ref();
        let attempts = match &self.state {
            PositionState::Closing { attempts, .. } => *attempts,
            _ => 0,
        };

        PositionView {
            pair: self.pair.clone(),
            state: self.state.name(),
            perp_side: position.map(|p| p.perp_side),
            perp_size: position.map(|p| p.perp_size).unwrap_or_default(),
            spot_size: position.map(|p| p.spot_size).unwrap_or_default(),
            entry_perp_price: position.map(|p| p.entry_perp_price).unwrap_or_default(),
            entry_spot_price: position.map(|p| p.entry_spot_price).unwrap_or_default(),
            capital_allocated: position.map(|p| p.capital_allocated).unwrap_or_default(),
            funding_collected: position
                .map(|p| p.cumulative_funding_collected)
                .unwrap_or_default(),
            hedge_drift: position
                .map(|p| p.unrealized_hedge_drift)
                .unwrap_or_default(),
            mark_to_market: position.map(Position::mark_to_market).unwrap_or_default(),
            close_attempts: attempts,
        }
    }

    /// Reason to leave OPEN this tick, highest priority first.
    fn close_reason(&mut self, input: &AdvanceInput) -> Option<CloseReason> {
        if input.force_unwind {
            return Some(CloseReason::ForcedUnwind);
        }
        if let RiskDecision::Deny(reason) = &input.risk {
            return Some(CloseReason::RiskDenied {
                reason: reason.clone(),
            });
        }

        let position = self.position.as_ref()?;
        let drift = position.unrealized_hedge_drift;
        if drift > self.config.hedge_drift_tolerance_pct {
            let alert = RiskAlert::new(
                RiskAlertType::HedgeDrift {
                    pair: self.pair.clone(),
                    drift_pct: drift,
                },
                AlertSeverity::Warning,
                Some(self.pair.clone()),
                format!("{} legs drifted {drift} apart, closing", self.pair),
                input.now,
            )
            .with_metric("tolerance", self.config.hedge_drift_tolerance_pct);
            self.events.push(PositionEvent::Alert(alert));
            return Some(CloseReason::HedgeDrift { drift });
        }

        let rate = input.funding_rate?;
        let collected_rate = position.perp_side.collected_rate(rate);
        (collected_rate < self.config.close_threshold)
            .then_some(CloseReason::FundingFaded { collected_rate })
    }

    fn begin_close(&mut self, legs: HedgeLegs, reason: CloseReason, now: DateTime<Utc>) {
        let intent = IntentId::new();
        info!(pair = %self.pair, %reason, legs = ?legs, %intent, "Closing hedge");
        self.transition(
            PositionState::Closing {
                intent,
                reason: reason.clone(),
                legs,
                attempts: 0,
                next_attempt_at: now,
                in_flight_since: None,
            },
            now,
            Some(intent),
            reason.to_string(),
        );
    }

    /// Emit the pending close intent if it is due and not already in flight.
    fn dispatch_close(&mut self, now: DateTime<Utc>) -> Option<ExecutionIntent> {
        let PositionState::Closing {
            intent,
            legs,
            next_attempt_at,
            in_flight_since,
            ..
        } = &mut self.state
        else {
            return None;
        };
        if in_flight_since.is_some() || now < *next_attempt_at {
            return None;
        }

        *in_flight_since = Some(now);
        Some(ExecutionIntent::Close(CloseHedge {
            id: *intent,
            pair: self.pair.clone(),
            legs: *legs,
        }))
    }

    fn schedule_retry(
        &mut self,
        intent: IntentId,
        reason: CloseReason,
        legs: HedgeLegs,
        attempts: u32,
        now: DateTime<Utc>,
    ) {
        let delay = self.config.close_backoff(attempts);
        self.state = PositionState::Closing {
            intent,
            reason,
            legs,
            attempts,
            next_attempt_at: now + delay,
            in_flight_since: None,
        };
        debug!(pair = %self.pair, attempts, delay_ms = delay.num_milliseconds(), "Close retry scheduled");

        if attempts >= self.config.close_alert_after_attempts && !self.close_alert_raised {
            self.close_alert_raised = true;
            let alert = RiskAlert::new(
                RiskAlertType::PersistentCloseFailure {
                    pair: self.pair.clone(),
                    attempts,
                },
                AlertSeverity::Critical,
                Some(self.pair.clone()),
                format!(
                    "{} close failed {attempts} times, still retrying. Check the venue manually.",
                    self.pair
                ),
                now,
            )
            .with_metric("attempts", Decimal::from(attempts));
            self.events.push(PositionEvent::Alert(alert));
        }
    }

    fn empty_fill(&self) -> Fill {
        let (perp_price, spot_price) = self
            .position
            .as_ref()
            .map(|p| (p.mark_price, p.spot_price))
            .unwrap_or_default();
        Fill {
            perp_price,
            spot_price,
            perp_qty: Decimal::ZERO,
            spot_qty: Decimal::ZERO,
            fees: Decimal::ZERO,
        }
    }

    fn transition(
        &mut self,
        to: PositionState,
        now: DateTime<Utc>,
        intent: Option<IntentId>,
        detail: String,
    ) {
        let from = self.state.name();
        self.state = to;
        let record = TransitionRecord {
            pair: self.pair.clone(),
            from,
            to: self.state.name(),
            at: now,
            intent,
            detail,
        };
        debug!(pair = %self.pair, from, to = record.to, "Position transition");
        self.events.push(PositionEvent::Transition(record));
    }

    fn illegal(&self, action: &'static str) -> TransitionError {
        TransitionError::IllegalState {
            pair: self.pair.clone(),
            action,
            state: self.state.name(),
        }
    }

    fn unknown(&self, intent: IntentId) -> TransitionError {
        TransitionError::UnknownIntent {
            pair: self.pair.clone(),
            intent: intent.to_string(),
        }
    }
}
