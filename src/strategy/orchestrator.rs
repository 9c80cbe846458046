//! The per-tick driving loop.
//!
//! One [`Orchestrator::tick`]:
//! 1. applies a pending operator breaker reset,
//! 2. folds in execution results that completed since the last tick,
//! 3. fetches every pair's snapshot concurrently, each under a timeout,
//! 4. appends observations to the per-pair histories and runs the detector,
//! 5. marks open positions to the new snapshots,
//! 6. records one aggregate equity sample with the risk gate,
//! 7. advances every live position machine,
//! 8. attempts entries for triggering signals, best annualized rate first,
//! 9. archives finished machines and publishes a status report.
//!
//! Execution intents run as tasks in a [`JoinSet`] so a slow venue never
//! blocks the next tick. The risk gate and the machines are only touched
//! from the tick itself.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::control::{ControlHandle, PairError, StatusReport, PORTFOLIO_KEY};
use super::detector::{Evaluation, FundingSignalDetector, Signal};
use super::history::{AppendOutcome, FundingHistory, FundingObservation};
use super::position::{AdvanceInput, PositionConfig, PositionEvent, PositionState, PositionStateMachine};
use crate::config::Config;
use crate::error::{DataError, ExecutionError};
use crate::exchange::{
    AccountSource, ExecutionAdapter, ExecutionIntent, Fill, IntentId, MarketFeed, MarketSnapshot,
};
use crate::persistence::{AuditRecord, AuditSink};
use crate::risk::{AlertSeverity, EquitySample, RiskAlert, RiskAlertType, RiskDecision, RiskGate};
use crate::utils::Clock;

/// Loop parameters not owned by a narrower component.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub pairs: Vec<String>,
    pub history_window: usize,
    pub fetch_timeout: Duration,
    pub order_timeout: Duration,
    pub max_snapshot_age: chrono::Duration,
    pub capital_per_pair_pct: Decimal,
    pub min_trade_size_usdt: Decimal,
    pub taker_fee_pct: Decimal,
    pub slippage_pct: Decimal,
    pub funding_drop_alert_pct: Decimal,
}

/// External services the orchestrator calls into.
pub struct Collaborators {
    pub feed: Arc<dyn MarketFeed>,
    pub executor: Arc<dyn ExecutionAdapter>,
    pub account: Arc<dyn AccountSource>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

/// What one tick did, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub tick: u64,
    pub snapshots: usize,
    pub data_errors: usize,
    pub signals: usize,
    pub entries: usize,
    pub intents: usize,
    pub breaker_tripped: bool,
}

#[derive(Debug)]
struct ExecutionReport {
    intent: ExecutionIntent,
    result: Result<Fill, ExecutionError>,
    /// Venue's record of an open whose confirmation timed out
    recovered: Option<Fill>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    position_config: PositionConfig,
    detector: FundingSignalDetector,
    risk: RiskGate,
    feed: Arc<dyn MarketFeed>,
    executor: Arc<dyn ExecutionAdapter>,
    account: Arc<dyn AccountSource>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    histories: HashMap<String, FundingHistory>,
    machines: BTreeMap<String, PositionStateMachine>,
    in_flight: JoinSet<ExecutionReport>,
    control: ControlHandle,
    failing_pairs: HashSet<String>,
    last_errors: BTreeMap<String, PairError>,
    realized_pnl: Decimal,
    tick_count: u64,
}

impl Orchestrator {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let now = collaborators.clock.now();
        let orchestrator_config = config.orchestrator();
        let histories = orchestrator_config
            .pairs
            .iter()
            .map(|pair| {
                (
                    pair.clone(),
                    FundingHistory::new(orchestrator_config.history_window),
                )
            })
            .collect();

        info!(
            pairs = ?orchestrator_config.pairs,
            configured_capital = %config.capital.initial_capital,
            "Orchestrator initialized"
        );

        Self {
            position_config: config.position(),
            detector: FundingSignalDetector::new(config.detector()),
            risk: RiskGate::new(config.risk_limits(), config.capital.initial_capital, now),
            feed: collaborators.feed,
            executor: collaborators.executor,
            account: collaborators.account,
            audit: collaborators.audit,
            clock: collaborators.clock,
            histories,
            machines: BTreeMap::new(),
            in_flight: JoinSet::new(),
            control: ControlHandle::new(true),
            failing_pairs: HashSet::new(),
            last_errors: BTreeMap::new(),
            realized_pnl: Decimal::ZERO,
            tick_count: 0,
            config: orchestrator_config,
        }
    }

    /// Handle for start/stop, breaker reset and status.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn risk(&self) -> &RiskGate {
        &self.risk
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[instrument(skip_all, fields(tick = self.tick_count + 1))]
    pub async fn tick(&mut self) -> TickSummary {
        let now = self.clock.now();
        self.tick_count += 1;
        let mut summary = TickSummary {
            tick: self.tick_count,
            ..Default::default()
        };

        if self.control.take_reset_request() {
            if let Some(alert) = self.risk.reset_circuit_breaker(now) {
                self.raise(alert);
                self.record_risk_change("circuit breaker reset", now);
            }
        }

        self.drain_reports(now);

        let snapshots = self.fetch_snapshots(now, &mut summary).await;

        let mut candidates = Vec::new();
        for snapshot in snapshots.values() {
            if let Some(signal) = self.ingest(snapshot) {
                candidates.push(signal);
            }
        }
        summary.signals = candidates.len();

        for (pair, snapshot) in &snapshots {
            if let Some(machine) = self.machines.get_mut(pair) {
                machine.observe(snapshot, now);
            }
        }

        summary.breaker_tripped = self.update_risk(now).await;

        summary.intents += self.advance_machines(&snapshots, now);

        candidates.sort_by(|a, b| b.annualized_rate.abs().cmp(&a.annualized_rate.abs()));
        for signal in &candidates {
            if self.try_enter(signal, now) {
                summary.entries += 1;
                summary.intents += 1;
            }
        }

        self.flush_events();
        self.archive();
        self.publish(now).await;

        debug!(?summary, "Tick complete");
        summary
    }

    /// Wait for every in-flight intent and fold in the results.
    pub async fn settle(&mut self) {
        let now = self.clock.now();
        while let Some(joined) = self.in_flight.join_next().await {
            match joined {
                Ok(report) => self.apply_report(report, now),
                Err(e) => {
                    error!(error = %e, "Execution task failed");
                    self.record_error(None, format!("execution task failed: {e}"), now);
                }
            }
        }
        self.flush_events();
        self.archive();
        self.publish(now).await;
    }

    fn drain_reports(&mut self, now: DateTime<Utc>) {
        while let Some(joined) = self.in_flight.try_join_next() {
            match joined {
                Ok(report) => self.apply_report(report, now),
                Err(e) => {
                    error!(error = %e, "Execution task failed");
                    self.record_error(None, format!("execution task failed: {e}"), now);
                }
            }
        }
    }

    fn apply_report(&mut self, report: ExecutionReport, now: DateTime<Utc>) {
        let ExecutionReport {
            intent,
            result,
            recovered,
        } = report;
        let pair = intent.pair().to_string();

        if let Err(err) = &result {
            let action = match intent {
                ExecutionIntent::Open(_) => "open",
                ExecutionIntent::Close(_) => "close",
            };
            self.record_error(Some(&pair), format!("{action} failed: {err}"), now);
        }

        let Some(machine) = self.machines.get_mut(&pair) else {
            warn!(%pair, intent = %intent.id(), "Execution report for an archived position");
            return;
        };
        let applied = match &intent {
            ExecutionIntent::Open(open) => machine
                .on_open_result(open.id, result, now)
                .and_then(|()| match recovered {
                    Some(fill) => machine.adopt_open_fill(open.id, fill, now),
                    None => Ok(()),
                }),
            ExecutionIntent::Close(close) => machine.on_close_result(close.id, result, now),
        };
        if let Err(e) = applied {
            self.record_error(Some(&pair), e.to_string(), now);
        }
    }

    async fn fetch_snapshots(
        &mut self,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> BTreeMap<String, MarketSnapshot> {
        let timeout = self.config.fetch_timeout;
        let feed = &self.feed;
        let fetches = self.config.pairs.iter().map(|pair| async move {
            let fetched = tokio::time::timeout(timeout, feed.get_snapshot(pair)).await;
            let result =
                fetched.unwrap_or_else(|_| Err(DataError::Timeout { pair: pair.clone() }));
            (pair.clone(), result)
        });
        let results = join_all(fetches).await;

        let mut snapshots = BTreeMap::new();
        for (pair, result) in results {
            let checked = result.and_then(|snapshot| {
                let age = now - snapshot.timestamp;
                if age > self.config.max_snapshot_age {
                    Err(DataError::Stale {
                        pair: pair.clone(),
                        age_secs: age.num_seconds(),
                    })
                } else {
                    Ok(snapshot)
                }
            });

            match checked {
                Ok(snapshot) => {
                    if self.failing_pairs.remove(&pair) {
                        info!(%pair, "Market data recovered");
                    }
                    snapshots.insert(pair, snapshot);
                }
                Err(err) => {
                    summary.data_errors += 1;
                    self.record_error(Some(&pair), err.to_string(), now);
                    if self.failing_pairs.insert(pair.clone()) {
                        let alert = RiskAlert::new(
                            RiskAlertType::DataFailure {
                                pair: pair.clone(),
                                error: err.to_string(),
                            },
                            AlertSeverity::Warning,
                            Some(pair.clone()),
                            format!("Market data for {pair} unusable: {err}"),
                            now,
                        );
                        self.raise(alert);
                    }
                }
            }
        }

        summary.snapshots = snapshots.len();
        snapshots
    }

    /// Record the observation and score the pair. Returns a triggering signal.
    fn ingest(&mut self, snapshot: &MarketSnapshot) -> Option<Signal> {
        let window = self.config.history_window;
        let history = self
            .histories
            .entry(snapshot.pair.clone())
            .or_insert_with(|| FundingHistory::new(window));

        let observation = FundingObservation::from(snapshot);
        match history.push(observation.clone()) {
            AppendOutcome::Appended => {
                self.audit.record(AuditRecord::Observation { observation });
            }
            AppendOutcome::Dropped(reason) => {
                debug!(pair = %snapshot.pair, ?reason, "Observation dropped");
                self.audit.record(AuditRecord::ObservationDropped {
                    pair: snapshot.pair.clone(),
                    timestamp: snapshot.timestamp,
                    reason,
                });
                return None;
            }
        }

        let drop = self
            .detector
            .funding_drop(history, self.config.funding_drop_alert_pct);
        let evaluation = self.detector.evaluate(history);

        if let Some((previous, current)) = drop {
            let alert = RiskAlert::new(
                RiskAlertType::FundingDrop {
                    pair: snapshot.pair.clone(),
                    previous,
                    current,
                },
                AlertSeverity::Info,
                Some(snapshot.pair.clone()),
                format!("{} funding fell from {previous} to {current}", snapshot.pair),
                snapshot.timestamp,
            );
            self.raise(alert);
        }

        match evaluation {
            Evaluation::InsufficientHistory { have, need } => {
                debug!(pair = %snapshot.pair, have, need, "Warming up history");
                None
            }
            Evaluation::Ready(signal) if signal.is_triggering() => {
                info!(
                    pair = %signal.pair,
                    direction = ?signal.direction,
                    rate = %signal.raw_rate,
                    zscore = %signal.zscore.round_dp(2),
                    annualized = %signal.annualized_rate.round_dp(4),
                    "📈 Funding anomaly"
                );
                self.audit.record(AuditRecord::SignalFired {
                    signal: signal.clone(),
                });
                Some(signal)
            }
            Evaluation::Ready(_) => None,
        }
    }

    /// Fold this tick's equity into the risk gate. Returns true when the
    /// circuit breaker tripped on this tick.
    async fn update_risk(&mut self, now: DateTime<Utc>) -> bool {
        let fetched = tokio::time::timeout(self.config.fetch_timeout, self.account.equity()).await;
        let equity = match fetched {
            Ok(Ok(equity)) => equity,
            Ok(Err(e)) => {
                self.record_error(None, format!("equity unavailable: {e:#}"), now);
                return false;
            }
            Err(_) => {
                self.record_error(None, "equity fetch timed out".to_string(), now);
                return false;
            }
        };

        let tick = self.risk.record_tick(EquitySample { equity, at: now });
        for alert in tick.alerts {
            self.raise(alert);
        }
        if let Some(reason) = &tick.tripped {
            self.record_risk_change(format!("circuit breaker tripped: {reason}"), now);
        }
        if tick.daily_reset {
            self.record_risk_change("daily counters reset", now);
        }

        let state = self.risk.snapshot();
        self.audit.record(AuditRecord::EquitySnapshot {
            at: now,
            equity,
            drawdown: state.drawdown,
            total_exposure: state.total_exposure,
            open_positions: self.machines.len(),
        });

        tick.tripped.is_some()
    }

    /// Advance every live machine. Returns the number of intents dispatched.
    fn advance_machines(
        &mut self,
        snapshots: &BTreeMap<String, MarketSnapshot>,
        now: DateTime<Utc>,
    ) -> usize {
        let force_unwind = self.risk.is_circuit_broken();
        let mut intents = Vec::new();

        for (pair, machine) in self.machines.iter_mut() {
            let risk = match (machine.state(), machine.position()) {
                (PositionState::Open | PositionState::Opening { .. }, Some(position)) => {
                    self.risk.can_continue(position)
                }
                _ => RiskDecision::Allow,
            };

            let input = AdvanceInput {
                now,
                funding_rate: snapshots.get(pair).map(|s| s.funding_rate),
                risk,
                force_unwind,
            };
            if let Some(intent) = machine.advance(&input) {
                intents.push(intent);
            }
        }

        let count = intents.len();
        for intent in intents {
            self.dispatch(intent);
        }
        count
    }

    /// Try to open a position for a triggering signal. Returns true when an
    /// open intent was dispatched.
    fn try_enter(&mut self, signal: &Signal, now: DateTime<Utc>) -> bool {
        let pair = signal.pair.as_str();

        if let Some(machine) = self.machines.get(pair) {
            // One position per pair; in-flight states ignore new signals
            debug!(%pair, state = machine.state().name(), "Signal ignored, position active");
            return false;
        }
        if !self.control.is_running() {
            self.skip(pair, "entries paused".to_string(), now);
            return false;
        }

        let net_yield = signal.net_annual_yield(self.config.taker_fee_pct, self.config.slippage_pct);
        if net_yield <= Decimal::ZERO {
            self.skip(pair, format!("net annual yield {net_yield} after costs"), now);
            return false;
        }

        let capital = (self.config.capital_per_pair_pct * self.risk.current_equity())
            .round_dp_with_strategy(2, RoundingStrategy::ToZero);
        if capital < self.config.min_trade_size_usdt {
            self.skip(
                pair,
                format!(
                    "size {capital} below minimum trade size {}",
                    self.config.min_trade_size_usdt
                ),
                now,
            );
            return false;
        }

        if let RiskDecision::Deny(reason) = self.risk.can_open(capital, pair) {
            info!(%pair, %capital, %reason, "Entry denied by risk gate");
            self.skip(pair, reason.to_string(), now);
            return false;
        }

        let mut machine = PositionStateMachine::new(pair, self.position_config.clone());
        let intent = match machine.begin_open(signal, capital, now) {
            Ok(intent) => intent,
            Err(e) => {
                self.record_error(Some(pair), e.to_string(), now);
                return false;
            }
        };

        self.risk.commit_allocation(pair, capital);
        self.machines.insert(pair.to_string(), machine);
        self.dispatch(intent);
        true
    }

    fn dispatch(&mut self, intent: ExecutionIntent) {
        let executor = Arc::clone(&self.executor);
        let timeout = self.config.order_timeout;
        debug!(pair = intent.pair(), intent = %intent.id(), "Dispatching intent");

        self.in_flight.spawn(async move {
            let outcome = tokio::time::timeout(timeout, execute(executor.as_ref(), &intent)).await;
            let result = outcome.unwrap_or(Err(ExecutionError::Timeout));
            let recovered = match (&intent, &result) {
                (ExecutionIntent::Open(open), Err(ExecutionError::Timeout)) => {
                    recover_open(executor.as_ref(), open.id, timeout).await
                }
                _ => None,
            };
            ExecutionReport {
                intent,
                result,
                recovered,
            }
        });
    }

    fn flush_events(&mut self) {
        for machine in self.machines.values_mut() {
            for event in machine.take_events() {
                let record = match event {
                    PositionEvent::Transition(record) => AuditRecord::Transition { record },
                    PositionEvent::FundingAccrued {
                        pair,
                        amount,
                        funding_rate,
                        cumulative,
                        at,
                    } => AuditRecord::FundingAccrued {
                        pair,
                        amount,
                        funding_rate,
                        cumulative,
                        at,
                    },
                    PositionEvent::Alert(alert) => {
                        alert.emit();
                        AuditRecord::Alert { alert }
                    }
                };
                self.audit.record(record);
            }
        }
    }

    /// Drop machines that are CLOSED, or back to IDLE after a rejected open,
    /// and free their allocations.
    fn archive(&mut self) {
        let finished: Vec<String> = self
            .machines
            .iter()
            .filter(|(_, machine)| machine.is_terminal() || machine.is_idle())
            .map(|(pair, _)| pair.clone())
            .collect();

        for pair in finished {
            let Some(machine) = self.machines.remove(&pair) else {
                continue;
            };
            let released = self.risk.release_allocation(&pair);
            let realized = machine.position().and_then(|p| p.realized_pnl);
            if let Some(pnl) = realized {
                self.realized_pnl += pnl;
            }
            info!(
                %pair,
                state = machine.state().name(),
                released = ?released,
                realized = ?realized,
                "Position archived"
            );
        }
    }

    async fn publish(&self, now: DateTime<Utc>) {
        let state = self.risk.snapshot();
        let report = StatusReport {
            running: self.control.is_running(),
            tick_count: self.tick_count,
            last_tick_at: Some(now),
            circuit_breaker_tripped: state.circuit_breaker_tripped,
            trip_reason: state.trip_reason.clone(),
            drawdown: state.drawdown,
            risk: Some(state),
            positions: self.machines.values().map(PositionStateMachine::view).collect(),
            realized_pnl: self.realized_pnl,
            last_errors: self.last_errors.clone(),
            in_flight_intents: self.in_flight.len(),
        };
        self.control.publish(report).await;
    }

    fn skip(&self, pair: &str, reason: String, now: DateTime<Utc>) {
        debug!(%pair, %reason, "Entry skipped");
        self.audit.record(AuditRecord::EntrySkipped {
            pair: pair.to_string(),
            at: now,
            reason,
        });
    }

    fn raise(&self, alert: RiskAlert) {
        alert.emit();
        self.audit.record(AuditRecord::Alert { alert });
    }

    fn record_risk_change(&self, cause: impl Into<String>, now: DateTime<Utc>) {
        self.audit.record(AuditRecord::RiskStateChange {
            cause: cause.into(),
            state: self.risk.snapshot(),
            at: now,
        });
    }

    fn record_error(&mut self, pair: Option<&str>, message: String, now: DateTime<Utc>) {
        let key = pair.unwrap_or(PORTFOLIO_KEY).to_string();
        warn!(pair = %key, %message, "Error recorded");
        self.last_errors.insert(
            key,
            PairError {
                message: message.clone(),
                at: now,
            },
        );
        self.audit.record(AuditRecord::Error {
            pair: pair.map(str::to_string),
            message,
            at: now,
        });
    }
}

async fn execute(
    executor: &dyn ExecutionAdapter,
    intent: &ExecutionIntent,
) -> Result<Fill, ExecutionError> {
    match intent {
        ExecutionIntent::Open(open) => executor.open_hedge(open).await,
        ExecutionIntent::Close(close) => executor.close_hedge(close).await,
    }
}

/// Ask the venue whether an open it never confirmed did trade.
async fn recover_open(
    executor: &dyn ExecutionAdapter,
    id: IntentId,
    timeout: Duration,
) -> Option<Fill> {
    match tokio::time::timeout(timeout, executor.lookup(id)).await {
        Ok(Ok(fill)) => fill,
        Ok(Err(e)) => {
            warn!(intent = %id, error = %e, "Open lookup failed");
            None
        }
        Err(_) => {
            warn!(intent = %id, "Open lookup timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExecFault, HedgeLegs, MockAccountSource, PaperVenue};
    use crate::persistence::MemoryAuditLog;
    use crate::utils::ManualClock;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct Harness {
        orchestrator: Orchestrator,
        venue: Arc<PaperVenue>,
        audit: Arc<MemoryAuditLog>,
        clock: ManualClock,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 30).unwrap()
    }

    fn test_config(pairs: &[&str]) -> Config {
        let mut config = Config::default();
        config.strategy.enabled_pairs = pairs.iter().map(|p| p.to_string()).collect();
        config.strategy.funding_ma_period = 3;
        config.strategy.funding_zscore_k = dec!(1);
        config.strategy.fetch_timeout_ms = 200;
        config.execution.order_timeout_secs = 2;
        config
    }

    fn harness(config: &Config, account: Option<Arc<dyn AccountSource>>) -> Harness {
        let venue = Arc::new(
            PaperVenue::new(config.capital.initial_capital).with_fill_slippage(Decimal::ZERO),
        );
        let audit = Arc::new(MemoryAuditLog::new());
        let clock = ManualClock::new(start());
        let account: Arc<dyn AccountSource> = match account {
            Some(account) => account,
            None => venue.clone(),
        };

        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                feed: venue.clone(),
                executor: venue.clone(),
                account,
                audit: audit.clone(),
                clock: Arc::new(clock.clone()),
            },
        );

        Harness {
            orchestrator,
            venue,
            audit,
            clock,
        }
    }

    fn scripted_equity(initial: Decimal) -> (Arc<dyn AccountSource>, Arc<Mutex<Decimal>>) {
        let equity = Arc::new(Mutex::new(initial));
        let source = equity.clone();
        let mut account = MockAccountSource::new();
        account
            .expect_equity()
            .returning(move || Ok(*source.lock().unwrap()));
        (Arc::new(account), equity)
    }

    impl Harness {
        async fn quote(&self, pair: &str, rate: Decimal) {
            self.venue
                .set_market(pair, rate, dec!(50000), dec!(50000), self.clock.now())
                .await;
        }

        /// Quote, tick, wait for intents, move the clock one poll interval.
        async fn step(&mut self, quotes: &[(&str, Decimal)]) -> TickSummary {
            for (pair, rate) in quotes {
                self.quote(pair, *rate).await;
            }
            let summary = self.orchestrator.tick().await;
            self.orchestrator.settle().await;
            self.clock.advance(chrono::Duration::seconds(20));
            summary
        }

        /// Three ticks ending in a funding anomaly on `pair`.
        async fn open_on(&mut self, pair: &str) {
            self.step(&[(pair, dec!(0.0001))]).await;
            self.step(&[(pair, dec!(0.00012))]).await;
            let summary = self.step(&[(pair, dec!(0.0008))]).await;
            assert_eq!(summary.entries, 1);
        }

        async fn opens(&self) -> usize {
            self.venue
                .intent_log()
                .await
                .iter()
                .filter(|i| matches!(i, ExecutionIntent::Open(_)))
                .count()
        }

        async fn closes(&self) -> Vec<crate::exchange::CloseHedge> {
            self.venue
                .intent_log()
                .await
                .into_iter()
                .filter_map(|i| match i {
                    ExecutionIntent::Close(close) => Some(close),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_anomaly_opens_hedged_position() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.open_on("BTC").await;

        let status = h.orchestrator.control().status().await;
        assert_eq!(status.positions.len(), 1);
        let view = &status.positions[0];
        assert_eq!(view.state, "OPEN");
        assert_eq!(view.perp_size, dec!(0.04));
        assert_eq!(view.spot_size, dec!(0.04));
        assert_eq!(view.capital_allocated, dec!(4000));

        let account = h.venue.account().await;
        assert_eq!(account.positions["BTC"].perp_qty, dec!(-0.04));
        assert_eq!(h.orchestrator.risk().allocation("BTC"), Some(dec!(4000)));
        assert_eq!(h.audit.of_kind("signal_fired").len(), 1);
        assert_eq!(h.audit.of_kind("observation").len(), 3);
    }

    #[tokio::test]
    async fn test_persisting_signal_does_not_open_twice() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.open_on("BTC").await;

        for _ in 0..5 {
            h.step(&[("BTC", dec!(0.0008))]).await;
        }

        assert_eq!(h.opens().await, 1);
        assert_eq!(h.orchestrator.control().status().await.positions.len(), 1);
    }

    #[tokio::test]
    async fn test_drawdown_trips_breaker_and_unwinds_within_one_tick() {
        let config = test_config(&["BTC"]);
        let (account, equity) = scripted_equity(dec!(10000));
        let mut h = harness(&config, Some(account));
        h.open_on("BTC").await;

        *equity.lock().unwrap() = dec!(8900);
        h.quote("BTC", dec!(0.0008)).await;
        let summary = h.orchestrator.tick().await;

        assert!(summary.breaker_tripped);
        let status = h.orchestrator.control().status().await;
        assert!(status.circuit_breaker_tripped);
        assert_eq!(status.drawdown, dec!(0.11));
        assert_eq!(status.positions[0].state, "CLOSING");

        h.orchestrator.settle().await;
        h.clock.advance(chrono::Duration::seconds(20));
        assert!(h.venue.account().await.positions.is_empty());

        // Equity recovers but the breaker stays latched
        *equity.lock().unwrap() = dec!(10000);
        for _ in 0..5 {
            h.step(&[("BTC", dec!(0.0008))]).await;
        }
        assert_eq!(h.opens().await, 1);
        assert!(h
            .audit
            .of_kind("entry_skipped")
            .iter()
            .any(|r| matches!(r, AuditRecord::EntrySkipped { reason, .. } if reason == "circuit breaker tripped")));

        h.orchestrator.control().request_breaker_reset();
        let summary = h.step(&[("BTC", dec!(0.0008))]).await;
        assert_eq!(summary.entries, 1);
        assert_eq!(h.opens().await, 2);
        assert!(!h.orchestrator.risk().is_circuit_broken());
    }

    #[tokio::test]
    async fn test_partial_fill_unwinds_only_filled_leg() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.venue.inject_fault("BTC", ExecFault::SpotLegRejected).await;
        h.step(&[("BTC", dec!(0.0001))]).await;
        h.step(&[("BTC", dec!(0.00012))]).await;
        h.step(&[("BTC", dec!(0.0008))]).await;

        let status = h.orchestrator.control().status().await;
        assert_eq!(status.positions[0].state, "CLOSING");
        assert!(status.last_errors["BTC"].message.contains("partial fill"));

        h.step(&[("BTC", dec!(0.0008))]).await;

        let closes = h.closes().await;
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].legs, HedgeLegs::PerpOnly);
        assert!(h.venue.account().await.positions.is_empty());
        assert!(h.orchestrator.risk().allocation("BTC").is_none());
    }

    #[tokio::test]
    async fn test_rejected_open_releases_allocation() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.venue.inject_fault("BTC", ExecFault::Reject).await;
        h.open_on("BTC").await;

        let status = h.orchestrator.control().status().await;
        assert!(status.positions.is_empty());
        assert!(h.orchestrator.risk().allocation("BTC").is_none());
        assert!(status.last_errors["BTC"].message.contains("rejected"));
    }

    #[tokio::test]
    async fn test_pair_failures_are_isolated() {
        let mut config = test_config(&["BTC", "ETH", "SOL", "XRP"]);
        config.strategy.max_snapshot_age_secs = 60;
        let mut h = harness(&config, None);

        h.venue
            .inject_feed_failure(
                "BTC",
                DataError::Unavailable {
                    pair: "BTC".into(),
                    reason: "maintenance".into(),
                },
            )
            .await;
        h.quote("ETH", dec!(0.0001)).await;
        h.venue.set_feed_delay("ETH", Duration::from_millis(500)).await;
        h.venue
            .set_market(
                "SOL",
                dec!(0.0001),
                dec!(150),
                dec!(150),
                h.clock.now() - chrono::Duration::seconds(120),
            )
            .await;
        h.quote("XRP", dec!(0.0001)).await;

        let summary = h.orchestrator.tick().await;

        assert_eq!(summary.snapshots, 1);
        assert_eq!(summary.data_errors, 3);

        let status = h.orchestrator.control().status().await;
        assert!(status.last_errors["BTC"].message.contains("unavailable"));
        assert!(status.last_errors["ETH"].message.contains("timed out"));
        assert!(status.last_errors["SOL"].message.contains("stale"));
        assert!(!status.last_errors.contains_key("XRP"));

        let observed: Vec<_> = h
            .audit
            .of_kind("observation")
            .iter()
            .filter_map(|r| r.pair().map(str::to_string))
            .collect();
        assert_eq!(observed, vec!["XRP"]);
        assert_eq!(h.audit.of_kind("alert").len(), 3);
    }

    #[tokio::test]
    async fn test_stop_blocks_entries_but_keeps_managing_positions() {
        let mut h = harness(&test_config(&["BTC", "ETH"]), None);
        h.step(&[("BTC", dec!(0.0001)), ("ETH", dec!(0.0001))]).await;
        h.step(&[("BTC", dec!(0.00012)), ("ETH", dec!(0.00012))]).await;
        h.step(&[("BTC", dec!(0.0008)), ("ETH", dec!(0.00011))]).await;
        assert_eq!(h.opens().await, 1);

        let control = h.orchestrator.control();
        control.stop();

        // ETH spikes while stopped
        h.step(&[("BTC", dec!(0.0008)), ("ETH", dec!(0.0009))]).await;
        assert_eq!(h.opens().await, 1);
        assert!(h
            .audit
            .of_kind("entry_skipped")
            .iter()
            .any(|r| matches!(r, AuditRecord::EntrySkipped { pair, reason, .. } if pair == "ETH" && reason == "entries paused")));

        // BTC funding fades and the open position is still closed
        h.step(&[("BTC", dec!(0.00001)), ("ETH", dec!(0.0009))]).await;
        assert_eq!(h.closes().await.len(), 1);

        let status = control.status().await;
        assert!(!status.running);
        assert!(status.positions.is_empty());
    }

    #[tokio::test]
    async fn test_close_after_lost_confirmation_is_not_repeated() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.open_on("BTC").await;

        h.venue.inject_fault("BTC", ExecFault::ConfirmationLost).await;
        h.step(&[("BTC", dec!(0.00001))]).await;

        let status = h.orchestrator.control().status().await;
        assert_eq!(status.positions[0].state, "CLOSING");
        assert_eq!(status.positions[0].close_attempts, 1);

        // Retry reuses the intent id; the venue answers from its record
        h.step(&[("BTC", dec!(0.00001))]).await;

        let closes = h.closes().await;
        assert_eq!(closes.len(), 2);
        assert_eq!(closes[0].id, closes[1].id);
        let account = h.venue.account().await;
        assert_eq!(account.order_count, 4);
        assert!(account.positions.is_empty());
        assert!(h.orchestrator.control().status().await.positions.is_empty());
    }

    #[tokio::test]
    async fn test_lost_open_confirmation_books_recovered_fill() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.venue.inject_fault("BTC", ExecFault::ConfirmationLost).await;
        h.open_on("BTC").await;

        let status = h.orchestrator.control().status().await;
        assert_eq!(status.positions[0].state, "CLOSING");
        assert_eq!(status.positions[0].perp_size, dec!(0.04));

        h.step(&[("BTC", dec!(0.00001))]).await;

        // Open and close each cost 2 legs * 2000 * 0.0004
        let status = h.orchestrator.control().status().await;
        assert!(status.positions.is_empty());
        assert_eq!(status.realized_pnl, dec!(-3.2));
        assert!(h.venue.account().await.positions.is_empty());
        assert_eq!(
            h.venue.equity().await.unwrap(),
            dec!(10000) + status.realized_pnl
        );
    }

    #[tokio::test]
    async fn test_first_equity_below_configured_capital_does_not_trip() {
        let config = test_config(&["BTC"]);
        assert_eq!(config.capital.initial_capital, dec!(10000));
        let (account, _equity) = scripted_equity(dec!(8900));
        let mut h = harness(&config, Some(account));

        h.open_on("BTC").await;

        let status = h.orchestrator.control().status().await;
        assert!(!status.circuit_breaker_tripped);
        assert_eq!(status.drawdown, Decimal::ZERO);
        assert_eq!(status.positions[0].state, "OPEN");
        let risk = status.risk.unwrap();
        assert_eq!(risk.equity_high_watermark, dec!(8900));
    }

    #[tokio::test]
    async fn test_equity_failure_keeps_risk_state() {
        let mut account = MockAccountSource::new();
        account
            .expect_equity()
            .returning(|| Err(anyhow::anyhow!("account endpoint down")));
        let mut h = harness(&test_config(&["BTC"]), Some(Arc::new(account)));

        h.step(&[("BTC", dec!(0.0001))]).await;

        let status = h.orchestrator.control().status().await;
        let error = &status.last_errors[PORTFOLIO_KEY];
        assert!(error.message.contains("account endpoint down"));
        assert_eq!(h.orchestrator.risk().current_equity(), dec!(10000));
        assert_eq!(h.audit.of_kind("observation").len(), 1);
    }

    #[tokio::test]
    async fn test_best_annualized_rate_enters_first() {
        let mut config = test_config(&["BTC", "ETH"]);
        config.capital.capital_per_pair_pct = dec!(0.6);
        let mut h = harness(&config, None);

        h.step(&[("BTC", dec!(0.0001)), ("ETH", dec!(0.0001))]).await;
        h.step(&[("BTC", dec!(0.00012)), ("ETH", dec!(0.00012))]).await;
        let summary = h.step(&[("BTC", dec!(0.0008)), ("ETH", dec!(0.0015))]).await;

        assert_eq!(summary.signals, 2);
        assert_eq!(summary.entries, 1);
        let opened: Vec<_> = h
            .venue
            .intent_log()
            .await
            .iter()
            .map(|i| i.pair().to_string())
            .collect();
        assert_eq!(opened, vec!["ETH"]);
        assert!(h
            .audit
            .of_kind("entry_skipped")
            .iter()
            .any(|r| r.pair() == Some("BTC")));
    }

    #[tokio::test]
    async fn test_small_allocation_is_skipped() {
        let mut config = test_config(&["BTC"]);
        config.capital.initial_capital = dec!(100);
        let mut h = harness(&config, None);

        h.step(&[("BTC", dec!(0.0001))]).await;
        h.step(&[("BTC", dec!(0.00012))]).await;
        let summary = h.step(&[("BTC", dec!(0.0008))]).await;

        assert_eq!(summary.signals, 1);
        assert_eq!(summary.entries, 0);
        assert_eq!(h.opens().await, 0);
    }

    #[tokio::test]
    async fn test_unprofitable_signal_is_skipped() {
        let mut config = test_config(&["BTC"]);
        config.execution.taker_fee_pct = dec!(5);
        let mut h = harness(&config, None);

        h.step(&[("BTC", dec!(0.0001))]).await;
        h.step(&[("BTC", dec!(0.00012))]).await;
        h.step(&[("BTC", dec!(0.0008))]).await;

        assert_eq!(h.opens().await, 0);
        assert_eq!(h.audit.of_kind("entry_skipped").len(), 1);
    }

    #[tokio::test]
    async fn test_sharp_funding_drop_raises_alert() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.step(&[("BTC", dec!(0.001))]).await;
        h.step(&[("BTC", dec!(0.0004))]).await;

        assert!(h.audit.of_kind("alert").iter().any(|r| matches!(
            r,
            AuditRecord::Alert { alert } if matches!(alert.alert_type, RiskAlertType::FundingDrop { .. })
        )));
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_is_dropped_and_audited() {
        let mut h = harness(&test_config(&["BTC"]), None);
        h.quote("BTC", dec!(0.0001)).await;
        h.orchestrator.tick().await;
        // Feed did not move on
        h.orchestrator.tick().await;

        assert_eq!(h.audit.of_kind("observation").len(), 1);
        assert_eq!(h.audit.of_kind("observation_dropped").len(), 1);
    }
}
