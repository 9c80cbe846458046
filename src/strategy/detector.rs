//! Funding anomaly detection.
//!
//! Turns a pair's funding history into a directional entry signal. The latest
//! rate is scored against the mean and standard deviation of the samples that
//! precede it in the window.
//!
//! When that standard deviation is below [`STDDEV_FLOOR`] the history is
//! effectively flat: the z-score gate is skipped and the absolute threshold
//! alone decides. A flat history above the threshold still pays funding.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::history::FundingHistory;
use crate::exchange::PerpSide;
use crate::utils::decimal::safe_div;

/// Standard deviations below this are treated as zero.
pub const STDDEV_FLOOR: Decimal = dec!(0.000001);

const HOURS_PER_YEAR: Decimal = dec!(8760);

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Minimum |rate| to trigger (inclusive)
    pub funding_threshold: Decimal,
    /// Samples required before any signal
    pub funding_ma_period: usize,
    /// Minimum |zscore| to trigger (inclusive)
    pub funding_zscore_k: Decimal,
    pub funding_interval_hours: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            funding_threshold: dec!(0.0003),
            funding_ma_period: 24,
            funding_zscore_k: dec!(1.5),
            funding_interval_hours: 1,
        }
    }
}

impl DetectorConfig {
    pub fn intervals_per_year(&self) -> Decimal {
        safe_div(HOURS_PER_YEAR, Decimal::from(self.funding_interval_hours.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalDirection {
    None,
    /// Negative funding: longs collect, so go long perp and sell spot
    PayLongCollect,
    /// Positive funding: shorts collect, so go short perp and buy spot
    PayShortCollect,
}

impl SignalDirection {
    /// Perp side that collects funding in this direction.
    pub fn perp_side(&self) -> Option<PerpSide> {
        match self {
            SignalDirection::None => None,
            SignalDirection::PayLongCollect => Some(PerpSide::Long),
            SignalDirection::PayShortCollect => Some(PerpSide::Short),
        }
    }
}

/// Detector output for one pair at one tick. Recomputed every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub pair: String,
    pub timestamp: DateTime<Utc>,
    pub direction: SignalDirection,
    pub zscore: Decimal,
    pub raw_rate: Decimal,
    pub annualized_rate: Decimal,
    pub mean: Decimal,
    pub stddev: Decimal,
    /// False when the baseline was flat and only the absolute threshold applied
    pub zscore_gated: bool,
}

impl Signal {
    pub fn is_triggering(&self) -> bool {
        self.direction != SignalDirection::None
    }

    /// Annual funding yield net of a full round trip (enter and exit both legs).
    pub fn net_annual_yield(&self, taker_fee_pct: Decimal, slippage_pct: Decimal) -> Decimal {
        self.annualized_rate.abs() - dec!(2) * (taker_fee_pct + slippage_pct)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Evaluation {
    /// Not enough samples yet; the pair is skipped silently.
    InsufficientHistory { have: usize, need: usize },
    Ready(Signal),
}

impl Evaluation {
    pub fn signal(&self) -> Option<&Signal> {
        match self {
            Evaluation::Ready(signal) => Some(signal),
            Evaluation::InsufficientHistory { .. } => None,
        }
    }
}

/// Pure scoring of funding histories.
#[derive(Debug, Clone, Default)]
pub struct FundingSignalDetector {
    config: DetectorConfig,
}

impl FundingSignalDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn evaluate(&self, history: &FundingHistory) -> Evaluation {
        evaluate(history, &self.config)
    }

    /// Relative tick-over-tick drop of a positive funding rate, if it exceeds
    /// `drop_pct`. Returns (previous, current).
    pub fn funding_drop(
        &self,
        history: &FundingHistory,
        drop_pct: Decimal,
    ) -> Option<(Decimal, Decimal)> {
        let previous = history.previous()?.funding_rate;
        let current = history.latest()?.funding_rate;
        if previous <= Decimal::ZERO {
            return None;
        }

        let drop = (previous - current) / previous;
        (drop > drop_pct).then_some((previous, current))
    }
}

/// Score the latest observation of `history` against its window.
pub fn evaluate(history: &FundingHistory, config: &DetectorConfig) -> Evaluation {
    let need = config.funding_ma_period;
    let (Some(latest), Some(baseline)) = (history.latest(), history.baseline()) else {
        return Evaluation::InsufficientHistory {
            have: history.len(),
            need,
        };
    };
    if history.len() < need {
        return Evaluation::InsufficientHistory {
            have: history.len(),
            need,
        };
    }

    let rate = latest.funding_rate;
    let flat = baseline.stddev < STDDEV_FLOOR;
    let stddev = baseline.stddev.max(STDDEV_FLOOR);
    let zscore = if rate == baseline.mean {
        Decimal::ZERO
    } else {
        (rate - baseline.mean) / stddev
    };

    let above_threshold = rate.abs() >= config.funding_threshold;
    let direction = if !above_threshold {
        SignalDirection::None
    } else if rate > Decimal::ZERO && (flat || zscore >= config.funding_zscore_k) {
        SignalDirection::PayShortCollect
    } else if rate < Decimal::ZERO && (flat || -zscore >= config.funding_zscore_k) {
        SignalDirection::PayLongCollect
    } else {
        SignalDirection::None
    };

    Evaluation::Ready(Signal {
        pair: latest.pair.clone(),
        timestamp: latest.timestamp,
        direction,
        zscore,
        raw_rate: rate,
        annualized_rate: rate * config.intervals_per_year(),
        mean: baseline.mean,
        stddev: baseline.stddev,
        zscore_gated: !flat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::history::FundingObservation;
    use chrono::{Duration, TimeZone};

    fn history_of(rates: &[Decimal]) -> FundingHistory {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut history = FundingHistory::new(rates.len());
        for (i, rate) in rates.iter().enumerate() {
            history.push(FundingObservation {
                pair: "ETH".into(),
                timestamp: base + Duration::hours(i as i64),
                funding_rate: *rate,
                mark_price: dec!(3000),
                spot_price: dec!(3000),
            });
        }
        history
    }

    fn config(threshold: Decimal, k: Decimal, period: usize) -> DetectorConfig {
        DetectorConfig {
            funding_threshold: threshold,
            funding_ma_period: period,
            funding_zscore_k: k,
            funding_interval_hours: 1,
        }
    }

    fn ready(evaluation: Evaluation) -> Signal {
        match evaluation {
            Evaluation::Ready(signal) => signal,
            other => panic!("expected a signal, got {other:?}"),
        }
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let full = history_of(&[dec!(0.01); 10]);
        let cfg = config(dec!(0.0001), dec!(0), 10);

        for len in 0..10 {
            let mut history = FundingHistory::new(10);
            for obs in full.iter().take(len) {
                history.push(obs.clone());
            }
            assert_eq!(
                evaluate(&history, &cfg),
                Evaluation::InsufficientHistory { have: len, need: 10 }
            );
        }
    }

    #[test]
    fn test_negative_anomaly_pays_longs() {
        // Baseline mean 0, population stddev 1e-5
        let history = history_of(&[
            dec!(0.00001),
            dec!(-0.00001),
            dec!(0.00001),
            dec!(-0.00001),
            dec!(-0.000048),
        ]);
        let signal = ready(evaluate(&history, &config(dec!(0.00003), dec!(1.0), 5)));

        assert_eq!(signal.direction, SignalDirection::PayLongCollect);
        assert!((signal.zscore + dec!(4.8)).abs() < dec!(0.0001));
        assert_eq!(signal.raw_rate, dec!(-0.000048));
        assert_eq!(signal.annualized_rate, dec!(-0.42048));
        assert!(signal.zscore_gated);
        assert_eq!(signal.direction.perp_side(), Some(PerpSide::Long));
    }

    #[test]
    fn test_positive_anomaly_pays_shorts() {
        let history = history_of(&[
            dec!(0.00001),
            dec!(-0.00001),
            dec!(0.00001),
            dec!(-0.00001),
            dec!(0.00005),
        ]);
        let signal = ready(evaluate(&history, &config(dec!(0.00003), dec!(1.0), 5)));

        assert_eq!(signal.direction, SignalDirection::PayShortCollect);
        assert!(signal.zscore > dec!(4.9));
    }

    #[test]
    fn test_rate_threshold_is_inclusive() {
        let rates = [
            dec!(0.00001),
            dec!(-0.00001),
            dec!(0.00001),
            dec!(-0.00001),
            dec!(0.00003),
        ];
        let history = history_of(&rates);

        let at = ready(evaluate(&history, &config(dec!(0.00003), dec!(1.0), 5)));
        assert_eq!(at.direction, SignalDirection::PayShortCollect);

        let above = ready(evaluate(&history, &config(dec!(0.0000301), dec!(1.0), 5)));
        assert_eq!(above.direction, SignalDirection::None);
    }

    #[test]
    fn test_zscore_threshold_is_inclusive() {
        let history = history_of(&[
            dec!(0.00002),
            dec!(-0.00001),
            dec!(0.00003),
            dec!(0.00001),
            dec!(0.00009),
        ]);

        // Score with an unreachable k, then reuse the exact score as k
        let probe = ready(evaluate(&history, &config(dec!(0.00003), dec!(1000), 5)));
        assert_eq!(probe.direction, SignalDirection::None);

        let tie = ready(evaluate(&history, &config(dec!(0.00003), probe.zscore, 5)));
        assert_eq!(tie.direction, SignalDirection::PayShortCollect);

        let past = ready(evaluate(
            &history,
            &config(dec!(0.00003), probe.zscore + dec!(0.000001), 5),
        ));
        assert_eq!(past.direction, SignalDirection::None);
    }

    #[test]
    fn test_large_rate_without_anomaly_does_not_trigger() {
        let history = history_of(&[
            dec!(0.0004),
            dec!(0.0006),
            dec!(0.0004),
            dec!(0.0006),
            dec!(0.0005),
        ]);
        let signal = ready(evaluate(&history, &config(dec!(0.0003), dec!(1.5), 5)));

        assert_eq!(signal.zscore, Decimal::ZERO);
        assert_eq!(signal.direction, SignalDirection::None);
    }

    #[test]
    fn test_constant_history_below_threshold_never_triggers() {
        let history = history_of(&[dec!(0.00001); 6]);
        let signal = ready(evaluate(&history, &config(dec!(0.00003), dec!(1.0), 6)));

        assert_eq!(signal.zscore, Decimal::ZERO);
        assert_eq!(signal.stddev, Decimal::ZERO);
        assert_eq!(signal.direction, SignalDirection::None);
    }

    #[test]
    fn test_constant_history_above_threshold_uses_absolute_gate() {
        let history = history_of(&[dec!(0.00005); 6]);
        let signal = ready(evaluate(&history, &config(dec!(0.00003), dec!(1.0), 6)));

        assert_eq!(signal.zscore, Decimal::ZERO);
        assert!(!signal.zscore_gated);
        assert_eq!(signal.direction, SignalDirection::PayShortCollect);

        let negative = history_of(&[dec!(-0.00005); 6]);
        let signal = ready(evaluate(&negative, &config(dec!(0.00003), dec!(1.0), 6)));
        assert_eq!(signal.direction, SignalDirection::PayLongCollect);
    }

    #[test]
    fn test_wrong_sign_anomaly_does_not_trigger() {
        // Rate is positive and large but fell sharply relative to baseline
        let history = history_of(&[
            dec!(0.0009),
            dec!(0.0011),
            dec!(0.0009),
            dec!(0.0011),
            dec!(0.0004),
        ]);
        let signal = ready(evaluate(&history, &config(dec!(0.0003), dec!(1.0), 5)));

        assert!(signal.zscore < Decimal::ZERO);
        assert_eq!(signal.direction, SignalDirection::None);
    }

    #[test]
    fn test_funding_drop_alert() {
        let detector = FundingSignalDetector::default();
        let dropped = history_of(&[dec!(0.0004), dec!(0.001), dec!(0.0004)]);
        assert_eq!(
            detector.funding_drop(&dropped, dec!(0.5)),
            Some((dec!(0.001), dec!(0.0004)))
        );

        let mild = history_of(&[dec!(0.001), dec!(0.0006)]);
        assert_eq!(detector.funding_drop(&mild, dec!(0.5)), None);

        let negative = history_of(&[dec!(-0.001), dec!(-0.002)]);
        assert_eq!(detector.funding_drop(&negative, dec!(0.5)), None);
    }

    #[test]
    fn test_net_annual_yield_accounts_for_round_trip() {
        let history = history_of(&[dec!(0.00005); 4]);
        let signal = ready(evaluate(&history, &config(dec!(0.00003), dec!(1.0), 4)));

        // 0.00005 * 8760 = 0.438, minus 2 * (0.0006 + 0.001)
        assert_eq!(
            signal.net_annual_yield(dec!(0.0006), dec!(0.001)),
            dec!(0.4348)
        );
    }
}
