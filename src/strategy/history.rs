//! Bounded per-pair funding history with O(1) running statistics.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::exchange::MarketSnapshot;
use crate::utils::decimal::sqrt_or_zero;

/// One recorded funding sample. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundingObservation {
    pub pair: String,
    pub timestamp: DateTime<Utc>,
    pub funding_rate: Decimal,
    pub mark_price: Decimal,
    pub spot_price: Decimal,
}

impl From<&MarketSnapshot> for FundingObservation {
    fn from(snapshot: &MarketSnapshot) -> Self {
        Self {
            pair: snapshot.pair.clone(),
            timestamp: snapshot.timestamp,
            funding_rate: snapshot.funding_rate,
            mark_price: snapshot.mark_price,
            spot_price: snapshot.spot_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Older than the newest recorded sample
    OutOfOrder,
    /// Same timestamp as the newest recorded sample
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Dropped(DropReason),
}

/// Mean and population standard deviation of the samples preceding the latest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub mean: Decimal,
    pub stddev: Decimal,
    pub count: usize,
}

/// Ring of the last `capacity` observations for one pair.
///
/// Observations must arrive in strictly increasing timestamp order; anything
/// else is dropped, never re-sorted, so the running sums stay valid.
#[derive(Debug, Clone)]
pub struct FundingHistory {
    capacity: usize,
    samples: VecDeque<FundingObservation>,
    sum: Decimal,
    sum_sq: Decimal,
}

impl FundingHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            sum: Decimal::ZERO,
            sum_sq: Decimal::ZERO,
        }
    }

    pub fn push(&mut self, observation: FundingObservation) -> AppendOutcome {
        if let Some(last) = self.samples.back() {
            if observation.timestamp == last.timestamp {
                return AppendOutcome::Dropped(DropReason::Duplicate);
            }
            if observation.timestamp < last.timestamp {
                return AppendOutcome::Dropped(DropReason::OutOfOrder);
            }
        }

        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted.funding_rate;
                self.sum_sq -= evicted.funding_rate * evicted.funding_rate;
            }
        }

        self.sum += observation.funding_rate;
        self.sum_sq += observation.funding_rate * observation.funding_rate;
        self.samples.push_back(observation);
        AppendOutcome::Appended
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn latest(&self) -> Option<&FundingObservation> {
        self.samples.back()
    }

    /// The sample before the latest.
    pub fn previous(&self) -> Option<&FundingObservation> {
        self.samples.len().checked_sub(2).and_then(|i| self.samples.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FundingObservation> {
        self.samples.iter()
    }

    /// Statistics of the window excluding the latest sample. Needs at least
    /// two samples.
    pub fn baseline(&self) -> Option<Baseline> {
        let latest = self.latest()?.funding_rate;
        let count = self.samples.len().checked_sub(1).filter(|n| *n > 0)?;
        let n = Decimal::from(count);

        let sum = self.sum - latest;
        let sum_sq = self.sum_sq - latest * latest;
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(Decimal::ZERO);

        Some(Baseline {
            mean,
            stddev: sqrt_or_zero(variance),
            count,
        })
    }
}
