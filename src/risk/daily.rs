//! Daily loss tracking on UTC calendar days.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::utils::decimal::safe_div;

/// Equity change since the first sample of the current UTC day.
#[derive(Debug, Clone)]
pub struct DailyLossTracker {
    day: NaiveDate,
    day_start_equity: Decimal,
    daily_pnl: Decimal,
}

impl DailyLossTracker {
    pub fn new(equity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            day_start_equity: equity,
            daily_pnl: Decimal::ZERO,
        }
    }

    /// Record an equity sample. Returns true when the sample opened a new day.
    pub fn update(&mut self, equity: Decimal, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let rolled_over = today != self.day;

        if rolled_over {
            info!(
                previous_day = %self.day,
                previous_pnl = %self.daily_pnl,
                start_equity = %equity,
                "Daily risk counters reset"
            );
            self.day = today;
            self.day_start_equity = equity;
        }

        self.daily_pnl = equity - self.day_start_equity;
        rolled_over
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    /// Today's loss as a fraction of the day's starting equity; zero when up.
    pub fn loss_pct(&self) -> Decimal {
        if self.daily_pnl >= Decimal::ZERO {
            return Decimal::ZERO;
        }
        safe_div(-self.daily_pnl, self.day_start_equity)
    }

    /// Next UTC midnight.
    pub fn reset_at(&self) -> DateTime<Utc> {
        let next_day = self.day + Duration::days(1);
        next_day.and_time(chrono::NaiveTime::MIN).and_utc()
    }
}
