//! Maximum drawdown tracking against the equity high-watermark.

use rust_decimal::Decimal;
use tracing::warn;

use crate::utils::decimal::safe_div;

/// Tracks the equity high-watermark and drawdown from it.
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    /// Maximum allowed drawdown (e.g., 0.10 for 10%)
    max_drawdown: Decimal,
    /// Peak equity value observed
    peak_equity: Decimal,
    /// Current drawdown from peak
    current_drawdown: Decimal,
    /// Maximum drawdown observed this session
    session_mdd: Decimal,
}

impl DrawdownTracker {
    pub fn new(max_drawdown: Decimal, initial_equity: Decimal) -> Self {
        Self {
            max_drawdown,
            peak_equity: initial_equity,
            current_drawdown: Decimal::ZERO,
            session_mdd: Decimal::ZERO,
        }
    }

    /// Update with new equity value.
    pub fn update(&mut self, equity: Decimal) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
            self.current_drawdown = Decimal::ZERO;
        } else {
            self.current_drawdown = safe_div(self.peak_equity - equity, self.peak_equity);

            if self.current_drawdown > self.session_mdd {
                self.session_mdd = self.current_drawdown;
                warn!(
                    mdd = %self.session_mdd,
                    peak = %self.peak_equity,
                    current = %equity,
                    "New maximum drawdown recorded"
                );
            }
        }
    }

    /// Strictly above the limit; sitting exactly on it is tolerated.
    pub fn is_exceeded(&self) -> bool {
        self.current_drawdown > self.max_drawdown
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    pub fn session_mdd(&self) -> Decimal {
        self.session_mdd
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_drawdown_tracking() {
        let mut tracker = DrawdownTracker::new(dec!(0.05), dec!(10000));

        // Equity goes up
        tracker.update(dec!(10500));
        assert!(!tracker.is_exceeded());
        assert_eq!(tracker.peak_equity(), dec!(10500));
        assert_eq!(tracker.current_drawdown(), Decimal::ZERO);

        // Drawdown = (10500 - 10000) / 10500 ≈ 4.76%
        tracker.update(dec!(10000));
        assert!(!tracker.is_exceeded());
        assert!(tracker.current_drawdown() > dec!(0.04));
        assert!(tracker.current_drawdown() < dec!(0.05));

        // Further drop exceeds max drawdown
        tracker.update(dec!(9900));
        assert!(tracker.is_exceeded());
        assert!(tracker.session_mdd() > dec!(0.05));
    }

    #[test]
    fn test_limit_is_exclusive() {
        let mut tracker = DrawdownTracker::new(dec!(0.10), dec!(10000));
        tracker.update(dec!(9000));
        assert!(!tracker.is_exceeded());
        assert_eq!(tracker.current_drawdown(), dec!(0.10));
        tracker.update(dec!(8999));
        assert!(tracker.is_exceeded());
    }

    #[test]
    fn test_recovery_keeps_session_mdd() {
        let mut tracker = DrawdownTracker::new(dec!(0.10), dec!(10000));
        tracker.update(dec!(9500));
        tracker.update(dec!(10200));

        assert_eq!(tracker.current_drawdown(), Decimal::ZERO);
        assert_eq!(tracker.session_mdd(), dec!(0.05));
        assert_eq!(tracker.peak_equity(), dec!(10200));
    }
}
