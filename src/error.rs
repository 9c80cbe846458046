//! Error taxonomy for market data, execution and risk decisions.
//!
//! Per-pair and per-position errors are contained where they happen; only
//! portfolio-level risk violations are broadcast.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::exchange::{HedgeLeg, LegFill};

/// Snapshot could not be used this tick. The pair is skipped, no state changes.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum DataError {
    #[error("snapshot for {pair} is stale ({age_secs}s old)")]
    Stale { pair: String, age_secs: i64 },
    #[error("snapshot for {pair} unavailable: {reason}")]
    Unavailable { pair: String, reason: String },
    #[error("snapshot fetch for {pair} timed out")]
    Timeout { pair: String },
}

/// Failure reported by the execution venue for an open or close intent.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ExecutionError {
    /// One leg filled, the other did not.
    #[error("partial fill: only the {} leg filled", .filled.leg)]
    PartialFill { filled: LegFill },
    /// One leg closed, the other is still open.
    #[error("partial close: only the {closed} leg closed")]
    PartialClose { closed: HedgeLeg },
    /// Nothing was executed.
    #[error("order rejected: {0}")]
    Rejected(String),
    /// No confirmation within the order timeout; the venue state is unknown.
    #[error("execution timed out")]
    Timeout,
}

/// Why the risk gate refused an entry or a continuation.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    #[error("circuit breaker tripped")]
    CircuitBreakerTripped,
    #[error("drawdown {drawdown} exceeds limit {limit}")]
    MaxDrawdown { drawdown: Decimal, limit: Decimal },
    #[error("daily loss {loss_pct} exceeds limit {limit}")]
    DailyLoss { loss_pct: Decimal, limit: Decimal },
    #[error("{pair} allocation {proposed} exceeds per-pair cap {cap}")]
    PairConcentration {
        pair: String,
        proposed: Decimal,
        cap: Decimal,
    },
    #[error("total exposure {total} would exceed cap {cap}")]
    AggregateConcentration { total: Decimal, cap: Decimal },
    #[error("{pair} already holds an allocation")]
    PairAlreadyAllocated { pair: String },
    #[error("proposed capital {proposed} must be positive")]
    InvalidCapital { proposed: Decimal },
    #[error("no equity sample observed yet")]
    EquityUnknown,
}

/// A state-machine method was called from a state that does not accept it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("{pair}: cannot {action} while {state}")]
    IllegalState {
        pair: String,
        action: &'static str,
        state: &'static str,
    },
    #[error("{pair}: report for unknown intent {intent}")]
    UnknownIntent { pair: String, intent: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_messages_name_the_failing_leg() {
        let err = ExecutionError::PartialFill {
            filled: LegFill {
                leg: HedgeLeg::Perp,
                price: dec!(100),
                qty: dec!(1),
            },
        };
        assert_eq!(err.to_string(), "partial fill: only the perp leg filled");

        let err = ExecutionError::PartialClose {
            closed: HedgeLeg::Spot,
        };
        assert_eq!(err.to_string(), "partial close: only the spot leg closed");
    }

    #[test]
    fn test_deny_reason_serializes_with_tag() {
        let json = serde_json::to_string(&DenyReason::CircuitBreakerTripped).unwrap();
        assert_eq!(json, r#"{"reason":"circuit_breaker_tripped"}"#);
    }
}
