//! Venue-agnostic market and execution types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Point-in-time market state for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub pair: String,
    /// Signed funding rate per interval (positive: longs pay shorts)
    pub funding_rate: Decimal,
    pub mark_price: Decimal,
    pub spot_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Side of the perpetual leg. The spot leg always takes the opposite side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PerpSide {
    Long,
    Short,
}

impl PerpSide {
    /// Sign of the perp quantity: +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            PerpSide::Long => Decimal::ONE,
            PerpSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Funding rate as seen by the holder of this side. Positive means income.
    pub fn collected_rate(&self, funding_rate: Decimal) -> Decimal {
        -self.sign() * funding_rate
    }
}

impl fmt::Display for PerpSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerpSide::Long => write!(f, "LONG"),
            PerpSide::Short => write!(f, "SHORT"),
        }
    }
}

/// One leg of the hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeLeg {
    Perp,
    Spot,
}

impl HedgeLeg {
    pub fn other(&self) -> HedgeLeg {
        match self {
            HedgeLeg::Perp => HedgeLeg::Spot,
            HedgeLeg::Spot => HedgeLeg::Perp,
        }
    }
}

impl fmt::Display for HedgeLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HedgeLeg::Perp => write!(f, "perp"),
            HedgeLeg::Spot => write!(f, "spot"),
        }
    }
}

/// Which legs a close intent targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeLegs {
    Both,
    PerpOnly,
    SpotOnly,
}

impl HedgeLegs {
    pub fn only(leg: HedgeLeg) -> Self {
        match leg {
            HedgeLeg::Perp => HedgeLegs::PerpOnly,
            HedgeLeg::Spot => HedgeLegs::SpotOnly,
        }
    }

    pub fn includes(&self, leg: HedgeLeg) -> bool {
        matches!(
            (self, leg),
            (HedgeLegs::Both, _)
                | (HedgeLegs::PerpOnly, HedgeLeg::Perp)
                | (HedgeLegs::SpotOnly, HedgeLeg::Spot)
        )
    }

    /// Legs still to close after `closed` went through, if any.
    pub fn without(&self, closed: HedgeLeg) -> Option<HedgeLegs> {
        match self {
            HedgeLegs::Both => Some(HedgeLegs::only(closed.other())),
            single if single.includes(closed) => None,
            single => Some(*single),
        }
    }
}

/// Correlation id carried by every intent. Retries reuse the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentId(Uuid);

impl IntentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Open both legs: perp on `perp_side`, spot on the opposite side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenHedge {
    pub id: IntentId,
    pub pair: String,
    pub perp_side: PerpSide,
    /// Notional per leg in USDT
    pub notional: Decimal,
}

/// Close the named legs of an existing hedge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseHedge {
    pub id: IntentId,
    pub pair: String,
    pub legs: HedgeLegs,
}

/// Instruction emitted by a position state machine for the execution venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionIntent {
    Open(OpenHedge),
    Close(CloseHedge),
}

impl ExecutionIntent {
    pub fn id(&self) -> IntentId {
        match self {
            ExecutionIntent::Open(open) => open.id,
            ExecutionIntent::Close(close) => close.id,
        }
    }

    pub fn pair(&self) -> &str {
        match self {
            ExecutionIntent::Open(open) => &open.pair,
            ExecutionIntent::Close(close) => &close.pair,
        }
    }
}

/// Confirmed execution of both legs. Quantities are unsigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub perp_price: Decimal,
    pub spot_price: Decimal,
    pub perp_qty: Decimal,
    pub spot_qty: Decimal,
    /// Fees paid across both legs, in USDT
    pub fees: Decimal,
}

impl Fill {
    pub fn perp_notional(&self) -> Decimal {
        self.perp_qty * self.perp_price
    }

    pub fn spot_notional(&self) -> Decimal {
        self.spot_qty * self.spot_price
    }
}

/// Execution of a single leg, reported with a partial fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFill {
    pub leg: HedgeLeg,
    pub price: Decimal,
    pub qty: Decimal,
}
