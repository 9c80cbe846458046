//! Portfolio risk control.
//!
//! - Drawdown from the equity high-watermark
//! - Daily loss per UTC calendar day
//! - Per-pair and aggregate concentration caps
//! - A one-way circuit breaker that forces every position to unwind

mod alerts;
mod daily;
mod gate;
mod mdd;

pub use alerts::{AlertSeverity, RiskAlert, RiskAlertType};
pub use daily::DailyLossTracker;
pub use gate::{EquitySample, PortfolioRiskState, RiskDecision, RiskGate, RiskLimits, RiskTick};
pub use mdd::DrawdownTracker;
