//! Collaborator interfaces the core calls into.
//!
//! Implement these to connect a real venue. The core never depends on a
//! concrete exchange; [`super::PaperVenue`] implements all three for paper
//! trading and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{CloseHedge, Fill, IntentId, MarketSnapshot, OpenHedge};
use crate::error::{DataError, ExecutionError};

/// Source of per-pair funding, mark and spot prices.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Latest snapshot for `pair`.
    async fn get_snapshot(&self, pair: &str) -> Result<MarketSnapshot, DataError>;
}

/// Places the perp + spot order pair for a hedge.
///
/// Implementations must de-duplicate by intent id: a repeated intent whose
/// first attempt succeeded returns the original fill without trading again.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn open_hedge(&self, intent: &OpenHedge) -> Result<Fill, ExecutionError>;

    async fn close_hedge(&self, intent: &CloseHedge) -> Result<Fill, ExecutionError>;

    /// Fill recorded for an intent this venue already executed, or `None`
    /// if it never traded. Reconciles intents whose confirmation was lost.
    async fn lookup(&self, id: IntentId) -> Result<Option<Fill>, ExecutionError>;
}

/// Reports aggregate account equity in USDT.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn equity(&self) -> anyhow::Result<Decimal>;
}
