//! Operator control surface.
//!
//! A [`ControlHandle`] is cloned out of the orchestrator and handed to
//! whatever drives it (CLI, chat bot). It can pause new entries, request a
//! circuit breaker reset and read the last published [`StatusReport`]. It
//! never touches risk or position state directly: requests are picked up by
//! the orchestrator at the start of its next tick.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use super::position::PositionView;
use crate::error::DenyReason;
use crate::risk::PortfolioRiskState;

/// Most recent error seen for a pair (or the portfolio).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of the engine published after every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub tick_count: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub circuit_breaker_tripped: bool,
    pub trip_reason: Option<DenyReason>,
    pub drawdown: Decimal,
    pub risk: Option<PortfolioRiskState>,
    pub positions: Vec<PositionView>,
    /// Sum over archived positions
    pub realized_pnl: Decimal,
    /// Keyed by pair; portfolio-level errors use [`PORTFOLIO_KEY`]
    pub last_errors: BTreeMap<String, PairError>,
    pub in_flight_intents: usize,
}

/// Key under which errors not tied to a pair are reported.
pub const PORTFOLIO_KEY: &str = "portfolio";

/// Cloneable handle to a running orchestrator.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    running: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
    status: Arc<RwLock<StatusReport>>,
}

impl ControlHandle {
    pub fn new(running: bool) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(running)),
            reset_requested: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(StatusReport {
                running,
                ..Default::default()
            })),
        }
    }

    /// Allow new entries.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("▶️  Entries enabled");
        }
    }

    /// Stop opening new positions. Open positions are still monitored and
    /// closed as usual.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("⏸️  Entries paused, open positions remain managed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask for the circuit breaker to be cleared on the next tick.
    pub fn request_breaker_reset(&self) {
        info!("Circuit breaker reset requested");
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    pub async fn status(&self) -> StatusReport {
        self.status.read().await.clone()
    }

    pub(crate) fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) async fn publish(&self, report: StatusReport) {
        *self.status.write().await = report;
    }
}
