//! Trading strategy implementation.
//!
//! - `history` / `detector`: rolling funding history and anomaly scoring
//! - `position`: one hedged position's lifecycle
//! - `orchestrator`: the per-tick loop tying data, risk and execution together
//! - `control`: operator start/stop, breaker reset and status

mod control;
mod detector;
mod history;
mod orchestrator;
mod position;

pub use control::{ControlHandle, PairError, StatusReport, PORTFOLIO_KEY};
pub use detector::{
    evaluate, DetectorConfig, Evaluation, FundingSignalDetector, Signal, SignalDirection,
    STDDEV_FLOOR,
};
pub use history::{AppendOutcome, Baseline, DropReason, FundingHistory, FundingObservation};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorConfig, TickSummary};
pub use position::{
    AdvanceInput, CloseReason, Position, PositionConfig, PositionEvent, PositionState,
    PositionStateMachine, PositionView, TransitionRecord,
};
