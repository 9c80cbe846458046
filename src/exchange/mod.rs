//! Exchange collaborators.
//!
//! The core talks to a venue only through [`MarketFeed`], [`ExecutionAdapter`]
//! and [`AccountSource`]. [`PaperVenue`] is the in-memory implementation used
//! by the paper trading binary and the test suite.

pub mod paper;
mod traits;
mod types;

pub use paper::{ExecFault, PaperVenue};
pub use traits::{AccountSource, ExecutionAdapter, MarketFeed};
#[cfg(test)]
pub use traits::MockAccountSource;
pub use types::*;
