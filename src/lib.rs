//! # Delta Neutral Bot
//!
//! Funding rate arbitrage core: hold a short (or long) perpetual against an
//! equal spot position and collect funding while it is anomalously high.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue collaborator traits and the paper venue
//! - `strategy`: Signal detection, position lifecycle and the tick loop
//! - `risk`: Drawdown, daily loss, concentration caps and the circuit breaker
//! - `persistence`: Append-only SQLite audit log
//! - `utils`: Clock abstraction and decimal helpers

pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
