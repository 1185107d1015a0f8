//! Complete-set maker for short-window binary prediction markets.
//!
//! The bot bids on both outcome tokens of a market at prices that sum to less
//! than $1.00, holds the matched pair to resolution, and redeems the winning
//! token at face value:
//!
//! ```text
//! YES bid:  $0.45 × 10
//! NO bid:   $0.45 × 10
//! ─────────────────────
//! Cost:     $9.00
//! Payout:  $10.00 (one side always wins)
//! P&L:      $1.00
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`exchange`]: Exchange interfaces and the in-memory paper exchange
//! - [`market`]: Market types and the catalog adapter
//! - [`trading`]: Order ledger and position state machine
//! - [`redemption`]: Resolution polling and redemption
//! - [`risk`]: Exposure, daily loss and loss streak limits
//! - [`engine`]: The control loop
//! - [`api`]: HTTP API for health/status/metrics
//! - [`journal`]: Trade journal
//! - [`metrics`]: Prometheus metrics
//! - [`utils`]: Retry and shutdown helpers

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod journal;
pub mod market;
pub mod metrics;
pub mod redemption;
pub mod risk;
pub mod trading;
pub mod utils;

pub use config::Config;
pub use engine::{Collaborators, Engine};
pub use error::{BotError, Result};
