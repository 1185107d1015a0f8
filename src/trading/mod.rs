//! Trading module: orders, the order ledger and position tracking.
//!
//! This module handles:
//! - Order types and per-order fill accounting
//! - The ledger of submitted orders and their pairing per market
//! - The position state machine from first fill to redemption

pub mod ledger;
pub mod order;
pub mod position;

pub use ledger::{AppliedFill, OrderLedger, OrderPair};
pub use order::{Order, OrderId, OrderParams, OrderStatus};
pub use position::{
    Leg, PnlSummary, Position, PositionState, PositionTracker, RedemptionFailure,
    RedemptionTicket, Settlement, WindowEndUpdate,
};
