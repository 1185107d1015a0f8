//! Pre-trade risk gating and settlement-driven risk state.

mod controller;

pub use controller::{
    KillReason, RejectReason, RiskController, RiskDecision, RiskLimits, RiskSnapshot, RiskState,
};
