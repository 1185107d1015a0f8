//! Resolution-timed redemption of complete sets.

mod scheduler;

pub use scheduler::{
    AttemptResult, RedemptionAttempt, RedemptionScheduler, SchedulerSettings, SettlementEvent,
};
