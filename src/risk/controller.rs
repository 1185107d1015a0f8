//! Risk controller: exposure cap, daily loss, loss streak sizing, kill switch.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use strum::Display;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{error, info, warn};

/// Risk limits, all from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskLimits {
    /// Maximum cost basis plus reserved notional across open sets.
    pub max_exposure: Decimal,
    /// Realized loss for the day beyond which trading stops.
    pub max_daily_loss: Decimal,
    /// Maximum non-terminal sets.
    pub max_open_sets: usize,
    /// Consecutive losing settlements before sizing is reduced.
    pub loss_streak_threshold: u32,
    /// Multiplier applied once the streak threshold is reached.
    pub size_reduction_factor: Decimal,
    /// Consecutive failed redemption calls before the kill switch trips.
    pub max_redemption_failures: u32,
    /// Offset of the exchange's reference timezone, for day rollover.
    pub utc_offset: UtcOffset,
}

/// Why new orders are blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KillReason {
    /// Operator request.
    Manual,
    /// Daily loss cap breached. Cleared at day rollover.
    DailyLoss,
    /// Repeated redemption failures; the account may be blacklisted.
    SuspectedBlacklist,
}

/// Why a proposal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Kill switch active.
    KillSwitch {
        /// What tripped it.
        cause: KillReason,
    },
    /// Today's realized loss exceeds the cap.
    DailyLoss {
        /// Realized P&L today.
        daily_pnl: Decimal,
        /// Configured cap.
        cap: Decimal,
    },
    /// Too many open sets.
    MaxOpenSets {
        /// Open sets now.
        open: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Exposure would exceed the cap.
    ExposureCap {
        /// Current exposure.
        exposure: Decimal,
        /// Proposed additional cost.
        proposed: Decimal,
        /// Configured cap.
        cap: Decimal,
    },
}

impl RejectReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::KillSwitch { .. } => "kill_switch",
            RejectReason::DailyLoss { .. } => "daily_loss",
            RejectReason::MaxOpenSets { .. } => "max_open_sets",
            RejectReason::ExposureCap { .. } => "exposure_cap",
        }
    }
}

/// Outcome of a risk check. Rejection is normal control flow, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    /// Go ahead.
    Approved,
    /// Do not place the pair.
    Rejected(RejectReason),
}

impl RiskDecision {
    /// Whether the proposal was approved.
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved)
    }
}

/// Process-wide risk state. Only the controller mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskState {
    /// Cost basis of non-terminal positions plus reserved notional.
    pub exposure: Decimal,
    /// Realized P&L for the current day.
    pub daily_pnl: Decimal,
    /// Current day in the reference timezone.
    pub day: Date,
    /// Consecutive negative settlements.
    pub loss_streak: u32,
    /// Applied to the configured position size.
    pub size_multiplier: Decimal,
    /// Consecutive failed redemption calls.
    pub consecutive_redemption_failures: u32,
    /// Active kill switch, if any.
    pub kill_switch: Option<KillReason>,
    /// Non-negative settlements this run.
    pub wins: u32,
    /// Negative settlements this run.
    pub losses: u32,
}

/// Point-in-time risk view for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskSnapshot {
    /// Open sets.
    pub open_sets: usize,
    /// Current exposure.
    pub exposure: Decimal,
    /// Exposure cap.
    pub max_exposure: Decimal,
    /// Realized P&L today.
    pub daily_pnl: Decimal,
    /// Risk day (ISO date).
    pub day: String,
    /// Consecutive losses.
    pub loss_streak: u32,
    /// Size multiplier.
    pub size_multiplier: Decimal,
    /// Consecutive redemption failures.
    pub consecutive_redemption_failures: u32,
    /// Kill switch cause, if active.
    pub kill_switch: Option<KillReason>,
    /// Whether a minimal new set would be allowed right now.
    pub can_trade: bool,
    /// Wins this run.
    pub wins: u32,
    /// Losses this run.
    pub losses: u32,
}

/// Gates new order placement and tracks settlement outcomes.
#[derive(Debug, Clone)]
pub struct RiskController {
    limits: RiskLimits,
    state: RiskState,
}

impl RiskController {
    /// Create a controller for the day containing `now`.
    pub fn new(limits: RiskLimits, now: OffsetDateTime) -> Self {
        let day = now.to_offset(limits.utc_offset).date();
        Self {
            limits,
            state: RiskState {
                exposure: Decimal::ZERO,
                daily_pnl: Decimal::ZERO,
                day,
                loss_streak: 0,
                size_multiplier: Decimal::ONE,
                consecutive_redemption_failures: 0,
                kill_switch: None,
                wins: 0,
                losses: 0,
            },
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Current state.
    pub fn state(&self) -> &RiskState {
        &self.state
    }

    /// Current size multiplier.
    pub fn size_multiplier(&self) -> Decimal {
        self.state.size_multiplier
    }

    /// Reset daily counters if `now` falls on a new day. Returns true on rollover.
    pub fn roll_day(&mut self, now: OffsetDateTime) -> bool {
        let today = now.to_offset(self.limits.utc_offset).date();
        if today <= self.state.day {
            return false;
        }

        info!(
            previous = %self.state.day,
            %today,
            daily_pnl = %self.state.daily_pnl,
            "Daily risk reset"
        );
        self.state.day = today;
        self.state.daily_pnl = Decimal::ZERO;
        self.state.loss_streak = 0;
        self.state.size_multiplier = Decimal::ONE;
        if self.state.kill_switch == Some(KillReason::DailyLoss) {
            self.state.kill_switch = None;
            info!("Daily loss kill switch cleared");
        }
        true
    }

    /// Replace the exposure figure with a fresh recomputation.
    pub fn set_exposure(&mut self, exposure: Decimal) {
        self.state.exposure = exposure;
    }

    /// Exposure cap and daily loss check for a proposed cost.
    ///
    /// The cap is inclusive: landing exactly on it is allowed.
    pub fn can_open(&self, proposed_cost: Decimal) -> bool {
        self.daily_loss_breached().is_none() && self.exposure_breach(proposed_cost).is_none()
    }

    /// Full pre-trade check, including kill switch and open-set limit.
    pub fn evaluate(&mut self, proposed_cost: Decimal, open_sets: usize, now: OffsetDateTime) -> RiskDecision {
        self.roll_day(now);

        if let Some(cause) = self.state.kill_switch {
            return RiskDecision::Rejected(RejectReason::KillSwitch { cause });
        }
        if let Some(reason) = self.daily_loss_breached() {
            return RiskDecision::Rejected(reason);
        }
        if open_sets >= self.limits.max_open_sets {
            return RiskDecision::Rejected(RejectReason::MaxOpenSets {
                open: open_sets,
                max: self.limits.max_open_sets,
            });
        }
        if let Some(reason) = self.exposure_breach(proposed_cost) {
            return RiskDecision::Rejected(reason);
        }
        RiskDecision::Approved
    }

    fn daily_loss_breached(&self) -> Option<RejectReason> {
        (-self.state.daily_pnl > self.limits.max_daily_loss).then_some(RejectReason::DailyLoss {
            daily_pnl: self.state.daily_pnl,
            cap: self.limits.max_daily_loss,
        })
    }

    fn exposure_breach(&self, proposed_cost: Decimal) -> Option<RejectReason> {
        (self.state.exposure + proposed_cost > self.limits.max_exposure).then_some(
            RejectReason::ExposureCap {
                exposure: self.state.exposure,
                proposed: proposed_cost,
                cap: self.limits.max_exposure,
            },
        )
    }

    /// Record realized P&L of a redeemed position.
    pub fn on_settled(&mut self, pnl: Decimal, now: OffsetDateTime) {
        self.roll_day(now);
        self.state.daily_pnl += pnl;
        self.state.consecutive_redemption_failures = 0;

        if pnl >= Decimal::ZERO {
            self.state.wins += 1;
            self.state.loss_streak = 0;
            if self.state.size_multiplier != Decimal::ONE {
                info!("Winning settlement, size multiplier restored");
            }
            self.state.size_multiplier = Decimal::ONE;
        } else {
            self.state.losses += 1;
            self.state.loss_streak += 1;
            if self.state.loss_streak == self.limits.loss_streak_threshold {
                self.state.size_multiplier = self.limits.size_reduction_factor;
                warn!(
                    streak = self.state.loss_streak,
                    multiplier = %self.state.size_multiplier,
                    "Loss streak threshold reached, reducing size"
                );
            }
        }

        info!(%pnl, daily_pnl = %self.state.daily_pnl, streak = self.state.loss_streak, "Settlement recorded");

        if -self.state.daily_pnl > self.limits.max_daily_loss && self.state.kill_switch.is_none() {
            self.state.kill_switch = Some(KillReason::DailyLoss);
            error!(
                alert = "daily_loss",
                daily_pnl = %self.state.daily_pnl,
                cap = %self.limits.max_daily_loss,
                "Daily loss cap breached, kill switch activated"
            );
        }
    }

    /// Record a failed redemption call.
    pub fn on_redemption_failure(&mut self) {
        self.state.consecutive_redemption_failures += 1;
        warn!(
            failures = self.state.consecutive_redemption_failures,
            max = self.limits.max_redemption_failures,
            "Redemption failure recorded"
        );
        if self.state.consecutive_redemption_failures >= self.limits.max_redemption_failures
            && self.state.kill_switch != Some(KillReason::SuspectedBlacklist)
        {
            self.state.kill_switch = Some(KillReason::SuspectedBlacklist);
            error!(
                alert = "suspected_blacklist",
                failures = self.state.consecutive_redemption_failures,
                "Consecutive redemption failures, kill switch activated; check account status"
            );
        }
    }

    /// Whether repeated redemption failures suggest the account is blocked.
    pub fn suspected_blacklist(&self) -> bool {
        self.state.consecutive_redemption_failures >= self.limits.max_redemption_failures
    }

    /// Emergency stop until reset.
    pub fn kill(&mut self, reason: KillReason) {
        self.state.kill_switch = Some(reason);
        error!(alert = "kill_switch", %reason, "Kill switch activated");
    }

    /// Clear the kill switch and the redemption failure counter.
    pub fn reset_kill_switch(&mut self) {
        self.state.kill_switch = None;
        self.state.consecutive_redemption_failures = 0;
        info!("Kill switch deactivated");
    }

    /// Position size for the next pair: base × multiplier, never below `min_size`.
    pub fn scaled_size(&self, base: Decimal, min_size: Decimal) -> Decimal {
        (base * self.state.size_multiplier)
            .round_dp_with_strategy(2, RoundingStrategy::ToZero)
            .max(min_size)
    }

    /// Status view.
    pub fn snapshot(&self, open_sets: usize, min_pair_cost: Decimal) -> RiskSnapshot {
        let can_trade = self.state.kill_switch.is_none()
            && open_sets < self.limits.max_open_sets
            && self.can_open(min_pair_cost);
        RiskSnapshot {
            open_sets,
            exposure: self.state.exposure,
            max_exposure: self.limits.max_exposure,
            daily_pnl: self.state.daily_pnl,
            day: self.state.day.to_string(),
            loss_streak: self.state.loss_streak,
            size_multiplier: self.state.size_multiplier,
            consecutive_redemption_failures: self.state.consecutive_redemption_failures,
            kill_switch: self.state.kill_switch,
            can_trade,
            wins: self.state.wins,
            losses: self.state.losses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::{datetime, offset};

    fn limits() -> RiskLimits {
        RiskLimits {
            max_exposure: dec!(100),
            max_daily_loss: dec!(50),
            max_open_sets: 3,
            loss_streak_threshold: 3,
            size_reduction_factor: dec!(0.5),
            max_redemption_failures: 3,
            utc_offset: offset!(UTC),
        }
    }

    fn now() -> OffsetDateTime {
        datetime!(2026-03-01 12:00 UTC)
    }

    #[test]
    fn exposure_cap_is_inclusive() {
        let mut risk = RiskController::new(limits(), now());
        risk.set_exposure(dec!(91));

        assert!(risk.can_open(dec!(9)));
        assert!(!risk.can_open(dec!(9.01)));
        assert_eq!(risk.evaluate(dec!(9), 0, now()), RiskDecision::Approved);
        assert!(matches!(
            risk.evaluate(dec!(9.01), 0, now()),
            RiskDecision::Rejected(RejectReason::ExposureCap { .. })
        ));
    }

    #[test]
    fn open_set_limit() {
        let mut risk = RiskController::new(limits(), now());
        let decision = risk.evaluate(dec!(1), 3, now());
        assert_eq!(
            decision,
            RiskDecision::Rejected(RejectReason::MaxOpenSets { open: 3, max: 3 })
        );
        assert_eq!(RejectReason::MaxOpenSets { open: 3, max: 3 }.label(), "max_open_sets");
    }

    #[test]
    fn streak_halves_once_and_resets() {
        let mut risk = RiskController::new(limits(), now());

        risk.on_settled(dec!(-1), now());
        risk.on_settled(dec!(-1), now());
        assert_eq!(risk.size_multiplier(), dec!(1));

        risk.on_settled(dec!(-1), now());
        assert_eq!(risk.size_multiplier(), dec!(0.5));

        // Further losses do not compound.
        risk.on_settled(dec!(-1), now());
        assert_eq!(risk.size_multiplier(), dec!(0.5));
        assert_eq!(risk.state().loss_streak, 4);
        assert_eq!(risk.scaled_size(dec!(10), dec!(5)), dec!(5));

        risk.on_settled(dec!(0), now());
        assert_eq!(risk.size_multiplier(), dec!(1));
        assert_eq!(risk.state().loss_streak, 0);
        assert_eq!(risk.scaled_size(dec!(10), dec!(5)), dec!(10));
    }

    #[test]
    fn daily_loss_trips_kill_switch_until_rollover() {
        let mut risk = RiskController::new(limits(), now());

        risk.on_settled(dec!(-50), now());
        assert!(risk.state().kill_switch.is_none());
        assert!(risk.can_open(dec!(1)));

        risk.on_settled(dec!(-0.01), now());
        assert_eq!(risk.state().kill_switch, Some(KillReason::DailyLoss));
        assert!(!risk.can_open(dec!(1)));
        assert!(matches!(
            risk.evaluate(dec!(1), 0, now()),
            RiskDecision::Rejected(RejectReason::KillSwitch {
                cause: KillReason::DailyLoss
            })
        ));

        let tomorrow = datetime!(2026-03-02 00:00 UTC);
        assert_eq!(risk.evaluate(dec!(1), 0, tomorrow), RiskDecision::Approved);
        assert_eq!(risk.state().daily_pnl, dec!(0));
        assert_eq!(risk.state().loss_streak, 0);
    }

    #[test]
    fn rollover_uses_reference_offset() {
        let mut shifted = limits();
        shifted.utc_offset = offset!(-5);
        let mut risk = RiskController::new(shifted, datetime!(2026-03-02 03:00 UTC));
        assert_eq!(risk.state().day.to_string(), "2026-03-01");

        assert!(!risk.roll_day(datetime!(2026-03-02 04:59 UTC)));
        assert!(risk.roll_day(datetime!(2026-03-02 05:00 UTC)));
    }

    #[test]
    fn redemption_failures_suggest_blacklist() {
        let mut risk = RiskController::new(limits(), now());
        risk.on_redemption_failure();
        risk.on_redemption_failure();
        risk.on_settled(dec!(1), now());
        assert_eq!(risk.state().consecutive_redemption_failures, 0);

        for _ in 0..3 {
            risk.on_redemption_failure();
        }
        assert!(risk.suspected_blacklist());
        assert_eq!(risk.state().kill_switch, Some(KillReason::SuspectedBlacklist));

        // Blacklist survives rollover, only an explicit reset clears it.
        risk.roll_day(datetime!(2026-03-05 00:00 UTC));
        assert_eq!(risk.state().kill_switch, Some(KillReason::SuspectedBlacklist));
        risk.reset_kill_switch();
        assert!(risk.snapshot(0, dec!(9)).can_trade);
    }

    #[test]
    fn manual_kill_blocks_everything() {
        let mut risk = RiskController::new(limits(), now());
        risk.kill(KillReason::Manual);
        assert!(!risk.evaluate(dec!(0), 0, now()).is_approved());
        assert!(!risk.snapshot(0, dec!(1)).can_trade);
    }
}
