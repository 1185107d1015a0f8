//! Position tracking: the complete-set lifecycle per market.
//!
//! ```text
//! Building ──► Complete ──► AwaitingResolution ──► Resolved ──► Redeemed
//!  │   │                         ▲
//!  │   └─────────────────────────┘  (matched sets, unequal legs)
//!  └──► Abandoned (only without fills, from any non-terminal state)
//! ```
//!
//! Unequal legs that still hold matched sets when the window closes go
//! straight to AwaitingResolution; the excess leg is flagged.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use smallvec::{smallvec, SmallVec};
use strum::Display;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use super::ledger::AppliedFill;
use crate::error::PositionError;
use crate::journal::TradeJournal;
use crate::market::{MarketDescriptor, MarketId, Side};
use crate::metrics;

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PositionState {
    /// Fills accumulating, legs not yet matched.
    Building,
    /// Both legs hold the same filled size.
    Complete,
    /// Window closed, waiting for the oracle.
    AwaitingResolution,
    /// Winner known, redemption pending.
    Resolved,
    /// Winning tokens redeemed.
    Redeemed,
    /// Retired without fills.
    Abandoned,
}

impl PositionState {
    /// Check if state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Redeemed | PositionState::Abandoned)
    }

    fn can_transition_to(&self, to: PositionState) -> bool {
        use PositionState::*;
        match (self, to) {
            (Building, Complete)
            | (Building, AwaitingResolution)
            | (Complete, AwaitingResolution)
            | (AwaitingResolution, Resolved)
            | (Resolved, Redeemed) => true,
            (from, Abandoned) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Filled size and cost for one token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Leg {
    /// Number of shares owned.
    pub filled: Decimal,
    /// Sum of fill price × size.
    pub cost: Decimal,
}

impl Leg {
    /// Average entry price.
    pub fn avg_price(&self) -> Decimal {
        if self.filled.is_zero() {
            Decimal::ZERO
        } else {
            self.cost / self.filled
        }
    }
}

/// A complete set (or a leg-only remainder) in one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Position {
    /// Market identifier.
    pub market_id: MarketId,
    /// Market window close, unix seconds.
    pub window_end: i64,
    /// YES leg.
    pub yes: Leg,
    /// NO leg.
    pub no: Leg,
    /// Current state.
    pub state: PositionState,
    /// Every state the position has been in, in order.
    pub history: SmallVec<[PositionState; 6]>,
    /// Winning leg once resolved.
    pub winner: Option<Side>,
    /// Redemption payout.
    pub payout: Option<Decimal>,
    /// Realized P&L (payout − cost basis).
    pub realized_pnl: Option<Decimal>,
    /// Unmatched or single-leg exposure at window end; needs manual handling.
    pub unmatched_flag: bool,
    /// Redemption calls issued.
    pub redemption_attempts: u32,
    /// Quantity claimed by the latest redemption call.
    pub redemption_quantity: Option<Decimal>,
    /// A redemption call is outstanding.
    pub redemption_in_flight: bool,
    /// Retry cap reached; operator must intervene.
    pub redemption_exhausted: bool,
    /// Earliest time for the next redemption attempt.
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_attempt_at: Option<OffsetDateTime>,
    /// Last redemption error.
    pub last_error: Option<String>,
    /// First fill.
    #[serde(with = "time::serde::rfc3339")]
    pub opened_at: OffsetDateTime,
    /// Last mutation.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Position {
    /// Empty position in Building.
    pub fn new(market_id: MarketId, window_end: i64, now: OffsetDateTime) -> Self {
        Self {
            market_id,
            window_end,
            yes: Leg::default(),
            no: Leg::default(),
            state: PositionState::Building,
            history: smallvec![PositionState::Building],
            winner: None,
            payout: None,
            realized_pnl: None,
            unmatched_flag: false,
            redemption_attempts: 0,
            redemption_quantity: None,
            redemption_in_flight: false,
            redemption_exhausted: false,
            next_attempt_at: None,
            last_error: None,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Rebuild from holdings reported by the exchange.
    pub fn restored(
        market: &MarketDescriptor,
        yes: Leg,
        no: Leg,
        now: OffsetDateTime,
    ) -> Self {
        let mut position = Self::new(market.id.clone(), market.window_end, now);
        position.yes = yes;
        position.no = no;
        if position.is_matched() {
            position.state = PositionState::Complete;
            position.history.push(PositionState::Complete);
        }
        position
    }

    /// Get a leg.
    pub fn leg(&self, side: Side) -> &Leg {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    fn leg_mut(&mut self, side: Side) -> &mut Leg {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }

    /// `min(filled_yes, filled_no)`.
    pub fn matched_quantity(&self) -> Decimal {
        self.yes.filled.min(self.no.filled)
    }

    /// Excess on one leg beyond the matched quantity.
    pub fn unmatched_remainder(&self) -> Option<(Side, Decimal)> {
        let imbalance = self.yes.filled - self.no.filled;
        if imbalance > Decimal::ZERO {
            Some((Side::Yes, imbalance))
        } else if imbalance < Decimal::ZERO {
            Some((Side::No, -imbalance))
        } else {
            None
        }
    }

    /// Sum of fill cost on both legs.
    pub fn cost_basis(&self) -> Decimal {
        self.yes.cost + self.no.cost
    }

    /// Guaranteed profit of the matched pairs at their entry prices.
    pub fn expected_profit(&self) -> Decimal {
        let pairs = self.matched_quantity();
        pairs - (self.yes.avg_price() + self.no.avg_price()) * pairs
    }

    /// Whether any fill has been recorded.
    pub fn has_fills(&self) -> bool {
        self.yes.filled > Decimal::ZERO || self.no.filled > Decimal::ZERO
    }

    fn is_matched(&self) -> bool {
        self.yes.filled == self.no.filled && self.yes.filled > Decimal::ZERO
    }

    /// Whether the market window has closed at `now`.
    pub fn window_ended(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.window_end
    }

    fn transition(&mut self, to: PositionState, now: OffsetDateTime) -> Result<(), PositionError> {
        if !self.state.can_transition_to(to) {
            return Err(PositionError::InvalidTransition {
                market_id: self.market_id.clone(),
                from: self.state,
                to,
            });
        }
        info!(market = %self.market_id, from = %self.state, %to, "Position transition");
        self.state = to;
        self.history.push(to);
        self.updated_at = now;
        Ok(())
    }

    /// Add a fill to its leg; promotes Building to Complete once matched.
    fn apply_fill(&mut self, fill: &AppliedFill, now: OffsetDateTime) -> Result<Option<PositionState>, PositionError> {
        match self.state {
            PositionState::Redeemed => return Err(PositionError::AlreadyRedeemed(self.market_id.clone())),
            PositionState::Abandoned => {
                return Err(PositionError::InvalidTransition {
                    market_id: self.market_id.clone(),
                    from: self.state,
                    to: PositionState::Building,
                })
            }
            _ => {}
        }

        let leg = self.leg_mut(fill.side);
        leg.filled += fill.delta;
        leg.cost += fill.cost();
        self.updated_at = now;

        if self.state == PositionState::Building && self.is_matched() {
            self.transition(PositionState::Complete, now)?;
            metrics::inc_positions_completed();
            return Ok(Some(PositionState::Complete));
        }
        Ok(None)
    }
}

/// What happened to a position when its window closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEndUpdate {
    /// Matched set is now waiting for resolution.
    AwaitingResolution(MarketId),
    /// Unmatched exposure flagged for manual handling.
    Flagged {
        /// Market identifier.
        market_id: MarketId,
        /// State the position stays in.
        state: PositionState,
        /// Unmatched leg and size.
        remainder: Option<(Side, Decimal)>,
    },
}

/// Permission to issue one redemption call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionTicket {
    /// Market identifier.
    pub market_id: MarketId,
    /// Winning leg.
    pub winner: Side,
    /// Winning tokens to redeem (the matched quantity).
    pub quantity: Decimal,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Market window close, unix seconds.
    pub window_end: i64,
}

/// Result of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    /// Market identifier.
    pub market_id: MarketId,
    /// Winning leg.
    pub winner: Side,
    /// Payout at $1 per matched set.
    pub payout: Decimal,
    /// Total cost of both legs.
    pub cost_basis: Decimal,
    /// payout − cost basis.
    pub pnl: Decimal,
    /// Seconds from window end to redemption.
    pub latency_seconds: i64,
}

/// Result of a failed redemption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedemptionFailure {
    /// Attempts made so far.
    pub attempts: u32,
    /// Whether the retry cap is reached.
    pub exhausted: bool,
}

/// Aggregate P&L view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PnlSummary {
    /// Positions not yet terminal.
    pub open: usize,
    /// Waiting for the oracle.
    pub awaiting_resolution: usize,
    /// Resolved but not redeemed.
    pub resolved: usize,
    /// Redeemed.
    pub redeemed: usize,
    /// Abandoned.
    pub abandoned: usize,
    /// Flagged for manual handling.
    pub flagged: usize,
    /// Redemption retries exhausted.
    pub exhausted: usize,
    /// Cost basis of redeemed positions.
    pub redeemed_cost: Decimal,
    /// Payout of redeemed positions.
    pub total_payout: Decimal,
    /// Sum of realized P&L.
    pub realized_pnl: Decimal,
    /// Cost basis still at risk.
    pub open_cost: Decimal,
}

/// Owns every position, keyed by market.
///
/// Each mutation runs under the entry's lock, so updates to the same market
/// never interleave while different markets proceed independently.
#[derive(Default)]
pub struct PositionTracker {
    positions: DashMap<MarketId, Position>,
    journal: Option<Arc<TradeJournal>>,
}

impl PositionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write finalized positions to a journal.
    pub fn with_journal(mut self, journal: Arc<TradeJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Apply a ledger fill, creating the position on the first one.
    ///
    /// Returns the new state if the fill caused a transition.
    pub fn record_fill(
        &self,
        fill: &AppliedFill,
        now: OffsetDateTime,
    ) -> Result<Option<PositionState>, PositionError> {
        let mut entry = self
            .positions
            .entry(fill.market_id.clone())
            .or_insert_with(|| Position::new(fill.market_id.clone(), fill.window_end, now));

        // A fresh position replaces an abandoned one.
        if entry.state == PositionState::Abandoned {
            warn!(market = %fill.market_id, "Fill on abandoned position, reopening");
            *entry = Position::new(fill.market_id.clone(), fill.window_end, now);
        }

        entry.apply_fill(fill, now)
    }

    /// Advance positions whose window has closed.
    ///
    /// Complete sets, and Building positions holding at least one matched
    /// set, move to AwaitingResolution. Positions with single-leg or unequal
    /// exposure are flagged once.
    pub fn advance_window_end(&self, now: OffsetDateTime) -> Vec<WindowEndUpdate> {
        let mut updates = Vec::new();
        for mut position in self.positions.iter_mut() {
            if position.state.is_terminal() || !position.window_ended(now) {
                continue;
            }

            let holds_sets = position.matched_quantity() > Decimal::ZERO;
            let settles = match position.state {
                PositionState::Complete => true,
                PositionState::Building => holds_sets,
                _ => false,
            };
            if settles {
                let id = position.market_id.clone();
                if position.transition(PositionState::AwaitingResolution, now).is_ok() {
                    updates.push(WindowEndUpdate::AwaitingResolution(id));
                }
            }

            let remainder = position.unmatched_remainder();
            let needs_flag = (position.state == PositionState::Building && position.has_fills())
                || remainder.is_some();
            if needs_flag && !position.unmatched_flag {
                position.unmatched_flag = true;
                position.updated_at = now;
                metrics::inc_positions_flagged();
                warn!(
                    market = %position.market_id,
                    state = %position.state,
                    yes = %position.yes.filled,
                    no = %position.no.filled,
                    "Unmatched exposure at window end, flagged for manual handling"
                );
                updates.push(WindowEndUpdate::Flagged {
                    market_id: position.market_id.clone(),
                    state: position.state,
                    remainder,
                });
            }
        }
        updates
    }

    /// Markets awaiting resolution whose grace period has elapsed.
    pub fn due_for_poll(&self, now: OffsetDateTime, grace_seconds: i64) -> Vec<MarketId> {
        let now = now.unix_timestamp();
        self.collect(|p| {
            p.state == PositionState::AwaitingResolution && p.window_end + grace_seconds <= now
        })
    }

    /// Resolved markets ready for a redemption attempt.
    pub fn due_for_redemption(&self, now: OffsetDateTime) -> Vec<MarketId> {
        self.collect(|p| {
            p.state == PositionState::Resolved
                && !p.redemption_in_flight
                && !p.redemption_exhausted
                && p.next_attempt_at.map_or(true, |at| at <= now)
        })
    }

    fn collect(&self, keep: impl Fn(&Position) -> bool) -> Vec<MarketId> {
        let mut ids: Vec<MarketId> = self
            .positions
            .iter()
            .filter(|p| keep(p.value()))
            .map(|p| p.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Record the winner. Returns false for a repeated report.
    pub fn mark_resolved(
        &self,
        market_id: &MarketId,
        winner: Side,
        now: OffsetDateTime,
    ) -> Result<bool, PositionError> {
        let mut position = self.entry(market_id)?;
        match position.state {
            PositionState::Resolved | PositionState::Redeemed => Ok(false),
            _ => {
                position.transition(PositionState::Resolved, now)?;
                position.winner = Some(winner);
                Ok(true)
            }
        }
    }

    /// Single-flight gate: claim the right to issue one redemption call.
    pub fn begin_redemption(
        &self,
        market_id: &MarketId,
        now: OffsetDateTime,
    ) -> Result<RedemptionTicket, PositionError> {
        let mut position = self.entry(market_id)?;
        if position.state == PositionState::Redeemed {
            return Err(PositionError::AlreadyRedeemed(market_id.clone()));
        }
        let winner = match (position.state, position.winner) {
            (PositionState::Resolved, Some(winner)) => winner,
            (from, _) => {
                return Err(PositionError::InvalidTransition {
                    market_id: market_id.clone(),
                    from,
                    to: PositionState::Redeemed,
                })
            }
        };
        if position.redemption_in_flight {
            return Err(PositionError::RedemptionInFlight(market_id.clone()));
        }
        if position.redemption_exhausted {
            return Err(PositionError::RedemptionExhausted(market_id.clone()));
        }

        let quantity = position.matched_quantity();
        position.redemption_in_flight = true;
        position.redemption_attempts += 1;
        position.redemption_quantity = Some(quantity);
        position.updated_at = now;

        Ok(RedemptionTicket {
            market_id: market_id.clone(),
            winner,
            quantity,
            attempt: position.redemption_attempts,
            window_end: position.window_end,
        })
    }

    /// Record a successful redemption call.
    ///
    /// The payout covers the quantity claimed by `begin_redemption`; fills
    /// that arrive while the call is out stay unredeemed and are flagged.
    pub fn complete_redemption(
        &self,
        market_id: &MarketId,
        now: OffsetDateTime,
    ) -> Result<Settlement, PositionError> {
        let (settlement, snapshot) = {
            let mut position = self.entry(market_id)?;
            if !position.redemption_in_flight {
                return Err(PositionError::InvalidTransition {
                    market_id: market_id.clone(),
                    from: position.state,
                    to: PositionState::Redeemed,
                });
            }
            position.transition(PositionState::Redeemed, now)?;

            let redeemed = position
                .redemption_quantity
                .unwrap_or_else(|| position.matched_quantity());
            let late = position.matched_quantity() - redeemed;
            if late > Decimal::ZERO {
                if !position.unmatched_flag {
                    position.unmatched_flag = true;
                    metrics::inc_positions_flagged();
                }
                warn!(
                    market = %market_id,
                    redeemed = %redeemed,
                    late = %late,
                    "Sets filled after the redemption call stay unredeemed, flagged for manual handling"
                );
            }

            let payout = redeemed * Decimal::ONE;
            let cost_basis = position.cost_basis();
            let pnl = payout - cost_basis;
            position.redemption_in_flight = false;
            position.next_attempt_at = None;
            position.payout = Some(payout);
            position.realized_pnl = Some(pnl);

            let settlement = Settlement {
                market_id: market_id.clone(),
                winner: position.winner.unwrap_or(Side::Yes),
                payout,
                cost_basis,
                pnl,
                latency_seconds: now.unix_timestamp() - position.window_end,
            };
            (settlement, position.clone())
        };

        if let Some(journal) = &self.journal {
            journal.record(&snapshot);
        }
        Ok(settlement)
    }

    /// Record a failed redemption call and schedule the next attempt.
    pub fn fail_redemption(
        &self,
        market_id: &MarketId,
        reason: &str,
        retry_at: OffsetDateTime,
        max_attempts: u32,
        now: OffsetDateTime,
    ) -> Result<RedemptionFailure, PositionError> {
        let mut position = self.entry(market_id)?;
        position.redemption_in_flight = false;
        position.redemption_quantity = None;
        position.last_error = Some(reason.to_string());
        position.updated_at = now;

        let exhausted = position.redemption_attempts >= max_attempts;
        if exhausted {
            position.redemption_exhausted = true;
            position.next_attempt_at = None;
            error!(
                alert = "redemption_exhausted",
                market = %market_id,
                attempts = position.redemption_attempts,
                error = reason,
                "Redemption retries exhausted, position stays resolved"
            );
        } else {
            position.next_attempt_at = Some(retry_at);
        }

        Ok(RedemptionFailure {
            attempts: position.redemption_attempts,
            exhausted,
        })
    }

    /// Park a position whose redemption call succeeded but could not be
    /// recorded. It is held like an exhausted one until an operator looks.
    pub fn hold_unrecorded_redemption(
        &self,
        market_id: &MarketId,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<(), PositionError> {
        let mut position = self.entry(market_id)?;
        position.redemption_in_flight = false;
        position.redemption_quantity = None;
        position.redemption_exhausted = true;
        position.next_attempt_at = None;
        position.last_error = Some(format!("redeemed on exchange but unrecorded: {reason}"));
        position.updated_at = now;
        Ok(())
    }

    /// Reset an exhausted position so the scheduler retries it.
    pub fn rearm_redemption(&self, market_id: &MarketId, now: OffsetDateTime) -> Result<(), PositionError> {
        let mut position = self.entry(market_id)?;
        if position.state != PositionState::Resolved {
            return Err(PositionError::InvalidTransition {
                market_id: market_id.clone(),
                from: position.state,
                to: PositionState::Redeemed,
            });
        }
        position.redemption_exhausted = false;
        position.redemption_attempts = 0;
        position.next_attempt_at = None;
        position.updated_at = now;
        info!(market = %market_id, "Redemption re-armed");
        Ok(())
    }

    /// Retire a position that never filled.
    pub fn abandon(&self, market_id: &MarketId, now: OffsetDateTime) -> Result<(), PositionError> {
        let snapshot = {
            let mut position = self.entry(market_id)?;
            if let Some(side) = Side::BOTH
                .into_iter()
                .find(|side| position.leg(*side).filled > Decimal::ZERO)
            {
                return Err(PositionError::FundsBearing {
                    market_id: market_id.clone(),
                    side,
                });
            }
            position.transition(PositionState::Abandoned, now)?;
            position.clone()
        };

        if let Some(journal) = &self.journal {
            journal.record(&snapshot);
        }
        Ok(())
    }

    /// Retire a market whose orders were cancelled before any fill arrived.
    ///
    /// Returns false when there was nothing to retire.
    pub fn abandon_unfilled(
        &self,
        market_id: &MarketId,
        window_end: i64,
        now: OffsetDateTime,
    ) -> Result<bool, PositionError> {
        if let Some(existing) = self.get(market_id) {
            if existing.state.is_terminal() {
                return Ok(false);
            }
        } else {
            self.restore(Position::new(market_id.clone(), window_end, now));
        }
        self.abandon(market_id, now).map(|()| true)
    }

    /// Insert a position rebuilt from exchange state. Returns false if one exists.
    pub fn restore(&self, position: Position) -> bool {
        match self.positions.entry(position.market_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(position);
                true
            }
        }
    }

    fn entry(
        &self,
        market_id: &MarketId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, MarketId, Position>, PositionError> {
        self.positions
            .get_mut(market_id)
            .ok_or_else(|| PositionError::UnknownPosition(market_id.clone()))
    }

    /// Snapshot of one position.
    pub fn get(&self, market_id: &MarketId) -> Option<Position> {
        self.positions.get(market_id).map(|p| p.clone())
    }

    /// Whether a position exists for the market, terminal or not.
    pub fn contains(&self, market_id: &MarketId) -> bool {
        self.positions.contains_key(market_id)
    }

    /// Non-terminal positions, ordered by market.
    pub fn open_positions(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| !p.state.is_terminal())
            .map(|p| p.clone())
            .collect();
        open.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        open
    }

    /// Number of non-terminal positions.
    pub fn open_count(&self) -> usize {
        self.positions.iter().filter(|p| !p.state.is_terminal()).count()
    }

    /// Cost basis of non-terminal positions.
    pub fn exposure(&self) -> Decimal {
        self.positions
            .iter()
            .filter(|p| !p.state.is_terminal())
            .map(|p| p.cost_basis())
            .sum()
    }

    /// Aggregate counts and P&L.
    pub fn pnl_summary(&self) -> PnlSummary {
        let mut summary = PnlSummary::default();
        for position in self.positions.iter() {
            if position.unmatched_flag {
                summary.flagged += 1;
            }
            if position.redemption_exhausted {
                summary.exhausted += 1;
            }
            match position.state {
                PositionState::Redeemed => {
                    summary.redeemed += 1;
                    summary.redeemed_cost += position.cost_basis();
                    summary.total_payout += position.payout.unwrap_or_default();
                    summary.realized_pnl += position.realized_pnl.unwrap_or_default();
                }
                PositionState::Abandoned => summary.abandoned += 1,
                state => {
                    summary.open += 1;
                    summary.open_cost += position.cost_basis();
                    match state {
                        PositionState::AwaitingResolution => summary.awaiting_resolution += 1,
                        PositionState::Resolved => summary.resolved += 1,
                        _ => {}
                    }
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::OrderId;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    fn fill(market: &str, side: Side, delta: Decimal, price: Decimal) -> AppliedFill {
        AppliedFill {
            order_id: OrderId::new(format!("{}-{}", market, side)),
            market_id: MarketId::new(market),
            side,
            delta,
            price,
            window_end: 900,
        }
    }

    fn complete(tracker: &PositionTracker, market: &str) {
        tracker.record_fill(&fill(market, Side::Yes, dec!(10), dec!(0.45)), at(10)).unwrap();
        tracker.record_fill(&fill(market, Side::No, dec!(10), dec!(0.45)), at(11)).unwrap();
    }

    #[test]
    fn leg_calculations() {
        let leg = Leg {
            filled: dec!(10),
            cost: dec!(4.8),
        };
        assert_eq!(leg.avg_price(), dec!(0.48));
        assert_eq!(Leg::default().avg_price(), dec!(0));
    }

    #[test]
    fn complete_only_when_legs_match() {
        let tracker = PositionTracker::new();
        let id = MarketId::new("m1");

        let t = tracker.record_fill(&fill("m1", Side::Yes, dec!(5), dec!(0.45)), at(10)).unwrap();
        assert_eq!(t, None);
        let t = tracker.record_fill(&fill("m1", Side::No, dec!(3), dec!(0.45)), at(11)).unwrap();
        assert_eq!(t, None);
        assert_eq!(tracker.get(&id).unwrap().state, PositionState::Building);

        let t = tracker.record_fill(&fill("m1", Side::No, dec!(2), dec!(0.45)), at(12)).unwrap();
        assert_eq!(t, Some(PositionState::Complete));

        // Extra fills on one leg never regress a complete set.
        let t = tracker.record_fill(&fill("m1", Side::Yes, dec!(4), dec!(0.45)), at(13)).unwrap();
        assert_eq!(t, None);
        let position = tracker.get(&id).unwrap();
        assert_eq!(position.state, PositionState::Complete);
        assert_eq!(position.matched_quantity(), dec!(5));
        assert_eq!(position.unmatched_remainder(), Some((Side::Yes, dec!(4))));
    }

    #[test]
    fn window_end_moves_complete_sets_and_flags_single_legs() {
        let tracker = PositionTracker::new();
        complete(&tracker, "m1");
        tracker.record_fill(&fill("m2", Side::Yes, dec!(10), dec!(0.45)), at(10)).unwrap();

        assert!(tracker.advance_window_end(at(899)).is_empty());

        let updates = tracker.advance_window_end(at(900));
        assert_eq!(updates.len(), 2);
        assert!(updates.contains(&WindowEndUpdate::AwaitingResolution(MarketId::new("m1"))));
        assert!(updates.contains(&WindowEndUpdate::Flagged {
            market_id: MarketId::new("m2"),
            state: PositionState::Building,
            remainder: Some((Side::Yes, dec!(10))),
        }));

        // Flags are raised once.
        assert!(tracker.advance_window_end(at(901)).is_empty());
        let single = tracker.get(&MarketId::new("m2")).unwrap();
        assert!(single.unmatched_flag);
        assert_eq!(single.state, PositionState::Building);
        assert_eq!(tracker.due_for_poll(at(901), 0), vec![MarketId::new("m1")]);
        assert!(tracker.due_for_poll(at(901), 5).is_empty());
    }

    #[test]
    fn window_end_settles_matched_part_of_unequal_legs() {
        let tracker = PositionTracker::new();
        let id = MarketId::new("m1");
        tracker.record_fill(&fill("m1", Side::Yes, dec!(5), dec!(0.45)), at(10)).unwrap();
        tracker.record_fill(&fill("m1", Side::No, dec!(8), dec!(0.45)), at(11)).unwrap();
        assert_eq!(tracker.get(&id).unwrap().state, PositionState::Building);

        let updates = tracker.advance_window_end(at(900));
        assert_eq!(
            updates,
            vec![
                WindowEndUpdate::AwaitingResolution(id.clone()),
                WindowEndUpdate::Flagged {
                    market_id: id.clone(),
                    state: PositionState::AwaitingResolution,
                    remainder: Some((Side::No, dec!(3))),
                },
            ]
        );
        assert_eq!(tracker.due_for_poll(at(900), 0), vec![id.clone()]);

        tracker.mark_resolved(&id, Side::No, at(901)).unwrap();
        let ticket = tracker.begin_redemption(&id, at(901)).unwrap();
        assert_eq!(ticket.quantity, dec!(5));
        let settlement = tracker.complete_redemption(&id, at(901)).unwrap();
        assert_eq!(settlement.payout, dec!(5));
        assert_eq!(settlement.pnl, dec!(-0.85));
        assert_eq!(
            tracker.get(&id).unwrap().history.to_vec(),
            vec![
                PositionState::Building,
                PositionState::AwaitingResolution,
                PositionState::Resolved,
                PositionState::Redeemed,
            ]
        );
    }

    #[test]
    fn late_fill_during_redemption_is_not_paid_out() {
        let tracker = PositionTracker::new();
        let id = MarketId::new("m1");
        tracker.record_fill(&fill("m1", Side::Yes, dec!(5), dec!(0.45)), at(10)).unwrap();
        tracker.record_fill(&fill("m1", Side::No, dec!(5), dec!(0.45)), at(11)).unwrap();
        tracker.record_fill(&fill("m1", Side::Yes, dec!(5), dec!(0.45)), at(12)).unwrap();
        tracker.advance_window_end(at(900));
        tracker.mark_resolved(&id, Side::Yes, at(901)).unwrap();

        let ticket = tracker.begin_redemption(&id, at(901)).unwrap();
        assert_eq!(ticket.quantity, dec!(5));
        // Fill lands while the redemption call is out.
        tracker.record_fill(&fill("m1", Side::No, dec!(3), dec!(0.45)), at(902)).unwrap();

        let settlement = tracker.complete_redemption(&id, at(903)).unwrap();
        assert_eq!(settlement.payout, dec!(5));
        assert_eq!(settlement.cost_basis, dec!(8.10));
        assert_eq!(settlement.pnl, dec!(-3.10));
        let position = tracker.get(&id).unwrap();
        assert_eq!(position.payout, Some(dec!(5)));
        assert!(position.unmatched_flag);
    }

    #[test]
    fn unrecorded_redemption_is_held_for_operator() {
        let tracker = PositionTracker::new();
        let id = MarketId::new("m1");
        complete(&tracker, "m1");
        tracker.advance_window_end(at(900));
        tracker.mark_resolved(&id, Side::Yes, at(900)).unwrap();
        tracker.begin_redemption(&id, at(900)).unwrap();

        tracker.hold_unrecorded_redemption(&id, "store unavailable", at(901)).unwrap();
        let position = tracker.get(&id).unwrap();
        assert!(!position.redemption_in_flight);
        assert!(position.redemption_exhausted);
        assert_eq!(position.state, PositionState::Resolved);
        assert!(position.last_error.unwrap().contains("unrecorded"));
        assert!(tracker.due_for_redemption(at(10_000)).is_empty());
    }

    #[test]
    fn full_lifecycle_realizes_pnl() {
        let tracker = PositionTracker::new();
        let id = MarketId::new("m1");
        complete(&tracker, "m1");
        tracker.advance_window_end(at(900));

        assert!(tracker.mark_resolved(&id, Side::No, at(901)).unwrap());
        assert!(!tracker.mark_resolved(&id, Side::No, at(902)).unwrap());

        let ticket = tracker.begin_redemption(&id, at(901)).unwrap();
        assert_eq!(ticket.quantity, dec!(10));
        assert_eq!(ticket.winner, Side::No);
        assert_eq!(ticket.attempt, 1);
        assert!(matches!(
            tracker.begin_redemption(&id, at(901)),
            Err(PositionError::RedemptionInFlight(_))
        ));

        let settlement = tracker.complete_redemption(&id, at(901)).unwrap();
        assert_eq!(settlement.payout, dec!(10));
        assert_eq!(settlement.cost_basis, dec!(9.00));
        assert_eq!(settlement.pnl, dec!(1.00));
        assert_eq!(settlement.latency_seconds, 1);

        let position = tracker.get(&id).unwrap();
        assert_eq!(
            position.history.to_vec(),
            vec![
                PositionState::Building,
                PositionState::Complete,
                PositionState::AwaitingResolution,
                PositionState::Resolved,
                PositionState::Redeemed,
            ]
        );
        assert!(matches!(
            tracker.begin_redemption(&id, at(902)),
            Err(PositionError::AlreadyRedeemed(_))
        ));
        assert!(matches!(
            tracker.record_fill(&fill("m1", Side::Yes, dec!(1), dec!(0.45)), at(903)),
            Err(PositionError::AlreadyRedeemed(_))
        ));

        let summary = tracker.pnl_summary();
        assert_eq!(summary.redeemed, 1);
        assert_eq!(summary.realized_pnl, dec!(1.00));
        assert_eq!(tracker.exposure(), dec!(0));
    }

    #[test]
    fn failed_redemptions_back_off_then_exhaust() {
        let tracker = PositionTracker::new();
        let id = MarketId::new("m1");
        complete(&tracker, "m1");
        tracker.advance_window_end(at(900));
        tracker.mark_resolved(&id, Side::Yes, at(900)).unwrap();

        tracker.begin_redemption(&id, at(900)).unwrap();
        let failure = tracker.fail_redemption(&id, "rpc down", at(905), 2, at(900)).unwrap();
        assert_eq!(failure, RedemptionFailure { attempts: 1, exhausted: false });
        assert!(tracker.due_for_redemption(at(904)).is_empty());
        assert_eq!(tracker.due_for_redemption(at(905)), vec![id.clone()]);

        tracker.begin_redemption(&id, at(905)).unwrap();
        let failure = tracker.fail_redemption(&id, "rpc down", at(915), 2, at(905)).unwrap();
        assert!(failure.exhausted);
        assert!(tracker.due_for_redemption(at(10_000)).is_empty());
        assert!(matches!(
            tracker.begin_redemption(&id, at(10_000)),
            Err(PositionError::RedemptionExhausted(_))
        ));

        let position = tracker.get(&id).unwrap();
        assert_eq!(position.state, PositionState::Resolved);
        assert_eq!(tracker.pnl_summary().exhausted, 1);

        tracker.rearm_redemption(&id, at(10_000)).unwrap();
        assert_eq!(tracker.due_for_redemption(at(10_000)), vec![id]);
    }

    #[test]
    fn abandon_requires_zero_fills() {
        let tracker = PositionTracker::new();
        let empty = Position::new(MarketId::new("m0"), 900, at(0));
        assert!(tracker.restore(empty.clone()));
        assert!(!tracker.restore(empty));
        tracker.abandon(&MarketId::new("m0"), at(1)).unwrap();
        assert!(tracker.open_positions().is_empty());

        tracker.record_fill(&fill("m1", Side::No, dec!(2), dec!(0.45)), at(10)).unwrap();
        assert_eq!(
            tracker.abandon(&MarketId::new("m1"), at(11)),
            Err(PositionError::FundsBearing {
                market_id: MarketId::new("m1"),
                side: Side::No
            })
        );
        assert_eq!(tracker.exposure(), dec!(0.90));

        let unfilled = MarketId::new("m2");
        assert_eq!(tracker.abandon_unfilled(&unfilled, 900, at(12)), Ok(true));
        assert_eq!(tracker.abandon_unfilled(&unfilled, 900, at(13)), Ok(false));
        assert_eq!(tracker.pnl_summary().abandoned, 2);
    }

    #[test]
    fn restored_positions_rebuild_state() {
        let market = MarketDescriptor {
            id: MarketId::new("m1"),
            asset: "btc".to_string(),
            window_start: 0,
            window_end: 900,
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            yes_book: Default::default(),
            no_book: Default::default(),
        };
        let leg = Leg {
            filled: dec!(10),
            cost: dec!(4.5),
        };
        let matched = Position::restored(&market, leg, leg, at(0));
        assert_eq!(matched.state, PositionState::Complete);
        assert_eq!(matched.expected_profit(), dec!(1.0));

        let single = Position::restored(&market, leg, Leg::default(), at(0));
        assert_eq!(single.state, PositionState::Building);
    }
}
