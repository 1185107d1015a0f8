//! Resolution polling and single-flight redemption.
//!
//! Each pass polls every position awaiting resolution, then redeems every
//! resolved position that is due. Both phases fan out with `join_all`, so the
//! latency for one market does not grow with the number of tracked markets.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::future::join_all;
use serde::Serialize;
use strum::Display;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PositionError;
use crate::exchange::Redeemer;
use crate::market::{CatalogAdapter, MarketId, ResolutionStatus};
use crate::metrics;
use crate::trading::{PositionTracker, Settlement};
use crate::utils::backoff_delay;

/// Scheduler timing and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Cadence of polling passes.
    pub poll_interval: Duration,
    /// Seconds after window end before the first resolution poll.
    pub grace_seconds: i64,
    /// Redemption calls per position before giving up.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
    /// Warn when a market is still unresolved this long after window end.
    pub deadline_seconds: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            grace_seconds: 0,
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(8000),
            deadline_seconds: 600,
        }
    }
}

/// Result of one poll or redemption step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptResult {
    /// Resolution source still reports pending (or unusable data).
    NotYetResolved,
    /// Redemption call succeeded.
    Redeemed,
    /// Redemption call failed.
    Failed,
}

/// Bookkeeping record for one step of a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionAttempt {
    /// Market.
    pub market_id: MarketId,
    /// When the step ran.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// Outcome.
    pub result: AttemptResult,
    /// Error text for failures and data errors.
    pub detail: Option<String>,
}

impl RedemptionAttempt {
    fn new(market_id: MarketId, at: OffsetDateTime, result: AttemptResult, detail: Option<String>) -> Self {
        Self {
            market_id,
            at,
            result,
            detail,
        }
    }
}

/// Outcomes forwarded to the engine for risk accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementEvent {
    /// Position redeemed with realized P&L.
    Redeemed(Settlement),
    /// A redemption call failed.
    RedemptionFailed {
        /// Market.
        market_id: MarketId,
        /// Attempts so far.
        attempts: u32,
        /// Retry cap reached.
        exhausted: bool,
        /// Transport error text.
        reason: String,
    },
}

/// Polls resolution for ended sets and redeems them exactly once.
pub struct RedemptionScheduler {
    tracker: Arc<PositionTracker>,
    catalog: Arc<CatalogAdapter>,
    redeemer: Arc<dyn Redeemer>,
    settings: SchedulerSettings,
    events: mpsc::UnboundedSender<SettlementEvent>,
    overdue: DashSet<MarketId>,
}

impl RedemptionScheduler {
    /// Create a scheduler that reports outcomes on `events`.
    pub fn new(
        tracker: Arc<PositionTracker>,
        catalog: Arc<CatalogAdapter>,
        redeemer: Arc<dyn Redeemer>,
        settings: SchedulerSettings,
        events: mpsc::UnboundedSender<SettlementEvent>,
    ) -> Self {
        Self {
            tracker,
            catalog,
            redeemer,
            settings,
            events,
            overdue: DashSet::new(),
        }
    }

    /// Scheduler settings.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// One polling pass: resolve what can be resolved, then redeem what is due.
    #[instrument(skip(self), fields(now = now.unix_timestamp()))]
    pub async fn run_pass(&self, now: OffsetDateTime) -> Vec<RedemptionAttempt> {
        let to_poll = self.tracker.due_for_poll(now, self.settings.grace_seconds);
        let mut attempts: Vec<RedemptionAttempt> =
            join_all(to_poll.into_iter().map(|id| self.poll_one(id, now)))
                .await
                .into_iter()
                .flatten()
                .collect();

        let to_redeem = self.tracker.due_for_redemption(now);
        attempts.extend(
            join_all(to_redeem.into_iter().map(|id| self.redeem_one(id, now)))
                .await
                .into_iter()
                .flatten(),
        );

        if !attempts.is_empty() {
            debug!(steps = attempts.len(), "Redemption pass complete");
        }
        attempts
    }

    /// Poll one market. Returns a record only while it is still unresolved.
    async fn poll_one(&self, market_id: MarketId, now: OffsetDateTime) -> Option<RedemptionAttempt> {
        metrics::inc_resolution_polls();
        let status = match self.catalog.resolution(&market_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(market = %market_id, error = %e, "Resolution poll failed, treating as unresolved");
                self.check_deadline(&market_id, now);
                return Some(RedemptionAttempt::new(
                    market_id,
                    now,
                    AttemptResult::NotYetResolved,
                    Some(e.to_string()),
                ));
            }
        };

        let winner = match status {
            ResolutionStatus::Pending => {
                self.check_deadline(&market_id, now);
                return Some(RedemptionAttempt::new(
                    market_id,
                    now,
                    AttemptResult::NotYetResolved,
                    None,
                ));
            }
            resolved => resolved.winner()?,
        };

        match self.tracker.mark_resolved(&market_id, winner, now) {
            Ok(true) => {
                self.overdue.remove(&market_id);
                info!(market = %market_id, %winner, "Market resolved");
            }
            Ok(false) => debug!(market = %market_id, "Repeated resolution report ignored"),
            Err(e) => warn!(market = %market_id, error = %e, "Could not record resolution"),
        }
        None
    }

    fn check_deadline(&self, market_id: &MarketId, now: OffsetDateTime) {
        let Some(position) = self.tracker.get(market_id) else {
            return;
        };
        let overdue_by = now.unix_timestamp() - position.window_end;
        if overdue_by >= self.settings.deadline_seconds && self.overdue.insert(market_id.clone()) {
            warn!(
                market = %market_id,
                seconds_since_end = overdue_by,
                "Market still unresolved past redemption deadline"
            );
        }
    }

    /// Issue at most one redemption call for a resolved position.
    async fn redeem_one(&self, market_id: MarketId, now: OffsetDateTime) -> Option<RedemptionAttempt> {
        let ticket = match self.tracker.begin_redemption(&market_id, now) {
            Ok(ticket) => ticket,
            Err(PositionError::AlreadyRedeemed(_)) | Err(PositionError::RedemptionInFlight(_)) => {
                debug!(market = %market_id, "Redemption already handled");
                return None;
            }
            Err(e) => {
                warn!(market = %market_id, error = %e, "Redemption not started");
                return None;
            }
        };

        info!(
            market = %market_id,
            winner = %ticket.winner,
            quantity = %ticket.quantity,
            attempt = ticket.attempt,
            "Redeeming"
        );

        match self.redeemer.redeem(&market_id, ticket.quantity).await {
            Ok(()) => match self.tracker.complete_redemption(&market_id, now) {
                Ok(settlement) => {
                    metrics::inc_redemptions_succeeded();
                    metrics::record_redemption_latency(settlement.latency_seconds);
                    info!(
                        market = %market_id,
                        payout = %settlement.payout,
                        cost = %settlement.cost_basis,
                        pnl = %settlement.pnl,
                        "Redeemed"
                    );
                    self.emit(SettlementEvent::Redeemed(settlement));
                    Some(RedemptionAttempt::new(market_id, now, AttemptResult::Redeemed, None))
                }
                Err(e) => {
                    error!(
                        alert = "redemption_unrecorded",
                        market = %market_id,
                        quantity = %ticket.quantity,
                        error = %e,
                        "Redemption succeeded but position update failed, holding for operator"
                    );
                    let reason = e.to_string();
                    if let Err(hold_err) = self.tracker.hold_unrecorded_redemption(&market_id, &reason, now) {
                        error!(market = %market_id, error = %hold_err, "Could not hold unrecorded redemption");
                    }
                    Some(RedemptionAttempt::new(
                        market_id,
                        now,
                        AttemptResult::Failed,
                        Some(format!("redeemed but unrecorded: {reason}")),
                    ))
                }
            },
            Err(e) => {
                let reason = e.to_string();
                let retry_at = now
                    + backoff_delay(self.settings.backoff_base, self.settings.backoff_max, ticket.attempt);
                metrics::inc_redemptions_failed();

                match self.tracker.fail_redemption(
                    &market_id,
                    &reason,
                    retry_at,
                    self.settings.max_attempts,
                    now,
                ) {
                    Ok(failure) => {
                        if failure.exhausted {
                            metrics::inc_redemptions_exhausted();
                        } else {
                            warn!(
                                market = %market_id,
                                attempt = failure.attempts,
                                error = %reason,
                                retry_at = retry_at.unix_timestamp(),
                                "Redemption failed, will retry"
                            );
                        }
                        self.emit(SettlementEvent::RedemptionFailed {
                            market_id: market_id.clone(),
                            attempts: failure.attempts,
                            exhausted: failure.exhausted,
                            reason: reason.clone(),
                        });
                    }
                    Err(err) => warn!(market = %market_id, error = %err, "Could not record redemption failure"),
                }
                Some(RedemptionAttempt::new(market_id, now, AttemptResult::Failed, Some(reason)))
            }
        }
    }

    fn emit(&self, event: SettlementEvent) {
        if self.events.send(event).is_err() {
            debug!("Settlement receiver dropped");
        }
    }

    /// Run passes on the poll cadence until shutdown.
    ///
    /// Shutdown is observed between passes, so an in-flight redemption
    /// always completes.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.settings.poll_interval.as_millis() as u64, "Redemption scheduler started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_pass(OffsetDateTime::now_utc()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Redemption scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TradingError;
    use crate::exchange::{PaperConfig, PaperExchange, RawMarket};
    use crate::market::{CandidateFilter, Side};
    use crate::trading::{AppliedFill, OrderId, PositionState};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    const END: i64 = 1_772_366_400; // 2026-03-01 12:00 UTC

    struct Harness {
        exchange: Arc<PaperExchange>,
        catalog: Arc<CatalogAdapter>,
        tracker: Arc<PositionTracker>,
        scheduler: RedemptionScheduler,
        events: mpsc::UnboundedReceiver<SettlementEvent>,
    }

    /// Redeems on the paper exchange, then releases the tracker's claim before
    /// the scheduler can record the result.
    struct ReleasingRedeemer {
        exchange: Arc<PaperExchange>,
        tracker: Arc<PositionTracker>,
    }

    #[async_trait::async_trait]
    impl Redeemer for ReleasingRedeemer {
        async fn redeem(&self, market_id: &MarketId, quantity: rust_decimal::Decimal) -> Result<(), TradingError> {
            self.exchange.redeem(market_id, quantity).await?;
            let _ = self.tracker.fail_redemption(market_id, "released", at(0), 5, at(0));
            Ok(())
        }
    }

    fn harness(settings: SchedulerSettings) -> Harness {
        let exchange = Arc::new(PaperExchange::new(PaperConfig::default()));
        exchange.add_market(RawMarket {
            id: Some("m1".into()),
            window_start: Some(END - 900),
            window_end: Some(END),
            yes_token_id: Some("y".into()),
            no_token_id: Some("n".into()),
            ..Default::default()
        });
        let catalog = Arc::new(CatalogAdapter::new(
            exchange.clone(),
            exchange.clone(),
            CandidateFilter {
                min_combined_bid: dec!(0.8),
                max_spread: dec!(0.1),
                max_quote_age_seconds: 30,
                min_bid_size: dec!(10),
            },
        ));
        let tracker = Arc::new(PositionTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = RedemptionScheduler::new(tracker.clone(), catalog.clone(), exchange.clone(), settings, tx);
        Harness {
            exchange,
            catalog,
            tracker,
            scheduler,
            events: rx,
        }
    }

    fn fill(side: Side, size: rust_decimal::Decimal, price: rust_decimal::Decimal) -> AppliedFill {
        AppliedFill {
            order_id: OrderId::new(format!("o-{side}")),
            market_id: MarketId::new("m1"),
            side,
            delta: size,
            price,
            window_end: END,
        }
    }

    fn at(offset: i64) -> OffsetDateTime {
        datetime!(2026-03-01 12:00 UTC) + time::Duration::seconds(offset)
    }

    fn complete_set(h: &Harness) {
        h.tracker.record_fill(&fill(Side::Yes, dec!(10), dec!(0.45)), at(-60)).unwrap();
        h.tracker.record_fill(&fill(Side::No, dec!(10), dec!(0.45)), at(-30)).unwrap();
        h.tracker.advance_window_end(at(0));
    }

    #[tokio::test]
    async fn pending_then_resolved_redeems_once() {
        let mut h = harness(SchedulerSettings::default());
        complete_set(&h);
        h.exchange
            .script_resolutions(&MarketId::new("m1"), vec![None, Some(Side::Yes)]);

        let first = h.scheduler.run_pass(at(0)).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].result, AttemptResult::NotYetResolved);
        assert!(h.exchange.redemptions().is_empty());

        let second = h.scheduler.run_pass(at(1)).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].result, AttemptResult::Redeemed);

        // Stale "resolved" reports after redemption do nothing.
        let third = h.scheduler.run_pass(at(2)).await;
        assert!(third.is_empty());
        assert_eq!(h.exchange.redemptions(), vec![(MarketId::new("m1"), dec!(10))]);

        let position = h.tracker.get(&MarketId::new("m1")).unwrap();
        assert_eq!(position.state, PositionState::Redeemed);
        assert_eq!(position.realized_pnl, Some(dec!(1.0)));

        match h.events.try_recv().unwrap() {
            SettlementEvent::Redeemed(settlement) => {
                assert_eq!(settlement.pnl, dec!(1.0));
                assert_eq!(settlement.latency_seconds, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn grace_delays_first_poll() {
        let h = harness(SchedulerSettings {
            grace_seconds: 5,
            ..SchedulerSettings::default()
        });
        complete_set(&h);
        h.exchange.resolve(&MarketId::new("m1"), Side::No);

        assert!(h.scheduler.run_pass(at(4)).await.is_empty());
        let attempts = h.scheduler.run_pass(at(5)).await;
        assert_eq!(attempts[0].result, AttemptResult::Redeemed);
    }

    #[tokio::test]
    async fn failed_redemption_backs_off_then_succeeds() {
        let mut h = harness(SchedulerSettings::default());
        complete_set(&h);
        h.exchange.resolve(&MarketId::new("m1"), Side::No);
        h.exchange.fail_next_redemptions(2);

        let first = h.scheduler.run_pass(at(0)).await;
        assert_eq!(first[0].result, AttemptResult::Failed);

        // Backoff window not yet elapsed: no call.
        assert!(h.scheduler.run_pass(at(0)).await.is_empty());

        let second = h.scheduler.run_pass(at(1)).await;
        assert_eq!(second[0].result, AttemptResult::Failed);

        let third = h.scheduler.run_pass(at(3)).await;
        assert_eq!(third[0].result, AttemptResult::Redeemed);

        let position = h.tracker.get(&MarketId::new("m1")).unwrap();
        assert_eq!(position.state, PositionState::Redeemed);
        assert_eq!(position.redemption_attempts, 3);

        let mut failures = 0;
        while let Ok(event) = h.events.try_recv() {
            if let SettlementEvent::RedemptionFailed { exhausted, .. } = event {
                assert!(!exhausted);
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_stay_resolved() {
        let h = harness(SchedulerSettings {
            max_attempts: 2,
            ..SchedulerSettings::default()
        });
        complete_set(&h);
        h.exchange.resolve(&MarketId::new("m1"), Side::Yes);
        h.exchange.fail_next_redemptions(10);

        h.scheduler.run_pass(at(0)).await;
        h.scheduler.run_pass(at(10)).await;
        assert!(h.scheduler.run_pass(at(100)).await.is_empty());

        let position = h.tracker.get(&MarketId::new("m1")).unwrap();
        assert_eq!(position.state, PositionState::Resolved);
        assert!(position.redemption_exhausted);
        assert_eq!(h.exchange.redemptions().len(), 0);
    }

    #[tokio::test]
    async fn unrecorded_redemption_alerts_and_is_held() {
        let h = harness(SchedulerSettings::default());
        complete_set(&h);
        h.exchange.resolve(&MarketId::new("m1"), Side::Yes);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let redeemer = Arc::new(ReleasingRedeemer {
            exchange: h.exchange.clone(),
            tracker: h.tracker.clone(),
        });
        let scheduler = RedemptionScheduler::new(
            h.tracker.clone(),
            h.catalog.clone(),
            redeemer,
            SchedulerSettings::default(),
            tx,
        );

        let attempts = scheduler.run_pass(at(0)).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].result, AttemptResult::Failed);
        assert!(attempts[0].detail.as_deref().unwrap().contains("unrecorded"));

        let position = h.tracker.get(&MarketId::new("m1")).unwrap();
        assert_eq!(position.state, PositionState::Resolved);
        assert!(!position.redemption_in_flight);
        assert!(position.redemption_exhausted);

        // Held: no second call on later passes.
        assert!(scheduler.run_pass(at(60)).await.is_empty());
        assert_eq!(h.exchange.redemptions(), vec![(MarketId::new("m1"), dec!(10))]);
        assert!(rx.try_recv().is_err());
    }
}
