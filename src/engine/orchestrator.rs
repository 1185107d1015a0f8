//! The control loop: discover, place, track fills, redeem, account.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{BotError, Result};
use crate::exchange::{
    AccountSource, FillEvent, FillSource, MarketSource, OrderGateway, PaperExchange, Redeemer,
    ResolutionSource,
};
use crate::journal::TradeJournal;
use crate::market::{CatalogAdapter, MarketDescriptor, MarketId, Side};
use crate::metrics;
use crate::redemption::{RedemptionAttempt, RedemptionScheduler, SettlementEvent};
use crate::risk::{RiskController, RiskDecision, RiskSnapshot, RiskState};
use crate::trading::{
    Order, OrderLedger, OrderPair, PnlSummary, Position, PositionState, PositionTracker,
    WindowEndUpdate,
};

/// The exchange collaborators the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Market listing.
    pub markets: Arc<dyn MarketSource>,
    /// Resolution oracle.
    pub resolutions: Arc<dyn ResolutionSource>,
    /// Order transport.
    pub orders: Arc<dyn OrderGateway>,
    /// Pull-based fills.
    pub fills: Arc<dyn FillSource>,
    /// Settlement.
    pub redeemer: Arc<dyn Redeemer>,
    /// Authoritative account state.
    pub account: Arc<dyn AccountSource>,
}

impl Collaborators {
    /// Every collaborator backed by one paper exchange.
    pub fn paper(exchange: &Arc<PaperExchange>) -> Self {
        Self {
            markets: exchange.clone(),
            resolutions: exchange.clone(),
            orders: exchange.clone(),
            fills: exchange.clone(),
            redeemer: exchange.clone(),
            account: exchange.clone(),
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    /// Candidates that passed the catalog filter.
    pub candidates: usize,
    /// Pairs submitted.
    pub pairs_placed: usize,
    /// Candidates blocked by risk.
    pub risk_rejections: usize,
    /// Pair submissions that failed.
    pub submit_failures: usize,
    /// Fill events that changed state.
    pub fills_applied: usize,
    /// Fill events rejected by the ledger or tracker.
    pub fill_errors: usize,
    /// Positions that became Complete.
    pub completed: usize,
    /// Lagging legs re-quoted closer to the ask.
    pub requotes: usize,
    /// Resting orders cancelled at window end.
    pub orders_cancelled: usize,
    /// Positions moved to AwaitingResolution.
    pub awaiting_resolution: usize,
    /// Positions flagged for unmatched exposure.
    pub flagged: usize,
    /// Unfilled pairs retired.
    pub abandoned: usize,
    /// Scheduler steps.
    pub redemption_attempts: Vec<RedemptionAttempt>,
    /// Positions redeemed.
    pub redeemed: usize,
    /// Failed redemption calls.
    pub redemption_failures: usize,
    /// P&L realized this iteration.
    pub realized_pnl: Decimal,
    /// Listing outage, if any.
    pub catalog_error: Option<String>,
    /// Daily risk counters were reset.
    pub day_rolled: bool,
}

impl IterationReport {
    /// Whether anything happened worth an info-level status line.
    pub fn changed(&self) -> bool {
        self.pairs_placed > 0
            || self.fills_applied > 0
            || self.requotes > 0
            || self.orders_cancelled > 0
            || self.awaiting_resolution > 0
            || self.flagged > 0
            || self.abandoned > 0
            || self.redeemed > 0
            || self.redemption_failures > 0
            || self.day_rolled
    }
}

/// Engine status for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Paper trading.
    pub dry_run: bool,
    /// Iterations run.
    pub iterations: u64,
    /// Stop requested.
    pub stopping: bool,
    /// Most recent iteration.
    pub last_iteration: Option<IterationReport>,
}

/// Orchestrates the order/position lifecycle.
pub struct Engine {
    pub(super) config: Config,
    pub(super) catalog: Arc<CatalogAdapter>,
    pub(super) ledger: Arc<OrderLedger>,
    pub(super) tracker: Arc<PositionTracker>,
    pub(super) scheduler: Arc<RedemptionScheduler>,
    pub(super) account: Arc<dyn AccountSource>,
    fills: Arc<dyn FillSource>,
    risk: Mutex<RiskController>,
    fill_tx: mpsc::UnboundedSender<FillEvent>,
    fill_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FillEvent>>,
    settlements: tokio::sync::Mutex<mpsc::UnboundedReceiver<SettlementEvent>>,
    stopping: AtomicBool,
    iterations: AtomicU64,
    last_report: Mutex<Option<IterationReport>>,
}

impl Engine {
    /// Build an engine from validated configuration.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        Self::new_at(config, collaborators, OffsetDateTime::now_utc())
    }

    /// Build an engine whose risk day starts at `now`.
    pub fn new_at(config: Config, collaborators: Collaborators, now: OffsetDateTime) -> Result<Self> {
        config.validate().map_err(BotError::InvalidConfig)?;

        let mut tracker = PositionTracker::new();
        if let Some(path) = &config.trade_log_file {
            let journal = TradeJournal::open(path)?;
            info!(path = %journal.path().display(), "Trade journal enabled");
            tracker = tracker.with_journal(Arc::new(journal));
        }
        let tracker = Arc::new(tracker);

        let catalog = Arc::new(CatalogAdapter::new(
            collaborators.markets,
            collaborators.resolutions,
            config.candidate_filter(),
        ));
        let ledger = Arc::new(OrderLedger::new(collaborators.orders, config.retry_policy()));

        let (settlement_tx, settlement_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(RedemptionScheduler::new(
            tracker.clone(),
            catalog.clone(),
            collaborators.redeemer,
            config.scheduler_settings(),
            settlement_tx,
        ));
        let (fill_tx, fill_rx) = mpsc::unbounded_channel();
        let risk = RiskController::new(config.risk_limits(), now);

        Ok(Self {
            config,
            catalog,
            ledger,
            tracker,
            scheduler,
            account: collaborators.account,
            fills: collaborators.fills,
            risk: Mutex::new(risk),
            fill_tx,
            fill_rx: tokio::sync::Mutex::new(fill_rx),
            settlements: tokio::sync::Mutex::new(settlement_rx),
            stopping: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
            last_report: Mutex::new(None),
        })
    }

    fn risk(&self) -> MutexGuard<'_, RiskController> {
        self.risk.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Position tracker.
    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    /// Order ledger.
    pub fn ledger(&self) -> &Arc<OrderLedger> {
        &self.ledger
    }

    /// Redemption scheduler.
    pub fn scheduler(&self) -> &Arc<RedemptionScheduler> {
        &self.scheduler
    }

    /// Sender for push-delivered fills; applied on the next iteration.
    pub fn fill_sender(&self) -> mpsc::UnboundedSender<FillEvent> {
        self.fill_tx.clone()
    }

    /// Run one iteration at the current time.
    pub async fn run_iteration(&self) -> IterationReport {
        self.run_iteration_at(OffsetDateTime::now_utc()).await
    }

    /// Run one iteration. Each step is isolated: a failure in one does not
    /// prevent the others from running.
    #[instrument(skip(self), fields(now = now.unix_timestamp()))]
    pub async fn run_iteration_at(&self, now: OffsetDateTime) -> IterationReport {
        let start = Instant::now();
        let mut report = IterationReport {
            day_rolled: self.risk().roll_day(now),
            ..Default::default()
        };

        if !self.stopping.load(Ordering::SeqCst) {
            self.place_new_sets(now, &mut report).await;
        }
        self.apply_fills(now, &mut report).await;
        if !self.stopping.load(Ordering::SeqCst) {
            self.requote_lagging_legs(now, &mut report).await;
        }
        self.handle_window_end(now, &mut report).await;
        report.redemption_attempts = self.scheduler.run_pass(now).await;
        self.drain_settlements(now, &mut report).await;

        self.refresh_exposure();
        self.log_status(&report);
        metrics::record_iteration_latency(start);

        self.iterations.fetch_add(1, Ordering::Relaxed);
        *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.clone());
        report
    }

    async fn place_new_sets(&self, now: OffsetDateTime, report: &mut IterationReport) {
        let candidates = match self.catalog.list_candidates(now).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Market listing failed, skipping placement");
                report.catalog_error = Some(e.to_string());
                return;
            }
        };
        report.candidates = candidates.len();

        for market in candidates {
            if self.ledger.is_tracked(&market.id) || self.tracker.contains(&market.id) {
                continue;
            }
            self.try_open(&market, now, report).await;
        }
    }

    async fn try_open(&self, market: &MarketDescriptor, now: OffsetDateTime, report: &mut IterationReport) {
        self.refresh_exposure();
        let open_sets = self.open_sets();
        let (size, decision) = {
            let mut risk = self.risk();
            let size = risk.scaled_size(self.config.position_size, self.config.min_order_size);
            let decision = risk.evaluate(self.config.pair_cost(size), open_sets, now);
            (size, decision)
        };

        if let RiskDecision::Rejected(reason) = decision {
            metrics::inc_risk_rejections(reason.label());
            debug!(market = %market.id, reason = reason.label(), "Risk rejected new set");
            report.risk_rejections += 1;
            return;
        }

        match self
            .ledger
            .submit_pair(market, self.config.bid_price, size, now)
            .await
        {
            Ok(pair) => {
                report.pairs_placed += 1;
                info!(
                    market = %market.id,
                    yes_order = %pair.yes,
                    no_order = %pair.no,
                    price = %self.config.bid_price,
                    %size,
                    "Placed complete-set bids"
                );
            }
            Err(e) => {
                report.submit_failures += 1;
                warn!(market = %market.id, error = %e, "Pair submission failed");
            }
        }
    }

    async fn apply_fills(&self, now: OffsetDateTime, report: &mut IterationReport) {
        let mut events: Vec<FillEvent> = {
            let mut rx = self.fill_rx.lock().await;
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        let open = self.ledger.open_order_ids();
        if !open.is_empty() {
            match self.fills.poll_fills(&open).await {
                Ok(polled) => events.extend(polled),
                Err(e) => warn!(error = %e, "Fill poll failed"),
            }
        }

        for event in &events {
            self.apply_fill(event, now, report);
        }
    }

    fn apply_fill(&self, event: &FillEvent, now: OffsetDateTime, report: &mut IterationReport) {
        let applied = match self.ledger.on_fill(event, now) {
            Ok(Some(applied)) => applied,
            Ok(None) => return,
            Err(e) => {
                report.fill_errors += 1;
                warn!(order_id = %event.order_id, error = %e, "Fill rejected by ledger");
                return;
            }
        };

        match self.tracker.record_fill(&applied, now) {
            Ok(transition) => {
                report.fills_applied += 1;
                if transition == Some(PositionState::Complete) {
                    report.completed += 1;
                }
            }
            Err(e) => {
                report.fill_errors += 1;
                warn!(market = %applied.market_id, error = %e, "Fill rejected by position tracker");
            }
        }
    }

    /// Re-quote the resting leg of a set whose other leg has filled.
    ///
    /// Only a leg with no fills, resting longer than `requote_after_seconds`,
    /// within `one_leg_timeout_seconds` of the first fill, is moved. The new
    /// bid must improve on the old one and keep the pair under $1.
    async fn requote_lagging_legs(&self, now: OffsetDateTime, report: &mut IterationReport) {
        for pair in self.ledger.pairs() {
            let Some((side, order, position)) = self.lagging_leg(&pair, now) else {
                continue;
            };

            let market = match self.catalog.get_market(&pair.market.id).await {
                Ok(market) => market,
                Err(e) => {
                    warn!(market = %pair.market.id, error = %e, "Book fetch for re-quote failed");
                    continue;
                }
            };
            let Some(price) = market.book(side).improved_bid(self.config.tick_size) else {
                debug!(market = %market.id, %side, "No two-sided book to re-quote against");
                continue;
            };
            let partner = position.leg(side.opposite()).avg_price();
            if price <= order.price || price + partner >= Decimal::ONE {
                debug!(market = %market.id, %side, %price, %partner, "Re-quote skipped");
                continue;
            }

            match self.ledger.replace_leg(&market.id, side, price, now).await {
                Ok(Some(replacement)) => {
                    report.requotes += 1;
                    metrics::inc_legs_requoted();
                    info!(
                        market = %market.id,
                        %side,
                        old_order = %order.id,
                        new_order = %replacement.id,
                        old_price = %order.price,
                        %price,
                        "Lagging leg re-quoted"
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(market = %market.id, %side, error = %e, "Re-quote failed"),
            }
        }
    }

    fn lagging_leg(&self, pair: &OrderPair, now: OffsetDateTime) -> Option<(Side, Order, Position)> {
        if pair.market.has_ended(now) {
            return None;
        }
        let position = self.tracker.get(&pair.market.id)?;
        if position.state != PositionState::Building
            || (now - position.opened_at).whole_seconds() > self.config.one_leg_timeout_seconds
        {
            return None;
        }
        let side = Side::BOTH.into_iter().find(|side| {
            position.leg(*side).filled.is_zero() && !position.leg(side.opposite()).filled.is_zero()
        })?;
        let order = self.ledger.get(pair.leg(side))?;
        let resting = (now - order.created_at).whole_seconds();
        (order.status.is_open() && order.filled.is_zero() && resting > self.config.requote_after_seconds)
            .then_some((side, order, position))
    }

    async fn handle_window_end(&self, now: OffsetDateTime, report: &mut IterationReport) {
        let mut touched = HashSet::new();
        for order_id in self.ledger.expired_open_orders(now) {
            match self.ledger.cancel(&order_id, now).await {
                Ok(true) => {
                    report.orders_cancelled += 1;
                    if let Some(order) = self.ledger.get(&order_id) {
                        touched.insert((order.market_id, order.window_end));
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(order_id = %order_id, error = %e, "Cancel at window end failed"),
            }
        }

        for (market_id, window_end) in touched {
            if self.ledger.markets_with_open_orders().contains(&market_id) {
                continue;
            }
            let unfilled = self
                .tracker
                .get(&market_id)
                .map_or(true, |p| !p.has_fills());
            if unfilled {
                match self.tracker.abandon_unfilled(&market_id, window_end, now) {
                    Ok(true) => report.abandoned += 1,
                    Ok(false) => {}
                    Err(e) => warn!(market = %market_id, error = %e, "Could not abandon unfilled pair"),
                }
            }
        }

        for update in self.tracker.advance_window_end(now) {
            match update {
                WindowEndUpdate::AwaitingResolution(_) => report.awaiting_resolution += 1,
                WindowEndUpdate::Flagged { .. } => report.flagged += 1,
            }
        }
    }

    async fn drain_settlements(&self, now: OffsetDateTime, report: &mut IterationReport) {
        let events: Vec<SettlementEvent> = {
            let mut rx = self.settlements.lock().await;
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        if events.is_empty() {
            return;
        }

        let mut risk = self.risk();
        for event in events {
            match event {
                SettlementEvent::Redeemed(settlement) => {
                    risk.on_settled(settlement.pnl, now);
                    report.redeemed += 1;
                    report.realized_pnl += settlement.pnl;
                }
                SettlementEvent::RedemptionFailed { .. } => {
                    risk.on_redemption_failure();
                    report.redemption_failures += 1;
                }
            }
        }
    }

    /// Exposure is recomputed from scratch: position cost plus resting notional.
    fn refresh_exposure(&self) {
        let exposure = self.tracker.exposure() + self.ledger.reserved_notional();
        self.risk().set_exposure(exposure);
    }

    /// Markets with a live position or resting orders.
    fn open_sets(&self) -> usize {
        let mut markets: HashSet<MarketId> = self
            .tracker
            .open_positions()
            .into_iter()
            .map(|p| p.market_id)
            .collect();
        markets.extend(self.ledger.markets_with_open_orders());
        markets.len()
    }

    fn log_status(&self, report: &IterationReport) {
        let snapshot = self.risk_snapshot();
        metrics::set_risk_gauges(
            snapshot.exposure,
            snapshot.open_sets,
            snapshot.daily_pnl,
            snapshot.size_multiplier,
        );

        if report.changed() {
            info!(
                open_sets = snapshot.open_sets,
                exposure = %snapshot.exposure,
                daily_pnl = %snapshot.daily_pnl,
                multiplier = %snapshot.size_multiplier,
                placed = report.pairs_placed,
                fills = report.fills_applied,
                requotes = report.requotes,
                redeemed = report.redeemed,
                can_trade = snapshot.can_trade,
                "Status"
            );
        } else {
            debug!(
                open_sets = snapshot.open_sets,
                exposure = %snapshot.exposure,
                daily_pnl = %snapshot.daily_pnl,
                "Status"
            );
        }
    }

    /// Non-terminal positions.
    pub fn open_positions(&self) -> Vec<Position> {
        self.tracker.open_positions()
    }

    /// Copy of the authoritative risk state.
    pub fn risk_state(&self) -> RiskState {
        self.risk().state().clone()
    }

    /// Risk view for status output.
    pub fn risk_snapshot(&self) -> RiskSnapshot {
        let open_sets = self.open_sets();
        let min_pair_cost = self.config.pair_cost(self.config.min_order_size);
        self.risk().snapshot(open_sets, min_pair_cost)
    }

    /// Aggregate P&L.
    pub fn pnl_summary(&self) -> PnlSummary {
        self.tracker.pnl_summary()
    }

    /// Engine status.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            dry_run: self.config.dry_run,
            iterations: self.iterations.load(Ordering::Relaxed),
            stopping: self.stopping.load(Ordering::SeqCst),
            last_iteration: self
                .last_report
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    /// Clear the kill switch after operator review.
    pub fn reset_kill_switch(&self) {
        self.risk().reset_kill_switch();
    }

    /// Retry redemption for a position whose attempts were exhausted.
    pub fn rearm_redemption(&self, market_id: &MarketId) -> Result<()> {
        self.tracker
            .rearm_redemption(market_id, OffsetDateTime::now_utc())
            .map_err(BotError::from)
    }

    /// Cancel a market's resting orders; retire it if nothing ever filled.
    pub async fn cancel_market(&self, market_id: &MarketId) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let cancelled = self.ledger.cancel_market(market_id, now).await?;

        let has_fills = self.tracker.get(market_id).is_some_and(|p| p.has_fills());
        if !has_fills {
            if let Some(pair) = self.ledger.pair(market_id) {
                self.tracker
                    .abandon_unfilled(market_id, pair.market.window_end, now)?;
            }
        }
        info!(market = %market_id, cancelled, "Market cancelled");
        Ok(cancelled)
    }

    /// Stop placing orders and cancel everything resting.
    ///
    /// Positions are left untouched; they are rebuilt from the exchange on
    /// the next start.
    pub async fn shutdown(&self) -> usize {
        self.stopping.store(true, Ordering::SeqCst);
        let now = OffsetDateTime::now_utc();

        let mut cancelled = 0;
        for order_id in self.ledger.open_order_ids() {
            match self.ledger.cancel(&order_id, now).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!(order_id = %order_id, error = %e, "Cancel on shutdown failed"),
            }
        }
        info!(cancelled, open_positions = self.tracker.open_count(), "Engine stopped");
        cancelled
    }

    /// Whether shutdown was requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Drive iterations until `shutdown` flips, with the scheduler running
    /// alongside at its own cadence.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let scheduler = self.scheduler.clone().spawn(shutdown.clone());
        let mut ticker = tokio::time::interval(self.config.loop_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.loop_interval_ms,
            dry_run = self.config.dry_run,
            "Engine started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_iteration().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        if let Err(e) = scheduler.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }

        // Account for redemptions that completed during the drain.
        let mut report = IterationReport::default();
        self.drain_settlements(OffsetDateTime::now_utc(), &mut report).await;
        self.refresh_exposure();
        Ok(())
    }
}
