//! End-to-end lifecycle tests against the paper exchange.
//!
//! Every test drives the public `Engine` with explicit timestamps around a
//! market window ending at `T`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_test::assert_ok;
use tower::ServiceExt;

use complete_set_maker::api::{create_router, AppState};
use complete_set_maker::config::Config;
use complete_set_maker::engine::{Collaborators, Engine};
use complete_set_maker::exchange::{FillEvent, PaperExchange, RawMarket};
use complete_set_maker::market::{MarketId, Side};
use complete_set_maker::redemption::AttemptResult;
use complete_set_maker::risk::KillReason;
use complete_set_maker::trading::{OrderId, OrderStatus, PositionState};

/// 2026-03-01 12:00:00 UTC.
const T: i64 = 1_772_366_400;

fn at(offset: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(T + offset).unwrap()
}

fn raw_market(id: &str, window_end: i64, fetched_at: i64) -> RawMarket {
    RawMarket {
        id: Some(id.to_string()),
        asset: Some("BTC".to_string()),
        window_start: Some(window_end - 900),
        window_end: Some(window_end),
        yes_token_id: Some(format!("{}-yes", id)),
        no_token_id: Some(format!("{}-no", id)),
        yes_bid: Some("0.44".to_string()),
        yes_ask: Some("0.47".to_string()),
        no_bid: Some("0.45".to_string()),
        no_ask: Some("0.49".to_string()),
        yes_bid_size: Some("50".to_string()),
        no_bid_size: Some("50".to_string()),
        fetched_at: Some(fetched_at),
    }
}

fn config() -> Config {
    Config {
        transport_backoff_ms: 1,
        ..Config::default()
    }
}

fn setup(config: Config, markets: &[&str]) -> (Arc<PaperExchange>, Engine) {
    let exchange = Arc::new(PaperExchange::default());
    for id in markets {
        exchange.add_market(raw_market(id, T, T - 60));
    }
    let engine = Engine::new_at(config, Collaborators::paper(&exchange), at(-60)).unwrap();
    (exchange, engine)
}

fn id(market: &str) -> MarketId {
    MarketId::new(market)
}

fn legs(engine: &Engine, market: &str) -> (OrderId, OrderId) {
    let pair = engine.ledger().pair(&id(market)).expect("pair placed");
    (pair.yes, pair.no)
}

/// Place and fully fill a pair, leaving it Complete.
async fn complete_set(exchange: &PaperExchange, engine: &Engine, market: &str) {
    let (yes, no) = legs(engine, market);
    exchange.fill(&yes, dec!(10));
    exchange.fill(&no, dec!(10));
    engine.run_iteration_at(at(-30)).await;
}

#[tokio::test]
async fn full_lifecycle_redeems_once() {
    let (exchange, engine) = setup(config(), &["m1"]);

    let report = engine.run_iteration_at(at(-60)).await;
    assert_eq!(report.pairs_placed, 1);
    assert_eq!(engine.risk_state().exposure, dec!(9.00));

    let (yes, no) = legs(&engine, "m1");
    exchange.fill(&yes, dec!(10));
    exchange.fill(&no, dec!(10));
    let report = engine.run_iteration_at(at(-30)).await;
    assert_eq!(report.fills_applied, 2);
    assert_eq!(report.completed, 1);

    exchange.script_resolutions(&id("m1"), vec![None, Some(Side::Yes)]);

    let report = engine.run_iteration_at(at(0)).await;
    assert_eq!(report.awaiting_resolution, 1);
    assert_eq!(report.redemption_attempts.len(), 1);
    assert_eq!(report.redemption_attempts[0].result, AttemptResult::NotYetResolved);
    assert_eq!(exchange.redeem_calls(), 0);

    let report = engine.run_iteration_at(at(1)).await;
    assert_eq!(report.redeemed, 1);
    assert_eq!(report.realized_pnl, dec!(1.00));

    // Stale resolved reports keep arriving; nothing is resubmitted.
    engine.run_iteration_at(at(2)).await;
    engine.run_iteration_at(at(3)).await;
    assert_eq!(exchange.redeem_calls(), 1);
    assert_eq!(exchange.redemptions(), vec![(id("m1"), dec!(10))]);

    let position = engine.tracker().get(&id("m1")).unwrap();
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
    assert!(engine.open_positions().is_empty());

    let risk = engine.risk_state();
    assert_eq!(risk.daily_pnl, dec!(1.00));
    assert_eq!(risk.exposure, Decimal::ZERO);
}

#[tokio::test]
async fn pnl_is_exact_for_either_winner() {
    let config = Config {
        bid_price: dec!(0.02),
        position_size: dec!(1),
        min_order_size: dec!(1),
        ..config()
    };
    let (exchange, engine) = setup(config, &["yes-wins", "no-wins"]);
    engine.run_iteration_at(at(-60)).await;

    for market in ["yes-wins", "no-wins"] {
        let (yes, no) = legs(&engine, market);
        exchange.fill(&yes, dec!(1));
        exchange.fill(&no, dec!(1));
    }
    engine.run_iteration_at(at(-30)).await;

    exchange.resolve(&id("yes-wins"), Side::Yes);
    exchange.resolve(&id("no-wins"), Side::No);
    let report = engine.run_iteration_at(at(0)).await;
    assert_eq!(report.redeemed, 2);

    for market in ["yes-wins", "no-wins"] {
        let position = engine.tracker().get(&id(market)).unwrap();
        assert_eq!(position.cost_basis(), dec!(0.04));
        assert_eq!(position.payout, Some(dec!(1)));
        assert_eq!(position.realized_pnl, Some(dec!(0.96)));
    }
    assert_eq!(engine.pnl_summary().realized_pnl, dec!(1.92));
}

#[tokio::test]
async fn duplicate_fill_notifications_are_idempotent() {
    let (_exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    let (yes, _) = legs(&engine, "m1");

    let fills = engine.fill_sender();
    // Cumulative 10 arrives before a duplicate 10 and a stale 5.
    fills.send(FillEvent::new(yes.clone(), dec!(10))).unwrap();
    fills.send(FillEvent::new(yes.clone(), dec!(10))).unwrap();
    fills.send(FillEvent::new(yes.clone(), dec!(5))).unwrap();

    let report = engine.run_iteration_at(at(-30)).await;
    assert_eq!(report.fills_applied, 1);
    assert_eq!(report.fill_errors, 0);

    let order = engine.ledger().get(&yes).unwrap();
    assert_eq!(order.filled, dec!(10));
    assert_eq!(order.status, OrderStatus::Filled);
    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.yes.filled, dec!(10));
    assert_eq!(position.state, PositionState::Building);
}

#[tokio::test]
async fn oversized_fill_is_rejected_without_side_effects() {
    let (_exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    let (yes, _) = legs(&engine, "m1");

    engine.fill_sender().send(FillEvent::new(yes.clone(), dec!(11))).unwrap();
    let report = engine.run_iteration_at(at(-30)).await;

    assert_eq!(report.fill_errors, 1);
    assert_eq!(engine.ledger().get(&yes).unwrap().filled, Decimal::ZERO);
    assert!(!engine.tracker().contains(&id("m1")));
}

#[tokio::test]
async fn redemption_fails_twice_then_succeeds() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    complete_set(&exchange, &engine, "m1").await;

    exchange.resolve(&id("m1"), Side::No);
    exchange.fail_next_redemptions(2);

    let report = engine.run_iteration_at(at(0)).await;
    assert_eq!(report.redemption_failures, 1);
    let report = engine.run_iteration_at(at(1)).await;
    assert_eq!(report.redemption_failures, 1);
    assert_eq!(engine.tracker().get(&id("m1")).unwrap().state, PositionState::Resolved);

    let report = engine.run_iteration_at(at(3)).await;
    assert_eq!(report.redeemed, 1);
    assert_eq!(exchange.redeem_calls(), 3);

    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.state, PositionState::Redeemed);
    let risk = engine.risk_state();
    assert_eq!(risk.consecutive_redemption_failures, 0);
    assert_eq!(risk.kill_switch, None);
}

#[tokio::test]
async fn exhausted_redemptions_trip_the_kill_switch() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    complete_set(&exchange, &engine, "m1").await;

    exchange.resolve(&id("m1"), Side::Yes);
    exchange.fail_next_redemptions(100);
    for offset in [0, 1, 3, 10, 60] {
        engine.run_iteration_at(at(offset)).await;
    }

    assert_eq!(exchange.redeem_calls(), 3);
    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.state, PositionState::Resolved);
    assert!(position.redemption_exhausted);
    assert_eq!(engine.risk_state().kill_switch, Some(KillReason::SuspectedBlacklist));

    // New candidates are blocked while the kill switch is active.
    exchange.add_market(raw_market("m2", T + 900, T + 60));
    let report = engine.run_iteration_at(at(61)).await;
    assert_eq!(report.candidates, 1);
    assert_eq!(report.risk_rejections, 1);
    assert_eq!(report.pairs_placed, 0);
}

#[tokio::test]
async fn exposure_cap_is_inclusive() {
    let config = Config {
        max_exposure: dec!(9),
        ..config()
    };
    let (_exchange, engine) = setup(config, &["m1", "m2"]);

    let report = engine.run_iteration_at(at(-60)).await;
    assert_eq!(report.pairs_placed, 1);
    assert_eq!(report.risk_rejections, 1);
    assert_eq!(engine.risk_state().exposure, dec!(9));
    assert!(!engine.risk_snapshot().can_trade);
}

#[tokio::test]
async fn loss_streak_halves_next_pair_size() {
    let markets = ["l1", "l2", "l3"];
    let (exchange, engine) = setup(config(), &markets);
    engine.run_iteration_at(at(-60)).await;

    // Fills well above the bid make each set lose money.
    let fills = engine.fill_sender();
    for market in markets {
        let (yes, no) = legs(&engine, market);
        for order in [yes, no] {
            let mut event = FillEvent::new(order, dec!(10));
            event.price = Some(dec!(0.60));
            fills.send(event).unwrap();
        }
        exchange.resolve(&id(market), Side::Yes);
    }
    engine.run_iteration_at(at(-30)).await;

    let report = engine.run_iteration_at(at(0)).await;
    assert_eq!(report.redeemed, 3);
    assert_eq!(report.realized_pnl, dec!(-6));

    let risk = engine.risk_state();
    assert_eq!(risk.loss_streak, 3);
    assert_eq!(risk.size_multiplier, dec!(0.5));

    exchange.add_market(raw_market("next", T + 900, T + 1));
    let report = engine.run_iteration_at(at(2)).await;
    assert_eq!(report.pairs_placed, 1);
    let orders = engine.ledger().orders_for(&id("next"));
    assert!(orders.iter().all(|o| o.size == dec!(5)));
}

#[tokio::test]
async fn single_leg_at_window_end_is_flagged_not_redeemed() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    let (yes, _) = legs(&engine, "m1");
    exchange.fill(&yes, dec!(4));
    engine.run_iteration_at(at(-30)).await;

    exchange.resolve(&id("m1"), Side::Yes);
    let report = engine.run_iteration_at(at(0)).await;
    assert_eq!(report.orders_cancelled, 2);
    assert_eq!(report.flagged, 1);
    assert_eq!(report.abandoned, 0);

    engine.run_iteration_at(at(5)).await;
    assert_eq!(exchange.redeem_calls(), 0);

    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.state, PositionState::Building);
    assert!(position.unmatched_flag);
    assert_eq!(engine.pnl_summary().flagged, 1);
}

#[tokio::test]
async fn unequal_legs_redeem_matched_sets_and_flag_the_rest() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    let (yes, no) = legs(&engine, "m1");
    exchange.fill(&yes, dec!(5));
    exchange.fill(&no, dec!(8));
    engine.run_iteration_at(at(-30)).await;
    assert_eq!(engine.tracker().get(&id("m1")).unwrap().state, PositionState::Building);

    exchange.resolve(&id("m1"), Side::Yes);
    let report = engine.run_iteration_at(at(0)).await;
    assert_eq!(report.orders_cancelled, 2);
    assert_eq!(report.awaiting_resolution, 1);
    assert_eq!(report.flagged, 1);
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.redeemed, 1);
    assert_eq!(report.realized_pnl, dec!(-0.85));
    assert_eq!(exchange.redemptions(), vec![(id("m1"), dec!(5))]);

    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.state, PositionState::Redeemed);
    assert_eq!(position.payout, Some(dec!(5)));
    assert!(position.unmatched_flag);
    assert_eq!(position.unmatched_remainder(), Some((Side::No, dec!(3))));
}

#[tokio::test]
async fn lagging_leg_is_requoted_after_partner_fills() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    let (yes, no) = legs(&engine, "m1");
    exchange.fill(&yes, dec!(10));

    // Resting only 5s: too early to move.
    let report = engine.run_iteration_at(at(-55)).await;
    assert_eq!(report.fills_applied, 1);
    assert_eq!(report.requotes, 0);

    let report = engine.run_iteration_at(at(-45)).await;
    assert_eq!(report.requotes, 1);
    let (_, requoted) = legs(&engine, "m1");
    assert_ne!(requoted, no);
    let order = engine.ledger().get(&requoted).unwrap();
    assert_eq!(order.price, dec!(0.47));
    assert_eq!(order.size, dec!(10));
    assert_eq!(order.side, Side::No);
    assert_eq!(engine.ledger().get(&no).unwrap().status, OrderStatus::Cancelled);
    assert_eq!(exchange.cancelled_orders(), vec![no.clone()]);

    // Already at the improved bid: left alone.
    assert_eq!(engine.run_iteration_at(at(-30)).await.requotes, 0);

    exchange.fill(&requoted, dec!(10));
    let report = engine.run_iteration_at(at(-20)).await;
    assert_eq!(report.completed, 1);
    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.state, PositionState::Complete);
    assert_eq!(position.cost_basis(), dec!(9.20));
}

#[tokio::test]
async fn one_leg_is_not_requoted_after_timeout() {
    let config = Config {
        one_leg_timeout_seconds: 20,
        ..config()
    };
    let (exchange, engine) = setup(config, &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    let (yes, no) = legs(&engine, "m1");
    exchange.fill(&yes, dec!(10));
    engine.run_iteration_at(at(-58)).await;

    let report = engine.run_iteration_at(at(-30)).await;
    assert_eq!(report.requotes, 0);
    assert_eq!(legs(&engine, "m1").1, no);
    assert!(exchange.cancelled_orders().is_empty());
}

#[tokio::test]
async fn unfilled_pair_is_abandoned_at_window_end() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;

    let report = engine.run_iteration_at(at(0)).await;
    assert_eq!(report.orders_cancelled, 2);
    assert_eq!(report.abandoned, 1);
    assert_eq!(exchange.cancelled_orders().len(), 2);

    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.state, PositionState::Abandoned);
    assert_eq!(engine.risk_state().exposure, Decimal::ZERO);
}

#[tokio::test]
async fn listing_outage_does_not_block_redemption() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    complete_set(&exchange, &engine, "m1").await;

    exchange.set_listing_down(true);
    exchange.resolve(&id("m1"), Side::Yes);
    let report = engine.run_iteration_at(at(0)).await;

    assert!(report.catalog_error.is_some());
    assert_eq!(report.redeemed, 1);
}

#[tokio::test]
async fn restart_restores_awaiting_positions() {
    let (exchange, first) = setup(config(), &["m1"]);
    first.run_iteration_at(at(-60)).await;
    complete_set(&exchange, &first, "m1").await;
    drop(first);

    let engine = Engine::new_at(config(), Collaborators::paper(&exchange), at(0)).unwrap();
    let restored = assert_ok!(engine.restore_at(at(0)).await);
    assert_eq!(restored.positions, 1);
    assert_eq!(restored.orders, 0);

    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.state, PositionState::AwaitingResolution);
    assert_eq!(position.cost_basis(), dec!(9.00));

    exchange.resolve(&id("m1"), Side::No);
    let report = engine.run_iteration_at(at(1)).await;
    assert_eq!(report.redeemed, 1);
    assert_eq!(report.realized_pnl, dec!(1.00));
    assert_eq!(exchange.submit_calls(), 2);
}

#[tokio::test]
async fn restart_resumes_resting_orders_without_double_counting() {
    let (exchange, first) = setup(config(), &["m1"]);
    first.run_iteration_at(at(-60)).await;
    let (yes, no) = legs(&first, "m1");
    exchange.fill(&yes, dec!(4));
    first.run_iteration_at(at(-50)).await;
    drop(first);

    let engine = Engine::new_at(config(), Collaborators::paper(&exchange), at(-40)).unwrap();
    let restored = assert_ok!(engine.restore_at(at(-40)).await);
    assert_eq!(restored.positions, 1);
    assert_eq!(restored.orders, 2);
    assert_eq!(restored.pairs, 1);

    exchange.fill(&yes, dec!(10));
    exchange.fill(&no, dec!(10));
    let report = engine.run_iteration_at(at(-30)).await;
    assert_eq!(report.pairs_placed, 0);
    assert_eq!(report.completed, 1);

    let position = engine.tracker().get(&id("m1")).unwrap();
    assert_eq!(position.yes.filled, dec!(10));
    assert_eq!(position.no.filled, dec!(10));
    assert_eq!(exchange.submit_calls(), 2);
}

#[tokio::test]
async fn shutdown_cancels_resting_orders_and_stops_placement() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;

    assert_eq!(engine.shutdown().await, 2);
    assert!(engine.is_stopping());

    exchange.add_market(raw_market("m2", T + 900, T - 50));
    let report = engine.run_iteration_at(at(-50)).await;
    assert_eq!(report.pairs_placed, 0);
    assert_eq!(exchange.submit_calls(), 2);
}

#[tokio::test]
async fn run_loop_stops_on_signal() {
    let config = Config {
        loop_interval_ms: 10,
        resolution_poll_interval_ms: 10,
        ..config()
    };
    let (_exchange, engine) = setup(config, &[]);
    let engine = Arc::new(engine);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(engine.clone().run(rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
    assert!(engine.is_stopping());
    assert!(engine.status().iterations >= 1);
}

#[tokio::test]
async fn status_api_reflects_engine_state() {
    let (exchange, engine) = setup(config(), &["m1"]);
    engine.run_iteration_at(at(-60)).await;
    complete_set(&exchange, &engine, "m1").await;

    let engine = Arc::new(engine);
    let state = AppState::new(engine.clone());
    state.set_ready(true);

    let response = create_router(state.clone())
        .oneshot(Request::builder().uri("/api/v1/positions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let positions: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(positions[0]["market_id"], "m1");
    assert_eq!(positions[0]["state"], "complete");

    exchange.resolve(&id("m1"), Side::Yes);
    engine.run_iteration_at(at(0)).await;

    let response = create_router(state)
        .oneshot(Request::builder().uri("/api/v1/pnl").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let pnl: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(pnl["redeemed"], 1);
    assert_eq!(pnl["realized_pnl"], "1.00");
}
