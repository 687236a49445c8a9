// =============================================================================
// TSL Engine — poll loop and exit orchestration for one position
// =============================================================================
//
// One engine instance manages at most one position; hosts running several
// positions run one independent engine each, with no shared mutable state
// between them.
//
// The management loop runs as a background Tokio task, waking every poll
// interval to:
//   1. Fetch the last traded price (bad ticks are skipped, never fatal).
//   2. Record the sample and update the running high.
//   3. Recompute the trailing stop through the phase tracker.
//   4. Evaluate exit triggers in priority order: spike, stop hit, profit
//      target, emergency loss, hold-time cap.
//   5. On a trigger: best-effort cancel of the protective stop, one exit
//      attempt, P&L report, release.
//
// A failed limit exit retries as market; a failed market exit is fatal — the
// session surfaces "unable to exit" and the position stays marked active
// rather than silently resuming the trail.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{OrderExecutor, PriceSource};
use crate::config::TslConfig;
use crate::history::{PriceHistory, DEFAULT_CAPACITY};
use crate::phase::PhaseTracker;
use crate::position::Position;
use crate::spike::detect_spike;
use crate::types::{ExitReason, Phase};

/// Fraction of the highest seen price used for the spike limit exit, set
/// slightly below the high to ensure an immediate fill.
const SPIKE_LIMIT_DISCOUNT: f64 = 0.995;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration failed validation; nothing was started and no order
    /// was placed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Status surface
// ---------------------------------------------------------------------------

/// Snapshot of the managed session for the host's dashboard. Refreshed once
/// per tick and finalised on exit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub active: bool,
    pub symbol: Option<String>,
    pub phase: Option<Phase>,
    pub tsl: f64,
    pub trail_level: u32,
    pub entry_price: f64,
    pub current_price: f64,
    pub highest_price: f64,
    pub atr: Option<f64>,
    /// Reason code of the exit that ended the session, if it has ended.
    pub last_exit_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    /// Set when the session could not exit the position; the position is
    /// still live at the broker and needs host intervention.
    pub fatal: Option<String>,
}

struct EngineShared {
    /// True from a successful `start()` until the session releases the
    /// position. Stays true after a fatal exit failure so the stuck position
    /// cannot be silently replaced.
    managing: AtomicBool,
    stop_requested: AtomicBool,
    status: RwLock<EngineStatus>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Phase-wise trailing-stop engine for a single position.
pub struct TslEngine {
    prices: Arc<dyn PriceSource>,
    executor: Arc<dyn OrderExecutor>,
    config: TslConfig,
    shared: Arc<EngineShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TslEngine {
    pub fn new(
        prices: Arc<dyn PriceSource>,
        executor: Arc<dyn OrderExecutor>,
        config: TslConfig,
    ) -> Self {
        Self {
            prices,
            executor,
            config,
            shared: Arc::new(EngineShared {
                managing: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                status: RwLock::new(EngineStatus::default()),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Begin managing `position`.
    ///
    /// Returns `Err` if the configuration is invalid (checked before any
    /// order is placed) and `Ok(false)` if a position is already under
    /// management. On `Ok(true)` a protective stop has been requested
    /// (best effort) and the poll loop is running.
    pub async fn start(&self, position: Position) -> Result<bool, EngineError> {
        self.config
            .validate()
            .map_err(EngineError::InvalidConfig)?;

        if self
            .shared
            .managing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(symbol = %position.symbol, "already managing a position");
            return Ok(false);
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        info!(
            id = %position.id,
            symbol = %position.symbol,
            entry = format!("{:.2}", position.entry_price),
            qty = position.qty,
            direction = %position.direction,
            tsl = format!("{:.2}", position.tsl),
            "phase-wise TSL management started"
        );

        // Broker-side safety net. The software trail is the mechanism of
        // correctness, so a rejection here is logged and the session runs on.
        let trigger = position.entry_price * (1.0 - self.config.protective_stop_epsilon);
        let sl_order_id = match self
            .executor
            .place_protective_stop(
                &position.symbol,
                position.direction.exit_side(),
                position.qty,
                trigger,
            )
            .await
        {
            Ok(ack) => {
                info!(order_id = %ack.order_id, trigger = format!("{:.2}", trigger), "protective stop placed");
                Some(ack.order_id)
            }
            Err(e) => {
                warn!(error = %e, "protective stop rejected — continuing on software trail");
                None
            }
        };

        let started = Instant::now();
        let mut session = Session {
            prices: Arc::clone(&self.prices),
            executor: Arc::clone(&self.executor),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            history: PriceHistory::with_capacity(
                DEFAULT_CAPACITY
                    .max(self.config.phase3_atr_period + 1)
                    .max(self.config.phase2_min_spike_points),
            ),
            tracker: PhaseTracker::new(0.0),
            position,
            sl_order_id,
            started,
        };
        session.publish_status();

        *self.handle.lock() = Some(tokio::spawn(async move {
            session.run().await;
        }));

        Ok(true)
    }

    /// Request cancellation. Safe to call from any task; the loop observes
    /// the request within one poll interval and exits the position at market
    /// with reason `MANUAL_EXIT`.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Current session snapshot for display.
    pub fn status(&self) -> EngineStatus {
        self.shared.status.read().clone()
    }

    /// Wait for the running session, if any, to finish.
    pub async fn wait(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Session — state owned by the poll-loop task
// ---------------------------------------------------------------------------

struct Session {
    prices: Arc<dyn PriceSource>,
    executor: Arc<dyn OrderExecutor>,
    config: TslConfig,
    shared: Arc<EngineShared>,
    history: PriceHistory,
    tracker: PhaseTracker,
    position: Position,
    sl_order_id: Option<String>,
    started: Instant,
}

impl Session {
    async fn run(&mut self) {
        let mut ticker = interval(Duration::from_secs_f64(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ended_clean = loop {
            ticker.tick().await;

            if self.shared.stop_requested.load(Ordering::SeqCst) {
                info!(id = %self.position.id, "stop requested — exiting at market");
                break self.exit_at_market(ExitReason::ManualExit).await;
            }

            let now = self.started.elapsed().as_secs_f64();

            let price = match self.prices.last_price(&self.position.symbol).await {
                Ok(p) if p > 0.0 => p,
                Ok(p) => {
                    warn!(price = p, "invalid price — skipping tick");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "price fetch failed — skipping tick");
                    continue;
                }
            };

            self.position.update_price(price);
            self.history.record(price, now, self.tracker.phase());
            self.tracker
                .recompute(&mut self.position, &self.history, &self.config, now);
            self.publish_status();

            // ── 1. Spike (any phase, highest priority) ──────────────────
            let check = detect_spike(&self.history, &self.config, now);
            if check.is_spike {
                info!(
                    id = %self.position.id,
                    last_change = format!("{:.2}", check.last_change),
                    avg_change = format!("{:.2}", check.avg_change),
                    phase = %self.tracker.phase(),
                    "SPIKE DETECTED — exiting at best price"
                );
                break self.exit_at_highest().await;
            }

            // ── 2. Trailing stop hit ────────────────────────────────────
            // Strictly below: a flat open sitting exactly at the entry-level
            // stop is not an exit.
            if price < self.position.tsl {
                warn!(
                    id = %self.position.id,
                    price = format!("{:.2}", price),
                    tsl = format!("{:.2}", self.position.tsl),
                    "TSL HIT — closing position"
                );
                break self.exit_at_market(ExitReason::TslHit).await;
            }

            let (_, profit_pct) = self.position.profit_loss(price);

            // ── 3. Profit target ────────────────────────────────────────
            if profit_pct >= self.config.profit_target {
                info!(
                    id = %self.position.id,
                    profit_pct = format!("{:.2}", profit_pct),
                    "profit target hit"
                );
                break self.exit_at_market(ExitReason::ProfitTarget).await;
            }

            // ── 4. Emergency loss ───────────────────────────────────────
            if -profit_pct >= self.config.emergency_exit_threshold {
                error!(
                    id = %self.position.id,
                    loss_pct = format!("{:.2}", -profit_pct),
                    "EMERGENCY exit threshold breached"
                );
                break self.exit_at_market(ExitReason::Emergency).await;
            }

            // ── 5. Hold-time cap ────────────────────────────────────────
            if now > self.config.max_hold_time {
                warn!(
                    id = %self.position.id,
                    held_secs = format!("{:.0}", now),
                    "max hold time reached"
                );
                break self.exit_at_market(ExitReason::TimeExit).await;
            }

            debug!(
                id = %self.position.id,
                price = format!("{:.2}", price),
                tsl = format!("{:.2}", self.position.tsl),
                phase = %self.tracker.phase(),
                "tick evaluated — no trigger"
            );
        };

        if ended_clean {
            self.shared.managing.store(false, Ordering::SeqCst);
        }
    }

    // -------------------------------------------------------------------------
    // Exit paths
    // -------------------------------------------------------------------------

    /// Spike exit: limit order slightly below the highest seen price, with a
    /// market fallback if the broker rejects the limit.
    async fn exit_at_highest(&mut self) -> bool {
        let reason = ExitReason::SpikeExit(self.tracker.phase());
        self.cancel_protective_stop().await;

        let limit_price = self.position.highest_price * SPIKE_LIMIT_DISCOUNT;
        let tag = reason.to_string();

        match self
            .executor
            .place_limit_exit(
                &self.position.symbol,
                self.position.direction.exit_side(),
                self.position.qty,
                limit_price,
                &tag,
            )
            .await
        {
            Ok(fill) => {
                self.cleanup(fill.fill_price, reason);
                true
            }
            Err(e) => {
                warn!(error = %e, "limit exit rejected — falling back to market");
                self.place_market_and_settle(reason).await
            }
        }
    }

    /// Plain market exit for every non-spike trigger.
    async fn exit_at_market(&mut self, reason: ExitReason) -> bool {
        self.cancel_protective_stop().await;
        self.place_market_and_settle(reason).await
    }

    /// One market attempt; on rejection the session is fatal — the position
    /// stays marked active and the trail never resumes.
    async fn place_market_and_settle(&mut self, reason: ExitReason) -> bool {
        let tag = format!("EXIT_{reason}");
        match self
            .executor
            .place_market_exit(
                &self.position.symbol,
                self.position.direction.exit_side(),
                self.position.qty,
                &tag,
            )
            .await
        {
            Ok(fill) => {
                self.cleanup(fill.fill_price, reason);
                true
            }
            Err(e) => {
                let detail = format!("unable to exit {} ({reason}): {e}", self.position.symbol);
                error!(id = %self.position.id, "{detail}");
                let mut status = self.shared.status.write();
                status.fatal = Some(detail);
                false
            }
        }
    }

    /// Best-effort cancel of the broker-side protective stop. A refusal is
    /// logged and never blocks the exit.
    async fn cancel_protective_stop(&mut self) {
        let Some(order_id) = self.sl_order_id.take() else {
            return;
        };
        match self.executor.cancel(&order_id).await {
            Ok(true) => debug!(order_id = %order_id, "protective stop cancelled"),
            Ok(false) => warn!(order_id = %order_id, "protective stop cancel refused — exiting anyway"),
            Err(e) => warn!(order_id = %order_id, error = %e, "protective stop cancel failed — exiting anyway"),
        }
    }

    /// Confirmed fill: mark the position inactive, report P&L, release.
    fn cleanup(&mut self, fill_price: f64, reason: ExitReason) {
        let (pnl, pnl_pct) = self.position.profit_loss(fill_price);
        let held = self.started.elapsed().as_secs_f64();

        self.position.is_active = false;

        info!(
            id = %self.position.id,
            symbol = %self.position.symbol,
            reason = %reason,
            entry = format!("{:.2}", self.position.entry_price),
            exit = format!("{:.2}", fill_price),
            highest = format!("{:.2}", self.position.highest_price),
            pnl = format!("{:.2}", pnl),
            pnl_pct = format!("{:+.2}", pnl_pct),
            max_profit = format!("{:.2}", self.position.max_profit),
            max_drawdown = format!("{:.2}", self.position.max_drawdown),
            held_secs = format!("{:.1}", held),
            phase = %self.tracker.phase(),
            trail_level = self.position.trail_level,
            "position exited"
        );

        let mut status = self.shared.status.write();
        status.active = false;
        status.current_price = fill_price;
        status.last_exit_reason = Some(reason.to_string());
        status.realized_pnl = Some(pnl);
    }

    fn publish_status(&self) {
        let mut status = self.shared.status.write();
        *status = EngineStatus {
            active: self.position.is_active,
            symbol: Some(self.position.symbol.clone()),
            phase: Some(self.tracker.phase()),
            tsl: self.position.tsl,
            trail_level: self.position.trail_level,
            entry_price: self.position.entry_price,
            current_price: self.position.current_price,
            highest_price: self.position.highest_price,
            atr: self.tracker.atr(),
            last_exit_reason: None,
            realized_pnl: None,
            fatal: None,
        };
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{wired, PaperOrderKind};
    use crate::types::TradeDirection;

    fn position() -> Position {
        Position::new("NIFTY25JAN20000CE", 1.0, 100.0, TradeDirection::Ce)
    }

    fn engine_with(script: Vec<f64>, config: TslConfig) -> (TslEngine, Arc<crate::sim::PaperExecutor>) {
        let (source, executor) = wired(script);
        let engine = TslEngine::new(source, Arc::clone(&executor) as _, config);
        (engine, executor)
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let cfg = TslConfig {
            phase1_max_trail: 0,
            ..TslConfig::default()
        };
        let (engine, executor) = engine_with(vec![100.0], cfg);
        let result = engine.start(position()).await;
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
        // Fail fast: nothing may reach the broker.
        assert!(executor.orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_reports_already_managing() {
        let (engine, _) = engine_with(vec![100.0], TslConfig::default());
        assert!(engine.start(position()).await.unwrap());
        assert!(!engine.start(position()).await.unwrap());
        engine.stop();
        engine.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_triggers_manual_exit() {
        let (engine, executor) = engine_with(vec![100.0, 100.1], TslConfig::default());
        assert!(engine.start(position()).await.unwrap());

        tokio::time::sleep(Duration::from_secs(3)).await;
        engine.stop();
        engine.wait().await;

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(status.last_exit_reason.as_deref(), Some("MANUAL_EXIT"));
        let orders = executor.orders();
        assert_eq!(orders.last().unwrap().kind, PaperOrderKind::MarketExit);
        assert_eq!(orders.last().unwrap().tag, "EXIT_MANUAL_EXIT");
    }

    #[tokio::test(start_paused = true)]
    async fn spike_exits_with_limit_near_high() {
        let script = vec![100.0, 100.1, 100.2, 100.3, 103.5];
        let (engine, executor) = engine_with(script, TslConfig::default());
        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(
            status.last_exit_reason.as_deref(),
            Some("SPIKE_EXIT_MICRO")
        );

        let orders = executor.orders();
        let exit = orders.last().unwrap();
        assert_eq!(exit.kind, PaperOrderKind::LimitExit, "spike exit must be a limit, not market");
        let want_limit = 103.5 * SPIKE_LIMIT_DISCOUNT;
        assert!((exit.price.unwrap() - want_limit).abs() < 1e-9);
        assert_eq!(exit.tag, "SPIKE_EXIT_MICRO");

        let pnl = status.realized_pnl.unwrap();
        assert!((pnl - (want_limit - 100.0)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn tsl_hit_exits_at_market() {
        let cfg = TslConfig {
            profit_target: 50.0,
            ..TslConfig::default()
        };
        let script = vec![100.0, 101.0, 102.0, 103.0, 101.9];
        let (engine, executor) = engine_with(script, cfg);
        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(status.last_exit_reason.as_deref(), Some("TSL_HIT"));
        assert!((status.tsl - 102.0).abs() < 1e-9);

        let orders = executor.orders();
        assert_eq!(orders[0].kind, PaperOrderKind::ProtectiveStop);
        let exit = orders.last().unwrap();
        assert_eq!(exit.kind, PaperOrderKind::MarketExit);
        assert_eq!(exit.tag, "EXIT_TSL_HIT");
        // Protective stop cancelled before the exit went out.
        assert_eq!(executor.cancelled(), vec![orders[0].id.clone()]);
        // Market fill at the last served price.
        assert!((status.realized_pnl.unwrap() - 1.9).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn double_exit_failure_is_fatal_and_keeps_position_active() {
        let script = vec![100.0, 100.1, 100.2, 100.3, 103.5];
        let (engine, executor) = engine_with(script, TslConfig::default());
        executor.set_fail_limit(true);
        executor.set_fail_market(true);

        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert!(status.active, "an unexitable position must stay active");
        assert!(status.fatal.is_some());
        assert!(status.fatal.unwrap().contains("unable to exit"));
        assert!(status.last_exit_reason.is_none());

        // The stuck position cannot be silently replaced.
        assert!(!engine.start(position()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn bad_ticks_are_skipped_not_fatal() {
        let script = vec![100.0, -1.0, 101.0, 102.5];
        let (engine, executor) = engine_with(script, TslConfig::default());
        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(status.last_exit_reason.as_deref(), Some("PROFIT_TARGET"));
        assert!((status.realized_pnl.unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(executor.orders().last().unwrap().tag, "EXIT_PROFIT_TARGET");
    }

    #[tokio::test(start_paused = true)]
    async fn time_exit_after_max_hold() {
        let cfg = TslConfig {
            max_hold_time: 3.5,
            ..TslConfig::default()
        };
        let (engine, _) = engine_with(vec![100.0], cfg);
        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(status.last_exit_reason.as_deref(), Some("TIME_EXIT"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_refusal_does_not_block_exit() {
        let cfg = TslConfig {
            profit_target: 50.0,
            ..TslConfig::default()
        };
        let script = vec![100.0, 101.0, 102.0, 103.0, 101.9];
        let (engine, executor) = engine_with(script, cfg);
        executor.set_fail_cancel(true);

        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(status.last_exit_reason.as_deref(), Some("TSL_HIT"));
        assert!(executor.cancelled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn protective_stop_rejection_still_manages() {
        let script = vec![100.0, 101.0, 102.5];
        let (engine, executor) = engine_with(script, TslConfig::default());
        executor.set_fail_protective_stop(true);

        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(status.last_exit_reason.as_deref(), Some("PROFIT_TARGET"));
        // No stop was resting, so nothing was cancelled.
        assert!(executor.cancelled().is_empty());
        assert!(executor
            .orders()
            .iter()
            .all(|o| o.kind != PaperOrderKind::ProtectiveStop));
    }

    #[tokio::test(start_paused = true)]
    async fn phase_switch_observable_end_to_end() {
        let cfg = TslConfig {
            min_phase1_duration: 5.0,
            max_hold_time: 8.5,
            profit_target: 50.0,
            ..TslConfig::default()
        };
        let script: Vec<f64> = (0..12)
            .map(|i| if i % 2 == 0 { 100.10 } else { 100.15 })
            .collect();
        let (engine, _) = engine_with(script, cfg);
        assert!(engine.start(position()).await.unwrap());
        engine.wait().await;

        let status = engine.status();
        assert_eq!(status.phase, Some(Phase::Atr));
        assert_eq!(status.last_exit_reason.as_deref(), Some("TIME_EXIT"));
    }
}
