// =============================================================================
// TSL Sentinel — Main Entry Point
// =============================================================================
//
// Runs a paper-trading demonstration session: a scripted price tape drives
// the phase-wise trailing-stop engine against the paper executor, so the
// whole management loop can be watched end to end without broker credentials.
// Hosts embedding the engine supply real `PriceSource` / `OrderExecutor`
// implementations instead.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod atr;
mod broker;
mod config;
mod engine;
mod history;
mod phase;
mod position;
mod sim;
mod spike;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::TslConfig;
use crate::engine::TslEngine;
use crate::position::Position;
use crate::types::TradeDirection;

const CONFIG_PATH: &str = "tsl_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        TSL Sentinel — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = TslConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        TslConfig::default()
    });
    if let Err(e) = config.save(CONFIG_PATH) {
        warn!(error = %e, "Failed to persist config");
    }

    info!(
        phase1_max_trail = config.phase1_max_trail,
        spike_window_secs = config.phase2_spike_window,
        atr_period = config.phase3_atr_period,
        poll_interval_secs = config.poll_interval_secs,
        "TSL parameters"
    );

    // ── 2. Paper wiring ──────────────────────────────────────────────────
    // A gentle ramp, a quiet stretch that triggers the ATR switch, then a
    // spike that ends the session at the best price.
    let tape = vec![
        100.0, 100.2, 100.5, 100.9, 101.2, 101.5, 101.6, 101.5, 101.6, 101.5,
        101.6, 101.5, 101.6, 101.5, 101.6, 101.5, 101.6, 101.5, 105.9,
    ];
    let (source, executor) = sim::wired(tape);

    // ── 3. Management session ────────────────────────────────────────────
    let engine = Arc::new(TslEngine::new(source, Arc::clone(&executor) as _, config));
    let position = Position::new("NIFTY25JAN20000CE", 50.0, 100.0, TradeDirection::Ce);

    match engine.start(position).await {
        Ok(true) => info!("Management session started"),
        Ok(false) => {
            warn!("Engine already managing a position");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Refusing to start");
            return Err(e.into());
        }
    }

    // Ctrl+C requests a manual exit; otherwise the tape runs to its trigger.
    let stopper = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received — exiting position");
            stopper.stop();
        }
    });

    engine.wait().await;

    // ── 4. Session summary ───────────────────────────────────────────────
    let status = engine.status();
    if let Some(fatal) = &status.fatal {
        error!(fatal = %fatal, "Session ended abnormally — position may still be live");
    } else {
        info!(
            reason = status.last_exit_reason.as_deref().unwrap_or("-"),
            pnl = format!("{:.2}", status.realized_pnl.unwrap_or(0.0)),
            highest = format!("{:.2}", status.highest_price),
            final_tsl = format!("{:.2}", status.tsl),
            "Session complete"
        );
        for order in executor.orders() {
            info!(
                id = %order.id,
                kind = ?order.kind,
                side = %order.side,
                qty = order.qty,
                price = ?order.price,
                tag = %order.tag,
                "order"
            );
        }
    }

    info!("TSL Sentinel shut down complete.");
    Ok(())
}
