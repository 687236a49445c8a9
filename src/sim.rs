// =============================================================================
// Paper trading doubles — scripted price feed and recording executor
// =============================================================================
//
// Stand-ins for the broker seam: the scripted source replays a fixed tape of
// prices (repeating the final one once exhausted), and the paper executor
// fills every order locally while recording it for inspection. Failure
// toggles let tests exercise the escalation paths (limit exit rejected,
// market fallback rejected, cancel refused).
//
// The pair is linked through a shared mark: market exits fill at the last
// price the source served, limit exits fill at their limit price.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::broker::{Fill, OrderAck, OrderExecutor, PriceSource};
use crate::types::OrderSide;

// ---------------------------------------------------------------------------
// Scripted price source
// ---------------------------------------------------------------------------

/// Replays a fixed price tape, one sample per fetch.
pub struct ScriptedPriceSource {
    script: Mutex<ScriptState>,
    mark: Arc<RwLock<f64>>,
}

struct ScriptState {
    prices: Vec<f64>,
    index: usize,
}

impl ScriptedPriceSource {
    pub fn new(prices: Vec<f64>) -> Self {
        Self {
            script: Mutex::new(ScriptState { prices, index: 0 }),
            mark: Arc::new(RwLock::new(0.0)),
        }
    }

    /// Shared last-served price, used by `PaperExecutor` to fill market
    /// orders.
    pub fn mark(&self) -> Arc<RwLock<f64>> {
        Arc::clone(&self.mark)
    }
}

#[async_trait]
impl PriceSource for ScriptedPriceSource {
    async fn last_price(&self, _symbol: &str) -> Result<f64> {
        let price = {
            let mut state = self.script.lock();
            let price = match state.prices.get(state.index) {
                Some(p) => *p,
                None => match state.prices.last() {
                    Some(p) => *p,
                    None => bail!("price tape is empty"),
                },
            };
            state.index += 1;
            price
        };

        if price > 0.0 {
            *self.mark.write() = price;
        }
        Ok(price)
    }
}

// ---------------------------------------------------------------------------
// Paper executor
// ---------------------------------------------------------------------------

/// What kind of order the paper executor recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperOrderKind {
    ProtectiveStop,
    MarketExit,
    LimitExit,
}

/// One order as the paper executor saw it.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub id: String,
    pub kind: PaperOrderKind,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    /// Trigger price for stops, limit price for limits, `None` for market.
    pub price: Option<f64>,
    pub tag: String,
}

/// Records every order and fills exits locally. All failure toggles default
/// to off.
pub struct PaperExecutor {
    orders: Mutex<Vec<PaperOrder>>,
    cancelled: Mutex<Vec<String>>,
    mark: Arc<RwLock<f64>>,
    next_id: AtomicU64,
    fail_protective_stop: AtomicBool,
    fail_limit: AtomicBool,
    fail_market: AtomicBool,
    fail_cancel: AtomicBool,
}

impl PaperExecutor {
    /// Create an executor that fills market orders at `mark`.
    pub fn new(mark: Arc<RwLock<f64>>) -> Self {
        Self {
            orders: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            mark,
            next_id: AtomicU64::new(1),
            fail_protective_stop: AtomicBool::new(false),
            fail_limit: AtomicBool::new(false),
            fail_market: AtomicBool::new(false),
            fail_cancel: AtomicBool::new(false),
        }
    }

    pub fn set_fail_protective_stop(&self, fail: bool) {
        self.fail_protective_stop.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_limit(&self, fail: bool) {
        self.fail_limit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_market(&self, fail: bool) {
        self.fail_market.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    /// Every order recorded so far, in placement order.
    pub fn orders(&self) -> Vec<PaperOrder> {
        self.orders.lock().clone()
    }

    /// Order ids that were successfully cancelled.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    fn record(
        &self,
        kind: PaperOrderKind,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: Option<f64>,
        tag: &str,
    ) -> String {
        let id = format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let order = PaperOrder {
            id: id.clone(),
            kind,
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            tag: tag.to_string(),
        };
        debug!(id = %id, ?kind, symbol, %side, qty, ?price, tag, "paper order recorded");
        self.orders.lock().push(order);
        id
    }
}

/// A paper executor wired to a scripted source, sharing one mark.
pub fn wired(script: Vec<f64>) -> (Arc<ScriptedPriceSource>, Arc<PaperExecutor>) {
    let source = Arc::new(ScriptedPriceSource::new(script));
    let executor = Arc::new(PaperExecutor::new(source.mark()));
    (source, executor)
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn place_protective_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        if self.fail_protective_stop.load(Ordering::SeqCst) {
            bail!("paper broker rejected protective stop");
        }
        let id = self.record(
            PaperOrderKind::ProtectiveStop,
            symbol,
            side,
            qty,
            Some(trigger_price),
            "PROTECTIVE_SL",
        );
        Ok(OrderAck { order_id: id })
    }

    async fn place_market_exit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        tag: &str,
    ) -> Result<Fill> {
        if self.fail_market.load(Ordering::SeqCst) {
            bail!("paper broker rejected market order");
        }
        self.record(PaperOrderKind::MarketExit, symbol, side, qty, None, tag);
        let fill_price = *self.mark.read();
        info!(symbol, %side, qty, fill_price, tag, "paper market fill");
        Ok(Fill { fill_price })
    }

    async fn place_limit_exit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        limit_price: f64,
        tag: &str,
    ) -> Result<Fill> {
        if self.fail_limit.load(Ordering::SeqCst) {
            bail!("paper broker rejected limit order");
        }
        self.record(
            PaperOrderKind::LimitExit,
            symbol,
            side,
            qty,
            Some(limit_price),
            tag,
        );
        info!(symbol, %side, qty, limit_price, tag, "paper limit fill");
        Ok(Fill {
            fill_price: limit_price,
        })
    }

    async fn cancel(&self, order_id: &str) -> Result<bool> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.cancelled.lock().push(order_id.to_string());
        Ok(true)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_source_replays_then_repeats_last() {
        let source = ScriptedPriceSource::new(vec![100.0, 101.0]);
        assert!((source.last_price("X").await.unwrap() - 100.0).abs() < f64::EPSILON);
        assert!((source.last_price("X").await.unwrap() - 101.0).abs() < f64::EPSILON);
        assert!((source.last_price("X").await.unwrap() - 101.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn mark_skips_bad_ticks() {
        let (source, _) = wired(vec![100.0, -1.0, 0.0]);
        let mark = source.mark();
        let _ = source.last_price("X").await.unwrap();
        let _ = source.last_price("X").await.unwrap();
        let _ = source.last_price("X").await.unwrap();
        assert!((*mark.read() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn market_exit_fills_at_mark() {
        let (source, executor) = wired(vec![102.5]);
        let _ = source.last_price("X").await.unwrap();
        let fill = executor
            .place_market_exit("X", OrderSide::Sell, 1.0, "EXIT_TEST")
            .await
            .unwrap();
        assert!((fill.fill_price - 102.5).abs() < f64::EPSILON);
        assert_eq!(executor.orders().len(), 1);
        assert_eq!(executor.orders()[0].kind, PaperOrderKind::MarketExit);
    }

    #[tokio::test]
    async fn failure_toggles_reject_orders() {
        let (_, executor) = wired(vec![100.0]);
        executor.set_fail_limit(true);
        executor.set_fail_market(true);
        assert!(executor
            .place_limit_exit("X", OrderSide::Sell, 1.0, 99.0, "T")
            .await
            .is_err());
        assert!(executor
            .place_market_exit("X", OrderSide::Sell, 1.0, "T")
            .await
            .is_err());
        assert!(executor.orders().is_empty());
    }

    #[tokio::test]
    async fn cancel_refusal_returns_false() {
        let (_, executor) = wired(vec![100.0]);
        executor.set_fail_cancel(true);
        assert!(!executor.cancel("PAPER-1").await.unwrap());
        executor.set_fail_cancel(false);
        assert!(executor.cancel("PAPER-1").await.unwrap());
        assert_eq!(executor.cancelled(), vec!["PAPER-1".to_string()]);
    }
}
