// =============================================================================
// Broker seam — price feed and order execution contracts
// =============================================================================
//
// The engine never talks to a broker wire format directly. It consumes these
// two traits; the host supplies real implementations (REST client, websocket
// feed) or the paper ones in `sim` for tests and dry runs.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;

use crate::types::OrderSide;

/// Acknowledgement of a resting order (the protective stop).
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

/// A confirmed exit fill.
#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub fill_price: f64,
}

/// Supplies the last traded price for a symbol on demand.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Zero, negative, or `Err` all mean "no data this tick"; the caller
    /// skips the tick and retries on the next interval.
    async fn last_price(&self, symbol: &str) -> Result<f64>;
}

/// Accepts exit and protective orders for the managed position.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Rest a stop order at `trigger_price` as a broker-side safety net.
    async fn place_protective_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<OrderAck>;

    /// Close the position at market.
    async fn place_market_exit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        tag: &str,
    ) -> Result<Fill>;

    /// Close the position with an immediate-or-cancel limit (used for the
    /// spike best-price exit).
    async fn place_limit_exit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        limit_price: f64,
        tag: &str,
    ) -> Result<Fill>;

    /// Cancel a resting order. `Ok(false)` means the broker refused.
    async fn cancel(&self, order_id: &str) -> Result<bool>;
}
