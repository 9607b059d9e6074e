// =============================================================================
// Venue Adapter - the outbound interface the core consumes
// =============================================================================
//
// Real adapters (REST/WS clients with signing, throttling, precision rules)
// are provided externally and injected as opaque handles. The core only ever
// sees this trait.
//
// PaperVenue is the in-process implementation: a deterministic fill simulator
// with a configurable per-symbol fill plan. It backs demo operation and the
// execution/orchestrator test suites.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Acknowledgement returned by a venue when an order is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub client_order_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Terminality of an order as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Point-in-time order status from venue history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub state: OrderState,
    pub target_notional_usd: f64,
    pub filled_notional_usd: f64,
}

impl OrderStatus {
    pub fn is_fully_filled(&self) -> bool {
        self.state == OrderState::Filled
    }
}

/// A net position held at a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    pub notional_usd: f64,
}

/// Account balance at a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueBalance {
    pub available_usd: f64,
    pub total_usd: f64,
}

/// Ancillary per-symbol market data a venue can supply (open interest,
/// top-of-book, and native funding for venue-only mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueMarketInfo {
    /// Native funding rate already normalized to the 8 h basis, when known.
    pub rate_8h: Option<f64>,
    pub interval_hours: Option<u32>,
    pub open_interest_usd: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Capability interface for one perpetual-futures venue.
///
/// All notionals are USD; quantity/precision conversion is the adapter's
/// concern. `client_order_id` doubles as the idempotency key: submitting an
/// order whose id is already in venue history must not create a second order.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue_id(&self) -> &str;

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        notional_usd: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, EngineError>;

    async fn cancel(&self, client_order_id: &str) -> Result<(), EngineError>;

    async fn positions(&self) -> Result<Vec<VenuePosition>, EngineError>;

    async fn balance(&self) -> Result<VenueBalance, EngineError>;

    /// `None` when the id is absent from venue order history.
    async fn order_status(&self, client_order_id: &str)
        -> Result<Option<OrderStatus>, EngineError>;

    /// Ancillary market data. Venues without this capability return a
    /// data-quality error; callers degrade to configured defaults.
    async fn market_info(&self, symbol: &str) -> Result<VenueMarketInfo, EngineError> {
        Err(EngineError::DataQuality(format!(
            "venue {} has no market-info capability for {symbol}",
            self.venue_id()
        )))
    }
}

// ---------------------------------------------------------------------------
// Paper venue
// ---------------------------------------------------------------------------

/// How the simulator resolves an incoming order for a given symbol.
#[derive(Debug, Clone)]
pub enum FillBehavior {
    /// Fill the full notional immediately.
    Immediate,
    /// Fill only this fraction of the notional, then sit partially filled.
    Partial(f64),
    /// Leave the order resting unfilled.
    NoFill,
    /// Logical reject (e.g. symbol not tradable).
    Reject(String),
    /// Fill the first order on the symbol, reject every later one. Models a
    /// market halting right after entry.
    FillOnceThenReject(String),
}

struct PaperOrder {
    status: OrderStatus,
    venue_order_id: String,
    accepted_at: DateTime<Utc>,
}

struct Inner {
    balance_usd: f64,
    /// client_order_id -> order, in insertion-stable sorted order.
    orders: BTreeMap<String, PaperOrder>,
    fill_plan: HashMap<String, FillBehavior>,
    market_info: HashMap<String, VenueMarketInfo>,
    order_seq: u64,
}

/// Deterministic in-process venue simulator.
pub struct PaperVenue {
    venue: String,
    inner: RwLock<Inner>,
}

impl PaperVenue {
    pub fn new(venue: impl Into<String>, balance_usd: f64) -> Self {
        Self {
            venue: venue.into(),
            inner: RwLock::new(Inner {
                balance_usd,
                orders: BTreeMap::new(),
                fill_plan: HashMap::new(),
                market_info: HashMap::new(),
                order_seq: 0,
            }),
        }
    }

    /// Override how orders on `symbol` resolve. Default is `Immediate`.
    pub fn set_fill_behavior(&self, symbol: impl Into<String>, behavior: FillBehavior) {
        self.inner.write().fill_plan.insert(symbol.into(), behavior);
    }

    pub fn set_balance(&self, balance_usd: f64) {
        self.inner.write().balance_usd = balance_usd;
    }

    /// Publish ancillary market data for `symbol` (consumed by hybrid and
    /// venue-only market-data modes).
    pub fn set_market_info(&self, symbol: impl Into<String>, info: VenueMarketInfo) {
        self.inner.write().market_info.insert(symbol.into(), info);
    }

    /// Complete a resting or partial order, as if the venue filled it late.
    pub fn force_fill(&self, client_order_id: &str) {
        let mut inner = self.inner.write();
        if let Some(order) = inner.orders.get_mut(client_order_id) {
            order.status.filled_notional_usd = order.status.target_notional_usd;
            order.status.state = OrderState::Filled;
        }
    }

    /// Directly seed a filled order, bypassing the fill plan. Used to model
    /// state left behind by a previous process run.
    pub fn seed_filled_order(
        &self,
        symbol: &str,
        side: Side,
        notional_usd: f64,
        client_order_id: &str,
    ) {
        let mut inner = self.inner.write();
        inner.order_seq += 1;
        let venue_order_id = format!("{}-seed-{}", self.venue, inner.order_seq);
        inner.orders.insert(
            client_order_id.to_string(),
            PaperOrder {
                status: OrderStatus {
                    client_order_id: client_order_id.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    state: OrderState::Filled,
                    target_notional_usd: notional_usd,
                    filled_notional_usd: notional_usd,
                },
                venue_order_id,
                accepted_at: Utc::now(),
            },
        );
    }

    pub fn order_count(&self) -> usize {
        self.inner.read().orders.len()
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn venue_id(&self) -> &str {
        &self.venue
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        notional_usd: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, EngineError> {
        let mut inner = self.inner.write();

        // Venue history makes resubmission a no-op.
        if let Some(existing) = inner.orders.get(client_order_id) {
            debug!(
                venue = %self.venue,
                client_order_id,
                "duplicate client order id - returning existing ack"
            );
            return Ok(OrderAck {
                venue_order_id: existing.venue_order_id.clone(),
                client_order_id: client_order_id.to_string(),
                accepted_at: existing.accepted_at,
            });
        }

        let behavior = inner
            .fill_plan
            .get(symbol)
            .cloned()
            .unwrap_or(FillBehavior::Immediate);

        let prior_on_symbol = inner
            .orders
            .values()
            .any(|o| o.status.symbol == symbol);

        let reject_reason = match &behavior {
            FillBehavior::Reject(reason) => Some(reason.clone()),
            FillBehavior::FillOnceThenReject(reason) if prior_on_symbol => Some(reason.clone()),
            _ => None,
        };
        if let Some(reason) = reject_reason {
            warn!(venue = %self.venue, symbol, reason = %reason, "paper order rejected");
            return Err(EngineError::OrderRejected {
                venue: self.venue.clone(),
                reason,
            });
        }

        let (state, filled) = match behavior {
            FillBehavior::Immediate | FillBehavior::FillOnceThenReject(_) => {
                (OrderState::Filled, notional_usd)
            }
            FillBehavior::Partial(fraction) => (
                OrderState::PartiallyFilled,
                notional_usd * fraction.clamp(0.0, 1.0),
            ),
            FillBehavior::NoFill => (OrderState::New, 0.0),
            FillBehavior::Reject(_) => unreachable!("handled above"),
        };

        inner.order_seq += 1;
        let venue_order_id = format!("{}-{}", self.venue, inner.order_seq);
        let accepted_at = Utc::now();

        inner.orders.insert(
            client_order_id.to_string(),
            PaperOrder {
                status: OrderStatus {
                    client_order_id: client_order_id.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    state,
                    target_notional_usd: notional_usd,
                    filled_notional_usd: filled,
                },
                venue_order_id: venue_order_id.clone(),
                accepted_at,
            },
        );

        info!(
            venue = %self.venue,
            symbol,
            side = %side,
            notional_usd,
            client_order_id,
            state = ?state,
            "paper order placed"
        );

        Ok(OrderAck {
            venue_order_id,
            client_order_id: client_order_id.to_string(),
            accepted_at,
        })
    }

    async fn cancel(&self, client_order_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        match inner.orders.get_mut(client_order_id) {
            Some(order) if order.status.state == OrderState::New => {
                order.status.state = OrderState::Canceled;
                Ok(())
            }
            Some(order) if order.status.state == OrderState::PartiallyFilled => {
                // Cancel the unfilled remainder; fills stand.
                order.status.state = OrderState::Canceled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(EngineError::OrderRejected {
                venue: self.venue.clone(),
                reason: format!("unknown order {client_order_id}"),
            }),
        }
    }

    async fn positions(&self) -> Result<Vec<VenuePosition>, EngineError> {
        let inner = self.inner.read();

        // Net filled notional per symbol: buys positive, sells negative.
        let mut net: BTreeMap<String, f64> = BTreeMap::new();
        for order in inner.orders.values() {
            let signed = match order.status.side {
                Side::Buy => order.status.filled_notional_usd,
                Side::Sell => -order.status.filled_notional_usd,
            };
            *net.entry(order.status.symbol.clone()).or_insert(0.0) += signed;
        }

        Ok(net
            .into_iter()
            .filter(|(_, notional)| notional.abs() > 1e-9)
            .map(|(symbol, notional)| VenuePosition {
                symbol,
                side: if notional > 0.0 { Side::Buy } else { Side::Sell },
                notional_usd: notional.abs(),
            })
            .collect())
    }

    async fn balance(&self) -> Result<VenueBalance, EngineError> {
        let inner = self.inner.read();
        Ok(VenueBalance {
            available_usd: inner.balance_usd,
            total_usd: inner.balance_usd,
        })
    }

    async fn order_status(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderStatus>, EngineError> {
        Ok(self
            .inner
            .read()
            .orders
            .get(client_order_id)
            .map(|o| o.status.clone()))
    }

    async fn market_info(&self, symbol: &str) -> Result<VenueMarketInfo, EngineError> {
        self.inner
            .read()
            .market_info
            .get(symbol)
            .cloned()
            .ok_or_else(|| {
                EngineError::DataQuality(format!(
                    "paper venue {} has no market info for {symbol}",
                    self.venue
                ))
            })
    }
}

impl std::fmt::Debug for PaperVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperVenue")
            .field("venue", &self.venue)
            .field("orders", &self.inner.read().orders.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_order_id_is_noop() {
        let venue = PaperVenue::new("alpha", 1000.0);
        let ack1 = venue
            .place_order("BTC/USDT:USDT", Side::Sell, 40.0, "k1")
            .await
            .unwrap();
        let ack2 = venue
            .place_order("BTC/USDT:USDT", Side::Sell, 40.0, "k1")
            .await
            .unwrap();
        assert_eq!(ack1.venue_order_id, ack2.venue_order_id);
        assert_eq!(venue.order_count(), 1);
    }

    #[tokio::test]
    async fn fills_net_into_positions() {
        let venue = PaperVenue::new("alpha", 1000.0);
        venue
            .place_order("BTC/USDT:USDT", Side::Sell, 40.0, "k1")
            .await
            .unwrap();
        venue
            .place_order("ETH/USDT:USDT", Side::Buy, 40.0, "k2")
            .await
            .unwrap();

        let positions = venue.positions().await.unwrap();
        assert_eq!(positions.len(), 2);
        let btc = positions.iter().find(|p| p.symbol.starts_with("BTC")).unwrap();
        assert_eq!(btc.side, Side::Sell);
        assert!((btc.notional_usd - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn opposite_order_flattens_position() {
        let venue = PaperVenue::new("alpha", 1000.0);
        venue
            .place_order("BTC/USDT:USDT", Side::Sell, 40.0, "open")
            .await
            .unwrap();
        venue
            .place_order("BTC/USDT:USDT", Side::Buy, 40.0, "close")
            .await
            .unwrap();
        assert!(venue.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_fill_behavior() {
        let venue = PaperVenue::new("alpha", 1000.0);
        venue.set_fill_behavior("BTC/USDT:USDT", FillBehavior::Partial(0.5));
        venue
            .place_order("BTC/USDT:USDT", Side::Sell, 40.0, "k1")
            .await
            .unwrap();

        let status = venue.order_status("k1").await.unwrap().unwrap();
        assert_eq!(status.state, OrderState::PartiallyFilled);
        assert!((status.filled_notional_usd - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reject_behavior_is_terminal_error() {
        let venue = PaperVenue::new("alpha", 1000.0);
        venue.set_fill_behavior("XYZ/USDT:USDT", FillBehavior::Reject("not tradable".into()));
        let err = venue
            .place_order("XYZ/USDT:USDT", Side::Buy, 10.0, "k1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unknown_order_status_is_none() {
        let venue = PaperVenue::new("alpha", 1000.0);
        assert!(venue.order_status("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resting_order_can_fill_late() {
        let venue = PaperVenue::new("alpha", 1000.0);
        venue.set_fill_behavior("BTC/USDT:USDT", FillBehavior::NoFill);
        venue
            .place_order("BTC/USDT:USDT", Side::Buy, 25.0, "k1")
            .await
            .unwrap();
        assert_eq!(
            venue.order_status("k1").await.unwrap().unwrap().state,
            OrderState::New
        );

        venue.force_fill("k1");
        let status = venue.order_status("k1").await.unwrap().unwrap();
        assert_eq!(status.state, OrderState::Filled);
        assert!((status.filled_notional_usd - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn balance_is_adjustable() {
        let venue = PaperVenue::new("alpha", 1000.0);
        venue.set_balance(5.0);
        let balance = venue.balance().await.unwrap();
        assert!((balance.available_usd - 5.0).abs() < 1e-9);
        assert!((balance.total_usd - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn symbol_halting_after_entry_rejects_followups() {
        let venue = PaperVenue::new("alpha", 1000.0);
        venue.set_fill_behavior(
            "BTC/USDT:USDT",
            FillBehavior::FillOnceThenReject("halted".into()),
        );

        venue
            .place_order("BTC/USDT:USDT", Side::Sell, 40.0, "k1")
            .await
            .unwrap();
        let err = venue
            .place_order("BTC/USDT:USDT", Side::Buy, 40.0, "k2")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected { .. }));
    }
}
