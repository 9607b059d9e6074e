// =============================================================================
// Shared types used across the Meridian carry engine
// =============================================================================
//
// Ownership rules:
//   - PortfolioState owns the open PositionPairs, addressed by stable pair id;
//     pairs never hold back-references.
//   - The orchestrator owns PortfolioState; every mutation is sequenced
//     through the cycle loop.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order sides
// ---------------------------------------------------------------------------

/// Direction of a single leg order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Funding data
// ---------------------------------------------------------------------------

/// One funding observation for a (venue, symbol) at a point in time.
///
/// `rate` is always normalized to an 8-hour settlement basis, regardless of
/// the venue's native funding cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub venue: String,
    /// Canonical form, e.g. `BTC/USDT:USDT`.
    pub symbol: String,
    /// Dimensionless funding rate per 8 h settlement.
    pub rate: f64,
    /// The venue's native funding interval in hours.
    pub interval_hours: u32,
    #[serde(default)]
    pub open_interest_usd: Option<f64>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// Per-cycle aggregation of funding snapshots across venues for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolQuote {
    pub symbol: String,
    /// venue id -> snapshot.
    pub venues: HashMap<String, FundingSnapshot>,
}

impl SymbolQuote {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            venues: HashMap::new(),
        }
    }

    /// Number of venues quoting this symbol.
    pub fn coverage(&self) -> usize {
        self.venues.len()
    }

    /// max(rate) - min(rate) across venues; 0.0 with fewer than two quotes.
    pub fn max_spread(&self) -> f64 {
        if self.venues.len() < 2 {
            return 0.0;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for snap in self.venues.values() {
            min = min.min(snap.rate);
            max = max.max(snap.rate);
        }
        max - min
    }

    /// Mean absolute funding rate across venues.
    pub fn avg_abs_rate(&self) -> f64 {
        if self.venues.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.venues.values().map(|s| s.rate.abs()).sum();
        sum / self.venues.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Pair candidates and intents
// ---------------------------------------------------------------------------

/// One side of a candidate or intent, identified by venue + symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegRef {
    pub venue: String,
    pub symbol: String,
    /// 8h-normalized funding rate observed when the leg was selected.
    pub rate: f64,
    #[serde(default)]
    pub open_interest_usd: Option<f64>,
}

impl LegRef {
    /// Stable identifier used in pair keys and idempotency digests.
    pub fn id(&self) -> String {
        format!("{}:{}", self.venue, self.symbol)
    }
}

/// A scored two-leg opportunity. The short leg receives funding (rate >= 0),
/// the long leg pays negative funding (rate <= 0) or simply the cheaper side
/// of a cross-venue spread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairCandidate {
    pub short: LegRef,
    pub long: LegRef,
    /// Expected carry in bps per 8 h after fees.
    pub edge_bps: f64,
    /// Relative volatility ratio long/short used for leg sizing.
    pub beta: f64,
    /// Quality score in [0, 1].
    pub score: f64,
    /// Consecutive cycles this pair has qualified (filled in by the gate).
    #[serde(default)]
    pub persistence: u32,
}

impl PairCandidate {
    /// Stable key for the persistence map, independent of cycle.
    pub fn key(&self) -> String {
        format!("{}|{}", self.short.id(), self.long.id())
    }
}

/// A sized directive to open one pair during a specific cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub cycle_id: u64,
    pub pair_key: String,
    pub short: IntentLeg,
    pub long: IntentLeg,
    pub edge_bps: f64,
    pub beta: f64,
    pub score: f64,
    /// Deterministic key; re-derivation after a crash yields the same value.
    pub idempotency_key: String,
}

/// One sized leg of a trade intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentLeg {
    pub venue: String,
    pub symbol: String,
    pub notional_usd: f64,
    /// Rate at intent time; recorded on the opened pair as the entry rate.
    pub rate: f64,
}

impl TradeIntent {
    /// Client order id for the short leg.
    pub fn short_order_id(&self) -> String {
        format!("{}-s", self.idempotency_key)
    }

    /// Client order id for the long leg.
    pub fn long_order_id(&self) -> String {
        format!("{}-l", self.idempotency_key)
    }

    /// Notional accounted against portfolio caps: the larger leg.
    pub fn accounted_notional_usd(&self) -> f64 {
        self.short.notional_usd.max(self.long.notional_usd)
    }
}

// ---------------------------------------------------------------------------
// Live positions
// ---------------------------------------------------------------------------

/// Lifecycle status of a position pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairStatus {
    Open,
    /// Known-inconsistent; requires operator intervention.
    Zombie,
    Closed,
}

impl std::fmt::Display for PairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Zombie => write!(f, "ZOMBIE"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// One live leg of an open pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairLeg {
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    /// Rate at entry, 8h-normalized.
    pub entry_rate: f64,
    /// Target notional at entry.
    pub entry_notional_usd: f64,
    /// Actual current notional (moves on partial fills and rebalances).
    pub current_notional_usd: f64,
    pub client_order_id: String,
}

/// A jointly-owned two-leg position. The engine never records one leg
/// without the other; a failed sibling leg resolves to a flatten before the
/// pair would ever be persisted as open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionPair {
    pub id: String,
    pub pair_key: String,
    pub short: PairLeg,
    pub long: PairLeg,
    pub status: PairStatus,
    /// Funding received minus funding paid since entry, in USD.
    #[serde(default)]
    pub accumulated_funding_usd: f64,
    #[serde(default)]
    pub realized_pnl_usd: f64,
    /// Mark-to-market value of the pair (funding accrual minus entry costs).
    #[serde(default)]
    pub mark_to_market_usd: f64,
    pub opened_cycle: u64,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl PositionPair {
    /// Notional accounted against portfolio caps: the larger current leg.
    pub fn accounted_notional_usd(&self) -> f64 {
        self.short.current_notional_usd.max(self.long.current_notional_usd)
    }

    /// Entry carry in decimal per 8 h: what the short receives plus what the
    /// long side avoids paying.
    pub fn entry_carry_8h(&self) -> f64 {
        self.short.entry_rate - self.long.entry_rate
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// Drawdown-driven admission state. Transitions are evaluated once per cycle
/// with a hysteresis band so the state does not flap around a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RiskState {
    #[default]
    Normal,
    Reduce,
    HaltNew,
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Reduce => write!(f, "REDUCE"),
            Self::HaltNew => write!(f, "HALT_NEW"),
        }
    }
}

/// The single authoritative portfolio record. Owned by the orchestrator and
/// persisted atomically at the end of every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub capital_usd: f64,
    pub equity_usd: f64,
    pub peak_equity_usd: f64,
    pub risk_state: RiskState,
    /// pair id -> pair. BTreeMap keeps iteration deterministic.
    pub open_pairs: BTreeMap<String, PositionPair>,
    pub last_cycle_id: u64,
    #[serde(default)]
    pub last_cycle_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_skipped_cycles: u32,
}

impl PortfolioState {
    pub fn new(capital_usd: f64) -> Self {
        Self {
            capital_usd,
            equity_usd: capital_usd,
            peak_equity_usd: capital_usd,
            risk_state: RiskState::Normal,
            open_pairs: BTreeMap::new(),
            last_cycle_id: 0,
            last_cycle_at: None,
            consecutive_skipped_cycles: 0,
        }
    }

    /// Recompute `equity = capital + sum(pair MTM)` and ratchet the peak.
    pub fn recompute_equity(&mut self) {
        let mtm: f64 = self
            .open_pairs
            .values()
            .map(|p| p.mark_to_market_usd)
            .sum();
        self.equity_usd = self.capital_usd + mtm;
        if self.equity_usd > self.peak_equity_usd {
            self.peak_equity_usd = self.equity_usd;
        }
    }

    /// (peak - equity) / peak, clamped to [0, 1].
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity_usd <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity_usd - self.equity_usd) / self.peak_equity_usd).clamp(0.0, 1.0)
    }

    /// Sum of accounted notionals across open pairs.
    pub fn total_notional_usd(&self) -> f64 {
        self.open_pairs
            .values()
            .filter(|p| p.status == PairStatus::Open)
            .map(|p| p.accounted_notional_usd())
            .sum()
    }

    /// Per-symbol open notional. Legs of one pair sharing a symbol are
    /// hedged against each other, so they contribute the larger leg rather
    /// than the sum.
    pub fn notional_by_symbol(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        for pair in self.open_pairs.values().filter(|p| p.status == PairStatus::Open) {
            accumulate_notional(
                &mut map,
                (&pair.short.symbol, pair.short.current_notional_usd),
                (&pair.long.symbol, pair.long.current_notional_usd),
            );
        }
        map
    }

    /// Per-venue open notional, with the same hedged-leg rule as per-symbol.
    pub fn notional_by_venue(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        for pair in self.open_pairs.values().filter(|p| p.status == PairStatus::Open) {
            accumulate_notional(
                &mut map,
                (&pair.short.venue, pair.short.current_notional_usd),
                (&pair.long.venue, pair.long.current_notional_usd),
            );
        }
        map
    }

    pub fn open_pair_keys(&self) -> Vec<String> {
        self.open_pairs
            .values()
            .filter(|p| p.status == PairStatus::Open)
            .map(|p| p.pair_key.clone())
            .collect()
    }
}

/// Add one pair's two legs into a per-key notional map. When both legs land
/// on the same key they offset, so only the larger leg counts.
pub fn accumulate_notional(
    map: &mut BTreeMap<String, f64>,
    short: (&str, f64),
    long: (&str, f64),
) {
    if short.0 == long.0 {
        *map.entry(short.0.to_string()).or_insert(0.0) += short.1.max(long.1);
    } else {
        *map.entry(short.0.to_string()).or_insert(0.0) += short.1;
        *map.entry(long.0.to_string()).or_insert(0.0) += long.1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(venue: &str, rate: f64) -> FundingSnapshot {
        FundingSnapshot {
            venue: venue.to_string(),
            symbol: "BTC/USDT:USDT".to_string(),
            rate,
            interval_hours: 8,
            open_interest_usd: None,
            bid: None,
            ask: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn symbol_quote_spread_and_coverage() {
        let mut quote = SymbolQuote::new("BTC/USDT:USDT");
        assert_eq!(quote.coverage(), 0);
        assert_eq!(quote.max_spread(), 0.0);

        quote.venues.insert("alpha".into(), snap("alpha", 0.003));
        assert_eq!(quote.max_spread(), 0.0); // single venue has no spread

        quote.venues.insert("beta".into(), snap("beta", -0.002));
        assert_eq!(quote.coverage(), 2);
        assert!((quote.max_spread() - 0.005).abs() < 1e-12);
        assert!((quote.avg_abs_rate() - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn equity_accounting_invariant() {
        let mut state = PortfolioState::new(1000.0);
        state.recompute_equity();
        assert_eq!(state.equity_usd, 1000.0);
        assert_eq!(state.peak_equity_usd, 1000.0);
        assert_eq!(state.drawdown(), 0.0);
    }

    #[test]
    fn peak_is_monotone() {
        let mut state = PortfolioState::new(1000.0);
        state.capital_usd = 1100.0;
        state.recompute_equity();
        assert_eq!(state.peak_equity_usd, 1100.0);

        state.capital_usd = 900.0;
        state.recompute_equity();
        assert_eq!(state.peak_equity_usd, 1100.0);
        assert!((state.drawdown() - (200.0 / 1100.0)).abs() < 1e-12);
    }

    #[test]
    fn portfolio_state_serde_round_trip() {
        let mut state = PortfolioState::new(1000.0);
        state.risk_state = RiskState::Reduce;
        state.last_cycle_id = 17;
        let json = serde_json::to_string(&state).unwrap();
        let back: PortfolioState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capital_usd, state.capital_usd);
        assert_eq!(back.risk_state, RiskState::Reduce);
        assert_eq!(back.last_cycle_id, 17);
        assert_eq!(back.open_pairs.len(), 0);
    }

    #[test]
    fn hedged_legs_count_once_per_key() {
        let mut map = BTreeMap::new();
        // Same venue: larger leg only.
        accumulate_notional(&mut map, ("alpha", 40.0), ("alpha", 50.0));
        assert!((map["alpha"] - 50.0).abs() < 1e-12);

        // Distinct venues: each leg its own.
        let mut map = BTreeMap::new();
        accumulate_notional(&mut map, ("alpha", 40.0), ("beta", 30.0));
        assert!((map["alpha"] - 40.0).abs() < 1e-12);
        assert!((map["beta"] - 30.0).abs() < 1e-12);
    }

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
