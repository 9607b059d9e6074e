// =============================================================================
// Signal Service - pair candidates, quality scoring, persistence gating
// =============================================================================
//
// Pipeline per cycle:
//   1. Enumerate ordered venue-symbol leg pairs (short, long) where the short
//      side earns funding and the long side pays negative funding, or the
//      rate gap alone clears fr_diff_min.
//   2. Price the edge in bps per 8 h net of both legs' round-trip fees and
//      reject anything under the configured floor.
//   3. Blend a quality score in [0, 1] and apply min_pair_score.
//   4. Run survivors through the persistence gate: a pair must re-qualify for
//      min_persistence_windows consecutive cycles before it sizes into an
//      intent. Counters persist with cycle state and survive restarts.
//   5. Size intents off capital and emit at most max_new_positions_per_cycle,
//      best score first.
//
// Everything here is pure with respect to its inputs; the orchestrator owns
// the counters and passes them through.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::types::{IntentLeg, LegRef, PairCandidate, SymbolQuote, TradeIntent};

// Scale anchors that map raw magnitudes onto [0, 1] score components.
/// Edge at or above this many bps scores 1.0.
const EDGE_SCALE_BPS: f64 = 50.0;
/// Combined absolute leg rates at or above this decimal score 1.0.
const RATE_SCALE: f64 = 0.01;
/// Neutral OI component when either leg's open interest is unknown.
const OI_UNKNOWN: f64 = 0.5;

// Quality blend weights (sum to 1).
const W_EDGE: f64 = 0.40;
const W_RATES: f64 = 0.25;
const W_BETA: f64 = 0.20;
const W_OI: f64 = 0.15;

/// Floor applied to beta before it scales the long leg.
const BETA_FLOOR: f64 = 0.1;

pub struct SignalService {
    cfg: EngineConfig,
}

impl SignalService {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg }
    }

    // -------------------------------------------------------------------------
    // Candidate construction
    // -------------------------------------------------------------------------

    /// Enumerate, price, and score pair candidates from the cycle's quotes.
    /// Output is sorted best score first (pair key breaks ties).
    pub fn build_candidates(&self, quotes: &BTreeMap<String, SymbolQuote>) -> Vec<PairCandidate> {
        // Flatten quotes into legs, sorted for deterministic enumeration.
        let mut legs: Vec<LegRef> = Vec::new();
        for quote in quotes.values() {
            for snapshot in quote.venues.values() {
                if !snapshot.rate.is_finite() {
                    debug!(venue = %snapshot.venue, symbol = %snapshot.symbol,
                        "non-finite rate dropped");
                    continue;
                }
                legs.push(LegRef {
                    venue: snapshot.venue.clone(),
                    symbol: snapshot.symbol.clone(),
                    rate: snapshot.rate,
                    open_interest_usd: snapshot.open_interest_usd,
                });
            }
        }
        legs.sort_by(|a, b| a.id().cmp(&b.id()));

        let mut candidates = Vec::new();
        for short in &legs {
            for long in &legs {
                if short.id() == long.id() {
                    continue;
                }
                if let Some(candidate) = self.qualify(short, long) {
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key().cmp(&b.key()))
        });

        debug!(legs = legs.len(), candidates = candidates.len(), "candidates built");
        candidates
    }

    /// Apply all pair-level gates and price the candidate. `None` means the
    /// combination is not tradable this cycle.
    fn qualify(&self, short: &LegRef, long: &LegRef) -> Option<PairCandidate> {
        let opposite_signs = short.rate > 0.0 && long.rate < 0.0;
        let wide_gap = short.rate - long.rate >= self.cfg.fr_diff_min;
        if !opposite_signs && !wide_gap {
            return None;
        }

        if !self.cfg.allow_single_exchange_pairs && short.venue == long.venue {
            return None;
        }

        let fee_bps_total = self.cfg.fee_bps_for(&short.venue) + self.cfg.fee_bps_for(&long.venue);
        let edge_bps = 10_000.0 * (short.rate - long.rate) - fee_bps_total;
        if edge_bps < self.cfg.expected_edge_min_bps {
            return None;
        }

        let beta = self.beta_for(&short.symbol, &long.symbol);
        let score = self.quality_score(short, long, edge_bps, beta);
        if score < self.cfg.min_pair_score {
            return None;
        }

        Some(PairCandidate {
            short: short.clone(),
            long: long.clone(),
            edge_bps,
            beta,
            score,
            persistence: 0,
        })
    }

    /// Relative volatility ratio long/short from the configured per-symbol
    /// map; symbols without an entry count as 1.0.
    fn beta_for(&self, short_symbol: &str, long_symbol: &str) -> f64 {
        let vol_short = self
            .cfg
            .beta_overrides
            .get(short_symbol)
            .copied()
            .unwrap_or(1.0);
        let vol_long = self
            .cfg
            .beta_overrides
            .get(long_symbol)
            .copied()
            .unwrap_or(1.0);
        if vol_short > 0.0 {
            vol_long / vol_short
        } else {
            1.0
        }
    }

    /// Quality blend: edge, combined rate magnitude, beta affinity to 1.0,
    /// and open-interest adequacy. Each component lands in [0, 1], so the
    /// weighted sum does too.
    fn quality_score(&self, short: &LegRef, long: &LegRef, edge_bps: f64, beta: f64) -> f64 {
        let edge_term = (edge_bps / EDGE_SCALE_BPS).clamp(0.0, 1.0);
        let rates_term = ((short.rate.abs() + long.rate.abs()) / RATE_SCALE).clamp(0.0, 1.0);
        let beta_term = 1.0 / (1.0 + (beta - 1.0).abs());

        let oi_term = match (short.open_interest_usd, long.open_interest_usd) {
            (Some(a), Some(b)) => {
                (a.min(b) / self.cfg.default_open_interest_usd).clamp(0.0, 1.0)
            }
            _ => OI_UNKNOWN,
        };

        W_EDGE * edge_term + W_RATES * rates_term + W_BETA * beta_term + W_OI * oi_term
    }

    // -------------------------------------------------------------------------
    // Persistence gate
    // -------------------------------------------------------------------------

    /// Roll the persistence counters forward one cycle. Qualifying pairs
    /// increment by exactly one; everything else drops back to zero (absent).
    pub fn roll_persistence(
        previous: &BTreeMap<String, u32>,
        candidates: &[PairCandidate],
    ) -> BTreeMap<String, u32> {
        candidates
            .iter()
            .map(|c| {
                let key = c.key();
                let count = previous.get(&key).copied().unwrap_or(0) + 1;
                (key, count)
            })
            .collect()
    }

    /// Stamp counters onto candidates and keep the ones past the gate.
    pub fn gate_persistent<'a>(
        &self,
        counters: &BTreeMap<String, u32>,
        candidates: &'a [PairCandidate],
    ) -> Vec<PairCandidate> {
        candidates
            .iter()
            .filter_map(|c| {
                let count = counters.get(&c.key()).copied().unwrap_or(0);
                (count >= self.cfg.min_persistence_windows).then(|| {
                    let mut gated = c.clone();
                    gated.persistence = count;
                    gated
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Intent sizing
    // -------------------------------------------------------------------------

    /// Convert gated candidates into sized intents. Pairs already open are
    /// skipped; output preserves score order and respects the per-cycle cap.
    pub fn build_intents(
        &self,
        cycle_id: u64,
        gated: &[PairCandidate],
        capital_usd: f64,
        open_pair_keys: &[String],
    ) -> Vec<TradeIntent> {
        let open: BTreeSet<&str> = open_pair_keys.iter().map(String::as_str).collect();

        let notional_short = (capital_usd * self.cfg.capital_fraction)
            .min(self.cfg.max_notional_per_pair_usd)
            .max(self.cfg.min_order_usd);

        let intents: Vec<TradeIntent> = gated
            .iter()
            .filter(|c| !open.contains(c.key().as_str()))
            .take(self.cfg.max_new_positions_per_cycle)
            .map(|c| {
                let beta = c.beta.max(BETA_FLOOR);
                let notional_long = notional_short * beta;
                TradeIntent {
                    cycle_id,
                    pair_key: c.key(),
                    short: IntentLeg {
                        venue: c.short.venue.clone(),
                        symbol: c.short.symbol.clone(),
                        notional_usd: notional_short,
                        rate: c.short.rate,
                    },
                    long: IntentLeg {
                        venue: c.long.venue.clone(),
                        symbol: c.long.symbol.clone(),
                        notional_usd: notional_long,
                        rate: c.long.rate,
                    },
                    edge_bps: c.edge_bps,
                    beta: c.beta,
                    score: c.score,
                    idempotency_key: idempotency_key(cycle_id, &c.short.id(), &c.long.id()),
                }
            })
            .collect();

        if !intents.is_empty() {
            info!(count = intents.len(), cycle_id, "trade intents generated");
        }
        intents
    }
}

/// Deterministic digest of (cycle_id, short leg id, long leg id). Re-deriving
/// after a crash produces the same client order ids, which is what makes
/// resubmission a venue-side no-op.
pub fn idempotency_key(cycle_id: u64, short_id: &str, long_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cycle_id.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(short_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(long_id.as_bytes());
    let digest = hasher.finalize();
    format!("mx{}", &hex::encode(digest)[..16])
}

impl std::fmt::Debug for SignalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalService")
            .field("fr_diff_min", &self.cfg.fr_diff_min)
            .field("min_pair_score", &self.cfg.min_pair_score)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FundingSnapshot;
    use chrono::Utc;

    fn quotes_for(rates: &[(&str, &str, f64)]) -> BTreeMap<String, SymbolQuote> {
        let mut quotes: BTreeMap<String, SymbolQuote> = BTreeMap::new();
        for (venue, symbol, rate) in rates {
            quotes
                .entry(symbol.to_string())
                .or_insert_with(|| SymbolQuote::new(symbol.to_string()))
                .venues
                .insert(
                    venue.to_string(),
                    FundingSnapshot {
                        venue: venue.to_string(),
                        symbol: symbol.to_string(),
                        rate: *rate,
                        interval_hours: 8,
                        open_interest_usd: None,
                        bid: None,
                        ask: None,
                        observed_at: Utc::now(),
                    },
                );
        }
        quotes
    }

    fn service() -> SignalService {
        SignalService::new(EngineConfig::default())
    }

    #[test]
    fn opposite_sign_pair_qualifies_with_expected_edge() {
        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("alpha", "YYY/USDT:USDT", -0.002),
        ]);
        let candidates = service().build_candidates(&quotes);
        assert_eq!(candidates.len(), 1);

        let c = &candidates[0];
        assert_eq!(c.short.symbol, "XXX/USDT:USDT");
        assert_eq!(c.long.symbol, "YYY/USDT:USDT");
        // 10000 * 0.005 - (4 + 4) fee bps.
        assert!((c.edge_bps - 42.0).abs() < 1e-9);
        assert!(c.score >= 0.30 && c.score <= 1.0);
    }

    #[test]
    fn edge_below_floor_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.fee_bps_per_leg = 4.0;
        cfg.expected_edge_min_bps = 1.0;
        let svc = SignalService::new(cfg);

        // 10000 * 0.00089 - 8 = 0.9 bps: 0.1 bps under the floor.
        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.0005),
            ("alpha", "YYY/USDT:USDT", -0.00039),
        ]);
        assert!(svc.build_candidates(&quotes).is_empty());
    }

    #[test]
    fn same_venue_rejected_when_disallowed() {
        let mut cfg = EngineConfig::default();
        cfg.allow_single_exchange_pairs = false;
        let svc = SignalService::new(cfg);

        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("alpha", "YYY/USDT:USDT", -0.002),
        ]);
        assert!(svc.build_candidates(&quotes).is_empty());

        // Cross-venue survives the same gate.
        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("beta", "YYY/USDT:USDT", -0.002),
        ]);
        let svc = SignalService::new({
            let mut cfg = EngineConfig::default();
            cfg.allow_single_exchange_pairs = false;
            cfg
        });
        assert_eq!(svc.build_candidates(&quotes).len(), 1);
    }

    #[test]
    fn cross_venue_same_symbol_spread_qualifies() {
        // Both rates positive: qualification rides on the gap alone.
        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.0035),
            ("beta", "XXX/USDT:USDT", 0.001),
        ]);
        let candidates = service().build_candidates(&quotes);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].short.venue, "alpha");
        assert_eq!(candidates[0].long.venue, "beta");
    }

    #[test]
    fn persistence_counters_step_by_one_and_reset() {
        let svc = service();
        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("alpha", "YYY/USDT:USDT", -0.002),
        ]);
        let candidates = svc.build_candidates(&quotes);
        let key = candidates[0].key();

        let counters = SignalService::roll_persistence(&BTreeMap::new(), &candidates);
        assert_eq!(counters[&key], 1);

        let counters = SignalService::roll_persistence(&counters, &candidates);
        assert_eq!(counters[&key], 2);

        // Disqualified next cycle: entry drops out (counter back to zero).
        let counters = SignalService::roll_persistence(&counters, &[]);
        assert!(counters.get(&key).is_none());
    }

    #[test]
    fn persistence_gate_holds_intents_until_window_met() {
        let mut cfg = EngineConfig::default();
        cfg.min_persistence_windows = 2;
        let svc = SignalService::new(cfg);

        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("alpha", "YYY/USDT:USDT", -0.002),
        ]);
        let candidates = svc.build_candidates(&quotes);

        // Cycle 1: counter 1 - gated out.
        let counters = SignalService::roll_persistence(&BTreeMap::new(), &candidates);
        assert!(svc.gate_persistent(&counters, &candidates).is_empty());

        // Cycle 2: counter 2 - passes, counter stamped on the candidate.
        let counters = SignalService::roll_persistence(&counters, &candidates);
        let gated = svc.gate_persistent(&counters, &candidates);
        assert_eq!(gated.len(), 1);
        assert_eq!(gated[0].persistence, 2);
    }

    #[test]
    fn sizing_matches_capital_fraction_and_caps() {
        let svc = service();
        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("alpha", "YYY/USDT:USDT", -0.002),
        ]);
        let candidates = svc.build_candidates(&quotes);
        let counters = SignalService::roll_persistence(&BTreeMap::new(), &candidates);
        let gated = svc.gate_persistent(&counters, &candidates);

        let intents = svc.build_intents(1, &gated, 1000.0, &[]);
        assert_eq!(intents.len(), 1);
        // min(40, 1000 * 0.40) = 40, beta 1.0 mirrors it on the long leg.
        assert!((intents[0].short.notional_usd - 40.0).abs() < 1e-9);
        assert!((intents[0].long.notional_usd - 40.0).abs() < 1e-9);
        assert_eq!(intents[0].cycle_id, 1);
    }

    #[test]
    fn open_pairs_are_not_reissued() {
        let svc = service();
        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("alpha", "YYY/USDT:USDT", -0.002),
        ]);
        let candidates = svc.build_candidates(&quotes);
        let counters = SignalService::roll_persistence(&BTreeMap::new(), &candidates);
        let gated = svc.gate_persistent(&counters, &candidates);

        let open = vec![gated[0].key()];
        assert!(svc.build_intents(2, &gated, 1000.0, &open).is_empty());
    }

    #[test]
    fn beta_scales_long_leg_with_floor() {
        let mut cfg = EngineConfig::default();
        cfg.beta_overrides.insert("XXX/USDT:USDT".into(), 1.0);
        cfg.beta_overrides.insert("YYY/USDT:USDT".into(), 0.5);
        let svc = SignalService::new(cfg);

        let quotes = quotes_for(&[
            ("alpha", "XXX/USDT:USDT", 0.003),
            ("alpha", "YYY/USDT:USDT", -0.002),
        ]);
        let candidates = svc.build_candidates(&quotes);
        let counters = SignalService::roll_persistence(&BTreeMap::new(), &candidates);
        let gated = svc.gate_persistent(&counters, &candidates);
        let intents = svc.build_intents(1, &gated, 1000.0, &[]);

        assert!((intents[0].beta - 0.5).abs() < 1e-9);
        assert!((intents[0].long.notional_usd - 20.0).abs() < 1e-9);
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = idempotency_key(7, "alpha:XXX/USDT:USDT", "alpha:YYY/USDT:USDT");
        let b = idempotency_key(7, "alpha:XXX/USDT:USDT", "alpha:YYY/USDT:USDT");
        let c = idempotency_key(8, "alpha:XXX/USDT:USDT", "alpha:YYY/USDT:USDT");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("mx"));
        assert_eq!(a.len(), 18);
    }
}
