// =============================================================================
// Universe Provider - dynamic top-K symbol selection
// =============================================================================
//
// Composite score per symbol:
//
//   score = w_spread * norm(max_spread)
//         + w_coverage * norm(venue_coverage)
//         + w_rate * norm(avg_abs_rate)
//
// Each component is normalized by the maximum across surviving candidates so
// the weights act on comparable [0, 1] magnitudes. Filters run first:
// coverage >= 2 venues and max_spread >= fr_diff_min. Ties break
// lexicographically on the symbol so output is deterministic.
//
// Dynamic selection only runs when the static symbol list is empty; a
// configured list is honored verbatim.
// =============================================================================

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::UniverseWeights;
use crate::types::SymbolQuote;

pub struct UniverseProvider {
    size: usize,
    fr_diff_min: f64,
    weights: UniverseWeights,
}

impl UniverseProvider {
    pub fn new(size: usize, fr_diff_min: f64, weights: UniverseWeights) -> Self {
        Self {
            size,
            fr_diff_min,
            weights,
        }
    }

    /// Rank the quoted symbols and return the top-K canonical names.
    pub fn select(&self, quotes: &BTreeMap<String, SymbolQuote>) -> Vec<String> {
        if self.size == 0 {
            return Vec::new();
        }

        struct Candidate<'a> {
            symbol: &'a str,
            spread: f64,
            coverage: f64,
            avg_abs_rate: f64,
        }

        let candidates: Vec<Candidate> = quotes
            .values()
            .filter(|q| q.coverage() >= 2 && q.max_spread() >= self.fr_diff_min)
            .map(|q| Candidate {
                symbol: &q.symbol,
                spread: q.max_spread(),
                coverage: q.coverage() as f64,
                avg_abs_rate: q.avg_abs_rate(),
            })
            .collect();

        if candidates.is_empty() {
            debug!("no symbols survived universe filters");
            return Vec::new();
        }

        let max_spread = candidates.iter().map(|c| c.spread).fold(0.0, f64::max);
        let max_coverage = candidates.iter().map(|c| c.coverage).fold(0.0, f64::max);
        let max_rate = candidates.iter().map(|c| c.avg_abs_rate).fold(0.0, f64::max);

        let norm = |value: f64, max: f64| if max > 0.0 { value / max } else { 0.0 };

        let mut scored: Vec<(f64, &str)> = candidates
            .iter()
            .map(|c| {
                let score = self.weights.spread * norm(c.spread, max_spread)
                    + self.weights.coverage * norm(c.coverage, max_coverage)
                    + self.weights.rate * norm(c.avg_abs_rate, max_rate);
                (score, c.symbol)
            })
            .collect();

        // Descending score; lexicographic symbol on equal scores.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });

        let selected: Vec<String> = scored
            .into_iter()
            .take(self.size)
            .map(|(_, symbol)| symbol.to_string())
            .collect();

        info!(
            selected = selected.len(),
            pool = quotes.len(),
            "dynamic universe resolved"
        );
        selected
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

    fn quote(symbol: &str, rates: &[(&str, f64)]) -> SymbolQuote {
        let mut q = SymbolQuote::new(symbol);
        for (venue, rate) in rates {
            q.venues.insert(
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
        q
    }

    fn provider(size: usize) -> UniverseProvider {
        UniverseProvider::new(size, 0.002, UniverseWeights::default())
    }

    #[test]
    fn filters_mono_venue_and_thin_spreads() {
        let mut quotes = BTreeMap::new();
        // Single venue: filtered regardless of rate.
        quotes.insert(
            "AAA/USDT:USDT".to_string(),
            quote("AAA/USDT:USDT", &[("alpha", 0.01)]),
        );
        // Spread below fr_diff_min: filtered.
        quotes.insert(
            "BBB/USDT:USDT".to_string(),
            quote("BBB/USDT:USDT", &[("alpha", 0.001), ("beta", 0.0005)]),
        );
        // Survives.
        quotes.insert(
            "CCC/USDT:USDT".to_string(),
            quote("CCC/USDT:USDT", &[("alpha", 0.003), ("beta", -0.002)]),
        );

        assert_eq!(provider(25).select(&quotes), vec!["CCC/USDT:USDT"]);
    }

    #[test]
    fn ranks_by_composite_and_truncates() {
        let mut quotes = BTreeMap::new();
        quotes.insert(
            "AAA/USDT:USDT".to_string(),
            quote("AAA/USDT:USDT", &[("alpha", 0.004), ("beta", -0.004)]),
        );
        quotes.insert(
            "BBB/USDT:USDT".to_string(),
            quote("BBB/USDT:USDT", &[("alpha", 0.002), ("beta", -0.001)]),
        );
        quotes.insert(
            "CCC/USDT:USDT".to_string(),
            quote("CCC/USDT:USDT", &[("alpha", 0.003), ("beta", -0.002)]),
        );

        let top2 = provider(2).select(&quotes);
        assert_eq!(top2, vec!["AAA/USDT:USDT", "CCC/USDT:USDT"]);
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut quotes = BTreeMap::new();
        quotes.insert(
            "ZZZ/USDT:USDT".to_string(),
            quote("ZZZ/USDT:USDT", &[("alpha", 0.003), ("beta", -0.002)]),
        );
        quotes.insert(
            "MMM/USDT:USDT".to_string(),
            quote("MMM/USDT:USDT", &[("alpha", 0.003), ("beta", -0.002)]),
        );

        let selected = provider(1).select(&quotes);
        assert_eq!(selected, vec!["MMM/USDT:USDT"]);
    }

    #[test]
    fn zero_size_universe_is_empty_without_error() {
        let mut quotes = BTreeMap::new();
        quotes.insert(
            "AAA/USDT:USDT".to_string(),
            quote("AAA/USDT:USDT", &[("alpha", 0.003), ("beta", -0.002)]),
        );
        assert!(provider(0).select(&quotes).is_empty());
        assert!(provider(25).select(&BTreeMap::new()).is_empty());
    }
}
