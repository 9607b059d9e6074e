// =============================================================================
// Market-Data Service - merges funding, open interest, and top-of-book
// =============================================================================
//
// Three variants behind one capability surface (snapshot, supported_symbols),
// selected by configuration:
//
//   AggregatorOnly - funding (and optional OI) straight from the aggregator.
//   Hybrid         - funding from the aggregator; OI and top-of-book from
//                    per-venue adapters, fetched concurrently.
//   VenueOnly      - everything from venue adapters.
//
// Ancillary data is never allowed to fail a cycle: an adapter error degrades
// the affected symbol to configured defaults and the merge continues.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::MarketDataMode;
use crate::error::EngineError;
use crate::funding::FundingClient;
use crate::types::{FundingSnapshot, SymbolQuote};
use crate::venue::VenueAdapter;

pub struct MarketDataService {
    mode: MarketDataMode,
    funding: Arc<FundingClient>,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    /// Symbol set served in venue-only mode, where adapters are queried
    /// per-symbol and cannot enumerate their own markets.
    venue_symbols: Vec<String>,
    default_open_interest_usd: f64,
}

impl MarketDataService {
    pub fn new(
        mode: MarketDataMode,
        funding: Arc<FundingClient>,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        venue_symbols: Vec<String>,
        default_open_interest_usd: f64,
    ) -> Self {
        Self {
            mode,
            funding,
            venues,
            venue_symbols,
            default_open_interest_usd,
        }
    }

    /// Canonical symbols this service can quote.
    pub async fn supported_symbols(&self) -> Result<BTreeSet<String>, EngineError> {
        match self.mode {
            MarketDataMode::Aggregator | MarketDataMode::Hybrid => Ok(self
                .funding
                .fetch_all()
                .await?
                .into_iter()
                .map(|s| s.symbol)
                .collect()),
            MarketDataMode::Venue => Ok(self.venue_symbols.iter().cloned().collect()),
        }
    }

    /// One SymbolQuote per requested symbol. Symbols with no data at all are
    /// simply absent from the result.
    pub async fn snapshot(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, SymbolQuote>, EngineError> {
        match self.mode {
            MarketDataMode::Aggregator => self.snapshot_aggregator(symbols).await,
            MarketDataMode::Hybrid => {
                let mut quotes = self.snapshot_aggregator(symbols).await?;
                self.enrich_from_venues(&mut quotes).await;
                Ok(quotes)
            }
            MarketDataMode::Venue => self.snapshot_venue(symbols).await,
        }
    }

    // -------------------------------------------------------------------------
    // Aggregator path
    // -------------------------------------------------------------------------

    async fn snapshot_aggregator(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, SymbolQuote>, EngineError> {
        let by_symbol = self.funding.get_rates_by_symbols(symbols).await?;

        let mut quotes = BTreeMap::new();
        for (symbol, venues) in by_symbol {
            let mut quote = SymbolQuote::new(symbol.clone());
            quote.venues = venues;
            quotes.insert(symbol, quote);
        }
        Ok(quotes)
    }

    // -------------------------------------------------------------------------
    // Hybrid enrichment
    // -------------------------------------------------------------------------

    /// Overlay venue OI and top-of-book onto aggregator funding. Adapter
    /// failures degrade the snapshot to defaults instead of propagating.
    async fn enrich_from_venues(&self, quotes: &mut BTreeMap<String, SymbolQuote>) {
        // Issue every (venue, symbol) request concurrently.
        let mut requests = Vec::new();
        for (symbol, quote) in quotes.iter() {
            for venue_id in quote.venues.keys() {
                if let Some(adapter) = self.venues.get(venue_id) {
                    let adapter = adapter.clone();
                    let venue_id = venue_id.clone();
                    let symbol = symbol.clone();
                    requests.push(async move {
                        let info = adapter.market_info(&symbol).await;
                        (venue_id, symbol, info)
                    });
                }
            }
        }

        for (venue_id, symbol, info) in join_all(requests).await {
            let Some(snapshot) = quotes
                .get_mut(&symbol)
                .and_then(|q| q.venues.get_mut(&venue_id))
            else {
                continue;
            };

            match info {
                Ok(info) => {
                    snapshot.open_interest_usd = info
                        .open_interest_usd
                        .or(snapshot.open_interest_usd)
                        .or(Some(self.default_open_interest_usd));
                    snapshot.bid = info.bid.or(snapshot.bid);
                    snapshot.ask = info.ask.or(snapshot.ask);
                }
                Err(err) => {
                    debug!(venue = %venue_id, symbol = %symbol, error = %err,
                        "venue market info unavailable - using defaults");
                    snapshot.open_interest_usd = snapshot
                        .open_interest_usd
                        .or(Some(self.default_open_interest_usd));
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Venue-only path
    // -------------------------------------------------------------------------

    async fn snapshot_venue(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, SymbolQuote>, EngineError> {
        let mut requests = Vec::new();
        for symbol in symbols {
            for (venue_id, adapter) in &self.venues {
                let adapter = adapter.clone();
                let venue_id = venue_id.clone();
                let symbol = symbol.clone();
                requests.push(async move {
                    let info = adapter.market_info(&symbol).await;
                    (venue_id, symbol, info)
                });
            }
        }

        let mut quotes: BTreeMap<String, SymbolQuote> = BTreeMap::new();
        for (venue_id, symbol, info) in join_all(requests).await {
            let info = match info {
                Ok(info) => info,
                Err(err) => {
                    debug!(venue = %venue_id, symbol = %symbol, error = %err,
                        "venue quote unavailable");
                    continue;
                }
            };

            // Funding is the one thing a venue-only quote cannot fake.
            let Some(rate) = info.rate_8h.filter(|r| r.is_finite()) else {
                warn!(venue = %venue_id, symbol = %symbol,
                    "venue supplied no funding rate - symbol skipped on this venue");
                continue;
            };

            let snapshot = FundingSnapshot {
                venue: venue_id.clone(),
                symbol: symbol.clone(),
                rate,
                interval_hours: info.interval_hours.unwrap_or(8),
                open_interest_usd: info
                    .open_interest_usd
                    .or(Some(self.default_open_interest_usd)),
                bid: info.bid,
                ask: info.ask,
                observed_at: Utc::now(),
            };

            quotes
                .entry(symbol.clone())
                .or_insert_with(|| SymbolQuote::new(symbol.clone()))
                .venues
                .insert(venue_id, snapshot);
        }

        Ok(quotes)
    }
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("mode", &self.mode)
            .field("venues", &self.venues.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::{PaperVenue, VenueMarketInfo};
    use std::time::Duration;

    fn service_with_paper_venues(mode: MarketDataMode) -> (MarketDataService, Arc<PaperVenue>) {
        let funding = Arc::new(FundingClient::new(
            "http://127.0.0.1:1",
            Duration::from_millis(50),
        ));
        let paper = Arc::new(PaperVenue::new("alpha", 1000.0));
        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert("alpha".into(), paper.clone());
        let service = MarketDataService::new(
            mode,
            funding,
            venues,
            vec!["BTC/USDT:USDT".into(), "ETH/USDT:USDT".into()],
            5_000_000.0,
        );
        (service, paper)
    }

    #[tokio::test]
    async fn venue_only_snapshot_merges_adapter_quotes() {
        let (service, paper) = service_with_paper_venues(MarketDataMode::Venue);
        paper.set_market_info(
            "BTC/USDT:USDT",
            VenueMarketInfo {
                rate_8h: Some(0.003),
                interval_hours: Some(8),
                open_interest_usd: Some(9_000_000.0),
                bid: Some(50_000.0),
                ask: Some(50_001.0),
            },
        );

        let symbols = vec!["BTC/USDT:USDT".to_string(), "ETH/USDT:USDT".to_string()];
        let quotes = service.snapshot(&symbols).await.unwrap();

        // BTC quoted; ETH has no venue data and is simply absent.
        assert_eq!(quotes.len(), 1);
        let btc = &quotes["BTC/USDT:USDT"];
        assert_eq!(btc.coverage(), 1);
        let snap = &btc.venues["alpha"];
        assert!((snap.rate - 0.003).abs() < 1e-12);
        assert_eq!(snap.open_interest_usd, Some(9_000_000.0));
    }

    #[tokio::test]
    async fn venue_only_defaults_missing_open_interest() {
        let (service, paper) = service_with_paper_venues(MarketDataMode::Venue);
        paper.set_market_info(
            "ETH/USDT:USDT",
            VenueMarketInfo {
                rate_8h: Some(-0.002),
                ..Default::default()
            },
        );

        let quotes = service
            .snapshot(&["ETH/USDT:USDT".to_string()])
            .await
            .unwrap();
        let snap = &quotes["ETH/USDT:USDT"].venues["alpha"];
        assert_eq!(snap.open_interest_usd, Some(5_000_000.0));
        assert!(snap.bid.is_none());
    }

    #[tokio::test]
    async fn venue_only_supported_symbols_come_from_config() {
        let (service, _paper) = service_with_paper_venues(MarketDataMode::Venue);
        let supported = service.supported_symbols().await.unwrap();
        assert!(supported.contains("BTC/USDT:USDT"));
        assert!(supported.contains("ETH/USDT:USDT"));
    }
}
