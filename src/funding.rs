// =============================================================================
// Funding-Rate Client - aggregator ingestion with normalization and caching
// =============================================================================
//
// The aggregator returns one record per (exchange, symbol):
//
//   GET {base}/funding ->
//   [{ "exchange": "...", "symbol": "...", "funding_rate": <int bps x 100>,
//      "interval_hours": <int>, "open_interest_usd": <number?> }]
//
// Normalization rules:
//   - funding_rate is integer bps x 100: scale by 1/10000 into a decimal.
//   - venues settling more often than 8 h are scaled by interval/8 so every
//     rate compares on the same 8 h basis.
//   - symbols canonicalize to BASE/QUOTE:QUOTE with stablecoin quotes aligned.
//
// Responses are memoized for 60 s per fetch epoch. There is no
// stale-while-fetching: an expired cache plus a failed fetch surfaces a
// retriable error and the cycle is skipped.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::types::FundingSnapshot;

/// How long one aggregator response stays valid.
const CACHE_TTL: Duration = Duration::from_secs(60);
/// Attempts per fetch, with exponential backoff between them.
const MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Convert an aggregator `funding_rate` integer into a decimal rate per 8 h.
///
/// `normalize_rate(25, 8) == 0.0025`; `normalize_rate(25, 1) == 0.0025 / 8`.
pub fn normalize_rate(raw: i64, interval_hours: u32) -> f64 {
    let rate = raw as f64 / 10_000.0;
    if interval_hours > 0 && interval_hours < 8 {
        rate * interval_hours as f64 / 8.0
    } else {
        rate
    }
}

/// Stablecoin quotes that venues use interchangeably for USD-margined perps.
const QUOTE_ALIASES: [&str; 4] = ["USDT", "USDC", "BUSD", "USD"];
/// Perp markers venues append to the instrument name.
const PERP_SUFFIXES: [&str; 5] = ["-PERP", "_PERP", "-SWAP", "_SWAP", ".P"];

/// Canonicalize a venue symbol into `BASE/QUOTE:QUOTE` form.
///
/// `BTCUSDT` -> `BTC/USDT:USDT`; `ETH-PERP` -> `ETH/USDT:USDT`;
/// `SOL/USDC` -> `SOL/USDT:USDT`. Returns `None` for symbols that cannot be
/// resolved (treated as a data-quality skip by callers).
pub fn canonical_symbol(raw: &str) -> Option<String> {
    let mut s = raw.trim().to_uppercase();
    if s.is_empty() {
        return None;
    }

    for suffix in PERP_SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.to_string();
            break;
        }
    }

    // Forms with an explicit separator: BASE/QUOTE[:SETTLE], BASE-QUOTE,
    // BASE_QUOTE.
    let (base, quote) = if let Some((base, rest)) = s.split_once('/') {
        let quote = rest.split(':').next().unwrap_or(rest);
        (base.to_string(), quote.to_string())
    } else if let Some((base, quote)) = s.split_once('-').or_else(|| s.split_once('_')) {
        (base.to_string(), quote.to_string())
    } else {
        // Concatenated form: find a known quote suffix.
        match QUOTE_ALIASES
            .iter()
            .find(|q| s.ends_with(**q) && s.len() > q.len())
        {
            Some(q) => (s[..s.len() - q.len()].to_string(), (*q).to_string()),
            // Bare base (e.g. `ETH` left over from `ETH-PERP`).
            None => (s.clone(), "USDT".to_string()),
        }
    };

    if base.is_empty() || !base.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    let quote = if QUOTE_ALIASES.contains(&quote.as_str()) {
        "USDT"
    } else {
        return None;
    };

    Some(format!("{base}/{quote}:{quote}"))
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawFundingRecord {
    exchange: String,
    symbol: String,
    /// Integer bps x 100.
    funding_rate: i64,
    #[serde(default = "default_interval")]
    interval_hours: u32,
    #[serde(default)]
    open_interest_usd: Option<f64>,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
}

fn default_interval() -> u32 {
    8
}

fn snapshot_from_record(record: RawFundingRecord) -> Option<FundingSnapshot> {
    let symbol = match canonical_symbol(&record.symbol) {
        Some(symbol) => symbol,
        None => {
            warn!(raw = %record.symbol, "unresolvable symbol skipped");
            return None;
        }
    };

    let rate = normalize_rate(record.funding_rate, record.interval_hours);
    if !rate.is_finite() {
        warn!(symbol = %symbol, venue = %record.exchange, "non-finite rate skipped");
        return None;
    }

    let oi = record.open_interest_usd.filter(|v| v.is_finite() && *v >= 0.0);

    Some(FundingSnapshot {
        venue: record.exchange.to_lowercase(),
        symbol,
        rate,
        interval_hours: record.interval_hours,
        open_interest_usd: oi,
        bid: record.bid.filter(|v| v.is_finite()),
        ask: record.ask.filter(|v| v.is_finite()),
        observed_at: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct CachedFetch {
    epoch: u64,
    fetched_at: Instant,
    snapshots: Vec<FundingSnapshot>,
}

/// HTTP client for the funding-rate aggregator.
pub struct FundingClient {
    http: reqwest::Client,
    base_url: String,
    cache: RwLock<Option<CachedFetch>>,
}

impl FundingClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to build reqwest client for FundingClient");

        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(None),
        }
    }

    /// All venues, all symbols, normalized. Served from cache within the TTL.
    pub async fn fetch_all(&self) -> Result<Vec<FundingSnapshot>, EngineError> {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                debug!(epoch = cached.epoch, "funding served from cache");
                return Ok(cached.snapshots.clone());
            }
        }

        let snapshots = self.fetch_with_retries().await?;

        let mut cache = self.cache.write();
        let epoch = cache.as_ref().map(|c| c.epoch + 1).unwrap_or(1);
        info!(
            epoch,
            count = snapshots.len(),
            "funding snapshot refreshed from aggregator"
        );
        *cache = Some(CachedFetch {
            epoch,
            fetched_at: Instant::now(),
            snapshots: snapshots.clone(),
        });

        Ok(snapshots)
    }

    /// Single (venue, symbol) lookup.
    pub async fn get_rate(
        &self,
        venue: &str,
        symbol: &str,
    ) -> Result<FundingSnapshot, EngineError> {
        let snapshots = self.fetch_all().await?;
        snapshots
            .into_iter()
            .find(|s| s.venue == venue && s.symbol == symbol)
            .ok_or_else(|| EngineError::NotFound {
                venue: venue.to_string(),
                symbol: symbol.to_string(),
            })
    }

    /// symbol -> venue -> snapshot, restricted to `symbols`.
    pub async fn get_rates_by_symbols(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, HashMap<String, FundingSnapshot>>, EngineError> {
        let snapshots = self.fetch_all().await?;
        let mut out: BTreeMap<String, HashMap<String, FundingSnapshot>> = BTreeMap::new();
        for snapshot in snapshots {
            if symbols.contains(&snapshot.symbol) {
                out.entry(snapshot.symbol.clone())
                    .or_default()
                    .insert(snapshot.venue.clone(), snapshot);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn fetch_with_retries(&self) -> Result<Vec<FundingSnapshot>, EngineError> {
        let url = format!("{}/funding", self.base_url);
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.fetch_once(&url).await {
                Ok(snapshots) => return Ok(snapshots),
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "aggregator fetch failed - backing off"
                    );
                    last_error = err.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    last_error = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::Transient(format!(
            "aggregator fetch failed after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<FundingSnapshot>, EngineError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("GET {url}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(EngineError::Transient(format!(
                "aggregator returned {status}"
            )));
        }
        if !status.is_success() {
            // 4xx is terminal: retrying the same request cannot help.
            return Err(EngineError::DataQuality(format!(
                "aggregator returned {status}"
            )));
        }

        let records: Vec<RawFundingRecord> = resp
            .json()
            .await
            .map_err(|e| EngineError::DataQuality(format!("malformed funding payload: {e}")))?;

        Ok(records.into_iter().filter_map(snapshot_from_record).collect())
    }
}

/// 0.5 s, 1 s, 2 s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt.saturating_sub(1)))
}

impl std::fmt::Debug for FundingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FundingClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_normalization_law() {
        assert!((normalize_rate(25, 8) - 0.0025).abs() < 1e-12);
        assert!((normalize_rate(25, 1) - 0.0025 / 8.0).abs() < 1e-12);
        assert!((normalize_rate(25, 4) - 0.0025 / 2.0).abs() < 1e-12);
        // Longer-than-8h intervals are already comparable.
        assert!((normalize_rate(25, 24) - 0.0025).abs() < 1e-12);
        assert!((normalize_rate(-30, 8) + 0.0030).abs() < 1e-12);
        // A zero interval must not divide anything.
        assert!((normalize_rate(25, 0) - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn symbol_canonicalization() {
        assert_eq!(canonical_symbol("BTCUSDT").unwrap(), "BTC/USDT:USDT");
        assert_eq!(canonical_symbol("btcusdt").unwrap(), "BTC/USDT:USDT");
        assert_eq!(canonical_symbol("ETH-PERP").unwrap(), "ETH/USDT:USDT");
        assert_eq!(canonical_symbol("SOL/USDC").unwrap(), "SOL/USDT:USDT");
        assert_eq!(canonical_symbol("BTC/USDT:USDT").unwrap(), "BTC/USDT:USDT");
        assert_eq!(canonical_symbol("DOGE_USD").unwrap(), "DOGE/USDT:USDT");
        assert_eq!(canonical_symbol("1000PEPEUSDT").unwrap(), "1000PEPE/USDT:USDT");
        assert!(canonical_symbol("").is_none());
        assert!(canonical_symbol("BTC/EUR").is_none());
    }

    #[test]
    fn record_parsing_skips_bad_rows() {
        let good = RawFundingRecord {
            exchange: "Alpha".into(),
            symbol: "BTCUSDT".into(),
            funding_rate: 25,
            interval_hours: 8,
            open_interest_usd: Some(1_000_000.0),
            bid: Some(50_000.0),
            ask: Some(50_001.0),
        };
        let snap = snapshot_from_record(good).unwrap();
        assert_eq!(snap.venue, "alpha");
        assert_eq!(snap.symbol, "BTC/USDT:USDT");
        assert!((snap.rate - 0.0025).abs() < 1e-12);

        let bad_symbol = RawFundingRecord {
            exchange: "Alpha".into(),
            symbol: "???".into(),
            funding_rate: 25,
            interval_hours: 8,
            open_interest_usd: None,
            bid: None,
            ask: None,
        };
        assert!(snapshot_from_record(bad_symbol).is_none());

        let negative_oi = RawFundingRecord {
            exchange: "Alpha".into(),
            symbol: "ETHUSDT".into(),
            funding_rate: -12,
            interval_hours: 1,
            open_interest_usd: Some(-5.0),
            bid: None,
            ask: None,
        };
        let snap = snapshot_from_record(negative_oi).unwrap();
        assert!(snap.open_interest_usd.is_none());
        assert!((snap.rate + 0.0012 / 8.0).abs() < 1e-12);
    }

    #[test]
    fn backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
    }
}
