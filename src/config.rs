// =============================================================================
// Engine Configuration - JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable parameter lives here. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
// Persistence uses the tmp + rename pattern to prevent corruption on crash.
//
// Validation is fail-fast: a config that does not validate terminates the
// process at startup with exit code 1.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_aggregator_url() -> String {
    "http://127.0.0.1:8900".to_string()
}

fn default_universe_size() -> usize {
    25
}

fn default_fr_diff_min() -> f64 {
    0.002
}

fn default_min_persistence_windows() -> u32 {
    1
}

fn default_min_pair_score() -> f64 {
    0.30
}

fn default_expected_edge_min_bps() -> f64 {
    1.0
}

fn default_max_new_positions_per_cycle() -> usize {
    1
}

fn default_max_notional_per_pair_usd() -> f64 {
    40.0
}

fn default_max_notional_per_symbol_usd() -> f64 {
    40.0
}

fn default_max_notional_per_venue_usd() -> f64 {
    50.0
}

fn default_max_total_notional_usd() -> f64 {
    50.0
}

fn default_max_leverage() -> f64 {
    5.0
}

fn default_normal_leverage_cap() -> f64 {
    2.0
}

fn default_reduce_leverage_cap() -> f64 {
    1.0
}

fn default_reduce_mode_drawdown_pct() -> f64 {
    0.10
}

fn default_max_drawdown_stop_pct() -> f64 {
    0.15
}

fn default_recover_normal_drawdown_pct() -> f64 {
    0.08
}

fn default_recover_reduce_drawdown_pct() -> f64 {
    0.13
}

fn default_cycle_period_seconds() -> u64 {
    600
}

fn default_fee_bps_per_leg() -> f64 {
    4.0
}

fn default_capital_fraction() -> f64 {
    0.40
}

fn default_min_order_usd() -> f64 {
    10.0
}

fn default_rebalance_threshold_pct() -> f64 {
    0.20
}

fn default_partial_fill_tolerance() -> f64 {
    0.10
}

fn default_leg_fill_timeout_secs() -> u64 {
    10
}

fn default_intent_deadline_secs() -> u64 {
    30
}

fn default_cycle_deadline_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_open_interest_usd() -> f64 {
    5_000_000.0
}

fn default_starting_capital_usd() -> f64 {
    1000.0
}

fn default_state_path() -> String {
    "meridian_state.json".to_string()
}

// =============================================================================
// Sub-structures
// =============================================================================

/// Which sources the market-data service merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataMode {
    #[default]
    Aggregator,
    Hybrid,
    Venue,
}

impl std::fmt::Display for MarketDataMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aggregator => write!(f, "aggregator"),
            Self::Hybrid => write!(f, "hybrid"),
            Self::Venue => write!(f, "venue"),
        }
    }
}

/// Weights of the dynamic universe composite score. Must sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseWeights {
    pub spread: f64,
    pub coverage: f64,
    pub rate: f64,
}

impl Default for UniverseWeights {
    fn default() -> Self {
        Self {
            spread: 0.60,
            coverage: 0.25,
            rate: 0.15,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian carry engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Data sources --------------------------------------------------------

    /// Base URL of the funding-rate aggregator (`GET {url}/funding`).
    #[serde(default = "default_aggregator_url")]
    pub aggregator_url: String,

    /// How quotes are assembled. Hybrid pulls open interest and top-of-book
    /// from venue adapters on top of aggregator funding.
    #[serde(default)]
    pub market_data_mode: MarketDataMode,

    // --- Universe ------------------------------------------------------------

    /// Static symbol list (canonical form). Empty activates dynamic selection.
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Top-K size of the dynamic universe.
    #[serde(default = "default_universe_size")]
    pub universe_size: usize,

    #[serde(default)]
    pub universe_weights: UniverseWeights,

    // --- Signal thresholds ---------------------------------------------------

    /// Minimum cross-venue funding spread (decimal per 8 h) for a symbol or
    /// pair to be interesting.
    #[serde(default = "default_fr_diff_min")]
    pub fr_diff_min: f64,

    /// Cycles a pair must qualify consecutively before an intent is emitted.
    #[serde(default = "default_min_persistence_windows")]
    pub min_persistence_windows: u32,

    #[serde(default = "default_min_pair_score")]
    pub min_pair_score: f64,

    #[serde(default = "default_expected_edge_min_bps")]
    pub expected_edge_min_bps: f64,

    /// Allow both legs on the same venue.
    #[serde(default = "default_true")]
    pub allow_single_exchange_pairs: bool,

    // --- Fees ----------------------------------------------------------------

    /// Round-trip taker cost per leg in bps, used when a venue has no
    /// explicit entry in `fee_bps_overrides`.
    #[serde(default = "default_fee_bps_per_leg")]
    pub fee_bps_per_leg: f64,

    /// Per-venue round-trip taker fee overrides (bps per leg).
    #[serde(default)]
    pub fee_bps_overrides: HashMap<String, f64>,

    // --- Sizing --------------------------------------------------------------

    #[serde(default = "default_capital_fraction")]
    pub capital_fraction: f64,

    #[serde(default = "default_min_order_usd")]
    pub min_order_usd: f64,

    #[serde(default = "default_max_new_positions_per_cycle")]
    pub max_new_positions_per_cycle: usize,

    /// Relative volatility per symbol; beta of a pair is vol(long)/vol(short).
    /// Unknown symbols default to 1.0.
    #[serde(default)]
    pub beta_overrides: HashMap<String, f64>,

    // --- Caps ----------------------------------------------------------------

    #[serde(default = "default_max_notional_per_pair_usd")]
    pub max_notional_per_pair_usd: f64,

    #[serde(default = "default_max_notional_per_symbol_usd")]
    pub max_notional_per_symbol_usd: f64,

    #[serde(default = "default_max_notional_per_venue_usd")]
    pub max_notional_per_venue_usd: f64,

    #[serde(default = "default_max_total_notional_usd")]
    pub max_total_notional_usd: f64,

    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,

    #[serde(default = "default_normal_leverage_cap")]
    pub normal_leverage_cap: f64,

    #[serde(default = "default_reduce_leverage_cap")]
    pub reduce_leverage_cap: f64,

    // --- Drawdown state machine ----------------------------------------------

    /// NORMAL -> REDUCE trip point.
    #[serde(default = "default_reduce_mode_drawdown_pct")]
    pub reduce_mode_drawdown_pct: f64,

    /// {NORMAL, REDUCE} -> HALT_NEW trip point.
    #[serde(default = "default_max_drawdown_stop_pct")]
    pub max_drawdown_stop_pct: f64,

    /// REDUCE -> NORMAL recovery point (hysteresis band).
    #[serde(default = "default_recover_normal_drawdown_pct")]
    pub recover_normal_drawdown_pct: f64,

    /// HALT_NEW -> REDUCE recovery point.
    #[serde(default = "default_recover_reduce_drawdown_pct")]
    pub recover_reduce_drawdown_pct: f64,

    /// Leg drift from target before a rebalance directive fires.
    #[serde(default = "default_rebalance_threshold_pct")]
    pub rebalance_threshold_pct: f64,

    // --- Execution -----------------------------------------------------------

    #[serde(default = "default_partial_fill_tolerance")]
    pub partial_fill_tolerance: f64,

    #[serde(default = "default_leg_fill_timeout_secs")]
    pub leg_fill_timeout_secs: u64,

    #[serde(default = "default_intent_deadline_secs")]
    pub intent_deadline_secs: u64,

    /// Recovery policy: flatten unmatched legs (true) or abort as divergence.
    #[serde(default = "default_true")]
    pub flatten_on_divergence: bool,

    // --- Scheduling ----------------------------------------------------------

    #[serde(default = "default_cycle_period_seconds")]
    pub cycle_period_seconds: u64,

    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Portfolio -----------------------------------------------------------

    #[serde(default = "default_starting_capital_usd")]
    pub starting_capital_usd: f64,

    /// Assumed open interest when a venue cannot supply one.
    #[serde(default = "default_open_interest_usd")]
    pub default_open_interest_usd: f64,

    // --- Persistence & alerting ----------------------------------------------

    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Optional webhook for monitoring events. None disables posting.
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes from defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            mode = %config.market_data_mode,
            cycle_period_seconds = config.cycle_period_seconds,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialize config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Round-trip taker fee for one leg on `venue`, in bps.
    pub fn fee_bps_for(&self, venue: &str) -> f64 {
        self.fee_bps_overrides
            .get(venue)
            .copied()
            .unwrap_or(self.fee_bps_per_leg)
    }

    /// Fail-fast validation. Called once at startup.
    pub fn validate(&self) -> Result<(), EngineError> {
        let w = &self.universe_weights;
        let sum = w.spread + w.coverage + w.rate;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::Config(format!(
                "universe weights must sum to 1.0, got {sum}"
            )));
        }
        if w.spread < 0.0 || w.coverage < 0.0 || w.rate < 0.0 {
            return Err(EngineError::Config("universe weights must be non-negative".into()));
        }

        // Hysteresis thresholds must be strictly ordered:
        //   recover_normal < reduce < recover_reduce < stop
        let (rn, rd, rr, st) = (
            self.recover_normal_drawdown_pct,
            self.reduce_mode_drawdown_pct,
            self.recover_reduce_drawdown_pct,
            self.max_drawdown_stop_pct,
        );
        if !(rn < rd && rd < rr && rr < st) {
            return Err(EngineError::Config(format!(
                "drawdown thresholds must satisfy recover_normal < reduce < recover_reduce < stop, \
                 got {rn} / {rd} / {rr} / {st}"
            )));
        }

        for (name, value) in [
            ("max_notional_per_pair_usd", self.max_notional_per_pair_usd),
            ("max_notional_per_symbol_usd", self.max_notional_per_symbol_usd),
            ("max_notional_per_venue_usd", self.max_notional_per_venue_usd),
            ("max_total_notional_usd", self.max_total_notional_usd),
            ("max_leverage", self.max_leverage),
            ("normal_leverage_cap", self.normal_leverage_cap),
            ("reduce_leverage_cap", self.reduce_leverage_cap),
            ("starting_capital_usd", self.starting_capital_usd),
            ("min_order_usd", self.min_order_usd),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(EngineError::Config(format!("{name} must be positive, got {value}")));
            }
        }

        if !(0.0..=1.0).contains(&self.capital_fraction) {
            return Err(EngineError::Config(format!(
                "capital_fraction must be in [0, 1], got {}",
                self.capital_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.partial_fill_tolerance) {
            return Err(EngineError::Config(format!(
                "partial_fill_tolerance must be in [0, 1], got {}",
                self.partial_fill_tolerance
            )));
        }
        if self.cycle_period_seconds == 0 {
            return Err(EngineError::Config("cycle_period_seconds must be > 0".into()));
        }

        Ok(())
    }

    /// Lease duration for the cross-process instance lock.
    pub fn lock_lease(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cycle_period_seconds * 3)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.universe_size, 25);
        assert!((cfg.fr_diff_min - 0.002).abs() < f64::EPSILON);
        assert_eq!(cfg.min_persistence_windows, 1);
        assert!((cfg.min_pair_score - 0.30).abs() < f64::EPSILON);
        assert!((cfg.expected_edge_min_bps - 1.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_new_positions_per_cycle, 1);
        assert!((cfg.max_notional_per_pair_usd - 40.0).abs() < f64::EPSILON);
        assert!((cfg.max_total_notional_usd - 50.0).abs() < f64::EPSILON);
        assert!((cfg.max_leverage - 5.0).abs() < f64::EPSILON);
        assert!(cfg.allow_single_exchange_pairs);
        assert_eq!(cfg.cycle_period_seconds, 600);
        assert!((cfg.fee_bps_per_leg - 4.0).abs() < f64::EPSILON);
        assert!((cfg.capital_fraction - 0.40).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.market_data_mode, MarketDataMode::Aggregator);
        assert!(cfg.symbols.is_empty());
        assert!((cfg.reduce_mode_drawdown_pct - 0.10).abs() < f64::EPSILON);
        assert!((cfg.max_drawdown_stop_pct - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["BTC/USDT:USDT"], "market_data_mode": "hybrid" }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["BTC/USDT:USDT"]);
        assert_eq!(cfg.market_data_mode, MarketDataMode::Hybrid);
        assert_eq!(cfg.universe_size, 25);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.cycle_period_seconds, cfg2.cycle_period_seconds);
        assert_eq!(cfg.market_data_mode, cfg2.market_data_mode);
    }

    #[test]
    fn bad_weights_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.universe_weights = UniverseWeights {
            spread: 0.9,
            coverage: 0.3,
            rate: 0.1,
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn unordered_hysteresis_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.recover_reduce_drawdown_pct = 0.20; // above the stop threshold
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("meridian-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = EngineConfig::default();
        cfg.symbols = vec!["BTC/USDT:USDT".to_string()];
        cfg.cycle_period_seconds = 120;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);
        assert_eq!(loaded.cycle_period_seconds, 120);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn per_venue_fee_override() {
        let mut cfg = EngineConfig::default();
        cfg.fee_bps_overrides.insert("hyper".into(), 2.5);
        assert!((cfg.fee_bps_for("hyper") - 2.5).abs() < f64::EPSILON);
        assert!((cfg.fee_bps_for("other") - 4.0).abs() < f64::EPSILON);
    }
}
