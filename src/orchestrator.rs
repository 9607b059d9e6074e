// =============================================================================
// Orchestrator - the single-writer cycle loop
// =============================================================================
//
// One cycle, strict step order:
//   1. Load portfolio state and persistence counters (store is authoritative).
//   2. Refresh quotes from the market-data service.
//   3. Resolve the universe (static list verbatim, dynamic otherwise).
//   4. Build candidates; roll the persistence counters.
//   5. Evaluate risk: admitted intents + shrink/rebalance directives.
//   6. Execute rebalances and shrinks first, then new intents.
//   7. Accrue funding, recompute equity/peak/drawdown, step the risk state.
//   8. Persist state + counters + pair records + summary in one batch.
//   9. Emit monitoring events.
//
// Mutations of PortfolioState happen nowhere else; cycle_id increases
// monotonically, and cycles never overlap (in-process guard here, the
// cross-process store lock in main).
//
// Crash recovery runs before the first cycle: recorded open pairs reconcile
// against live venue positions under the flatten_or_adopt policy, and any
// orphan venue exposure is flattened (or, if flattening is disabled or
// fails, startup aborts as an unrecoverable divergence).
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::{ExecutionService, IntentOutcome};
use crate::market_data::MarketDataService;
use crate::monitor::{EventKind, Monitor, SKIPPED_CYCLES_ALERT};
use crate::risk::{RiskDecision, RiskService};
use crate::signal::{idempotency_key, SignalService};
use crate::store::{cycle_summary_key, pair_record_key, StateStore, KEY_COUNTERS, KEY_PORTFOLIO};
use crate::types::{PairStatus, PortfolioState, RiskState, Side, TradeIntent};
use crate::universe::UniverseProvider;
use crate::venue::VenueAdapter;

/// Seconds in one 8 h funding window.
const FUNDING_WINDOW_SECS: f64 = 8.0 * 3600.0;

// ---------------------------------------------------------------------------
// Cycle summary
// ---------------------------------------------------------------------------

/// Persisted under `cycles/<cycle_id>/summary` and logged at cycle end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub universe_size: usize,
    pub candidates: usize,
    pub gated: usize,
    pub intents: usize,
    pub admitted: usize,
    pub executed: usize,
    pub flattened: usize,
    pub failed: usize,
    pub rebalanced: usize,
    pub shrunk: usize,
    pub blocked_reason: Option<String>,
    pub risk_state_before: RiskState,
    pub risk_state_after: RiskState,
    pub equity_usd: f64,
    pub drawdown: f64,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    cfg: EngineConfig,
    market: MarketDataService,
    universe: UniverseProvider,
    signal: SignalService,
    risk: RiskService,
    execution: ExecutionService,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    store: Arc<dyn StateStore>,
    monitor: Monitor,

    portfolio: PortfolioState,
    counters: BTreeMap<String, u32>,

    /// In-process single-writer guard; the cross-process lock lives in the
    /// store and is managed by the binary entry point.
    cycle_guard: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl Orchestrator {
    pub fn new(
        cfg: EngineConfig,
        market: MarketDataService,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        store: Arc<dyn StateStore>,
        monitor: Monitor,
    ) -> Self {
        let universe = UniverseProvider::new(
            cfg.universe_size,
            cfg.fr_diff_min,
            cfg.universe_weights.clone(),
        );
        let signal = SignalService::new(cfg.clone());
        let risk = RiskService::new(cfg.clone());
        let execution = ExecutionService::new(venues.clone(), cfg.clone());
        let portfolio = PortfolioState::new(cfg.starting_capital_usd);

        Self {
            cfg,
            market,
            universe,
            signal,
            risk,
            execution,
            venues,
            store,
            monitor,
            portfolio,
            counters: BTreeMap::new(),
            cycle_guard: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    pub fn persistence_counters(&self) -> &BTreeMap<String, u32> {
        &self.counters
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Load persisted state and reconcile it against the venues. Must run
    /// before the first cycle.
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        self.load_state().await?;
        self.recover().await?;
        self.persist(None).await?;
        info!(
            cycle_id = self.portfolio.last_cycle_id,
            equity = self.portfolio.equity_usd,
            open_pairs = self.portfolio.open_pairs.len(),
            "orchestrator initialized"
        );
        Ok(())
    }

    async fn load_state(&mut self) -> Result<(), EngineError> {
        if let Some(raw) = self.store.get(KEY_PORTFOLIO).await? {
            self.portfolio = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Store(format!("corrupt portfolio record: {e}")))?;
            debug!(cycle_id = self.portfolio.last_cycle_id, "portfolio state loaded");
        }
        if let Some(raw) = self.store.get(KEY_COUNTERS).await? {
            self.counters = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Store(format!("corrupt counters record: {e}")))?;
        }
        Ok(())
    }

    /// flatten_or_adopt: a recorded pair whose legs both exist on the venues
    /// at expected sizes is adopted; anything else is flattened. Venue
    /// exposure not explained by any recorded pair is flattened too (or
    /// aborts startup when flattening is disabled or fails).
    async fn recover(&mut self) -> Result<(), EngineError> {
        // Signed net exposure per (venue, symbol): buys positive.
        let mut remaining: BTreeMap<(String, String), f64> = BTreeMap::new();
        for (venue_id, adapter) in &self.venues {
            let positions = adapter.positions().await?;
            for p in positions {
                let signed = match p.side {
                    Side::Buy => p.notional_usd,
                    Side::Sell => -p.notional_usd,
                };
                *remaining
                    .entry((venue_id.clone(), p.symbol.clone()))
                    .or_insert(0.0) += signed;
            }
        }

        let tolerance = self.cfg.partial_fill_tolerance;
        let mut to_flatten: Vec<String> = Vec::new();
        let mut closed_records: Vec<(String, String)> = Vec::new();

        for (pair_id, pair) in &self.portfolio.open_pairs {
            if pair.status != PairStatus::Open {
                continue;
            }

            let mut covered = true;
            for leg in [&pair.short, &pair.long] {
                let key = (leg.venue.clone(), leg.symbol.clone());
                let available = remaining.get(&key).copied().unwrap_or(0.0);
                let needed = match leg.side {
                    Side::Buy => leg.current_notional_usd,
                    Side::Sell => -leg.current_notional_usd,
                };
                let slack = leg.current_notional_usd * tolerance;
                let ok = match leg.side {
                    Side::Buy => available >= needed - slack,
                    Side::Sell => available <= needed + slack,
                };
                if !ok {
                    covered = false;
                }
            }

            if covered {
                for leg in [&pair.short, &pair.long] {
                    let key = (leg.venue.clone(), leg.symbol.clone());
                    let signed = match leg.side {
                        Side::Buy => leg.current_notional_usd,
                        Side::Sell => -leg.current_notional_usd,
                    };
                    *remaining.entry(key).or_insert(0.0) -= signed;
                }
                info!(pair_id = %pair_id, "recovery: pair adopted");
            } else {
                warn!(pair_id = %pair_id, "recovery: pair legs diverged - flattening");
                to_flatten.push(pair_id.clone());
            }
        }

        // Flatten diverged pairs: close only the portion the venues still
        // hold (closing a leg the venue no longer has would create inverse
        // exposure), then retire the record.
        for pair_id in to_flatten {
            let Some(mut pair) = self.portfolio.open_pairs.remove(&pair_id) else {
                continue;
            };
            if !self.cfg.flatten_on_divergence {
                return Err(EngineError::StateDivergence(format!(
                    "pair {pair_id} diverged from venue state and flattening is disabled"
                )));
            }

            for (leg, suffix) in [(&pair.short, "s"), (&pair.long, "l")] {
                let key = (leg.venue.clone(), leg.symbol.clone());
                let net = remaining.get(&key).copied().unwrap_or(0.0);
                // Exposure on the venue in this leg's direction.
                let existing = match leg.side {
                    Side::Buy => net.max(0.0),
                    Side::Sell => (-net).max(0.0),
                };
                let close_usd = leg.current_notional_usd.min(existing);
                if close_usd <= 0.0 {
                    continue;
                }

                let adapter = self.venues.get(&leg.venue).ok_or_else(|| {
                    EngineError::StateDivergence(format!(
                        "pair {pair_id} references unknown venue {}",
                        leg.venue
                    ))
                })?;
                let order_id = format!(
                    "rcv{}-{}-{suffix}",
                    &pair_id[..8.min(pair_id.len())],
                    self.portfolio.last_cycle_id + 1
                );
                adapter
                    .place_order(&leg.symbol, leg.side.opposite(), close_usd, &order_id)
                    .await
                    .map_err(|e| {
                        EngineError::StateDivergence(format!(
                            "failed to flatten diverged pair {pair_id}: {e}"
                        ))
                    })?;

                let signed = match leg.side {
                    Side::Buy => close_usd,
                    Side::Sell => -close_usd,
                };
                if let Some(v) = remaining.get_mut(&key) {
                    *v -= signed;
                }
            }

            self.portfolio.capital_usd += pair.mark_to_market_usd;
            pair.realized_pnl_usd = pair.mark_to_market_usd;
            pair.mark_to_market_usd = 0.0;
            pair.status = PairStatus::Closed;
            pair.closed_at = Some(Utc::now());
            pair.close_reason = Some("recovery_flatten".to_string());
            closed_records.push((
                pair_record_key(&pair.id),
                serde_json::to_string(&pair).map_err(|e| EngineError::Store(e.to_string()))?,
            ));
            self.monitor
                .emit(
                    self.portfolio.last_cycle_id,
                    EventKind::EmergencyFlatten {
                        pair_key: pair.pair_key.clone(),
                        reason: "recovery divergence".to_string(),
                    },
                )
                .await;
        }

        // Whatever exposure is left matches no recorded pair.
        for ((venue_id, symbol), net) in remaining {
            if net.abs() < 1e-6 {
                continue;
            }
            if !self.cfg.flatten_on_divergence {
                return Err(EngineError::StateDivergence(format!(
                    "orphan exposure {net:.2} USD on {venue_id}/{symbol} and flattening is disabled"
                )));
            }
            warn!(
                venue = %venue_id,
                symbol = %symbol,
                net_usd = net,
                "recovery: flattening orphan venue exposure"
            );
            let adapter = self.venues.get(&venue_id).ok_or_else(|| {
                EngineError::StateDivergence(format!("orphan exposure on unknown venue {venue_id}"))
            })?;
            let side = if net > 0.0 { Side::Sell } else { Side::Buy };
            let order_id = idempotency_key(
                self.portfolio.last_cycle_id + 1,
                &format!("{venue_id}:{symbol}"),
                "recovery",
            );
            adapter
                .place_order(&symbol, side, net.abs(), &order_id)
                .await
                .map_err(|e| {
                    EngineError::StateDivergence(format!(
                        "failed to flatten orphan exposure on {venue_id}/{symbol}: {e}"
                    ))
                })?;
        }

        if !closed_records.is_empty() {
            self.store.put_batch(closed_records).await?;
        }

        self.portfolio.recompute_equity();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // The cycle
    // -------------------------------------------------------------------------

    /// Run one full cycle under the global deadline, mapping a deadline hit
    /// to a skipped cycle (open legs reconcile at the next start).
    pub async fn run_cycle_guarded(&mut self) -> Result<CycleSummary, EngineError> {
        let deadline = Duration::from_secs(self.cfg.cycle_deadline_secs);
        let result = match tokio::time::timeout(deadline, self.run_cycle()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::CycleSkipped(format!(
                "cycle deadline of {}s exceeded",
                self.cfg.cycle_deadline_secs
            ))),
        };

        match result {
            Ok(summary) => {
                self.portfolio.consecutive_skipped_cycles = 0;
                Ok(summary)
            }
            Err(e) if e.is_transient() || matches!(e, EngineError::CycleSkipped(_)) => {
                self.portfolio.consecutive_skipped_cycles += 1;
                let consecutive = self.portfolio.consecutive_skipped_cycles;
                warn!(consecutive, error = %e, "cycle skipped");
                if consecutive > SKIPPED_CYCLES_ALERT {
                    self.monitor
                        .emit(
                            self.portfolio.last_cycle_id,
                            EventKind::CycleSkipped {
                                consecutive,
                                reason: e.to_string(),
                            },
                        )
                        .await;
                }
                Err(EngineError::CycleSkipped(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleSummary, EngineError> {
        let cycle_guard = self.cycle_guard.clone();
        let _guard = cycle_guard.lock().await;
        let started_at = Utc::now();

        // --- 1. Authoritative state ---------------------------------------
        self.load_state().await?;
        let cycle_id = self.portfolio.last_cycle_id + 1;
        let risk_state_before = self.portfolio.risk_state;
        let equity_before = self.portfolio.equity_usd;

        // --- 2 & 3. Quotes and universe -----------------------------------
        let quotes = if self.cfg.symbols.is_empty() {
            let supported: Vec<String> =
                self.market.supported_symbols().await?.into_iter().collect();
            let all_quotes = self.market.snapshot(&supported).await?;
            let selected = self.universe.select(&all_quotes);
            all_quotes
                .into_iter()
                .filter(|(symbol, _)| selected.contains(symbol))
                .collect()
        } else {
            self.market.snapshot(&self.cfg.symbols).await?
        };

        // --- 4. Candidates and persistence --------------------------------
        let candidates = self.signal.build_candidates(&quotes);
        self.counters = SignalService::roll_persistence(&self.counters, &candidates);
        let gated = self.signal.gate_persistent(&self.counters, &candidates);

        let intents = self.signal.build_intents(
            cycle_id,
            &gated,
            self.portfolio.capital_usd,
            &self.portfolio.open_pair_keys(),
        );

        // --- 5. Risk --------------------------------------------------------
        let decision = self.risk.evaluate(&self.portfolio, &intents);
        if decision.state != risk_state_before {
            self.monitor
                .emit(
                    cycle_id,
                    EventKind::RiskTransition {
                        from: risk_state_before.to_string(),
                        to: decision.state.to_string(),
                        drawdown: decision.drawdown,
                    },
                )
                .await;
        }
        self.portfolio.risk_state = decision.state;
        for rejected in &decision.rejected {
            debug!(pair = %rejected.pair_key, reason = %rejected.reason, "intent not admitted");
        }

        // --- 6. Execution ---------------------------------------------------
        let (rebalanced, shrunk) = self.apply_directives(&decision, cycle_id).await;
        let (executed, flattened, failed, attempted) =
            self.execute_intents(&decision.admitted, cycle_id).await;

        // --- 7. Accrual and state step -------------------------------------
        self.accrue_funding();
        self.portfolio.recompute_equity();
        let drawdown = self.portfolio.drawdown();
        self.portfolio.risk_state = crate::risk::next_state(
            self.portfolio.risk_state,
            drawdown,
            self.risk.thresholds(),
        );
        if self.zombie_present() && self.portfolio.risk_state != RiskState::HaltNew {
            // Execution-fatal overrides the drawdown machine.
            self.portfolio.risk_state = RiskState::HaltNew;
        }

        self.portfolio.last_cycle_id = cycle_id;
        self.portfolio.last_cycle_at = Some(started_at);

        let summary = CycleSummary {
            cycle_id,
            started_at,
            universe_size: quotes.len(),
            candidates: candidates.len(),
            gated: gated.len(),
            intents: intents.len(),
            admitted: decision.admitted.len(),
            executed,
            flattened,
            failed,
            rebalanced,
            shrunk,
            blocked_reason: decision.blocked_reason.clone(),
            risk_state_before,
            risk_state_after: self.portfolio.risk_state,
            equity_usd: self.portfolio.equity_usd,
            drawdown,
        };

        // --- 8. Atomic persist ---------------------------------------------
        self.persist(Some(&summary)).await?;

        // --- 9. Events ------------------------------------------------------
        self.monitor
            .check_cycle_anomalies(
                cycle_id,
                equity_before,
                self.portfolio.equity_usd,
                attempted,
                failed as u32 + flattened as u32,
            )
            .await;

        info!(
            cycle_id,
            candidates = summary.candidates,
            intents = summary.intents,
            executed = summary.executed,
            flattened = summary.flattened,
            rebalanced = summary.rebalanced,
            state = %summary.risk_state_after,
            equity = format!("{:.2}", summary.equity_usd),
            drawdown = format!("{:.4}", summary.drawdown),
            "cycle complete"
        );

        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // Cycle internals
    // -------------------------------------------------------------------------

    /// Rebalances first, then shrinks, per the execution ordering rules.
    async fn apply_directives(&mut self, decision: &RiskDecision, cycle_id: u64) -> (usize, usize) {
        let mut rebalanced = 0;
        for directive in &decision.rebalances {
            let Some(pair) = self.portfolio.open_pairs.get(&directive.pair_id).cloned() else {
                continue;
            };
            match self.execution.rebalance_leg(&pair, directive, cycle_id).await {
                Ok(new_notional) => {
                    if let Some(pair) = self.portfolio.open_pairs.get_mut(&directive.pair_id) {
                        match directive.leg {
                            crate::risk::PairLegSide::Short => {
                                pair.short.current_notional_usd = new_notional
                            }
                            crate::risk::PairLegSide::Long => {
                                pair.long.current_notional_usd = new_notional
                            }
                        }
                    }
                    rebalanced += 1;
                }
                Err(e) => {
                    warn!(pair_id = %directive.pair_id, error = %e, "rebalance failed");
                }
            }
        }

        let mut shrunk = 0;
        for directive in &decision.shrinks {
            let Some(pair) = self.portfolio.open_pairs.get(&directive.pair_id).cloned() else {
                continue;
            };
            match self.execution.shrink_pair(&pair, directive, cycle_id).await {
                Ok((short_usd, long_usd)) => {
                    if let Some(pair) = self.portfolio.open_pairs.get_mut(&directive.pair_id) {
                        pair.short.current_notional_usd = short_usd;
                        pair.long.current_notional_usd = long_usd;
                    }
                    shrunk += 1;
                }
                Err(e) => {
                    warn!(pair_id = %directive.pair_id, error = %e, "shrink failed");
                }
            }
        }

        (rebalanced, shrunk)
    }

    /// Returns (executed, flattened, failed, attempted).
    async fn execute_intents(
        &mut self,
        admitted: &[TradeIntent],
        cycle_id: u64,
    ) -> (usize, usize, usize, u32) {
        let mut executed = 0;
        let mut flattened = 0;
        let mut failed = 0;
        let mut attempted = 0u32;

        for intent in admitted {
            attempted += 1;
            match self.execution.execute_intent(intent).await {
                IntentOutcome::Opened(pair) => {
                    info!(pair_id = %pair.id, pair_key = %pair.pair_key, "pair recorded open");
                    self.portfolio.open_pairs.insert(pair.id.clone(), pair);
                    executed += 1;
                }
                IntentOutcome::AlreadyResolved { reason } => {
                    debug!(pair = %intent.pair_key, reason = %reason, "intent already terminal");
                }
                IntentOutcome::Flattened { error } => {
                    warn!(pair = %intent.pair_key, error = %error, "intent flattened");
                    self.monitor
                        .emit(
                            cycle_id,
                            EventKind::EmergencyFlatten {
                                pair_key: intent.pair_key.clone(),
                                reason: error.to_string(),
                            },
                        )
                        .await;
                    flattened += 1;
                }
                IntentOutcome::Failed { reason } => {
                    warn!(pair = %intent.pair_key, reason = %reason, "intent failed");
                    failed += 1;
                }
                IntentOutcome::Zombie(pair) => {
                    error!(pair_id = %pair.id, "ZOMBIE pair recorded - HALT_NEW forced");
                    self.monitor
                        .emit(
                            cycle_id,
                            EventKind::ZombiePair {
                                pair_id: pair.id.clone(),
                                reason: pair
                                    .close_reason
                                    .clone()
                                    .unwrap_or_else(|| "unknown".to_string()),
                            },
                        )
                        .await;
                    self.portfolio.open_pairs.insert(pair.id.clone(), pair);
                    failed += 1;
                }
            }
        }

        (executed, flattened, failed, attempted)
    }

    /// Accrue one cycle of funding on every open pair at its entry carry.
    fn accrue_funding(&mut self) {
        let window_fraction = self.cfg.cycle_period_seconds as f64 / FUNDING_WINDOW_SECS;
        for pair in self.portfolio.open_pairs.values_mut() {
            if pair.status != PairStatus::Open {
                continue;
            }
            let hedged_notional = pair
                .short
                .current_notional_usd
                .min(pair.long.current_notional_usd);
            let accrued = pair.entry_carry_8h() * hedged_notional * window_fraction;
            pair.accumulated_funding_usd += accrued;
            pair.mark_to_market_usd += accrued;
        }
    }

    fn zombie_present(&self) -> bool {
        self.portfolio
            .open_pairs
            .values()
            .any(|p| p.status == PairStatus::Zombie)
    }

    /// Single-batch write of everything the cycle touched.
    async fn persist(&self, summary: Option<&CycleSummary>) -> Result<(), EngineError> {
        let mut batch = vec![
            (
                KEY_PORTFOLIO.to_string(),
                serde_json::to_string(&self.portfolio)
                    .map_err(|e| EngineError::Store(e.to_string()))?,
            ),
            (
                KEY_COUNTERS.to_string(),
                serde_json::to_string(&self.counters)
                    .map_err(|e| EngineError::Store(e.to_string()))?,
            ),
        ];

        for (pair_id, pair) in &self.portfolio.open_pairs {
            batch.push((
                pair_record_key(pair_id),
                serde_json::to_string(pair).map_err(|e| EngineError::Store(e.to_string()))?,
            ));
        }

        if let Some(summary) = summary {
            batch.push((
                cycle_summary_key(summary.cycle_id),
                serde_json::to_string(summary).map_err(|e| EngineError::Store(e.to_string()))?,
            ));
        }

        self.store.put_batch(batch).await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("cycle_id", &self.portfolio.last_cycle_id)
            .field("open_pairs", &self.portfolio.open_pairs.len())
            .field("risk_state", &self.portfolio.risk_state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketDataMode;
    use crate::funding::FundingClient;
    use crate::store::MemoryStore;
    use crate::venue::{FillBehavior, PaperVenue, VenueMarketInfo};

    const SHORT_SYM: &str = "XXX/USDT:USDT";
    const LONG_SYM: &str = "YYY/USDT:USDT";

    fn test_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.symbols = vec![SHORT_SYM.to_string(), LONG_SYM.to_string()];
        cfg.market_data_mode = MarketDataMode::Venue;
        cfg.leg_fill_timeout_secs = 0;
        cfg.starting_capital_usd = 1000.0;
        cfg
    }

    fn paper_with_rates(short_rate: f64, long_rate: f64) -> Arc<PaperVenue> {
        let paper = Arc::new(PaperVenue::new("alpha", 10_000.0));
        paper.set_market_info(
            SHORT_SYM,
            VenueMarketInfo {
                rate_8h: Some(short_rate),
                interval_hours: Some(8),
                open_interest_usd: Some(8_000_000.0),
                bid: None,
                ask: None,
            },
        );
        paper.set_market_info(
            LONG_SYM,
            VenueMarketInfo {
                rate_8h: Some(long_rate),
                interval_hours: Some(8),
                open_interest_usd: Some(8_000_000.0),
                bid: None,
                ask: None,
            },
        );
        paper
    }

    fn orchestrator_with(
        cfg: EngineConfig,
        paper: Arc<PaperVenue>,
        store: Arc<MemoryStore>,
    ) -> Orchestrator {
        let funding = Arc::new(FundingClient::new(
            "http://127.0.0.1:1",
            Duration::from_millis(50),
        ));
        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert("alpha".into(), paper);
        let market = MarketDataService::new(
            cfg.market_data_mode,
            funding,
            venues.clone(),
            cfg.symbols.clone(),
            cfg.default_open_interest_usd,
        );
        let monitor = Monitor::new(None, Duration::from_millis(100));
        Orchestrator::new(cfg, market, venues, store, monitor)
    }

    #[tokio::test]
    async fn happy_path_cycle_opens_one_pair() {
        let store = Arc::new(MemoryStore::new());
        let paper = paper_with_rates(0.003, -0.002);
        let mut orch = orchestrator_with(test_config(), paper.clone(), store.clone());

        orch.initialize().await.unwrap();
        let summary = orch.run_cycle().await.unwrap();

        assert_eq!(summary.cycle_id, 1);
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.intents, 1);
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.risk_state_after, RiskState::Normal);

        let portfolio = orch.portfolio();
        assert_eq!(portfolio.open_pairs.len(), 1);
        let pair = portfolio.open_pairs.values().next().unwrap();
        assert!((pair.short.current_notional_usd - 40.0).abs() < 1e-9);
        assert!((pair.long.current_notional_usd - 40.0).abs() < 1e-9);

        // Equity invariant: capital + sum of pair MTM.
        let mtm: f64 = portfolio
            .open_pairs
            .values()
            .map(|p| p.mark_to_market_usd)
            .sum();
        assert!((portfolio.equity_usd - (portfolio.capital_usd + mtm)).abs() < 1e-9);

        // Persistence counter stepped to exactly 1.
        assert_eq!(orch.persistence_counters().values().copied().max(), Some(1));

        // Summary persisted.
        assert!(store.get(&cycle_summary_key(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn persistence_gate_defers_execution_one_cycle() {
        let store = Arc::new(MemoryStore::new());
        let paper = paper_with_rates(0.003, -0.002);
        let mut cfg = test_config();
        cfg.min_persistence_windows = 2;
        let mut orch = orchestrator_with(cfg, paper, store);

        orch.initialize().await.unwrap();

        // Cycle 1: qualifies, counter 1, no intent yet.
        let s1 = orch.run_cycle().await.unwrap();
        assert_eq!(s1.candidates, 1);
        assert_eq!(s1.gated, 0);
        assert_eq!(s1.executed, 0);

        // Cycle 2: counter 2 clears the gate and the pair opens.
        let s2 = orch.run_cycle().await.unwrap();
        assert_eq!(s2.gated, 1);
        assert_eq!(s2.executed, 1);
        assert_eq!(orch.portfolio().open_pairs.len(), 1);
    }

    #[tokio::test]
    async fn persistence_counter_resets_when_pair_disqualifies() {
        let store = Arc::new(MemoryStore::new());
        let paper = paper_with_rates(0.003, -0.002);
        let mut cfg = test_config();
        cfg.min_persistence_windows = 3; // never reaches an intent in this test
        let mut orch = orchestrator_with(cfg, paper.clone(), store);

        orch.initialize().await.unwrap();
        orch.run_cycle().await.unwrap();
        assert_eq!(orch.persistence_counters().len(), 1);

        // Rates collapse: pair disqualifies, counter drops to zero (absent).
        paper.set_market_info(
            SHORT_SYM,
            VenueMarketInfo {
                rate_8h: Some(0.0),
                interval_hours: Some(8),
                ..Default::default()
            },
        );
        paper.set_market_info(
            LONG_SYM,
            VenueMarketInfo {
                rate_8h: Some(0.0),
                interval_hours: Some(8),
                ..Default::default()
            },
        );
        orch.run_cycle().await.unwrap();
        assert!(orch.persistence_counters().is_empty());
    }

    #[tokio::test]
    async fn partial_fill_flatten_keeps_pair_unopened_and_counter_alive() {
        let store = Arc::new(MemoryStore::new());
        let paper = paper_with_rates(0.003, -0.002);
        paper.set_fill_behavior(LONG_SYM, FillBehavior::NoFill);
        let mut orch = orchestrator_with(test_config(), paper.clone(), store);

        orch.initialize().await.unwrap();
        let summary = orch.run_cycle().await.unwrap();

        assert_eq!(summary.admitted, 1);
        assert_eq!(summary.executed, 0);
        assert_eq!(summary.flattened, 1);
        assert!(orch.portfolio().open_pairs.is_empty());
        // The qualifying pair keeps its persistence counter.
        assert_eq!(orch.persistence_counters().values().copied().max(), Some(1));
        // Venue ended flat.
        assert!(paper.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_flattens_orphan_leg() {
        let store = Arc::new(MemoryStore::new());
        let paper = paper_with_rates(0.003, -0.002);

        // A previous process died after one leg filled and before anything
        // was recorded: the venue shows a lone short.
        paper.seed_filled_order(SHORT_SYM, Side::Sell, 40.0, "mxdeadbeef-s");

        let mut orch = orchestrator_with(test_config(), paper.clone(), store);
        orch.initialize().await.unwrap();

        assert!(paper.positions().await.unwrap().is_empty());
        assert!(orch.portfolio().open_pairs.is_empty());
    }

    #[tokio::test]
    async fn restart_adopts_matching_pair() {
        let store = Arc::new(MemoryStore::new());
        let paper = paper_with_rates(0.003, -0.002);

        // First process opens the pair and persists.
        let mut orch1 = orchestrator_with(test_config(), paper.clone(), store.clone());
        orch1.initialize().await.unwrap();
        orch1.run_cycle().await.unwrap();
        assert_eq!(orch1.portfolio().open_pairs.len(), 1);

        // Second process loads the same store: legs match, pair adopted.
        let mut orch2 = orchestrator_with(test_config(), paper.clone(), store);
        orch2.initialize().await.unwrap();
        assert_eq!(orch2.portfolio().open_pairs.len(), 1);
        assert_eq!(orch2.portfolio().last_cycle_id, 1);
        // Nothing was flattened: the venue still carries both legs.
        assert_eq!(paper.positions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transient_market_failure_skips_cycle() {
        let store = Arc::new(MemoryStore::new());
        let paper = Arc::new(PaperVenue::new("alpha", 10_000.0));
        let mut cfg = test_config();
        // Aggregator mode with an unreachable endpoint: C1 exhausts retries.
        cfg.market_data_mode = MarketDataMode::Aggregator;
        let mut orch = orchestrator_with(cfg, paper, store);

        orch.initialize().await.unwrap();
        let err = orch.run_cycle_guarded().await.unwrap_err();
        assert!(matches!(err, EngineError::CycleSkipped(_)));
        assert_eq!(orch.portfolio().consecutive_skipped_cycles, 1);
        // No state advanced.
        assert_eq!(orch.portfolio().last_cycle_id, 0);
    }

    #[tokio::test]
    async fn funding_accrual_feeds_equity() {
        let store = Arc::new(MemoryStore::new());
        let paper = paper_with_rates(0.003, -0.002);
        let mut orch = orchestrator_with(test_config(), paper, store);

        orch.initialize().await.unwrap();
        orch.run_cycle().await.unwrap();
        let after_open: f64 = orch.portfolio().equity_usd;

        // Next cycle accrues carry on the open pair: 0.005 * 40 * (600/28800).
        orch.run_cycle().await.unwrap();
        let accrued_per_cycle = 0.005 * 40.0 * (600.0 / 28_800.0);
        let pair = orch.portfolio().open_pairs.values().next().unwrap();
        // Two cycles of accrual (the opening cycle accrues too).
        assert!((pair.accumulated_funding_usd - 2.0 * accrued_per_cycle).abs() < 1e-9);
        assert!(orch.portfolio().equity_usd > after_open);
    }
}
