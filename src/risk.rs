// =============================================================================
// Risk Service - drawdown state machine, notional caps, admission control
// =============================================================================
//
// State machine (drawdown d = (peak - equity) / peak):
//
//   NORMAL   --(d >= reduce)-->        REDUCE
//   NORMAL   --(d >= stop)-->          HALT_NEW
//   REDUCE   --(d >= stop)-->          HALT_NEW
//   REDUCE   --(d < recover_normal)--> NORMAL
//   HALT_NEW --(d < recover_reduce)--> REDUCE
//
// The recovery thresholds sit strictly inside the trip thresholds, so a
// portfolio hovering at a boundary cannot flap between states.
//
// Admission is a pure function of the snapshot and the candidate intents:
// same inputs, same decision, in signal-service order. Caps apply in a fixed
// sequence (total, per-symbol, per-venue, leverage) with running totals, so
// an admitted intent consumes headroom before the next one is considered.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::types::{accumulate_notional, PairStatus, PortfolioState, RiskState, TradeIntent};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Drawdown trip and recovery points, lifted out of the config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub reduce: f64,
    pub stop: f64,
    pub recover_normal: f64,
    pub recover_reduce: f64,
}

impl RiskThresholds {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            reduce: cfg.reduce_mode_drawdown_pct,
            stop: cfg.max_drawdown_stop_pct,
            recover_normal: cfg.recover_normal_drawdown_pct,
            recover_reduce: cfg.recover_reduce_drawdown_pct,
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            reduce: 0.10,
            stop: 0.15,
            recover_normal: 0.08,
            recover_reduce: 0.13,
        }
    }
}

/// One transition step. Called once per cycle.
pub fn next_state(current: RiskState, drawdown: f64, th: &RiskThresholds) -> RiskState {
    match current {
        RiskState::Normal => {
            if drawdown >= th.stop {
                RiskState::HaltNew
            } else if drawdown >= th.reduce {
                RiskState::Reduce
            } else {
                RiskState::Normal
            }
        }
        RiskState::Reduce => {
            if drawdown >= th.stop {
                RiskState::HaltNew
            } else if drawdown < th.recover_normal {
                RiskState::Normal
            } else {
                RiskState::Reduce
            }
        }
        RiskState::HaltNew => {
            if drawdown < th.recover_reduce {
                RiskState::Reduce
            } else {
                RiskState::HaltNew
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// Which leg of a pair a directive targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairLegSide {
    Short,
    Long,
}

/// Bring one drifted leg back to its target notional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceDirective {
    pub pair_id: String,
    pub leg: PairLegSide,
    pub current_notional_usd: f64,
    pub target_notional_usd: f64,
}

/// Scale both legs of a pair down by `factor` (REDUCE mode de-risking).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShrinkDirective {
    pub pair_id: String,
    pub factor: f64,
}

/// A refused intent with the cap that refused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedIntent {
    pub pair_key: String,
    pub reason: String,
}

/// Full admission outcome for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    pub state: RiskState,
    pub drawdown: f64,
    pub admitted: Vec<TradeIntent>,
    pub rejected: Vec<RejectedIntent>,
    pub shrinks: Vec<ShrinkDirective>,
    pub rebalances: Vec<RebalanceDirective>,
    /// Set when the whole cycle's admissions were blocked wholesale.
    pub blocked_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Stateless risk evaluator. All mutable state lives in the portfolio
/// snapshot it is handed.
pub struct RiskService {
    cfg: EngineConfig,
    thresholds: RiskThresholds,
}

impl RiskService {
    pub fn new(cfg: EngineConfig) -> Self {
        let thresholds = RiskThresholds::from_config(&cfg);
        Self { cfg, thresholds }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    /// Evaluate the portfolio and the cycle's candidate intents.
    pub fn evaluate(&self, portfolio: &PortfolioState, intents: &[TradeIntent]) -> RiskDecision {
        let drawdown = portfolio.drawdown();
        let state = next_state(portfolio.risk_state, drawdown, &self.thresholds);

        if state != portfolio.risk_state {
            warn!(
                from = %portfolio.risk_state,
                to = %state,
                drawdown = format!("{:.4}", drawdown),
                "risk state transition"
            );
        }

        let rebalances = self.rebalance_directives(portfolio);

        match state {
            RiskState::HaltNew => {
                info!(intents = intents.len(), "HALT_NEW - no admissions");
                RiskDecision {
                    state,
                    drawdown,
                    admitted: Vec::new(),
                    rejected: intents
                        .iter()
                        .map(|i| RejectedIntent {
                            pair_key: i.pair_key.clone(),
                            reason: "halt_new".to_string(),
                        })
                        .collect(),
                    shrinks: Vec::new(),
                    rebalances,
                    blocked_reason: Some("halt_new".to_string()),
                }
            }
            RiskState::Reduce => {
                let shrinks = portfolio
                    .open_pairs
                    .values()
                    .filter(|p| p.status == PairStatus::Open)
                    .map(|p| ShrinkDirective {
                        pair_id: p.id.clone(),
                        factor: 0.5,
                    })
                    .collect();
                RiskDecision {
                    state,
                    drawdown,
                    admitted: Vec::new(),
                    rejected: intents
                        .iter()
                        .map(|i| RejectedIntent {
                            pair_key: i.pair_key.clone(),
                            reason: "reduce_mode".to_string(),
                        })
                        .collect(),
                    shrinks,
                    rebalances,
                    blocked_reason: Some("reduce_mode".to_string()),
                }
            }
            RiskState::Normal => {
                let (admitted, rejected) = self.admit(portfolio, intents);
                RiskDecision {
                    state,
                    drawdown,
                    admitted,
                    rejected,
                    shrinks: Vec::new(),
                    rebalances,
                    blocked_reason: None,
                }
            }
        }
    }

    /// Sequential cap enforcement with running totals.
    fn admit(
        &self,
        portfolio: &PortfolioState,
        intents: &[TradeIntent],
    ) -> (Vec<TradeIntent>, Vec<RejectedIntent>) {
        let mut total = portfolio.total_notional_usd();
        let mut by_symbol = portfolio.notional_by_symbol();
        let mut by_venue = portfolio.notional_by_venue();

        let mut admitted = Vec::new();
        let mut rejected = Vec::new();

        'intents: for intent in intents {
            let accounted = intent.accounted_notional_usd();

            // 1. Total notional.
            if total + accounted > self.cfg.max_total_notional_usd {
                rejected.push(RejectedIntent {
                    pair_key: intent.pair_key.clone(),
                    reason: "total_notional_cap".to_string(),
                });
                continue;
            }

            // Per-key contributions with the hedged-leg rule (legs sharing a
            // symbol or venue offset, counting the larger leg once).
            let mut symbol_add = std::collections::BTreeMap::new();
            accumulate_notional(
                &mut symbol_add,
                (&intent.short.symbol, intent.short.notional_usd),
                (&intent.long.symbol, intent.long.notional_usd),
            );
            let mut venue_add = std::collections::BTreeMap::new();
            accumulate_notional(
                &mut venue_add,
                (&intent.short.venue, intent.short.notional_usd),
                (&intent.long.venue, intent.long.notional_usd),
            );

            // 2. Per-symbol notional.
            for (symbol, add) in &symbol_add {
                let projected = by_symbol.get(symbol.as_str()).copied().unwrap_or(0.0) + add;
                if projected > self.cfg.max_notional_per_symbol_usd {
                    rejected.push(RejectedIntent {
                        pair_key: intent.pair_key.clone(),
                        reason: format!("symbol_cap:{symbol}"),
                    });
                    continue 'intents;
                }
            }

            // 3. Per-venue notional.
            for (venue, add) in &venue_add {
                let projected = by_venue.get(venue.as_str()).copied().unwrap_or(0.0) + add;
                if projected > self.cfg.max_notional_per_venue_usd {
                    rejected.push(RejectedIntent {
                        pair_key: intent.pair_key.clone(),
                        reason: format!("venue_cap:{venue}"),
                    });
                    continue 'intents;
                }
            }

            // 4. Effective leverage.
            if portfolio.equity_usd > 0.0 {
                let leverage = (total + accounted) / portfolio.equity_usd;
                if leverage > self.cfg.normal_leverage_cap {
                    rejected.push(RejectedIntent {
                        pair_key: intent.pair_key.clone(),
                        reason: "leverage_cap".to_string(),
                    });
                    continue;
                }
            }

            total += accounted;
            for (symbol, add) in symbol_add {
                *by_symbol.entry(symbol).or_insert(0.0) += add;
            }
            for (venue, add) in venue_add {
                *by_venue.entry(venue).or_insert(0.0) += add;
            }
            admitted.push(intent.clone());
        }

        debug!(
            admitted = admitted.len(),
            rejected = rejected.len(),
            "admission evaluated"
        );
        (admitted, rejected)
    }

    /// Legs drifted beyond the threshold from their entry target, regardless
    /// of what else the cycle is doing.
    fn rebalance_directives(&self, portfolio: &PortfolioState) -> Vec<RebalanceDirective> {
        let mut out = Vec::new();
        for pair in portfolio
            .open_pairs
            .values()
            .filter(|p| p.status == PairStatus::Open)
        {
            for (side, leg) in [
                (PairLegSide::Short, &pair.short),
                (PairLegSide::Long, &pair.long),
            ] {
                if leg.entry_notional_usd <= 0.0 {
                    continue;
                }
                let drift = (leg.current_notional_usd - leg.entry_notional_usd).abs()
                    / leg.entry_notional_usd;
                if drift > self.cfg.rebalance_threshold_pct {
                    info!(
                        pair_id = %pair.id,
                        leg = ?side,
                        current = leg.current_notional_usd,
                        target = leg.entry_notional_usd,
                        drift = format!("{:.3}", drift),
                        "rebalance directive"
                    );
                    out.push(RebalanceDirective {
                        pair_id: pair.id.clone(),
                        leg: side,
                        current_notional_usd: leg.current_notional_usd,
                        target_notional_usd: leg.entry_notional_usd,
                    });
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for RiskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskService")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
