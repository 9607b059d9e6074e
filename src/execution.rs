// =============================================================================
// Execution Service - idempotent two-leg order placement with fail-safe
// flatten
// =============================================================================
//
// Protocol per intent:
//   1. Pre-flight: available balance must cover the margin of every leg on
//      its venue (notional / max_leverage). InsufficientMargin is terminal.
//   2. Both legs submit concurrently as market orders, carrying the intent's
//      deterministic idempotency key as client order id.
//   3. Fills reconcile within leg_fill_timeout:
//        both filled                -> pair opened with actual fills
//        one filled, one empty     -> fail-safe flatten of the filled leg
//        both partial              -> accept within tolerance, else trim the
//                                     larger leg down to match the smaller
//   4. Resubmitting an intent whose client order ids already sit in venue
//      history is a no-op; a prior flatten resolution is terminal.
//
// The engine never leaves a single-legged position behind: any path that
// cannot produce two matched legs ends in a flatten, and a flatten that
// itself fails ends in a ZOMBIE pair for the operator.
//
// Transient errors (network, 5xx, rate-limit) retry up to 3 times with
// backoff. Logical rejects never retry.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::risk::{PairLegSide, RebalanceDirective, ShrinkDirective};
use crate::types::{PairLeg, PairStatus, PositionPair, Side, TradeIntent};
use crate::venue::{OrderStatus, VenueAdapter};

/// Fill polling cadence while waiting on legs.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Attempts per order placement.
const MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal result of driving one intent through the protocol.
#[derive(Debug)]
pub enum IntentOutcome {
    /// Both legs filled; the pair is live.
    Opened(PositionPair),
    /// The intent's order ids already existed in venue history and the prior
    /// attempt did not leave a matched pair: terminal no-op.
    AlreadyResolved { reason: String },
    /// A lone filled leg was market-closed; the intent failed safely.
    Flattened { error: EngineError },
    /// Nothing (or nothing net) was filled; the intent failed cleanly.
    Failed { reason: String },
    /// Legs could not be matched *or* flattened. Operator intervention.
    Zombie(PositionPair),
}

pub struct ExecutionService {
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    cfg: EngineConfig,
}

impl ExecutionService {
    pub fn new(venues: HashMap<String, Arc<dyn VenueAdapter>>, cfg: EngineConfig) -> Self {
        Self { venues, cfg }
    }

    fn adapter(&self, venue: &str) -> Result<&Arc<dyn VenueAdapter>, EngineError> {
        self.venues.get(venue).ok_or_else(|| {
            EngineError::DataQuality(format!("no adapter configured for venue {venue}"))
        })
    }

    // -------------------------------------------------------------------------
    // Intent execution
    // -------------------------------------------------------------------------

    pub async fn execute_intent(&self, intent: &TradeIntent) -> IntentOutcome {
        let deadline = Duration::from_secs(self.cfg.intent_deadline_secs);
        match tokio::time::timeout(deadline, self.execute_inner(intent)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    pair = %intent.pair_key,
                    deadline_secs = self.cfg.intent_deadline_secs,
                    "intent deadline exceeded mid-leg - activating fail-safe flatten"
                );
                self.flatten_whatever_filled(intent, "intent deadline exceeded")
                    .await
            }
        }
    }

    async fn execute_inner(&self, intent: &TradeIntent) -> IntentOutcome {
        info!(
            pair = %intent.pair_key,
            short = %format!("{}:{}", intent.short.venue, intent.short.symbol),
            long = %format!("{}:{}", intent.long.venue, intent.long.symbol),
            short_usd = intent.short.notional_usd,
            long_usd = intent.long.notional_usd,
            edge_bps = intent.edge_bps,
            "executing intent"
        );

        let short_venue = match self.adapter(&intent.short.venue) {
            Ok(v) => v.clone(),
            Err(e) => return IntentOutcome::Failed { reason: e.to_string() },
        };
        let long_venue = match self.adapter(&intent.long.venue) {
            Ok(v) => v.clone(),
            Err(e) => return IntentOutcome::Failed { reason: e.to_string() },
        };

        // --- Idempotency: is this intent already in venue history? ---------
        let prior_short = short_venue.order_status(&intent.short_order_id()).await;
        let prior_long = long_venue.order_status(&intent.long_order_id()).await;
        match (prior_short, prior_long) {
            (Ok(Some(s)), Ok(Some(l))) if s.is_fully_filled() && l.is_fully_filled() => {
                info!(pair = %intent.pair_key, "intent already fully filled - adopting pair");
                return IntentOutcome::Opened(self.pair_from_fills(intent, &s, &l));
            }
            (Ok(Some(_)), _) | (_, Ok(Some(_))) => {
                // Present but not a matched fill: the prior attempt resolved
                // (or recovery will resolve it). Terminal either way.
                return IntentOutcome::AlreadyResolved {
                    reason: "client order id already in venue history".to_string(),
                };
            }
            _ => {}
        }

        // --- Pre-flight margin --------------------------------------------
        if let Err(e) = self.check_margin(intent, &short_venue, &long_venue).await {
            warn!(pair = %intent.pair_key, error = %e, "pre-flight margin check failed");
            return IntentOutcome::Failed { reason: e.to_string() };
        }

        // --- Concurrent leg submission ------------------------------------
        let short_order_id = intent.short_order_id();
        let long_order_id = intent.long_order_id();
        let (short_res, long_res) = tokio::join!(
            place_with_retries(
                short_venue.as_ref(),
                &intent.short.symbol,
                Side::Sell,
                intent.short.notional_usd,
                &short_order_id,
            ),
            place_with_retries(
                long_venue.as_ref(),
                &intent.long.symbol,
                Side::Buy,
                intent.long.notional_usd,
                &long_order_id,
            ),
        );

        match (short_res, long_res) {
            (Err(se), Err(le)) => {
                warn!(pair = %intent.pair_key, short_err = %se, long_err = %le,
                    "both legs failed to submit");
                IntentOutcome::Failed {
                    reason: format!("both legs rejected: short {se}; long {le}"),
                }
            }
            (Ok(_), Err(le)) => {
                warn!(pair = %intent.pair_key, error = %le,
                    "long leg failed to submit - flattening short");
                self.flatten_whatever_filled(intent, "long leg submit failed")
                    .await
            }
            (Err(se), Ok(_)) => {
                warn!(pair = %intent.pair_key, error = %se,
                    "short leg failed to submit - flattening long");
                self.flatten_whatever_filled(intent, "short leg submit failed")
                    .await
            }
            (Ok(_), Ok(_)) => self.reconcile_fills(intent, &short_venue, &long_venue).await,
        }
    }

    /// Wait for both legs to fill, then classify the result.
    async fn reconcile_fills(
        &self,
        intent: &TradeIntent,
        short_venue: &Arc<dyn VenueAdapter>,
        long_venue: &Arc<dyn VenueAdapter>,
    ) -> IntentOutcome {
        let timeout = Duration::from_secs(self.cfg.leg_fill_timeout_secs);
        let started = tokio::time::Instant::now();

        let (short_status, long_status) = loop {
            let short_status = short_venue.order_status(&intent.short_order_id()).await;
            let long_status = long_venue.order_status(&intent.long_order_id()).await;

            if let (Ok(Some(s)), Ok(Some(l))) = (&short_status, &long_status) {
                if s.is_fully_filled() && l.is_fully_filled() {
                    break (s.clone(), l.clone());
                }
            }

            if started.elapsed() >= timeout {
                match (short_status, long_status) {
                    (Ok(Some(s)), Ok(Some(l))) => break (s, l),
                    _ => {
                        return self
                            .flatten_whatever_filled(intent, "order status unavailable")
                            .await
                    }
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let filled_short = short_status.filled_notional_usd;
        let filled_long = long_status.filled_notional_usd;

        // Cancel any resting remainders; fills stand.
        if !short_status.is_fully_filled() {
            let _ = short_venue.cancel(&intent.short_order_id()).await;
        }
        if !long_status.is_fully_filled() {
            let _ = long_venue.cancel(&intent.long_order_id()).await;
        }

        match (filled_short > 0.0, filled_long > 0.0) {
            (true, true) => {
                self.resolve_partial_fills(intent, short_venue, long_venue, short_status, long_status)
                    .await
            }
            (true, false) | (false, true) => {
                warn!(
                    pair = %intent.pair_key,
                    filled_short,
                    filled_long,
                    "single-legged fill after timeout - fail-safe flatten"
                );
                self.flatten_whatever_filled(intent, "sibling leg unfilled within timeout")
                    .await
            }
            (false, false) => IntentOutcome::Failed {
                reason: "no fills within timeout".to_string(),
            },
        }
    }

    /// Both legs have some fill. Accept inside tolerance, trim outside it.
    async fn resolve_partial_fills(
        &self,
        intent: &TradeIntent,
        short_venue: &Arc<dyn VenueAdapter>,
        long_venue: &Arc<dyn VenueAdapter>,
        short_status: OrderStatus,
        long_status: OrderStatus,
    ) -> IntentOutcome {
        let mut filled_short = short_status.filled_notional_usd;
        let mut filled_long = long_status.filled_notional_usd;

        let frac_short = filled_short / intent.short.notional_usd;
        let frac_long = filled_long / intent.long.notional_usd;
        let imbalance = (frac_short - frac_long).abs();

        if imbalance > self.cfg.partial_fill_tolerance {
            // Trim the leg that filled further down to the smaller fraction.
            let target_frac = frac_short.min(frac_long);
            if frac_short > frac_long {
                let excess = filled_short - target_frac * intent.short.notional_usd;
                debug!(pair = %intent.pair_key, excess, "trimming short leg to match long");
                if let Err(e) = self
                    .reduce_position(
                        short_venue.as_ref(),
                        &intent.short.symbol,
                        Side::Sell,
                        excess,
                        &format!("{}-ts", intent.idempotency_key),
                    )
                    .await
                {
                    return self.zombie_from_intent(intent, filled_short, filled_long, e);
                }
                filled_short -= excess;
            } else {
                let excess = filled_long - target_frac * intent.long.notional_usd;
                debug!(pair = %intent.pair_key, excess, "trimming long leg to match short");
                if let Err(e) = self
                    .reduce_position(
                        long_venue.as_ref(),
                        &intent.long.symbol,
                        Side::Buy,
                        excess,
                        &format!("{}-tl", intent.idempotency_key),
                    )
                    .await
                {
                    return self.zombie_from_intent(intent, filled_short, filled_long, e);
                }
                filled_long -= excess;
            }
        }

        let mut short_status = short_status;
        let mut long_status = long_status;
        short_status.filled_notional_usd = filled_short;
        long_status.filled_notional_usd = filled_long;

        info!(
            pair = %intent.pair_key,
            filled_short,
            filled_long,
            "pair opened"
        );
        IntentOutcome::Opened(self.pair_from_fills(intent, &short_status, &long_status))
    }

    // -------------------------------------------------------------------------
    // Fail-safe flatten
    // -------------------------------------------------------------------------

    /// Close out whatever the intent managed to fill, leg by leg. Success is
    /// a `Flattened` outcome; a flatten failure escalates to ZOMBIE.
    async fn flatten_whatever_filled(&self, intent: &TradeIntent, reason: &str) -> IntentOutcome {
        let mut flattened_any = false;
        let mut filled = (0.0, 0.0);

        for (leg, side, order_id, suffix, slot) in [
            (
                &intent.short,
                Side::Sell,
                intent.short_order_id(),
                "fs",
                0usize,
            ),
            (&intent.long, Side::Buy, intent.long_order_id(), "fl", 1),
        ] {
            let adapter = match self.adapter(&leg.venue) {
                Ok(a) => a.clone(),
                Err(_) => continue,
            };

            let _ = adapter.cancel(&order_id).await;

            let filled_usd = match adapter.order_status(&order_id).await {
                Ok(Some(status)) => status.filled_notional_usd,
                _ => 0.0,
            };
            if slot == 0 {
                filled.0 = filled_usd;
            } else {
                filled.1 = filled_usd;
            }
            if filled_usd <= 0.0 {
                continue;
            }

            let close_id = format!("{}-{}", intent.idempotency_key, suffix);
            match self
                .reduce_position(adapter.as_ref(), &leg.symbol, side, filled_usd, &close_id)
                .await
            {
                Ok(()) => {
                    flattened_any = true;
                    info!(
                        venue = %leg.venue,
                        symbol = %leg.symbol,
                        notional_usd = filled_usd,
                        "lone leg flattened"
                    );
                }
                Err(e) => {
                    error!(
                        venue = %leg.venue,
                        symbol = %leg.symbol,
                        error = %e,
                        "flatten failed - pair goes ZOMBIE"
                    );
                    return self.zombie_from_intent(intent, filled.0, filled.1, e);
                }
            }
        }

        if flattened_any {
            IntentOutcome::Flattened {
                error: EngineError::PartialFillFlattened(reason.to_string()),
            }
        } else {
            IntentOutcome::Failed {
                reason: reason.to_string(),
            }
        }
    }

    /// Market order in the opposite direction, shrinking an existing
    /// exposure. Used by flatten, trim, shrink, and rebalance paths.
    async fn reduce_position(
        &self,
        adapter: &dyn VenueAdapter,
        symbol: &str,
        current_side: Side,
        notional_usd: f64,
        client_order_id: &str,
    ) -> Result<(), EngineError> {
        if notional_usd <= 0.0 {
            return Ok(());
        }
        place_with_retries(
            adapter,
            symbol,
            current_side.opposite(),
            notional_usd,
            client_order_id,
        )
        .await
        .map(|_| ())
    }

    fn zombie_from_intent(
        &self,
        intent: &TradeIntent,
        filled_short: f64,
        filled_long: f64,
        error: EngineError,
    ) -> IntentOutcome {
        let fatal = EngineError::ExecutionFatal(error.to_string());
        error!(pair = %intent.pair_key, error = %fatal, "unrecoverable execution failure");
        let mut pair = self.pair_skeleton(intent, filled_short, filled_long);
        pair.status = PairStatus::Zombie;
        pair.close_reason = Some(fatal.to_string());
        IntentOutcome::Zombie(pair)
    }

    // -------------------------------------------------------------------------
    // Pair construction
    // -------------------------------------------------------------------------

    fn pair_from_fills(
        &self,
        intent: &TradeIntent,
        short_status: &OrderStatus,
        long_status: &OrderStatus,
    ) -> PositionPair {
        let mut pair = self.pair_skeleton(
            intent,
            short_status.filled_notional_usd,
            long_status.filled_notional_usd,
        );

        // Entry costs are carried as negative mark-to-market until funding
        // accrual earns them back.
        let entry_fees = self.cfg.fee_bps_for(&intent.short.venue) / 10_000.0
            * short_status.filled_notional_usd
            + self.cfg.fee_bps_for(&intent.long.venue) / 10_000.0
                * long_status.filled_notional_usd;
        pair.mark_to_market_usd = -entry_fees;
        pair
    }

    fn pair_skeleton(
        &self,
        intent: &TradeIntent,
        filled_short: f64,
        filled_long: f64,
    ) -> PositionPair {
        PositionPair {
            id: Uuid::new_v4().to_string(),
            pair_key: intent.pair_key.clone(),
            short: PairLeg {
                venue: intent.short.venue.clone(),
                symbol: intent.short.symbol.clone(),
                side: Side::Sell,
                entry_rate: intent.short.rate,
                entry_notional_usd: intent.short.notional_usd,
                current_notional_usd: filled_short,
                client_order_id: intent.short_order_id(),
            },
            long: PairLeg {
                venue: intent.long.venue.clone(),
                symbol: intent.long.symbol.clone(),
                side: Side::Buy,
                entry_rate: intent.long.rate,
                entry_notional_usd: intent.long.notional_usd,
                current_notional_usd: filled_long,
                client_order_id: intent.long_order_id(),
            },
            status: PairStatus::Open,
            accumulated_funding_usd: 0.0,
            realized_pnl_usd: 0.0,
            mark_to_market_usd: 0.0,
            opened_cycle: intent.cycle_id,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight
    // -------------------------------------------------------------------------

    /// Available balance on each venue must cover that venue's share of
    /// required margin.
    async fn check_margin(
        &self,
        intent: &TradeIntent,
        short_venue: &Arc<dyn VenueAdapter>,
        long_venue: &Arc<dyn VenueAdapter>,
    ) -> Result<(), EngineError> {
        let mut required: HashMap<&str, f64> = HashMap::new();
        *required.entry(intent.short.venue.as_str()).or_insert(0.0) +=
            intent.short.notional_usd / self.cfg.max_leverage;
        *required.entry(intent.long.venue.as_str()).or_insert(0.0) +=
            intent.long.notional_usd / self.cfg.max_leverage;

        for (venue, needed) in required {
            let adapter = if venue == intent.short.venue {
                short_venue
            } else {
                long_venue
            };
            let balance = adapter.balance().await?;
            if balance.available_usd < needed {
                return Err(EngineError::InsufficientMargin {
                    venue: venue.to_string(),
                    required_usd: needed,
                    available_usd: balance.available_usd,
                });
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exit, shrink, rebalance
    // -------------------------------------------------------------------------

    /// Close both legs of a pair. Client order ids derive from the pair id
    /// and the exit epoch, so a re-run after a crash is idempotent.
    pub async fn close_pair(
        &self,
        pair: &PositionPair,
        exit_epoch: u64,
    ) -> Result<(), EngineError> {
        let prefix = &pair.id[..8.min(pair.id.len())];

        for (leg, suffix) in [(&pair.short, "s"), (&pair.long, "l")] {
            if leg.current_notional_usd <= 0.0 {
                continue;
            }
            let adapter = self.adapter(&leg.venue)?.clone();
            let close_id = format!("cl{prefix}-{exit_epoch}-{suffix}");
            self.reduce_position(
                adapter.as_ref(),
                &leg.symbol,
                leg.side,
                leg.current_notional_usd,
                &close_id,
            )
            .await?;
        }

        info!(pair_id = %pair.id, exit_epoch, "pair closed");
        Ok(())
    }

    /// Scale both legs down by `directive.factor`, returning the new
    /// (short, long) notionals.
    pub async fn shrink_pair(
        &self,
        pair: &PositionPair,
        directive: &ShrinkDirective,
        cycle_id: u64,
    ) -> Result<(f64, f64), EngineError> {
        let prefix = &pair.id[..8.min(pair.id.len())];
        let keep = directive.factor.clamp(0.0, 1.0);

        let mut new_notionals = (
            pair.short.current_notional_usd,
            pair.long.current_notional_usd,
        );

        for (leg, suffix, slot) in [(&pair.short, "s", 0usize), (&pair.long, "l", 1)] {
            let cut = leg.current_notional_usd * (1.0 - keep);
            if cut <= 0.0 {
                continue;
            }
            let adapter = self.adapter(&leg.venue)?.clone();
            let order_id = format!("sh{prefix}-{cycle_id}-{suffix}");
            self.reduce_position(adapter.as_ref(), &leg.symbol, leg.side, cut, &order_id)
                .await?;
            if slot == 0 {
                new_notionals.0 -= cut;
            } else {
                new_notionals.1 -= cut;
            }
        }

        info!(
            pair_id = %pair.id,
            factor = keep,
            short_usd = new_notionals.0,
            long_usd = new_notionals.1,
            "pair shrunk"
        );
        Ok(new_notionals)
    }

    /// Bring one drifted leg back toward its target notional. Returns the
    /// leg's new notional.
    pub async fn rebalance_leg(
        &self,
        pair: &PositionPair,
        directive: &RebalanceDirective,
        cycle_id: u64,
    ) -> Result<f64, EngineError> {
        let leg = match directive.leg {
            PairLegSide::Short => &pair.short,
            PairLegSide::Long => &pair.long,
        };
        let prefix = &pair.id[..8.min(pair.id.len())];
        let delta = directive.current_notional_usd - directive.target_notional_usd;
        let adapter = self.adapter(&leg.venue)?.clone();
        let order_id = format!("rb{prefix}-{cycle_id}");

        if delta > 0.0 {
            // Oversized: trim with an opposite-direction order.
            self.reduce_position(adapter.as_ref(), &leg.symbol, leg.side, delta, &order_id)
                .await?;
        } else if delta < 0.0 {
            // Undersized: extend with a same-direction order.
            place_with_retries(adapter.as_ref(), &leg.symbol, leg.side, -delta, &order_id)
                .await?;
        }

        info!(
            pair_id = %pair.id,
            leg = ?directive.leg,
            from = directive.current_notional_usd,
            to = directive.target_notional_usd,
            "leg rebalanced"
        );
        Ok(directive.target_notional_usd)
    }
}

// ---------------------------------------------------------------------------
// Retry wrapper
// ---------------------------------------------------------------------------

/// Submit one order with bounded retries on transient failures only.
async fn place_with_retries(
    adapter: &dyn VenueAdapter,
    symbol: &str,
    side: Side,
    notional_usd: f64,
    client_order_id: &str,
) -> Result<crate::venue::OrderAck, EngineError> {
    retry_transient(|| adapter.place_order(symbol, side, notional_usd, client_order_id)).await
}

async fn retry_transient<T, Fut, F>(mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                warn!(attempt, error = %e, "transient order error - retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

impl std::fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionService")
            .field("venues", &self.venues.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
