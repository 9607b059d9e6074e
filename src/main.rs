// =============================================================================
// Meridian Carry Nexus - Main Entry Point
// =============================================================================
//
// Delta-neutral funding-rate arbitrage engine. The binary wires the cycle
// pipeline together, acquires the cross-process instance lock, and drives
// one cycle per period until shutdown.
//
// Exit codes:
//   0 - clean shutdown
//   1 - configuration error
//   2 - unrecoverable state divergence
//   3 - instance lock acquisition failure
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod error;
mod execution;
mod funding;
mod market_data;
mod monitor;
mod orchestrator;
mod risk;
mod signal;
mod store;
mod types;
mod universe;
mod venue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::funding::FundingClient;
use crate::market_data::MarketDataService;
use crate::monitor::Monitor;
use crate::orchestrator::Orchestrator;
use crate::store::{FileStore, StateStore};
use crate::venue::{PaperVenue, VenueAdapter};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_DIVERGENCE: i32 = 2;
const EXIT_LOCK: i32 = 3;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Carry Nexus - Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".into());
    let mut cfg = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override the static symbol list from the environment if present.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        cfg.symbols = syms
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        return EXIT_CONFIG;
    }

    info!(
        symbols = ?cfg.symbols,
        mode = %cfg.market_data_mode,
        cycle_period_seconds = cfg.cycle_period_seconds,
        "configuration ready"
    );

    // ── 2. State store & instance lock ───────────────────────────────────
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&cfg.state_path));
    let instance_id = format!("meridian-{}", uuid::Uuid::new_v4());
    let lease = cfg.lock_lease();

    if let Err(e) = store::acquire_instance_lock(store.as_ref(), &instance_id, lease).await {
        error!(error = %e, "lock acquisition failed");
        return EXIT_LOCK;
    }
    info!(instance = %instance_id, "instance lock acquired");

    // ── 3. Venue adapters ────────────────────────────────────────────────
    // Production deployments inject real exchange adapters here (credentials
    // are loaded by the wrapper and never touch the core). The default wiring
    // runs paper venues so the engine is fully operable standalone.
    let venue_ids: Vec<String> = std::env::var("MERIDIAN_VENUES")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| vec!["paper".to_string()]);

    let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    for id in &venue_ids {
        venues.insert(
            id.clone(),
            Arc::new(PaperVenue::new(id.clone(), cfg.starting_capital_usd)),
        );
    }
    info!(venues = ?venue_ids, "venue adapters ready (paper)");

    // ── 4. Services ──────────────────────────────────────────────────────
    let request_timeout = Duration::from_secs(cfg.request_timeout_secs);
    let funding = Arc::new(FundingClient::new(&cfg.aggregator_url, request_timeout));
    let market = MarketDataService::new(
        cfg.market_data_mode,
        funding,
        venues.clone(),
        cfg.symbols.clone(),
        cfg.default_open_interest_usd,
    );
    let monitor = Monitor::new(cfg.alert_webhook_url.clone(), request_timeout);

    let mut orchestrator = Orchestrator::new(cfg.clone(), market, venues, store.clone(), monitor);

    // ── 5. Recovery ──────────────────────────────────────────────────────
    if let Err(e) = orchestrator.initialize().await {
        let code = match e {
            EngineError::StateDivergence(_) => EXIT_DIVERGENCE,
            _ => EXIT_CONFIG,
        };
        error!(error = %e, "startup failed");
        let _ = store.release_lock(&instance_id).await;
        return code;
    }

    // ── 6. Cycle loop ────────────────────────────────────────────────────
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.cycle_period_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("engine running - Ctrl+C to stop");

    let exit_code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received - stopping after current cycle");
                break EXIT_OK;
            }
            _ = interval.tick() => {
                match store.renew_lock(&instance_id, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("instance lock lost to another process");
                        break EXIT_LOCK;
                    }
                    Err(e) => {
                        warn!(error = %e, "lock renewal failed - retrying next cycle");
                    }
                }

                match orchestrator.run_cycle_guarded().await {
                    Ok(summary) => {
                        info!(
                            cycle_id = summary.cycle_id,
                            executed = summary.executed,
                            state = %summary.risk_state_after,
                            "cycle committed"
                        );
                    }
                    Err(EngineError::CycleSkipped(reason)) => {
                        warn!(reason = %reason, "cycle skipped - next cycle starts fresh");
                    }
                    Err(EngineError::StateDivergence(reason)) => {
                        error!(reason = %reason, "unrecoverable divergence");
                        break EXIT_DIVERGENCE;
                    }
                    Err(e) => {
                        error!(error = %e, "cycle failed");
                    }
                }
            }
        }
    };

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = store.release_lock(&instance_id).await {
        warn!(error = %e, "failed to release instance lock");
    }
    info!("Meridian Carry Nexus shut down complete.");
    exit_code
}
