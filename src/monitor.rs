// =============================================================================
// Monitoring - structured webhook events for operators
// =============================================================================
//
// Fires on risk-state transitions, emergency flattens, ZOMBIE pairs, and
// per-cycle anomalies (equity drop > 5%, execution failure ratio > 20%,
// repeated skipped cycles). Strictly best-effort: a webhook failure is
// logged and never blocks the cycle.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Equity lost in a single cycle before an alert fires.
const EQUITY_DROP_ALERT: f64 = 0.05;
/// Failed-to-attempted execution ratio before an alert fires.
const EXEC_FAILURE_RATIO_ALERT: f64 = 0.20;
/// Consecutive skipped cycles before an alert fires.
pub const SKIPPED_CYCLES_ALERT: u32 = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RiskTransition {
        from: String,
        to: String,
        drawdown: f64,
    },
    EmergencyFlatten {
        pair_key: String,
        reason: String,
    },
    ZombiePair {
        pair_id: String,
        reason: String,
    },
    EquityDrop {
        previous_usd: f64,
        current_usd: f64,
        drop_pct: f64,
    },
    ExecutionFailures {
        attempted: u32,
        failed: u32,
        ratio: f64,
    },
    CycleSkipped {
        consecutive: u32,
        reason: String,
    },
}

/// The JSON body posted to the webhook.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    pub at: DateTime<Utc>,
    pub cycle_id: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

pub struct Monitor {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl Monitor {
    pub fn new(webhook_url: Option<String>, request_timeout: std::time::Duration) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("failed to build reqwest client for Monitor"),
        }
    }

    /// Post one event. Failures are logged, never propagated.
    pub async fn emit(&self, cycle_id: u64, kind: EventKind) {
        let event = MonitorEvent {
            at: Utc::now(),
            cycle_id,
            kind,
        };

        let Some(url) = &self.webhook_url else {
            debug!(event = ?event.kind, "monitor event (no webhook configured)");
            return;
        };

        match self.http.post(url).json(&event).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(cycle_id, "monitor event delivered");
            }
            Ok(resp) => {
                warn!(cycle_id, status = %resp.status(), "webhook returned non-success");
            }
            Err(e) => {
                warn!(cycle_id, error = %e, "webhook post failed");
            }
        }
    }

    /// Evaluate end-of-cycle anomaly thresholds and emit what trips.
    pub async fn check_cycle_anomalies(
        &self,
        cycle_id: u64,
        equity_before_usd: f64,
        equity_after_usd: f64,
        executions_attempted: u32,
        executions_failed: u32,
    ) {
        if equity_before_usd > 0.0 {
            let drop_pct = (equity_before_usd - equity_after_usd) / equity_before_usd;
            if drop_pct > EQUITY_DROP_ALERT {
                self.emit(
                    cycle_id,
                    EventKind::EquityDrop {
                        previous_usd: equity_before_usd,
                        current_usd: equity_after_usd,
                        drop_pct,
                    },
                )
                .await;
            }
        }

        if executions_attempted > 0 {
            let ratio = executions_failed as f64 / executions_attempted as f64;
            if ratio > EXEC_FAILURE_RATIO_ALERT {
                self.emit(
                    cycle_id,
                    EventKind::ExecutionFailures {
                        attempted: executions_attempted,
                        failed: executions_failed,
                        ratio,
                    },
                )
                .await;
            }
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("webhook_configured", &self.webhook_url.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_webhook_is_a_quiet_noop() {
        let monitor = Monitor::new(None, std::time::Duration::from_millis(100));
        monitor
            .emit(
                1,
                EventKind::RiskTransition {
                    from: "NORMAL".into(),
                    to: "REDUCE".into(),
                    drawdown: 0.11,
                },
            )
            .await;
        // Anomaly checks below threshold emit nothing either.
        monitor.check_cycle_anomalies(1, 1000.0, 990.0, 5, 1).await;
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = MonitorEvent {
            at: Utc::now(),
            cycle_id: 9,
            kind: EventKind::ZombiePair {
                pair_id: "p1".into(),
                reason: "flatten failed".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "zombie_pair");
        assert_eq!(json["cycle_id"], 9);
        assert_eq!(json["pair_id"], "p1");
    }
}
