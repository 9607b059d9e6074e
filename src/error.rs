// =============================================================================
// Error taxonomy - every failure class the cycle loop must branch on
// =============================================================================
//
// Classes:
//   Transient       - network / 5xx / rate-limit; retried, then skips a cycle.
//   DataQuality     - bad or missing market data; drop the symbol, keep going.
//   NotFound        - requested (venue, symbol) absent from the feed.
//   InsufficientMargin / OrderRejected - logical rejects; never retried.
//   PartialFillFlattened - a leg filled alone and was market-closed.
//   ExecutionFatal  - both legs unrecoverable; pair goes ZOMBIE.
//   StateDivergence - recorded state irreconcilable with the venue.
//   Config          - invalid configuration; fail fast at startup.
//   LockUnavailable - another instance holds the cycle lock.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("cycle skipped: {0}")]
    CycleSkipped(String),

    #[error("data quality: {0}")]
    DataQuality(String),

    #[error("no funding snapshot for {venue}/{symbol}")]
    NotFound { venue: String, symbol: String },

    #[error("insufficient margin on {venue}: need {required_usd:.2} USD, have {available_usd:.2} USD")]
    InsufficientMargin {
        venue: String,
        required_usd: f64,
        available_usd: f64,
    },

    #[error("order rejected by {venue}: {reason}")]
    OrderRejected { venue: String, reason: String },

    #[error("partial fill flattened: {0}")]
    PartialFillFlattened(String),

    #[error("execution fatal: {0}")]
    ExecutionFatal(String),

    #[error("state divergence: {0}")]
    StateDivergence(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("instance lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("state store: {0}")]
    Store(String),
}

impl EngineError {
    /// Whether a bounded retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the affected symbol or pair should simply be dropped while the
    /// cycle continues.
    pub fn is_data_quality(&self) -> bool {
        matches!(self, Self::DataQuality(_) | Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::Transient("timeout".into()).is_transient());
        assert!(!EngineError::Config("bad weights".into()).is_transient());
        assert!(!EngineError::OrderRejected {
            venue: "hyper".into(),
            reason: "symbol not tradable".into()
        }
        .is_transient());
    }

    #[test]
    fn data_quality_classification() {
        assert!(EngineError::DataQuality("NaN rate".into()).is_data_quality());
        assert!(EngineError::NotFound {
            venue: "hyper".into(),
            symbol: "BTC/USDT:USDT".into()
        }
        .is_data_quality());
        assert!(!EngineError::Transient("503".into()).is_data_quality());
    }
}
