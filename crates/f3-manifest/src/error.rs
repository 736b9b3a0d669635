//! Error Types
//!
//! One enum per failure domain: manifest validation, fetching from the
//! source, watcher lifecycle and configuration loading.

use f3_manifest_protocol::JsonRpcError;

/// Reasons a manifest is rejected by [`crate::ManifestDocument::validate`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManifestError {
    #[error("network name cannot be empty")]
    EmptyNetworkName,

    #[error("catch-up alignment {alignment_ns}ns exceeds EC period {period_ns}ns")]
    CatchUpAlignmentTooLarge { alignment_ns: u64, period_ns: u64 },

    #[error("EC period must be positive")]
    ZeroEcPeriod,

    #[error("EC finality must be non-negative, got {0}")]
    NegativeFinality(i64),

    #[error("EC delay multiplier must be positive, got {0}")]
    InvalidDelayMultiplier(f64),

    #[error("EC base decision backoff table must be non-empty with positive entries")]
    InvalidBackoffTable,

    #[error("EC head lookback must be non-negative, got {0}")]
    NegativeHeadLookback(i64),

    #[error("bootstrap epoch {bootstrap} is lower than EC finality {finality}")]
    BootstrapBeforeFinality { bootstrap: i64, finality: i64 },

    #[error("GPBFT delta must be positive")]
    ZeroDelta,

    #[error("GPBFT delta backoff exponent must be at least 1.0, got {0}")]
    InvalidDeltaBackoffExponent(f64),

    #[error("GPBFT quality delta multiplier must be non-negative, got {0}")]
    InvalidQualityDeltaMultiplier(f64),

    #[error("GPBFT rebroadcast backoff base must be positive")]
    ZeroRebroadcastBackoffBase,

    #[error("GPBFT rebroadcast backoff exponent must be at least 1.0, got {0}")]
    InvalidRebroadcastBackoffExponent(f64),

    #[error("GPBFT rebroadcast backoff max is lower than its base")]
    RebroadcastBackoffMaxBelowBase,

    #[error("explicit power is required when EC power is ignored")]
    MissingExplicitPower,

    #[error("explicit power entry {0} has zero power")]
    ZeroPower(u64),

    #[error("explicit power entry {0} appears more than once")]
    DuplicatePowerEntry(u64),

    #[error("initial power table CID is malformed: {0:?}")]
    MalformedPowerTableCid(String),
}

/// Failures from a [`crate::ManifestSource`]
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("request cancelled")]
    Cancelled,
}

impl From<JsonRpcError> for SourceError {
    fn from(err: JsonRpcError) -> Self {
        SourceError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// Lifecycle failures of a [`crate::ManifestWatcher`]
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("no Tokio runtime available to spawn the poll loop")]
    NoRuntime,
}

/// Failures loading a [`crate::WatcherConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine home directory")]
    HomeDirUnavailable,
}
