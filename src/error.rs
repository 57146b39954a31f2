use serde::Serialize;
use std::fmt;

/// Run-level failures. Row-level problems never surface here; they are folded into
/// [`crate::stats::LinkCounters`] instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The declared schema does not match the shape of an input table.
    #[error("schema mismatch in `{table}`: {reason}")]
    SchemaMismatch { table: String, reason: String },

    /// An aggregate failure rate crossed its configured limit.
    #[error("{category} rate {rate:.4} exceeds the configured maximum {threshold:.4} ({count} of {processed} rows)")]
    ThresholdBreach {
        category: &'static str,
        rate: f64,
        threshold: f64,
        count: u64,
        processed: u64,
    },

    /// A validation checkpoint rejected the run.
    #[error("{checkpoint} gate failed: {}", .failures.join("; "))]
    GateFailure {
        checkpoint: GateCheckpoint,
        failures: Vec<String>,
    },
}

impl PipelineError {
    pub fn schema(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::SchemaMismatch { .. } => 2,
            Self::ThresholdBreach { .. } => 3,
            Self::GateFailure { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateCheckpoint {
    PreFlight,
    PostRun,
    /// Re-reading committed artifacts (`verify-csvs`)
    Artifacts,
}

impl fmt::Display for GateCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateCheckpoint::PreFlight => f.write_str("pre-flight"),
            GateCheckpoint::PostRun => f.write_str("post-run"),
            GateCheckpoint::Artifacts => f.write_str("artifact"),
        }
    }
}

/// A single row that could not be parsed or decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed row: {reason}")]
pub struct MalformedRow {
    pub reason: String,
}

impl MalformedRow {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub type RowResult<T> = Result<T, MalformedRow>;
