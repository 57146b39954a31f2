use clap::ValueEnum;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Maximum number of redirect hops followed before a link is classified unresolved
pub const REDIRECT_MAX_HOPS: u32 = 2;

/// Progress update interval (tick every N rows)
pub const PROGRESS_INTERVAL: u64 = 100_000;

/// Read buffer for dump files
pub const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Write buffer for CSV artifacts and spill shards
pub const WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// Target size of a decoded line batch handed to a worker (compressed dumps)
pub const SEGMENT_BYTES: usize = 8 * 1024 * 1024;

/// Byte-range segments per worker thread (uncompressed dumps)
pub const SEGMENTS_PER_THREAD: usize = 4;

/// Edges a worker buffers per spill shard before taking the shard lock
pub const SPILL_BATCH: usize = 16 * 1024;

/// Number of source-range spill shards used by the dedup reduction
pub const DEFAULT_SPILL_SHARDS: usize = 64;

/// Pre-flight Bernoulli sampling rate (1 row in 10,000)
pub const DEFAULT_SAMPLE_RATE: f64 = 0.0001;

/// Smallest pre-flight sample the gate accepts (capped at the stream size)
pub const DEFAULT_MIN_SAMPLE: u64 = 1_000;

/// Seed for every sampling RNG; fixed so reruns draw the same rows
pub const DEFAULT_SEED: u64 = 0x5EED_11A4;

/// Emitted edges re-derived from the raw stream after the run
pub const DEFAULT_TRACE_SAMPLE: usize = 256;

pub const DEFAULT_MAX_MALFORMED_RATE: f64 = 0.05;
pub const DEFAULT_MAX_UNRESOLVED_RATE: f64 = 0.5;
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.5;
pub const DEFAULT_MIN_INTEGRITY_RATE: f64 = 0.9;
pub const DEFAULT_TOLERANCE: f64 = 0.25;

/// Significance threshold coefficient for the Kolmogorov-Smirnov positional check (alpha = 0.001)
pub const KS_CRITICAL_COEFFICIENT: f64 = 1.95;

/// Pagelinks table layout. Always declared by the caller, never inferred from the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    /// `pagelinks(pl_from, pl_namespace, pl_title)`
    Legacy,
    /// `pagelinks(pl_from, pl_from_namespace, pl_target_id)` joined through `linktarget`
    Modern,
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Legacy => f.write_str("legacy"),
            Schema::Modern => f.write_str("modern"),
        }
    }
}

/// Which pages end up in `nodes.csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum NodeSource {
    /// Only canonical pages that appear as an endpoint of an emitted edge
    Referenced,
    /// Every non-redirect page in the included namespaces, isolated articles included
    AllPages,
}

/// Namespaces whose pages may appear as graph nodes. Kept sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceSet(Vec<i32>);

impl NamespaceSet {
    pub fn new(mut namespaces: Vec<i32>) -> Self {
        namespaces.sort_unstable();
        namespaces.dedup();
        Self(namespaces)
    }

    pub fn articles() -> Self {
        Self(vec![0])
    }

    #[inline]
    pub fn contains(&self, namespace: i32) -> bool {
        // Almost always one or two entries
        self.0.contains(&namespace)
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }
}

impl FromStr for NamespaceSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let namespaces = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i32>()
                    .map_err(|_| format!("invalid namespace number: {part:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if namespaces.is_empty() {
            return Err("at least one namespace is required".to_string());
        }
        Ok(Self::new(namespaces))
    }
}

impl fmt::Display for NamespaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|ns| ns.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Rate limits applied by the pre-flight gate and the post-resolution abort check.
#[derive(Debug, Clone, Serialize)]
pub struct GateThresholds {
    pub max_malformed_rate: f64,
    pub max_unresolved_rate: f64,
    pub min_success_rate: f64,
    pub min_integrity_rate: f64,
    pub min_sample: u64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            max_malformed_rate: DEFAULT_MAX_MALFORMED_RATE,
            max_unresolved_rate: DEFAULT_MAX_UNRESOLVED_RATE,
            min_success_rate: DEFAULT_MIN_SUCCESS_RATE,
            min_integrity_rate: DEFAULT_MIN_INTEGRITY_RATE,
            min_sample: DEFAULT_MIN_SAMPLE,
        }
    }
}

/// Independently known magnitudes the post-run gate reconciles against.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpectedRanges {
    pub edges: Option<u64>,
    pub nodes: Option<u64>,
    /// Relative band around `edges`/`nodes`, e.g. 0.25 accepts +-25%
    pub tolerance: f64,
    /// Catastrophic floor: fewer emitted edges always fails the gate
    pub min_edges: u64,
}

impl ExpectedRanges {
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            tolerance,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub schema: Schema,
    pub namespaces: NamespaceSet,
    pub output_dir: PathBuf,
    pub max_redirect_hops: u32,
    pub limit: Option<u64>,
    pub sample_rate: f64,
    pub seed: u64,
    pub node_source: NodeSource,
    pub thresholds: GateThresholds,
    pub expected: ExpectedRanges,
    pub trace_sample: usize,
    pub spill_shards: usize,
}

impl PipelineConfig {
    pub fn new(schema: Schema, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            schema,
            namespaces: NamespaceSet::articles(),
            output_dir: output_dir.into(),
            max_redirect_hops: REDIRECT_MAX_HOPS,
            limit: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            seed: DEFAULT_SEED,
            node_source: NodeSource::Referenced,
            thresholds: GateThresholds::default(),
            expected: ExpectedRanges::with_tolerance(DEFAULT_TOLERANCE),
            trace_sample: DEFAULT_TRACE_SAMPLE,
            spill_shards: DEFAULT_SPILL_SHARDS,
        }
    }

    /// Limited runs are smoke tests and never publish under the final artifact names.
    pub fn is_smoke_run(&self) -> bool {
        self.limit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_set_parses_and_sorts() {
        let set: NamespaceSet = "14, 0,0".parse().unwrap();
        assert_eq!(set.as_slice(), &[0, 14]);
        assert!(set.contains(0));
        assert!(set.contains(14));
        assert!(!set.contains(10));
        assert_eq!(set.to_string(), "0,14");
    }

    #[test]
    fn namespace_set_rejects_garbage() {
        assert!("".parse::<NamespaceSet>().is_err());
        assert!("0,main".parse::<NamespaceSet>().is_err());
    }

    #[test]
    fn default_config_targets_articles() {
        let config = PipelineConfig::new(Schema::Modern, "/tmp/out");
        assert_eq!(config.namespaces, NamespaceSet::articles());
        assert_eq!(config.max_redirect_hops, REDIRECT_MAX_HOPS);
        assert_eq!(config.node_source, NodeSource::Referenced);
        assert!(!config.is_smoke_run());
    }

    #[test]
    fn limit_marks_smoke_run() {
        let mut config = PipelineConfig::new(Schema::Legacy, "/tmp/out");
        config.limit = Some(10);
        assert!(config.is_smoke_run());
    }
}
