//! Statistical gates around the resolution pass.
//!
//! The pre-flight gate resolves a uniformly random sample of raw rows before the full run
//! and refuses to continue when the sample looks unhealthy. The post-run gate reconciles
//! the counters and the exported totals, and re-derives a random subset of emitted edges
//! from the raw stream.
//!
//! Sampling is seeded, so a rerun over the same input draws the same rows.

use crate::config::{ExpectedRanges, GateThresholds, KS_CRITICAL_COEFFICIENT};
use crate::error::{GateCheckpoint, PipelineError};
use crate::models::{DirectedEdge, LinkOutcome};
use crate::resolve::{LinkResolver, LinkRowSource};
use crate::stats::{ratio, LinkCounters};
use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-segment RNG stream. Segments are numbered in stream order, so the draw does not
/// depend on which worker handles a segment.
pub fn segment_rng(seed: u64, seq: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (seq as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Fixed-capacity uniform sample over a stream of unknown length (Algorithm R).
pub struct Reservoir<T> {
    capacity: usize,
    seen: u64,
    items: Vec<T>,
    rng: StdRng,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity.min(1 << 16)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn offer(&mut self, item: T) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if slot < self.capacity as u64 {
            self.items[slot as usize] = item;
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// One named check within a gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl GateCheck {
    fn new(name: &'static str, passed: bool, detail: String) -> Self {
        Self {
            name,
            passed,
            detail,
        }
    }
}

fn gate_result(checkpoint: GateCheckpoint, checks: &[GateCheck]) -> Result<(), PipelineError> {
    let failures: Vec<String> = checks
        .iter()
        .filter(|check| !check.passed)
        .map(|check| format!("{}: {}", check.name, check.detail))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::GateFailure {
            checkpoint,
            failures,
        })
    }
}

// ---------------------------------------------------------------------------
// Positional bias
// ---------------------------------------------------------------------------

/// One-sample Kolmogorov-Smirnov statistic of sampled stream positions against the
/// uniform distribution on `[0, total)`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PositionalBias {
    pub sample_size: u64,
    pub statistic: f64,
    pub critical: f64,
    pub biased: bool,
}

/// `positions` must be sorted ascending and lie in `[0, total)`.
pub fn positional_bias(positions: &[u64], total: u64) -> PositionalBias {
    let n = positions.len();
    if n == 0 || total == 0 {
        return PositionalBias {
            sample_size: 0,
            statistic: 0.0,
            critical: f64::INFINITY,
            biased: false,
        };
    }
    let nf = n as f64;
    let statistic = positions
        .iter()
        .enumerate()
        .map(|(i, &position)| {
            // Midpoint of the row's slot on [0, 1)
            let x = (position as f64 + 0.5) / total as f64;
            let above = (i + 1) as f64 / nf - x;
            let below = x - i as f64 / nf;
            above.max(below)
        })
        .fold(0.0f64, f64::max);
    let critical = KS_CRITICAL_COEFFICIENT / nf.sqrt();
    PositionalBias {
        sample_size: n as u64,
        statistic,
        critical,
        biased: statistic > critical,
    }
}

// ---------------------------------------------------------------------------
// Pre-flight
// ---------------------------------------------------------------------------

/// A sampled raw row, resolved.
#[derive(Debug, Clone, Copy)]
pub struct SampledRow {
    pub position: u64,
    pub outcome: LinkOutcome,
}

#[derive(Debug, Clone)]
pub struct PreflightSample {
    pub total_rows: u64,
    /// Sorted by stream position
    pub rows: Vec<SampledRow>,
}

impl PreflightSample {
    pub fn positions(&self) -> Vec<u64> {
        self.rows.iter().map(|row| row.position).collect()
    }

    pub fn counters(&self) -> LinkCounters {
        let mut counters = LinkCounters::new();
        for row in &self.rows {
            counters.record(&row.outcome);
        }
        counters
    }
}

/// Row with its random sampling key. Ordered by key, ties broken by stream position.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    key: f64,
    seq: usize,
    ordinal: u64,
    outcome: LinkOutcome,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then(self.seq.cmp(&other.seq))
            .then(self.ordinal.cmp(&other.ordinal))
    }
}

/// Keeps the `capacity` smallest candidates.
fn push_bounded(heap: &mut BinaryHeap<Candidate>, candidate: Candidate, capacity: usize) {
    if heap.len() < capacity {
        heap.push(candidate);
    } else if heap.peek().is_some_and(|largest| candidate < *largest) {
        heap.pop();
        heap.push(candidate);
    }
}

/// Draws a uniformly random sample of the raw stream and resolves it.
///
/// Every row gets a uniform key in `[0, 1)`. Rows with a key below `rate` form a
/// Bernoulli sample. When that sample is smaller than `min(min_sample, total_rows)`, it is
/// topped up with the next-smallest keys, which is still a uniform sample without
/// replacement. Each sampled row is resolved on the worker that reads it.
pub fn draw_preflight_sample<S: LinkRowSource>(
    source: &S,
    resolver: &LinkResolver<'_>,
    rate: f64,
    min_sample: u64,
    seed: u64,
    limit: Option<u64>,
) -> Result<PreflightSample> {
    let reserve_size = usize::try_from(min_sample).unwrap_or(usize::MAX);
    let reserve: Mutex<BinaryHeap<Candidate>> = Mutex::new(BinaryHeap::new());

    let segments = source.par_segments(limit, |seq, rows| -> Result<(u64, Vec<Candidate>)> {
        let mut rng = segment_rng(seed, seq);
        let mut accepted = Vec::new();
        let mut local: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut count = 0u64;
        for row in rows {
            let key: f64 = rng.gen();
            let ordinal = count;
            count += 1;
            let in_sample = key < rate;
            if !in_sample
                && reserve_size > 0
                && local.len() >= reserve_size
                && local.peek().is_some_and(|largest| key >= largest.key)
            {
                continue;
            }
            let candidate = Candidate {
                key,
                seq,
                ordinal,
                outcome: resolver.resolve_row(&row),
            };
            if in_sample {
                accepted.push(candidate);
            } else if reserve_size > 0 {
                push_bounded(&mut local, candidate, reserve_size);
            }
        }
        if !local.is_empty() {
            let mut global = reserve
                .lock()
                .map_err(|_| anyhow!("pre-flight reserve lock poisoned"))?;
            for candidate in local {
                push_bounded(&mut global, candidate, reserve_size);
            }
        }
        Ok((count, accepted))
    })?;

    let mut offsets = Vec::with_capacity(segments.len());
    let mut total_rows = 0u64;
    let mut sampled: Vec<Candidate> = Vec::new();
    let mut max_seq = 0usize;
    for (seq, segment) in segments {
        let (count, accepted) = segment?;
        max_seq = max_seq.max(seq);
        offsets.push((seq, total_rows));
        total_rows += count;
        sampled.extend(accepted);
    }
    // Segment sequence numbers are dense, so the offsets table can be indexed directly
    let mut offset_of = vec![0u64; max_seq + 1];
    for (seq, offset) in offsets {
        offset_of[seq] = offset;
    }

    let wanted = min_sample.min(total_rows) as usize;
    if sampled.len() < wanted {
        let reserve = reserve
            .into_inner()
            .map_err(|_| anyhow!("pre-flight reserve lock poisoned"))?;
        let mut extra = reserve.into_sorted_vec();
        extra.truncate(wanted - sampled.len());
        debug!(
            bernoulli = sampled.len(),
            topped_up = extra.len(),
            "Pre-flight sample topped up to the minimum size"
        );
        sampled.extend(extra);
    }

    let mut rows: Vec<SampledRow> = sampled
        .into_iter()
        .map(|candidate| SampledRow {
            position: offset_of[candidate.seq] + candidate.ordinal,
            outcome: candidate.outcome,
        })
        .collect();
    rows.sort_unstable_by_key(|row| row.position);

    info!(
        total_rows,
        sample = rows.len(),
        rate,
        "Pre-flight sample drawn"
    );
    Ok(PreflightSample { total_rows, rows })
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub total_rows: u64,
    pub sample_size: u64,
    pub counters: LinkCounters,
    /// Resolved links over rows whose source exists
    pub raw_success_rate: f64,
    /// Resolved links over rows that reached a lookup verdict
    pub adjusted_success_rate: f64,
    /// Resolved or legitimately filtered, over rows whose source exists
    pub integrity_rate: f64,
    pub malformed_rate: f64,
    pub bias: PositionalBias,
    pub checks: Vec<GateCheck>,
    pub passed: bool,
}

impl PreflightReport {
    pub fn evaluate(sample: &PreflightSample, thresholds: &GateThresholds) -> Self {
        let counters = sample.counters();
        let success = counters.edges_emitted + counters.self_loops;
        let valid = counters.valid_sources();
        let raw_success_rate = ratio(success, valid);
        let adjusted_success_rate = ratio(success, success + counters.unresolved);
        let integrity_rate = ratio(success + counters.skipped_namespace, valid);
        let malformed_rate = counters.rate(counters.malformed);
        let sample_size = sample.rows.len() as u64;

        let bias = if sample_size == sample.total_rows {
            // The whole stream was sampled
            positional_bias(&[], 0)
        } else {
            positional_bias(&sample.positions(), sample.total_rows)
        };

        let wanted = thresholds.min_sample.min(sample.total_rows);
        let checks = vec![
            GateCheck::new(
                "sample_size",
                sample_size >= wanted && sample_size > 0,
                format!(
                    "{} rows sampled of {}, need {}",
                    sample_size,
                    sample.total_rows,
                    wanted.max(1)
                ),
            ),
            GateCheck::new(
                "positional_bias",
                !bias.biased,
                format!(
                    "KS statistic {:.4} against critical value {:.4}",
                    bias.statistic, bias.critical
                ),
            ),
            GateCheck::new(
                "malformed_rate",
                malformed_rate <= thresholds.max_malformed_rate,
                format!(
                    "{:.4} malformed (maximum {:.4})",
                    malformed_rate, thresholds.max_malformed_rate
                ),
            ),
            GateCheck::new(
                "success_rate",
                raw_success_rate >= thresholds.min_success_rate
                    || integrity_rate >= thresholds.min_integrity_rate,
                format!(
                    "raw success {:.4} (minimum {:.4}), integrity {:.4} (minimum {:.4})",
                    raw_success_rate,
                    thresholds.min_success_rate,
                    integrity_rate,
                    thresholds.min_integrity_rate
                ),
            ),
        ];
        let passed = checks.iter().all(|check| check.passed);

        Self {
            total_rows: sample.total_rows,
            sample_size,
            counters,
            raw_success_rate,
            adjusted_success_rate,
            integrity_rate,
            malformed_rate,
            bias,
            checks,
            passed,
        }
    }

    pub fn to_result(&self) -> Result<(), PipelineError> {
        gate_result(GateCheckpoint::PreFlight, &self.checks)
    }
}

/// Aborts the run when an aggregate failure rate crosses its limit.
pub fn check_failure_rates(
    counters: &LinkCounters,
    thresholds: &GateThresholds,
) -> Result<(), PipelineError> {
    let limits = [
        ("malformed", counters.malformed, thresholds.max_malformed_rate),
        ("unresolved", counters.unresolved, thresholds.max_unresolved_rate),
    ];
    for (category, count, threshold) in limits {
        let rate = counters.rate(count);
        if rate > threshold {
            warn!(category, rate, threshold, "Failure rate over threshold");
            return Err(PipelineError::ThresholdBreach {
                category,
                rate,
                threshold,
                count,
                processed: counters.processed,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Post-run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub sampled: u64,
    pub traced: u64,
    pub untraced: Vec<DirectedEdge>,
}

/// Re-reads the raw stream and confirms each sampled edge is produced by at least one row.
pub fn trace_edges<S: LinkRowSource>(
    source: &S,
    resolver: &LinkResolver<'_>,
    sample: &[DirectedEdge],
    limit: Option<u64>,
) -> Result<TraceReport> {
    let wanted: FxHashSet<DirectedEdge> = sample.iter().copied().collect();
    if wanted.is_empty() {
        return Ok(TraceReport {
            sampled: 0,
            traced: 0,
            untraced: Vec::new(),
        });
    }

    let segments = source.par_segments(limit, |_, rows| {
        let mut found = FxHashSet::default();
        for row in rows {
            if let LinkOutcome::Edge(edge) = resolver.resolve_row(&row) {
                if wanted.contains(&edge) {
                    found.insert(edge);
                }
            }
        }
        found
    })?;
    let found: FxHashSet<DirectedEdge> =
        segments.into_iter().flat_map(|(_, found)| found).collect();

    let mut untraced: Vec<DirectedEdge> = wanted
        .iter()
        .filter(|edge| !found.contains(edge))
        .copied()
        .collect();
    untraced.sort_unstable();

    let report = TraceReport {
        sampled: wanted.len() as u64,
        traced: (wanted.len() - untraced.len()) as u64,
        untraced,
    };
    info!(sampled = report.sampled, traced = report.traced, "Edge traceability checked");
    Ok(report)
}

/// Totals the exporter reports back for reconciliation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExportTotals {
    pub nodes_written: u64,
    pub edges_written: u64,
    pub namespace_violations: u64,
    /// Edge endpoints absent from `nodes.csv`
    pub dangling_endpoints: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostrunReport {
    pub checks: Vec<GateCheck>,
    pub passed: bool,
}

fn within_band(actual: u64, expected: u64, tolerance: f64) -> bool {
    let expected = expected as f64;
    (actual as f64 - expected).abs() <= expected * tolerance
}

impl PostrunReport {
    pub fn evaluate(
        counters: &LinkCounters,
        totals: &ExportTotals,
        expected: &ExpectedRanges,
        trace: Option<&TraceReport>,
    ) -> Self {
        let mut checks = vec![
            GateCheck::new(
                "counter_identity",
                counters.is_consistent(),
                format!(
                    "processed {} against {} accounted",
                    counters.processed,
                    counters.accounted()
                ),
            ),
            GateCheck::new(
                "edges_reconciled",
                totals.edges_written == counters.edges_emitted,
                format!(
                    "{} edges written, {} counted",
                    totals.edges_written, counters.edges_emitted
                ),
            ),
            GateCheck::new(
                "namespace_violations",
                totals.namespace_violations == 0,
                format!("{} records outside the namespace set", totals.namespace_violations),
            ),
            GateCheck::new(
                "referential_integrity",
                totals.dangling_endpoints == 0,
                format!("{} edge endpoints without a node", totals.dangling_endpoints),
            ),
            GateCheck::new(
                "min_edges",
                totals.edges_written >= expected.min_edges,
                format!(
                    "{} edges written (floor {})",
                    totals.edges_written, expected.min_edges
                ),
            ),
        ];
        if let Some(edges) = expected.edges {
            checks.push(GateCheck::new(
                "expected_edges",
                within_band(totals.edges_written, edges, expected.tolerance),
                format!(
                    "{} edges written, expected {} +/- {:.0}%",
                    totals.edges_written,
                    edges,
                    expected.tolerance * 100.0
                ),
            ));
        }
        if let Some(nodes) = expected.nodes {
            checks.push(GateCheck::new(
                "expected_nodes",
                within_band(totals.nodes_written, nodes, expected.tolerance),
                format!(
                    "{} nodes written, expected {} +/- {:.0}%",
                    totals.nodes_written,
                    nodes,
                    expected.tolerance * 100.0
                ),
            ));
        }
        if let Some(trace) = trace {
            checks.push(GateCheck::new(
                "traceability",
                trace.untraced.is_empty(),
                format!(
                    "{} of {} sampled edges re-derived from raw rows",
                    trace.traced, trace.sampled
                ),
            ));
        }
        let passed = checks.iter().all(|check| check.passed);
        Self { checks, passed }
    }

    pub fn to_result(&self) -> Result<(), PipelineError> {
        gate_result(GateCheckpoint::PostRun, &self.checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NamespaceSet, Schema};
    use crate::error::{MalformedRow, RowResult};
    use crate::index::tests::page;
    use crate::index::{LinkTargetDirectory, PageDirectory};
    use crate::models::{LinkTargetRow, RawLinkRecord};
    use crate::resolve::tests::modern;
    use crate::resolve::MemoryLinkSource;

    fn legacy(from: u32, title: &str) -> RowResult<RawLinkRecord> {
        Ok(RawLinkRecord::Legacy {
            from,
            target_namespace: 0,
            target_title: title.to_string(),
        })
    }

    fn pages() -> PageDirectory {
        PageDirectory::build(
            vec![page(1, 0, "A", false), page(2, 0, "B", false)],
            vec![],
        )
    }

    #[test]
    fn reservoir_keeps_capacity_and_counts() {
        let mut reservoir = Reservoir::new(10, 7);
        for i in 0..1000 {
            reservoir.offer(i);
        }
        assert_eq!(reservoir.seen(), 1000);
        assert_eq!(reservoir.len(), 10);
        let items = reservoir.into_items();
        // Not simply the head of the stream
        assert!(items.iter().any(|&i| i >= 10));
    }

    #[test]
    fn reservoir_smaller_stream_keeps_everything() {
        let mut reservoir = Reservoir::new(10, 7);
        for i in 0..4 {
            reservoir.offer(i);
        }
        assert_eq!(reservoir.into_items(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn prefix_sample_of_sorted_stream_is_biased() {
        // Head of a dump sorted by target id: the first 1,000 of 1,000,000 rows
        let positions: Vec<u64> = (0..1000).collect();
        let bias = positional_bias(&positions, 1_000_000);
        assert!(bias.biased);
        assert!(bias.statistic > 0.99);
    }

    #[test]
    fn head_of_target_sorted_dump_fails_preflight() {
        // 50 target pages, 200 links each, rows sorted by target id
        let dir = PageDirectory::build(
            (1..=50).map(|id| page(id, 0, &format!("P{id}"), false)),
            vec![],
        );
        let targets = LinkTargetDirectory::build(
            (1..=50u64).map(|id| {
                Ok(LinkTargetRow {
                    id: 100 + id,
                    namespace: 0,
                    title: format!("P{id}"),
                })
            }),
            &dir,
        );
        let rows: Vec<_> = (1..=50u64)
            .flat_map(|id| (0..200).map(move |_| modern(1, 100 + id)))
            .collect();
        let total_rows = rows.len() as u64;
        let source = MemoryLinkSource::chunked(rows, 512);
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &dir, Some(&targets), &ns, 2).unwrap();

        // Take the first 1,000 rows instead of a random sample
        let head = source
            .par_segments(Some(1000), |_, rows| {
                rows.map(|row| resolver.resolve_row(&row)).collect::<Vec<_>>()
            })
            .unwrap();
        let sample = PreflightSample {
            total_rows,
            rows: head
                .into_iter()
                .flat_map(|(_, outcomes)| outcomes)
                .enumerate()
                .map(|(position, outcome)| SampledRow {
                    position: position as u64,
                    outcome,
                })
                .collect(),
        };
        assert_eq!(sample.rows.len(), 1000);

        let report = PreflightReport::evaluate(&sample, &GateThresholds::default());
        assert!(!report.passed);
        assert!(report.bias.biased);
        let failed: Vec<&str> = report
            .checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| check.name)
            .collect();
        assert_eq!(failed, vec!["positional_bias"]);

        // The same stream sampled properly passes
        let drawn = draw_preflight_sample(&source, &resolver, 0.1, 1000, 42, None).unwrap();
        let report = PreflightReport::evaluate(&drawn, &GateThresholds::default());
        assert!(report.passed, "{:?}", report.checks);
    }

    #[test]
    fn evenly_spread_sample_is_not_biased() {
        let positions: Vec<u64> = (0..1000).map(|i| i * 1000 + 500).collect();
        let bias = positional_bias(&positions, 1_000_000);
        assert!(!bias.biased, "statistic {}", bias.statistic);
    }

    #[test]
    fn drawn_sample_is_spread_over_the_stream() {
        let dir = pages();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &dir, None, &ns, 2).unwrap();
        let rows: Vec<_> = (0..100_000).map(|_| legacy(1, "B")).collect();
        let source = MemoryLinkSource::chunked(rows, 4096);

        let sample = draw_preflight_sample(&source, &resolver, 0.02, 100, 42, None).unwrap();
        assert_eq!(sample.total_rows, 100_000);
        assert!(sample.rows.len() > 1500 && sample.rows.len() < 2500);
        let bias = positional_bias(&sample.positions(), sample.total_rows);
        assert!(!bias.biased, "statistic {}", bias.statistic);
        assert!(sample.rows.windows(2).all(|w| w[0].position < w[1].position));
    }

    #[test]
    fn sample_is_reproducible_for_a_seed() {
        let dir = pages();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &dir, None, &ns, 2).unwrap();
        let rows: Vec<_> = (0..20_000).map(|_| legacy(1, "B")).collect();
        let source = MemoryLinkSource::chunked(rows, 1000);

        let a = draw_preflight_sample(&source, &resolver, 0.01, 50, 9, None).unwrap();
        let b = draw_preflight_sample(&source, &resolver, 0.01, 50, 9, None).unwrap();
        assert_eq!(a.positions(), b.positions());
    }

    #[test]
    fn small_rate_is_topped_up_to_minimum() {
        let dir = pages();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &dir, None, &ns, 2).unwrap();
        let rows: Vec<_> = (0..5000).map(|_| legacy(1, "B")).collect();
        let source = MemoryLinkSource::chunked(rows, 300);

        let sample = draw_preflight_sample(&source, &resolver, 0.0, 400, 1, None).unwrap();
        assert_eq!(sample.rows.len(), 400);
        // A stream smaller than the minimum is sampled whole
        let sample = draw_preflight_sample(&source, &resolver, 0.0, 10_000, 1, None).unwrap();
        assert_eq!(sample.rows.len(), 5000);
    }

    #[test]
    fn mostly_malformed_stream_fails_preflight() {
        let dir = pages();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &dir, None, &ns, 2).unwrap();
        let rows: Vec<_> = (0..1000)
            .map(|i| {
                if i % 20 == 0 {
                    legacy(1, "B")
                } else {
                    Err(MalformedRow::new("garbage"))
                }
            })
            .collect();
        let source = MemoryLinkSource::chunked(rows, 100);
        let sample = draw_preflight_sample(&source, &resolver, 1.0, 100, 3, None).unwrap();
        let report = PreflightReport::evaluate(&sample, &GateThresholds::default());

        assert!(!report.passed);
        assert!((report.malformed_rate - 0.95).abs() < 1e-9);
        let err = report.to_result().unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("malformed_rate"));
    }

    #[test]
    fn healthy_stream_passes_preflight() {
        let dir = pages();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &dir, None, &ns, 2).unwrap();
        let rows: Vec<_> = (0..1000)
            .map(|i| if i % 10 == 0 { legacy(1, "Nowhere") } else { legacy(1, "B") })
            .collect();
        let source = MemoryLinkSource::chunked(rows, 100);
        let sample = draw_preflight_sample(&source, &resolver, 1.0, 100, 3, None).unwrap();
        let report = PreflightReport::evaluate(&sample, &GateThresholds::default());

        assert!(report.passed, "{:?}", report.checks);
        assert!((report.raw_success_rate - 0.9).abs() < 1e-9);
        assert!((report.adjusted_success_rate - 0.9).abs() < 1e-9);
        assert!(report.to_result().is_ok());
    }

    #[test]
    fn failure_rates_breach_thresholds() {
        let mut counters = LinkCounters::new();
        for _ in 0..10 {
            counters.record(&LinkOutcome::Malformed);
        }
        counters.record(&LinkOutcome::Edge(DirectedEdge::new(1, 2)));
        let err = check_failure_rates(&counters, &GateThresholds::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ThresholdBreach {
                category: "malformed",
                ..
            }
        ));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn postrun_reconciles_totals() {
        let mut counters = LinkCounters::new();
        counters.record(&LinkOutcome::Edge(DirectedEdge::new(1, 2)));
        counters.record(&LinkOutcome::Edge(DirectedEdge::new(1, 2)));
        counters.apply_dedup(1);
        let totals = ExportTotals {
            nodes_written: 2,
            edges_written: 1,
            ..ExportTotals::default()
        };
        let mut expected = ExpectedRanges::with_tolerance(0.25);
        expected.min_edges = 1;
        expected.edges = Some(1);

        let report = PostrunReport::evaluate(&counters, &totals, &expected, None);
        assert!(report.passed, "{:?}", report.checks);

        expected.nodes = Some(10);
        let report = PostrunReport::evaluate(&counters, &totals, &expected, None);
        assert!(!report.passed);
        assert!(report.to_result().unwrap_err().to_string().contains("expected_nodes"));
    }

    #[test]
    fn untraced_edge_fails_postrun() {
        let dir = pages();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &dir, None, &ns, 2).unwrap();
        let source = MemoryLinkSource::chunked(vec![legacy(1, "B"), legacy(2, "A")], 1);

        let claimed = [DirectedEdge::new(1, 2), DirectedEdge::new(2, 7)];
        let trace = trace_edges(&source, &resolver, &claimed, None).unwrap();
        assert_eq!(trace.sampled, 2);
        assert_eq!(trace.traced, 1);
        assert_eq!(trace.untraced, vec![DirectedEdge::new(2, 7)]);

        let mut counters = LinkCounters::new();
        counters.record(&LinkOutcome::Edge(DirectedEdge::new(1, 2)));
        let totals = ExportTotals {
            nodes_written: 2,
            edges_written: 1,
            ..ExportTotals::default()
        };
        let report = PostrunReport::evaluate(
            &counters,
            &totals,
            &ExpectedRanges::with_tolerance(0.25),
            Some(&trace),
        );
        assert!(!report.passed);
    }
}
