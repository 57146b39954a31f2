use crate::models::{LinkOutcome, UnresolvedReason};
use serde::Serialize;
use std::ops::{Add, AddAssign};

/// Counters for one resolution pass.
///
/// Each worker owns a local instance and the pass sums them once at the end, so nothing
/// shared is touched per row.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    pub processed: u64,
    pub edges_emitted: u64,
    pub skipped_namespace: u64,
    pub unresolved: u64,
    pub malformed: u64,
    pub duplicate: u64,
    pub missing_source: u64,
    pub self_loops: u64,
    // breakdown of `unresolved`
    pub redlink: u64,
    pub missing_link_target: u64,
    pub redirect_unresolved: u64,
}

impl LinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one raw row. An `Edge` outcome counts as emitted until the dedup reduction
    /// reports how many survive, see [`apply_dedup`](Self::apply_dedup).
    #[inline]
    pub fn record(&mut self, outcome: &LinkOutcome) {
        self.processed += 1;
        match outcome {
            LinkOutcome::Edge(_) => self.edges_emitted += 1,
            LinkOutcome::SelfLoop => self.self_loops += 1,
            LinkOutcome::SkippedNamespace => self.skipped_namespace += 1,
            LinkOutcome::MissingSource => self.missing_source += 1,
            LinkOutcome::Malformed => self.malformed += 1,
            LinkOutcome::Unresolved(reason) => {
                self.unresolved += 1;
                match reason {
                    UnresolvedReason::Redlink => self.redlink += 1,
                    UnresolvedReason::MissingLinkTarget => self.missing_link_target += 1,
                    UnresolvedReason::Redirect(_) => self.redirect_unresolved += 1,
                }
            }
        }
    }

    pub fn merge(&mut self, other: &LinkCounters) {
        *self += *other;
    }

    /// Moves edges that did not survive deduplication from `edges_emitted` to `duplicate`.
    pub fn apply_dedup(&mut self, unique_edges: u64) {
        let removed = self.edges_emitted.saturating_sub(unique_edges);
        self.duplicate += removed;
        self.edges_emitted -= removed;
    }

    /// Sum of every terminal category. Equals `processed` when the counters are consistent.
    pub fn accounted(&self) -> u64 {
        self.edges_emitted
            + self.duplicate
            + self.self_loops
            + self.skipped_namespace
            + self.unresolved
            + self.malformed
            + self.missing_source
    }

    pub fn is_consistent(&self) -> bool {
        self.accounted() == self.processed
            && self.redlink + self.missing_link_target + self.redirect_unresolved == self.unresolved
    }

    /// Rows that parsed and whose source page exists.
    pub fn valid_sources(&self) -> u64 {
        self.processed - self.malformed - self.missing_source
    }

    /// `count / processed`, zero for an empty pass.
    pub fn rate(&self, count: u64) -> f64 {
        ratio(count, self.processed)
    }
}

pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl AddAssign for LinkCounters {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.edges_emitted += other.edges_emitted;
        self.skipped_namespace += other.skipped_namespace;
        self.unresolved += other.unresolved;
        self.malformed += other.malformed;
        self.duplicate += other.duplicate;
        self.missing_source += other.missing_source;
        self.self_loops += other.self_loops;
        self.redlink += other.redlink;
        self.missing_link_target += other.missing_link_target;
        self.redirect_unresolved += other.redirect_unresolved;
    }
}

impl Add for LinkCounters {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}
