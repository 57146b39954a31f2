//! Link resolution: joins raw `pagelinks` rows against the directories and turns each one
//! into a [`LinkOutcome`].

use crate::config::{NamespaceSet, Schema, PROGRESS_INTERVAL};
use crate::error::{PipelineError, RowResult};
use crate::index::{LinkTargetDirectory, PageDirectory};
use crate::merge::SpillSet;
use crate::models::{DirectedEdge, LinkOutcome, PageRecord, RawLinkRecord, UnresolvedReason};
use crate::redirect::RedirectResolver;
use crate::stats::LinkCounters;
use anyhow::Result;
use indicatif::ProgressBar;
use tracing::{debug, info};

/// A partitioned stream of raw link rows.
///
/// Implementations hand each segment to `f` on the worker pool and return the per-segment
/// results ordered by segment sequence number. Concatenating the segments in that order
/// reproduces the stream order. With `limit`, only the first `limit` rows of the stream
/// are delivered.
pub trait LinkRowSource: Sync {
    fn par_segments<R, F>(&self, limit: Option<u64>, f: F) -> Result<Vec<(usize, R)>>
    where
        R: Send,
        F: Fn(usize, &mut dyn Iterator<Item = RowResult<RawLinkRecord>>) -> R + Sync + Send;
}

/// In-memory segments, for callers that already hold decoded rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryLinkSource {
    segments: Vec<Vec<RowResult<RawLinkRecord>>>,
}

impl MemoryLinkSource {
    pub fn new(segments: Vec<Vec<RowResult<RawLinkRecord>>>) -> Self {
        Self { segments }
    }

    /// Splits `rows` into segments of at most `segment_len` rows.
    pub fn chunked(rows: Vec<RowResult<RawLinkRecord>>, segment_len: usize) -> Self {
        let segments = rows
            .chunks(segment_len.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        Self { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LinkRowSource for MemoryLinkSource {
    fn par_segments<R, F>(&self, limit: Option<u64>, f: F) -> Result<Vec<(usize, R)>>
    where
        R: Send,
        F: Fn(usize, &mut dyn Iterator<Item = RowResult<RawLinkRecord>>) -> R + Sync + Send,
    {
        use rayon::prelude::*;

        if let Some(limit) = limit {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            let mut rows = self.segments.iter().flatten().cloned().take(limit);
            return Ok(vec![(0, f(0, &mut rows))]);
        }
        Ok(self
            .segments
            .par_iter()
            .enumerate()
            .map(|(seq, segment)| {
                let mut rows = segment.iter().cloned();
                (seq, f(seq, &mut rows))
            })
            .collect())
    }
}

/// Resolves raw link rows against read-only directories. Cheap to share across workers.
pub struct LinkResolver<'a> {
    schema: Schema,
    pages: &'a PageDirectory,
    targets: Option<&'a LinkTargetDirectory>,
    namespaces: &'a NamespaceSet,
    redirects: RedirectResolver<'a>,
}

impl<'a> LinkResolver<'a> {
    /// The modern schema joins through the link-target directory, so it must be present.
    pub fn new(
        schema: Schema,
        pages: &'a PageDirectory,
        targets: Option<&'a LinkTargetDirectory>,
        namespaces: &'a NamespaceSet,
        max_redirect_hops: u32,
    ) -> Result<Self, PipelineError> {
        if schema == Schema::Modern && targets.is_none() {
            return Err(PipelineError::schema(
                "linktarget",
                "the modern pagelinks layout needs the linktarget table",
            ));
        }
        Ok(Self {
            schema,
            pages,
            targets,
            namespaces,
            redirects: RedirectResolver::new(pages, max_redirect_hops),
        })
    }

    pub fn schema(&self) -> Schema {
        self.schema
    }

    /// A row that failed to parse is `Malformed`.
    #[inline]
    pub fn resolve_row(&self, row: &RowResult<RawLinkRecord>) -> LinkOutcome {
        match row {
            Ok(record) => self.resolve(record),
            Err(_) => LinkOutcome::Malformed,
        }
    }

    pub fn resolve(&self, record: &RawLinkRecord) -> LinkOutcome {
        let Some(source) = self.pages.get(record.from_page_id()) else {
            return LinkOutcome::MissingSource;
        };
        // Links out of a redirect page belong to the page it redirects to
        let source = match self.redirects.resolve(source) {
            Ok(page) => page,
            Err(failure) => return LinkOutcome::Unresolved(UnresolvedReason::Redirect(failure)),
        };
        if !self.namespaces.contains(source.namespace) {
            return LinkOutcome::SkippedNamespace;
        }

        let target = match self.lookup_target(record) {
            Ok(page) => page,
            Err(outcome) => return outcome,
        };
        let target = match self.redirects.resolve(target) {
            Ok(page) => page,
            Err(failure) => return LinkOutcome::Unresolved(UnresolvedReason::Redirect(failure)),
        };
        // A redirect may cross into an excluded namespace
        if !self.namespaces.contains(target.namespace) {
            return LinkOutcome::SkippedNamespace;
        }

        let edge = DirectedEdge::new(source.id, target.id);
        if edge.is_self_loop() {
            LinkOutcome::SelfLoop
        } else {
            LinkOutcome::Edge(edge)
        }
    }

    /// The page named by the row's target, before redirect resolution. The target
    /// namespace is checked before the title lookup so filtered links never count as
    /// redlinks.
    fn lookup_target(&self, record: &RawLinkRecord) -> Result<&'a PageRecord, LinkOutcome> {
        let (namespace, title): (i32, &str) = match (self.schema, record) {
            (
                Schema::Legacy,
                RawLinkRecord::Legacy {
                    target_namespace,
                    target_title,
                    ..
                },
            ) => (*target_namespace, target_title.as_str()),
            (Schema::Modern, RawLinkRecord::Modern { target_id, .. }) => {
                let target = self
                    .targets
                    .and_then(|targets| targets.get(*target_id))
                    .ok_or(LinkOutcome::Unresolved(UnresolvedReason::MissingLinkTarget))?;
                return self.lookup_page(target.namespace, &target.title);
            }
            // A record decoded under the other layout cannot be joined
            _ => return Err(LinkOutcome::Malformed),
        };
        self.lookup_page(namespace, title)
    }

    fn lookup_page(&self, namespace: i32, title: &str) -> Result<&'a PageRecord, LinkOutcome> {
        if !self.namespaces.contains(namespace) {
            return Err(LinkOutcome::SkippedNamespace);
        }
        self.pages
            .lookup(namespace, title)
            .ok_or(LinkOutcome::Unresolved(UnresolvedReason::Redlink))
    }
}

/// Resolves every row of `source` on the worker pool, spilling edges into `spill`.
/// Returns the merged counters; duplicates are not yet separated out.
pub fn run_resolution<S: LinkRowSource>(
    source: &S,
    resolver: &LinkResolver<'_>,
    spill: &SpillSet,
    limit: Option<u64>,
) -> Result<LinkCounters> {
    let pb = ProgressBar::new_spinner();
    pb.set_message("Resolving links");

    let segments = source.par_segments(limit, |seq, rows| -> Result<LinkCounters> {
        let mut counters = LinkCounters::new();
        let mut writer = spill.writer();
        for row in rows {
            let outcome = resolver.resolve_row(&row);
            counters.record(&outcome);
            if let LinkOutcome::Edge(edge) = outcome {
                writer.push(edge)?;
            }
            if counters.processed % PROGRESS_INTERVAL == 0 {
                pb.inc(PROGRESS_INTERVAL);
            }
        }
        writer.flush()?;
        debug!(segment = seq, rows = counters.processed, "Segment resolved");
        Ok(counters)
    })?;
    pb.finish_and_clear();

    let counters = segments
        .into_iter()
        .map(|(_, counters)| counters)
        .try_fold(LinkCounters::new(), |acc, counters| {
            counters.map(|counters| acc + counters)
        })?;

    info!(
        processed = counters.processed,
        edges = counters.edges_emitted,
        skipped_namespace = counters.skipped_namespace,
        unresolved = counters.unresolved,
        malformed = counters.malformed,
        missing_source = counters.missing_source,
        "Resolution pass complete"
    );
    Ok(counters)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::index::tests::{page, redirect};
    use crate::models::{LinkTargetRow, RedirectFailure};
    use crate::error::MalformedRow;
    use tempfile::TempDir;

    pub(crate) fn modern(from: u32, target_id: u64) -> RowResult<RawLinkRecord> {
        Ok(RawLinkRecord::Modern {
            from,
            from_namespace: 0,
            target_id,
        })
    }

    pub(crate) fn legacy(from: u32, namespace: i32, title: &str) -> RowResult<RawLinkRecord> {
        Ok(RawLinkRecord::Legacy {
            from,
            target_namespace: namespace,
            target_title: title.to_string(),
        })
    }

    fn target(id: u64, namespace: i32, title: &str) -> RowResult<LinkTargetRow> {
        Ok(LinkTargetRow {
            id,
            namespace,
            title: title.to_string(),
        })
    }

    /// A(1), B(2), C(3) -> B, Template:Infobox(4, ns 10), Talk:A(5, ns 1)
    fn fixture() -> (PageDirectory, LinkTargetDirectory) {
        let pages = PageDirectory::build(
            vec![
                page(1, 0, "A", false),
                page(2, 0, "B", false),
                page(3, 0, "C", true),
                page(4, 10, "Infobox", false),
                page(5, 1, "A", false),
            ],
            vec![redirect(3, 0, "B")],
        );
        let targets = LinkTargetDirectory::build(
            vec![
                target(10, 0, "B"),
                target(11, 0, "C"),
                target(12, 10, "Infobox"),
                target(13, 0, "Nowhere"),
                target(14, 0, "A"),
            ],
            &pages,
        );
        (pages, targets)
    }

    #[test]
    fn modern_link_resolves_through_link_target() {
        let (pages, targets) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &pages, Some(&targets), &ns, 2).unwrap();
        assert_eq!(
            resolver.resolve_row(&modern(1, 10)),
            LinkOutcome::Edge(DirectedEdge::new(1, 2))
        );
    }

    #[test]
    fn redirect_target_is_canonicalized() {
        let (pages, targets) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &pages, Some(&targets), &ns, 2).unwrap();
        assert_eq!(
            resolver.resolve_row(&modern(1, 11)),
            LinkOutcome::Edge(DirectedEdge::new(1, 2))
        );
    }

    #[test]
    fn redirect_source_is_canonicalized() {
        let (pages, targets) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &pages, Some(&targets), &ns, 2).unwrap();
        // C redirects to B, so C -> A is B -> A
        assert_eq!(
            resolver.resolve_row(&modern(3, 14)),
            LinkOutcome::Edge(DirectedEdge::new(2, 1))
        );
        // and C -> B collapses to a self-loop
        assert_eq!(resolver.resolve_row(&modern(3, 10)), LinkOutcome::SelfLoop);
    }

    #[test]
    fn excluded_namespaces_are_skipped() {
        let (pages, targets) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &pages, Some(&targets), &ns, 2).unwrap();
        assert_eq!(
            resolver.resolve_row(&modern(1, 12)),
            LinkOutcome::SkippedNamespace
        );
        // Source outside the set
        assert_eq!(
            resolver.resolve_row(&modern(5, 10)),
            LinkOutcome::SkippedNamespace
        );

        let wider = NamespaceSet::new(vec![0, 10]);
        let resolver =
            LinkResolver::new(Schema::Modern, &pages, Some(&targets), &wider, 2).unwrap();
        assert_eq!(
            resolver.resolve_row(&modern(1, 12)),
            LinkOutcome::Edge(DirectedEdge::new(1, 4))
        );
    }

    #[test]
    fn missing_lookups_are_classified() {
        let (pages, targets) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &pages, Some(&targets), &ns, 2).unwrap();
        assert_eq!(
            resolver.resolve_row(&modern(1, 99)),
            LinkOutcome::Unresolved(UnresolvedReason::MissingLinkTarget)
        );
        assert_eq!(
            resolver.resolve_row(&modern(1, 13)),
            LinkOutcome::Unresolved(UnresolvedReason::Redlink)
        );
        assert_eq!(resolver.resolve_row(&modern(42, 10)), LinkOutcome::MissingSource);
        assert_eq!(
            resolver.resolve_row(&Err(MalformedRow::new("bad"))),
            LinkOutcome::Malformed
        );
    }

    #[test]
    fn legacy_rows_resolve_by_title() {
        let (pages, _) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &pages, None, &ns, 2).unwrap();
        assert_eq!(
            resolver.resolve_row(&legacy(1, 0, "B")),
            LinkOutcome::Edge(DirectedEdge::new(1, 2))
        );
        assert_eq!(
            resolver.resolve_row(&legacy(1, 0, "C")),
            LinkOutcome::Edge(DirectedEdge::new(1, 2))
        );
        assert_eq!(
            resolver.resolve_row(&legacy(1, 10, "Infobox")),
            LinkOutcome::SkippedNamespace
        );
        assert_eq!(
            resolver.resolve_row(&legacy(1, 0, "Missing")),
            LinkOutcome::Unresolved(UnresolvedReason::Redlink)
        );
        // A modern record cannot be joined under the legacy layout
        assert_eq!(resolver.resolve_row(&modern(1, 10)), LinkOutcome::Malformed);
    }

    #[test]
    fn broken_redirect_targets_are_unresolved() {
        let pages = PageDirectory::build(
            vec![
                page(1, 0, "A", false),
                page(2, 0, "Loop_a", true),
                page(3, 0, "Loop_b", true),
            ],
            vec![redirect(2, 0, "Loop_b"), redirect(3, 0, "Loop_a")],
        );
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Legacy, &pages, None, &ns, 5).unwrap();
        assert_eq!(
            resolver.resolve_row(&legacy(1, 0, "Loop_a")),
            LinkOutcome::Unresolved(UnresolvedReason::Redirect(RedirectFailure::Cycle))
        );
    }

    #[test]
    fn modern_schema_requires_link_targets() {
        let (pages, _) = fixture();
        let ns = NamespaceSet::articles();
        let err = LinkResolver::new(Schema::Modern, &pages, None, &ns, 2).err().unwrap();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn parallel_run_matches_sequential_counts() {
        let (pages, targets) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &pages, Some(&targets), &ns, 2).unwrap();

        let mut rows = Vec::new();
        for _ in 0..50 {
            rows.extend([
                modern(1, 10),
                modern(1, 11),
                modern(2, 14),
                modern(1, 12),
                modern(1, 99),
                modern(3, 10),
                Err(MalformedRow::new("bad")),
            ]);
        }
        let mut expected = LinkCounters::new();
        rows.iter()
            .for_each(|row| expected.record(&resolver.resolve_row(row)));

        let temp_dir = TempDir::new().unwrap();
        let spill = SpillSet::create(temp_dir.path(), 3, pages.max_id()).unwrap();
        let source = MemoryLinkSource::chunked(rows, 16);
        let counters = run_resolution(&source, &resolver, &spill, None).unwrap();
        assert_eq!(counters, expected);

        let mut edges = Vec::new();
        let unique = spill.reduce(&mut edges).unwrap();
        assert_eq!(unique, 2);
        assert_eq!(edges, vec![DirectedEdge::new(1, 2), DirectedEdge::new(2, 1)]);
    }

    #[test]
    fn limit_truncates_the_stream() {
        let (pages, targets) = fixture();
        let ns = NamespaceSet::articles();
        let resolver = LinkResolver::new(Schema::Modern, &pages, Some(&targets), &ns, 2).unwrap();
        let rows: Vec<_> = (0..40).map(|_| modern(1, 10)).collect();
        let source = MemoryLinkSource::chunked(rows, 7);

        let temp_dir = TempDir::new().unwrap();
        let spill = SpillSet::create(temp_dir.path(), 2, pages.max_id()).unwrap();
        let counters = run_resolution(&source, &resolver, &spill, Some(9)).unwrap();
        assert_eq!(counters.processed, 9);
    }
}
