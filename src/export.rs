//! `nodes.csv` / `edges.csv` writers in the neo4j-admin import layout, plus a verifier that
//! re-reads committed artifacts.
//!
//! Every artifact is written to a temporary sibling and only renamed into place by
//! [`StagedArtifact::commit`]. Dropping an uncommitted artifact deletes its temporary file,
//! so a failed run leaves no partial output behind. [`commit_all`] renames a run's
//! artifacts as a set and rolls them back if any rename fails.

use crate::config::{NamespaceSet, NodeSource, WRITE_BUFFER_SIZE};
use crate::error::{GateCheckpoint, PipelineError};
use crate::index::PageDirectory;
use crate::merge::EdgeSink;
use crate::models::DirectedEdge;
use crate::validate::{ExportTotals, Reservoir};
use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, StringRecord, Writer, WriterBuilder};
use indicatif::ProgressBar;
use rustc_hash::{FxHashMap, FxHasher};
use serde::Serialize;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const NODE_HEADER: [&str; 3] = ["id:ID", "title", "namespace:int"];
pub const EDGE_HEADER: [&str; 2] = [":START_ID", ":END_ID"];

/// Problems listed verbatim in a verification report; the rest are only counted.
const MAX_LISTED_PROBLEMS: usize = 20;

/// File names for one run's artifacts. Limited runs use distinct names so a smoke test
/// can never be mistaken for a full export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactNames {
    pub nodes: &'static str,
    pub edges: &'static str,
    pub report: &'static str,
}

impl ArtifactNames {
    pub fn for_run(smoke: bool) -> Self {
        if smoke {
            Self {
                nodes: "nodes.smoke.csv",
                edges: "edges.smoke.csv",
                report: "run_report.smoke.json",
            }
        } else {
            Self {
                nodes: "nodes.csv",
                edges: "edges.csv",
                report: "run_report.json",
            }
        }
    }
}

/// A file written under a temporary name and renamed into place on commit.
#[derive(Debug)]
pub struct StagedArtifact {
    path: PathBuf,
    tmp_path: PathBuf,
    committed: bool,
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

impl StagedArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tmp_path = sibling(&path, ".tmp");
        Self {
            path,
            tmp_path,
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn create(&self) -> Result<BufWriter<File>> {
        let file = File::create(&self.tmp_path)
            .with_context(|| format!("Failed to create temp artifact: {:?}", self.tmp_path))?;
        Ok(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file))
    }

    pub fn commit(mut self) -> Result<PathBuf> {
        fs::rename(&self.tmp_path, &self.path).with_context(|| {
            format!("Failed to rename temp artifact to: {:?}", self.path)
        })?;
        self.committed = true;
        debug!(path = ?self.path, "Artifact committed");
        Ok(self.path.clone())
    }
}

/// Commits `artifacts` in order. Existing files at the final paths are first moved
/// aside to `<name>.prev`; if any rename fails, the artifacts already renamed are removed,
/// the previous files are restored and the error is returned.
pub fn commit_all(artifacts: Vec<StagedArtifact>) -> Result<Vec<PathBuf>> {
    let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
    for artifact in &artifacts {
        if !artifact.path.exists() {
            continue;
        }
        let backup = sibling(&artifact.path, ".prev");
        if let Err(e) = fs::rename(&artifact.path, &backup) {
            restore(&backups);
            return Err(e).with_context(|| {
                format!("Failed to move previous artifact aside: {:?}", artifact.path)
            });
        }
        backups.push((backup, artifact.path.clone()));
    }

    let mut committed = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        match artifact.commit() {
            Ok(path) => committed.push(path),
            Err(e) => {
                for path in &committed {
                    if let Err(e) = fs::remove_file(path) {
                        warn!(path = ?path, error = %e, "Failed to roll back artifact");
                    }
                }
                restore(&backups);
                return Err(e);
            }
        }
    }

    for (backup, _) in &backups {
        if let Err(e) = fs::remove_file(backup) {
            warn!(path = ?backup, error = %e, "Failed to remove previous artifact");
        }
    }
    Ok(committed)
}

fn restore(backups: &[(PathBuf, PathBuf)]) {
    for (backup, path) in backups {
        if let Err(e) = fs::rename(backup, path) {
            warn!(path = ?path, error = %e, "Failed to restore previous artifact");
        }
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!(path = ?self.tmp_path, error = %e, "Failed to discard temp artifact");
            }
        }
    }
}

/// Content fingerprint over the rows of an artifact, independent of CSV quoting.
#[derive(Default)]
struct Fingerprint(FxHasher);

impl Fingerprint {
    fn node(&mut self, id: u32, title: &str, namespace: i32) {
        self.0.write_u32(id);
        self.0.write(title.as_bytes());
        self.0.write_u8(0xff);
        self.0.write_i32(namespace);
    }

    fn edge(&mut self, edge: DirectedEdge) {
        self.0.write_u32(edge.source);
        self.0.write_u32(edge.target);
    }

    fn finish(mut self, rows: u64) -> String {
        self.0.write_u64(rows);
        format!("{:016x}", self.0.finish())
    }
}

fn csv_writer(inner: BufWriter<File>) -> Writer<BufWriter<File>> {
    WriterBuilder::new().has_headers(false).from_writer(inner)
}

/// Set bits mark page-directory slots that appear as an edge endpoint.
struct SlotSet(Vec<u64>);

impl SlotSet {
    fn new(len: usize) -> Self {
        Self(vec![0; len.div_ceil(64)])
    }

    fn insert(&mut self, slot: usize) {
        self.0[slot / 64] |= 1 << (slot % 64);
    }

    fn contains(&self, slot: usize) -> bool {
        self.0[slot / 64] & (1 << (slot % 64)) != 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub fingerprint: String,
}

/// Streams the reduced edge list into `edges.csv`, tracking which nodes are referenced
/// and keeping a reservoir sample of written edges for traceability.
pub struct EdgeExporter<'a> {
    artifact: StagedArtifact,
    writer: Writer<BufWriter<File>>,
    pages: &'a PageDirectory,
    namespaces: &'a NamespaceSet,
    referenced: SlotSet,
    sample: Reservoir<DirectedEdge>,
    fingerprint: Fingerprint,
    last: Option<DirectedEdge>,
    edges_written: u64,
    namespace_violations: u64,
    dangling_endpoints: u64,
    buf_source: itoa::Buffer,
    buf_target: itoa::Buffer,
}

impl<'a> EdgeExporter<'a> {
    pub fn create(
        path: impl Into<PathBuf>,
        pages: &'a PageDirectory,
        namespaces: &'a NamespaceSet,
        trace_sample: usize,
        seed: u64,
    ) -> Result<Self> {
        let artifact = StagedArtifact::new(path);
        let mut writer = csv_writer(artifact.create()?);
        writer
            .write_record(EDGE_HEADER)
            .context("Failed to write edges header")?;
        Ok(Self {
            artifact,
            writer,
            pages,
            namespaces,
            referenced: SlotSet::new(pages.len()),
            sample: Reservoir::new(trace_sample, seed),
            fingerprint: Fingerprint::default(),
            last: None,
            edges_written: 0,
            namespace_violations: 0,
            dangling_endpoints: 0,
            buf_source: itoa::Buffer::new(),
            buf_target: itoa::Buffer::new(),
        })
    }

    fn mark_endpoint(&mut self, id: u32) {
        match self.pages.slot_of(id) {
            Some(slot) => {
                let page = &self.pages.records()[slot];
                if !self.namespaces.contains(page.namespace) || page.is_redirect {
                    self.namespace_violations += 1;
                }
                self.referenced.insert(slot);
            }
            None => self.dangling_endpoints += 1,
        }
    }

    /// Flushes `edges.csv` to its temporary path. Returns the staged artifact, its summary,
    /// the referenced-node set and the traceability sample.
    pub fn finish(mut self) -> Result<FinishedEdges> {
        self.writer.flush().context("Failed to flush edges.csv")?;
        info!(edges = self.edges_written, "Edges written");
        Ok(FinishedEdges {
            summary: ArtifactSummary {
                path: self.artifact.path().to_path_buf(),
                rows: self.edges_written,
                fingerprint: self.fingerprint.finish(self.edges_written),
            },
            artifact: self.artifact,
            referenced: self.referenced,
            sample: self.sample.into_items(),
            namespace_violations: self.namespace_violations,
            dangling_endpoints: self.dangling_endpoints,
        })
    }
}

impl EdgeSink for EdgeExporter<'_> {
    fn accept(&mut self, edge: DirectedEdge) -> Result<()> {
        if let Some(last) = self.last {
            if edge <= last {
                return Err(anyhow!(
                    "edge stream out of order: {:?} after {:?}",
                    edge,
                    last
                ));
            }
        }
        self.last = Some(edge);
        self.mark_endpoint(edge.source);
        self.mark_endpoint(edge.target);

        self.writer
            .write_record([
                self.buf_source.format(edge.source),
                self.buf_target.format(edge.target),
            ])
            .context("Failed to write edge row")?;
        self.fingerprint.edge(edge);
        self.sample.offer(edge);
        self.edges_written += 1;
        Ok(())
    }
}

pub struct FinishedEdges {
    pub artifact: StagedArtifact,
    pub summary: ArtifactSummary,
    referenced: SlotSet,
    pub sample: Vec<DirectedEdge>,
    pub namespace_violations: u64,
    pub dangling_endpoints: u64,
}

/// Writes `nodes.csv` in ascending id order.
///
/// `Referenced` emits exactly the endpoints of written edges. `AllPages` emits every
/// non-redirect page in the namespace set, so isolated articles appear too.
pub fn write_nodes(
    path: impl Into<PathBuf>,
    pages: &PageDirectory,
    namespaces: &NamespaceSet,
    source: NodeSource,
    edges: &FinishedEdges,
) -> Result<(StagedArtifact, ArtifactSummary, u64)> {
    let artifact = StagedArtifact::new(path);
    let mut writer = csv_writer(artifact.create()?);
    writer
        .write_record(NODE_HEADER)
        .context("Failed to write nodes header")?;

    let pb = ProgressBar::new(pages.len() as u64);
    let mut fingerprint = Fingerprint::default();
    let mut id_buf = itoa::Buffer::new();
    let mut ns_buf = itoa::Buffer::new();
    let mut written = 0u64;
    let mut violations = 0u64;

    for (slot, page) in pages.records().iter().enumerate() {
        let include = match source {
            NodeSource::Referenced => edges.referenced.contains(slot),
            NodeSource::AllPages => {
                edges.referenced.contains(slot)
                    || (!page.is_redirect && namespaces.contains(page.namespace))
            }
        };
        if !include {
            continue;
        }
        if !namespaces.contains(page.namespace) {
            violations += 1;
        }
        writer
            .write_record([
                id_buf.format(page.id),
                &*page.title,
                ns_buf.format(page.namespace),
            ])
            .context("Failed to write node row")?;
        fingerprint.node(page.id, &page.title, page.namespace);
        written += 1;
        if written % 100_000 == 0 {
            pb.set_position(slot as u64);
        }
    }
    pb.finish_and_clear();
    writer.flush().context("Failed to flush nodes.csv")?;
    info!(nodes = written, source = ?source, "Nodes written");

    let summary = ArtifactSummary {
        path: artifact.path().to_path_buf(),
        rows: written,
        fingerprint: fingerprint.finish(written),
    };
    Ok((artifact, summary, violations))
}

impl FinishedEdges {
    /// Totals for the post-run gate, given the node count and node-level violations.
    pub fn totals(&self, nodes_written: u64, node_violations: u64) -> ExportTotals {
        ExportTotals {
            nodes_written,
            edges_written: self.summary.rows,
            namespace_violations: self.namespace_violations + node_violations,
            dangling_endpoints: self.dangling_endpoints,
        }
    }
}

// ---------------------------------------------------------------------------
// Verification of committed artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub nodes: u64,
    pub edges: u64,
    pub problem_count: u64,
    pub problems: Vec<String>,
}

impl VerifyReport {
    fn problem(&mut self, message: String) {
        self.problem_count += 1;
        if self.problems.len() < MAX_LISTED_PROBLEMS {
            self.problems.push(message);
        }
    }

    pub fn passed(&self) -> bool {
        self.problem_count == 0
    }

    pub fn to_result(&self) -> Result<(), PipelineError> {
        if self.passed() {
            return Ok(());
        }
        let mut failures = self.problems.clone();
        let unlisted = self.problem_count - self.problems.len() as u64;
        if unlisted > 0 {
            failures.push(format!("and {} more", unlisted));
        }
        Err(PipelineError::GateFailure {
            checkpoint: GateCheckpoint::Artifacts,
            failures,
        })
    }
}

fn open_csv(path: &Path) -> Result<csv::Reader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open artifact: {:?}", path))?;
    Ok(ReaderBuilder::new()
        .has_headers(true)
        .from_reader(BufReader::new(file)))
}

fn check_header(
    reader: &mut csv::Reader<BufReader<File>>,
    expected: &[&str],
    name: &str,
    report: &mut VerifyReport,
) -> Result<()> {
    let header = reader
        .headers()
        .with_context(|| format!("Failed to read {} header", name))?;
    if header.iter().ne(expected.iter().copied()) {
        report.problem(format!(
            "{} header is {:?}, expected {:?}",
            name,
            header.iter().collect::<Vec<_>>(),
            expected
        ));
    }
    Ok(())
}

/// Re-reads committed `nodes.csv` and `edges.csv` and checks headers, ids, the namespace
/// set, edge ordering and uniqueness, self-loops and endpoint integrity.
pub fn verify_artifacts(
    dir: &Path,
    names: &ArtifactNames,
    namespaces: &NamespaceSet,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let nodes_path = dir.join(names.nodes);
    let edges_path = dir.join(names.edges);

    // id -> namespace
    let mut nodes: FxHashMap<u32, i32> = FxHashMap::default();
    let mut reader = open_csv(&nodes_path)?;
    check_header(&mut reader, &NODE_HEADER, names.nodes, &mut report)?;
    let mut record = StringRecord::new();
    let mut line = 1u64;
    while reader
        .read_record(&mut record)
        .with_context(|| format!("Failed to read {:?}", nodes_path))?
    {
        line += 1;
        let id = record.get(0).and_then(|v| v.parse::<u32>().ok());
        let namespace = record.get(2).and_then(|v| v.parse::<i32>().ok());
        let title_ok = record.get(1).is_some_and(|t| !t.is_empty());
        match (id, namespace) {
            (Some(id), Some(namespace)) => {
                if !namespaces.contains(namespace) {
                    report.problem(format!(
                        "{} line {}: node {} in namespace {} outside {}",
                        names.nodes, line, id, namespace, namespaces
                    ));
                }
                if nodes.insert(id, namespace).is_some() {
                    report.problem(format!(
                        "{} line {}: duplicate node id {}",
                        names.nodes, line, id
                    ));
                }
            }
            _ => report.problem(format!(
                "{} line {}: non-numeric id or namespace",
                names.nodes, line
            )),
        }
        if !title_ok {
            report.problem(format!("{} line {}: empty title", names.nodes, line));
        }
    }
    report.nodes = nodes.len() as u64;

    let mut reader = open_csv(&edges_path)?;
    check_header(&mut reader, &EDGE_HEADER, names.edges, &mut report)?;
    let mut last: Option<DirectedEdge> = None;
    line = 1;
    while reader
        .read_record(&mut record)
        .with_context(|| format!("Failed to read {:?}", edges_path))?
    {
        line += 1;
        report.edges += 1;
        let source = record.get(0).and_then(|v| v.parse::<u32>().ok());
        let target = record.get(1).and_then(|v| v.parse::<u32>().ok());
        let (Some(source), Some(target)) = (source, target) else {
            report.problem(format!("{} line {}: non-numeric endpoint", names.edges, line));
            continue;
        };
        let edge = DirectedEdge::new(source, target);
        if edge.is_self_loop() {
            report.problem(format!("{} line {}: self-loop on {}", names.edges, line, source));
        }
        if let Some(prev) = last {
            if edge <= prev {
                report.problem(format!(
                    "{} line {}: ({}, {}) is a duplicate or out of order",
                    names.edges, line, source, target
                ));
            }
        }
        last = Some(edge);
        for endpoint in [source, target] {
            if !nodes.contains_key(&endpoint) {
                report.problem(format!(
                    "{} line {}: endpoint {} has no node",
                    names.edges, line, endpoint
                ));
            }
        }
    }

    info!(
        nodes = report.nodes,
        edges = report.edges,
        problems = report.problem_count,
        "Artifacts verified"
    );
    Ok(report)
}
