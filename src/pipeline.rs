//! End-to-end run: open and bind the input tables, build the directories, pass the
//! pre-flight gate, resolve, reduce, export, pass the post-run gate, commit.

use crate::config::{PipelineConfig, Schema};
use crate::error::PipelineError;
use crate::export::{commit_all, write_nodes, ArtifactNames, EdgeExporter};
use crate::index::{LinkTargetDirectory, PageDirectory};
use crate::merge::SpillSet;
use crate::report::{secs, FailedRun, RunReport, RunStage, Timings};
use crate::resolve::{run_resolution, LinkResolver, LinkRowSource};
use crate::tables::{
    load_link_targets, load_page_directory, DumpLinkSource, LinkTargetTable, PageTable,
    RedirectTable,
};
use crate::validate::{
    check_failure_rates, draw_preflight_sample, trace_edges, PostrunReport, PreflightReport,
};
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Dump files for one run.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub page: PathBuf,
    pub redirect: Option<PathBuf>,
    /// Required for the modern schema, ignored for the legacy one
    pub linktarget: Option<PathBuf>,
    pub pagelinks: PathBuf,
}

/// Input tables with their columns bound. Opening never reads past the headers.
pub struct OpenedInputs {
    pages: PageTable,
    redirects: Option<RedirectTable>,
    link_targets: Option<LinkTargetTable>,
    links: DumpLinkSource,
}

impl OpenedInputs {
    /// Binds every table against `schema` so a shape mismatch fails before any work.
    pub fn open(schema: Schema, inputs: &PipelineInputs) -> Result<Self> {
        let link_targets = match (schema, &inputs.linktarget) {
            (Schema::Modern, Some(path)) => Some(LinkTargetTable::open(path)?),
            (Schema::Modern, None) => {
                return Err(PipelineError::schema(
                    "linktarget",
                    "the modern pagelinks layout needs --linktarget",
                )
                .into())
            }
            (Schema::Legacy, Some(path)) => {
                warn!(path = ?path, "Ignoring linktarget dump under the legacy schema");
                None
            }
            (Schema::Legacy, None) => None,
        };
        let links = DumpLinkSource::open(&inputs.pagelinks, schema)?;
        let pages = PageTable::open(&inputs.page)?;
        let redirects = inputs
            .redirect
            .as_deref()
            .map(RedirectTable::open)
            .transpose()?;
        Ok(Self {
            pages,
            redirects,
            link_targets,
            links,
        })
    }

    pub fn links(&self) -> &DumpLinkSource {
        &self.links
    }

    pub fn load_directories(&self) -> Result<Directories> {
        let pages = load_page_directory(&self.pages, self.redirects.as_ref())?;
        let link_targets = self
            .link_targets
            .as_ref()
            .map(|table| load_link_targets(table, &pages))
            .transpose()?;
        Ok(Directories {
            pages,
            link_targets,
        })
    }
}

/// Directories built once per run and shared read-only by every worker.
pub struct Directories {
    pub pages: PageDirectory,
    pub link_targets: Option<LinkTargetDirectory>,
}

/// Runs the whole pipeline over dump files.
pub fn run(config: &PipelineConfig, inputs: &PipelineInputs) -> Result<RunReport> {
    let opened = OpenedInputs::open(config.schema, inputs)?;

    let start = Instant::now();
    let directories = opened.load_directories()?;
    let directories_secs = secs(start.elapsed());

    let mut report = run_with_source(
        config,
        &directories.pages,
        directories.link_targets.as_ref(),
        opened.links(),
    )?;
    report.timings.directories_secs = directories_secs;
    Ok(report)
}

/// Builds the directories and evaluates the pre-flight gate only. Writes nothing.
pub fn preflight_only(config: &PipelineConfig, inputs: &PipelineInputs) -> Result<PreflightReport> {
    let opened = OpenedInputs::open(config.schema, inputs)?;
    let directories = opened.load_directories()?;
    let resolver = LinkResolver::new(
        config.schema,
        &directories.pages,
        directories.link_targets.as_ref(),
        &config.namespaces,
        config.max_redirect_hops,
    )?;
    preflight(config, &resolver, opened.links())
}

fn preflight<S: LinkRowSource>(
    config: &PipelineConfig,
    resolver: &LinkResolver<'_>,
    source: &S,
) -> Result<PreflightReport> {
    let sample = draw_preflight_sample(
        source,
        resolver,
        config.sample_rate,
        config.thresholds.min_sample,
        config.seed,
        config.limit,
    )?;
    let report = PreflightReport::evaluate(&sample, &config.thresholds);
    info!(
        sample = report.sample_size,
        raw_success_rate = report.raw_success_rate,
        adjusted_success_rate = report.adjusted_success_rate,
        malformed_rate = report.malformed_rate,
        ks_statistic = report.bias.statistic,
        passed = report.passed,
        "Pre-flight evaluated"
    );
    Ok(report)
}

/// Attaches the counters and verdicts of a failed run to its error.
fn stopped(error: PipelineError, failed: FailedRun) -> anyhow::Error {
    let c = &failed.counters;
    warn!(
        stage = %failed.stage,
        processed = c.processed,
        edges = c.edges_emitted,
        skipped_namespace = c.skipped_namespace,
        unresolved = c.unresolved,
        malformed = c.malformed,
        duplicate = c.duplicate,
        "Run stopped; artifacts discarded"
    );
    anyhow::Error::new(error).context(failed)
}

/// Runs everything after the directories are built, over any link-row source.
///
/// Artifacts are only renamed into place once both gates have passed. On any error the
/// staged files and the spill directory are removed and earlier artifacts stay untouched.
/// A gate failure or threshold breach carries a [`FailedRun`] as error context.
pub fn run_with_source<S: LinkRowSource>(
    config: &PipelineConfig,
    pages: &PageDirectory,
    link_targets: Option<&LinkTargetDirectory>,
    source: &S,
) -> Result<RunReport> {
    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("Failed to create output directory: {:?}", config.output_dir)
    })?;
    let mut timings = Timings::default();
    let resolver = LinkResolver::new(
        config.schema,
        pages,
        link_targets,
        &config.namespaces,
        config.max_redirect_hops,
    )?;

    let start = Instant::now();
    let preflight_report = preflight(config, &resolver, source)?;
    timings.preflight_secs = secs(start.elapsed());
    if let Err(e) = preflight_report.to_result() {
        let failed = FailedRun {
            stage: RunStage::PreFlight,
            counters: preflight_report.counters,
            preflight: preflight_report,
            postrun: None,
        };
        return Err(stopped(e, failed));
    }

    let start = Instant::now();
    let spill = SpillSet::create(&config.output_dir, config.spill_shards, pages.max_id())?;
    let mut counters = run_resolution(source, &resolver, &spill, config.limit)?;
    if let Err(e) = check_failure_rates(&counters, &config.thresholds) {
        let failed = FailedRun {
            stage: RunStage::Resolution,
            counters,
            preflight: preflight_report,
            postrun: None,
        };
        return Err(stopped(e, failed));
    }
    timings.resolution_secs = secs(start.elapsed());

    let start = Instant::now();
    let names = ArtifactNames::for_run(config.is_smoke_run());
    let mut exporter = EdgeExporter::create(
        config.output_dir.join(names.edges),
        pages,
        &config.namespaces,
        config.trace_sample,
        config.seed,
    )?;
    let unique = spill.reduce(&mut exporter)?;
    counters.apply_dedup(unique);
    let edges = exporter.finish()?;
    let (nodes_artifact, nodes, node_violations) = write_nodes(
        config.output_dir.join(names.nodes),
        pages,
        &config.namespaces,
        config.node_source,
        &edges,
    )?;
    let totals = edges.totals(nodes.rows, node_violations);
    timings.export_secs = secs(start.elapsed());

    let start = Instant::now();
    let trace = if edges.sample.is_empty() {
        None
    } else {
        Some(trace_edges(source, &resolver, &edges.sample, config.limit)?)
    };
    let postrun = PostrunReport::evaluate(&counters, &totals, &config.expected, trace.as_ref());
    timings.postrun_secs = secs(start.elapsed());
    if let Err(e) = postrun.to_result() {
        let failed = FailedRun {
            stage: RunStage::PostRun,
            counters,
            preflight: preflight_report,
            postrun: Some(postrun),
        };
        return Err(stopped(e, failed));
    }

    let report = RunReport {
        version: env!("CARGO_PKG_VERSION"),
        smoke: config.is_smoke_run(),
        config: config.clone(),
        pages: pages.stats().clone(),
        link_targets: link_targets.map(|targets| targets.stats().clone()),
        preflight: preflight_report,
        counters,
        totals,
        trace,
        postrun,
        nodes,
        edges: edges.summary.clone(),
        timings,
    };
    let report_artifact = report.stage(&config.output_dir.join(names.report))?;

    commit_all(vec![nodes_artifact, edges.artifact, report_artifact])?;
    info!(
        nodes = report.nodes.rows,
        edges = report.edges.rows,
        dir = ?config.output_dir,
        "Artifacts committed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceSet;
    use crate::error::{MalformedRow, RowResult};
    use crate::index::tests::{page, redirect};
    use crate::models::{LinkTargetRow, RawLinkRecord};
    use crate::resolve::tests::modern;
    use crate::resolve::MemoryLinkSource;
    use tempfile::TempDir;

    fn target(id: u64, namespace: i32, title: &str) -> RowResult<LinkTargetRow> {
        Ok(LinkTargetRow {
            id,
            namespace,
            title: title.to_string(),
        })
    }

    fn config(dir: &TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::new(Schema::Modern, dir.path());
        config.sample_rate = 1.0;
        config.expected.min_edges = 0;
        config
    }

    fn directories() -> (PageDirectory, LinkTargetDirectory) {
        let pages = PageDirectory::build(
            vec![
                page(1, 0, "A", false),
                page(2, 0, "B", false),
                page(3, 0, "C", true),
                page(4, 10, "Navbox", false),
            ],
            vec![redirect(3, 0, "B")],
        );
        let targets = LinkTargetDirectory::build(
            vec![
                target(10, 0, "B"),
                target(11, 0, "C"),
                target(12, 10, "Navbox"),
                target(13, 0, "A"),
            ],
            &pages,
        );
        (pages, targets)
    }

    fn read(dir: &TempDir, name: &str) -> String {
        fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn run_commits_sorted_unique_artifacts() {
        let dir = TempDir::new().unwrap();
        let (pages, targets) = directories();
        let source = MemoryLinkSource::chunked(
            vec![
                modern(2, 13),
                modern(1, 10),
                modern(1, 11),
                modern(1, 12),
                modern(1, 99),
            ],
            2,
        );
        let report = run_with_source(&config(&dir), &pages, Some(&targets), &source).unwrap();

        assert_eq!(read(&dir, "edges.csv"), ":START_ID,:END_ID\n1,2\n2,1\n");
        assert_eq!(read(&dir, "nodes.csv"), "id:ID,title,namespace:int\n1,A,0\n2,B,0\n");
        assert!(dir.path().join("run_report.json").exists());
        assert_eq!(report.counters.processed, 5);
        assert_eq!(report.counters.edges_emitted, 2);
        assert_eq!(report.counters.duplicate, 1);
        assert_eq!(report.counters.skipped_namespace, 1);
        assert_eq!(report.counters.unresolved, 1);
        assert!(report.postrun.passed);

        // Only the artifacts remain; temp files and spill are gone
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["edges.csv", "nodes.csv", "run_report.json"]);
    }

    #[test]
    fn failed_gate_leaves_no_artifacts() {
        let dir = TempDir::new().unwrap();
        let (pages, targets) = directories();
        let rows: Vec<RowResult<RawLinkRecord>> = (0..100)
            .map(|i| {
                if i % 20 == 0 {
                    modern(1, 10)
                } else {
                    Err(MalformedRow::new("garbage"))
                }
            })
            .collect();
        let source = MemoryLinkSource::chunked(rows, 10);

        let err = run_with_source(&config(&dir), &pages, Some(&targets), &source).unwrap_err();
        let pipeline = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(pipeline.exit_code(), 4);
        let failed = err.downcast_ref::<FailedRun>().unwrap();
        assert_eq!(failed.stage, RunStage::PreFlight);
        assert_eq!(failed.counters.processed, 100);
        assert_eq!(failed.counters.malformed, 95);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unresolved_breach_reports_full_pass_counters() {
        let dir = TempDir::new().unwrap();
        let (pages, targets) = directories();
        let rows = (0..20)
            .map(|i| if i == 0 { modern(1, 10) } else { modern(1, 99) })
            .collect();
        let source = MemoryLinkSource::chunked(rows, 4);
        let mut config = config(&dir);
        config.thresholds.min_success_rate = 0.0;

        let err = run_with_source(&config, &pages, Some(&targets), &source).unwrap_err();
        assert_eq!(err.downcast_ref::<PipelineError>().unwrap().exit_code(), 3);
        let failed = err.downcast_ref::<FailedRun>().unwrap();
        assert_eq!(failed.stage, RunStage::Resolution);
        assert_eq!(failed.counters.processed, 20);
        assert_eq!(failed.counters.unresolved, 19);
        assert_eq!(failed.counters.edges_emitted, 1);
        assert!(failed.preflight.passed);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn min_edges_floor_blocks_commit() {
        let dir = TempDir::new().unwrap();
        let (pages, targets) = directories();
        let source = MemoryLinkSource::chunked(vec![modern(1, 10)], 1);
        let mut config = config(&dir);
        config.expected.min_edges = 5;

        let err = run_with_source(&config, &pages, Some(&targets), &source).unwrap_err();
        assert!(format!("{:#}", err).contains("min_edges"));
        let failed = err.downcast_ref::<FailedRun>().unwrap();
        assert_eq!(failed.stage, RunStage::PostRun);
        assert_eq!(failed.counters.edges_emitted, 1);
        assert!(!dir.path().join("edges.csv").exists());
        assert!(!dir.path().join("edges.csv.tmp").exists());
    }

    #[test]
    fn smoke_run_uses_distinct_names() {
        let dir = TempDir::new().unwrap();
        let (pages, targets) = directories();
        let source = MemoryLinkSource::chunked((0..10).map(|_| modern(1, 10)).collect(), 3);
        let mut config = config(&dir);
        config.limit = Some(4);

        let report = run_with_source(&config, &pages, Some(&targets), &source).unwrap();
        assert!(report.smoke);
        assert_eq!(report.counters.processed, 4);
        assert!(dir.path().join("edges.smoke.csv").exists());
        assert!(dir.path().join("run_report.smoke.json").exists());
        assert!(!dir.path().join("edges.csv").exists());
    }

    #[test]
    fn all_pages_mode_exports_isolated_articles() {
        let dir = TempDir::new().unwrap();
        let pages = PageDirectory::build(
            vec![
                page(1, 0, "A", false),
                page(2, 0, "B", false),
                page(5, 0, "Lonely", false),
            ],
            vec![],
        );
        let targets = LinkTargetDirectory::build(vec![target(10, 0, "B")], &pages);
        let source = MemoryLinkSource::chunked(vec![modern(1, 10)], 1);
        let mut config = config(&dir);
        config.node_source = crate::config::NodeSource::AllPages;
        config.namespaces = NamespaceSet::articles();

        run_with_source(&config, &pages, Some(&targets), &source).unwrap();
        assert_eq!(
            read(&dir, "nodes.csv"),
            "id:ID,title,namespace:int\n1,A,0\n2,B,0\n5,Lonely,0\n"
        );
    }
}
