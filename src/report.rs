use crate::config::PipelineConfig;
use crate::export::{ArtifactSummary, StagedArtifact};
use crate::index::{LinkTargetStats, PageDirectoryStats};
use crate::stats::LinkCounters;
use crate::validate::{ExportTotals, GateCheck, PostrunReport, PreflightReport, TraceReport};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Timings {
    pub directories_secs: f64,
    pub preflight_secs: f64,
    pub resolution_secs: f64,
    pub export_secs: f64,
    pub postrun_secs: f64,
}

impl Timings {
    pub fn total_secs(&self) -> f64 {
        self.directories_secs
            + self.preflight_secs
            + self.resolution_secs
            + self.export_secs
            + self.postrun_secs
    }
}

pub fn secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Everything a run decided, written next to the artifacts as `run_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub version: &'static str,
    pub smoke: bool,
    pub config: PipelineConfig,
    pub pages: PageDirectoryStats,
    pub link_targets: Option<LinkTargetStats>,
    pub preflight: PreflightReport,
    pub counters: LinkCounters,
    pub totals: ExportTotals,
    pub trace: Option<TraceReport>,
    pub postrun: PostrunReport,
    pub nodes: ArtifactSummary,
    pub edges: ArtifactSummary,
    pub timings: Timings,
}

impl RunReport {
    /// Serializes the report to a staged artifact at `path`; the caller commits it
    /// together with the CSV artifacts.
    pub fn stage(&self, path: &Path) -> Result<StagedArtifact> {
        let artifact = StagedArtifact::new(path);
        let mut writer = artifact.create()?;
        serde_json::to_writer_pretty(&mut writer, self).context("Failed to serialize run report")?;
        writer.write_all(b"\n")?;
        writer.flush().context("Failed to flush run report")?;
        Ok(artifact)
    }

    pub fn print_summary(&self) {
        let c = &self.counters;
        println!();
        println!("=== Summary ===");
        if self.smoke {
            println!("(smoke run, limited to {} rows)", self.config.limit.unwrap_or(0));
        }
        println!("Schema:             {}", self.config.schema);
        println!("Namespaces:         {}", self.config.namespaces);
        println!("Pages loaded:       {}", self.pages.pages);
        if let Some(targets) = &self.link_targets {
            println!("Link targets:       {}", targets.link_targets);
        }
        println!();
        print!("{}", counter_lines(c));
        println!();
        println!(
            "Pre-flight:         {} rows sampled, raw success {:.2}%, adjusted {:.2}%",
            self.preflight.sample_size,
            self.preflight.raw_success_rate * 100.0,
            self.preflight.adjusted_success_rate * 100.0
        );
        if let Some(trace) = &self.trace {
            println!(
                "Traceability:       {}/{} sampled edges re-derived",
                trace.traced, trace.sampled
            );
        }
        println!("Nodes written:      {}", self.nodes.rows);
        println!("Edges written:      {}", self.edges.rows);
        println!();
        println!("Total time:         {:.2}s", self.timings.total_secs());
    }
}

fn counter_lines(c: &LinkCounters) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Rows processed:     {}", c.processed);
    let _ = writeln!(out, "Edges emitted:      {}", c.edges_emitted);
    let _ = writeln!(out, "Duplicates:         {}", c.duplicate);
    let _ = writeln!(out, "Self-loops:         {}", c.self_loops);
    let _ = writeln!(out, "Skipped namespace:  {}", c.skipped_namespace);
    let _ = writeln!(
        out,
        "Unresolved:         {} (redlink {}, missing link target {}, redirect {})",
        c.unresolved, c.redlink, c.missing_link_target, c.redirect_unresolved
    );
    let _ = writeln!(out, "Missing source:     {}", c.missing_source);
    let _ = writeln!(out, "Malformed:          {}", c.malformed);
    out
}

fn check_lines(checks: &[GateCheck]) -> String {
    let mut out = String::new();
    for check in checks {
        let _ = writeln!(
            out,
            "  [{}] {:<22} {}",
            if check.passed { "ok" } else { "FAIL" },
            check.name,
            check.detail
        );
    }
    out
}

/// Stage at which a run stopped without committing artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStage {
    PreFlight,
    /// Aggregate failure rates after the full pass
    Resolution,
    PostRun,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStage::PreFlight => f.write_str("pre-flight"),
            RunStage::Resolution => f.write_str("resolution"),
            RunStage::PostRun => f.write_str("post-run"),
        }
    }
}

/// Counters and gate verdicts of a failed run, attached to the run's error as context.
#[derive(Debug, Clone, Serialize)]
pub struct FailedRun {
    pub stage: RunStage,
    /// Sample counters when the pre-flight gate failed, full-pass counters otherwise
    pub counters: LinkCounters,
    pub preflight: PreflightReport,
    pub postrun: Option<PostrunReport>,
}

impl FailedRun {
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Run failed ===");
        let _ = writeln!(out, "Stage:              {}", self.stage);
        if self.stage == RunStage::PreFlight {
            let _ = writeln!(
                out,
                "Counted over:       pre-flight sample of {} of {} rows",
                self.preflight.sample_size, self.preflight.total_rows
            );
        }
        out.push_str(&counter_lines(&self.counters));
        let _ = writeln!(out, "Verdict:            FAIL");
        match (&self.stage, &self.postrun) {
            (RunStage::PostRun, Some(postrun)) => out.push_str(&check_lines(&postrun.checks)),
            (RunStage::PreFlight, _) => out.push_str(&check_lines(&self.preflight.checks)),
            _ => {}
        }
        out
    }

    pub fn print_summary(&self) {
        println!();
        print!("{}", self.summary());
    }
}

impl fmt::Display for FailedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run stopped at the {} stage ({} rows processed, {} malformed, {} unresolved)",
            self.stage, self.counters.processed, self.counters.malformed, self.counters.unresolved
        )
    }
}

/// Prints a gate report's checks, one per line.
pub fn print_preflight(report: &PreflightReport) {
    println!();
    println!("=== Pre-flight ===");
    println!(
        "Sampled:            {} of {} rows",
        report.sample_size, report.total_rows
    );
    println!("Raw success rate:   {:.2}%", report.raw_success_rate * 100.0);
    println!(
        "Adjusted success:   {:.2}%",
        report.adjusted_success_rate * 100.0
    );
    println!("Integrity rate:     {:.2}%", report.integrity_rate * 100.0);
    println!("Malformed rate:     {:.2}%", report.malformed_rate * 100.0);
    println!();
    print!("{}", counter_lines(&report.counters));
    println!(
        "Verdict:            {}",
        if report.passed { "PASS" } else { "FAIL" }
    );
    print!("{}", check_lines(&report.checks));
}
