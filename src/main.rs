use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use linkgraph::config::{
    self, ExpectedRanges, GateThresholds, NamespaceSet, NodeSource, PipelineConfig, Schema,
};
use linkgraph::error::PipelineError;
use linkgraph::export::{verify_artifacts, ArtifactNames};
use linkgraph::pipeline::{self, PipelineInputs};
use linkgraph::report::{self, FailedRun};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Overrides `-v` when set, e.g. `LINKGRAPH_LOG=linkgraph=debug`
const LOG_ENV: &str = "LINKGRAPH_LOG";

#[derive(Parser)]
#[command(name = "linkgraph")]
#[command(about = "Resolve Wikipedia SQL dumps into a deduplicated link graph")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve pagelinks into nodes.csv and edges.csv
    ResolveLinks(ResolveArgs),
    /// Run only the pre-flight gate and print its report
    Preflight(PreflightArgs),
    /// Re-check committed nodes.csv and edges.csv
    VerifyCsvs(VerifyArgs),
}

#[derive(Args)]
struct InputArgs {
    /// page table dump (.sql, .sql.gz or .sql.bz2)
    #[arg(long)]
    page: PathBuf,

    /// redirect table dump; without it every redirect page is a dangling redirect
    #[arg(long)]
    redirect: Option<PathBuf>,

    /// linktarget table dump (required for --schema modern)
    #[arg(long)]
    linktarget: Option<PathBuf>,

    /// pagelinks table dump
    #[arg(long)]
    pagelinks: PathBuf,

    /// Pagelinks layout of this dump set
    #[arg(long, value_enum)]
    schema: Schema,

    /// Comma-separated namespaces kept as graph nodes
    #[arg(long, default_value = "0")]
    namespaces: NamespaceSet,

    /// Read only the first N pagelinks rows (smoke run)
    #[arg(long)]
    limit: Option<u64>,

    /// Redirect hops followed before a link is unresolved
    #[arg(long, default_value_t = config::REDIRECT_MAX_HOPS)]
    max_redirect_hops: u32,

    /// Pre-flight Bernoulli sampling rate
    #[arg(long, default_value_t = config::DEFAULT_SAMPLE_RATE)]
    sample_rate: f64,

    /// Seed for every sampling RNG
    #[arg(long, default_value_t = config::DEFAULT_SEED)]
    seed: u64,

    /// Smallest acceptable pre-flight sample (capped at the stream size)
    #[arg(long, default_value_t = config::DEFAULT_MIN_SAMPLE)]
    min_sample: u64,

    /// Pre-flight malformed-row ceiling; also aborts the full pass
    #[arg(long, default_value_t = config::DEFAULT_MAX_MALFORMED_RATE)]
    max_malformed_rate: f64,

    /// Unresolved-link ceiling applied after the full pass
    #[arg(long, default_value_t = config::DEFAULT_MAX_UNRESOLVED_RATE)]
    max_unresolved_rate: f64,

    /// Pre-flight raw success floor
    #[arg(long, default_value_t = config::DEFAULT_MIN_SUCCESS_RATE)]
    min_success_rate: f64,

    /// Pre-flight integrity floor (accepted when the success floor is missed)
    #[arg(long, default_value_t = config::DEFAULT_MIN_INTEGRITY_RATE)]
    min_integrity_rate: f64,

    /// Number of worker threads (defaults to all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Output directory for artifacts and the spill directory
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct ResolveArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Which pages become nodes
    #[arg(long, value_enum, default_value_t = NodeSource::Referenced)]
    nodes: NodeSource,

    /// Independently known edge count to reconcile against
    #[arg(long)]
    expected_edges: Option<u64>,

    /// Independently known node count to reconcile against
    #[arg(long)]
    expected_nodes: Option<u64>,

    /// Relative band around the expected counts
    #[arg(long, default_value_t = config::DEFAULT_TOLERANCE)]
    tolerance: f64,

    /// Fail the run when fewer edges are written
    #[arg(long, default_value_t = 1)]
    min_edges: u64,

    /// Emitted edges re-derived from the raw stream (0 disables)
    #[arg(long, default_value_t = config::DEFAULT_TRACE_SAMPLE)]
    trace_sample: usize,

    /// Source-range spill shards for the dedup reduction
    #[arg(long, default_value_t = config::DEFAULT_SPILL_SHARDS)]
    spill_shards: usize,
}

#[derive(Args)]
struct PreflightArgs {
    #[command(flatten)]
    input: InputArgs,
}

#[derive(Args)]
struct VerifyArgs {
    /// Directory containing committed artifacts
    #[arg(short, long)]
    output: PathBuf,

    /// Namespaces the nodes must belong to
    #[arg(long, default_value = "0")]
    namespaces: NamespaceSet,

    /// Check the *.smoke.csv artifacts instead
    #[arg(long)]
    smoke: bool,
}

impl InputArgs {
    fn inputs(&self) -> PipelineInputs {
        PipelineInputs {
            page: self.page.clone(),
            redirect: self.redirect.clone(),
            linktarget: self.linktarget.clone(),
            pagelinks: self.pagelinks.clone(),
        }
    }

    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.schema, &self.output);
        config.namespaces = self.namespaces.clone();
        config.limit = self.limit;
        config.max_redirect_hops = self.max_redirect_hops;
        config.sample_rate = self.sample_rate;
        config.seed = self.seed;
        config.thresholds = GateThresholds {
            max_malformed_rate: self.max_malformed_rate,
            max_unresolved_rate: self.max_unresolved_rate,
            min_success_rate: self.min_success_rate,
            min_integrity_rate: self.min_integrity_rate,
            min_sample: self.min_sample,
        };
        config
    }

    fn init_threads(&self) -> Result<()> {
        if let Some(threads) = self.threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("linkgraph-worker-{i}"))
                .build_global()
                .context("Failed to configure worker threads")?;
        }
        Ok(())
    }
}

fn run_resolve(args: ResolveArgs) -> Result<()> {
    args.input.init_threads()?;
    let mut config = args.input.config();
    config.node_source = args.nodes;
    config.expected = ExpectedRanges {
        edges: args.expected_edges,
        nodes: args.expected_nodes,
        tolerance: args.tolerance,
        min_edges: args.min_edges,
    };
    config.trace_sample = args.trace_sample;
    config.spill_shards = args.spill_shards.max(1);

    info!(
        schema = %config.schema,
        namespaces = %config.namespaces,
        limit = ?config.limit,
        "Starting link resolution"
    );
    let report = pipeline::run(&config, &args.input.inputs())?;
    report.print_summary();
    Ok(())
}

fn run_preflight(args: PreflightArgs) -> Result<()> {
    args.input.init_threads()?;
    let config = args.input.config();
    let report = pipeline::preflight_only(&config, &args.input.inputs())?;
    report::print_preflight(&report);
    report.to_result()?;
    Ok(())
}

fn run_verify(args: VerifyArgs) -> Result<()> {
    let names = ArtifactNames::for_run(args.smoke);
    let report = verify_artifacts(Path::new(&args.output), &names, &args.namespaces)?;
    println!();
    println!("=== Verify ===");
    println!("Nodes read:         {}", report.nodes);
    println!("Edges read:         {}", report.edges);
    println!("Problems:           {}", report.problem_count);
    for problem in &report.problems {
        println!("  {}", problem);
    }
    report.to_result()?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::ResolveLinks(args) => run_resolve(args),
        Commands::Preflight(args) => run_preflight(args),
        Commands::VerifyCsvs(args) => run_verify(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(failed) = e.downcast_ref::<FailedRun>() {
                failed.print_summary();
            }
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
