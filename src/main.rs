//! fedstats - federated sufficient-statistics coordinator
//!
//! A CLI tool that submits an analysis to a set of Trusted Research
//! Environments, waits for their sufficient statistics and combines them
//! into one result without moving row-level data.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (submission, polling, storage, config, etc.)
//!   2 - Partial result and --fail-on-partial was set

mod analysis;
mod cache;
mod cli;
mod config;
mod error;
mod models;
mod orchestrator;
mod polling;
mod report;
mod storage;
mod task;

use anyhow::{Context, Result};
use cli::{Args, OutputFormat};
use config::{Config, CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use models::AnalysisOutcome;
use orchestrator::AnalysisOrchestrator;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("fedstats v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_analysis(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            if e
                .downcast_ref::<error::FederationError>()
                .is_some_and(error::FederationError::is_remote)
            {
                eprintln!("   The task may still be running; rerun with --task-id to collect it.");
            }
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .fedstats.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to set the submission layer, database and bucket.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the requested analyses end to end. Returns exit code (0 or 2).
async fn run_analysis(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let requests = args.to_requests()?;
    for request in &requests {
        request.validate()?;
    }

    let orchestrator = AnalysisOrchestrator::from_config(config)?;

    if args.dry_run {
        for request in &requests {
            let message = orchestrator.lifecycle().build_message(request);
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        let tres = requests.first().map(|r| r.tre_list.join(", ")).unwrap_or_default();
        eprintln!("\n🔍 Would submit to: {}", tres);
        if requests.len() > 1 {
            eprintln!("   Later analyses may be answered from earlier statistics and not submitted.");
        }
        eprintln!("\n✅ Dry run complete. Nothing was submitted.");
        return Ok(0);
    }

    let names: Vec<String> = requests.iter().map(|r| r.analysis_type.to_string()).collect();
    let spinner = create_spinner(&args);
    match args.task_id {
        Some(task_id) => {
            spinner.set_message(format!("Collecting results of task {}...", task_id))
        }
        None => spinner.set_message(format!(
            "Running {} on {} TRE(s)...",
            names.join(", "),
            requests.first().map_or(0, |r| r.tre_list.len())
        )),
    }
    let outcomes = orchestrator.run_batch(&requests, args.task_id).await;
    spinner.finish_and_clear();
    let outcomes = outcomes?;

    let runnable: Vec<String> = match requests.first() {
        Some(request) if !orchestrator.cache().is_empty() => orchestrator
            .cache()
            .runnable_analyses(&cache::RequestSignature::for_request(request))
            .iter()
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    };
    debug!("Cached statistics also answer: {}", runnable.join(", "));

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&outcomes)?,
        OutputFormat::Markdown => report::generate_markdown_report(&outcomes),
    };

    match args.output {
        Some(ref path) => {
            std::fs::write(path, &output)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            print_summary(&outcomes, &runnable, start_time.elapsed());
            println!("\n✅ Report saved to: {}", path.display());
        }
        None => println!("{}", output),
    }

    let mut partial = false;
    for warning in outcomes.iter().filter_map(AnalysisOutcome::partial_warning) {
        warn!("{}", warning);
        partial = true;
    }
    if partial && args.fail_on_partial {
        eprintln!("\n⛔ Not every TRE returned a result. Failing (exit code 2).");
        return Ok(2);
    }

    Ok(0)
}

fn create_spinner(args: &Args) -> ProgressBar {
    if args.quiet {
        return ProgressBar::hidden();
    }

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

fn print_summary(outcomes: &[AnalysisOutcome], runnable: &[String], elapsed: Duration) {
    println!("\n📊 Analysis Summary:");
    for outcome in outcomes {
        println!("   {} ({})", outcome.analysis_type, outcome.source);
        println!(
            "      TREs: {} reported, {} missing",
            outcome.tres_used.len(),
            outcome.missing_tres.len()
        );
        if let Some(value) = outcome.value.as_scalar() {
            println!("      Value: {}", value);
        }
    }
    if !runnable.is_empty() {
        println!("   Cached statistics also answer: {}", runnable.join(", "));
    }
    println!("   Duration: {:.1}s", elapsed.as_secs_f64());
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Ok(Config::default())
        }
    }
}
