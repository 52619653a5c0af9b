//! TrafficGov - client-side traffic governor
//!
//! CLI entry point for inspecting configuration, checking the admission
//! controller and running synthetic workloads.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use trafficgov::admission::AdmissionController;
use trafficgov::cli::{Cli, Command, ConfigFormat, OutputFormat, get_log_path};
use trafficgov::config::Config;
use trafficgov::domain::Priority;
use trafficgov::simulate::{self, SimulationOptions, SimulationReport};

fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trafficgov")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - append to log file, not stdout/stderr
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("trafficgov.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        "TrafficGov loaded config: max-requests={}, window-ms={}, max-concurrent={}",
        config.admission.max_requests, config.admission.window_ms, config.scheduler.max_concurrent_requests
    );

    match cli.command {
        Some(Command::Simulate {
            requests,
            failure_rate,
            format,
        }) => cmd_simulate(&config, requests, failure_rate, format).await,
        Some(Command::Config { format }) => cmd_config(&config, format),
        Some(Command::Check { count, category }) => cmd_check(&config, count, category.as_deref()),
        Some(Command::Logs { lines }) => cmd_logs(lines),
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Run a synthetic workload and print the final statistics
async fn cmd_simulate(config: &Config, requests: usize, failure_rate: f64, format: OutputFormat) -> Result<()> {
    let options = SimulationOptions { requests, failure_rate };
    let report = simulate::run(config, &options).await.context("Simulation failed")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let stats = &report.stats;
    let admission = &stats.admission;

    println!("TrafficGov Simulation");
    println!("---------------------");
    println!("Submitted: {} in {}ms", report.submitted, report.elapsed_ms);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Failed:    {}", report.failed);
    println!("  Rejected:  {}", report.rejected);
    println!();
    println!("Scheduler");
    println!("  Attempts:        {}", stats.total_attempts);
    println!("  Retries:         {}", stats.total_retried);
    println!(
        "  Batches:         {} ({} requests)",
        stats.total_batches, stats.total_batched_requests
    );
    println!("  Avg execution:   {:.1}ms", stats.average_execution_ms);
    println!("  Throughput:      {:.2}/s", stats.throughput_per_sec);
    println!("  Success rate:    {:.1}%", stats.success_rate() * 100.0);
    println!("  Current delay:   {}ms", stats.current_delay_ms);
    let queued: Vec<String> = Priority::DISPATCH_ORDER
        .iter()
        .map(|&p| format!("{} {}", p, stats.queued.get(p)))
        .collect();
    println!("  Queued:          {}", queued.join(", "));
    println!();
    println!("Admission");
    println!(
        "  Checks:          {} ({} allowed, {} blocked)",
        admission.total_requests, admission.allowed_requests, admission.blocked_requests
    );
    println!("  Avg wait:        {:.1}ms", admission.average_wait_time_ms);
    println!(
        "  Circuit:         {} ({} activations)",
        admission.circuit_state, admission.circuit_breaker_activations
    );
    for (category, counts) in &admission.categories {
        println!("  {:<16} {} allowed, {} blocked", category, counts.allowed, counts.blocked);
    }
}

/// Print the effective configuration
fn cmd_config(config: &Config, format: ConfigFormat) -> Result<()> {
    match format {
        ConfigFormat::Yaml => print!("{}", serde_yaml::to_string(config)?),
        ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}

/// Run admission checks back to back against a fresh controller
fn cmd_check(config: &Config, count: usize, category: Option<&str>) -> Result<()> {
    let controller = AdmissionController::new(config.admission.clone());

    for n in 1..=count {
        let decision = controller.check(category);
        let tokens = decision
            .tokens_remaining
            .map(|t| format!(" (tokens: {:.1})", t))
            .unwrap_or_default();
        if decision.allowed {
            println!("#{} allowed{}", n, tokens);
        } else {
            let reason = decision.reason.map(|r| r.to_string()).unwrap_or_default();
            println!(
                "#{} blocked: {}, retry in {}ms{}",
                n,
                reason,
                decision.wait_time.as_millis(),
                tokens
            );
        }
    }

    let stats = controller.stats();
    println!();
    println!(
        "{} allowed, {} blocked ({:.0}% allowed)",
        stats.allowed_requests,
        stats.blocked_requests,
        stats.allow_rate() * 100.0
    );
    Ok(())
}

/// Show the tail of the log file
fn cmd_logs(lines: usize) -> Result<()> {
    let log_path = get_log_path();

    if !log_path.exists() {
        println!("No log file found at: {}", log_path.display());
        return Ok(());
    }

    let file = fs::File::open(&log_path).context("Failed to open log file")?;
    let reader = BufReader::new(file);
    let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

    let start = all_lines.len().saturating_sub(lines);

    for line in &all_lines[start..] {
        println!("{}", line);
    }

    Ok(())
}
