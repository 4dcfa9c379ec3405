//! Sumi-Conductor main entry point
//!
//! This is the command-line interface for the Sumi-Conductor crawl
//! orchestrator.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sumi_conductor::config::{
    compute_config_hash, load_config_with_hash, read_config, Config, SeedEntry,
};
use sumi_conductor::metrics::{FanoutMetrics, InMemoryMetrics, MetricsSink, TracingMetrics};
use sumi_conductor::output::{collect_statistics, format_report, print_statistics};
use sumi_conductor::{HttpFetcher, Orchestrator, TaskReport};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// How often `--watch` checks the config file for changes
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// How often the run checks whether the frontier has drained
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Sumi-Conductor: a polite crawl orchestrator
///
/// Sumi-Conductor fetches seed URLs while pacing requests per domain,
/// backing off from failing domains and rotating through a proxy pool.
/// One line is printed per finished URL, followed by a statistics summary.
#[derive(Parser, Debug)]
#[command(name = "sumi-conductor")]
#[command(version = "1.0.0")]
#[command(about = "A polite crawl orchestrator", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Extra seed URLs, one per line as `URL [PRIORITY]`
    #[arg(long, value_name = "FILE")]
    seeds: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and seeds, print the plan, and exit
    #[arg(long, conflicts_with = "watch")]
    dry_run: bool,

    /// Keep running and reload the config file when it changes
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let mut seeds = config.seeds.clone();
    if let Some(path) = &cli.seeds {
        let extra = read_seed_file(path)?;
        tracing::info!("Read {} seed(s) from {}", extra.len(), path.display());
        seeds.extend(extra);
    }

    if cli.dry_run {
        handle_dry_run(&config, &seeds);
        return Ok(());
    }

    handle_crawl(config, config_hash, seeds, &cli).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_conductor=info,warn"),
            1 => EnvFilter::new("sumi_conductor=debug,info"),
            2 => EnvFilter::new("sumi_conductor=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Parses a seed file: one `URL [PRIORITY]` per line, `#` starts a comment
fn read_seed_file(path: &Path) -> anyhow::Result<Vec<SeedEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;

    let mut seeds = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let url = fields.next().unwrap_or_default().to_string();
        let priority = match fields.next() {
            Some(raw) => raw.parse().with_context(|| {
                format!("{}:{}: invalid priority '{}'", path.display(), number + 1, raw)
            })?,
            None => 0,
        };
        if fields.next().is_some() {
            bail!("{}:{}: expected `URL [PRIORITY]`", path.display(), number + 1);
        }
        seeds.push(SeedEntry { url, priority });
    }
    Ok(seeds)
}

/// Handles the --dry-run mode: shows what would be crawled and how
fn handle_dry_run(config: &Config, seeds: &[SeedEntry]) {
    println!("=== Sumi-Conductor Dry Run ===\n");

    println!("Scheduler:");
    println!("  Workers: {}", config.scheduler.workers);
    println!("  Idle tick: {}ms", config.scheduler.idle_tick_ms);

    println!("\nRetry:");
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!(
        "  Backoff: {}ms doubling up to {}ms",
        config.retry.base_delay_ms, config.retry.max_delay_ms
    );
    println!("  Max proxy retries: {}", config.retry.max_proxy_retries);

    println!("\nCircuit Breaker:");
    println!(
        "  Opens after {} failure(s) within {}s",
        config.circuit.threshold, config.circuit.window_secs
    );
    println!(
        "  Open for {}ms (up to {}ms)",
        config.circuit.open_duration_ms, config.circuit.max_open_duration_ms
    );

    println!("\nBudgets:");
    println!(
        "  Default: {} req/s, burst {}",
        config.budget.default_rate, config.budget.default_burst
    );
    for rule in &config.domains {
        println!("  - {}: {} req/s, burst {}", rule.pattern, rule.rate, rule.burst);
    }

    println!("\nProxies ({}):", config.proxy.endpoints.len());
    if config.proxy.endpoints.is_empty() {
        println!("  (direct)");
    }
    for endpoint in &config.proxy.endpoints {
        match sumi_conductor::proxy::ProxyAddress::parse(endpoint) {
            Ok(address) => println!("  - {}", address),
            Err(e) => println!("  ! {}", e),
        }
    }

    println!("\nUser Agent: {}", config.user_agent.header_value());

    println!("\nSeeds ({}):", seeds.len());
    for seed in seeds {
        println!("  - [{}] {}", seed.priority, seed.url);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the main crawl operation
async fn handle_crawl(
    config: Config,
    config_hash: String,
    seeds: Vec<SeedEntry>,
    cli: &Cli,
) -> anyhow::Result<()> {
    let metrics = Arc::new(InMemoryMetrics::new());
    let sinks = vec![
        metrics.clone() as Arc<dyn MetricsSink>,
        Arc::new(TracingMetrics) as Arc<dyn MetricsSink>,
    ];
    let fetcher = HttpFetcher::new(config.user_agent.clone(), &config.fetch);
    let orchestrator = Orchestrator::new(
        &config,
        Arc::new(fetcher),
        Arc::new(FanoutMetrics::new(sinks)),
    )
    .context("Failed to start orchestrator")?;

    let quiet = cli.quiet;
    let frontier = orchestrator.frontier().clone();
    orchestrator.on_result(move |report: TaskReport| {
        if !quiet {
            println!("{}", format_report(&report));
        }
        // Terminal records are only kept until reported
        frontier.acknowledge(&report.url);
    });

    let added = orchestrator.submit_seeds(&seeds);
    tracing::info!("Submitted {} seed URL(s)", added);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing in-flight fetches");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    if cli.watch {
        tokio::spawn(watch_config(
            cli.config.clone(),
            config_hash,
            orchestrator.clone(),
        ));
    } else {
        let orchestrator = orchestrator.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDLE_CHECK_INTERVAL).await;
                if orchestrator.frontier().is_idle() {
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        });
    }

    orchestrator.run(shutdown_rx).await;

    let stats = collect_statistics(
        &metrics.snapshot(),
        orchestrator.frontier(),
        orchestrator.scheduler().proxies(),
    );
    if !cli.quiet {
        println!();
        print_statistics(&stats);
    }
    Ok(())
}

/// Polls the config file and applies changes to the running orchestrator
async fn watch_config(path: PathBuf, mut last_hash: String, orchestrator: Orchestrator) {
    let mut interval = tokio::time::interval(WATCH_INTERVAL);
    loop {
        interval.tick().await;

        let hash = match compute_config_hash(&path) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", path.display(), e);
                continue;
            }
        };
        if hash == last_hash {
            continue;
        }
        last_hash = hash;

        tracing::info!("Configuration changed, reloading");
        let config = match read_config(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Ignoring changed configuration: {}", e);
                continue;
            }
        };
        if orchestrator.reload(&config).is_ok() {
            let added = orchestrator.submit_seeds(&config.seeds);
            if added > 0 {
                tracing::info!("Submitted {} new seed URL(s)", added);
            }
        }
    }
}
