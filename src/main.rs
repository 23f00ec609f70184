//! serp-harvest CLI - batch SERP harvesting through a proxy pool.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use serp_harvest::{
    harvest,
    input::{load_proxies, load_terms},
    CredentialProvider, HarvestConfig, ProxyStrategy, ScriptAssetCredentials, StaticCredentials,
};

/// serp-harvest - concurrent SERP API harvester
#[derive(Parser)]
#[command(name = "serp-harvest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest results for a batch of search terms
    Run(RunArgs),

    /// Parse a proxy list and print the proxies it contains
    CheckProxies {
        /// Proxy list file
        file: PathBuf,
    },
}

#[derive(Parser)]
struct RunArgs {
    /// Proxy list file, one proxy per line
    #[arg(short, long, default_value = "proxies.txt")]
    proxies: PathBuf,

    /// File with one search term per line
    #[arg(long)]
    terms: Option<PathBuf>,

    /// Search term (repeatable)
    #[arg(short = 'q', long = "term")]
    term: Vec<String>,

    /// JSON config file; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Attempts per term before giving up
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Proxy ban cool-down in seconds
    #[arg(long)]
    cooldown: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Consecutive bans before a proxy is retired
    #[arg(long)]
    max_strikes: Option<u32>,

    /// Proxy selection strategy
    #[arg(long)]
    strategy: Option<StrategyArg>,

    /// Output directory, one JSON file per term
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// API client id; extracted from the playground script when omitted
    #[arg(long, env = "SERP_CLIENT_ID")]
    client_id: Option<String>,

    /// API client secret
    #[arg(long, env = "SERP_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Script asset to extract credentials from
    #[arg(long)]
    script_url: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    /// Rotate through proxies in order
    RoundRobin,
    /// Prefer the proxy idle for longest
    Lru,
    /// Pick at random
    Random,
}

impl From<StrategyArg> for ProxyStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::RoundRobin => ProxyStrategy::RoundRobin,
            StrategyArg::Lru => ProxyStrategy::LeastRecentlyUsed,
            StrategyArg::Random => ProxyStrategy::Random,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::CheckProxies { file } => check_proxies(file).await,
    }
}

async fn check_proxies(file: PathBuf) -> Result<()> {
    let proxies = load_proxies(&file).await?;
    for proxy in &proxies {
        let auth = if proxy.username.is_some() { "auth" } else { "no auth" };
        println!("{}\t{:?}\t{}", proxy.label(), proxy.protocol, auth);
    }
    println!("\n{} proxies in {}", proxies.len(), file.display());
    Ok(())
}

fn build_config(args: &RunArgs) -> Result<HarvestConfig> {
    let mut config = match &args.config {
        Some(path) => HarvestConfig::from_file(path)?,
        None => HarvestConfig::default(),
    };

    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(cooldown) = args.cooldown {
        config.cooldown_secs = cooldown;
    }
    if let Some(timeout) = args.timeout {
        config.request_timeout_secs = timeout;
    }
    if let Some(max_strikes) = args.max_strikes {
        config.max_strikes = Some(max_strikes);
    }
    if let Some(strategy) = args.strategy {
        config.proxy_strategy = strategy.into();
    }
    if let Some(output_dir) = &args.output_dir {
        config.output_dir = output_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;
    let proxies = load_proxies(&args.proxies).await?;

    let mut terms = args.term.clone();
    if let Some(path) = &args.terms {
        terms.extend(load_terms(path).await?);
    }
    if terms.is_empty() {
        anyhow::bail!("No search terms given; use --term or --terms");
    }

    let provider: Box<dyn CredentialProvider> = match (&args.client_id, &args.client_secret) {
        (Some(id), Some(secret)) => Box::new(StaticCredentials::new(id, secret)),
        _ => {
            let url = args
                .script_url
                .clone()
                .unwrap_or_else(|| serp_harvest::credentials::DEFAULT_SCRIPT_URL.to_string());
            Box::new(
                ScriptAssetCredentials::new(url)
                    .with_proxies(proxies.clone())
                    .with_timeout(config.request_timeout()),
            )
        }
    };

    let summary = harvest(&config, proxies, provider.as_ref(), terms).await?;

    println!(
        "\nHarvested {} terms in {}ms: {} succeeded, {} failed",
        summary.total(),
        summary.duration_ms,
        summary.succeeded,
        summary.failed
    );
    for report in summary.reports.iter().filter(|r| !r.status.is_success()) {
        println!(
            "  FAILED {} after {} attempt(s) ({:?})",
            report.term,
            report.attempt_count(),
            report.status
        );
    }
    println!("Results written to {}", config.output_dir.display());

    if summary.auth_failures > 0 {
        eprintln!(
            "Warning: the API rejected the credentials for {} term(s)",
            summary.auth_failures
        );
    }
    if summary.all_failed() {
        anyhow::bail!("Every search term failed");
    }
    Ok(())
}
