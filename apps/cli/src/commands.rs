//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use trawler_core::{Registry, Scheduler, WorkerPool};
use trawler_shared::{AppConfig, TrawlerError, load_config, load_config_from};
use trawler_stages::HandlerRegistry;
use trawler_storage::{Backend, open_backend};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// trawler — crawler framework for documents and structured scrapers.
#[derive(Parser)]
#[command(
    name = "trawler",
    version,
    about = "Run, schedule, and inspect data-ingestion crawlers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Verbose logging.
    #[arg(long, global = true, env = "TRAWLER_DEBUG")]
    pub debug: bool,

    /// Disable HTTP response caching in stage execution.
    #[arg(long, global = true, env = "TRAWLER_NO_CACHE")]
    pub no_cache: bool,

    /// Disable incremental dedup filtering.
    #[arg(long, global = true, env = "TRAWLER_NON_INCREMENTAL")]
    pub non_incremental: bool,

    /// Path to the config file (defaults to ~/.trawler/trawler.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a specified crawler and drain its queue.
    Run {
        /// Crawler name.
        crawler: String,

        /// Number of concurrent workers (defaults to config).
        #[arg(long)]
        threads: Option<usize>,

        /// Keep draining after a stage failure instead of aborting.
        #[arg(long)]
        continue_on_error: bool,

        /// Purge this crawler's queue/dedup/tag state before seeding.
        #[arg(long)]
        flush: bool,

        /// Purge the entire backend (all crawlers) before seeding.
        #[arg(long)]
        flushall: bool,
    },

    /// Abort execution of a specified crawler (cooperative).
    Cancel {
        /// Crawler name.
        crawler: String,
    },

    /// Delete all data generated by a crawler.
    Flush {
        /// Crawler name.
        crawler: String,
    },

    /// Delete all tags generated by a crawler.
    #[command(name = "flush-tags")]
    FlushTags {
        /// Crawler name.
        crawler: String,
    },

    /// List the available crawlers.
    List,

    /// Status of a crawler.
    Status {
        /// Crawler name.
        crawler: String,
    },

    /// Run crawlers that are due.
    Scheduled {
        /// Number of concurrent workers (defaults to config).
        #[arg(long)]
        threads: Option<usize>,

        /// Keep scheduling forever instead of a single pass.
        #[arg(long)]
        daemon: bool,

        /// Seconds between scheduler passes in daemon mode
        /// (defaults to config).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Completely purge the shared backend, across all crawlers.
    Killthekitten,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = if cli.debug {
        "trawler=debug"
    } else {
        match cli.verbose {
            0 => "trawler=info",
            1 => "trawler=debug",
            _ => "trawler=trace",
        }
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Run {
            crawler,
            threads,
            continue_on_error,
            flush,
            flushall,
        } => {
            cmd_run(
                &cli,
                crawler,
                *threads,
                *continue_on_error,
                *flush,
                *flushall,
            )
            .await
        }
        Command::Cancel { crawler } => cmd_cancel(&cli, crawler).await,
        Command::Flush { crawler } => cmd_flush(&cli, crawler).await,
        Command::FlushTags { crawler } => cmd_flush_tags(&cli, crawler).await,
        Command::List => cmd_list(&cli).await,
        Command::Status { crawler } => cmd_status(&cli, crawler).await,
        Command::Scheduled {
            threads,
            daemon,
            interval,
        } => cmd_scheduled(&cli, *threads, *daemon, *interval).await,
        Command::Killthekitten => cmd_killthekitten(&cli).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&cli).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Application bootstrap
// ---------------------------------------------------------------------------

/// Everything a command needs: resolved config, the backend, and the
/// loaded crawler registry.
struct App {
    config: AppConfig,
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
}

/// Resolve config (file + flag overrides) once and load the registry.
async fn open_app(cli: &Cli) -> Result<App> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if cli.debug {
        config.settings.debug = true;
    }
    if cli.no_cache {
        config.settings.http_cache = false;
    }
    if cli.non_incremental {
        config.settings.incremental = false;
    }

    let backend = open_backend(&config.backend.address).await?;
    let handlers = Arc::new(HandlerRegistry::new());
    let registry = Arc::new(
        Registry::load(
            Path::new(&config.runtime.crawlers_dir),
            backend.clone(),
            handlers,
            config.settings.incremental,
        )
        .await?,
    );

    Ok(App {
        config,
        backend,
        registry,
    })
}

impl App {
    fn pool(&self) -> Arc<WorkerPool> {
        WorkerPool::new(
            self.registry.clone(),
            self.backend.clone(),
            self.config.settings.clone(),
            Duration::from_millis(self.config.runtime.poll_timeout_ms),
        )
    }

    fn threads(&self, flag: Option<usize>) -> usize {
        flag.unwrap_or(self.config.runtime.threads)
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    cli: &Cli,
    name: &str,
    threads: Option<usize>,
    continue_on_error: bool,
    flush: bool,
    flushall: bool,
) -> Result<()> {
    let mut app = open_app(cli).await?;
    if continue_on_error {
        app.config.settings.continue_on_error = true;
    }

    // Unknown crawler: error out before any side effect.
    let crawler = app.registry.get(name)?;
    let threads = app.threads(threads);

    info!(crawler = name, threads, flush, flushall, "starting run");
    crawler.run(flush, flushall).await?;

    let spinner = run_spinner();
    let status_task = {
        let crawler = crawler.clone();
        let spinner = spinner.clone();
        tokio::spawn(async move {
            loop {
                let status = crawler.status();
                spinner.set_message(format!(
                    "{} [{}] {} ops, {} pending",
                    status.name, status.state, status.op_count, status.pending_count
                ));
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
        })
    };

    let code = app.pool().run(threads, true).await;
    status_task.abort();
    spinner.finish_and_clear();
    let code = code?;

    let status = crawler.status();
    println!();
    println!("  Run complete.");
    println!("  Crawler:  {}", status.name);
    println!("  State:    {}", status.state);
    println!("  Ops:      {}", status.op_count);
    println!("  Pending:  {}", status.pending_count);
    println!();

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Spinner shown while the pool drains.
fn run_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

async fn cmd_cancel(cli: &Cli, name: &str) -> Result<()> {
    let app = open_app(cli).await?;
    let crawler = app.registry.get(name)?;

    match crawler.cancel() {
        Ok(()) => {
            println!("Cancellation requested for [{name}].");
            Ok(())
        }
        Err(TrawlerError::InvalidTransition { state, .. }) => {
            warn!(crawler = name, %state, "crawler is not running; nothing to cancel");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_flush(cli: &Cli, name: &str) -> Result<()> {
    let app = open_app(cli).await?;
    let crawler = app.registry.get(name)?;
    crawler.flush().await?;
    println!("Flushed all data for [{name}].");
    Ok(())
}

async fn cmd_flush_tags(cli: &Cli, name: &str) -> Result<()> {
    let app = open_app(cli).await?;
    let crawler = app.registry.get(name)?;
    crawler.flush_tags().await?;
    println!("Flushed tags for [{name}].");
    Ok(())
}

async fn cmd_list(cli: &Cli) -> Result<()> {
    let app = open_app(cli).await?;

    println!(
        "{:<24} {:<44} {:<10} {}",
        "Name", "Description", "Schedule", "Due"
    );
    for crawler in app.registry.iter() {
        println!(
            "{:<24} {:<44} {:<10} {}",
            crawler.name(),
            crawler.description(),
            crawler.schedule(),
            if crawler.is_due() { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn cmd_status(cli: &Cli, name: &str) -> Result<()> {
    let app = open_app(cli).await?;
    let crawler = app.registry.get(name)?;
    let status = crawler.status();

    let last_run = status
        .last_run
        .map(|at| format!("{} UTC", at.format("%Y-%m-%dT%H:%M:%S")))
        .unwrap_or_else(|| "-".into());

    println!(
        "{:<24} {:<32} {:<9} {:<22} {:<9} {}",
        "Name", "Description", "Running?", "Last Active", "Op Count", "Pending Ops"
    );
    println!(
        "{:<24} {:<32} {:<9} {:<22} {:<9} {}",
        status.name,
        status.description,
        status.is_running(),
        last_run,
        status.op_count,
        status.pending_count
    );
    Ok(())
}

async fn cmd_scheduled(
    cli: &Cli,
    threads: Option<usize>,
    daemon: bool,
    interval: Option<u64>,
) -> Result<()> {
    let app = open_app(cli).await?;
    let threads = app.threads(threads);
    let pool = app.pool();

    if !daemon {
        let started = Scheduler::new(app.registry.clone()).tick().await;
        if started == 0 {
            println!("No crawlers due.");
            return Ok(());
        }
        println!("Started {started} crawler run(s).");
        let code = pool.run(threads, true).await?;
        if code != 0 {
            std::process::exit(code);
        }
        return Ok(());
    }

    let interval = interval.unwrap_or(app.config.runtime.scheduler_interval_secs);
    info!(interval_secs = interval, threads, "scheduler daemon started");
    let _scheduler = Scheduler::new(app.registry.clone()).start(Duration::from_secs(interval));

    loop {
        let any_active = app
            .registry
            .iter()
            .any(|c| c.state().is_running());
        if any_active {
            let code = pool.run(threads, true).await?;
            if code != 0 {
                warn!(code, "scheduled drain finished with failures");
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn cmd_killthekitten(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let backend = open_backend(&config.backend.address).await?;
    backend.flush_all().await?;
    println!("Backend purged: all queues, fingerprints, tags, and run metadata are gone.");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = trawler_shared::init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config).map_err(|e| eyre!("{e}"))?;
    println!("{toml_str}");
    Ok(())
}
