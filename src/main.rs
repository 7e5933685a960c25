mod browser;
mod convergence;
mod dispatcher;
mod error;
mod ledger;
mod record;
mod settings;
mod sink;
#[cfg(test)]
mod testing;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use browser::ChromeBackend;
use dispatcher::{Dispatcher, HarvestSummary};
use ledger::DedupLedger;
use settings::Settings;
use sink::SinkFormat;
use worker::PageWorker;

#[derive(Parser)]
#[command(name = "harvester", about = "Incremental listing harvester for infinite-scroll feeds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest every page of the feed into the output store
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Only probe the feed for its page count
    Pages {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Show how many listings the output store holds
    Stats {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line values win over the config file and the environment.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Settings file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listing feed URL; the page number is appended to it
    #[arg(long)]
    url: Option<String>,
    /// Output file
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long, value_enum)]
    format: Option<SinkFormat>,
    /// Pages scraped concurrently
    #[arg(short, long)]
    workers: Option<usize>,
    /// Scroll step, in viewport heights
    #[arg(long)]
    scroll_factor: Option<f64>,
    /// Pause after each scroll, in milliseconds
    #[arg(long)]
    pause_ms: Option<u64>,
    /// Stalled scrolls before a page counts as exhausted
    #[arg(long)]
    max_no_change: Option<u32>,
    /// Upper bound on scrolls per page
    #[arg(long)]
    max_iterations: Option<u32>,
}

impl Overrides {
    fn resolve(self) -> anyhow::Result<Settings> {
        let mut s = Settings::load(self.config.as_deref())?;
        if let Some(v) = self.url {
            s.target_url = v;
        }
        if let Some(v) = self.output {
            s.output = v;
        }
        if let Some(v) = self.format {
            s.format = v;
        }
        if let Some(v) = self.workers {
            s.workers = v;
        }
        if let Some(v) = self.scroll_factor {
            s.scroll_factor = v;
        }
        if let Some(v) = self.pause_ms {
            s.scroll_pause_ms = v;
        }
        if let Some(v) = self.max_no_change {
            s.max_no_change = v;
        }
        if let Some(v) = self.max_iterations {
            s.max_iterations = v;
        }
        s.validate()?;
        Ok(s)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            overrides,
            no_progress,
        } => {
            let settings = overrides.resolve()?;
            let summary = harvest(&settings, !no_progress).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Pages { overrides } => {
            let settings = overrides.resolve()?;
            let backend = ChromeBackend::launch(&settings).await?;
            let last = backend.last_page(&settings.target_url).await;
            backend.shutdown().await;
            println!("Found {} pages at {}", last?, settings.target_url);
            Ok(())
        }
        Commands::Stats { overrides } => {
            let settings = overrides.resolve()?;
            let store = sink::open(&settings.output, settings.format)?;
            println!(
                "{} listings stored in {}",
                store.count()?,
                settings.output.display()
            );
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn harvest(settings: &Settings, show_progress: bool) -> anyhow::Result<HarvestSummary> {
    let store = sink::open(&settings.output, settings.format)?;
    let known = store.load_known_ids()?;
    println!(
        "Loaded {} known listings from {}",
        known.len(),
        settings.output.display()
    );

    let backend = Arc::new(ChromeBackend::launch(settings).await?);
    let last_page = match backend.last_page(&settings.target_url).await {
        Ok(n) => n,
        Err(e) => {
            if let Ok(backend) = Arc::try_unwrap(backend) {
                backend.shutdown().await;
            }
            return Err(e.into());
        }
    };
    println!(
        "Found {} pages to scrape with {} workers",
        last_page, settings.workers
    );

    let urls = settings.clone();
    let worker = PageWorker::new(
        Arc::clone(&backend),
        Arc::new(DedupLedger::with_baseline(known)),
        store,
        settings.scan_policy(),
        move |page| urls.page_url(page),
    );
    let dispatcher = Dispatcher::new(worker, settings.workers).with_progress(show_progress);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if on_interrupt(&cancel) == Interrupt::Abort {
                    warn!("Second interrupt, exiting without waiting for pages in flight");
                    std::process::exit(130);
                }
                warn!("Interrupt received, finishing pages in flight. Press Ctrl-C again to quit now.");
            }
        })
    };

    let summary = dispatcher.run(last_page, cancel).await;
    interrupt.abort();

    drop(dispatcher);
    match Arc::try_unwrap(backend) {
        Ok(backend) => backend.shutdown().await,
        Err(_) => warn!("Browser still referenced at shutdown; leaving it to exit with the process"),
    }

    Ok(summary)
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Drain,
    Abort,
}

/// First interrupt drains the run; any later one aborts the process.
fn on_interrupt(cancel: &CancellationToken) -> Interrupt {
    if cancel.is_cancelled() {
        Interrupt::Abort
    } else {
        cancel.cancel();
        Interrupt::Drain
    }
}

fn print_summary(summary: &HarvestSummary) {
    let failed = summary.failed_pages();
    if summary.cancelled {
        println!("Interrupted: {} pages were not started.", summary.pages_skipped);
    }
    println!(
        "Pages: {} completed, {} failed, {} skipped",
        summary.completed_pages(),
        failed.len(),
        summary.pages_skipped
    );
    if !failed.is_empty() {
        println!("Failed pages: {:?}", failed);
    }
    println!("Total scraping time: {}", format_duration(summary.elapsed));
    println!("Total extracted listings: {}", summary.total_new);
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
