use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use niancai_storage::QueueDocument;
use niancai_sync::{
    build_runner, ConsolidationSummary, Daemon, DaemonConfig, NiancaiConfig, RunSummary,
};

#[derive(Debug, Parser)]
#[command(name = "niancai")]
#[command(about = "年菜 listing crawl queue + catalog consolidation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enqueue one crawl target.
    Add {
        url: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Enqueue many crawl targets from a file, one URL per line.
    Import { file: String },
    /// Show the queue partitions.
    List,
    /// Process up to N pending jobs once, then consolidate.
    Run {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Run the crawl daemon until interrupted.
    Daemon {
        #[arg(long, default_value_t = 60)]
        tick_secs: u64,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
    },
    /// Export completed jobs into the catalog (one consolidation pass).
    Export,
    /// Requeue every failed job.
    Retry,
    /// Drop every job in the queue.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = NiancaiConfig::from_env();

    match cli.command {
        Commands::Add { url, priority } => {
            let runner = build_runner(&config)?;
            let job = runner.queue().enqueue(&url, priority).await?;
            println!("queued {} ({})", job.url, job.id);
        }
        Commands::Import { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let urls: Vec<String> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            let runner = build_runner(&config)?;
            let report = runner.queue().enqueue_many(&urls, 0).await?;
            println!("queued {} url(s)", report.queued.len());
            for (url, reason) in &report.rejected {
                println!("rejected {url}: {reason}");
            }
        }
        Commands::List => {
            let runner = build_runner(&config)?;
            let doc = runner.queue().snapshot().await?;
            print_queue(&doc);
        }
        Commands::Run { count } => {
            let runner = build_runner(&config)?;
            let (run, consolidation) = runner.run_once(count).await?;
            print_run(&run);
            print_consolidation(&consolidation);
        }
        Commands::Daemon {
            tick_secs,
            batch_size,
        } => {
            let runner = build_runner(&config)?;
            let daemon = Daemon::new(
                runner,
                DaemonConfig {
                    tick_secs,
                    batch_size,
                },
            );
            daemon.run().await?;
        }
        Commands::Export => {
            let runner = build_runner(&config)?;
            let consolidation = runner.consolidate_once().await?;
            print_consolidation(&consolidation);
        }
        Commands::Retry => {
            let runner = build_runner(&config)?;
            let retried = runner.queue().retry_failed().await?;
            println!("requeued {retried} failed job(s)");
        }
        Commands::Clear => {
            let runner = build_runner(&config)?;
            runner.queue().clear().await?;
            info!("queue cleared");
            println!("queue cleared");
        }
    }

    Ok(())
}

fn print_queue(doc: &QueueDocument) {
    println!(
        "pending={} processing={} completed={} failed={} (total {})",
        doc.pending.len(),
        doc.processing.len(),
        doc.completed.len(),
        doc.failed.len(),
        doc.total()
    );
    for job in &doc.pending {
        println!("  pending   {} p{} {}", job.id, job.priority, job.url);
    }
    for job in &doc.processing {
        println!("  processing {} {}", job.id, job.url);
    }
    for job in &doc.completed {
        println!("  completed {} {}", job.id, job.url);
    }
    for job in &doc.failed {
        let error = job.error.as_deref().unwrap_or("unknown error");
        println!(
            "  failed    {} {} (retries {}): {}",
            job.id, job.url, job.retry_count, error
        );
    }
}

fn print_run(run: &RunSummary) {
    println!(
        "processed {} job(s): {} succeeded, {} failed, {} skipped",
        run.processed, run.succeeded, run.failed, run.skipped
    );
}

fn print_consolidation(summary: &ConsolidationSummary) {
    println!(
        "catalog: {} incoming, {} added, {} exact duplicate(s) skipped, {} superseded",
        summary.incoming, summary.added, summary.exact_duplicates, summary.superseded
    );
    for invalid in &summary.invalid {
        println!("invalid: {} ({})", invalid.reason, invalid.source_url);
    }
}
