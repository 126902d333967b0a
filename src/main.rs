use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod fetch;
mod models;
mod orchestrator;
mod report;
mod sink;
mod source;
mod table;

use crate::config::AppConfig;
use crate::fetch::{FetchPolicy, RetryingFetcher, FETCH_TIMEOUT};
use crate::models::EntityConfig;
use crate::orchestrator::{BatchOrchestrator, ExportMode, ExportPolicy, RunSummary, BATCH_SIZE};
use crate::sink::{CsvDirSink, MemorySink, SheetsSink, Sink};
use crate::source::{Acquire, DirSource, HttpSource};

#[derive(Parser)]
#[command(name = "club-fan-export")]
#[command(about = "Daily fan-gain reports for club members, exported to a spreadsheet", long_about = None)]
struct Cli {
    /// Club list and target spreadsheet
    #[arg(long, env = "CLUB_EXPORT_CONFIG", default_value = "config/clubs.toml", global = true)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured clubs
    Clubs,
    /// Fetch club activity and write one report surface per club
    #[command(group(
        ArgGroup::new("target")
            .args(["csv_dir", "dry_run"])
            .multiple(false)
    ))]
    Export {
        /// Only export the club with this id
        #[arg(long)]
        club: Option<String>,
        #[arg(long, default_value_t = BATCH_SIZE)]
        batch_size: usize,
        /// Export clubs of a batch one after another
        #[arg(long)]
        sequential: bool,
        /// Reorder surfaces to match the config once the run is done
        #[arg(long)]
        reorder: bool,
        /// Read saved `<locator>.json` documents instead of the live API
        #[arg(long)]
        from_dir: Option<PathBuf>,
        /// Write CSV files instead of a spreadsheet
        #[arg(long)]
        csv_dir: Option<PathBuf>,
        /// Render in memory only
        #[arg(long)]
        dry_run: bool,
        /// Keep running, exporting every N hours
        #[arg(long, conflicts_with = "dry_run", value_parser = clap::value_parser!(u64).range(1..))]
        every_hours: Option<u64>,
        /// Service account key for the spreadsheet
        #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
        credentials: Option<PathBuf>,
    },
}

enum Target {
    Sheets(PathBuf),
    CsvDir(PathBuf),
    DryRun,
}

struct Job {
    sheet_id: String,
    clubs: Vec<EntityConfig>,
    batch_size: usize,
    every_hours: Option<u64>,
    policy: ExportPolicy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Clubs => {
            for club in &config.clubs {
                println!(
                    "[{}] {} (locator {}, threshold {})",
                    club.id, club.title, club.source_locator, club.threshold
                );
            }
        }
        Commands::Export {
            club,
            batch_size,
            sequential,
            reorder,
            from_dir,
            csv_dir,
            dry_run,
            every_hours,
            credentials,
        } => {
            let target = if dry_run {
                Target::DryRun
            } else if let Some(dir) = csv_dir {
                Target::CsvDir(dir)
            } else {
                let key = credentials.or_else(|| config.credentials.clone()).context(
                    "a service account key is required (--credentials, GOOGLE_APPLICATION_CREDENTIALS or `credentials` in config)",
                )?;
                Target::Sheets(key)
            };

            let job = Job {
                sheet_id: config.sheet_id.clone(),
                clubs: config.select(club.as_deref())?,
                batch_size,
                every_hours,
                policy: ExportPolicy {
                    mode: if sequential {
                        ExportMode::Sequential
                    } else {
                        ExportMode::Concurrent
                    },
                    reorder,
                    ..ExportPolicy::default()
                },
            };

            println!("Processing {} clubs...", job.clubs.len());
            match from_dir {
                Some(dir) => export(DirSource::new(dir), target, job).await?,
                None => export(HttpSource::new(FETCH_TIMEOUT), target, job).await?,
            }
        }
    }

    Ok(())
}

async fn export<A: Acquire>(source: A, target: Target, job: Job) -> anyhow::Result<()> {
    let fetcher = RetryingFetcher::new(source, FetchPolicy::default());
    match target {
        Target::Sheets(key) => {
            let sink = SheetsSink::connect(&key)
                .await
                .with_context(|| format!("failed to connect to sheets with {}", key.display()))?;
            let orchestrator =
                BatchOrchestrator::new(fetcher, sink, job.sheet_id.clone(), job.policy);
            run_schedule(&orchestrator, &job).await;
        }
        Target::CsvDir(dir) => {
            let orchestrator =
                BatchOrchestrator::new(fetcher, CsvDirSink::new(dir), job.sheet_id.clone(), job.policy);
            run_schedule(&orchestrator, &job).await;
        }
        Target::DryRun => {
            let orchestrator =
                BatchOrchestrator::new(fetcher, MemorySink::new(), job.sheet_id.clone(), job.policy);
            run_schedule(&orchestrator, &job).await;
            print_preview(orchestrator.sink(), &job.sheet_id);
        }
    }
    Ok(())
}

async fn run_schedule<A: Acquire, S: Sink>(orchestrator: &BatchOrchestrator<A, S>, job: &Job) {
    let Some(hours) = job.every_hours else {
        let summary = orchestrator.run_all(&job.clubs, job.batch_size).await;
        print_summary(&summary);
        return;
    };

    // First tick fires immediately.
    let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3600));
    loop {
        ticker.tick().await;
        info!(every_hours = hours, "starting scheduled export");
        let summary = orchestrator.run_all(&job.clubs, job.batch_size).await;
        print_summary(&summary);
    }
}

fn print_preview(sink: &MemorySink, sheet_id: &str) {
    for name in sink.surface_names(sheet_id) {
        let Some(surface) = sink.surface(sheet_id, &name) else {
            continue;
        };
        let grid = surface.used_grid();
        let cols = grid.first().map_or(0, Vec::len);
        println!("  {name}: {} rows x {cols} columns", grid.len());
    }
}

fn print_summary(summary: &RunSummary) {
    info!(
        run_id = %summary.run_id,
        exported = summary.exported.len(),
        failed = summary.failed.len(),
        "export run finished"
    );
    for title in &summary.exported {
        println!("  Success: {title}");
    }
    for title in &summary.failed {
        println!("  Failed: {title}");
    }
    if let Some(err) = &summary.reorder_error {
        println!("Surface reorder failed: {err}");
    }

    println!("{}", "-".repeat(30));
    if summary.failed.is_empty() {
        println!("All operations complete.");
    } else {
        println!("Completed with errors: {} failed.", summary.failed.len());
        println!("Failed clubs: {}", summary.failed.join(", "));
    }
    println!("{}", "-".repeat(30));
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "club_fan_export=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
