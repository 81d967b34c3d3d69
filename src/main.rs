use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod allocator;
mod availability;
mod config;
mod db;
mod error;
mod locks;
mod models;
mod reassign;
mod reconcile;
mod report;
mod roster;
mod scoring;
mod store;

use allocator::Scheduler;
use config::{Config, LogFormat};
use db::PgStore;
use models::{parse_date, AllocationStatus, AllocationView};

#[derive(Parser)]
#[command(name = "invigilation-alloc")]
#[command(about = "Daily invigilator-to-exam-room allocation", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Regenerate all allocations for a date
    Generate {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
    },
    /// Show the allocations of a date
    Show {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long)]
        json: bool,
    },
    /// Show a single allocation
    Allocation {
        #[arg(long)]
        id: Uuid,
    },
    /// Move an allocation to another invigilator
    Reassign {
        #[arg(long)]
        allocation: Uuid,
        #[arg(long)]
        to: Uuid,
    },
    /// Delete every allocation of a date and release its load
    Clear {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
    },
    /// List dates with allocation counts
    History,
    /// List the dates that have exams scheduled
    Dates,
    /// Compare load counters with allocation records
    Reconcile {
        /// Overwrite drifted counters
        #[arg(long)]
        apply: bool,
    },
    /// Export a date's allocations as CSV
    Export {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long)]
        out: PathBuf,
    },
    /// Generate a markdown staffing report
    Report {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn print_views(views: &[AllocationView]) {
    for view in views {
        let allocation = &view.allocation;
        let owner = match (&view.invigilator, allocation.status) {
            (_, AllocationStatus::Pending) => "unstaffed".to_string(),
            (Some(inv), _) => format!("{} <{}>", inv.name, inv.email),
            (None, _) => "unknown".to_string(),
        };
        println!(
            "- [{}] {} {} {}: {}",
            allocation.id, allocation.slot, allocation.classroom_code, allocation.status, owner
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.config.log_format);

    let result = run(cli).await;
    if let Err(err) = &result {
        if let Some(cause) = err.downcast_ref::<error::Error>() {
            tracing::error!(
                reason = cause.reason_code(),
                retryable = cause.is_retryable(),
                "{err:#}"
            );
        }
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(cli.config.max_connections)
        .connect(&cli.config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let scheduler = Scheduler::new(PgStore::new(pool), cli.config.engine_options());

    match cli.command {
        Commands::InitDb => {
            db::init_db(scheduler.store().pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(scheduler.store().pool()).await?;
            println!("Seed data inserted.");
        }
        Commands::Generate { date } => {
            let views = scheduler
                .generate(date)
                .await
                .with_context(|| format!("failed to generate allocations for {date}"))?;
            if views.is_empty() {
                println!("No exams scheduled on {date}.");
                return Ok(());
            }
            let pending = views
                .iter()
                .filter(|v| v.allocation.status == AllocationStatus::Pending)
                .count();
            println!("Generated {} allocations for {date} ({pending} pending):", views.len());
            print_views(&views);
        }
        Commands::Show { date, json } => {
            let views = scheduler.get_for_date(date).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else if views.is_empty() {
                println!("No allocations for {date}.");
            } else {
                print_views(&views);
            }
        }
        Commands::Allocation { id } => {
            let view = scheduler.get_allocation(id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Reassign { allocation, to } => {
            let updated = scheduler
                .reassign(allocation, to)
                .await
                .with_context(|| format!("failed to reassign allocation {allocation}"))?;
            println!(
                "Allocation {} ({} {} {}) now assigned to {}.",
                updated.id, updated.date, updated.slot, updated.classroom_code, to
            );
        }
        Commands::Clear { date } => {
            let deleted = scheduler.clear_date(date).await?;
            println!("Deleted {deleted} allocations for {date}.");
        }
        Commands::History => {
            let history = scheduler.history().await?;
            if history.is_empty() {
                println!("No allocations generated yet.");
            }
            for entry in history {
                println!("- {}: {} allocations", entry.date, entry.count);
            }
        }
        Commands::Dates => {
            let dates = scheduler.exam_dates().await?;
            if dates.is_empty() {
                println!("No exams scheduled.");
            }
            for date in dates {
                println!("- {date}");
            }
        }
        Commands::Reconcile { apply } => {
            let drift = scheduler.reconcile(apply).await?;
            if drift.is_empty() {
                println!("Load counters match allocation records.");
                return Ok(());
            }
            for entry in &drift {
                println!(
                    "- {} ({}): stored {} expected {}",
                    entry.name, entry.faculty_id, entry.stored_current, entry.expected_current
                );
            }
            if apply {
                println!("Repaired {} faculty counters.", drift.len());
            } else {
                println!("Run again with --apply to repair.");
            }
        }
        Commands::Export { date, out } => {
            let views = scheduler.get_for_date(date).await?;
            let file = std::fs::File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            report::write_csv(file, &views)?;
            println!("Exported {} allocations to {}.", views.len(), out.display());
        }
        Commands::Report { date, out } => {
            let views = scheduler.get_for_date(date).await?;
            let report = report::build_report(date, &views);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
