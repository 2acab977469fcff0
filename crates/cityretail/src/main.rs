use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cityretail_core::config::Config;
use cityretail_core::db;
use cityretail_core::ledger::RunOutcome;
use cityretail_core::run::{execute_run, RunMode, RunReport};
use cityretail_core::types::Entity;

/// CityRetail warehouse loader: moves raw CSV extracts into the star-schema
/// warehouse.
#[derive(Parser, Debug)]
#[command(author, version, about = "CityRetail warehouse loader", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a warehouse load.
    Run(RunArgs),
    /// Apply embedded database migrations and exit.
    Migrate,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Re-extract and re-clean even if cleaned artifacts exist.
    #[arg(long, conflicts_with = "incremental")]
    force: bool,

    /// Load only records that are new or changed since the last successful run.
    #[arg(long)]
    incremental: bool,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        if self.force {
            RunMode::Force
        } else if self.incremental {
            RunMode::Incremental
        } else {
            RunMode::Full
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_env().context("loader configuration is incomplete")?;
    let pool = db::connect_with_retry(&config.database_url, 5)
        .await
        .context("could not reach the warehouse database")?;

    match cli.command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
            info!("database migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            db::run_migrations(&pool).await?;
            let report = execute_run(&pool, &config, args.mode()).await?;
            print_summary(&report);
            match report.outcome {
                RunOutcome::Succeeded => Ok(ExitCode::SUCCESS),
                _ => Ok(ExitCode::FAILURE),
            }
        }
    }
}

fn print_summary(report: &RunReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        "Entity",
        "Extracted",
        "Cleaned",
        "Rejected",
        "Unchanged",
        "Applied",
        "Skipped",
    ]);
    for entity in Entity::LOAD_ORDER {
        let stats = report.stats.entity(entity);
        table.add_row(vec![
            Cell::new(entity),
            Cell::new(stats.extracted),
            Cell::new(stats.cleaned),
            Cell::new(stats.rejected),
            Cell::new(stats.unchanged),
            Cell::new(stats.applied),
            Cell::new(stats.skipped),
        ]);
    }

    println!(
        "Run {} ({} mode): {}",
        report.run_id,
        report.mode,
        report.outcome.as_str()
    );
    println!("{table}");
    if let Some(entity) = report.failed_entity {
        println!("Failing entity: {entity}");
    }
    if let Some(error) = &report.error {
        println!("Error: {error}");
    }
}
