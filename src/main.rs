use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use ec_pipeline::config::PipelineConfig;
use ec_pipeline::pipeline::{MarketplacePipeline, RunOptions};
use ec_pipeline::{logging, metrics};

#[derive(Parser)]
#[command(name = "ec_pipeline")]
#[command(about = "Marketplace order export normalization and merge pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    /// Run configuration file (defaults to $EC_PIPELINE_CONFIG or config/pipeline.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize, merge and publish export files for one marketplace
    Run {
        #[arg(long)]
        marketplace: String,
        /// Run every stage but do not publish the master table
        #[arg(long)]
        dry_run: bool,
        /// Write a Prometheus text snapshot of the run's metrics here
        #[arg(long)]
        metrics_file: Option<PathBuf>,
        /// Export files or directories, oldest first; later files win
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Validate a marketplace mapping, optionally against a sample export
    CheckMapping {
        #[arg(long)]
        marketplace: String,
        #[arg(long)]
        sample: Option<PathBuf>,
    },
    /// Show which order dates the published master table covers
    Coverage {
        #[arg(long)]
        marketplace: String,
    },
    /// List configured marketplaces
    Marketplaces,
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::load_from(path),
        None => PipelineConfig::load(),
    }
    .context("loading run configuration")?;

    let _log_guard = logging::init_logging(&config.log_dir());
    metrics::init_metrics();

    match cli.command {
        Commands::Run {
            marketplace,
            dry_run,
            metrics_file,
            inputs,
        } => {
            let span = tracing::info_span!("run", marketplace = %marketplace);
            let _enter = span.enter();

            let pipeline = MarketplacePipeline::load(&config, &marketplace)?;
            let result = pipeline.run(&inputs, RunOptions { dry_run });

            if let Some(path) = &metrics_file {
                metrics::write_snapshot(path)?;
            }

            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Run aborted, master table unchanged");
                    return Err(e).context(format!("run for '{}' aborted", marketplace));
                }
            };
            let report_path = report.write(&config.report_dir())?;

            println!("\n📊 Run Results for {}:", marketplace);
            println!("   Files: {}", report.files.len());
            println!("   Rows read: {}", report.rows_read);
            println!("   Rows rejected: {}", report.rows_rejected);
            println!("   Keys added: {}", report.merge.added);
            println!("   Keys overwritten: {}", report.merge.overwritten);
            println!("   Keys unchanged: {}", report.merge.unchanged);
            println!("   Enrichment misses: {}", report.enrichment_misses());
            println!("   Master records: {}", report.merge.total);
            println!(
                "   Published: {}",
                if report.published { "yes" } else { "no (dry run)" }
            );
            println!("   Report: {}", report_path.display());
        }
        Commands::CheckMapping {
            marketplace,
            sample,
        } => {
            let pipeline = MarketplacePipeline::load(&config, &marketplace)?;
            let check = pipeline.check_mapping(sample.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&check)?);
            if !check.missing_required.is_empty() {
                anyhow::bail!(
                    "sample is missing required fields: {}",
                    check.missing_required.join(", ")
                );
            }
            info!(marketplace = %marketplace, "Mapping check passed");
        }
        Commands::Coverage { marketplace } => {
            let pipeline = MarketplacePipeline::load(&config, &marketplace)?;
            match pipeline.coverage()? {
                Some(coverage) => println!("{}", serde_json::to_string_pretty(&coverage)?),
                None => println!("{} has no order date field", marketplace),
            }
        }
        Commands::Marketplaces => {
            for market in &config.marketplaces {
                println!(
                    "{}\tmapping={}\tmaster={}\tjoins={}",
                    market.name,
                    config.mapping_path(market).display(),
                    config.master_path(market).display(),
                    market.joins.len()
                );
            }
        }
    }

    Ok(())
}
