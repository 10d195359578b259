//! CLI argument structures and command dispatch
//!
//! `run` drives the full pipeline; `status` inspects a persisted resume
//! plan without submitting any work.

use crate::config::MarginCacheConfig;
use crate::error::MarginError;
use crate::metadata;
use crate::orchestrator;
use crate::plan::ResumePlan;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Generate margin caches for HEALPix-partitioned catalogs
#[derive(Parser)]
#[command(name = "skymargin")]
#[command(about = "skymargin - Resumable margin-cache generation for partitioned sky catalogs", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the margin-cache pipeline (resumes automatically)
    Run {
        /// Root of the source catalog
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Root of the margin catalog to produce
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Precomputed margin pair table (CSV)
        #[arg(long)]
        margin_pairs: PathBuf,

        /// Margin threshold in arcseconds
        #[arg(long)]
        margin_threshold: f64,

        /// Resolution used to bucket margin candidates
        #[arg(long)]
        margin_order: u8,

        /// Apply the exact distance check in the mappers instead of
        /// deferring it to the reducers
        #[arg(long)]
        fine_filtering: bool,

        /// Right ascension column name
        #[arg(long, default_value = "ra")]
        ra_column: String,

        /// Declination column name
        #[arg(long, default_value = "dec")]
        dec_column: String,

        /// Unique row identifier column used for deduplication
        #[arg(long, default_value = "id")]
        id_column: String,

        /// Keep intermediate shard files after reduction
        #[arg(long)]
        keep_intermediate_files: bool,

        /// Intermediate directory (defaults to <output>/intermediate)
        #[arg(long)]
        tmp_path: Option<PathBuf>,

        /// Worker pool size per phase
        #[arg(short = 'w', long, default_value = "4")]
        max_workers: usize,

        /// Discard persisted plan state and start over
        #[arg(long)]
        rebuild_plan: bool,

        /// Storage option for reading input, as KEY=VALUE (repeatable)
        #[arg(long = "input-storage-option", value_name = "KEY=VALUE")]
        input_storage_options: Vec<String>,

        /// Storage option for writing output, as KEY=VALUE (repeatable)
        #[arg(long = "output-storage-option", value_name = "KEY=VALUE")]
        output_storage_options: Vec<String>,
    },

    /// Report resume-plan progress for an in-flight run
    Status {
        /// Root of the margin catalog being produced
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Intermediate directory (defaults to <output>/intermediate)
        #[arg(long)]
        tmp_path: Option<PathBuf>,
    },
}

fn parse_storage_options(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            MarginError::invalid_config("storage options", format!("expected KEY=VALUE, got {entry}"))
        })?;
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}

pub async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            input,
            output,
            margin_pairs,
            margin_threshold,
            margin_order,
            fine_filtering,
            ra_column,
            dec_column,
            id_column,
            keep_intermediate_files,
            tmp_path,
            max_workers,
            rebuild_plan,
            input_storage_options,
            output_storage_options,
        } => {
            let config = MarginCacheConfig {
                input_catalog_path: input,
                output_catalog_path: output,
                tmp_path,
                margin_pairs_path: margin_pairs,
                margin_threshold_arcsec: margin_threshold,
                margin_order,
                fine_filtering,
                ra_column,
                dec_column,
                id_column,
                delete_intermediate_parquet_files: !keep_intermediate_files,
                max_workers,
                rebuild_plan,
                input_storage_options: parse_storage_options(&input_storage_options)?,
                output_storage_options: parse_storage_options(&output_storage_options)?,
            };
            let summary = orchestrator::generate_margin_cache(&config).await?;
            if summary.already_complete {
                println!(
                    "Margin catalog already complete: {} partitions, {} rows",
                    summary.partitions, summary.total_rows
                );
            } else {
                println!(
                    "Margin cache generated: {} partitions, {} rows ({} mapped, {} reduced this run)",
                    summary.partitions,
                    summary.total_rows,
                    summary.mapping_tasks_run,
                    summary.reducing_tasks_run
                );
            }
            Ok(())
        }
        Commands::Status { output, tmp_path } => {
            if metadata::is_finalized(&output) {
                println!("Margin catalog at {} is complete", output.display());
                return Ok(());
            }
            let intermediate = tmp_path.unwrap_or_else(|| output.join("intermediate"));
            if !intermediate.join(crate::plan::PLAN_FILE).exists() {
                println!("No active run found under {}", intermediate.display());
                return Ok(());
            }
            let plan = ResumePlan::load(&intermediate).await?;
            let status = plan.status();
            println!(
                "Mapping: {}/{} done, Reducing: {}/{} done",
                status.mapping_done,
                status.mapping_total,
                status.reducing_done,
                status.reducing_total
            );
            Ok(())
        }
    }
}
