//! Pipeline driver: MAPPING -> REDUCING -> FINALIZING -> DONE
//!
//! Each state is re-entrant: a restarted run re-evaluates what remains
//! and skips completed work. The barrier between mapping and reducing is
//! hard; no reducer starts until every mapper future has resolved,
//! because reducers discover their inputs from the completed mapping
//! markers. Finalization runs whenever the output catalog is not yet
//! marked complete, as four discrete write-replace steps followed by
//! intermediate-directory cleanup.

use crate::catalog::{self, Catalog};
use crate::config::MarginCacheConfig;
use crate::error::{MarginError, MarginResult};
use crate::fsio;
use crate::geometry::MarginPairTable;
use crate::mapper::{map_pixel_shards, MapperTask};
use crate::metadata::{self, MarginCatalogInfo};
use crate::parquet_io;
use crate::plan::ResumePlan;
use crate::progress::ProgressScope;
use crate::reducer::{reduce_margin_shards, ReducerTask};
use crate::scheduler::WorkerPool;
use arrow::datatypes::SchemaRef;
use std::sync::Arc;
use tracing::{info, warn};

/// What a run actually did, for callers and the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Mapper tasks executed this invocation (resumed keys are skipped)
    pub mapping_tasks_run: usize,
    /// Reducer tasks executed this invocation
    pub reducing_tasks_run: usize,
    /// Output partitions in the finished catalog
    pub partitions: usize,
    /// Margin rows across all output partitions
    pub total_rows: u64,
    /// True when a previous run had already finalized the catalog
    pub already_complete: bool,
}

/// Generate the margin cache for one catalog
///
/// Safe to re-invoke with the same arguments after any failure; the
/// resume plan ensures only unfinished work is resubmitted.
pub async fn generate_margin_cache(config: &MarginCacheConfig) -> MarginResult<RunSummary> {
    if metadata::is_finalized(&config.output_catalog_path) {
        info!(
            "Margin catalog {} is already complete, nothing to do",
            config.output_catalog_path.display()
        );
        return completed_summary(config).await;
    }

    let input = Catalog::open(&config.input_catalog_path).await?;
    config.validate(input.max_order())?;

    let pairs = Arc::new(MarginPairTable::load(&config.margin_pairs_path)?);
    if pairs.margin_order() != config.margin_order {
        return Err(MarginError::invalid_config(
            "margin_order",
            format!(
                "pair table was computed at order {}, configuration says {}",
                pairs.margin_order(),
                config.margin_order
            ),
        ));
    }

    if config.rebuild_plan {
        let intermediate = config.intermediate_path();
        if intermediate.exists() {
            warn!(
                "Discarding persisted plan state under {}",
                intermediate.display()
            );
            tokio::fs::remove_dir_all(&intermediate)
                .await
                .map_err(|e| MarginError::io(&intermediate, "remove", e))?;
        }
    }

    let plan = Arc::new(ResumePlan::build(input.partitions(), &pairs, config).await?);
    let schema = parquet_io::read_schema(&input.partition_file(&input.partitions()[0].pixel()))?;

    let mapping_tasks_run = run_mapping_phase(&input, &pairs, &plan, config).await?;
    let reducing_tasks_run = run_reducing_phase(&pairs, &plan, config, schema.clone()).await?;
    let (partitions, total_rows) = finalize(&input, &plan, config, schema).await?;

    Ok(RunSummary {
        mapping_tasks_run,
        reducing_tasks_run,
        partitions,
        total_rows,
        already_complete: false,
    })
}

/// Submit every remaining mapping key and block until the batch resolves
///
/// Returns the number of tasks actually executed.
pub async fn run_mapping_phase(
    input: &Catalog,
    pairs: &Arc<MarginPairTable>,
    plan: &Arc<ResumePlan>,
    config: &MarginCacheConfig,
) -> MarginResult<usize> {
    let remaining = plan.remaining_map_keys();
    if remaining.is_empty() {
        info!("Mapping phase already complete, skipping");
        return Ok(0);
    }
    info!(
        "Mapping phase: {} of {} partitions remaining",
        remaining.len(),
        plan.mapping_total()
    );

    let progress = ProgressScope::new(plan.mapping_total() as u64, "Mapping");
    progress.inc((plan.mapping_total() - remaining.len()) as u64);

    let pool = WorkerPool::new(config.max_workers);
    let shards_dir = config.shards_path();
    let mut handles = Vec::with_capacity(remaining.len());
    for item in remaining {
        let task = MapperTask {
            partition_file: input.partition_file(&item.pixel),
            mapping_key: item.key.clone(),
            source_pixel: item.pixel,
            pairs: pairs.clone(),
            margin_threshold_arcsec: config.margin_threshold_arcsec,
            fine_filtering: config.fine_filtering,
            ra_column: config.ra_column.clone(),
            dec_column: config.dec_column.clone(),
            shards_dir: shards_dir.clone(),
        };
        let plan = plan.clone();
        handles.push(
            pool.spawn(async move {
                let shards = map_pixel_shards(&task)?;
                plan.mark_map_done(&task.mapping_key, shards).await
            })
            .await,
        );
    }

    let results = plan.wait_for_mapping(handles, &progress).await?;
    Ok(results.len())
}

/// Submit every remaining reducing key and block until the batch resolves
pub async fn run_reducing_phase(
    pairs: &Arc<MarginPairTable>,
    plan: &Arc<ResumePlan>,
    config: &MarginCacheConfig,
    schema: SchemaRef,
) -> MarginResult<usize> {
    let remaining = plan.remaining_reduce_keys();
    if remaining.is_empty() {
        info!("Reducing phase already complete, skipping");
        return Ok(0);
    }
    info!(
        "Reducing phase: {} of {} output pixels remaining",
        remaining.len(),
        plan.reducing_total()
    );

    let shard_index = plan.shard_index().await?;
    let centers = pairs.target_centers();

    let progress = ProgressScope::new(plan.reducing_total() as u64, "Reducing");
    progress.inc((plan.reducing_total() - remaining.len()) as u64);

    let pool = WorkerPool::new(config.max_workers);
    let mut handles = Vec::with_capacity(remaining.len());
    for item in remaining {
        let center = centers
            .get(&item.pixel)
            .copied()
            .ok_or_else(|| MarginError::PlanCorrupted {
                path: plan.base_dir().join(crate::plan::PLAN_FILE),
                details: format!("reducing key {} has no pair-table target", item.key),
            })?;
        let task = ReducerTask {
            reducing_key: item.key.clone(),
            target_pixel: item.pixel,
            target_center: center,
            shards: shard_index.get(&item.pixel).cloned().unwrap_or_default(),
            output_catalog_path: config.output_catalog_path.clone(),
            schema: schema.clone(),
            margin_threshold_arcsec: config.margin_threshold_arcsec,
            apply_fine_filter: config.fine_filtering,
            ra_column: config.ra_column.clone(),
            dec_column: config.dec_column.clone(),
            id_column: config.id_column.clone(),
            delete_intermediate_parquet_files: config.delete_intermediate_parquet_files,
        };
        let plan = plan.clone();
        handles.push(
            pool.spawn(async move {
                let rows = reduce_margin_shards(&task)?;
                plan.mark_reduce_done(&task.reducing_key, rows).await
            })
            .await,
        );
    }

    let results = plan.wait_for_reducing(handles, &progress).await?;
    Ok(results.len())
}

/// Write aggregate metadata and clean up the intermediate directory
pub async fn finalize(
    input: &Catalog,
    plan: &Arc<ResumePlan>,
    config: &MarginCacheConfig,
    schema: SchemaRef,
) -> MarginResult<(usize, u64)> {
    let progress = ProgressScope::new(5, "Finalizing");
    let output_root = &config.output_catalog_path;

    let targets = plan.reducing_pixels();
    let stats = metadata::collect_partition_stats(output_root, &targets)?;
    let total_rows: u64 = stats.iter().map(|s| s.num_rows).sum();

    metadata::write_parquet_metadata(output_root, schema, total_rows, stats.len())?;
    progress.inc(1);

    metadata::write_partition_info(output_root, &stats).await?;
    progress.inc(1);

    metadata::write_provenance(output_root, config, total_rows, stats.len()).await?;
    progress.inc(1);

    metadata::write_catalog_info(output_root, &input.info().catalog_name, config, total_rows)
        .await?;
    progress.inc(1);

    let intermediate = config.intermediate_path();
    if intermediate.exists() {
        tokio::fs::remove_dir_all(&intermediate)
            .await
            .map_err(|e| MarginError::io(&intermediate, "remove", e))?;
    }
    progress.inc(1);

    Ok((stats.len(), total_rows))
}

/// Summary for a catalog some earlier run already finalized
async fn completed_summary(config: &MarginCacheConfig) -> MarginResult<RunSummary> {
    let info: MarginCatalogInfo = fsio::read_json(
        &config
            .output_catalog_path
            .join(catalog::CATALOG_INFO_FILE),
    )
    .await?;
    let partitions = catalog::read_partition_info(
        &config
            .output_catalog_path
            .join(catalog::PARTITION_INFO_FILE),
    )?;
    Ok(RunSummary {
        mapping_tasks_run: 0,
        reducing_tasks_run: 0,
        partitions: partitions.len(),
        total_rows: info.total_rows,
        already_complete: true,
    })
}
