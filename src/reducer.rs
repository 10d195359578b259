//! Reduce phase: assemble the final margin partition for one output pixel
//!
//! A reducer concatenates every shard addressed to its pixel, applies the
//! exact margin predicate when the mappers deferred it, collapses rows
//! emitted by more than one mapper (dedup key is the catalog identifier,
//! not full-row equality), and writes the output partition atomically.
//! An explicitly empty partition is a valid terminal state: it records
//! "no margin needed" as distinct from "not yet processed".

use crate::error::{MarginError, MarginResult};
use crate::geometry::{self, MarginCandidate};
use crate::parquet_io;
use crate::pixel::HealpixPixel;
use crate::plan::ShardInfo;
use arrow::array::{Array, Float64Array, Int64Array, RecordBatch};
use arrow::datatypes::SchemaRef;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, trace};

/// Inputs for one reducing work item
#[derive(Clone)]
pub struct ReducerTask {
    pub reducing_key: String,
    pub target_pixel: HealpixPixel,
    /// Center coordinates of the target pixel, degrees
    pub target_center: (f64, f64),
    /// Shards addressed to this pixel, from the plan's shard index
    pub shards: Vec<ShardInfo>,
    pub output_catalog_path: PathBuf,
    /// Catalog schema, used when zero shards exist for this pixel
    pub schema: SchemaRef,
    pub margin_threshold_arcsec: f64,
    /// Run the exact margin check before writing; a no-op when the
    /// mappers already filtered exactly, the last-chance filter when
    /// they ran coarse-only
    pub apply_fine_filter: bool,
    pub ra_column: String,
    pub dec_column: String,
    pub id_column: String,
    pub delete_intermediate_parquet_files: bool,
}

/// Merge, filter, deduplicate and write one output partition
///
/// Returns the number of rows written.
pub fn reduce_margin_shards(task: &ReducerTask) -> MarginResult<u64> {
    let output_path = task
        .output_catalog_path
        .join(task.target_pixel.partition_path());

    let mut shards = task.shards.clone();
    shards.sort_by(|a, b| a.path.cmp(&b.path));

    let mut batches = Vec::new();
    for shard in &shards {
        let (_, mut shard_batches) = parquet_io::read_batches(&shard.path)?;
        batches.append(&mut shard_batches);
    }

    if batches.is_empty() {
        let rows =
            parquet_io::write_batches_atomic(&output_path, task.schema.clone(), &[], None)?;
        debug!(
            "Wrote empty margin partition for {} (no contributing shards)",
            task.target_pixel
        );
        cleanup_shards(task, &shards);
        return Ok(rows);
    }

    let merged = parquet_io::concat(&task.schema, &batches)?;
    let filtered = if task.apply_fine_filter {
        fine_filter(task, &merged, &output_path)?
    } else {
        merged
    };
    let deduplicated = deduplicate_by_id(task, &filtered, &output_path)?;

    let rows = parquet_io::write_batches_atomic(
        &output_path,
        task.schema.clone(),
        &[deduplicated],
        None,
    )?;
    debug!(
        "Reduced {} shards into {} ({} rows)",
        shards.len(),
        output_path.display(),
        rows
    );

    cleanup_shards(task, &shards);
    Ok(rows)
}

/// Last-chance exact margin check, batched once per output pixel
fn fine_filter(
    task: &ReducerTask,
    batch: &RecordBatch,
    output_path: &std::path::Path,
) -> MarginResult<RecordBatch> {
    let candidate = MarginCandidate {
        pixel: task.target_pixel,
        center_ra: task.target_center.0,
        center_dec: task.target_center.1,
    };
    let ra = float_column(batch, &task.ra_column, output_path)?;
    let dec = float_column(batch, &task.dec_column, output_path)?;

    let keep: Vec<u32> = (0..batch.num_rows())
        .filter(|&i| {
            geometry::in_fine_margin(
                ra.value(i),
                dec.value(i),
                &candidate,
                task.margin_threshold_arcsec,
            )
        })
        .map(|i| i as u32)
        .collect();

    trace!(
        "Fine filter kept {}/{} rows for {}",
        keep.len(),
        batch.num_rows(),
        task.target_pixel
    );
    parquet_io::take_batch(batch, &keep)
}

/// Collapse duplicate contributions; first occurrence wins, order stable
fn deduplicate_by_id(
    task: &ReducerTask,
    batch: &RecordBatch,
    output_path: &std::path::Path,
) -> MarginResult<RecordBatch> {
    let ids = batch
        .column_by_name(&task.id_column)
        .ok_or_else(|| MarginError::PartitionSchema {
            path: output_path.to_path_buf(),
            details: format!("id column {} not found", task.id_column),
        })?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| MarginError::PartitionSchema {
            path: output_path.to_path_buf(),
            details: format!("id column {} must be Int64", task.id_column),
        })?;

    let mut seen = HashSet::with_capacity(batch.num_rows());
    let keep: Vec<u32> = (0..batch.num_rows())
        .filter(|&i| seen.insert(ids.value(i)))
        .map(|i| i as u32)
        .collect();

    if keep.len() == batch.num_rows() {
        return Ok(batch.clone());
    }
    trace!(
        "Deduplicated {} rows down to {} for {}",
        batch.num_rows(),
        keep.len(),
        task.target_pixel
    );
    parquet_io::take_batch(batch, &keep)
}

/// Best-effort shard cleanup after a successful reduce
///
/// A shard already removed by a previous partial run is not an error.
fn cleanup_shards(task: &ReducerTask, shards: &[ShardInfo]) {
    if !task.delete_intermediate_parquet_files {
        return;
    }
    for shard in shards {
        match std::fs::remove_file(&shard.path) {
            Ok(()) => trace!("Deleted consumed shard {}", shard.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(
                "Could not delete shard {}: {} (leaving it for finalization cleanup)",
                shard.path.display(),
                e
            ),
        }
    }
}

fn float_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    path: &std::path::Path,
) -> MarginResult<&'a Float64Array> {
    batch
        .column_by_name(name)
        .ok_or_else(|| MarginError::PartitionSchema {
            path: path.to_path_buf(),
            details: format!("column {name} not found"),
        })?
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| MarginError::PartitionSchema {
            path: path.to_path_buf(),
            details: format!("column {name} must be Float64"),
        })
}
