//! Map phase: one source partition to per-target-pixel margin shards
//!
//! A mapper reads its whole partition, finds the candidate neighbor
//! pixels from the pair table, keeps every row whose margin predicate
//! passes for at least one candidate (a row near a corner may pass for
//! several), and writes one intermediate shard per contributing target.
//! Output is deterministic for a given partition and configuration, and
//! every shard write is atomic, so re-running a key is overwrite-safe.

use crate::error::{MarginError, MarginResult};
use crate::geometry::{self, MarginPairTable};
use crate::parquet_io;
use crate::pixel::HealpixPixel;
use crate::plan::{shard_file_name, ShardInfo};
use arrow::array::{Array, Float64Array, RecordBatch};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Inputs for one mapping work item
#[derive(Clone)]
pub struct MapperTask {
    pub partition_file: PathBuf,
    pub mapping_key: String,
    pub source_pixel: HealpixPixel,
    pub pairs: Arc<MarginPairTable>,
    pub margin_threshold_arcsec: f64,
    /// Apply the exact distance check instead of coarse-only bucketing
    pub fine_filtering: bool,
    pub ra_column: String,
    pub dec_column: String,
    pub shards_dir: PathBuf,
}

/// Compute margin rows for one source partition and write them as
/// per-target intermediate shards
///
/// Returns the shard descriptors for the DONE marker. Zero shards is a
/// valid terminal result for a partition with no boundary rows.
pub fn map_pixel_shards(task: &MapperTask) -> MarginResult<Vec<ShardInfo>> {
    let (schema, batches) = parquet_io::read_batches(&task.partition_file)?;

    let candidates = task.pairs.candidates(&task.source_pixel);
    if candidates.is_empty() {
        debug!(
            "Partition {} has no margin candidates, writing zero shards",
            task.source_pixel
        );
        return Ok(Vec::new());
    }

    // Per-target sub-batches, keyed deterministically
    let mut per_target: BTreeMap<HealpixPixel, Vec<RecordBatch>> = BTreeMap::new();
    let mut row_offset = 0usize;

    for batch in &batches {
        let coordinates = validate_coordinates(batch, task, row_offset)?;

        for candidate in candidates {
            let selected: Vec<u32> = coordinates
                .iter()
                .enumerate()
                .filter(|(_, &(ra, dec))| {
                    if task.fine_filtering {
                        geometry::in_fine_margin(ra, dec, candidate, task.margin_threshold_arcsec)
                    } else {
                        geometry::in_coarse_margin(ra, dec, candidate, task.margin_threshold_arcsec)
                    }
                })
                .map(|(i, _)| i as u32)
                .collect();

            if !selected.is_empty() {
                let taken = parquet_io::take_batch(batch, &selected)?;
                per_target.entry(candidate.pixel).or_default().push(taken);
            }
        }
        row_offset += batch.num_rows();
    }

    let mut shards = Vec::with_capacity(per_target.len());
    for (target, target_batches) in per_target {
        let merged = parquet_io::concat(&schema, &target_batches)?;
        let shard_path = task
            .shards_dir
            .join(shard_file_name(&task.mapping_key, &target));
        let num_rows = parquet_io::write_batches_atomic(&shard_path, schema.clone(), &[merged], None)?;
        trace!(
            "Shard {} carries {} rows for target {}",
            shard_path.display(),
            num_rows,
            target
        );
        shards.push(ShardInfo {
            path: shard_path,
            target,
            num_rows,
        });
    }

    debug!(
        "Mapped {} into {} shards ({} source rows)",
        task.source_pixel,
        shards.len(),
        row_offset
    );
    Ok(shards)
}

/// Pull validated `(ra, dec)` pairs out of one batch
///
/// Any null or non-finite coordinate fails the whole task; silently
/// dropping rows would leave a margin cache missing contributions.
fn validate_coordinates(
    batch: &RecordBatch,
    task: &MapperTask,
    row_offset: usize,
) -> MarginResult<Vec<(f64, f64)>> {
    let ra = coordinate_column(batch, &task.ra_column, &task.partition_file)?;
    let dec = coordinate_column(batch, &task.dec_column, &task.partition_file)?;

    let mut coordinates = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        for (column_name, array) in [(&task.ra_column, ra), (&task.dec_column, dec)] {
            if array.is_null(i) {
                return Err(MarginError::MalformedCoordinates {
                    path: task.partition_file.clone(),
                    row: row_offset + i,
                    details: format!("{column_name} is null"),
                });
            }
            if !array.value(i).is_finite() {
                return Err(MarginError::MalformedCoordinates {
                    path: task.partition_file.clone(),
                    row: row_offset + i,
                    details: format!("{column_name} is not finite"),
                });
            }
        }
        coordinates.push((ra.value(i), dec.value(i)));
    }
    Ok(coordinates)
}

fn coordinate_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    path: &Path,
) -> MarginResult<&'a Float64Array> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| MarginError::PartitionSchema {
            path: path.to_path_buf(),
            details: format!("column {name} not found"),
        })?;
    column
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| MarginError::PartitionSchema {
            path: path.to_path_buf(),
            details: format!(
                "column {name} has type {}, expected Float64",
                column.data_type()
            ),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parquet_io::test_support::{point_batch, point_schema};
    use arrow::array::{Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::io::Write;
    use std::sync::Arc as StdArc;

    /// Pair table with two order-3 candidates for source pixel (2, 0):
    /// one centered at (10, 0), one at (16, 0). Order-3 discs span about
    /// 4.1 degrees, so the two coarse buckets overlap around ra 13.
    fn pairs() -> StdArc<MarginPairTable> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "norder,npix,margin_order,margin_npix,margin_ra,margin_dec"
        )
        .unwrap();
        writeln!(file, "2,0,3,4,10.0,0.0").unwrap();
        writeln!(file, "2,0,3,5,16.0,0.0").unwrap();
        file.flush().unwrap();
        StdArc::new(MarginPairTable::load(file.path()).unwrap())
    }

    fn task(dir: &Path, fine: bool, pairs: StdArc<MarginPairTable>) -> MapperTask {
        MapperTask {
            partition_file: dir.join("Npix=0.parquet"),
            mapping_key: "map_2_0".to_string(),
            source_pixel: HealpixPixel::new(2, 0),
            pairs,
            margin_threshold_arcsec: 30.0,
            fine_filtering: fine,
            ra_column: "ra".to_string(),
            dec_column: "dec".to_string(),
            shards_dir: dir.join("shards"),
        }
    }

    fn write_partition(dir: &Path, rows: &[(i64, f64, f64)]) {
        parquet_io::write_batches_atomic(
            &dir.join("Npix=0.parquet"),
            point_schema(),
            &[point_batch(rows)],
            None,
        )
        .unwrap();
    }

    #[test]
    fn groups_rows_by_target_pixel() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(
            dir.path(),
            &[
                (1, 10.0, 0.0),  // inside candidate 4 only
                (2, 16.0, 0.0),  // inside candidate 5 only
                (3, 100.0, 40.0), // far from both
            ],
        );
        let shards = map_pixel_shards(&task(dir.path(), true, pairs())).unwrap();

        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].target, HealpixPixel::new(3, 4));
        assert_eq!(shards[0].num_rows, 1);
        assert_eq!(shards[1].target, HealpixPixel::new(3, 5));
        assert_eq!(shards[1].num_rows, 1);
        assert!(shards.iter().all(|s| s.path.exists()));
    }

    #[test]
    fn corner_rows_land_in_multiple_shards() {
        let dir = tempfile::tempdir().unwrap();
        // ra 13 sits between both centers, within both fine discs
        write_partition(dir.path(), &[(1, 13.0, 0.0)]);
        let shards = map_pixel_shards(&task(dir.path(), true, pairs())).unwrap();
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|s| s.num_rows == 1));
    }

    #[test]
    fn no_boundary_rows_is_zero_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), &[(1, 200.0, -60.0), (2, 220.0, -70.0)]);
        let shards = map_pixel_shards(&task(dir.path(), false, pairs())).unwrap();
        assert!(shards.is_empty());
    }

    #[test]
    fn coarse_keeps_rows_fine_rejects() {
        let dir = tempfile::tempdir().unwrap();
        // About 6 degrees from candidate 4's center: outside the fine
        // disc (~4.1 deg) but inside the coarse one (~8.3 deg)
        write_partition(dir.path(), &[(1, 4.0, 0.0)]);

        let coarse = map_pixel_shards(&task(dir.path(), false, pairs())).unwrap();
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].target, HealpixPixel::new(3, 4));

        let fine = map_pixel_shards(&task(dir.path(), true, pairs())).unwrap();
        assert!(fine.is_empty());
    }

    #[test]
    fn rerun_is_overwrite_safe_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), &[(1, 10.0, 0.0), (2, 13.0, 0.5)]);
        let first = map_pixel_shards(&task(dir.path(), true, pairs())).unwrap();
        let second = map_pixel_shards(&task(dir.path(), true, pairs())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn null_coordinate_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let schema = StdArc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("ra", DataType::Float64, true),
            Field::new("dec", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                StdArc::new(Int64Array::from(vec![1, 2])),
                StdArc::new(Float64Array::from(vec![Some(10.0), None])),
                StdArc::new(Float64Array::from(vec![0.0, 0.0])),
            ],
        )
        .unwrap();
        parquet_io::write_batches_atomic(&dir.path().join("Npix=0.parquet"), schema, &[batch], None)
            .unwrap();

        let err = map_pixel_shards(&task(dir.path(), false, pairs())).unwrap_err();
        match err {
            MarginError::MalformedCoordinates { row, .. } => assert_eq!(row, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_finite_coordinate_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), &[(1, f64::NAN, 0.0)]);
        let err = map_pixel_shards(&task(dir.path(), false, pairs())).unwrap_err();
        assert!(matches!(err, MarginError::MalformedCoordinates { .. }));
    }

    #[test]
    fn missing_coordinate_column_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), &[(1, 10.0, 0.0)]);
        let mut bad = task(dir.path(), false, pairs());
        bad.ra_column = "right_ascension".to_string();
        let err = map_pixel_shards(&bad).unwrap_err();
        assert!(matches!(err, MarginError::PartitionSchema { .. }));
    }
}
