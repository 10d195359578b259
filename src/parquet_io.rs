//! Shared Arrow/Parquet read and write helpers
//!
//! All partition and shard files go through these functions so the write
//! discipline is uniform: Snappy compression, a constant writer tag in the
//! footer, and tmp + rename so a crashed task never leaves a half-written
//! file under its final name.

use crate::error::{MarginError, MarginResult};
use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{concat_batches, take};
use arrow::datatypes::SchemaRef;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Footer tag identifying files written by this tool
const WRITER_TAG: &str = "skymargin";

fn writer_properties(extra_metadata: Option<Vec<KeyValue>>) -> WriterProperties {
    let mut metadata = vec![KeyValue {
        key: "written_by".to_string(),
        value: Some(WRITER_TAG.to_string()),
    }];
    if let Some(extra) = extra_metadata {
        metadata.extend(extra);
    }
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(metadata))
        .build()
}

/// Read every record batch of a parquet file
pub fn read_batches(path: &Path) -> MarginResult<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path).map_err(|e| MarginError::io(path, "open", e))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| MarginError::Parquet {
            path: path.to_path_buf(),
            source,
        })?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(|source| MarginError::Parquet {
        path: path.to_path_buf(),
        source,
    })?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|source| MarginError::Arrow {
            context: format!("reading {}", path.display()),
            source,
        })?);
    }
    Ok((schema, batches))
}

/// Read only the arrow schema from a parquet footer
pub fn read_schema(path: &Path) -> MarginResult<SchemaRef> {
    let file = File::open(path).map_err(|e| MarginError::io(path, "open", e))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| MarginError::Parquet {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(builder.schema().clone())
}

/// Row count from the parquet footer, without reading row data
pub fn read_num_rows(path: &Path) -> MarginResult<u64> {
    let file = File::open(path).map_err(|e| MarginError::io(path, "open", e))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| MarginError::Parquet {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(builder.metadata().file_metadata().num_rows().max(0) as u64)
}

/// Write record batches as one parquet file, atomically
///
/// The file is written next to its final location with a `.tmp` suffix
/// and renamed into place after a clean close, so rerunning a task is
/// overwrite-safe. Zero batches is valid and produces a schema-only file.
pub fn write_batches_atomic(
    path: &Path,
    schema: SchemaRef,
    batches: &[RecordBatch],
    extra_metadata: Option<Vec<KeyValue>>,
) -> MarginResult<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| MarginError::io(parent, "create", e))?;
    }

    let tmp_path = path.with_extension("parquet.tmp");
    let file = File::create(&tmp_path).map_err(|e| MarginError::io(&tmp_path, "create", e))?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(writer_properties(extra_metadata)))
        .map_err(|source| MarginError::Parquet {
            path: tmp_path.clone(),
            source,
        })?;

    let mut rows = 0u64;
    for batch in batches {
        rows += batch.num_rows() as u64;
        writer.write(batch).map_err(|source| MarginError::Parquet {
            path: tmp_path.clone(),
            source,
        })?;
    }
    writer.close().map_err(|source| MarginError::Parquet {
        path: tmp_path.clone(),
        source,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| MarginError::io(path, "rename", e))?;
    debug!("Wrote {} rows to {}", rows, path.display());
    Ok(rows)
}

/// Select rows of a batch by index, preserving order
pub fn take_batch(batch: &RecordBatch, indices: &[u32]) -> MarginResult<RecordBatch> {
    let index_array = UInt32Array::from(indices.to_vec());
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|column| {
            take(column.as_ref(), &index_array, None).map_err(|source| MarginError::Arrow {
                context: "taking rows by index".to_string(),
                source,
            })
        })
        .collect::<MarginResult<_>>()?;
    RecordBatch::try_new(batch.schema(), columns).map_err(|source| MarginError::Arrow {
        context: "rebuilding batch from taken columns".to_string(),
        source,
    })
}

/// Concatenate batches sharing a schema into one
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> MarginResult<RecordBatch> {
    concat_batches(schema, batches).map_err(|source| MarginError::Arrow {
        context: "concatenating record batches".to_string(),
        source,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{point_batch, point_schema};
    use super::*;
    use arrow::array::{Array, Int64Array};

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.parquet");
        let batch = point_batch(&[(1, 10.0, 0.0), (2, 11.0, 1.0)]);

        let rows = write_batches_atomic(&path, point_schema(), &[batch], None).unwrap();
        assert_eq!(rows, 2);
        assert!(!path.with_extension("parquet.tmp").exists());

        let (schema, batches) = read_batches(&path).unwrap();
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
        assert_eq!(read_num_rows(&path).unwrap(), 2);
    }

    #[test]
    fn schema_only_file_reads_back_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        let rows = write_batches_atomic(&path, point_schema(), &[], None).unwrap();
        assert_eq!(rows, 0);
        assert_eq!(read_num_rows(&path).unwrap(), 0);
        let schema = read_schema(&path).unwrap();
        assert_eq!(schema.fields().len(), 4);
    }

    #[test]
    fn take_batch_selects_in_order() {
        let batch = point_batch(&[(1, 10.0, 0.0), (2, 11.0, 1.0), (3, 12.0, 2.0)]);
        let taken = take_batch(&batch, &[2, 0]).unwrap();
        assert_eq!(taken.num_rows(), 2);
        let ids = taken
            .column_by_name("id")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.value(0), 3);
        assert_eq!(ids.value(1), 1);
    }

    #[test]
    fn overwrite_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.parquet");
        let first = point_batch(&[(1, 10.0, 0.0)]);
        write_batches_atomic(&path, point_schema(), &[first], None).unwrap();
        let second = point_batch(&[(7, 20.0, 5.0), (8, 21.0, 6.0)]);
        write_batches_atomic(&path, point_schema(), &[second], None).unwrap();
        assert_eq!(read_num_rows(&path).unwrap(), 2);
    }
}
