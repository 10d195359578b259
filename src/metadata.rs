//! Finalization artifacts for the margin catalog
//!
//! Four discrete, independently idempotent write-replace steps: parquet
//! aggregate metadata, the partition listing, the provenance record, and
//! the catalog descriptor. The descriptor is written last and its
//! presence is what marks a catalog complete, so a crash anywhere in
//! finalization resumes by re-running the whole sequence without
//! corrupting earlier writes.

use crate::catalog::{PartitionRecord, CATALOG_INFO_FILE, PARTITION_INFO_FILE};
use crate::config::MarginCacheConfig;
use crate::error::MarginResult;
use crate::fsio;
use crate::parquet_io;
use crate::pixel::HealpixPixel;
use arrow::datatypes::SchemaRef;
use chrono::{DateTime, Utc};
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

pub const COMMON_METADATA_FILE: &str = "_common_metadata";
pub const METADATA_FILE: &str = "_metadata";
pub const PROVENANCE_FILE: &str = "provenance_info.json";

/// Descriptor of the generated margin catalog; written last
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCatalogInfo {
    pub catalog_name: String,
    pub catalog_type: String,
    pub primary_catalog: String,
    pub margin_threshold_arcsec: f64,
    pub total_rows: u64,
}

/// Run provenance record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceInfo {
    pub run_id: Uuid,
    pub tool_name: String,
    pub tool_version: String,
    pub generated_at: DateTime<Utc>,
    pub total_rows: u64,
    pub partition_count: usize,
    pub config: MarginCacheConfig,
}

/// Read per-partition row counts from the output partition footers
pub fn collect_partition_stats(
    output_root: &Path,
    targets: &[HealpixPixel],
) -> MarginResult<Vec<PartitionRecord>> {
    let mut stats = Vec::with_capacity(targets.len());
    for pixel in targets {
        let num_rows = parquet_io::read_num_rows(&output_root.join(pixel.partition_path()))?;
        stats.push(PartitionRecord {
            norder: pixel.order,
            dir: pixel.dir(),
            npix: pixel.pixel,
            num_rows,
        });
    }
    stats.sort_by_key(|s| s.pixel());
    Ok(stats)
}

/// Write `_common_metadata` and `_metadata`
///
/// Both are schema-only parquet files; `_metadata` additionally carries
/// the aggregate row and partition counts in its footer key-values.
pub fn write_parquet_metadata(
    output_root: &Path,
    schema: SchemaRef,
    total_rows: u64,
    partition_count: usize,
) -> MarginResult<()> {
    parquet_io::write_batches_atomic(
        &output_root.join(COMMON_METADATA_FILE),
        schema.clone(),
        &[],
        None,
    )?;
    let aggregate = vec![
        KeyValue {
            key: "total_rows".to_string(),
            value: Some(total_rows.to_string()),
        },
        KeyValue {
            key: "partition_count".to_string(),
            value: Some(partition_count.to_string()),
        },
    ];
    parquet_io::write_batches_atomic(
        &output_root.join(METADATA_FILE),
        schema,
        &[],
        Some(aggregate),
    )?;
    Ok(())
}

/// Write the partition listing for the margin catalog
pub async fn write_partition_info(
    output_root: &Path,
    stats: &[PartitionRecord],
) -> MarginResult<()> {
    crate::catalog::write_partition_info(&output_root.join(PARTITION_INFO_FILE), stats).await
}

/// Write the provenance record
pub async fn write_provenance(
    output_root: &Path,
    config: &MarginCacheConfig,
    total_rows: u64,
    partition_count: usize,
) -> MarginResult<()> {
    let provenance = ProvenanceInfo {
        run_id: Uuid::new_v4(),
        tool_name: env!("CARGO_PKG_NAME").to_string(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        generated_at: Utc::now(),
        total_rows,
        partition_count,
        config: config.clone(),
    };
    fsio::write_json_atomic(&output_root.join(PROVENANCE_FILE), &provenance).await
}

/// Write the catalog descriptor; the final finalization step
pub async fn write_catalog_info(
    output_root: &Path,
    primary_catalog: &str,
    config: &MarginCacheConfig,
    total_rows: u64,
) -> MarginResult<()> {
    let name = output_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{primary_catalog}_margin"));
    let info = MarginCatalogInfo {
        catalog_name: name,
        catalog_type: "margin".to_string(),
        primary_catalog: primary_catalog.to_string(),
        margin_threshold_arcsec: config.margin_threshold_arcsec,
        total_rows,
    };
    fsio::write_json_atomic(&output_root.join(CATALOG_INFO_FILE), &info).await?;
    info!(
        "Margin catalog {} finalized ({} rows)",
        output_root.display(),
        total_rows
    );
    Ok(())
}

/// True when a prior run already finalized this catalog
pub fn is_finalized(output_root: &Path) -> bool {
    output_root.join(CATALOG_INFO_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::parquet_io::test_support::{point_batch, point_schema};

    #[test]
    fn stats_come_from_partition_footers() {
        let dir = tempfile::tempdir().unwrap();
        let pixel_a = HealpixPixel::new(3, 4);
        let pixel_b = HealpixPixel::new(3, 5);
        parquet_io::write_batches_atomic(
            &dir.path().join(pixel_a.partition_path()),
            point_schema(),
            &[point_batch(&[(1, 10.0, 0.0), (2, 11.0, 0.0)])],
            None,
        )
        .unwrap();
        parquet_io::write_batches_atomic(
            &dir.path().join(pixel_b.partition_path()),
            point_schema(),
            &[],
            None,
        )
        .unwrap();

        let stats = collect_partition_stats(dir.path(), &[pixel_b, pixel_a]).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].npix, 4);
        assert_eq!(stats[0].num_rows, 2);
        assert_eq!(stats[1].npix, 5);
        assert_eq!(stats[1].num_rows, 0);
    }

    #[test]
    fn parquet_metadata_files_are_schema_only() {
        let dir = tempfile::tempdir().unwrap();
        write_parquet_metadata(dir.path(), point_schema(), 42, 3).unwrap();

        let common = dir.path().join(COMMON_METADATA_FILE);
        let metadata = dir.path().join(METADATA_FILE);
        assert_eq!(parquet_io::read_num_rows(&common).unwrap(), 0);
        assert_eq!(parquet_io::read_num_rows(&metadata).unwrap(), 0);
        assert_eq!(
            parquet_io::read_schema(&metadata).unwrap().fields().len(),
            point_schema().fields().len()
        );
    }

    #[tokio::test]
    async fn catalog_info_gates_finalization() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_finalized(dir.path()));

        let config = test_config(
            Path::new("/data/in"),
            dir.path(),
            Path::new("/data/pairs.csv"),
        );
        write_catalog_info(dir.path(), "small_sky", &config, 7)
            .await
            .unwrap();
        assert!(is_finalized(dir.path()));

        let info: MarginCatalogInfo =
            fsio::read_json(&dir.path().join(CATALOG_INFO_FILE)).await.unwrap();
        assert_eq!(info.catalog_type, "margin");
        assert_eq!(info.primary_catalog, "small_sky");
        assert_eq!(info.total_rows, 7);
    }

    #[tokio::test]
    async fn provenance_echoes_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            Path::new("/data/in"),
            dir.path(),
            Path::new("/data/pairs.csv"),
        );
        write_provenance(dir.path(), &config, 10, 2).await.unwrap();

        let provenance: ProvenanceInfo =
            fsio::read_json(&dir.path().join(PROVENANCE_FILE)).await.unwrap();
        assert_eq!(provenance.tool_name, "skymargin");
        assert_eq!(provenance.total_rows, 10);
        assert_eq!(provenance.config.margin_threshold_arcsec, 30.0);
    }
}
