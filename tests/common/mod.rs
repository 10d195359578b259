//! Shared fixtures for integration tests: scratch catalogs and pair tables

#![allow(dead_code)]

use arrow::array::{Array, Float64Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use skymargin::catalog::{self, CatalogInfo, PartitionRecord};
use skymargin::config::MarginCacheConfig;
use skymargin::fsio;
use skymargin::parquet_io;
use skymargin::pixel::HealpixPixel;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub fn point_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("ra", DataType::Float64, false),
        Field::new("dec", DataType::Float64, false),
        Field::new("mag", DataType::Float64, true),
    ]))
}

pub fn point_batch(rows: &[(i64, f64, f64)]) -> RecordBatch {
    let ids = Int64Array::from_iter_values(rows.iter().map(|r| r.0));
    let ras = Float64Array::from_iter_values(rows.iter().map(|r| r.1));
    let decs = Float64Array::from_iter_values(rows.iter().map(|r| r.2));
    let mags = Float64Array::from_iter_values(rows.iter().map(|r| r.0 as f64 / 10.0));
    RecordBatch::try_new(
        point_schema(),
        vec![
            Arc::new(ids),
            Arc::new(ras),
            Arc::new(decs),
            Arc::new(mags),
        ],
    )
    .unwrap()
}

/// Lay down a complete order-2 input catalog: partition files, listing
/// and descriptor
pub async fn build_input_catalog(root: &Path, partitions: &[(u64, Vec<(i64, f64, f64)>)]) {
    let mut records = Vec::new();
    for (npix, rows) in partitions {
        let pixel = HealpixPixel::new(2, *npix);
        parquet_io::write_batches_atomic(
            &root.join(pixel.partition_path()),
            point_schema(),
            &[point_batch(rows)],
            None,
        )
        .unwrap();
        records.push(PartitionRecord {
            norder: 2,
            dir: pixel.dir(),
            npix: *npix,
            num_rows: rows.len() as u64,
        });
    }
    let info = CatalogInfo {
        catalog_name: "small_sky".to_string(),
        catalog_type: "object".to_string(),
        total_rows: records.iter().map(|r| r.num_rows).sum(),
    };
    fsio::write_json_atomic(&root.join(catalog::CATALOG_INFO_FILE), &info)
        .await
        .unwrap();
    catalog::write_partition_info(&root.join(catalog::PARTITION_INFO_FILE), &records)
        .await
        .unwrap();
}

/// Write a margin pair table mapping order-2 sources to order-3 targets
pub fn write_pairs_csv(path: &Path, pairs: &[(u64, u64, f64, f64)]) {
    let mut contents =
        String::from("norder,npix,margin_order,margin_npix,margin_ra,margin_dec\n");
    for (source, target, ra, dec) in pairs {
        contents.push_str(&format!("2,{source},3,{target},{ra},{dec}\n"));
    }
    std::fs::write(path, contents).unwrap();
}

pub fn make_config(input: &Path, output: &Path, pairs: &Path) -> MarginCacheConfig {
    MarginCacheConfig {
        input_catalog_path: input.to_path_buf(),
        output_catalog_path: output.to_path_buf(),
        tmp_path: None,
        margin_pairs_path: pairs.to_path_buf(),
        margin_threshold_arcsec: 30.0,
        margin_order: 3,
        fine_filtering: true,
        ra_column: "ra".to_string(),
        dec_column: "dec".to_string(),
        id_column: "id".to_string(),
        delete_intermediate_parquet_files: true,
        max_workers: 2,
        rebuild_plan: false,
        input_storage_options: BTreeMap::new(),
        output_storage_options: BTreeMap::new(),
    }
}

/// Sorted row ids of one parquet file
pub fn read_ids_sorted(path: &Path) -> Vec<i64> {
    let (_, batches) = parquet_io::read_batches(path).unwrap();
    let mut ids: Vec<i64> = batches
        .iter()
        .flat_map(|batch| {
            let column = batch
                .column_by_name("id")
                .unwrap()
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            (0..column.len()).map(|i| column.value(i)).collect::<Vec<_>>()
        })
        .collect();
    ids.sort_unstable();
    ids
}
