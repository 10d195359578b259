//! Input catalog discovery
//!
//! A catalog root carries `catalog_info.json` (descriptor) and
//! `partition_info.csv` (pixel -> partition listing). Partition files are
//! never opened here; the mapper reads them lazily so a resumed run pays
//! nothing for partitions whose work is already done.

use crate::error::{MarginError, MarginResult};
use crate::fsio;
use crate::pixel::HealpixPixel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CATALOG_INFO_FILE: &str = "catalog_info.json";
pub const PARTITION_INFO_FILE: &str = "partition_info.csv";

/// Catalog descriptor stored at the catalog root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogInfo {
    pub catalog_name: String,
    pub catalog_type: String,
    pub total_rows: u64,
}

/// One row of `partition_info.csv`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionRecord {
    #[serde(rename = "Norder")]
    pub norder: u8,
    #[serde(rename = "Dir")]
    pub dir: u64,
    #[serde(rename = "Npix")]
    pub npix: u64,
    pub num_rows: u64,
}

impl PartitionRecord {
    pub fn pixel(&self) -> HealpixPixel {
        HealpixPixel::new(self.norder, self.npix)
    }
}

/// Read-only view of a partitioned catalog on disk
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    info: CatalogInfo,
    partitions: Vec<PartitionRecord>,
}

impl Catalog {
    /// Open a catalog root, reading its descriptor and partition listing
    pub async fn open(root: &Path) -> MarginResult<Self> {
        let info_path = root.join(CATALOG_INFO_FILE);
        if !info_path.exists() {
            return Err(MarginError::InvalidCatalog {
                path: root.to_path_buf(),
                details: format!("{} not found", CATALOG_INFO_FILE),
            });
        }
        let info: CatalogInfo = fsio::read_json(&info_path).await?;

        let partitions = read_partition_info(&root.join(PARTITION_INFO_FILE))?;
        if partitions.is_empty() {
            return Err(MarginError::InvalidCatalog {
                path: root.to_path_buf(),
                details: "partition listing is empty".to_string(),
            });
        }

        info!(
            "Opened catalog {} at {} ({} partitions, {} rows)",
            info.catalog_name,
            root.display(),
            partitions.len(),
            info.total_rows
        );

        Ok(Self {
            root: root.to_path_buf(),
            info,
            partitions,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn info(&self) -> &CatalogInfo {
        &self.info
    }

    /// Partition listing, ordered by `(order, pixel)`
    pub fn partitions(&self) -> &[PartitionRecord] {
        &self.partitions
    }

    /// Absolute path of one partition's parquet file
    pub fn partition_file(&self, pixel: &HealpixPixel) -> PathBuf {
        self.root.join(pixel.partition_path())
    }

    /// Finest partitioning order present in the catalog
    pub fn max_order(&self) -> u8 {
        self.partitions
            .iter()
            .map(|p| p.norder)
            .max()
            .unwrap_or(0)
    }
}

/// Read a `partition_info.csv` listing, sorted by `(order, pixel)`
pub fn read_partition_info(path: &Path) -> MarginResult<Vec<PartitionRecord>> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| MarginError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    let mut partitions = Vec::new();
    for result in reader.deserialize::<PartitionRecord>() {
        partitions.push(result.map_err(|source| MarginError::Csv {
            path: path.to_path_buf(),
            source,
        })?);
    }
    partitions.sort_by_key(|p| p.pixel());
    Ok(partitions)
}

/// Write a `partition_info.csv` listing atomically
pub async fn write_partition_info(
    path: &Path,
    partitions: &[PartitionRecord],
) -> MarginResult<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in partitions {
        writer
            .serialize(record)
            .map_err(|source| MarginError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
    }
    let bytes = writer.into_inner().map_err(|e| MarginError::Csv {
        path: path.to_path_buf(),
        source: e.into_error().into(),
    })?;
    let contents = String::from_utf8_lossy(&bytes).into_owned();
    fsio::write_string_atomic(path, &contents).await
}
