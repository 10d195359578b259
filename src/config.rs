//! Run configuration for margin-cache generation
//!
//! Every knob the orchestrator consumes lives here, together with the
//! validation rules and the fingerprint that ties a persisted resume plan
//! to the arguments that created it.

use crate::error::{MarginError, MarginResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directory under the intermediate path holding shard files
pub const SHARDS_DIR: &str = "shards";

/// Configuration surface consumed by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCacheConfig {
    /// Root of the source catalog
    pub input_catalog_path: PathBuf,
    /// Root of the margin catalog being produced
    pub output_catalog_path: PathBuf,
    /// Intermediate directory; defaults to `<output>/intermediate`
    pub tmp_path: Option<PathBuf>,
    /// Precomputed margin pair table CSV
    pub margin_pairs_path: PathBuf,
    /// Maximum distance from a partition boundary, arcseconds
    pub margin_threshold_arcsec: f64,
    /// Resolution used to bucket margin candidates
    pub margin_order: u8,
    /// Apply the exact distance check in the mapper instead of deferring
    /// it to the reducer
    pub fine_filtering: bool,
    pub ra_column: String,
    pub dec_column: String,
    /// Unique row identifier used for reduce-side deduplication
    pub id_column: String,
    pub delete_intermediate_parquet_files: bool,
    /// Worker pool size for each phase
    pub max_workers: usize,
    /// Discard any persisted plan state and start from scratch
    pub rebuild_plan: bool,
    /// Opaque options handed to the storage layer when reading input
    pub input_storage_options: BTreeMap<String, String>,
    /// Opaque options handed to the storage layer when writing output
    pub output_storage_options: BTreeMap<String, String>,
}

impl MarginCacheConfig {
    /// Intermediate directory for shards and resume-plan state
    pub fn intermediate_path(&self) -> PathBuf {
        self.tmp_path
            .clone()
            .unwrap_or_else(|| self.output_catalog_path.join("intermediate"))
    }

    pub fn shards_path(&self) -> PathBuf {
        self.intermediate_path().join(SHARDS_DIR)
    }

    /// Validate the configuration against the input catalog's
    /// partitioning order
    pub fn validate(&self, catalog_max_order: u8) -> MarginResult<()> {
        if !self.margin_threshold_arcsec.is_finite() || self.margin_threshold_arcsec <= 0.0 {
            return Err(MarginError::invalid_config(
                "margin_threshold_arcsec",
                format!("must be a positive number, got {}", self.margin_threshold_arcsec),
            ));
        }
        if self.margin_order < catalog_max_order {
            return Err(MarginError::invalid_config(
                "margin_order",
                format!(
                    "must be at least the catalog partitioning order {}, got {}",
                    catalog_max_order, self.margin_order
                ),
            ));
        }
        for (field, value) in [
            ("ra_column", &self.ra_column),
            ("dec_column", &self.dec_column),
            ("id_column", &self.id_column),
        ] {
            if value.trim().is_empty() {
                return Err(MarginError::invalid_config(field, "must not be empty"));
            }
        }
        if self.max_workers == 0 {
            return Err(MarginError::invalid_config(
                "max_workers",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Stable fingerprint over the inputs that determine the work-item
    /// sets; a resumed run with a different fingerprint must not reuse
    /// the persisted plan
    pub fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct Fingerprinted<'a> {
            input_catalog_path: &'a Path,
            margin_pairs_path: &'a Path,
            margin_threshold_arcsec: f64,
            margin_order: u8,
            fine_filtering: bool,
            ra_column: &'a str,
            dec_column: &'a str,
            id_column: &'a str,
        }

        let canonical = serde_json::to_string(&Fingerprinted {
            input_catalog_path: &self.input_catalog_path,
            margin_pairs_path: &self.margin_pairs_path,
            margin_threshold_arcsec: self.margin_threshold_arcsec,
            margin_order: self.margin_order,
            fine_filtering: self.fine_filtering,
            ra_column: &self.ra_column,
            dec_column: &self.dec_column,
            id_column: &self.id_column,
        })
        .expect("fingerprint struct serializes");

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
pub(crate) fn test_config(input: &Path, output: &Path, pairs: &Path) -> MarginCacheConfig {
    MarginCacheConfig {
        input_catalog_path: input.to_path_buf(),
        output_catalog_path: output.to_path_buf(),
        tmp_path: None,
        margin_pairs_path: pairs.to_path_buf(),
        margin_threshold_arcsec: 30.0,
        margin_order: 3,
        fine_filtering: false,
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
