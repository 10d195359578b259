//! Resume plan: the single source of truth for what work remains
//!
//! The plan is persisted as `plan.json` plus one marker file per completed
//! work item. A key counts as DONE exactly when its marker exists, and a
//! marker is only written (atomically) after the work item's artifacts are
//! durably on disk. Crashing between artifact and marker therefore re-runs
//! the item on resume, which is safe because mapper and reducer outputs
//! are overwrite-safe. Markers are independent files, so completions from
//! concurrent tasks never serialize on shared state.
//!
//! Mapping markers double as the shard index: each records the shard files
//! its mapper wrote, so reducers discover their inputs from the plan
//! instead of globbing the intermediate directory.

use crate::catalog::PartitionRecord;
use crate::config::MarginCacheConfig;
use crate::error::{MarginError, MarginResult};
use crate::fsio;
use crate::geometry::MarginPairTable;
use crate::pixel::{mapping_key, reducing_key, HealpixPixel};
use crate::progress::ProgressScope;
use crate::scheduler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const PLAN_FILE: &str = "plan.json";
const MAPPING_DIR: &str = "mapping";
const REDUCING_DIR: &str = "reducing";
const PLAN_VERSION: u32 = 1;

/// One work item of either phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,
    pub pixel: HealpixPixel,
}

/// One intermediate shard written by a mapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub path: PathBuf,
    pub target: HealpixPixel,
    pub num_rows: u64,
}

/// Persisted plan descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanState {
    version: u32,
    created_at: DateTime<Utc>,
    fingerprint: String,
    margin_pairs_path: PathBuf,
    mapping: Vec<WorkItem>,
    reducing: Vec<WorkItem>,
}

/// Marker recording a completed mapping key and the shards it produced
#[derive(Debug, Serialize, Deserialize)]
struct MappingDoneRecord {
    key: String,
    completed_at: DateTime<Utc>,
    shards: Vec<ShardInfo>,
}

/// Marker recording a completed reducing key
#[derive(Debug, Serialize, Deserialize)]
struct ReducingDoneRecord {
    key: String,
    completed_at: DateTime<Utc>,
    num_rows: u64,
}

/// Shard file name derivable from `(mapping_key, target_pixel)` alone
pub fn shard_file_name(mapping_key: &str, target: &HealpixPixel) -> String {
    format!(
        "{}__Norder={}_Npix={}.parquet",
        mapping_key, target.order, target.pixel
    )
}

/// Completion counts reported by [`ResumePlan::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStatus {
    pub mapping_done: usize,
    pub mapping_total: usize,
    pub reducing_done: usize,
    pub reducing_total: usize,
}

/// Persisted state machine tracking which work items are done
#[derive(Debug)]
pub struct ResumePlan {
    base_dir: PathBuf,
    state: PlanState,
}

impl ResumePlan {
    /// Build the plan for a run, or reload a compatible persisted one
    ///
    /// Key enumeration is deterministic given the same inputs: one
    /// mapping key per input partition, one reducing key per distinct
    /// margin target in the pair table. A persisted plan whose
    /// fingerprint does not match the current configuration is rejected
    /// rather than silently reused.
    pub async fn build(
        partitions: &[PartitionRecord],
        pairs: &MarginPairTable,
        config: &MarginCacheConfig,
    ) -> MarginResult<Self> {
        let base_dir = config.intermediate_path();
        let fingerprint = config.fingerprint();

        let mapping: Vec<WorkItem> = partitions
            .iter()
            .map(|p| {
                let pixel = p.pixel();
                WorkItem {
                    key: mapping_key(&pixel),
                    pixel,
                }
            })
            .collect();
        let reducing: Vec<WorkItem> = pairs
            .target_pixels()
            .into_iter()
            .map(|pixel| WorkItem {
                key: reducing_key(&pixel),
                pixel,
            })
            .collect();

        let plan_path = base_dir.join(PLAN_FILE);
        if plan_path.exists() {
            let persisted: PlanState =
                fsio::read_json(&plan_path)
                    .await
                    .map_err(|err| MarginError::PlanCorrupted {
                        path: plan_path.clone(),
                        details: err.to_string(),
                    })?;
            if persisted.fingerprint != fingerprint {
                return Err(MarginError::PlanCorrupted {
                    path: plan_path,
                    details: "configuration fingerprint mismatch; \
                              rerun with --rebuild-plan to start over"
                        .to_string(),
                });
            }
            info!(
                "Resuming plan from {} ({} mapping keys, {} reducing keys)",
                plan_path.display(),
                persisted.mapping.len(),
                persisted.reducing.len()
            );
            return Ok(Self {
                base_dir,
                state: persisted,
            });
        }

        let state = PlanState {
            version: PLAN_VERSION,
            created_at: Utc::now(),
            fingerprint,
            margin_pairs_path: pairs.path().to_path_buf(),
            mapping,
            reducing,
        };
        fsio::write_json_atomic(&plan_path, &state).await?;
        info!(
            "Created plan at {} ({} mapping keys, {} reducing keys)",
            plan_path.display(),
            state.mapping.len(),
            state.reducing.len()
        );
        Ok(Self { base_dir, state })
    }

    /// Load a persisted plan for inspection, without rebuilding key sets
    pub async fn load(base_dir: &Path) -> MarginResult<Self> {
        let plan_path = base_dir.join(PLAN_FILE);
        let state: PlanState =
            fsio::read_json(&plan_path)
                .await
                .map_err(|err| MarginError::PlanCorrupted {
                    path: plan_path,
                    details: err.to_string(),
                })?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            state,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Completion counts for both phases
    pub fn status(&self) -> PlanStatus {
        PlanStatus {
            mapping_done: self.mapping_total() - self.remaining_map_keys().len(),
            mapping_total: self.mapping_total(),
            reducing_done: self.reducing_total() - self.remaining_reduce_keys().len(),
            reducing_total: self.reducing_total(),
        }
    }

    fn mapping_marker(&self, key: &str) -> PathBuf {
        self.base_dir.join(MAPPING_DIR).join(format!("{key}.done"))
    }

    fn reducing_marker(&self, key: &str) -> PathBuf {
        self.base_dir.join(REDUCING_DIR).join(format!("{key}.done"))
    }

    pub fn mapping_total(&self) -> usize {
        self.state.mapping.len()
    }

    /// Every output pixel of the run, in plan order
    pub fn reducing_pixels(&self) -> Vec<HealpixPixel> {
        self.state.reducing.iter().map(|item| item.pixel).collect()
    }

    pub fn reducing_total(&self) -> usize {
        self.state.reducing.len()
    }

    /// True iff every mapping key is marked DONE
    pub fn is_mapping_done(&self) -> bool {
        self.state
            .mapping
            .iter()
            .all(|item| self.mapping_marker(&item.key).exists())
    }

    /// True iff every reducing key is marked DONE
    pub fn is_reducing_done(&self) -> bool {
        self.state
            .reducing
            .iter()
            .all(|item| self.reducing_marker(&item.key).exists())
    }

    /// Mapping keys not yet DONE; safe to run in any order
    pub fn remaining_map_keys(&self) -> Vec<WorkItem> {
        self.state
            .mapping
            .iter()
            .filter(|item| !self.mapping_marker(&item.key).exists())
            .cloned()
            .collect()
    }

    /// Reducing keys not yet DONE; safe to run in any order
    pub fn remaining_reduce_keys(&self) -> Vec<WorkItem> {
        self.state
            .reducing
            .iter()
            .filter(|item| !self.reducing_marker(&item.key).exists())
            .cloned()
            .collect()
    }

    /// Mark one mapping key DONE, recording the shards it wrote
    ///
    /// Atomic and idempotent; call only after every listed shard is
    /// durably written.
    pub async fn mark_map_done(&self, key: &str, shards: Vec<ShardInfo>) -> MarginResult<()> {
        let record = MappingDoneRecord {
            key: key.to_string(),
            completed_at: Utc::now(),
            shards,
        };
        fsio::write_json_atomic(&self.mapping_marker(key), &record).await?;
        debug!("Marked mapping key {} done", key);
        Ok(())
    }

    /// Mark one reducing key DONE
    pub async fn mark_reduce_done(&self, key: &str, num_rows: u64) -> MarginResult<()> {
        let record = ReducingDoneRecord {
            key: key.to_string(),
            completed_at: Utc::now(),
            num_rows,
        };
        fsio::write_json_atomic(&self.reducing_marker(key), &record).await?;
        debug!("Marked reducing key {} done ({} rows)", key, num_rows);
        Ok(())
    }

    /// Assemble the target-pixel -> shard mapping from the mapping markers
    ///
    /// Only meaningful once mapping is complete; shards are ordered by
    /// path so reduce output is deterministic.
    pub async fn shard_index(&self) -> MarginResult<HashMap<HealpixPixel, Vec<ShardInfo>>> {
        let mut index: HashMap<HealpixPixel, Vec<ShardInfo>> = HashMap::new();
        for item in &self.state.mapping {
            let marker = self.mapping_marker(&item.key);
            let record: MappingDoneRecord = fsio::read_json(&marker).await?;
            for shard in record.shards {
                index.entry(shard.target).or_default().push(shard);
            }
        }
        for shards in index.values_mut() {
            shards.sort_by(|a, b| a.path.cmp(&b.path));
        }
        Ok(index)
    }

    /// Block until every submitted mapping future resolves, fail-fast
    pub async fn wait_for_mapping<T>(
        &self,
        handles: Vec<JoinHandle<MarginResult<T>>>,
        progress: &ProgressScope,
    ) -> MarginResult<Vec<T>> {
        scheduler::join_all_fail_fast(handles, || progress.inc(1)).await
    }

    /// Block until every submitted reducing future resolves, fail-fast
    pub async fn wait_for_reducing<T>(
        &self,
        handles: Vec<JoinHandle<MarginResult<T>>>,
        progress: &ProgressScope,
    ) -> MarginResult<Vec<T>> {
        scheduler::join_all_fail_fast(handles, || progress.inc(1)).await
    }
}
