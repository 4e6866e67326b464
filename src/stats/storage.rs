//! Snapshot persistence for the statistic store
//!
//! Versioned bincode file holding the four maps in fixed order, with a JSON
//! metadata sidecar. The format is a strict round-trip of the in-memory
//! values; restored floats are bit-identical.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::store::StatsSnapshot;
use crate::error::{PeregrineError, Result};

/// Current on-disk snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk layout: version header followed by the four maps in feature
/// order (mac_ip_src, ip_src, ip, five_t).
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    snapshot: StatsSnapshot,
}

/// Metadata sidecar describing a stored snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Tracked keys per granularity, in feature order.
    pub key_counts: [usize; 4],
    /// Attack label the run was configured with.
    pub attack: String,
}

/// Snapshot storage manager for training statistics.
pub struct StatsStorage {
    data_dir: PathBuf,
}

impl StatsStorage {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn snapshot_path(&self, attack: &str, max_ae: usize, ratio: f64) -> PathBuf {
        self.data_dir
            .join(format!("{}-m-{}-r-{}-train-stats.bin", attack, max_ae, ratio))
    }

    fn metadata_path(&self, attack: &str, max_ae: usize, ratio: f64) -> PathBuf {
        self.data_dir
            .join(format!("{}-m-{}-r-{}-train-stats.json", attack, max_ae, ratio))
    }

    /// Persist a snapshot at a phase boundary. The file handle is scoped
    /// and flushed before return on every path.
    pub fn save(
        &self,
        snapshot: &StatsSnapshot,
        attack: &str,
        max_ae: usize,
        ratio: f64,
    ) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;

        let path = self.snapshot_path(attack, max_ae, ratio);
        {
            let file = File::create(&path)?;
            let mut writer = BufWriter::new(file);
            let payload = SnapshotFile {
                version: SNAPSHOT_VERSION,
                snapshot: snapshot.clone(),
            };
            bincode::serialize_into(&mut writer, &payload)
                .map_err(|e| PeregrineError::Snapshot(e.to_string()))?;
            writer.flush()?;
        }

        let metadata = SnapshotMetadata {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            key_counts: [
                snapshot.mac_ip_src.len(),
                snapshot.ip_src.len(),
                snapshot.ip.len(),
                snapshot.five_t.len(),
            ],
            attack: attack.to_string(),
        };
        fs::write(
            self.metadata_path(attack, max_ae, ratio),
            serde_json::to_string_pretty(&metadata)
                .map_err(|e| PeregrineError::Snapshot(e.to_string()))?,
        )?;

        info!(
            "Saved training stats snapshot ({} keys) to {:?}",
            metadata.key_counts.iter().sum::<usize>(),
            path
        );
        Ok(())
    }

    /// Load a snapshot from an explicit path (warm start).
    pub fn load_path<P: AsRef<Path>>(path: P) -> Result<StatsSnapshot> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let payload: SnapshotFile = bincode::deserialize_from(reader)
            .map_err(|e| PeregrineError::Snapshot(e.to_string()))?;

        if payload.version != SNAPSHOT_VERSION {
            return Err(PeregrineError::Snapshot(format!(
                "unsupported snapshot version {} in {:?}",
                payload.version, path
            )));
        }

        debug!("Loaded training stats snapshot from {:?}", path);
        Ok(payload.snapshot)
    }

    /// Load the snapshot this storage would have written for a run.
    pub fn load(&self, attack: &str, max_ae: usize, ratio: f64) -> Result<StatsSnapshot> {
        Self::load_path(self.snapshot_path(attack, max_ae, ratio))
    }

    pub fn metadata(&self, attack: &str, max_ae: usize, ratio: f64) -> Result<SnapshotMetadata> {
        let content = fs::read_to_string(self.metadata_path(attack, max_ae, ratio))?;
        serde_json::from_str(&content).map_err(|e| PeregrineError::Snapshot(e.to_string()))
    }
}
