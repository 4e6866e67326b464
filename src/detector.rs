//! Anomaly detector boundary
//!
//! The pipeline treats the detector as an opaque scoring service: one call
//! per forwarded packet, an 80-dim feature vector in, a reconstruction-
//! error style score out. The detector handles its own feature-mapping and
//! training sub-phases internally. This module holds the trait, the
//! warm-start model path validation, the tabular parameter export, and a
//! statistical reference detector for offline runs and tests.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PeregrineError, Result};
use crate::stats::FEATURE_DIM;

/// Opaque per-packet scoring service. Higher scores imply more anomalous
/// input. Invocation is synchronous and CPU-bound; implementations must
/// not block on external resources.
pub trait AnomalyDetector {
    fn process(&mut self, features: &[f64; FEATURE_DIM]) -> f64;

    /// Exportable parameters, if the implementation has any. Defaults to
    /// none for detectors whose internals live elsewhere.
    fn params(&self) -> Option<DetectorParams> {
        None
    }
}

/// Warm-start model locations. A run either supplies none of them (cold
/// start) or all of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPaths {
    /// Feature-mapper model.
    pub fm_model: Option<PathBuf>,
    /// Ensemble layer model.
    pub el_model: Option<PathBuf>,
    /// Output layer model.
    pub ol_model: Option<PathBuf>,
    /// Training statistics snapshot.
    pub train_stats: Option<PathBuf>,
}

impl ModelPaths {
    /// Decide whether this run warm-starts. Any path present means warm
    /// start was requested, and then every path must exist and be
    /// readable; a partial set fails instead of silently cold-starting.
    pub fn warm_start(&self) -> Result<bool> {
        let paths = [
            ("fm_model", &self.fm_model),
            ("el_model", &self.el_model),
            ("ol_model", &self.ol_model),
            ("train_stats", &self.train_stats),
        ];

        if paths.iter().all(|(_, p)| p.is_none()) {
            return Ok(false);
        }

        for (name, path) in paths {
            match path {
                None => {
                    return Err(PeregrineError::Config(format!(
                        "warm start requested but {} is not set",
                        name
                    )))
                }
                Some(p) => {
                    File::open(p).map_err(|e| {
                        PeregrineError::Config(format!(
                            "warm start model {} unreadable at {:?}: {}",
                            name, p, e
                        ))
                    })?;
                }
            }
        }

        Ok(true)
    }
}

/// Parameters of one ensemble member (or the output layer).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberParams {
    /// Weight matrix, row-major.
    pub w: Vec<Vec<f64>>,
    pub hbias: Vec<f64>,
    pub vbias: Vec<f64>,
    pub norm_min: Vec<f64>,
    pub norm_max: Vec<f64>,
}

/// Exportable detector parameters: per-member tensors, the output layer,
/// and the ensemble map (which raw feature indices feed which member).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorParams {
    pub members: Vec<MemberParams>,
    pub output: MemberParams,
    pub feature_map: Vec<Vec<usize>>,
    pub hidden_ratio: f64,
}

impl DetectorParams {
    /// Write the parameters as headerless tabular files under `dir`, laid
    /// out as `params/L{i}_W.csv` etc., `norms/L{i}_NORM_{MIN,MAX}.csv`,
    /// and `maps/L{i}_MAP.csv` + `maps/L{i}_NEURONS.csv` + `maps/N_LAYERS.csv`.
    pub fn export<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let params_dir = dir.join("params");
        let norms_dir = dir.join("norms");
        let maps_dir = dir.join("maps");
        fs::create_dir_all(&params_dir)?;
        fs::create_dir_all(&norms_dir)?;
        fs::create_dir_all(&maps_dir)?;

        for (i, member) in self.members.iter().enumerate() {
            write_matrix(params_dir.join(format!("L{}_W.csv", i)), &member.w)?;
            write_column(params_dir.join(format!("L{}_B1.csv", i)), &member.hbias)?;
            write_column(params_dir.join(format!("L{}_B2.csv", i)), &member.vbias)?;
            write_column(norms_dir.join(format!("L{}_NORM_MIN.csv", i)), &member.norm_min)?;
            write_column(norms_dir.join(format!("L{}_NORM_MAX.csv", i)), &member.norm_max)?;
        }

        write_matrix(params_dir.join("OUTL_W.csv"), &self.output.w)?;
        write_column(params_dir.join("OUTL_B1.csv"), &self.output.hbias)?;
        write_column(params_dir.join("OUTL_B2.csv"), &self.output.vbias)?;
        write_column(norms_dir.join("OUTL_NORM_MIN.csv"), &self.output.norm_min)?;
        write_column(norms_dir.join("OUTL_NORM_MAX.csv"), &self.output.norm_max)?;

        for (i, map) in self.feature_map.iter().enumerate() {
            let row: Vec<String> = map.iter().map(|v| v.to_string()).collect();
            let mut file = BufWriter::new(File::create(maps_dir.join(format!("L{}_MAP.csv", i)))?);
            writeln!(file, "{}", row.join(","))?;
            file.flush()?;

            let neurons = (map.len() as f64 * self.hidden_ratio).ceil() as usize;
            let mut file =
                BufWriter::new(File::create(maps_dir.join(format!("L{}_NEURONS.csv", i)))?);
            writeln!(file, "{},{}", map.len(), neurons)?;
            file.flush()?;
        }

        let mut file = BufWriter::new(File::create(maps_dir.join("N_LAYERS.csv"))?);
        writeln!(file, "{}", self.feature_map.len())?;
        file.flush()?;

        info!("Exported detector parameters to {:?}", dir);
        Ok(())
    }
}

fn write_matrix(path: PathBuf, rows: &[Vec<f64>]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for row in rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(file, "{}", cells.join(","))?;
    }
    file.flush()?;
    Ok(())
}

fn write_column(path: PathBuf, values: &[f64]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for value in values {
        writeln!(file, "{}", value)?;
    }
    file.flush()?;
    Ok(())
}

/// Per-feature running statistics (Welford's online mean/variance).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FeatureStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl FeatureStats {
    fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::MAX,
            max: f64::MIN,
        }
    }

    #[inline]
    fn update(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    #[inline]
    fn std(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

/// Statistical reference detector.
///
/// Mirrors the detector's external contract: silent during the feature-
/// mapping grace period, trains and scores during the anomaly-detection
/// grace period, scores only afterwards. The score is the RMS z-score of
/// the input against the learned per-feature distribution. Stands in for
/// the ensemble service in offline runs; warm-startable through
/// save/load.
#[derive(Debug, Serialize, Deserialize)]
pub struct BaselineDetector {
    fm_grace: u64,
    ad_grace: u64,
    processed: u64,
    stats: Vec<FeatureStats>,
}

impl BaselineDetector {
    pub fn new(fm_grace: u64, ad_grace: u64) -> Self {
        Self {
            fm_grace,
            ad_grace,
            processed: 0,
            stats: (0..FEATURE_DIM).map(|_| FeatureStats::new()).collect(),
        }
    }

    fn score(&self, features: &[f64; FEATURE_DIM]) -> f64 {
        let mut sum_sq = 0.0;
        let mut counted = 0u32;

        for (value, stats) in features.iter().zip(&self.stats) {
            if stats.count < 2 {
                continue;
            }
            let std = stats.std();
            if std < f64::EPSILON {
                continue;
            }
            let z = (value - stats.mean) / std;
            sum_sq += z * z;
            counted += 1;
        }

        if counted == 0 {
            0.0
        } else {
            (sum_sq / counted as f64).sqrt()
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)
            .map_err(|e| PeregrineError::Snapshot(e.to_string()))?;
        writer.flush()?;
        debug!("Saved baseline detector to {:?}", path.as_ref());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        bincode::deserialize_from(reader).map_err(|e| PeregrineError::Snapshot(e.to_string()))
    }
}

impl AnomalyDetector for BaselineDetector {
    fn process(&mut self, features: &[f64; FEATURE_DIM]) -> f64 {
        self.processed += 1;

        if self.processed <= self.fm_grace {
            for (value, stats) in features.iter().zip(self.stats.iter_mut()) {
                stats.update(*value);
            }
            return 0.0;
        }

        if self.processed <= self.fm_grace + self.ad_grace {
            let score = self.score(features);
            for (value, stats) in features.iter().zip(self.stats.iter_mut()) {
                stats.update(*value);
            }
            return score;
        }

        self.score(features)
    }

    fn params(&self) -> Option<DetectorParams> {
        let norm_min: Vec<f64> = self.stats.iter().map(|s| s.min.min(0.0)).collect();
        let norm_max: Vec<f64> = self.stats.iter().map(|s| s.max.max(0.0)).collect();

        Some(DetectorParams {
            members: vec![MemberParams {
                w: Vec::new(),
                hbias: self.stats.iter().map(|s| s.mean).collect(),
                vbias: self.stats.iter().map(|s| s.std()).collect(),
                norm_min: norm_min.clone(),
                norm_max: norm_max.clone(),
            }],
            output: MemberParams {
                w: Vec::new(),
                hbias: Vec::new(),
                vbias: Vec::new(),
                norm_min,
                norm_max,
            },
            feature_map: vec![(0..FEATURE_DIM).collect()],
            hidden_ratio: 0.75,
        })
    }
}

/// Test detector returning a scripted score sequence.
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    scores: Vec<f64>,
    next: usize,
    pub inputs: Vec<[f64; FEATURE_DIM]>,
}

impl ScriptedDetector {
    pub fn new(scores: Vec<f64>) -> Self {
        Self {
            scores,
            next: 0,
            inputs: Vec::new(),
        }
    }
}

impl AnomalyDetector for ScriptedDetector {
    fn process(&mut self, features: &[f64; FEATURE_DIM]) -> f64 {
        self.inputs.push(*features);
        let score = self.scores.get(self.next).copied().unwrap_or(0.0);
        self.next += 1;
        score
    }
}
