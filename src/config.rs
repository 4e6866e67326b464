use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::detector::ModelPaths;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Precomputed statistics trace to replay.
    pub trace: PathBuf,

    /// Ground-truth label file, one integer per packet.
    pub labels: PathBuf,

    /// Name of the attack the trace carries; used in output file names.
    #[serde(default = "default_attack")]
    pub attack: String,

    /// Execution-phase sampling rate: every Nth dataplane packet reaches
    /// the detector.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u64,

    /// Sample the training phase at the same rate.
    #[serde(default)]
    pub train_sampling: bool,

    /// Packet-number offset applied to label lookups once the execution
    /// phase starts.
    #[serde(default)]
    pub exec_sample_offset: u64,

    /// Packets reserved for the detector's feature-mapper construction.
    #[serde(default = "default_fm_grace")]
    pub fm_grace: u64,

    /// Packets reserved for detector training before threshold
    /// calibration.
    #[serde(default = "default_ad_grace")]
    pub ad_grace: u64,

    /// Maximum ensemble member size handed to the detector.
    #[serde(default = "default_max_ensemble_size")]
    pub max_ensemble_size: usize,

    /// Fraction of the training phase computed on the exact path, in
    /// [0, 1].
    #[serde(default)]
    pub train_exact_ratio: f64,

    /// Use the exact computation path outside the exact-training window
    /// too.
    #[serde(default)]
    pub exact_stats: bool,

    /// Compare score and threshold as truncated integers instead of
    /// floats when timing detection.
    #[serde(default)]
    pub integer_threshold: bool,

    /// Keep every 80-dim input vector and dump them to a CSV.
    #[serde(default)]
    pub save_stats_global: bool,

    /// Export detector parameters at the training boundary.
    #[serde(default)]
    pub save_spatial: bool,

    /// Warm-start model locations.
    #[serde(default)]
    pub model: ModelPaths,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sampling_rate == 0 {
            anyhow::bail!("sampling_rate must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.train_exact_ratio) {
            anyhow::bail!(
                "train_exact_ratio must be within [0, 1], got {}",
                self.train_exact_ratio
            );
        }
        Ok(())
    }

    /// Combined training grace period.
    pub fn train_grace(&self) -> u64 {
        self.fm_grace + self.ad_grace
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace: PathBuf::from("trace-stats.csv"),
            labels: PathBuf::from("trace-labels.csv"),
            attack: default_attack(),
            sampling_rate: default_sampling_rate(),
            train_sampling: false,
            exec_sample_offset: 0,
            fm_grace: default_fm_grace(),
            ad_grace: default_ad_grace(),
            max_ensemble_size: default_max_ensemble_size(),
            train_exact_ratio: 0.0,
            exact_stats: false,
            integer_threshold: false,
            save_stats_global: false,
            save_spatial: false,
            model: ModelPaths::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for evaluation CSVs and reports.
    #[serde(default = "default_eval_dir")]
    pub eval_dir: PathBuf,

    /// Directory for training snapshots and exported models.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            eval_dir: default_eval_dir(),
            model_dir: default_model_dir(),
        }
    }
}

// Default value functions
fn default_attack() -> String {
    "none".to_string()
}

fn default_sampling_rate() -> u64 {
    1024
}

fn default_fm_grace() -> u64 {
    100_000
}

fn default_ad_grace() -> u64 {
    100_000
}

fn default_max_ensemble_size() -> usize {
    10
}

fn default_eval_dir() -> PathBuf {
    PathBuf::from("eval")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
