//! Peregrine control plane
//!
//! Companion to a programmable switch that computes approximate per-flow
//! traffic statistics in hardware. The control plane mirrors those
//! statistics into decay-bucketed per-flow vectors, assembles an 80-dim
//! feature vector per sampled packet, scores it with an online anomaly
//! detector, and times detection against ground truth.
//!
//! The crate is organized around the per-packet loop:
//!
//! ```text
//! FeatureSource → PacketFeatureRecord → derive_keys → FlowStatsStore
//!     → feature vector → AnomalyDetector → DetectionPipeline bookkeeping
//! ```
//!
//! Capture, switch table programming, and the detector's internals stay
//! behind the [`source::FeatureSource`] and [`detector::AnomalyDetector`]
//! trait boundaries.

pub mod config;
pub mod detector;
pub mod error;
pub mod eval;
pub mod labels;
pub mod pipeline;
pub mod source;
pub mod stats;

use anyhow::Result;
use tracing::info;

use config::Config;
use detector::BaselineDetector;
use labels::TraceLabels;
use pipeline::{DetectionPipeline, RunReport};
use source::ReplaySource;

pub use pipeline::{Phase, PipelineState, StopReason};

/// Run one offline detection pass over a precomputed statistics trace,
/// using the statistical reference detector. Cold runs train and
/// calibrate; a complete warm-start model set skips training.
pub fn run_offline(config: Config) -> Result<RunReport> {
    let labels = TraceLabels::load(&config.labels)?;
    let source = ReplaySource::open(&config.trace)?;

    let detector = if config.model.warm_start()? {
        let path = config
            .model
            .el_model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("warm start requires an el_model path"))?;
        info!("Loading detector model from {:?}", path);
        BaselineDetector::load(path)?
    } else {
        BaselineDetector::new(config.fm_grace, config.ad_grace)
    };

    let pipeline = DetectionPipeline::new(config, source, detector, labels)?;
    let report = pipeline.run()?;

    info!(
        "Run complete: {} packets scored, threshold {}",
        report.processed_count(),
        report.threshold
    );
    Ok(report)
}
