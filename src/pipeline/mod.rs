//! Detection pipeline
//!
//! Drives the per-packet control loop: phase transitions between exact
//! training, approximate training and execution, the execution-phase
//! sampling gate, threshold calibration at the end of training, and the
//! attack-detection-latency instrumentation. One pipeline instance owns
//! the statistic store and run state for exactly one run; the loop is
//! fully synchronous.

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::detector::AnomalyDetector;
use crate::error::{PeregrineError, Result};
use crate::eval::{append_stats_global, EvalRecord};
use crate::labels::TraceLabels;
use crate::source::{ComputeMode, FeatureOutcome, FeatureSource, PacketFeatureRecord};
use crate::stats::{derive_keys, FlowStatsStore, StatsStorage};

/// Input vectors buffered before each global-stats CSV append.
const STATS_GLOBAL_BATCH: usize = 10_000;

/// Pipeline phases. Transitions are one-directional; execution is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ExactTraining,
    ApproxTraining,
    Execution,
}

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Input fully consumed; end-of-run state was persisted.
    TraceEnd,
    /// Capture source timed out; terminal but reported as a normal stop.
    Timeout,
}

/// Mutable run-level state, created once per run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Calibrated anomaly threshold; 0 until the training boundary.
    pub threshold: f64,
    /// Dataplane-rate packet counter, execution phase only.
    pub global_packet_count: u64,
    /// Packets consumed but never handed to the detector (sentinels,
    /// training-phase sampling).
    pub skipped_packets: u64,
    /// Label-index offset; 0 during training, `exec_sample_offset` after.
    pub label_offset: u64,
    /// Timestamp of the first attack-labeled packet; 0 until seen.
    pub attack_init_ts: f64,
    /// Control-plane attack packet counter; -1 once detection froze it.
    pub attack_pkt_counter: i64,
    /// Dataplane-rate attack packet counter (includes sampled-out
    /// packets); -1 once frozen.
    pub attack_pkt_counter_dp: i64,
    /// Trace time from attack start to first detection; -1 until set.
    pub detection_init_time: f64,
    pub detection_init_pkt_count: i64,
    pub detection_init_pkt_count_dp: i64,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            global_packet_count: 0,
            skipped_packets: 0,
            label_offset: 0,
            attack_init_ts: 0.0,
            attack_pkt_counter: 0,
            attack_pkt_counter_dp: 0,
            detection_init_time: -1.0,
            detection_init_pkt_count: -1,
            detection_init_pkt_count_dp: -1,
        }
    }
}

/// Everything a run produces, returned to the caller for evaluation.
#[derive(Debug)]
pub struct RunReport {
    /// Detector score per forwarded packet, in order.
    pub scores: Vec<f64>,
    /// One evaluation row per forwarded packet (minus dropped label
    /// misses).
    pub records: Vec<EvalRecord>,
    pub threshold: f64,
    pub train_skip: bool,
    pub stop: StopReason,
    pub state: PipelineState,
}

impl RunReport {
    /// Packets the detector actually saw.
    pub fn processed_count(&self) -> usize {
        self.scores.len()
    }
}

enum Step {
    Continue,
    Stop(StopReason),
}

/// The detection pipeline state machine.
pub struct DetectionPipeline<S: FeatureSource, D: AnomalyDetector> {
    config: Config,
    source: S,
    detector: D,
    labels: TraceLabels,
    store: FlowStatsStore,
    storage: StatsStorage,
    state: PipelineState,
    scores: Vec<f64>,
    records: Vec<EvalRecord>,
    stats_global: Vec<Vec<f64>>,
    train_skip: bool,
}

impl<S: FeatureSource, D: AnomalyDetector> DetectionPipeline<S, D> {
    /// Build a pipeline for one run. Decides cold vs warm start from the
    /// configured model paths; a partial warm-start path set is a config
    /// error, and a warm start restores the statistic maps wholesale
    /// before the first packet.
    pub fn new(config: Config, source: S, detector: D, labels: TraceLabels) -> Result<Self> {
        let train_skip = config.model.warm_start()?;
        let storage = StatsStorage::new(&config.output.model_dir);

        let mut store = FlowStatsStore::new();
        let mut state = PipelineState::default();

        if train_skip {
            let snapshot_path = config.model.train_stats.as_ref().ok_or_else(|| {
                PeregrineError::Config("warm start requires a train_stats path".into())
            })?;
            store.restore(StatsStorage::load_path(snapshot_path)?);
            state.label_offset = config.exec_sample_offset;
            info!("Warm start: skipping training phases");
        }

        Ok(Self {
            config,
            source,
            detector,
            labels,
            store,
            storage,
            state,
            scores: Vec::new(),
            records: Vec::new(),
            stats_global: Vec::new(),
            train_skip,
        })
    }

    /// Seed the threshold for a warm-started run; cold runs calibrate it
    /// at the training boundary instead.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.state.threshold = threshold;
        self
    }

    /// Packets handed to the detector so far; the phase clock. Sentinel
    /// and sampled-out packets do not advance it.
    fn processed_count(&self) -> u64 {
        self.scores.len() as u64
    }

    /// Trace position (0-based) of the most recently consumed packet,
    /// counting packets that were skipped past the detector.
    fn consumed_index(&self) -> usize {
        (self.scores.len() as u64 + self.state.skipped_packets).saturating_sub(1) as usize
    }

    /// Current phase, evaluated once per incoming packet.
    pub fn phase(&self) -> Phase {
        if self.train_skip {
            return Phase::Execution;
        }
        let train_grace = self.config.train_grace();
        let processed = self.processed_count();
        if (processed as f64) < self.config.train_exact_ratio * train_grace as f64 {
            Phase::ExactTraining
        } else if processed < train_grace {
            Phase::ApproxTraining
        } else {
            Phase::Execution
        }
    }

    fn compute_mode(&self, phase: Phase) -> ComputeMode {
        match phase {
            Phase::ExactTraining => ComputeMode::Exact,
            // exact_stats forces the exact path even in the nominally
            // approximate windows
            Phase::ApproxTraining | Phase::Execution => {
                if self.config.exact_stats {
                    ComputeMode::Exact
                } else {
                    ComputeMode::Approximate
                }
            }
        }
    }

    /// Run the loop to completion and hand back the report.
    pub fn run(mut self) -> Result<RunReport> {
        let trace_size = self.source.trace_size();
        let stop;

        loop {
            self.log_progress();
            let phase = self.phase();

            let outcome = match phase {
                Phase::ExactTraining | Phase::ApproxTraining => {
                    let outcome = self.fetch(phase)?;

                    // training-phase sampling consumes the packet but
                    // keeps it from the detector
                    if self.config.train_sampling
                        && matches!(outcome, FeatureOutcome::Record(_))
                        && (self.scores.len() as u64 + 1 + self.state.skipped_packets)
                            % self.config.sampling_rate
                            != 0
                    {
                        self.state.skipped_packets += 1;
                        continue;
                    }
                    outcome
                }
                Phase::Execution => {
                    self.state.global_packet_count += 1;

                    // stop instead of reading past the end of the input
                    if self.config.train_grace()
                        + self.state.global_packet_count
                        + self.config.exec_sample_offset
                        > trace_size
                    {
                        stop = StopReason::TraceEnd;
                        break;
                    }

                    // dataplane-rate attack counter runs ahead of the
                    // sampling gate
                    if self.state.attack_pkt_counter_dp != -1 && self.dp_label() == Some(1) {
                        self.state.attack_pkt_counter_dp += 1;
                    }

                    self.fetch(phase)?
                }
            };

            match outcome {
                FeatureOutcome::Timeout => {
                    warn!("Capture timeout, terminating run");
                    stop = StopReason::Timeout;
                    break;
                }
                FeatureOutcome::Exhausted => {
                    stop = StopReason::TraceEnd;
                    break;
                }
                FeatureOutcome::NotApplicable => {
                    self.state.skipped_packets += 1;
                    continue;
                }
                FeatureOutcome::Record(rec) => {
                    match self.handle_record(*rec, phase, trace_size)? {
                        Step::Continue => continue,
                        Step::Stop(reason) => {
                            stop = reason;
                            break;
                        }
                    }
                }
            }
        }

        self.dump_stats_global()?;

        Ok(RunReport {
            threshold: self.state.threshold,
            train_skip: self.train_skip,
            stop,
            scores: self.scores,
            records: self.records,
            state: self.state,
        })
    }

    /// Ask the source for the next packet. A timeout raised as an error
    /// is folded into the in-band outcome; both terminate the run as a
    /// normal stop, not a crash.
    fn fetch(&mut self, phase: Phase) -> Result<FeatureOutcome> {
        match self.source.next_record(self.compute_mode(phase)) {
            Err(PeregrineError::CaptureTimeout) => Ok(FeatureOutcome::Timeout),
            other => other,
        }
    }

    /// Process one retrieved record: sampling gate, statistics update,
    /// scoring, calibration, attack timing.
    fn handle_record(
        &mut self,
        rec: PacketFeatureRecord,
        phase: Phase,
        trace_size: u64,
    ) -> Result<Step> {
        let train_grace = self.config.train_grace();

        if train_grace + self.state.global_packet_count + self.config.exec_sample_offset
            > trace_size
        {
            return Ok(Step::Stop(StopReason::TraceEnd));
        }

        // execution-phase sampling gate; the counter stays 0 during
        // training, so training packets always pass
        if self.state.global_packet_count % self.config.sampling_rate != 0 {
            return Ok(Step::Continue);
        }

        let keys = derive_keys(&rec)?;
        let input = self.store.process_record(&keys, &rec)?;

        if self.config.save_stats_global {
            self.stats_global.push(input.to_vec());
            if self.stats_global.len() >= STATS_GLOBAL_BATCH {
                self.dump_stats_global()?;
            }
        }

        let rmse = self.detector.process(&input);
        self.scores.push(rmse);

        if phase != Phase::Execution {
            let index = self.consumed_index();
            if self.labels.get(index).ok() == Some(1) {
                error!("Attack-labeled packet at index {} during the training phase", index);
                return Err(PeregrineError::TrainingContamination);
            }
        }

        let dp_label = self.dp_label();

        if self.state.attack_init_ts == 0.0 && dp_label == Some(1) {
            info!("Trace attack: start");
            self.state.attack_init_ts = rec.ts;
            self.state.attack_pkt_counter += 1;
        }

        if self.exceeds_threshold(rmse)
            && self.state.attack_pkt_counter != -1
            && dp_label == Some(1)
        {
            self.state.detection_init_time = rec.ts - self.state.attack_init_ts;
            self.state.detection_init_pkt_count = self.state.attack_pkt_counter;
            self.state.detection_init_pkt_count_dp = self.state.attack_pkt_counter_dp;
            self.state.attack_pkt_counter = -1;
            self.state.attack_pkt_counter_dp = -1;
            info!(
                "Attack detected after {} attack packets ({} at dataplane rate)",
                self.state.detection_init_pkt_count, self.state.detection_init_pkt_count_dp
            );
        }

        if self.state.attack_pkt_counter != -1 && dp_label == Some(1) {
            self.state.attack_pkt_counter += 1;
        }

        match self.dp_label_checked() {
            Ok(label) => self.records.push(EvalRecord {
                mac_src: rec.mac_src.clone(),
                ip_src: rec.ip_src.clone(),
                ip_dst: rec.ip_dst.clone(),
                proto: rec.proto,
                src_port: rec.src_port,
                dst_port: rec.dst_port,
                rmse,
                label,
            }),
            Err(e) => warn!("{}; dropping evaluation record", e),
        }

        // threshold calibration, exactly once at the training boundary
        if !self.train_skip && self.processed_count() == train_grace {
            self.state.label_offset = self.config.exec_sample_offset;
            self.state.threshold = self
                .scores
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            self.save_train_state()?;
            info!(
                "Starting execution phase (threshold {})",
                self.state.threshold
            );
        } else if train_grace + self.state.global_packet_count + self.config.exec_sample_offset
            >= trace_size
        {
            return Ok(Step::Stop(StopReason::TraceEnd));
        }

        Ok(Step::Continue)
    }

    /// Score-vs-threshold comparison used for detection timing. The two
    /// historical pipeline variants disagree here; `integer_threshold`
    /// selects the truncating one.
    fn exceeds_threshold(&self, rmse: f64) -> bool {
        if self.config.integer_threshold {
            (rmse as i64) > (self.state.threshold as i64)
        } else {
            rmse > self.state.threshold
        }
    }

    /// Label index of the current packet at the dataplane's numbering:
    /// `train_grace + offset + global_packet_count`, 1-based.
    fn dp_label_index(&self) -> usize {
        ((self.config.train_grace() + self.state.label_offset + self.state.global_packet_count)
            as usize)
            .saturating_sub(1)
    }

    fn dp_label_checked(&self) -> Result<u8> {
        self.labels.get(self.dp_label_index())
    }

    /// Label lookup for the timing counters; a missing label is treated
    /// as benign so a short label file cannot abort the run here.
    fn dp_label(&self) -> Option<u8> {
        match self.labels.get(self.dp_label_index()) {
            Ok(label) => Some(label),
            Err(e) => {
                debug!("{}; treating as benign for attack timing", e);
                None
            }
        }
    }

    /// Phase-boundary persistence: statistics snapshot plus the optional
    /// detector parameter export.
    fn save_train_state(&mut self) -> Result<()> {
        self.storage.save(
            &self.store.snapshot(),
            &self.config.attack,
            self.config.max_ensemble_size,
            self.config.train_exact_ratio,
        )?;

        if self.config.save_spatial {
            if let Some(params) = self.detector.params() {
                let dir = self.config.output.model_dir.join(format!(
                    "spatial/{}-m-{}-r-{}",
                    self.config.attack, self.config.max_ensemble_size, self.config.train_exact_ratio
                ));
                params.export(dir)?;
            } else {
                debug!("Detector exposes no parameters; skipping spatial export");
            }
        }

        Ok(())
    }

    fn dump_stats_global(&mut self) -> Result<()> {
        if !self.config.save_stats_global || self.stats_global.is_empty() {
            return Ok(());
        }
        let path = self.config.output.eval_dir.join(format!(
            "{}-{}-stats.csv",
            self.config.attack, self.config.sampling_rate
        ));
        append_stats_global(&self.stats_global, path)?;
        self.stats_global.clear();
        Ok(())
    }

    fn log_progress(&self) {
        let train_grace = self.config.train_grace();
        if !self.train_skip {
            let processed = self.processed_count();
            if processed < train_grace {
                if processed > 0 && processed % 1000 == 0 {
                    info!("Processed packets: {}", processed);
                }
            } else if self.state.global_packet_count > 0
                && self.state.global_packet_count % 1000 == 0
            {
                info!(
                    "Processed packets: {}",
                    train_grace + self.state.global_packet_count
                );
            }
        } else if self.state.global_packet_count > 0 && self.state.global_packet_count % 1000 == 0 {
            info!(
                "Processed packets: {}",
                train_grace + self.state.global_packet_count
            );
        }
    }
}
