//! Run evaluation
//!
//! Per-packet evaluation records plus the confusion-matrix summary derived
//! from them. Ratio metrics with an empty denominator default to zero
//! instead of failing; that policy lives here, at the evaluation boundary,
//! not in the pipeline.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// One evaluation row: flow identifiers, detector score, ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRecord {
    pub mac_src: String,
    pub ip_src: String,
    pub ip_dst: String,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub rmse: f64,
    pub label: u8,
}

/// Confusion-matrix metrics over the execution-phase records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSummary {
    pub tp: u64,
    pub tn: u64,
    pub fp: u64,
    pub fn_: u64,
    pub tpr: f64,
    pub tnr: f64,
    pub fpr: f64,
    pub fnr: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub threshold: f64,
    pub detection_init_time: f64,
    pub detection_init_pkt_count: i64,
    pub detection_init_pkt_count_dp: i64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl EvalSummary {
    /// Compute the summary. Training rows (the first `train_grace` records)
    /// are cut unless the run warm-started; a record is an alert when its
    /// score reaches the calibrated threshold.
    pub fn compute(
        records: &[EvalRecord],
        threshold: f64,
        train_grace: u64,
        train_skip: bool,
        detection_init_time: f64,
        detection_init_pkt_count: i64,
        detection_init_pkt_count_dp: i64,
    ) -> Self {
        let cut = if train_skip {
            0
        } else {
            (train_grace as usize).min(records.len())
        };

        let mut summary = EvalSummary {
            threshold,
            detection_init_time,
            detection_init_pkt_count,
            detection_init_pkt_count_dp,
            ..Default::default()
        };

        for record in &records[cut..] {
            let alert = record.rmse >= threshold;
            match (alert, record.label) {
                (true, 1) => summary.tp += 1,
                (true, _) => summary.fp += 1,
                (false, 1) => summary.fn_ += 1,
                (false, _) => summary.tn += 1,
            }
        }

        summary.tpr = ratio(summary.tp, summary.tp + summary.fn_);
        summary.tnr = ratio(summary.tn, summary.tn + summary.fp);
        summary.fpr = ratio(summary.fp, summary.fp + summary.tn);
        summary.fnr = ratio(summary.fn_, summary.fn_ + summary.tp);
        summary.accuracy = ratio(
            summary.tp + summary.tn,
            summary.tp + summary.fp + summary.fn_ + summary.tn,
        );
        summary.precision = ratio(summary.tp, summary.tp + summary.fp);
        summary.recall = ratio(summary.tp, summary.tp + summary.fn_);
        summary.f1_score = if summary.recall + summary.precision == 0.0 {
            0.0
        } else {
            2.0 * (summary.recall * summary.precision) / (summary.recall + summary.precision)
        };

        summary
    }

    /// Append the human-readable metric lines to a text report.
    pub fn write_report<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_ref())?,
        );

        writeln!(file, "Threshold: {}", self.threshold)?;
        writeln!(
            file,
            "Time elapsed (trace) until detection: {}",
            self.detection_init_time
        )?;
        writeln!(
            file,
            "Number of attack packets until detection (CP): {}",
            self.detection_init_pkt_count
        )?;
        writeln!(
            file,
            "Number of attack packets until detection (DP): {}",
            self.detection_init_pkt_count_dp
        )?;
        writeln!(file, "TP: {}", self.tp)?;
        writeln!(file, "TN: {}", self.tn)?;
        writeln!(file, "FP: {}", self.fp)?;
        writeln!(file, "FN: {}", self.fn_)?;
        writeln!(file, "TPR: {}", self.tpr)?;
        writeln!(file, "TNR: {}", self.tnr)?;
        writeln!(file, "FPR: {}", self.fpr)?;
        writeln!(file, "FNR: {}", self.fnr)?;
        writeln!(file, "Accuracy: {}", self.accuracy)?;
        writeln!(file, "Precision: {}", self.precision)?;
        writeln!(file, "Recall: {}", self.recall)?;
        writeln!(file, "F1 Score: {}", self.f1_score)?;
        file.flush()?;

        info!("Wrote evaluation report to {:?}", path.as_ref());
        Ok(())
    }
}

/// Dump the per-packet evaluation rows as CSV.
pub fn write_eval_csv<P: AsRef<Path>>(records: &[EvalRecord], path: P) -> Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(File::create(path.as_ref())?);

    writeln!(file, "mac_src,ip_src,ip_dst,ip_type,src_proto,dst_proto,rmse,label")?;
    for r in records {
        writeln!(
            file,
            "{},{},{},{},{},{},{},{}",
            r.mac_src, r.ip_src, r.ip_dst, r.proto, r.src_port, r.dst_port, r.rmse, r.label
        )?;
    }
    file.flush()?;

    info!(
        "Wrote {} evaluation records to {:?}",
        records.len(),
        path.as_ref()
    );
    Ok(())
}

/// Append a batch of 80-dim input vectors to the global stats CSV.
pub fn append_stats_global<P: AsRef<Path>>(batch: &[Vec<f64>], path: P) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?,
    );
    for row in batch {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(file, "{}", cells.join(","))?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rmse: f64, label: u8) -> EvalRecord {
        EvalRecord {
            mac_src: "aa:bb:cc:dd:ee:ff".into(),
            ip_src: "10.0.0.1".into(),
            ip_dst: "10.0.0.2".into(),
            proto: 6,
            src_port: 1,
            dst_port: 2,
            rmse,
            label,
        }
    }

    #[test]
    fn test_confusion_matrix() {
        let records = vec![
            record(0.9, 1), // TP
            record(0.9, 0), // FP
            record(0.1, 0), // TN
            record(0.1, 1), // FN
        ];
        let summary = EvalSummary::compute(&records, 0.5, 0, true, -1.0, -1, -1);
        assert_eq!((summary.tp, summary.fp, summary.tn, summary.fn_), (1, 1, 1, 1));
        assert_eq!(summary.tpr, 0.5);
        assert_eq!(summary.accuracy, 0.5);
        assert_eq!(summary.precision, 0.5);
        assert_eq!(summary.f1_score, 0.5);
    }

    #[test]
    fn test_zero_default_on_empty_denominators() {
        let records = vec![record(0.1, 0), record(0.2, 0)];
        let summary = EvalSummary::compute(&records, 0.5, 0, true, -1.0, -1, -1);
        assert_eq!(summary.tpr, 0.0);
        assert_eq!(summary.precision, 0.0);
        assert_eq!(summary.f1_score, 0.0);
        assert_eq!(summary.tnr, 1.0);
    }

    #[test]
    fn test_training_rows_cut() {
        let records = vec![
            record(0.9, 0), // training row, would be FP
            record(0.9, 1), // TP
        ];
        let summary = EvalSummary::compute(&records, 0.5, 1, false, -1.0, -1, -1);
        assert_eq!(summary.fp, 0);
        assert_eq!(summary.tp, 1);
    }

    #[test]
    fn test_csv_round_shape() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("eval.csv");
        write_eval_csv(&[record(0.25, 1)], &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "mac_src,ip_src,ip_dst,ip_type,src_proto,dst_proto,rmse,label"
        );
        assert_eq!(
            lines.next().unwrap(),
            "aa:bb:cc:dd:ee:ff,10.0.0.1,10.0.0.2,6,1,2,0.25,1"
        );
    }
}
