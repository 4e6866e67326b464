//! Per-packet feature sources
//!
//! A [`FeatureSource`] hands the pipeline one raw statistic record per
//! observed packet. Live deployments read the records straight from the
//! switch's custom header; offline runs recompute them over a trace. The
//! pipeline only sees the trait, so the capture/recomputation machinery
//! stays external.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PeregrineError, Result};

/// Statistic computation mode requested by the pipeline for the current
/// phase. Exact bypasses the dataplane's register approximations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    Exact,
    Approximate,
}

/// One raw per-packet record: identifying fields, the raw decay counter,
/// and the per-granularity statistic groups computed under that decay.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketFeatureRecord {
    /// Packet timestamp from the trace/capture, seconds.
    pub ts: f64,
    pub mac_src: String,
    pub ip_src: String,
    pub ip_dst: String,
    pub proto: u8,
    /// Zero when the packet is neither TCP nor UDP.
    pub src_port: u16,
    pub dst_port: u16,
    /// Raw decay counter value; mapped to a resolution index downstream.
    pub decay: u32,
    pub mac_ip_src_stats: [f64; 3],
    pub ip_src_stats: [f64; 3],
    pub ip_stats: [f64; 7],
    pub five_t_stats: [f64; 7],
}

/// Outcome of asking the source for the next packet.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutcome {
    Record(Box<PacketFeatureRecord>),
    /// Packet consumed but not applicable (e.g. non-IPv4); skipped without
    /// touching detector-visible counters.
    NotApplicable,
    /// Live source produced nothing within its bound; terminal for the run.
    Timeout,
    /// Input fully consumed.
    Exhausted,
}

/// Source of per-packet statistic records.
pub trait FeatureSource {
    /// Retrieve the next record under the given computation mode.
    fn next_record(&mut self, mode: ComputeMode) -> Result<FeatureOutcome>;

    /// Total packet count of the input, including not-applicable packets.
    /// Unbounded live sources report `u64::MAX`.
    fn trace_size(&self) -> u64;
}

/// Offline source replaying a precomputed statistics trace.
///
/// The trace is a headerless CSV with one row per packet:
/// `ts,mac_src,ip_src,ip_dst,proto,src_port,dst_port,decay` followed by the
/// 20 statistic fields (3 mac+ip-src, 3 ip-src, 7 ip, 7 five-tuple). A row
/// consisting of a single `-` marks a packet the recomputation skipped
/// (non-IPv4). The replay embeds whichever computation mode produced it, so
/// the mode argument is accepted and recorded but does not change what is
/// read back.
pub struct ReplaySource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    trace_size: u64,
}

impl ReplaySource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // one counting pass so the pipeline knows the trace bound upfront
        let counting = BufReader::new(File::open(&path)?);
        let trace_size = counting.lines().count() as u64;

        let lines = BufReader::new(File::open(&path)?).lines();
        debug!("Opened stats trace {:?} ({} packets)", path, trace_size);

        Ok(Self {
            path,
            lines,
            line_no: 0,
            trace_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_line(&self, line: &str) -> Result<PacketFeatureRecord> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 28 {
            return Err(PeregrineError::TraceRecord {
                line: self.line_no,
                msg: format!("expected 28 fields, got {}", fields.len()),
            });
        }

        let err = |msg: String| PeregrineError::TraceRecord {
            line: self.line_no,
            msg,
        };

        let parse_f64 = |s: &str, name: &str| {
            s.parse::<f64>()
                .map_err(|_| err(format!("bad {} value {:?}", name, s)))
        };

        let mut rec = PacketFeatureRecord {
            ts: parse_f64(fields[0], "ts")?,
            mac_src: fields[1].to_string(),
            ip_src: fields[2].to_string(),
            ip_dst: fields[3].to_string(),
            proto: fields[4]
                .parse()
                .map_err(|_| err(format!("bad proto value {:?}", fields[4])))?,
            src_port: fields[5]
                .parse()
                .map_err(|_| err(format!("bad src_port value {:?}", fields[5])))?,
            dst_port: fields[6]
                .parse()
                .map_err(|_| err(format!("bad dst_port value {:?}", fields[6])))?,
            decay: fields[7]
                .parse()
                .map_err(|_| err(format!("bad decay value {:?}", fields[7])))?,
            mac_ip_src_stats: [0.0; 3],
            ip_src_stats: [0.0; 3],
            ip_stats: [0.0; 7],
            five_t_stats: [0.0; 7],
        };

        for (i, slot) in rec.mac_ip_src_stats.iter_mut().enumerate() {
            *slot = parse_f64(fields[8 + i], "mac_ip_src stat")?;
        }
        for (i, slot) in rec.ip_src_stats.iter_mut().enumerate() {
            *slot = parse_f64(fields[11 + i], "ip_src stat")?;
        }
        for (i, slot) in rec.ip_stats.iter_mut().enumerate() {
            *slot = parse_f64(fields[14 + i], "ip stat")?;
        }
        for (i, slot) in rec.five_t_stats.iter_mut().enumerate() {
            *slot = parse_f64(fields[21 + i], "five_t stat")?;
        }

        Ok(rec)
    }
}

impl FeatureSource for ReplaySource {
    fn next_record(&mut self, _mode: ComputeMode) -> Result<FeatureOutcome> {
        loop {
            let line = match self.lines.next() {
                Some(line) => line?,
                None => return Ok(FeatureOutcome::Exhausted),
            };
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed == "-" {
                return Ok(FeatureOutcome::NotApplicable);
            }

            return Ok(FeatureOutcome::Record(Box::new(self.parse_line(trimmed)?)));
        }
    }

    fn trace_size(&self) -> u64 {
        self.trace_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn trace_row(ts: f64, decay: u32) -> String {
        format!(
            "{ts},aa:bb:cc:dd:ee:ff,10.0.0.1,10.0.0.2,6,1234,80,{decay},\
             1,2,3,4,5,6,1,2,3,4,5,6,7,8,9,10,11,12,13,14"
        )
    }

    #[test]
    fn test_replay_parses_records() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", trace_row(1.5, 0)).unwrap();
        writeln!(file, "-").unwrap();
        writeln!(file, "{}", trace_row(2.5, 8192)).unwrap();

        let mut source = ReplaySource::open(file.path()).unwrap();
        assert_eq!(source.trace_size(), 3);

        match source.next_record(ComputeMode::Exact).unwrap() {
            FeatureOutcome::Record(rec) => {
                assert_eq!(rec.ts, 1.5);
                assert_eq!(rec.decay, 0);
                assert_eq!(rec.mac_ip_src_stats, [1.0, 2.0, 3.0]);
                assert_eq!(rec.five_t_stats, [8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0]);
            }
            other => panic!("expected record, got {:?}", other),
        }

        assert_eq!(
            source.next_record(ComputeMode::Exact).unwrap(),
            FeatureOutcome::NotApplicable
        );
        assert!(matches!(
            source.next_record(ComputeMode::Approximate).unwrap(),
            FeatureOutcome::Record(_)
        ));
        assert_eq!(
            source.next_record(ComputeMode::Approximate).unwrap(),
            FeatureOutcome::Exhausted
        );
    }

    #[test]
    fn test_replay_rejects_short_rows() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "1.0,aa,10.0.0.1").unwrap();

        let mut source = ReplaySource::open(file.path()).unwrap();
        assert!(matches!(
            source.next_record(ComputeMode::Exact),
            Err(PeregrineError::TraceRecord { line: 1, .. })
        ));
    }
}
