//! Per-granularity flow statistic store
//!
//! One map per granularity, from flow key to a fixed-length vector holding
//! the latest dataplane statistics for each decay resolution. Updates are
//! last-write-wins per resolution slot; slots for resolutions never seen
//! for a key stay zero.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::key::FlowKeys;
use super::{decay_to_pos, Granularity};
use crate::error::Result;
use crate::source::PacketFeatureRecord;

/// Length of the concatenated feature vector handed to the detector.
pub const FEATURE_DIM: usize = 80;

type NarrowVec = [f64; 12];
type WideVec = [f64; 28];

/// Wholesale copy of the four maps, used by persistence and warm starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub mac_ip_src: HashMap<String, NarrowVec>,
    pub ip_src: HashMap<String, NarrowVec>,
    pub ip: HashMap<String, WideVec>,
    pub five_t: HashMap<String, WideVec>,
}

/// Decay-bucketed statistic store across the four flow granularities.
///
/// Entries are created lazily on first key observation and never evicted;
/// the store is sized by the key population of the run. Owned exclusively
/// by one pipeline, so no interior locking.
#[derive(Debug, Default)]
pub struct FlowStatsStore {
    mac_ip_src: HashMap<String, NarrowVec>,
    ip_src: HashMap<String, NarrowVec>,
    ip: HashMap<String, WideVec>,
    five_t: HashMap<String, WideVec>,
}

impl FlowStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite one resolution's slot range for a key. The vector is
    /// zero-created on first observation; the write never merges with the
    /// previous slot contents.
    pub fn update(&mut self, gran: Granularity, key: &str, pos: usize, values: &[f64]) {
        let width = gran.stats_width();
        debug_assert_eq!(values.len(), width);

        match gran {
            Granularity::MacIpSrc => {
                let v = self
                    .mac_ip_src
                    .entry(key.to_owned())
                    .or_insert([0.0; 12]);
                v[width * pos..width * pos + width].copy_from_slice(values);
            }
            Granularity::IpSrc => {
                let v = self.ip_src.entry(key.to_owned()).or_insert([0.0; 12]);
                v[width * pos..width * pos + width].copy_from_slice(values);
            }
            Granularity::IpPair => {
                let v = self.ip.entry(key.to_owned()).or_insert([0.0; 28]);
                v[width * pos..width * pos + width].copy_from_slice(values);
            }
            Granularity::FiveTuple => {
                let v = self.five_t.entry(key.to_owned()).or_insert([0.0; 28]);
                v[width * pos..width * pos + width].copy_from_slice(values);
            }
        }
    }

    /// Assemble the 80-dim feature vector for a key set, creating missing
    /// entries as zero vectors. Returns an owned copy; NaN values are
    /// zeroed after concatenation, never in the stored buckets.
    pub fn feature_vector(&mut self, keys: &FlowKeys) -> [f64; FEATURE_DIM] {
        let mut out = [0.0; FEATURE_DIM];

        let mac_ip_src = self
            .mac_ip_src
            .entry(keys.mac_ip_src.clone())
            .or_insert([0.0; 12]);
        out[0..12].copy_from_slice(mac_ip_src);

        let ip_src = self.ip_src.entry(keys.ip_src.clone()).or_insert([0.0; 12]);
        out[12..24].copy_from_slice(ip_src);

        let ip = self.ip.entry(keys.ip.clone()).or_insert([0.0; 28]);
        out[24..52].copy_from_slice(ip);

        let five_t = self.five_t.entry(keys.five_t.clone()).or_insert([0.0; 28]);
        out[52..80].copy_from_slice(five_t);

        for v in out.iter_mut() {
            if v.is_nan() {
                *v = 0.0;
            }
        }

        out
    }

    /// Fold one packet record into the store and return the assembled
    /// feature vector. Fails only on a decay counter outside the fixed
    /// domain.
    pub fn process_record(
        &mut self,
        keys: &FlowKeys,
        rec: &PacketFeatureRecord,
    ) -> Result<[f64; FEATURE_DIM]> {
        let pos = decay_to_pos(rec.decay)?;

        self.update(Granularity::MacIpSrc, &keys.mac_ip_src, pos, &rec.mac_ip_src_stats);
        self.update(Granularity::IpSrc, &keys.ip_src, pos, &rec.ip_src_stats);
        self.update(Granularity::IpPair, &keys.ip, pos, &rec.ip_stats);
        self.update(Granularity::FiveTuple, &keys.five_t, pos, &rec.five_t_stats);

        Ok(self.feature_vector(keys))
    }

    /// Copy out all four maps.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            mac_ip_src: self.mac_ip_src.clone(),
            ip_src: self.ip_src.clone(),
            ip: self.ip.clone(),
            five_t: self.five_t.clone(),
        }
    }

    /// Replace all four maps wholesale. Prior state is discarded, not
    /// merged.
    pub fn restore(&mut self, snapshot: StatsSnapshot) {
        self.mac_ip_src = snapshot.mac_ip_src;
        self.ip_src = snapshot.ip_src;
        self.ip = snapshot.ip;
        self.five_t = snapshot.five_t;
    }

    /// Clear all four maps; used between independent runs sharing a
    /// process.
    pub fn reset(&mut self) {
        self.mac_ip_src.clear();
        self.ip_src.clear();
        self.ip.clear();
        self.five_t.clear();
    }

    /// Total tracked keys across all granularities.
    pub fn len(&self) -> usize {
        self.mac_ip_src.len() + self.ip_src.len() + self.ip.len() + self.five_t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::key::derive_keys;
    use crate::source::PacketFeatureRecord;

    fn record(decay: u32) -> PacketFeatureRecord {
        PacketFeatureRecord {
            ts: 0.0,
            mac_src: "aa:bb:cc:dd:ee:ff".into(),
            ip_src: "192.168.0.1".into(),
            ip_dst: "192.168.0.2".into(),
            proto: 17,
            src_port: 53,
            dst_port: 5353,
            decay,
            mac_ip_src_stats: [1.0, 2.0, 3.0],
            ip_src_stats: [4.0, 5.0, 6.0],
            ip_stats: [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            five_t_stats: [8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0],
        }
    }

    #[test]
    fn test_vector_length_invariant() {
        let mut store = FlowStatsStore::new();
        let rec = record(0);
        let keys = derive_keys(&rec).unwrap();
        for decay in [0, 1, 2, 3, 4, 8192, 16384, 24576] {
            let out = store.process_record(&keys, &record(decay)).unwrap();
            assert_eq!(out.len(), FEATURE_DIM);
        }
    }

    #[test]
    fn test_last_write_wins_per_resolution() {
        let mut store = FlowStatsStore::new();
        store.update(Granularity::MacIpSrc, "k", 0, &[1.0, 2.0, 3.0]);
        store.update(Granularity::MacIpSrc, "k", 0, &[4.0, 5.0, 6.0]);

        let keys = FlowKeys {
            mac_ip_src: "k".into(),
            ip_src: "s".into(),
            ip: "i".into(),
            five_t: "f".into(),
        };
        let out = store.feature_vector(&keys);
        assert_eq!(&out[0..3], &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_zero_default_for_unseen_resolutions() {
        let mut store = FlowStatsStore::new();
        store.update(
            Granularity::FiveTuple,
            "f",
            1,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
        );

        let keys = FlowKeys {
            mac_ip_src: "k".into(),
            ip_src: "s".into(),
            ip: "i".into(),
            five_t: "f".into(),
        };
        let out = store.feature_vector(&keys);
        // five-tuple occupies slots 52..80; resolution 1 is 59..66
        assert_eq!(&out[52..59], &[0.0; 7]);
        assert_eq!(&out[59..66], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(&out[66..80], &[0.0; 14]);
    }

    #[test]
    fn test_nan_sanitized_after_concatenation() {
        let mut store = FlowStatsStore::new();
        store.update(Granularity::IpSrc, "s", 0, &[f64::NAN, 1.0, f64::NAN]);

        let keys = FlowKeys {
            mac_ip_src: "k".into(),
            ip_src: "s".into(),
            ip: "i".into(),
            five_t: "f".into(),
        };
        let out = store.feature_vector(&keys);
        assert_eq!(&out[12..15], &[0.0, 1.0, 0.0]);
        assert!(out.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut store = FlowStatsStore::new();
        let rec = record(8192);
        let keys = derive_keys(&rec).unwrap();
        let original = store.process_record(&keys, &rec).unwrap();

        let snapshot = store.snapshot();
        let mut restored = FlowStatsStore::new();
        restored.update(Granularity::IpSrc, "stale", 0, &[9.0, 9.0, 9.0]);
        restored.restore(snapshot);

        let out = restored.feature_vector(&keys);
        assert_eq!(out.to_vec(), original.to_vec());
        // restore replaces wholesale
        let stale_keys = FlowKeys {
            mac_ip_src: "x".into(),
            ip_src: "stale".into(),
            ip: "y".into(),
            five_t: "z".into(),
        };
        let stale = restored.feature_vector(&stale_keys);
        assert_eq!(&stale[12..15], &[0.0; 3]);
    }

    #[test]
    fn test_reset_clears_all_maps() {
        let mut store = FlowStatsStore::new();
        let rec = record(0);
        let keys = derive_keys(&rec).unwrap();
        store.process_record(&keys, &rec).unwrap();
        assert!(!store.is_empty());

        store.reset();
        assert!(store.is_empty());
    }
}
