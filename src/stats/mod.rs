//! Multi-resolution decayed flow statistics
//!
//! The dataplane approximates per-flow statistics under four independent
//! time-decay windows and tags every record with the decay counter it was
//! computed under. This module owns the control-plane mirror of that state:
//! flow key derivation, the decay-bucketed statistic store, and the
//! snapshot persistence used for warm starts.

pub mod key;
pub mod storage;
pub mod store;

pub use key::{derive_keys, FlowKeys};
pub use storage::{SnapshotMetadata, StatsStorage, SNAPSHOT_VERSION};
pub use store::{FlowStatsStore, StatsSnapshot, FEATURE_DIM};

use crate::error::{PeregrineError, Result};

/// Number of decay resolutions computed by the dataplane.
pub const LAMBDAS: usize = 4;

/// The four fixed decay windows, indexed 0..3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecayResolution {
    /// 100 ms window
    Ms100 = 0,
    /// 1 s window
    S1 = 1,
    /// 10 s window
    S10 = 2,
    /// 60 s window
    S60 = 3,
}

impl DecayResolution {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Flow aggregation granularities, in feature-vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    MacIpSrc,
    IpSrc,
    IpPair,
    FiveTuple,
}

impl Granularity {
    /// Per-resolution statistic count for this granularity.
    pub fn stats_width(self) -> usize {
        match self {
            Granularity::MacIpSrc | Granularity::IpSrc => 3,
            Granularity::IpPair | Granularity::FiveTuple => 7,
        }
    }

    /// Full vector length (all resolutions).
    pub fn vector_len(self) -> usize {
        self.stats_width() * LAMBDAS
    }

    pub fn name(self) -> &'static str {
        match self {
            Granularity::MacIpSrc => "mac_ip_src",
            Granularity::IpSrc => "ip_src",
            Granularity::IpPair => "ip",
            Granularity::FiveTuple => "five_t",
        }
    }
}

/// Map a raw dataplane decay counter to its resolution.
///
/// The dataplane emits two alias encodings for the same four windows: small
/// sequential counters and large register bucket constants. Both must land
/// on the same resolution; any other value means the dataplane and control
/// plane disagree on the protocol, which is fatal.
pub fn decay_resolution(decay: u32) -> Result<DecayResolution> {
    match decay {
        0 | 1 => Ok(DecayResolution::Ms100),
        2 | 8192 => Ok(DecayResolution::S1),
        3 | 16384 => Ok(DecayResolution::S10),
        4 | 24576 => Ok(DecayResolution::S60),
        other => Err(PeregrineError::DecayMapping(other)),
    }
}

/// Resolution index for a raw decay counter; the slot arithmetic in the
/// store works on this.
pub fn decay_to_pos(decay: u32) -> Result<usize> {
    decay_resolution(decay).map(DecayResolution::index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_mapping_total() {
        let expected = [
            (0, 0),
            (1, 0),
            (2, 1),
            (3, 2),
            (4, 3),
            (8192, 1),
            (16384, 2),
            (24576, 3),
        ];
        for (decay, pos) in expected {
            assert_eq!(decay_to_pos(decay).unwrap(), pos, "decay {}", decay);
        }
    }

    #[test]
    fn test_decay_mapping_rejects_unknown() {
        for decay in [5, 100, 8191, 8193, 24577, u32::MAX] {
            assert!(matches!(
                decay_to_pos(decay),
                Err(PeregrineError::DecayMapping(d)) if d == decay
            ));
        }
    }

    #[test]
    fn test_granularity_widths() {
        assert_eq!(Granularity::MacIpSrc.vector_len(), 12);
        assert_eq!(Granularity::IpSrc.vector_len(), 12);
        assert_eq!(Granularity::IpPair.vector_len(), 28);
        assert_eq!(Granularity::FiveTuple.vector_len(), 28);
    }
}
