//! Flow key derivation
//!
//! Keys are plain string concatenations of header fields in a fixed order,
//! matching the keys the dataplane hashes on: MAC before IP, source before
//! destination, and srcIP/dstIP/proto/srcPort/dstPort for the five-tuple.

use crate::error::{PeregrineError, Result};
use crate::source::PacketFeatureRecord;

/// The four hierarchical flow keys derived from one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKeys {
    pub mac_ip_src: String,
    pub ip_src: String,
    pub ip: String,
    pub five_t: String,
}

/// Derive all four keys from a packet record. Pure; the only failure mode
/// is a record with empty identifying fields.
pub fn derive_keys(rec: &PacketFeatureRecord) -> Result<FlowKeys> {
    if rec.mac_src.is_empty() || rec.ip_src.is_empty() || rec.ip_dst.is_empty() {
        return Err(PeregrineError::MalformedRecord(format!(
            "empty identifying field (mac_src={:?}, ip_src={:?}, ip_dst={:?})",
            rec.mac_src, rec.ip_src, rec.ip_dst
        )));
    }

    Ok(FlowKeys {
        mac_ip_src: format!("{}{}", rec.mac_src, rec.ip_src),
        ip_src: rec.ip_src.clone(),
        ip: format!("{}{}", rec.ip_src, rec.ip_dst),
        five_t: format!(
            "{}{}{}{}{}",
            rec.ip_src, rec.ip_dst, rec.proto, rec.src_port, rec.dst_port
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PacketFeatureRecord;

    fn record() -> PacketFeatureRecord {
        PacketFeatureRecord {
            ts: 1.0,
            mac_src: "aa:bb:cc:dd:ee:ff".into(),
            ip_src: "10.0.0.1".into(),
            ip_dst: "10.0.0.2".into(),
            proto: 6,
            src_port: 1234,
            dst_port: 80,
            decay: 0,
            mac_ip_src_stats: [0.0; 3],
            ip_src_stats: [0.0; 3],
            ip_stats: [0.0; 7],
            five_t_stats: [0.0; 7],
        }
    }

    #[test]
    fn test_key_composition_order() {
        let keys = derive_keys(&record()).unwrap();
        assert_eq!(keys.mac_ip_src, "aa:bb:cc:dd:ee:ff10.0.0.1");
        assert_eq!(keys.ip_src, "10.0.0.1");
        assert_eq!(keys.ip, "10.0.0.110.0.0.2");
        assert_eq!(keys.five_t, "10.0.0.110.0.0.26123480");
    }

    #[test]
    fn test_malformed_record_rejected() {
        let mut rec = record();
        rec.ip_src = String::new();
        assert!(derive_keys(&rec).is_err());
    }
}
