//! Ground-truth trace labels
//!
//! Headerless CSV with one integer per line (0 = benign, 1 = attack),
//! indexed by the packet's position in the full unsampled input stream.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::error::{PeregrineError, Result};

/// In-memory label sequence for one trace.
pub struct TraceLabels {
    labels: Vec<u8>,
}

impl TraceLabels {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);

        let mut labels = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let label: u8 = trimmed.parse().map_err(|_| PeregrineError::TraceRecord {
                line: line_no + 1,
                msg: format!("bad label value {:?}", trimmed),
            })?;
            labels.push(label);
        }

        info!("Loaded {} ground-truth labels from {:?}", labels.len(), path);
        Ok(Self { labels })
    }

    pub fn from_vec(labels: Vec<u8>) -> Self {
        Self { labels }
    }

    /// Label at a 0-based packet index. An index past the end is the
    /// recoverable [`PeregrineError::LabelIndex`] condition.
    pub fn get(&self, index: usize) -> Result<u8> {
        self.labels
            .get(index)
            .copied()
            .ok_or(PeregrineError::LabelIndex {
                index,
                len: self.labels.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_and_index() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0\n0\n1\n0").unwrap();

        let labels = TraceLabels::load(file.path()).unwrap();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels.get(2).unwrap(), 1);
        assert_eq!(labels.get(3).unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_is_label_index_error() {
        let labels = TraceLabels::from_vec(vec![0, 1]);
        assert!(matches!(
            labels.get(2),
            Err(PeregrineError::LabelIndex { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_bad_value_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0\nx").unwrap();
        assert!(TraceLabels::load(file.path()).is_err());
    }
}
