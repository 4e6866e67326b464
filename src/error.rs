use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeregrineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("raw decay counter {0} outside the fixed domain")]
    DecayMapping(u32),

    #[error("capture source yielded no packet within the timeout")]
    CaptureTimeout,

    #[error("ground-truth label index {index} past end of label source (len {len})")]
    LabelIndex { index: usize, len: usize },

    #[error("malformed trace record at line {line}: {msg}")]
    TraceRecord { line: usize, msg: String },

    #[error("malformed packet record: {0}")]
    MalformedRecord(String),

    #[error("attack-labeled packet observed during the training phase")]
    TrainingContamination,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PeregrineError>;
