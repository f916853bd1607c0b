use std::path::PathBuf;
use thiserror::Error;

/// Custom error type for whisper database operations.
#[derive(Error, Debug)]
pub enum WhisperError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid aggregation method: {0}")]
    InvalidAggregationMethod(String),

    #[error("Invalid xFilesFactor {0}, not between 0 and 1")]
    InvalidXFilesFactor(f32),

    #[error("Corrupt whisper file ({path:?}): {details}")]
    Corrupt { details: String, path: PathBuf },

    #[error("Timestamp not covered by any archives in this database")]
    TimestampNotCovered,

    #[error("Invalid time interval: from time {from} is after until time {until}")]
    InvalidTimeInterval { from: u32, until: u32 },

    #[error("File {0:?} already exists")]
    FileExists(PathBuf),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

impl WhisperError {
    /// Shorthand used by the codec and header readers.
    pub(crate) fn corrupt(details: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        WhisperError::Corrupt {
            details: details.into(),
            path: path.into(),
        }
    }
}
