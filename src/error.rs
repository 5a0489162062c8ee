use std::{io, path::PathBuf};

use thiserror::Error;

/// Failure to build a logger from its options.
///
/// Only construction can fail. Once a [`FileLogger`](crate::FileLogger) exists,
/// write failures are reported on stderr and never surface to callers.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot create log directory `{}`: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open log file `{}`: {source}", path.display())]
    OpenSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid max size `{0}`, expected bytes or a number with k/m/g suffix")]
    InvalidSize(String),

    #[error("invalid max files `{0}`, expected a file count or a number of days like `30d`")]
    InvalidMaxFiles(String),

    #[error("invalid date pattern `{pattern}`: {reason}")]
    InvalidDatePattern { pattern: String, reason: String },

    #[error("invalid exclude pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}
