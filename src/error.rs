use std::path::PathBuf;
use std::time::Duration;

use symphonia::core::errors::Error as SymphoniaError;

#[derive(thiserror::Error, Debug)]
pub enum MeasurementError {
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] SymphoniaError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("EBU R128 error: {0}")]
    EbuR128(#[from] ebur128::Error),
    #[error("No compatible audio track found")]
    NoTrack,
    #[error("Unsupported sample format")]
    UnsupportedFormat,
    #[error("ffprobe failed: {0}")]
    Ffprobe(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Encoder exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("Measuring encoded file failed: {0}")]
    Measurement(#[from] MeasurementError),
    #[error(
        "Encoded duration {:.2}s does not match source duration {:.2}s",
        actual.as_secs_f64(),
        expected.as_secs_f64()
    )]
    DurationMismatch { expected: Duration, actual: Duration },
}

#[derive(thiserror::Error, Debug)]
pub enum TagError {
    #[error("Tag error: {0}")]
    Lofty(#[from] lofty::error::LoftyError),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("Source file does not exist: {0}")]
    MissingSource(PathBuf),
    #[error("Measurement failed for {path}: {source}")]
    Measurement {
        path: PathBuf,
        #[source]
        source: MeasurementError,
    },
    #[error("Transcoding failed for {path}: {source}")]
    Transcode {
        path: PathBuf,
        #[source]
        source: TranscodeError,
    },
    #[error("Copying tags failed for {path}: {source}")]
    Tagging {
        path: PathBuf,
        #[source]
        source: TagError,
    },
    #[error("I/O error during processing of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} files failed to process")]
    FilesFailed(usize),
}
