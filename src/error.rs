use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

pub type YoloResult<T> = Result<T, YoloError>;

#[derive(Debug, Error)]
pub enum YoloError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid label at {path}:{line}: {msg}")]
    Label {
        path: PathBuf,
        line: usize,
        msg: String,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("checkpoint error at {path}: {msg}")]
    Recorder { path: PathBuf, msg: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("tensor data conversion failed: {0}")]
    TensorData(String),
    #[error("invalid architecture: {0}")]
    Architecture(String),
}

impl YoloError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn recorder(path: impl Into<PathBuf>, err: RecorderError) -> Self {
        Self::Recorder {
            path: path.into(),
            msg: err.to_string(),
        }
    }
}
