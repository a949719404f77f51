use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::Stage;

/// Fatal conditions. Malformed lines and anomaly rejections are never errors; they are dropped.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("input {} is empty", .0.display())]
    EmptyInput(PathBuf),

    #[error("failed to launch {worker}: {source}")]
    Launch {
        worker: String,
        #[source]
        source: io::Error,
    },

    #[error("{stage} stage failed: {message}")]
    StageFailed { stage: Stage, message: String },

    #[error("protocol error from {stage} stage: {message}")]
    Protocol { stage: Stage, message: String },

    #[error("failed to write report: {0}")]
    Report(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AnalysisError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn launch(worker: impl ToString, source: io::Error) -> Self {
        Self::Launch { worker: worker.to_string(), source }
    }

    pub(crate) fn protocol(stage: Stage, message: impl ToString) -> Self {
        Self::Protocol { stage, message: message.to_string() }
    }

    pub(crate) fn stage_failed(stage: Stage, message: impl ToString) -> Self {
        Self::StageFailed { stage, message: message.to_string() }
    }
}

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;
