use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("tuner limit reached ({active_streams}/{max_streams})")]
    AdmissionRejected {
        max_streams: usize,
        active_streams: usize,
    },
    #[error("startup cleanup has not completed yet")]
    CleanupPending,
    #[error("tuner for {0} is still being released")]
    TunerReleasing(String),
    #[error("no catalog sources for channel {0}")]
    NoSources(String),
    #[error("all {candidates} candidate sources for channel {channel} died within the grace window")]
    AllCandidatesFailed { channel: String, candidates: usize },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
