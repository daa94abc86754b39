use thiserror::Error;

/// Failures of the cross-run artifact protocol. Always fatal to the caller.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("no artifact found for run '{run_id}'")]
    NotFound { run_id: String },

    #[error("found {count} artifacts for run '{run_id}', expected exactly one")]
    Ambiguous { run_id: String, count: usize },

    #[error("artifact for run '{run_id}' is corrupt: {reason}")]
    Corrupt { run_id: String, reason: String },

    #[error("artifact store failure: {0}")]
    Store(String),
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("stage '{stage}' failed and the run cannot continue: {reason}")]
    StageAborted { stage: String, reason: String },

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;
