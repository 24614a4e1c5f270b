//! Error taxonomy for the generation subsystem.

use thiserror::Error;

use crate::catalog::ArtifactKind;
use crate::slot::LoadError;
use crate::store::StoreError;

/// Everything that can end a generation request. Enhancement failures never
/// appear here; those are recovered at the stage boundary and surface as
/// degradation notes on the result instead.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// Bad request shape. No side effects have occurred.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Requested key absent from the catalog. No side effects have occurred.
    #[error("unknown {kind} artifact: {key}")]
    UnknownArtifact { kind: ArtifactKind, key: String },

    /// Base pipeline construction failed even after the precision fallback.
    /// The slot is left empty.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// The sampler failed; nothing was persisted.
    #[error("sampling failed: {0:#}")]
    Sampling(#[source] anyhow::Error),

    /// Sampling succeeded but the result could not be written; the in-memory
    /// image is discarded.
    #[error("failed to persist result: {0}")]
    Persist(#[from] StoreError),
}

impl From<LoadError> for GenerateError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound { kind, key } => GenerateError::UnknownArtifact { kind, key },
            LoadError::Construct(source) => GenerateError::ModelLoad(format!("{source:#}")),
        }
    }
}
