//! The process-wide model slot: owns the single loaded {base model, decoder}
//! pair and the pipeline stack derived from it.

use thiserror::Error;
use tracing::info;

use crate::catalog::{ArtifactKind, Catalog};
use crate::pipeline::{PipelineLoader, PipelineStack};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown {kind} artifact: {key}")]
    NotFound { kind: ArtifactKind, key: String },

    #[error("failed to build pipeline: {0:#}")]
    Construct(#[source] anyhow::Error),
}

/// Outcome of a successful load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// False when the requested pair was already active and nothing happened.
    pub swapped: bool,
    /// Recovered fallbacks taken while building (precision, decoder).
    pub degradations: Vec<String>,
}

/// Decoder key meaning "keep the base pipeline's built-in decoder".
pub const DEFAULT_VAE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActivePair {
    base: String,
    vae: String,
}

/// Exactly one of these exists per process. No internal locking; callers
/// serialize loads with generation.
#[derive(Default)]
pub struct ModelSlot {
    active: Option<ActivePair>,
    stack: Option<PipelineStack>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active (base, decoder) keys, if anything is loaded.
    pub fn active(&self) -> Option<(&str, &str)> {
        self.active
            .as_ref()
            .map(|pair| (pair.base.as_str(), pair.vae.as_str()))
    }

    pub fn stack_mut(&mut self) -> Option<&mut PipelineStack> {
        self.stack.as_mut()
    }

    /// Makes the requested pair active, swapping the previous stack out if it
    /// differs. Idempotent for an already-active pair. Key validation happens
    /// before anything is released, so a not-found error leaves the previous
    /// model untouched. A construction failure leaves the slot empty.
    pub fn load(
        &mut self,
        catalog: &Catalog,
        loader: &dyn PipelineLoader,
        base_key: &str,
        vae_key: &str,
    ) -> Result<LoadReport, LoadError> {
        let base = catalog
            .resolve(ArtifactKind::BaseModel, base_key)
            .ok_or_else(|| LoadError::NotFound {
                kind: ArtifactKind::BaseModel,
                key: base_key.to_string(),
            })?;
        let vae = if vae_key == DEFAULT_VAE {
            None
        } else {
            Some(
                catalog
                    .resolve(ArtifactKind::Vae, vae_key)
                    .ok_or_else(|| LoadError::NotFound {
                        kind: ArtifactKind::Vae,
                        key: vae_key.to_string(),
                    })?,
            )
        };

        let requested = ActivePair {
            base: base_key.to_string(),
            vae: vae_key.to_string(),
        };
        if self.active.as_ref() == Some(&requested) && self.stack.is_some() {
            return Ok(LoadReport::default());
        }

        // Release the previous stack before constructing the new one so peak
        // memory stays bounded to a single model.
        if self.stack.take().is_some() {
            info!(base = %requested.base, vae = %requested.vae, "releasing active model before swap");
        }
        self.active = None;

        let (stack, report) = loader
            .build(&base, vae.as_ref())
            .map_err(LoadError::Construct)?;

        // Publish only after full success.
        self.stack = Some(stack);
        self.active = Some(requested);
        info!(base = base_key, vae = vae_key, "model loaded");
        Ok(LoadReport {
            swapped: true,
            degradations: report.degradations,
        })
    }

    /// Drops the loaded stack, reclaiming its memory. Shutdown path.
    pub fn unload(&mut self) {
        if self.stack.take().is_some() {
            info!("model unloaded");
        }
        self.active = None;
    }
}
