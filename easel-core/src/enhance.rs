//! Enhancement stages: best-effort transforms applied around core sampling.
//!
//! Every stage reports `Applied` or `Skipped(reason)`; a skipped stage never
//! fails the request, it only degrades quality.

use image::DynamicImage;
use tracing::{debug, warn};

use crate::catalog::ArtifactDescriptor;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Applied,
    Skipped(String),
}

impl StageOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, StageOutcome::Applied)
    }
}

/// Attaches a rank-decomposition weight patch to the pipeline. Pipelines
/// without the capability, malformed files and unreachable locators all skip.
pub fn apply_adapter(pipeline: &mut dyn Pipeline, locator: &str, scale: f64) -> StageOutcome {
    let Some(patch) = pipeline.adapter_patch() else {
        return StageOutcome::Skipped("pipeline does not support adapters".to_string());
    };
    match patch.apply(locator, scale) {
        Ok(()) => {
            debug!(locator, scale, "adapter applied");
            StageOutcome::Applied
        }
        Err(err) => {
            warn!(locator, "adapter not applied: {err:#}");
            StageOutcome::Skipped(format!("{err:#}"))
        }
    }
}

/// Detaches any applied adapter. Safe to call when none was applied.
pub fn remove_adapter(pipeline: &mut dyn Pipeline) {
    if let Some(patch) = pipeline.adapter_patch() {
        patch.remove();
    }
}

/// Registers a negative-conditioning vector set. On success returns the
/// trigger token the caller splices into the negative prompt.
pub fn register_embedding(
    pipeline: &mut dyn Pipeline,
    descriptor: &ArtifactDescriptor,
) -> (StageOutcome, Option<String>) {
    let Some(inversion) = pipeline.textual_inversion() else {
        return (
            StageOutcome::Skipped("pipeline does not support negative embeddings".to_string()),
            None,
        );
    };
    match inversion.register(descriptor) {
        Ok(trigger) => {
            debug!(key = %descriptor.key, trigger, "negative embedding registered");
            (StageOutcome::Applied, Some(trigger))
        }
        Err(err) => {
            warn!(key = %descriptor.key, "negative embedding not registered: {err:#}");
            (StageOutcome::Skipped(format!("{err:#}")), None)
        }
    }
}

/// Appends the trigger token to a negative prompt exactly once.
pub fn append_trigger(negative_prompt: &str, trigger: &str) -> String {
    if negative_prompt
        .split(|c: char| c == ',' || c.is_whitespace())
        .any(|token| token.eq_ignore_ascii_case(trigger))
    {
        return negative_prompt.to_string();
    }
    if negative_prompt.trim().is_empty() {
        trigger.to_string()
    } else {
        format!("{negative_prompt}, {trigger}")
    }
}

/// Raster upscaling by a factor of 2 or 4. Callers validate the factor; on any
/// internal failure the original image comes back unchanged.
pub fn upscale(image: DynamicImage, factor: u32) -> (DynamicImage, StageOutcome) {
    if factor != 2 && factor != 4 {
        return (
            image,
            StageOutcome::Skipped(format!("unsupported upscale factor {factor}")),
        );
    }
    let (Some(width), Some(height)) = (
        image.width().checked_mul(factor),
        image.height().checked_mul(factor),
    ) else {
        return (
            image,
            StageOutcome::Skipped("upscaled dimensions overflow".to_string()),
        );
    };
    let upscaled = image.resize_exact(width, height, image::imageops::FilterType::Lanczos3);
    (upscaled, StageOutcome::Applied)
}
