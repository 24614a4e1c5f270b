//! Generation orchestration: validates a request, resolves the model slot,
//! applies enhancement stages, runs the sampler and persists the result.

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{ArtifactKind, Catalog};
use crate::enhance::{self, StageOutcome};
use crate::error::GenerateError;
use crate::pipeline::{PipelineLoader, PipelineMode, SampleJob};
use crate::slot::ModelSlot;
use crate::store::{Gallery, SidecarMetadata};

fn default_steps() -> usize {
    20
}
fn default_guidance() -> f64 {
    7.5
}
fn default_dim() -> usize {
    512
}
fn default_model() -> String {
    "stable-diffusion-v1-5".to_string()
}
fn default_vae() -> String {
    crate::slot::DEFAULT_VAE.to_string()
}
fn default_lora_scale() -> f64 {
    0.75
}
fn default_strength() -> f64 {
    0.8
}

/// Caller-supplied generation request, exactly as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f64,
    /// `0` means "assign a fresh random seed".
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_dim")]
    pub width: usize,
    #[serde(default = "default_dim")]
    pub height: usize,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_vae")]
    pub vae: String,
    #[serde(default)]
    pub lora: Option<String>,
    #[serde(default = "default_lora_scale")]
    pub lora_scale: f64,
    #[serde(default)]
    pub negative_embedding: Option<String>,
    /// 0 = none, otherwise 2 or 4.
    #[serde(default)]
    pub upscale: u32,
    /// Base64 PNG switching to image-conditioned generation.
    #[serde(default)]
    pub init_image: Option<String>,
    /// Base64 PNG (with `init_image`) switching to masked inpainting.
    #[serde(default)]
    pub mask_image: Option<String>,
    /// Denoising strength for image-conditioned modes, in `(0, 1]`.
    #[serde(default = "default_strength")]
    pub strength: f64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: default_steps(),
            guidance_scale: default_guidance(),
            seed: 0,
            width: default_dim(),
            height: default_dim(),
            model: default_model(),
            vae: default_vae(),
            lora: None,
            lora_scale: default_lora_scale(),
            negative_embedding: None,
            upscale: 0,
            init_image: None,
            mask_image: None,
            strength: default_strength(),
        }
    }
}

/// The request as it actually went into sampling: seed resolved, effective
/// negative prompt, routed mode. Distinct from the caller's request so the
/// sampler inputs stay traceable.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Never the `0` sentinel.
    pub seed: u64,
    pub width: usize,
    pub height: usize,
    pub model: String,
    pub vae: String,
    pub lora: Option<String>,
    pub lora_scale: f64,
    pub negative_embedding: Option<String>,
    pub upscale: u32,
    pub strength: f64,
    pub mode: PipelineMode,
}

/// One successful generation. Immutable once produced.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub image: DynamicImage,
    pub filename: String,
    pub url: String,
    pub seed: u64,
    pub request: ResolvedRequest,
    pub timestamp: DateTime<Utc>,
    pub degradations: Vec<String>,
}

/// Sequences one generation request at a time through the model slot, the
/// enhancement stages, the sampler and the gallery. Holds no internal locking;
/// callers serialize requests around it.
pub struct Engine {
    catalog: Catalog,
    slot: ModelSlot,
    gallery: Gallery,
    loader: Box<dyn PipelineLoader>,
}

impl Engine {
    pub fn new(catalog: Catalog, gallery: Gallery, loader: Box<dyn PipelineLoader>) -> Self {
        Self {
            catalog,
            slot: ModelSlot::new(),
            gallery,
            loader,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn active_model(&self) -> Option<(&str, &str)> {
        self.slot.active()
    }

    /// Explicit shutdown path: releases the loaded model.
    pub fn unload(&mut self) {
        self.slot.unload();
    }

    pub fn generate(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenerateError> {
        let (init_image, mask_image) = validate(request)?;
        let mode = match (&init_image, &mask_image) {
            (None, None) => PipelineMode::Plain,
            (Some(_), None) => PipelineMode::ImageConditioned,
            (Some(_), Some(_)) => PipelineMode::MaskedInpaint,
            (None, Some(_)) => unreachable!("rejected during validation"),
        };

        // Model swap is not transactional with the rest of the request: a
        // successful load stays active even if a later stage fails.
        let report = self
            .slot
            .load(&self.catalog, self.loader.as_ref(), &request.model, &request.vae)?;
        let mut degradations = report.degradations;

        let stack = self
            .slot
            .stack_mut()
            .ok_or_else(|| GenerateError::ModelLoad("no pipeline published".to_string()))?;
        let pipeline = stack.for_mode(mode);

        // Enhancing: both stages are best-effort.
        let mut adapter_applied = false;
        if let Some(locator) = &request.lora {
            match enhance::apply_adapter(pipeline, locator, request.lora_scale) {
                StageOutcome::Applied => adapter_applied = true,
                StageOutcome::Skipped(reason) => {
                    degradations.push(format!("adapter skipped: {reason}"));
                }
            }
        }

        let mut negative_prompt = request.negative_prompt.clone();
        if let Some(key) = &request.negative_embedding {
            match self.catalog.resolve(ArtifactKind::Embedding, key) {
                Some(descriptor) => match enhance::register_embedding(pipeline, &descriptor) {
                    (StageOutcome::Applied, Some(trigger)) => {
                        negative_prompt = enhance::append_trigger(&negative_prompt, &trigger);
                    }
                    (StageOutcome::Skipped(reason), _) => {
                        degradations.push(format!("negative embedding skipped: {reason}"));
                    }
                    (StageOutcome::Applied, None) => {}
                },
                None => {
                    warn!(key, "negative embedding not in catalog");
                    degradations.push(format!("negative embedding skipped: unknown key {key}"));
                }
            }
        }

        let resolved = ResolvedRequest {
            prompt: request.prompt.clone(),
            negative_prompt,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            seed: resolve_seed(request.seed),
            width: request.width,
            height: request.height,
            model: request.model.clone(),
            vae: request.vae.clone(),
            lora: request.lora.clone(),
            lora_scale: request.lora_scale,
            negative_embedding: request.negative_embedding.clone(),
            upscale: request.upscale,
            strength: request.strength,
            mode,
        };
        let job = SampleJob {
            prompt: resolved.prompt.clone(),
            negative_prompt: resolved.negative_prompt.clone(),
            steps: resolved.steps,
            guidance_scale: resolved.guidance_scale,
            seed: resolved.seed,
            width: resolved.width,
            height: resolved.height,
            init_image,
            mask_image,
            strength: resolved.strength,
        };

        info!(
            seed = resolved.seed,
            mode = ?mode,
            steps = resolved.steps,
            "sampling"
        );
        let sampled = pipeline.sample(&job);

        // Adapter state must never leak into the next request, whatever
        // happened downstream of Enhancing.
        if adapter_applied {
            enhance::remove_adapter(pipeline);
        }
        let mut image = sampled.map_err(GenerateError::Sampling)?;

        if resolved.upscale != 0 {
            let (upscaled, outcome) = enhance::upscale(image, resolved.upscale);
            image = upscaled;
            if let StageOutcome::Skipped(reason) = outcome {
                degradations.push(format!("upscale skipped: {reason}"));
            }
        }

        let timestamp = Utc::now();
        let metadata = SidecarMetadata {
            filename: String::new(),
            timestamp,
            prompt: resolved.prompt.clone(),
            negative_prompt: resolved.negative_prompt.clone(),
            model: resolved.model.clone(),
            vae: resolved.vae.clone(),
            lora: resolved.lora.clone(),
            lora_scale: resolved.lora_scale,
            negative_embedding: resolved.negative_embedding.clone(),
            steps: resolved.steps,
            guidance_scale: resolved.guidance_scale,
            seed: resolved.seed,
            width: resolved.width,
            height: resolved.height,
            upscale: resolved.upscale,
            degradations: degradations.clone(),
        };
        let filename = self.gallery.persist(&image, metadata)?;
        info!(filename, seed = resolved.seed, "generation persisted");

        Ok(GenerationOutcome {
            image,
            url: format!("/images/{filename}"),
            filename,
            seed: resolved.seed,
            request: resolved,
            timestamp,
            degradations,
        })
    }
}

/// Request-shape validation. Runs before any side effect.
fn validate(
    request: &GenerationRequest,
) -> Result<(Option<DynamicImage>, Option<DynamicImage>), GenerateError> {
    if request.prompt.trim().is_empty() {
        return Err(GenerateError::InvalidRequest("prompt must not be empty".to_string()));
    }
    if request.steps == 0 {
        return Err(GenerateError::InvalidRequest(
            "steps must be a positive integer".to_string(),
        ));
    }
    if !matches!(request.upscale, 0 | 2 | 4) {
        return Err(GenerateError::InvalidRequest(format!(
            "upscale must be 0, 2 or 4, got {}",
            request.upscale
        )));
    }
    if request.width == 0 || request.height == 0 {
        return Err(GenerateError::InvalidRequest(
            "width and height must be positive".to_string(),
        ));
    }
    if request.guidance_scale < 0.0 {
        return Err(GenerateError::InvalidRequest(
            "guidance_scale must be non-negative".to_string(),
        ));
    }
    if !(request.strength > 0.0 && request.strength <= 1.0) {
        return Err(GenerateError::InvalidRequest(
            "strength must be within (0, 1]".to_string(),
        ));
    }
    if request.mask_image.is_some() && request.init_image.is_none() {
        return Err(GenerateError::InvalidRequest(
            "mask_image requires init_image".to_string(),
        ));
    }
    let init_image = request
        .init_image
        .as_deref()
        .map(|b64| decode_image(b64, "init_image"))
        .transpose()?;
    let mask_image = request
        .mask_image
        .as_deref()
        .map(|b64| decode_image(b64, "mask_image"))
        .transpose()?;
    Ok((init_image, mask_image))
}

fn decode_image(b64: &str, field: &str) -> Result<DynamicImage, GenerateError> {
    let bytes = BASE64_STANDARD
        .decode(b64.trim())
        .map_err(|err| GenerateError::InvalidRequest(format!("{field} is not valid base64: {err}")))?;
    image::load_from_memory(&bytes)
        .map_err(|err| GenerateError::InvalidRequest(format!("{field} is not a decodable image: {err}")))
}

/// Resolves the seed sentinel. A returned seed is never zero so callers can
/// always reproduce the exact request.
fn resolve_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    loop {
        let fresh = u64::from(rand::random::<u32>());
        if fresh != 0 {
            return fresh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_seed_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(resolve_seed(0), 0);
        }
        assert_eq!(resolve_seed(7), 7);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a red fox in snow"}"#).unwrap();
        assert_eq!(request.steps, 20);
        assert_eq!(request.guidance_scale, 7.5);
        assert_eq!(request.seed, 0);
        assert_eq!((request.width, request.height), (512, 512));
        assert_eq!(request.model, "stable-diffusion-v1-5");
        assert_eq!(request.vae, "default");
        assert_eq!(request.lora_scale, 0.75);
        assert_eq!(request.upscale, 0);
    }
}
