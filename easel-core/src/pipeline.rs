//! Seam between orchestration and the concrete diffusion implementation.
//!
//! The engine only ever talks to these traits; the candle-backed pipelines in
//! `diffusion` implement them for real sampling, and tests substitute
//! deterministic fakes.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::catalog::ArtifactDescriptor;

/// Which derived pipeline a request routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineMode {
    Plain,
    ImageConditioned,
    MaskedInpaint,
}

/// Fully resolved inputs for one sampling run. Everything the sampler needs is
/// here; it never sees the caller-supplied request.
#[derive(Debug, Clone)]
pub struct SampleJob {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Never the `0` sentinel; resolved before sampling.
    pub seed: u64,
    pub width: usize,
    pub height: usize,
    pub init_image: Option<DynamicImage>,
    pub mask_image: Option<DynamicImage>,
    /// Noise strength for image-conditioned sampling, in (0, 1].
    pub strength: f64,
}

/// Rank-decomposition weight patch, attached and detached per request.
pub trait AdapterPatch {
    fn apply(&mut self, locator: &str, scale: f64) -> anyhow::Result<()>;
    /// Detaches any applied patch. Safe to call when none is applied.
    fn remove(&mut self);
}

/// Named negative-conditioning vector sets. Returns the trigger token the
/// caller must splice into the negative prompt.
pub trait TextualInversion {
    fn register(&mut self, descriptor: &ArtifactDescriptor) -> anyhow::Result<String>;
}

/// One loaded execution pipeline. Capability queries return `None` when the
/// pipeline variant does not support the enhancement.
pub trait Pipeline: Send {
    fn sample(&mut self, job: &SampleJob) -> anyhow::Result<DynamicImage>;

    fn adapter_patch(&mut self) -> Option<&mut dyn AdapterPatch> {
        None
    }

    fn textual_inversion(&mut self) -> Option<&mut dyn TextualInversion> {
        None
    }
}

/// The derived pipelines built from one base model. All three share the base
/// pipeline's weights and are rebuilt together on every swap, never
/// individually.
pub struct PipelineStack {
    pub txt2img: Box<dyn Pipeline>,
    pub img2img: Box<dyn Pipeline>,
    pub inpaint: Box<dyn Pipeline>,
}

impl PipelineStack {
    pub fn for_mode(&mut self, mode: PipelineMode) -> &mut dyn Pipeline {
        match mode {
            PipelineMode::Plain => self.txt2img.as_mut(),
            PipelineMode::ImageConditioned => self.img2img.as_mut(),
            PipelineMode::MaskedInpaint => self.inpaint.as_mut(),
        }
    }
}

/// Recovered degradations observed while building a stack: precision
/// fallbacks, decoder substitution failures and the like.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub degradations: Vec<String>,
}

/// Builds a pipeline stack for a base model and an optional substitute
/// decoder. Construction failure is fatal for the load; recovered fallbacks
/// are reported through the build report instead.
pub trait PipelineLoader: Send {
    fn build(
        &self,
        base: &ArtifactDescriptor,
        vae: Option<&ArtifactDescriptor>,
    ) -> anyhow::Result<(PipelineStack, BuildReport)>;
}
