//! candle-backed Stable Diffusion pipelines behind the `PipelineLoader` seam.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::{self, StableDiffusionConfig};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::catalog::{ArtifactDescriptor, ArtifactOrigin};
use crate::pipeline::{BuildReport, PipelineLoader, PipelineMode, PipelineStack};
use crate::{select_best_device, DeviceMap};

mod lora;
mod sample;

pub use sample::SdPipeline;

const UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";
const VAE_WEIGHTS: &str = "vae/diffusion_pytorch_model.safetensors";
const CLIP_WEIGHTS: &str = "text_encoder/model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer/tokenizer.json";
const FALLBACK_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";

/// Supported Stable Diffusion variants, sniffed from the artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVariant {
    V1_5,
    V2_1,
}

impl SdVariant {
    pub fn from_name(name: &str) -> Self {
        let upper = name.to_uppercase();
        if upper.contains("2-1") || upper.contains("2_1") || upper.contains("V2") {
            SdVariant::V2_1
        } else {
            SdVariant::V1_5
        }
    }

    fn config(self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            SdVariant::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            SdVariant::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }

    /// Width of the CLIP conditioning vectors for this variant.
    fn clip_embed_dim(self) -> usize {
        match self {
            SdVariant::V1_5 => 768,
            SdVariant::V2_1 => 1024,
        }
    }
}

/// Resolved weight files for one base model, local or fetched from the hub.
struct SdFiles {
    tokenizer: PathBuf,
    clip: PathBuf,
    unet: PathBuf,
    vae: PathBuf,
}

impl SdFiles {
    fn resolve(base: &ArtifactDescriptor) -> Result<Self> {
        match base.origin {
            ArtifactOrigin::LocalDir => {
                let root = PathBuf::from(&base.locator);
                let tokenizer = root.join(TOKENIZER_FILE);
                let tokenizer = if tokenizer.is_file() {
                    tokenizer
                } else {
                    fetch_fallback_tokenizer()?
                };
                Ok(SdFiles {
                    tokenizer,
                    clip: root.join(CLIP_WEIGHTS),
                    unet: root.join(UNET_WEIGHTS),
                    vae: root.join(VAE_WEIGHTS),
                })
            }
            ArtifactOrigin::Registry => {
                let api = hf_hub::api::sync::Api::new().context("failed to create hub API")?;
                let repo = api.model(base.locator.clone());
                let get = |file: &str| {
                    repo.get(file)
                        .with_context(|| format!("failed to fetch {file} from {}", base.locator))
                };
                let tokenizer = match repo.get(TOKENIZER_FILE) {
                    Ok(path) => path,
                    Err(_) => fetch_fallback_tokenizer()?,
                };
                Ok(SdFiles {
                    tokenizer,
                    clip: get(CLIP_WEIGHTS)?,
                    unet: get(UNET_WEIGHTS)?,
                    vae: get(VAE_WEIGHTS)?,
                })
            }
            ArtifactOrigin::LocalFile => anyhow::bail!(
                "single-file checkpoint {} is not loadable; use a packaged model directory",
                base.locator
            ),
        }
    }
}

fn fetch_fallback_tokenizer() -> Result<PathBuf> {
    let api = hf_hub::api::sync::Api::new().context("failed to create hub API")?;
    api.model(FALLBACK_TOKENIZER_REPO.to_string())
        .get("tokenizer.json")
        .context("failed to fetch fallback CLIP tokenizer")
}

fn resolve_vae_weights(vae: &ArtifactDescriptor) -> Result<PathBuf> {
    match vae.origin {
        ArtifactOrigin::LocalFile => Ok(PathBuf::from(&vae.locator)),
        ArtifactOrigin::LocalDir => Ok(PathBuf::from(&vae.locator).join("diffusion_pytorch_model.safetensors")),
        ArtifactOrigin::Registry => {
            let api = hf_hub::api::sync::Api::new().context("failed to create hub API")?;
            api.model(vae.locator.clone())
                .get("diffusion_pytorch_model.safetensors")
                .with_context(|| format!("failed to fetch decoder from {}", vae.locator))
        }
    }
}

/// Concept registered through textual inversion: trigger token plus its
/// conditioning vectors.
pub(crate) struct TextualConcept {
    pub trigger: String,
    pub vectors: Tensor,
}

/// Everything the three derived pipelines share. The unet sits behind a mutex
/// so an adapter patch through one handle is seen by all of them.
pub(crate) struct SdComponents {
    pub device: Device,
    pub dtype: DType,
    pub config: StableDiffusionConfig,
    pub accelerated: bool,
    pub clip_embed_dim: usize,
    pub tokenizer: Tokenizer,
    pub text_model: ClipTextTransformer,
    pub vae: AutoEncoderKL,
    pub unet: Mutex<UNet2DConditionModel>,
    /// Pristine unet weights, for rebuilding after an adapter is removed.
    pub unet_weights: PathBuf,
    pub inversions: Mutex<Vec<TextualConcept>>,
}

fn build_components(
    files: &SdFiles,
    variant: SdVariant,
    vae_override: Option<&PathBuf>,
    device: &Device,
    dtype: DType,
    accelerated: bool,
    degradations: &mut Vec<String>,
) -> Result<SdComponents> {
    // Memory-saving sliced attention only pays off on accelerated devices.
    let sliced_attention_size = if accelerated { Some(128) } else { None };
    let config = variant.config(sliced_attention_size);

    let tokenizer = Tokenizer::from_file(&files.tokenizer)
        .map_err(anyhow::Error::msg)
        .context("failed to load CLIP tokenizer")?;
    let text_model =
        stable_diffusion::build_clip_transformer(&config.clip, &files.clip, device, DType::F32)
            .context("failed to load CLIP text model")?;

    // A substitution failure keeps the built-in decoder; recovered, not fatal.
    let vae = match vae_override {
        Some(weights) => match config.build_vae(weights, device, dtype) {
            Ok(vae) => vae,
            Err(err) => {
                warn!(weights = %weights.display(), "decoder substitution failed: {err:#}");
                degradations
                    .push("decoder substitution failed, kept the built-in decoder".to_string());
                config
                    .build_vae(&files.vae, device, dtype)
                    .context("failed to load built-in decoder")?
            }
        },
        None => config
            .build_vae(&files.vae, device, dtype)
            .context("failed to load built-in decoder")?,
    };
    let unet = config
        .build_unet(&files.unet, device, 4, false, dtype)
        .context("failed to load unet")?;

    Ok(SdComponents {
        device: device.clone(),
        dtype,
        config,
        accelerated,
        clip_embed_dim: variant.clip_embed_dim(),
        tokenizer,
        text_model,
        vae,
        unet: Mutex::new(unet),
        unet_weights: files.unet.clone(),
        inversions: Mutex::new(Vec::new()),
    })
}

/// Builds the txt2img / img2img / inpaint stack for a base model, preferring
/// reduced precision on accelerated devices.
pub struct SdLoader {
    device_map: DeviceMap,
}

impl SdLoader {
    pub fn new(device_map: DeviceMap) -> Self {
        Self { device_map }
    }
}

impl PipelineLoader for SdLoader {
    fn build(
        &self,
        base: &ArtifactDescriptor,
        vae: Option<&ArtifactDescriptor>,
    ) -> Result<(PipelineStack, BuildReport)> {
        let device = select_best_device(self.device_map).context("failed to set up device")?;
        let accelerated = !matches!(device, Device::Cpu);
        let variant = SdVariant::from_name(&base.key);
        let files = SdFiles::resolve(base)?;
        let vae_weights = vae.map(resolve_vae_weights).transpose()?;
        let mut degradations = Vec::new();

        info!(base = %base.key, ?variant, accelerated, "building diffusion pipelines");
        let components = if accelerated {
            match build_components(
                &files,
                variant,
                vae_weights.as_ref(),
                &device,
                DType::F16,
                accelerated,
                &mut degradations,
            ) {
                Ok(components) => components,
                Err(err) => {
                    // Recovered: retry at full precision before giving up.
                    warn!("reduced-precision build failed, retrying at full precision: {err:#}");
                    degradations
                        .push("reduced precision unavailable, loaded at full precision".to_string());
                    build_components(
                        &files,
                        variant,
                        vae_weights.as_ref(),
                        &device,
                        DType::F32,
                        accelerated,
                        &mut degradations,
                    )?
                }
            }
        } else {
            build_components(
                &files,
                variant,
                vae_weights.as_ref(),
                &device,
                DType::F32,
                accelerated,
                &mut degradations,
            )?
        };

        // The derived pipelines re-wrap the same components; weights are
        // shared, never duplicated.
        let components = Arc::new(components);
        let stack = PipelineStack {
            txt2img: Box::new(SdPipeline::new(components.clone(), PipelineMode::Plain)),
            img2img: Box::new(SdPipeline::new(
                components.clone(),
                PipelineMode::ImageConditioned,
            )),
            inpaint: Box::new(SdPipeline::new(components, PipelineMode::MaskedInpaint)),
        };
        Ok((stack, BuildReport { degradations }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_sniffing_from_names() {
        assert_eq!(SdVariant::from_name("stable-diffusion-v1-5"), SdVariant::V1_5);
        assert_eq!(SdVariant::from_name("stable-diffusion-v2-1"), SdVariant::V2_1);
        assert_eq!(SdVariant::from_name("dreamshaper-7"), SdVariant::V1_5);
        assert_eq!(SdVariant::from_name("sd2_1-base"), SdVariant::V2_1);
    }

    #[test]
    fn conditioning_width_follows_variant() {
        assert_eq!(SdVariant::V1_5.clip_embed_dim(), 768);
        assert_eq!(SdVariant::V2_1.clip_embed_dim(), 1024);
    }
}
