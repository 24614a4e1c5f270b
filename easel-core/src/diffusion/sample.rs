//! The denoising loop shared by the plain, image-conditioned and
//! masked-inpaint pipelines.

use std::sync::Arc;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use candle_transformers::models::stable_diffusion::euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::{
    Scheduler, SchedulerConfig, TimestepSpacing,
};
use image::DynamicImage;
use tracing::debug;

use super::{lora, SdComponents, TextualConcept};
use crate::catalog::ArtifactDescriptor;
use crate::pipeline::{AdapterPatch, Pipeline, PipelineMode, SampleJob, TextualInversion};
use crate::{image_to_tensor, tensor_to_image};

const VAE_SCALE: f64 = 0.18215;

pub struct SdPipeline {
    components: Arc<SdComponents>,
    mode: PipelineMode,
}

impl SdPipeline {
    pub(crate) fn new(components: Arc<SdComponents>, mode: PipelineMode) -> Self {
        Self { components, mode }
    }

    fn build_scheduler(&self, steps: usize) -> Result<Box<dyn Scheduler>> {
        if self.components.accelerated {
            // Multistep solver with boundary-aware (trailing) step spacing on
            // capable devices; the config default otherwise.
            let config = EulerAncestralDiscreteSchedulerConfig {
                timestep_spacing: TimestepSpacing::Trailing,
                ..Default::default()
            };
            Ok(config.build(steps)?)
        } else {
            Ok(self.components.config.build_scheduler(steps)?)
        }
    }

    /// Encodes a prompt into padded CLIP token ids.
    fn tokenize(&self, prompt: &str) -> Result<Tensor> {
        let c = &self.components;
        let pad_token = c.config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *c
            .tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no pad token {pad_token}"))?;
        let mut tokens = c
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = c.config.clip.max_position_embeddings;
        tokens.truncate(max_len);
        while tokens.len() < max_len {
            tokens.push(pad_id);
        }
        Ok(Tensor::new(tokens.as_slice(), &c.device)?.unsqueeze(0)?)
    }

    /// Classifier-free-guidance embeddings: unconditional stacked on
    /// conditional. Registered negative concepts are spliced over the trailing
    /// pad positions of the unconditional half.
    fn text_embeddings(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let c = &self.components;
        let cond = c.text_model.forward(&self.tokenize(prompt)?)?;
        let mut uncond = c.text_model.forward(&self.tokenize(negative_prompt)?)?;

        let inversions = c
            .inversions
            .lock()
            .map_err(|_| Error::msg("textual inversion registry poisoned"))?;
        for concept in inversions.iter() {
            if !negative_prompt.to_lowercase().contains(&concept.trigger) {
                continue;
            }
            uncond = splice_concept(&uncond, &concept.vectors)?;
        }
        drop(inversions);

        Ok(Tensor::cat(&[uncond, cond], 0)?.to_dtype(c.dtype)?)
    }

    /// Encodes the init image into scaled latents.
    fn encode_init_image(&self, image: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
        let c = &self.components;
        let tensor = image_to_tensor(image, width, height, &c.device, c.dtype)?;
        let dist = c.vae.encode(&tensor)?;
        Ok((dist.sample()? * VAE_SCALE)?)
    }

    /// Downsamples the mask to latent resolution: 1.0 where the image is
    /// repainted, 0.0 where the original is kept.
    fn mask_latent(&self, mask: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
        let c = &self.components;
        let (lw, lh) = (width / 8, height / 8);
        let mask = mask.resize_exact(lw as u32, lh as u32, image::imageops::FilterType::Triangle);
        let values: Vec<f32> = mask
            .to_luma8()
            .into_raw()
            .into_iter()
            .map(|v| if v > 127 { 1f32 } else { 0f32 })
            .collect();
        Ok(Tensor::from_vec(values, (1, 1, lh, lw), &c.device)?.to_dtype(c.dtype)?)
    }
}

/// Initial latent noise. The CPU backend has no seedable device rng, so
/// latents are drawn from a seed-keyed host rng there; accelerated devices use
/// the device rng seeded in `sample`.
fn latent_noise(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if matches!(device, Device::Cpu) {
        let mut rng = StdRng::seed_from_u64(seed);
        let count = shape.0 * shape.1 * shape.2 * shape.3;
        let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
        Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
    } else {
        Ok(Tensor::randn(0f32, 1f32, shape, device)?.to_dtype(dtype)?)
    }
}

/// First denoised timestep index for image-conditioned sampling. Always in
/// bounds: at least one denoise step runs even when the strength is below one
/// step's worth.
fn conditioning_start(steps: usize, strength: f64) -> usize {
    let conditioned = ((steps as f64 * strength) as usize).clamp(1, steps);
    steps - conditioned
}

fn splice_concept(embedding: &Tensor, vectors: &Tensor) -> Result<Tensor> {
    let (_, seq_len, _) = embedding.dims3()?;
    let count = vectors.dim(0)?.min(seq_len - 1);
    let prefix = embedding.narrow(1, 0, seq_len - count)?;
    let spliced = vectors
        .narrow(0, 0, count)?
        .unsqueeze(0)?
        .to_dtype(embedding.dtype())?;
    Ok(Tensor::cat(&[prefix, spliced], 1)?)
}

impl Pipeline for SdPipeline {
    fn sample(&mut self, job: &SampleJob) -> Result<DynamicImage> {
        let c = self.components.clone();
        if !matches!(c.device, Device::Cpu) {
            c.device.set_seed(job.seed)?;
        }

        let mut scheduler = self.build_scheduler(job.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let text_embeddings = self.text_embeddings(&job.prompt, &job.negative_prompt)?;
        let use_guidance = job.guidance_scale > 1.0;
        let text_embeddings = if use_guidance {
            text_embeddings
        } else {
            // Drop the unconditional half when guidance is off.
            text_embeddings.i(1..2)?
        };

        let latent_shape = (1, 4, job.height / 8, job.width / 8);
        let noise = latent_noise(job.seed, latent_shape, &c.device, c.dtype)?;

        let (mut latents, t_start, init_latents) = match self.mode {
            PipelineMode::Plain => {
                let latents = (noise.clone() * scheduler.init_noise_sigma())?;
                (latents, 0, None)
            }
            PipelineMode::ImageConditioned | PipelineMode::MaskedInpaint => {
                let init = job
                    .init_image
                    .as_ref()
                    .context("image-conditioned sampling requires an init image")?;
                let init_latents = self.encode_init_image(init, job.width, job.height)?;
                let t_start = conditioning_start(job.steps, job.strength);
                let noised = scheduler.add_noise(&init_latents, noise.clone(), timesteps[t_start])?;
                (noised, t_start, Some(init_latents))
            }
        };
        let mask = match self.mode {
            PipelineMode::MaskedInpaint => {
                let mask = job
                    .mask_image
                    .as_ref()
                    .context("masked inpainting requires a mask image")?;
                Some(self.mask_latent(mask, job.width, job.height)?)
            }
            _ => None,
        };

        let unet = c
            .unet
            .lock()
            .map_err(|_| Error::msg("unet handle poisoned"))?;
        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = unet.forward(&input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * job.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            // Re-anchor the preserved region each step.
            if let (Some(mask), Some(init_latents)) = (&mask, &init_latents) {
                let anchored = scheduler.add_noise(init_latents, noise.clone(), timestep)?;
                let keep = mask.broadcast_mul(&latents)?;
                let original = (1.0 - mask)?.broadcast_mul(&anchored)?;
                latents = (keep + original)?;
            }
            debug!(step = index + 1, total = timesteps.len(), "denoise step");
        }
        drop(unet);

        let image = c.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image.to_dtype(DType::F32)? / 2.)? + 0.5)?;
        let image = (image.clamp(0f32, 1f32)? * 255.)?
            .to_dtype(DType::U8)?
            .to_device(&candle_core::Device::Cpu)?;
        tensor_to_image(&image.i(0)?)
    }

    fn adapter_patch(&mut self) -> Option<&mut dyn AdapterPatch> {
        Some(self)
    }

    fn textual_inversion(&mut self) -> Option<&mut dyn TextualInversion> {
        Some(self)
    }
}

impl AdapterPatch for SdPipeline {
    fn apply(&mut self, locator: &str, scale: f64) -> Result<()> {
        lora::merge_into(&self.components, locator, scale)
    }

    fn remove(&mut self) {
        lora::restore(&self.components);
    }
}

impl TextualInversion for SdPipeline {
    fn register(&mut self, descriptor: &ArtifactDescriptor) -> Result<String> {
        let vectors = lora::load_concept_vectors(
            descriptor,
            self.components.clip_embed_dim,
            &self.components.device,
        )?;
        let trigger = descriptor.key.to_lowercase();
        let mut inversions = self
            .components
            .inversions
            .lock()
            .map_err(|_| Error::msg("textual inversion registry poisoned"))?;
        if !inversions.iter().any(|c| c.trigger == trigger) {
            inversions.push(TextualConcept {
                trigger: trigger.clone(),
                vectors,
            });
        }
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_latent_noise_is_keyed_by_seed_alone() {
        let device = Device::Cpu;
        let shape = (1, 4, 8, 8);
        let a = latent_noise(42, shape, &device, DType::F32).unwrap();
        let b = latent_noise(42, shape, &device, DType::F32).unwrap();
        let c = latent_noise(43, shape, &device, DType::F32).unwrap();
        let flat = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat(&a), flat(&b));
        assert_ne!(flat(&a), flat(&c));
    }

    #[test]
    fn conditioning_start_stays_in_bounds() {
        // Strengths below one step's worth still leave one denoise step.
        assert_eq!(conditioning_start(20, 0.01), 19);
        assert_eq!(conditioning_start(20, 0.04), 19);
        assert_eq!(conditioning_start(20, 0.05), 19);
        assert_eq!(conditioning_start(20, 0.8), 4);
        assert_eq!(conditioning_start(20, 1.0), 0);
        assert_eq!(conditioning_start(1, 0.5), 0);
        for steps in [1usize, 7, 20, 50] {
            for strength in [0.001, 0.2, 0.5, 0.999, 1.0] {
                assert!(conditioning_start(steps, strength) < steps);
            }
        }
    }
}
