//! Rank-decomposition weight patching and negative-embedding loading.
//!
//! Adapters are merged as `weight + scale * (alpha / rank) * up @ down` into a
//! fresh copy of the unet weights; removal rebuilds from the pristine file, so
//! no patch state can leak between requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{info, warn};

use super::SdComponents;
use crate::catalog::ArtifactDescriptor;

/// Attaches the adapter at `locator` to the shared unet.
pub(crate) fn merge_into(components: &SdComponents, locator: &str, scale: f64) -> Result<()> {
    let path = Path::new(locator);
    if !path.is_file() {
        anyhow::bail!("adapter locator {locator} is not a readable file");
    }

    // Merge on the CPU in full precision; only the rebuilt unet lands on the
    // compute device.
    let mut weights = candle_core::safetensors::load(&components.unet_weights, &Device::Cpu)
        .context("failed to read unet weights")?;
    let patch = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read adapter {locator}"))?;

    let mut patched = 0usize;
    for (name, tensor) in weights.iter_mut() {
        let Some(stem) = name.strip_suffix(".weight") else {
            continue;
        };
        let flat = format!("lora_unet_{}", stem.replace('.', "_"));
        let (Some(down), Some(up)) = (
            patch.get(&format!("{flat}.lora_down.weight")),
            patch.get(&format!("{flat}.lora_up.weight")),
        ) else {
            continue;
        };
        match merged_weight(tensor, down, up, &patch, &flat, scale) {
            Ok(merged) => {
                *tensor = merged;
                patched += 1;
            }
            Err(err) => warn!(layer = %flat, "skipping adapter layer: {err:#}"),
        }
    }
    if patched == 0 {
        anyhow::bail!("adapter {locator} matched no unet layers");
    }

    swap_unet(components, &weights)?;
    info!(locator, patched, scale, "adapter merged into unet");
    Ok(())
}

/// Rebuilds the unet from the pristine weights, detaching any patch.
/// Best-effort: a rebuild failure leaves the patched unet in place and is only
/// logged, but that path means the weight file disappeared mid-run.
pub(crate) fn restore(components: &SdComponents) {
    let result = components
        .config
        .build_unet(
            &components.unet_weights,
            &components.device,
            4,
            false,
            components.dtype,
        )
        .and_then(|unet| {
            let mut slot = components
                .unet
                .lock()
                .map_err(|_| candle_core::Error::Msg("unet handle poisoned".to_string()))?;
            *slot = unet;
            Ok(())
        });
    match result {
        Ok(()) => info!("adapter removed, pristine unet restored"),
        Err(err) => warn!("failed to restore pristine unet: {err:#}"),
    }
}

fn merged_weight(
    weight: &Tensor,
    down: &Tensor,
    up: &Tensor,
    patch: &HashMap<String, Tensor>,
    flat: &str,
    scale: f64,
) -> Result<Tensor> {
    let down = down.to_dtype(DType::F32)?;
    let up = up.to_dtype(DType::F32)?;
    let rank = down.dim(0)? as f64;
    let alpha = match patch.get(&format!("{flat}.alpha")) {
        Some(alpha) => alpha.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64,
        None => rank,
    };
    let factor = scale * alpha / rank;

    let delta = match (up.rank(), down.rank()) {
        (2, 2) => up.matmul(&down)?,
        // 1x1 convolutions carry trailing unit dims.
        (4, 4) => {
            let (o, r, kh, kw) = up.dims4()?;
            let (r2, i, kh2, kw2) = down.dims4()?;
            if r != r2 || kh != 1 || kw != 1 || kh2 != 1 || kw2 != 1 {
                anyhow::bail!("unsupported convolutional adapter shape");
            }
            up.reshape((o, r))?
                .matmul(&down.reshape((r2, i))?)?
                .reshape((o, i, 1, 1))?
        }
        _ => anyhow::bail!("unsupported adapter tensor ranks"),
    };
    let delta = delta.reshape(weight.shape())?;
    let merged = (weight.to_dtype(DType::F32)? + (delta * factor)?)?;
    Ok(merged.to_dtype(weight.dtype())?)
}

fn swap_unet(components: &SdComponents, weights: &HashMap<String, Tensor>) -> Result<()> {
    // build_unet only takes a weights file, so the merged map goes through a
    // scratch file that is removed once the unet is up.
    let scratch = scratch_path();
    candle_core::safetensors::save(weights, &scratch).context("failed to write merged weights")?;
    let built = components.config.build_unet(
        &scratch,
        &components.device,
        4,
        false,
        components.dtype,
    );
    let _ = std::fs::remove_file(&scratch);
    let unet = built.context("failed to build patched unet")?;

    let mut slot = components
        .unet
        .lock()
        .map_err(|_| anyhow::anyhow!("unet handle poisoned"))?;
    *slot = unet;
    Ok(())
}

fn scratch_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "easel-adapter-{}-{:08x}.safetensors",
        std::process::id(),
        rand::random::<u32>()
    ))
}

/// Loads the conditioning vectors of a negative embedding, validated against
/// the text model's embedding width.
pub(crate) fn load_concept_vectors(
    descriptor: &ArtifactDescriptor,
    embed_dim: usize,
    device: &Device,
) -> Result<Tensor> {
    let path = Path::new(&descriptor.locator);
    if !path.is_file() {
        anyhow::bail!("embedding {} is not a readable file", descriptor.locator);
    }
    if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
        anyhow::bail!("embedding {} must be a safetensors file", descriptor.locator);
    }
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("failed to read embedding {}", descriptor.locator))?;

    let vectors = tensors
        .get("emb_params")
        .cloned()
        .or_else(|| tensors.values().find(|t| t.rank() == 2).cloned())
        .or_else(|| {
            tensors
                .values()
                .find(|t| t.rank() == 1)
                .and_then(|t| t.unsqueeze(0).ok())
        })
        .context("no conditioning vectors found in embedding file")?;
    let (_, dim) = vectors.dims2().context("unexpected embedding tensor shape")?;
    if dim != embed_dim {
        anyhow::bail!("embedding width {dim} does not match text model width {embed_dim}");
    }
    Ok(vectors)
}
