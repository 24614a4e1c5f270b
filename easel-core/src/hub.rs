//! Remote artifact acquisition: a static registry of well-known hub artifacts
//! plus a fetcher that populates local storage for the catalog to discover.
//!
//! Nothing in the generation path calls into this module; only the
//! catalog-management surface does.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::catalog::{ArtifactDescriptor, ArtifactKind, ArtifactOrigin, Catalog};

/// A well-known artifact the server can fetch without any local setup.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryEntry {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Hub repository id.
    pub repo: &'static str,
    pub kind: ArtifactKind,
    /// Repository-relative files making up the artifact.
    #[serde(skip)]
    pub files: &'static [&'static str],
}

const PACKAGED_MODEL_FILES: &[&str] = &[
    "model_index.json",
    "text_encoder/model.safetensors",
    "unet/diffusion_pytorch_model.safetensors",
    "vae/diffusion_pytorch_model.safetensors",
];

pub const WELL_KNOWN: &[RegistryEntry] = &[
    RegistryEntry {
        key: "stable-diffusion-v1-5",
        name: "Stable Diffusion v1.5",
        description: "Standard general-purpose model",
        repo: "stable-diffusion-v1-5/stable-diffusion-v1-5",
        kind: ArtifactKind::BaseModel,
        files: PACKAGED_MODEL_FILES,
    },
    RegistryEntry {
        key: "stable-diffusion-v2-1",
        name: "Stable Diffusion v2.1",
        description: "Higher-quality 768px model",
        repo: "stabilityai/stable-diffusion-2-1",
        kind: ArtifactKind::BaseModel,
        files: PACKAGED_MODEL_FILES,
    },
    RegistryEntry {
        key: "vae-ft-mse-840000",
        name: "VAE ft-MSE 840k",
        description: "Fine-tuned decoder with better detail preservation",
        repo: "stabilityai/sd-vae-ft-mse",
        kind: ArtifactKind::Vae,
        files: &["diffusion_pytorch_model.safetensors"],
    },
];

impl RegistryEntry {
    pub fn descriptor(&self) -> ArtifactDescriptor {
        ArtifactDescriptor {
            key: self.key.to_string(),
            name: self.name.to_string(),
            origin: ArtifactOrigin::Registry,
            locator: self.repo.to_string(),
            kind: self.kind,
            description: Some(self.description.to_string()),
        }
    }
}

/// Registry entries of the given kind.
pub fn well_known(kind: ArtifactKind) -> impl Iterator<Item = &'static RegistryEntry> {
    WELL_KNOWN.iter().filter(move |entry| entry.kind == kind)
}

/// Case-insensitive substring search over the registry.
pub fn search(query: &str, kind: ArtifactKind, limit: usize) -> Vec<&'static RegistryEntry> {
    let query = query.to_lowercase();
    well_known(kind)
        .filter(|entry| {
            query.is_empty()
                || entry.key.to_lowercase().contains(&query)
                || entry.name.to_lowercase().contains(&query)
        })
        .take(limit)
        .collect()
}

/// Fetches a well-known artifact into the catalog's local storage, where
/// the next `Catalog::discover` call will pick it up as a local artifact.
pub async fn fetch(key: &str, kind: ArtifactKind, catalog: &Catalog) -> Result<PathBuf> {
    let entry = well_known(kind)
        .find(|entry| entry.key == key)
        .with_context(|| format!("unknown {kind} artifact: {key}"))?;

    let api = hf_hub::api::tokio::Api::new().context("failed to create hub API")?;
    let repo = api.model(entry.repo.to_string());

    // Packaged artifacts land in a keyed directory, single-file ones keep the
    // key as the file stem so discovery keys stay stable.
    let dest_root = if entry.files.len() > 1 {
        catalog.dir_for(kind).join(entry.key)
    } else {
        catalog.dir_for(kind)
    };

    for file in entry.files {
        let cached = repo
            .get(file)
            .await
            .with_context(|| format!("failed to fetch {file} from {}", entry.repo))?;
        let dest = if entry.files.len() > 1 {
            dest_root.join(file)
        } else {
            let extension = cached
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("safetensors");
            dest_root.join(format!("{}.{extension}", entry.key))
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::copy(&cached, &dest)
            .with_context(|| format!("failed to copy {file} into {}", dest.display()))?;
        tracing::info!(file, dest = %dest.display(), "fetched artifact file");
    }
    Ok(dest_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_matches_key_and_name() {
        let hits = search("v1-5", ArtifactKind::BaseModel, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "stable-diffusion-v1-5");

        let hits = search("stable", ArtifactKind::BaseModel, 1);
        assert_eq!(hits.len(), 1);

        assert!(search("v1-5", ArtifactKind::Vae, 10).is_empty());
    }

    #[test]
    fn empty_query_lists_everything_of_kind() {
        let hits = search("", ArtifactKind::Vae, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "vae-ft-mse-840000");
    }
}
