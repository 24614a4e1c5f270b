//! Discovery of locally stored artifacts plus the static fallback registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hub;

/// Recognized weight-file extensions for single-file artifacts.
const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "bin"];

/// Marker file identifying a complete packaged (diffusers-layout) artifact.
const PACKAGE_MARKER: &str = "model_index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    BaseModel,
    Vae,
    Lora,
    Embedding,
    ControlNet,
    Upscaler,
}

serde_plain::derive_display_from_serialize!(ArtifactKind);
serde_plain::derive_fromstr_from_deserialize!(ArtifactKind);

impl ArtifactKind {
    /// Directory name that holds artifacts of this kind under the catalog root.
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::BaseModel => "models",
            ArtifactKind::Vae => "vaes",
            ArtifactKind::Lora => "loras",
            ArtifactKind::Embedding => "embeddings",
            ArtifactKind::ControlNet => "controlnets",
            ArtifactKind::Upscaler => "upscalers",
        }
    }

    /// Kinds backed by the static fallback registry when nothing is stored locally.
    fn has_registry_fallback(self) -> bool {
        matches!(self, ArtifactKind::BaseModel | ArtifactKind::Vae)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactOrigin {
    LocalFile,
    LocalDir,
    Registry,
}

/// One discoverable artifact. Immutable once discovered; re-discovery replaces
/// the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactDescriptor {
    pub key: String,
    pub name: String,
    pub origin: ArtifactOrigin,
    /// Filesystem path for local artifacts, hub repository id for registry ones.
    pub locator: String,
    pub kind: ArtifactKind,
    pub description: Option<String>,
}

/// Looks up available artifacts by kind. Pure reads, no caching, no mutation of
/// live state; callers may re-discover on every listing request.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Returns every known artifact of `kind`, keyed by name. Locally stored
    /// artifacts shadow registry entries sharing the same key. A missing root
    /// directory yields an empty map, not an error.
    pub fn discover(&self, kind: ArtifactKind) -> BTreeMap<String, ArtifactDescriptor> {
        let mut found = BTreeMap::new();

        if kind.has_registry_fallback() {
            for entry in hub::well_known(kind) {
                found.insert(entry.key.to_string(), entry.descriptor());
            }
        }

        let dir = self.dir_for(kind);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return found,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(descriptor) = Self::descriptor_for_path(&path, kind) {
                found.insert(descriptor.key.clone(), descriptor);
            }
        }
        found
    }

    /// Resolves a single key, local artifacts taking priority.
    pub fn resolve(&self, kind: ArtifactKind, key: &str) -> Option<ArtifactDescriptor> {
        self.discover(kind).remove(key)
    }

    fn descriptor_for_path(path: &Path, kind: ArtifactKind) -> Option<ArtifactDescriptor> {
        if path.is_dir() {
            if !path.join(PACKAGE_MARKER).is_file() {
                return None;
            }
            let key = path.file_name()?.to_str()?.to_string();
            return Some(ArtifactDescriptor {
                name: key.clone(),
                key,
                origin: ArtifactOrigin::LocalDir,
                locator: path.to_string_lossy().into_owned(),
                kind,
                description: None,
            });
        }
        let extension = path.extension()?.to_str()?;
        if !WEIGHT_EXTENSIONS.contains(&extension) {
            return None;
        }
        let key = path.file_stem()?.to_str()?.to_string();
        Some(ArtifactDescriptor {
            name: key.clone(),
            key,
            origin: ArtifactOrigin::LocalFile,
            locator: path.to_string_lossy().into_owned(),
            kind,
            description: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn missing_root_yields_registry_fallback_only() {
        let catalog = Catalog::new("/nonexistent/easel-test-root");
        let models = catalog.discover(ArtifactKind::BaseModel);
        assert!(models.contains_key("stable-diffusion-v1-5"));
        assert!(models
            .values()
            .all(|d| d.origin == ArtifactOrigin::Registry));
        assert!(catalog.discover(ArtifactKind::Lora).is_empty());
    }

    #[test]
    fn discovers_weight_files_and_packaged_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(tmp.path());
        let loras = catalog.dir_for(ArtifactKind::Lora);
        std::fs::create_dir_all(&loras).unwrap();
        touch(&loras.join("better-hands.safetensors"));
        touch(&loras.join("notes.txt"));

        let models = catalog.dir_for(ArtifactKind::BaseModel);
        let packaged = models.join("my-model");
        std::fs::create_dir_all(&packaged).unwrap();
        touch(&packaged.join(PACKAGE_MARKER));
        std::fs::create_dir_all(models.join("not-a-model")).unwrap();

        let loras = catalog.discover(ArtifactKind::Lora);
        assert_eq!(loras.len(), 1);
        assert_eq!(loras["better-hands"].origin, ArtifactOrigin::LocalFile);

        let models = catalog.discover(ArtifactKind::BaseModel);
        let my_model = &models["my-model"];
        assert_eq!(my_model.origin, ArtifactOrigin::LocalDir);
        assert!(!models.contains_key("not-a-model"));
    }

    #[test]
    fn local_artifact_shadows_registry_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(tmp.path());
        let models = catalog.dir_for(ArtifactKind::BaseModel);
        std::fs::create_dir_all(&models).unwrap();
        touch(&models.join("stable-diffusion-v1-5.safetensors"));

        let discovered = catalog.discover(ArtifactKind::BaseModel);
        assert_eq!(
            discovered["stable-diffusion-v1-5"].origin,
            ArtifactOrigin::LocalFile
        );
    }

    #[test]
    fn kind_round_trips_as_string() {
        assert_eq!(ArtifactKind::BaseModel.to_string(), "base-model");
        assert_eq!(
            "negative".parse::<ArtifactKind>().ok(),
            None::<ArtifactKind>
        );
        assert_eq!("vae".parse::<ArtifactKind>().unwrap(), ArtifactKind::Vae);
    }
}
