//! Append-only gallery of generated artifacts: raster + sidecar metadata
//! pairs, queryable newest-first.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("gallery io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode raster: {0}")]
    Encode(#[from] image::ImageError),

    #[error("failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no records in the gallery")]
    NoRecords,
}

/// Sidecar record written next to every raster, sharing its filename stem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarMetadata {
    #[serde(default)]
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub vae: String,
    pub lora: Option<String>,
    pub lora_scale: f64,
    pub negative_embedding: Option<String>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    pub width: usize,
    pub height: usize,
    pub upscale: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<String>,
}

/// One gallery listing entry. `metadata` is absent when the sidecar is missing
/// or unparsable; the raster still lists.
#[derive(Debug, Clone, Serialize)]
pub struct GalleryEntry {
    pub filename: String,
    pub url: String,
    pub modified: DateTime<Utc>,
    pub metadata: Option<SidecarMetadata>,
}

#[derive(Debug, Clone)]
pub struct Gallery {
    dir: PathBuf,
}

impl Gallery {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the raster and its sidecar as a unit and returns the assigned
    /// raster filename. The raster goes first so a sidecar never exists
    /// without it; a failed sidecar write removes the raster again.
    pub fn persist(
        &self,
        image: &image::DynamicImage,
        metadata: SidecarMetadata,
    ) -> Result<String, StoreError> {
        let stem = format!(
            "gen-{}-{:06x}",
            metadata.timestamp.format("%Y%m%d-%H%M%S"),
            rand::random::<u32>() & 0xff_ffff
        );
        let filename = format!("{stem}.png");
        let raster_path = self.dir.join(&filename);
        let sidecar_path = self.dir.join(format!("{stem}.json"));

        image.save(&raster_path)?;

        let metadata = SidecarMetadata {
            filename: filename.clone(),
            ..metadata
        };
        let encoded = serde_json::to_vec_pretty(&metadata)?;
        if let Err(err) = std::fs::write(&sidecar_path, encoded) {
            let _ = std::fs::remove_file(&raster_path);
            return Err(err.into());
        }
        Ok(filename)
    }

    /// All records, newest first by raster modification time.
    pub fn list(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let mut entries = Vec::new();
        let dir = match std::fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(GalleryEntry {
                filename: filename.to_string(),
                url: format!("/images/{filename}"),
                modified,
                metadata: self.read_sidecar(&path),
            });
        }
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(entries)
    }

    /// Metadata of the most recently modified record.
    pub fn latest(&self) -> Result<SidecarMetadata, StoreError> {
        self.list()?
            .into_iter()
            .find_map(|entry| entry.metadata)
            .ok_or(StoreError::NoRecords)
    }

    fn read_sidecar(&self, raster_path: &Path) -> Option<SidecarMetadata> {
        let sidecar = raster_path.with_extension("json");
        let bytes = std::fs::read(&sidecar).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                warn!(sidecar = %sidecar.display(), "unparsable sidecar: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(prompt: &str) -> SidecarMetadata {
        SidecarMetadata {
            filename: String::new(),
            timestamp: Utc::now(),
            prompt: prompt.to_string(),
            negative_prompt: String::new(),
            model: "stable-diffusion-v1-5".to_string(),
            vae: "default".to_string(),
            lora: None,
            lora_scale: 0.75,
            negative_embedding: None,
            steps: 20,
            guidance_scale: 7.5,
            seed: 42,
            width: 512,
            height: 512,
            upscale: 0,
            degradations: Vec::new(),
        }
    }

    #[test]
    fn persist_writes_pair_and_list_orders_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = Gallery::new(tmp.path()).unwrap();
        let img = image::DynamicImage::new_rgb8(4, 4);

        let first = gallery.persist(&img, metadata("first")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = gallery.persist(&img, metadata("second")).unwrap();

        assert!(first.starts_with("gen-") && first.ends_with(".png"));
        assert_ne!(first, second);

        let listed = gallery.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].filename, second);
        assert_eq!(listed[1].filename, first);
        assert_eq!(listed[0].metadata.as_ref().unwrap().prompt, "second");
        assert_eq!(listed[0].url, format!("/images/{second}"));

        let latest = gallery.latest().unwrap();
        assert_eq!(latest.prompt, "second");
        assert_eq!(latest.filename, second);
    }

    #[test]
    fn listing_tolerates_missing_and_unparsable_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = Gallery::new(tmp.path()).unwrap();
        let img = image::DynamicImage::new_rgb8(4, 4);

        let filename = gallery.persist(&img, metadata("kept")).unwrap();
        let stem = filename.trim_end_matches(".png");

        // A bare raster with no sidecar.
        img.save(tmp.path().join("gen-orphan.png")).unwrap();
        // Corrupt the real sidecar of a third record.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let corrupted = gallery.persist(&img, metadata("corrupt")).unwrap();
        std::fs::write(
            tmp.path().join(corrupted.replace(".png", ".json")),
            b"not json",
        )
        .unwrap();

        let listed = gallery.list().unwrap();
        assert_eq!(listed.len(), 3);
        let orphan = listed.iter().find(|e| e.filename == "gen-orphan.png");
        assert!(orphan.unwrap().metadata.is_none());
        let corrupt = listed.iter().find(|e| e.filename == corrupted).unwrap();
        assert!(corrupt.metadata.is_none());

        // latest() skips records without metadata.
        assert_eq!(gallery.latest().unwrap().filename, format!("{stem}.png"));
    }

    #[test]
    fn latest_on_empty_gallery_is_no_records() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = Gallery::new(tmp.path()).unwrap();
        assert!(matches!(gallery.latest(), Err(StoreError::NoRecords)));
    }

    #[test]
    fn sidecar_round_trips_all_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let gallery = Gallery::new(tmp.path()).unwrap();
        let img = image::DynamicImage::new_rgb8(4, 4);

        let mut meta = metadata("round trip");
        meta.lora = Some("better-hands".to_string());
        meta.negative_embedding = Some("easynegative".to_string());
        meta.degradations = vec!["adapter skipped: malformed file".to_string()];
        let filename = gallery.persist(&img, meta.clone()).unwrap();

        let restored = gallery.latest().unwrap();
        assert_eq!(
            restored,
            SidecarMetadata {
                filename,
                ..meta
            }
        );
    }
}
