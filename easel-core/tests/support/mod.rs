//! Deterministic in-memory pipeline stack standing in for the candle-backed
//! sampler, plus catalog/gallery fixtures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use easel_core::{
    AdapterPatch, ArtifactDescriptor, ArtifactKind, BuildReport, Catalog, Engine, Gallery,
    Pipeline, PipelineLoader, PipelineMode, PipelineStack, SampleJob, TextualInversion,
};
use image::DynamicImage;

/// State shared by the three derived fake pipelines, mirroring how the real
/// stack shares one unet.
#[derive(Default)]
pub struct StackState {
    pub adapter: Option<(String, f64)>,
    pub registered: Vec<String>,
    pub samples: usize,
}

pub struct FakePipeline {
    state: Arc<Mutex<StackState>>,
    mode: PipelineMode,
    fail_sampling: bool,
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

impl Pipeline for FakePipeline {
    fn sample(&mut self, job: &SampleJob) -> anyhow::Result<DynamicImage> {
        if self.fail_sampling {
            return Err(anyhow!("sampler exploded"));
        }
        let mut state = self.state.lock().unwrap();
        state.samples += 1;

        // The raster is a pure function of the job and the live adapter
        // state, so seed threading and teardown residue are observable.
        let mut key = format!(
            "{}|{}|{}|{}|{}|{}|{:?}",
            job.prompt, job.negative_prompt, job.steps, job.seed, job.width, job.height, self.mode
        );
        if let Some((locator, scale)) = &state.adapter {
            key.push_str(&format!("|adapter:{locator}:{scale}"));
        }
        let digest = fnv1a(key.as_bytes());
        let pixels: Vec<u8> = (0..16u64 * 16 * 3)
            .map(|i| (digest.wrapping_mul(i.wrapping_add(1)) >> 32) as u8)
            .collect();
        let buffer = image::RgbImage::from_raw(16, 16, pixels).unwrap();
        Ok(DynamicImage::ImageRgb8(buffer))
    }

    fn adapter_patch(&mut self) -> Option<&mut dyn AdapterPatch> {
        Some(self)
    }

    fn textual_inversion(&mut self) -> Option<&mut dyn TextualInversion> {
        Some(self)
    }
}

impl AdapterPatch for FakePipeline {
    fn apply(&mut self, locator: &str, scale: f64) -> anyhow::Result<()> {
        if locator.ends_with(".broken") {
            return Err(anyhow!("malformed adapter file"));
        }
        self.state.lock().unwrap().adapter = Some((locator.to_string(), scale));
        Ok(())
    }

    fn remove(&mut self) {
        self.state.lock().unwrap().adapter = None;
    }
}

impl TextualInversion for FakePipeline {
    fn register(&mut self, descriptor: &ArtifactDescriptor) -> anyhow::Result<String> {
        if descriptor.key != "easynegative" {
            return Err(anyhow!("unsupported embedding format"));
        }
        let trigger = descriptor.key.clone();
        self.state.lock().unwrap().registered.push(trigger.clone());
        Ok(trigger)
    }
}

pub struct FakeLoader {
    pub builds: Arc<AtomicUsize>,
    pub state: Arc<Mutex<StackState>>,
    pub fail_sampling: bool,
    /// Reported with every build, standing in for recovered load failures.
    pub build_degradations: Vec<String>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            builds: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(StackState::default())),
            fail_sampling: false,
            build_degradations: Vec::new(),
        }
    }
}

impl PipelineLoader for FakeLoader {
    fn build(
        &self,
        _base: &ArtifactDescriptor,
        _vae: Option<&ArtifactDescriptor>,
    ) -> anyhow::Result<(PipelineStack, BuildReport)> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let pipeline = |mode| {
            Box::new(FakePipeline {
                state: self.state.clone(),
                mode,
                fail_sampling: self.fail_sampling,
            }) as Box<dyn Pipeline>
        };
        Ok((
            PipelineStack {
                txt2img: pipeline(PipelineMode::Plain),
                img2img: pipeline(PipelineMode::ImageConditioned),
                inpaint: pipeline(PipelineMode::MaskedInpaint),
            },
            BuildReport {
                degradations: self.build_degradations.clone(),
            },
        ))
    }
}

pub struct Fixture {
    /// Keeps the fixture directories alive for the test's duration.
    pub _tmp: tempfile::TempDir,
    pub builds: Arc<AtomicUsize>,
    pub state: Arc<Mutex<StackState>>,
    pub engine: Engine,
}

/// An engine over a catalog containing the `sd-v1-5` and `other-model` base
/// models plus the `easynegative` embedding, backed by the fake stack.
pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(configure: impl FnOnce(&mut FakeLoader)) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(tmp.path().join("artifacts"));

    let models = catalog.dir_for(ArtifactKind::BaseModel);
    std::fs::create_dir_all(models.join("sd-v1-5")).unwrap();
    std::fs::write(models.join("sd-v1-5/model_index.json"), b"{}").unwrap();
    std::fs::write(models.join("other-model.safetensors"), b"").unwrap();

    let embeddings = catalog.dir_for(ArtifactKind::Embedding);
    std::fs::create_dir_all(&embeddings).unwrap();
    std::fs::write(embeddings.join("easynegative.safetensors"), b"").unwrap();
    std::fs::write(embeddings.join("baddream.safetensors"), b"").unwrap();

    let gallery = Gallery::new(tmp.path().join("generated")).unwrap();
    let mut loader = FakeLoader::new();
    configure(&mut loader);
    let builds = loader.builds.clone();
    let state = loader.state.clone();
    let engine = Engine::new(catalog, gallery, Box::new(loader));
    Fixture {
        _tmp: tmp,
        builds,
        state,
        engine,
    }
}
