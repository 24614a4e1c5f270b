pub mod catalog;
pub mod device_map;
pub mod diffusion;
pub mod enhance;
pub mod engine;
pub mod error;
pub mod hub;
pub mod pipeline;
pub mod slot;
pub mod store;
mod util;

pub use catalog::{ArtifactDescriptor, ArtifactKind, ArtifactOrigin, Catalog};
pub use device_map::*;
pub use diffusion::SdLoader;
pub use engine::{Engine, GenerationOutcome, GenerationRequest, ResolvedRequest};
pub use error::GenerateError;
pub use pipeline::{
    AdapterPatch, BuildReport, Pipeline, PipelineLoader, PipelineMode, PipelineStack, SampleJob,
    TextualInversion,
};
pub use slot::{LoadError, LoadReport, ModelSlot, DEFAULT_VAE};
pub use store::{Gallery, GalleryEntry, SidecarMetadata, StoreError};
pub(crate) use util::*;
