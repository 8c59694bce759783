pub mod trainers;
pub mod loaders;
pub mod models;
pub mod logging;

// Re-export common types
pub use trainers::{load_config, Phase, RunConfig, RunOverrides};
pub use trainers::orchestrator::Orchestrator;
pub use models::{DiffusionModel, InferenceMode, SrOutput, VisualBundle};
pub use loaders::{Batch, BatchLoader};
