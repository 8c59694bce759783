pub mod adam;
pub mod checkpoint;
pub mod denoiser;
pub mod gaussian_diffusion;
pub mod noise_schedule;

pub use checkpoint::CheckpointCategory;
pub use gaussian_diffusion::GaussianDiffusion;
pub use noise_schedule::NoiseSchedule;

use anyhow::Result;
use candle_core::Tensor;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::loaders::Batch;
use crate::trainers::{Phase, ScheduleSpec};

/// How much of the reverse process `DiffusionModel::test` keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceMode {
    /// Keep only the final denoised image and report a validation loss.
    SingleShot,
    /// Keep the captured intermediate frames, oldest first.
    Trajectory,
}

/// Super-resolved output of the last `test` call.
#[derive(Debug, Clone)]
pub enum SrOutput {
    SingleFrame(Tensor),
    Trajectory(Vec<Tensor>),
}

impl SrOutput {
    pub fn final_frame(&self) -> Option<&Tensor> {
        match self {
            SrOutput::SingleFrame(frame) => Some(frame),
            SrOutput::Trajectory(frames) => frames.last(),
        }
    }
}

/// `[C, H, W]` tensors of the first sample of the current batch.
#[derive(Debug, Clone)]
pub struct VisualBundle {
    pub sr: SrOutput,
    pub hr: Tensor,
    pub lr1: Tensor,
    pub lr2: Tensor,
    pub lr3: Tensor,
}

/// Lifecycle contract the orchestrator drives.
pub trait DiffusionModel {
    /// Step to resume counting from.
    fn begin_step(&self) -> usize;
    /// Epoch to resume counting from.
    fn begin_epoch(&self) -> usize;
    fn set_new_noise_schedule(&mut self, spec: &ScheduleSpec, phase: Phase) -> Result<()>;
    fn feed_data(&mut self, batch: Batch) -> Result<()>;
    /// One gradient update on the fed batch.
    fn optimize_parameters(&mut self) -> Result<()>;
    fn get_current_log(&self) -> BTreeMap<String, f64>;
    /// Run the reverse process on the fed batch. `SingleShot` also returns
    /// the denoising loss of the batch.
    fn test(&mut self, mode: InferenceMode) -> Result<Option<f64>>;
    fn get_current_visuals(&self) -> Result<VisualBundle>;
    /// Source paths of the fed batch.
    fn current_paths(&self) -> &[PathBuf];
    fn save_checkpoint(
        &mut self,
        category: CheckpointCategory,
        epoch: usize,
        step: usize,
    ) -> Result<()>;

    fn save_network(&mut self, epoch: usize, step: usize) -> Result<()> {
        self.save_checkpoint(CheckpointCategory::Latest, epoch, step)
    }

    fn save_best_loss(&mut self, epoch: usize, step: usize) -> Result<()> {
        self.save_checkpoint(CheckpointCategory::BestLoss, epoch, step)
    }

    fn save_best_psnr(&mut self, epoch: usize, step: usize) -> Result<()> {
        self.save_checkpoint(CheckpointCategory::BestPsnr, epoch, step)
    }

    fn save_best_both(&mut self, epoch: usize, step: usize) -> Result<()> {
        self.save_checkpoint(CheckpointCategory::BestBoth, epoch, step)
    }
}
