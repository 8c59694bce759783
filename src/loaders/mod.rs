pub mod triplet_dataset;

pub use triplet_dataset::{TripletDataset, TripletLoader};

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::path::PathBuf;

use crate::trainers::{DatasetSpec, Phase};

/// One batch of aligned views, each `[B, 3, H, W]` in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub lr1: Tensor,
    pub lr2: Tensor,
    pub lr3: Tensor,
    pub hr: Tensor,
    /// HR file of every sample, in batch order.
    pub paths: Vec<PathBuf>,
}

impl Batch {
    pub fn to_device(self, device: &Device) -> Result<Self> {
        Ok(Self {
            lr1: self.lr1.to_device(device)?,
            lr2: self.lr2.to_device(device)?,
            lr3: self.lr3.to_device(device)?,
            hr: self.hr.to_device(device)?,
            paths: self.paths,
        })
    }
}

/// Finite, re-iterable source of batches. Every call to `iter_epoch`
/// starts a fresh pass over the data.
pub trait BatchLoader {
    /// Number of batches one epoch yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn iter_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

pub fn create_dataset(spec: &DatasetSpec, phase: Phase) -> Result<TripletDataset> {
    let dataset = TripletDataset::open(spec, phase)?;
    log::info!(
        "Dataset [{}] for {} created with {} samples",
        spec.name,
        phase,
        dataset.len()
    );
    Ok(dataset)
}

pub fn create_dataloader(
    dataset: TripletDataset,
    spec: &DatasetSpec,
    phase: Phase,
    device: &Device,
) -> Result<TripletLoader> {
    match phase {
        Phase::Train => TripletLoader::new(
            dataset,
            spec.batch_size,
            spec.use_shuffle,
            true,
            spec.num_workers,
            device.clone(),
        ),
        Phase::Val => TripletLoader::new(dataset, 1, false, false, 1, device.clone()),
    }
}
