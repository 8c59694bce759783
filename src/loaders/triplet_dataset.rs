//! Folder dataset of three low-resolution views plus their high-resolution
//! target:
//!
//! ```text
//! dataroot/
//!   <sample>/lr1.png lr2.png lr3.png hr.png
//! ```

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use super::{Batch, BatchLoader};
use crate::trainers::{DatasetSpec, Phase};

const LR_FILES: [&str; 3] = ["lr1.png", "lr2.png", "lr3.png"];
const HR_FILE: &str = "hr.png";

#[derive(Debug, Clone)]
pub struct TripletSample {
    pub lr: [PathBuf; 3],
    pub hr: PathBuf,
}

pub struct TripletDataset {
    samples: Vec<TripletSample>,
    /// `(height, width)` of the LR capture.
    l_res: (u32, u32),
    /// `(height, width)` every view is delivered at.
    r_res: (u32, u32),
}

/// Host-side views of one sample in `[C, H, W]` order.
struct DecodedSample {
    views: [Vec<f32>; 4],
    path: PathBuf,
}

impl TripletDataset {
    pub fn open(spec: &DatasetSpec, phase: Phase) -> Result<Self> {
        let entries = fs::read_dir(&spec.dataroot)
            .with_context(|| {
                format!("Failed to read dataset directory: {}", spec.dataroot.display())
            })?;

        let mut dirs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut samples = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let hr = dir.join(HR_FILE);
            let lr = LR_FILES.map(|name| dir.join(name));
            if !hr.exists() || lr.iter().any(|p| !p.exists()) {
                log::warn!("Skipping incomplete sample: {}", dir.display());
                continue;
            }
            samples.push(TripletSample { lr, hr });
        }

        if spec.data_len > 0 {
            samples.truncate(spec.data_len as usize);
        }
        log::debug!("{} dataset scanned: {} samples", phase, samples.len());

        Ok(Self {
            samples,
            l_res: spec.l_resolution.dims(),
            r_res: spec.r_resolution.dims(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[TripletSample] {
        &self.samples
    }

    fn decode(&self, index: usize, flip: bool) -> Result<DecodedSample> {
        let sample = &self.samples[index];
        let (rh, rw) = self.r_res;
        let (lh, lw) = self.l_res;

        let open = |path: &Path| {
            image::open(path).with_context(|| format!("Failed to open image: {}", path.display()))
        };
        let finish = |img: DynamicImage| {
            let img = if flip { img.fliph() } else { img };
            to_chw(&img.to_rgb8())
        };

        let hr = finish(resize(open(&sample.hr)?, rw, rh));
        let mut lr = Vec::with_capacity(3);
        for path in &sample.lr {
            // Capture resolution first, then bicubic up to the target grid
            let small = resize(open(path)?, lw, lh);
            lr.push(finish(resize(small, rw, rh)));
        }
        let [lr1, lr2, lr3]: [Vec<f32>; 3] = lr
            .try_into()
            .map_err(|_| anyhow::anyhow!("Expected three LR views"))?;

        Ok(DecodedSample {
            views: [lr1, lr2, lr3, hr],
            path: sample.hr.clone(),
        })
    }
}

fn resize(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        img
    } else {
        img.resize_exact(width, height, FilterType::CatmullRom)
    }
}

/// `u8` HWC pixels to `[-1, 1]` CHW floats.
fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut out = vec![0f32; 3 * h * w];
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            out[c * h * w + y as usize * w + x as usize] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    out
}

pub struct TripletLoader {
    dataset: TripletDataset,
    batch_size: usize,
    shuffle: bool,
    random_flip: bool,
    pool: rayon::ThreadPool,
    device: Device,
    rng: StdRng,
}

impl TripletLoader {
    pub fn new(
        dataset: TripletDataset,
        batch_size: usize,
        shuffle: bool,
        random_flip: bool,
        num_workers: usize,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .build()
            .context("Failed to build loader thread pool")?;
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            random_flip,
            pool,
            device,
            rng: StdRng::from_entropy(),
        })
    }

    fn load_batch(&self, picks: &[(usize, bool)]) -> Result<Batch> {
        let decoded: Vec<DecodedSample> = self.pool.install(|| {
            picks
                .par_iter()
                .map(|&(index, flip)| self.dataset.decode(index, flip))
                .collect::<Result<Vec<_>>>()
        })?;

        let (h, w) = self.dataset.r_res;
        let shape = (decoded.len(), 3, h as usize, w as usize);
        let stack = |view: usize| -> Result<Tensor> {
            let data: Vec<f32> = decoded
                .iter()
                .flat_map(|s| s.views[view].iter().copied())
                .collect();
            Ok(Tensor::from_vec(data, shape, &self.device)?)
        };

        Ok(Batch {
            lr1: stack(0)?,
            lr2: stack(1)?,
            lr3: stack(2)?,
            hr: stack(3)?,
            paths: decoded.iter().map(|s| s.path.clone()).collect(),
        })
    }
}

impl BatchLoader for TripletLoader {
    fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn iter_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let picks: Vec<(usize, bool)> = order
            .into_iter()
            .map(|index| (index, self.random_flip && self.rng.gen::<bool>()))
            .collect();
        let chunks: Vec<Vec<(usize, bool)>> =
            picks.chunks(self.batch_size).map(|c| c.to_vec()).collect();

        let this = &*self;
        Box::new(chunks.into_iter().map(move |chunk| this.load_batch(&chunk)))
    }
}
