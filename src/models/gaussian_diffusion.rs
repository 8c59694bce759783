//! Conditional Gaussian diffusion over the HR image, conditioned on the
//! three upsampled LR views.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::adam::Adam;
use super::checkpoint::{write_safetensors, CheckpointCategory, CheckpointFiles, CheckpointMeta};
use super::denoiser::ConditionalDenoiser;
use super::noise_schedule::NoiseSchedule;
use super::{DiffusionModel, InferenceMode, SrOutput, VisualBundle};
use crate::loaders::Batch;
use crate::trainers::{LossType, Phase, RunConfig, ScheduleSpec};

pub struct GaussianDiffusion {
    device: Device,
    varmap: VarMap,
    params: Vec<(String, Var)>,
    network: ConditionalDenoiser,
    optimizer: Adam,
    loss_type: LossType,
    schedule: Option<NoiseSchedule>,
    schedule_phase: Option<Phase>,
    checkpoint_dir: PathBuf,
    data: Option<Batch>,
    sr: Option<SrOutput>,
    log: BTreeMap<String, f64>,
    begin_step: usize,
    begin_epoch: usize,
    rng: StdRng,
}

impl GaussianDiffusion {
    pub fn new(config: &RunConfig, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = ConditionalDenoiser::new(&config.model.denoiser, vb)?;

        let mut params: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|e| anyhow!("Failed to lock parameters: {}", e))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let num_params: usize = params.iter().map(|(_, v)| v.elem_count()).sum();
        info!("Network G has {} parameters in {} tensors", num_params, params.len());

        let mut model = Self {
            device,
            varmap,
            params,
            network,
            optimizer: Adam::new(config.train.optimizer.lr),
            loss_type: config.model.diffusion.loss_type,
            schedule: None,
            schedule_phase: None,
            checkpoint_dir: config.path.checkpoint.clone(),
            data: None,
            sr: None,
            log: BTreeMap::new(),
            begin_step: 0,
            begin_epoch: 0,
            rng: StdRng::from_entropy(),
        };

        let phase = config.phase;
        model.set_new_noise_schedule(config.model.beta_schedule.for_phase(phase), phase)?;
        if let Some(prefix) = &config.path.resume_state {
            model.load_network(prefix, phase)?;
        }
        Ok(model)
    }

    fn load_network(&mut self, prefix: &std::path::Path, phase: Phase) -> Result<()> {
        let files = CheckpointFiles::with_prefix(prefix);
        info!("Loading pretrained model for G [{}] ...", prefix.display());
        self.varmap
            .load(&files.gen)
            .with_context(|| format!("Failed to load generator weights: {}", files.gen.display()))?;

        let meta = CheckpointMeta::read(&files.state)?;
        if phase == Phase::Train && files.opt.exists() {
            let state = candle_core::safetensors::load(&files.opt, &self.device)
                .with_context(|| {
                    format!("Failed to load optimizer state: {}", files.opt.display())
                })?;
            self.optimizer.load_state_tensors(state, meta.optimizer_step);
        }
        self.begin_step = meta.iter;
        self.begin_epoch = meta.epoch;
        Ok(())
    }

    fn batch(&self) -> Result<&Batch> {
        self.data.as_ref().ok_or_else(|| anyhow!("No batch fed to the model"))
    }

    fn schedule(&self) -> Result<&NoiseSchedule> {
        self.schedule.as_ref().ok_or_else(|| anyhow!("Noise schedule not set"))
    }

    fn condition(batch: &Batch, x: &Tensor) -> Result<Tensor> {
        Ok(Tensor::cat(&[&batch.lr1, &batch.lr2, &batch.lr3, x], 1)?)
    }

    /// Noise the HR target at a random continuous level and return the
    /// denoising loss, with the autograd graph attached.
    fn p_losses(&mut self) -> Result<Tensor> {
        let batch = self.batch()?.clone();
        let schedule = self.schedule()?;
        let sqrt_acp_prev = schedule.sqrt_alphas_cumprod_prev().to_vec();
        let num_timesteps = schedule.num_timesteps();

        let x_start = &batch.hr;
        let b = x_start.dim(0)?;
        let levels: Vec<f32> = (0..b)
            .map(|_| {
                let t = self.rng.gen_range(1..=num_timesteps);
                let (high, low) = (sqrt_acp_prev[t - 1], sqrt_acp_prev[t]);
                (low + (high - low) * self.rng.gen::<f64>()) as f32
            })
            .collect();
        let level = Tensor::from_vec(levels, b, &self.device)?;
        let level_4d = level.reshape((b, 1, 1, 1))?;
        let noise_scale = (level_4d.sqr()?.affine(-1.0, 1.0)?).sqrt()?;

        let noise = x_start.randn_like(0.0, 1.0)?;
        let x_noisy = (x_start.broadcast_mul(&level_4d)? + noise.broadcast_mul(&noise_scale)?)?;
        let predicted = self.network.forward(&Self::condition(&batch, &x_noisy)?, &level)?;

        let diff = (predicted - noise)?;
        let loss = match self.loss_type {
            LossType::L1 => diff.abs()?.mean_all()?,
            LossType::L2 => diff.sqr()?.mean_all()?,
        };
        Ok(loss)
    }

    /// One reverse step from `x_t` to `x_{t-1}`.
    fn p_sample(&self, batch: &Batch, x: &Tensor, t: usize) -> Result<Tensor> {
        let schedule = self.schedule()?;
        let b = x.dim(0)?;
        let level_value = schedule.sqrt_alphas_cumprod_prev()[t + 1] as f32;
        let level = Tensor::full(level_value, b, &self.device)?;

        let eps = self.network.forward(&Self::condition(batch, x)?, &level)?.detach();
        let (recip, recipm1) = schedule.start_from_noise_coefs(t);
        let x_recon = ((x * recip)? - (eps * recipm1)?)?.clamp(-1f32, 1f32)?;

        let (coef1, coef2, log_var) = schedule.posterior(t);
        let mean = ((x_recon * coef1)? + (x * coef2)?)?;
        if t == 0 {
            return Ok(mean);
        }
        let noise = x.randn_like(0.0, 1.0)?;
        Ok((mean + (noise * (0.5 * log_var).exp())?)?)
    }

    /// Full reverse process from pure noise; returns the captured frames
    /// oldest first, the final clean image last.
    fn p_sample_loop(&self) -> Result<Vec<Tensor>> {
        let batch = self.batch()?;
        let schedule = self.schedule()?;
        let interval = schedule.sample_interval();

        let mut img = batch.hr.randn_like(0.0, 1.0)?;
        let mut frames = vec![img.clone()];
        for t in (0..schedule.num_timesteps()).rev() {
            img = self.p_sample(batch, &img, t)?;
            if t % interval == 0 {
                frames.push(img.clone());
            }
        }
        debug!("Sampled {} trajectory frames", frames.len());
        Ok(frames)
    }
}

impl DiffusionModel for GaussianDiffusion {
    fn begin_step(&self) -> usize {
        self.begin_step
    }

    fn begin_epoch(&self) -> usize {
        self.begin_epoch
    }

    fn set_new_noise_schedule(&mut self, spec: &ScheduleSpec, phase: Phase) -> Result<()> {
        if self.schedule_phase == Some(phase) {
            return Ok(());
        }
        self.schedule = Some(NoiseSchedule::new(spec)?);
        self.schedule_phase = Some(phase);
        debug!("Noise schedule switched to {} ({} steps)", phase, spec.n_timestep);
        Ok(())
    }

    fn feed_data(&mut self, batch: Batch) -> Result<()> {
        self.data = Some(batch.to_device(&self.device)?);
        Ok(())
    }

    fn optimize_parameters(&mut self) -> Result<()> {
        let loss = self.p_losses()?;
        let grads = loss.backward()?;
        self.optimizer.step(&self.params, &grads)?;

        let l_pix = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        self.log.insert("l_pix".to_string(), l_pix);
        Ok(())
    }

    fn get_current_log(&self) -> BTreeMap<String, f64> {
        self.log.clone()
    }

    fn test(&mut self, mode: InferenceMode) -> Result<Option<f64>> {
        let mut frames = self.p_sample_loop()?;
        match mode {
            InferenceMode::Trajectory => {
                self.sr = Some(SrOutput::Trajectory(frames));
                Ok(None)
            }
            InferenceMode::SingleShot => {
                let last = frames
                    .pop()
                    .ok_or_else(|| anyhow!("Reverse process produced no frames"))?;
                self.sr = Some(SrOutput::SingleFrame(last));
                let loss = self.p_losses()?.detach();
                Ok(Some(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?))
            }
        }
    }

    fn get_current_visuals(&self) -> Result<VisualBundle> {
        let batch = self.batch()?;
        let sr = match &self.sr {
            Some(SrOutput::SingleFrame(frame)) => SrOutput::SingleFrame(frame.get(0)?),
            Some(SrOutput::Trajectory(frames)) => SrOutput::Trajectory(
                frames.iter().map(|f| f.get(0)).collect::<candle_core::Result<Vec<_>>>()?,
            ),
            None => return Err(anyhow!("No inference result; call test() first")),
        };
        Ok(VisualBundle {
            sr,
            hr: batch.hr.get(0)?,
            lr1: batch.lr1.get(0)?,
            lr2: batch.lr2.get(0)?,
            lr3: batch.lr3.get(0)?,
        })
    }

    fn current_paths(&self) -> &[PathBuf] {
        self.data.as_ref().map(|b| b.paths.as_slice()).unwrap_or(&[])
    }

    fn save_checkpoint(
        &mut self,
        category: CheckpointCategory,
        epoch: usize,
        step: usize,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        let files = category.files(&self.checkpoint_dir);

        let mut metadata = HashMap::new();
        metadata.insert("epoch".to_string(), epoch.to_string());
        metadata.insert("iter".to_string(), step.to_string());
        metadata.insert("category".to_string(), category.to_string());

        let weights: Vec<(String, Tensor)> = self
            .params
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        write_safetensors(&files.gen, &weights, metadata.clone())?;
        write_safetensors(&files.opt, &self.optimizer.state_tensors(), metadata)?;
        CheckpointMeta {
            epoch,
            iter: step,
            category,
            optimizer_step: self.optimizer.get_step(),
        }
        .write(&files.state)?;

        info!("Saved model in [{}] ...", files.gen.display());
        Ok(())
    }
}
