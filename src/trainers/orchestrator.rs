//! Training and evaluation control loop.
//!
//! The orchestrator owns the run counters and every logging handle, and
//! drives a [`DiffusionModel`] through batches pulled from a
//! [`BatchLoader`]. Training interleaves optimisation with periodic
//! logging, validation sweeps, best-checkpoint selection and `latest`
//! checkpoints; evaluation runs one trajectory pass over the validation
//! data and writes every frame to disk.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::checkpoint_policy::select_checkpoint;
use super::image_metrics::{concat_horizontal, MetricsAdapter};
use super::{Phase, RunConfig, SrImageMode};
use crate::loaders::BatchLoader;
use crate::logging::{progress_prefix, sci, DashboardSink, ExperimentTracker, RunLogger};
use crate::models::{CheckpointCategory, DiffusionModel, InferenceMode, SrOutput};

/// Run counters. Only the orchestrator mutates them; the best values only
/// change through [`select_checkpoint`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub current_epoch: usize,
    pub current_step: usize,
    pub best_loss: f64,
    pub best_psnr: f64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            current_epoch: 0,
            current_step: 0,
            best_loss: f64::INFINITY,
            best_psnr: f64::NEG_INFINITY,
        }
    }
}

/// A periodic action fires on multiples of a configured, non-zero frequency.
fn fires(freq: Option<usize>, step: usize) -> bool {
    matches!(freq, Some(freq) if freq > 0 && step % freq == 0)
}

pub struct Orchestrator<'a, M: DiffusionModel, X: MetricsAdapter> {
    config: &'a RunConfig,
    model: M,
    metrics: X,
    logger: RunLogger,
    val_logger: RunLogger,
    dashboard: Box<dyn DashboardSink>,
    tracker: Option<Box<dyn ExperimentTracker>>,
    state: TrainingState,
    val_step: usize,
}

impl<'a, M: DiffusionModel, X: MetricsAdapter> Orchestrator<'a, M, X> {
    pub fn new(
        config: &'a RunConfig,
        model: M,
        metrics: X,
        logger: RunLogger,
        val_logger: RunLogger,
        dashboard: Box<dyn DashboardSink>,
        tracker: Option<Box<dyn ExperimentTracker>>,
    ) -> Self {
        let state = TrainingState {
            current_epoch: model.begin_epoch(),
            current_step: model.begin_step(),
            ..Default::default()
        };
        Self {
            config,
            model,
            metrics,
            logger,
            val_logger,
            dashboard,
            tracker,
            state,
            val_step: 0,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    fn use_phase_schedule(&mut self, phase: Phase) -> Result<()> {
        let spec = self.config.model.beta_schedule.for_phase(phase);
        self.model.set_new_noise_schedule(spec, phase)
    }

    pub fn train(
        &mut self,
        train_loader: &mut dyn BatchLoader,
        val_loader: &mut dyn BatchLoader,
    ) -> Result<()> {
        let n_iter = self.config.train.n_iter;
        if self.config.path.resume_state.is_some() {
            self.logger.info(&format!(
                "Resuming training from epoch: {}, iter: {}.",
                self.state.current_epoch, self.state.current_step
            ));
        }
        self.use_phase_schedule(self.config.phase)?;

        while self.state.current_step < n_iter {
            self.state.current_epoch += 1;
            let mut pulled = 0usize;
            for batch in train_loader.iter_epoch() {
                let batch = batch?;
                pulled += 1;
                self.state.current_step += 1;
                if self.state.current_step > n_iter {
                    break;
                }
                let step = self.state.current_step;

                self.model.feed_data(batch)?;
                self.model.optimize_parameters()?;

                if fires(self.config.train.print_freq, step) {
                    self.log_training()?;
                }
                if fires(self.config.train.val_freq, step) {
                    let (avg_loss, avg_psnr) = self.validation_sweep(val_loader)?;
                    self.save_best(avg_loss, avg_psnr)?;
                    self.log_validation(avg_loss, avg_psnr)?;
                }
                if fires(self.config.train.save_checkpoint_freq, step) {
                    self.logger.info("Saving models and training states.");
                    self.model.save_network(self.state.current_epoch, step)?;
                    if self.config.log_wandb_ckpt {
                        if let Some(tracker) = self.tracker.as_mut() {
                            tracker.log_checkpoint(self.state.current_epoch, step)?;
                        }
                    }
                }
            }
            if pulled == 0 {
                anyhow::bail!(
                    "Training loader yielded no batches in epoch {}",
                    self.state.current_epoch
                );
            }

            if let Some(tracker) = self.tracker.as_mut() {
                let mut metrics = BTreeMap::new();
                metrics.insert("epoch".to_string(), self.state.current_epoch as f64 - 1.0);
                tracker.log_metrics(&metrics)?;
            }
        }

        self.logger.info("End of training.");
        Ok(())
    }

    fn log_training(&mut self) -> Result<()> {
        let step = self.state.current_step;
        let logs = self.model.get_current_log();
        let mut message = progress_prefix(self.state.current_epoch, step);
        for (key, value) in &logs {
            message.push_str(&format!(" {}: {}", key, sci(*value)));
            self.dashboard.add_scalar(key, *value, step)?;
        }
        self.logger.info(&message);

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.log_metrics(&logs)?;
        }
        Ok(())
    }

    /// Run the validation set under the `val` schedule and return the mean
    /// loss and PSNR. The `train` schedule is back in place on return, also
    /// when the sweep fails.
    fn validation_sweep(&mut self, val_loader: &mut dyn BatchLoader) -> Result<(f64, f64)> {
        let result_dir = self.config.path.results.join(self.state.current_epoch.to_string());
        fs::create_dir_all(&result_dir)
            .with_context(|| format!("Failed to create {}", result_dir.display()))?;

        self.use_phase_schedule(Phase::Val)?;
        let outcome = self.sweep_batches(val_loader, &result_dir);
        let restored = self.use_phase_schedule(Phase::Train);
        let averages = outcome?;
        restored?;
        Ok(averages)
    }

    fn sweep_batches(
        &mut self,
        val_loader: &mut dyn BatchLoader,
        result_dir: &Path,
    ) -> Result<(f64, f64)> {
        let step = self.state.current_step;
        let mut total_psnr = 0.0;
        let mut total_loss = 0.0;
        let mut idx = 0usize;

        for batch in val_loader.iter_epoch() {
            idx += 1;
            self.model.feed_data(batch?)?;
            let loss = self
                .model
                .test(InferenceMode::SingleShot)?
                .ok_or_else(|| anyhow!("Single-shot inference reported no loss"))?;
            let visuals = self.model.get_current_visuals()?;
            let sr = visuals
                .sr
                .final_frame()
                .ok_or_else(|| anyhow!("Inference produced no SR frame"))?;

            let sr_img = self.metrics.tensor_to_image(sr)?;
            let hr_img = self.metrics.tensor_to_image(&visuals.hr)?;
            let lr1_img = self.metrics.tensor_to_image(&visuals.lr1)?;
            let lr2_img = self.metrics.tensor_to_image(&visuals.lr2)?;
            let lr3_img = self.metrics.tensor_to_image(&visuals.lr3)?;

            for (tag, img) in [
                ("hr", &hr_img),
                ("sr", &sr_img),
                ("lr1", &lr1_img),
                ("lr2", &lr2_img),
                ("lr3", &lr3_img),
            ] {
                let path = result_dir.join(format!("{}_{}_{}.png", step, idx, tag));
                self.metrics.save_image(img, &path)?;
            }

            let psnr = self.metrics.calculate_psnr(&sr_img, &hr_img);
            let composite = concat_horizontal(&[lr1_img, lr2_img, lr3_img, sr_img, hr_img])?;
            self.dashboard.add_image(&format!("Iter_{}", step), &composite, idx)?;
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.log_image(&format!("validation_{}", idx), &composite)?;
            }

            total_psnr += psnr;
            total_loss += loss;
        }

        // An empty sweep averages to NaN and earns no checkpoint
        let n = idx as f64;
        Ok((total_loss / n, total_psnr / n))
    }

    fn save_best(&mut self, avg_loss: f64, avg_psnr: f64) -> Result<()> {
        let (epoch, step) = (self.state.current_epoch, self.state.current_step);
        match select_checkpoint(avg_loss, avg_psnr, &mut self.state) {
            Some(CheckpointCategory::BestLoss) => self.model.save_best_loss(epoch, step),
            Some(CheckpointCategory::BestPsnr) => self.model.save_best_psnr(epoch, step),
            Some(CheckpointCategory::BestBoth) => self.model.save_best_both(epoch, step),
            Some(CheckpointCategory::Latest) => self.model.save_network(epoch, step),
            None => Ok(()),
        }
    }

    fn log_validation(&mut self, avg_loss: f64, avg_psnr: f64) -> Result<()> {
        let step = self.state.current_step;
        self.logger.info(&format!("# Validation # PSNR: {}", sci(avg_psnr)));
        self.val_logger.info(&format!(
            "{} psnr: {} loss: {}",
            progress_prefix(self.state.current_epoch, step),
            sci(avg_psnr),
            sci(avg_loss)
        ));
        self.dashboard.add_scalar("psnr", avg_psnr, step)?;

        if let Some(tracker) = self.tracker.as_mut() {
            let mut metrics = BTreeMap::new();
            metrics.insert("validation/val_psnr".to_string(), avg_psnr);
            metrics.insert("validation/val_step".to_string(), self.val_step as f64);
            tracker.log_metrics(&metrics)?;
            self.val_step += 1;
        }
        Ok(())
    }

    /// One trajectory pass over the validation data with every frame and
    /// view written under `path.results`.
    pub fn evaluate(&mut self, val_loader: &mut dyn BatchLoader) -> Result<()> {
        self.use_phase_schedule(self.config.phase)?;
        self.logger.info("Begin Model Evaluation.");
        let result_dir = self.config.path.results.clone();
        fs::create_dir_all(&result_dir)
            .with_context(|| format!("Failed to create {}", result_dir.display()))?;

        #[cfg(feature = "progress-bar")]
        let progress = {
            let bar = indicatif::ProgressBar::new(val_loader.len() as u64);
            bar.set_style(
                indicatif::ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                    .progress_chars("#>-"),
            );
            bar
        };

        let log_eval = self.config.log_eval;
        let mut total_psnr = 0.0;
        let mut total_ssim = 0.0;
        let mut idx = 0usize;

        for batch in val_loader.iter_epoch() {
            idx += 1;
            self.model.feed_data(batch?)?;
            self.model.test(InferenceMode::Trajectory)?;
            let visuals = self.model.get_current_visuals()?;

            let stem = self
                .model
                .current_paths()
                .first()
                .and_then(|path| path.parent())
                .and_then(|dir| dir.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("sample_{}", idx));

            let frames = match &visuals.sr {
                SrOutput::Trajectory(frames) => frames.clone(),
                SrOutput::SingleFrame(frame) => vec![frame.clone()],
            };
            let frame_images = frames
                .iter()
                .map(|frame| self.metrics.tensor_to_image(frame))
                .collect::<Result<Vec<RgbImage>>>()?;
            let sr_img = frame_images
                .last()
                .ok_or_else(|| anyhow!("Inference produced no trajectory frames"))?;

            match self.config.eval.sr_image_mode {
                SrImageMode::Grid => {
                    let strip = concat_horizontal(&frame_images)?;
                    self.metrics
                        .save_image(&strip, &result_dir.join(format!("{}_sr_process.png", stem)))?;
                    self.metrics
                        .save_image(sr_img, &result_dir.join(format!("{}_sr.png", stem)))?;
                }
                SrImageMode::Single => {
                    for (i, frame) in frame_images.iter().enumerate() {
                        self.metrics
                            .save_image(frame, &result_dir.join(format!("{}_sr_{}.png", stem, i)))?;
                    }
                }
            }

            let hr_img = self.metrics.tensor_to_image(&visuals.hr)?;
            let lr1_img = self.metrics.tensor_to_image(&visuals.lr1)?;
            let lr2_img = self.metrics.tensor_to_image(&visuals.lr2)?;
            let lr3_img = self.metrics.tensor_to_image(&visuals.lr3)?;
            let views = [("hr", &hr_img), ("lr1", &lr1_img), ("lr2", &lr2_img), ("lr3", &lr3_img)];
            for (tag, img) in views {
                self.metrics
                    .save_image(img, &result_dir.join(format!("{}_{}.png", stem, tag)))?;
            }

            let psnr = self.metrics.calculate_psnr(sr_img, &hr_img);
            let ssim = self.metrics.calculate_ssim(sr_img, &hr_img)?;
            total_psnr += psnr;
            total_ssim += ssim;

            if log_eval {
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.log_eval_data(&lr2_img, sr_img, &hr_img, psnr, ssim)?;
                }
            }

            #[cfg(feature = "progress-bar")]
            progress.inc(1);
        }

        #[cfg(feature = "progress-bar")]
        progress.finish_and_clear();

        let avg_psnr = total_psnr / idx as f64;
        let avg_ssim = total_ssim / idx as f64;

        self.logger.info(&format!("# Validation # PSNR: {}", sci(avg_psnr)));
        self.logger.info(&format!("# Validation # SSIM: {}", sci(avg_ssim)));
        self.val_logger.info(&format!(
            "{} psnr: {}, ssim: {}",
            progress_prefix(self.state.current_epoch, self.state.current_step),
            sci(avg_psnr),
            sci(avg_ssim)
        ));

        if let Some(tracker) = self.tracker.as_mut() {
            if log_eval {
                tracker.log_eval_table()?;
            }
            let mut metrics = BTreeMap::new();
            metrics.insert("PSNR".to_string(), avg_psnr);
            metrics.insert("SSIM".to_string(), avg_ssim);
            tracker.log_metrics(&metrics)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loaders::Batch;
    use crate::models::VisualBundle;
    use crate::trainers::{ScheduleSpec, StandardMetrics};
    use candle_core::{DType, Device, Tensor};
    use image::Rgb;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Default)]
    struct MockModel {
        begin_step: usize,
        begin_epoch: usize,
        frames: usize,
        active: Option<Phase>,
        schedule_calls: Vec<Phase>,
        optimized: usize,
        tested_under: Vec<Option<Phase>>,
        saved: Vec<(CheckpointCategory, usize, usize)>,
        losses: VecDeque<f64>,
        paths: Vec<PathBuf>,
        fail_test: bool,
    }

    fn view() -> Tensor {
        Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu).unwrap()
    }

    /// Flat frame `i` of a trajectory, brightening from -1 in steps of 0.5.
    fn frame(i: usize) -> Tensor {
        Tensor::full(-1f32 + 0.5 * i as f32, (3, 4, 4), &Device::Cpu).unwrap()
    }

    impl DiffusionModel for MockModel {
        fn begin_step(&self) -> usize {
            self.begin_step
        }

        fn begin_epoch(&self) -> usize {
            self.begin_epoch
        }

        fn set_new_noise_schedule(&mut self, _spec: &ScheduleSpec, phase: Phase) -> Result<()> {
            self.active = Some(phase);
            self.schedule_calls.push(phase);
            Ok(())
        }

        fn feed_data(&mut self, batch: Batch) -> Result<()> {
            self.paths = batch.paths;
            Ok(())
        }

        fn optimize_parameters(&mut self) -> Result<()> {
            self.optimized += 1;
            Ok(())
        }

        fn get_current_log(&self) -> BTreeMap<String, f64> {
            BTreeMap::from([("l_pix".to_string(), 0.5)])
        }

        fn test(&mut self, mode: InferenceMode) -> Result<Option<f64>> {
            if self.fail_test {
                anyhow::bail!("inference failed");
            }
            self.tested_under.push(self.active);
            Ok(match mode {
                InferenceMode::SingleShot => Some(self.losses.pop_front().unwrap_or(0.1)),
                InferenceMode::Trajectory => None,
            })
        }

        fn get_current_visuals(&self) -> Result<VisualBundle> {
            let sr = if self.frames > 0 {
                SrOutput::Trajectory((0..self.frames).map(frame).collect())
            } else {
                SrOutput::SingleFrame(view())
            };
            Ok(VisualBundle {
                sr,
                hr: view(),
                lr1: view(),
                lr2: view(),
                lr3: view(),
            })
        }

        fn current_paths(&self) -> &[PathBuf] {
            &self.paths
        }

        fn save_checkpoint(
            &mut self,
            category: CheckpointCategory,
            epoch: usize,
            step: usize,
        ) -> Result<()> {
            self.saved.push((category, epoch, step));
            Ok(())
        }
    }

    /// Real image conversion and saving, scripted quality numbers.
    struct ScriptedMetrics {
        psnr: RefCell<VecDeque<f64>>,
    }

    impl ScriptedMetrics {
        fn new(psnr: &[f64]) -> Self {
            Self {
                psnr: RefCell::new(psnr.iter().copied().collect()),
            }
        }
    }

    impl MetricsAdapter for ScriptedMetrics {
        fn tensor_to_image(&self, tensor: &Tensor) -> Result<RgbImage> {
            StandardMetrics.tensor_to_image(tensor)
        }

        fn save_image(&self, image: &RgbImage, path: &Path) -> Result<()> {
            StandardMetrics.save_image(image, path)
        }

        fn calculate_psnr(&self, _sr: &RgbImage, _hr: &RgbImage) -> f64 {
            self.psnr.borrow_mut().pop_front().unwrap_or(30.0)
        }

        fn calculate_ssim(&self, _sr: &RgbImage, _hr: &RgbImage) -> Result<f64> {
            Ok(0.5)
        }
    }

    #[derive(Default)]
    struct Recorded {
        scalars: Vec<(String, f64, usize)>,
        images: Vec<(String, usize, u32)>,
        metrics: Vec<BTreeMap<String, f64>>,
        tracker_images: Vec<String>,
        checkpoints: Vec<(usize, usize)>,
        eval_rows: usize,
        tables: usize,
    }

    type Shared = Rc<RefCell<Recorded>>;

    struct RecordingDashboard(Shared);
    struct RecordingTracker(Shared);

    impl DashboardSink for RecordingDashboard {
        fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
            self.0.borrow_mut().scalars.push((tag.to_string(), value, step));
            Ok(())
        }

        fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) -> Result<()> {
            self.0.borrow_mut().images.push((tag.to_string(), step, image.width()));
            Ok(())
        }
    }

    impl ExperimentTracker for RecordingTracker {
        fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>) -> Result<()> {
            self.0.borrow_mut().metrics.push(metrics.clone());
            Ok(())
        }

        fn log_image(&mut self, key: &str, _image: &RgbImage) -> Result<()> {
            self.0.borrow_mut().tracker_images.push(key.to_string());
            Ok(())
        }

        fn log_checkpoint(&mut self, epoch: usize, step: usize) -> Result<()> {
            self.0.borrow_mut().checkpoints.push((epoch, step));
            Ok(())
        }

        fn log_eval_data(
            &mut self,
            _lr: &RgbImage,
            _sr: &RgbImage,
            _hr: &RgbImage,
            _psnr: f64,
            _ssim: f64,
        ) -> Result<()> {
            self.0.borrow_mut().eval_rows += 1;
            Ok(())
        }

        fn log_eval_table(&mut self) -> Result<()> {
            self.0.borrow_mut().tables += 1;
            Ok(())
        }
    }

    struct VecLoader {
        batches: Vec<Batch>,
    }

    impl VecLoader {
        fn named(names: &[&str]) -> Self {
            let batches = names
                .iter()
                .map(|name| {
                    let t = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
                    Batch {
                        lr1: t.clone(),
                        lr2: t.clone(),
                        lr3: t.clone(),
                        hr: t,
                        paths: vec![PathBuf::from(format!("data/{}/hr.png", name))],
                    }
                })
                .collect();
            Self { batches }
        }

        fn sized(n: usize) -> Self {
            let names: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
            Self::named(&names.iter().map(String::as_str).collect::<Vec<_>>())
        }
    }

    impl BatchLoader for VecLoader {
        fn len(&self) -> usize {
            self.batches.len()
        }

        fn iter_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
            Box::new(self.batches.clone().into_iter().map(Ok))
        }
    }

    fn config(results: &Path, n_iter: usize) -> RunConfig {
        let mut config = RunConfig::default();
        config.train.n_iter = n_iter;
        config.path.results = results.to_path_buf();
        config
    }

    fn orchestrator<'a, X: MetricsAdapter>(
        config: &'a RunConfig,
        model: MockModel,
        metrics: X,
        shared: &Shared,
        tracking: bool,
    ) -> Orchestrator<'a, MockModel, X> {
        let tracker: Option<Box<dyn ExperimentTracker>> = if tracking {
            Some(Box::new(RecordingTracker(shared.clone())))
        } else {
            None
        };
        Orchestrator::new(
            config,
            model,
            metrics,
            RunLogger::console("base"),
            RunLogger::console("val"),
            Box::new(RecordingDashboard(shared.clone())),
            tracker,
        )
    }

    #[test]
    fn test_exactly_n_iter_optimize_calls() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path(), 7);
        let shared = Shared::default();
        let mut orch = orchestrator(&config, MockModel::default(), StandardMetrics, &shared, true);

        orch.train(&mut VecLoader::sized(3), &mut VecLoader::sized(0))?;
        assert_eq!(orch.model().optimized, 7);
        assert_eq!(orch.state().current_epoch, 3);

        // Tracker sees the previous epoch index at the end of each pass
        let epochs: Vec<f64> = shared
            .borrow()
            .metrics
            .iter()
            .filter_map(|m| m.get("epoch").copied())
            .collect();
        assert_eq!(epochs, vec![0.0, 1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_resume_runs_remaining_iterations() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path(), 7);
        let model = MockModel {
            begin_step: 5,
            begin_epoch: 2,
            ..Default::default()
        };
        let shared = Shared::default();
        let mut orch = orchestrator(&config, model, StandardMetrics, &shared, false);

        orch.train(&mut VecLoader::sized(4), &mut VecLoader::sized(0))?;
        assert_eq!(orch.model().optimized, 2);
        assert_eq!(orch.state().current_epoch, 3);
        Ok(())
    }

    #[test]
    fn test_schedule_restored_after_empty_sweep() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config(dir.path(), 2);
        config.train.val_freq = Some(1);
        let shared = Shared::default();
        let mut orch = orchestrator(&config, MockModel::default(), StandardMetrics, &shared, false);

        orch.train(&mut VecLoader::sized(2), &mut VecLoader::sized(0))?;
        let model = orch.model();
        assert_eq!(
            model.schedule_calls,
            vec![Phase::Train, Phase::Val, Phase::Train, Phase::Val, Phase::Train]
        );
        assert_eq!(model.active, Some(Phase::Train));
        assert!(model.saved.is_empty());
        assert!(orch.state().best_loss.is_infinite());
        Ok(())
    }

    #[test]
    fn test_schedule_restored_when_sweep_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config(dir.path(), 1);
        config.train.val_freq = Some(1);
        let model = MockModel {
            fail_test: true,
            ..Default::default()
        };
        let shared = Shared::default();
        let mut orch = orchestrator(&config, model, StandardMetrics, &shared, false);

        assert!(orch.train(&mut VecLoader::sized(1), &mut VecLoader::sized(1)).is_err());
        assert_eq!(orch.model().active, Some(Phase::Train));
        Ok(())
    }

    #[test]
    fn test_sweep_averages_and_saves_best_both() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config(dir.path(), 1);
        config.train.val_freq = Some(1);
        let model = MockModel {
            losses: VecDeque::from(vec![0.2, 0.3, 0.4]),
            ..Default::default()
        };
        let shared = Shared::default();
        let metrics = ScriptedMetrics::new(&[20.0, 22.0, 24.0]);
        let mut orch = orchestrator(&config, model, metrics, &shared, true);

        orch.train(&mut VecLoader::sized(1), &mut VecLoader::sized(3))?;
        let state = orch.state();
        assert!((state.best_psnr - 22.0).abs() < 1e-12);
        assert!((state.best_loss - 0.3).abs() < 1e-12);
        assert_eq!(orch.model().saved, vec![(CheckpointCategory::BestBoth, 1, 1)]);
        assert!(orch.model().tested_under.iter().all(|p| *p == Some(Phase::Val)));

        for idx in 1..=3 {
            for tag in ["sr", "hr", "lr1", "lr2", "lr3"] {
                assert!(dir.path().join(format!("1/1_{}_{}.png", idx, tag)).exists());
            }
        }

        let rec = shared.borrow();
        let images: Vec<(String, usize, u32)> = rec.images.clone();
        assert_eq!(
            images,
            vec![
                ("Iter_1".to_string(), 1, 20),
                ("Iter_1".to_string(), 2, 20),
                ("Iter_1".to_string(), 3, 20)
            ]
        );
        assert!(rec.scalars.contains(&("psnr".to_string(), 22.0, 1)));
        assert_eq!(rec.tracker_images, vec!["validation_1", "validation_2", "validation_3"]);
        let val = rec.metrics.iter().find(|m| m.contains_key("validation/val_psnr")).unwrap();
        assert_eq!(val["validation/val_step"], 0.0);
        Ok(())
    }

    #[test]
    fn test_periodic_logging_and_latest_checkpoints() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config(dir.path(), 4);
        config.train.print_freq = Some(2);
        config.train.save_checkpoint_freq = Some(2);
        config.log_wandb_ckpt = true;
        let shared = Shared::default();
        let mut orch = orchestrator(&config, MockModel::default(), StandardMetrics, &shared, true);

        orch.train(&mut VecLoader::sized(3), &mut VecLoader::sized(0))?;
        assert_eq!(
            orch.model().saved,
            vec![(CheckpointCategory::Latest, 1, 2), (CheckpointCategory::Latest, 2, 4)]
        );

        let rec = shared.borrow();
        assert_eq!(
            rec.scalars,
            vec![("l_pix".to_string(), 0.5, 2), ("l_pix".to_string(), 0.5, 4)]
        );
        assert_eq!(rec.checkpoints, vec![(1, 2), (2, 4)]);
        Ok(())
    }

    #[test]
    fn test_empty_train_loader_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path(), 3);
        let shared = Shared::default();
        let mut orch = orchestrator(&config, MockModel::default(), StandardMetrics, &shared, false);

        assert!(orch.train(&mut VecLoader::sized(0), &mut VecLoader::sized(0)).is_err());
        assert_eq!(orch.model().optimized, 0);
        Ok(())
    }

    #[test]
    fn test_evaluate_grid_writes_strip_and_views() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config(dir.path(), 0);
        config.phase = Phase::Val;
        config.log_eval = true;
        let model = MockModel {
            frames: 4,
            ..Default::default()
        };
        let shared = Shared::default();
        let metrics = ScriptedMetrics::new(&[20.0, 24.0]);
        let mut orch = orchestrator(&config, model, metrics, &shared, true);

        orch.evaluate(&mut VecLoader::named(&["alpha", "beta"]))?;
        for stem in ["alpha", "beta"] {
            let strip = image::open(dir.path().join(format!("{}_sr_process.png", stem)))?.to_rgb8();
            assert_eq!(strip.dimensions(), (16, 4));
            for suffix in ["sr", "hr", "lr1", "lr2", "lr3"] {
                assert!(dir.path().join(format!("{}_{}.png", stem, suffix)).exists());
            }

            // First frame on the left, final frame in the rightmost segment and in `_sr`
            let sr = image::open(dir.path().join(format!("{}_sr.png", stem)))?.to_rgb8();
            assert_eq!(sr.dimensions(), (4, 4));
            assert_eq!(*sr.get_pixel(0, 0), Rgb([191, 191, 191]));
            assert_eq!(*strip.get_pixel(0, 0), Rgb([0, 0, 0]));
            assert_eq!(*strip.get_pixel(4, 0), Rgb([64, 64, 64]));
            for x in 12..16 {
                assert_eq!(strip.get_pixel(x, 3), sr.get_pixel(x - 12, 3));
            }
        }
        assert_eq!(orch.model().schedule_calls, vec![Phase::Val]);
        assert_eq!(orch.model().optimized, 0);

        let rec = shared.borrow();
        assert_eq!(rec.eval_rows, 2);
        assert_eq!(rec.tables, 1);
        let last = rec.metrics.last().unwrap();
        assert_eq!(last["PSNR"], 22.0);
        assert_eq!(last["SSIM"], 0.5);
        Ok(())
    }

    #[test]
    fn test_evaluate_single_writes_every_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config(dir.path(), 0);
        config.phase = Phase::Val;
        config.eval.sr_image_mode = SrImageMode::Single;
        let model = MockModel {
            frames: 3,
            ..Default::default()
        };
        let shared = Shared::default();
        let mut orch = orchestrator(&config, model, ScriptedMetrics::new(&[]), &shared, false);

        orch.evaluate(&mut VecLoader::named(&["gamma"]))?;
        for i in 0..3 {
            assert!(dir.path().join(format!("gamma_sr_{}.png", i)).exists());
        }
        assert!(!dir.path().join("gamma_sr_process.png").exists());
        assert!(dir.path().join("gamma_lr3.png").exists());
        Ok(())
    }

    #[test]
    fn test_evaluate_small_frames_reports_nan_ssim() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config(dir.path(), 0);
        config.phase = Phase::Val;
        let model = MockModel {
            frames: 2,
            ..Default::default()
        };
        let shared = Shared::default();
        let mut orch = orchestrator(&config, model, StandardMetrics, &shared, true);

        orch.evaluate(&mut VecLoader::named(&["tiny"]))?;
        assert!(dir.path().join("tiny_sr.png").exists());
        let rec = shared.borrow();
        let last = rec.metrics.last().unwrap();
        assert!(last["SSIM"].is_nan());
        assert!(last["PSNR"].is_finite());
        Ok(())
    }
}
