pub mod orchestrator;
pub mod checkpoint_policy;
pub mod image_metrics;

// Re-export key types
pub use orchestrator::{Orchestrator, TrainingState};
pub use checkpoint_policy::select_checkpoint;
pub use image_metrics::{MetricsAdapter, StandardMetrics};

use anyhow::{Context, Result};
use candle_core::Device;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::loaders::{create_dataloader, create_dataset};
use crate::logging::{FileDashboard, LocalTracker, RunLogger, ExperimentTracker};
use crate::models::gaussian_diffusion::GaussianDiffusion;

/// Which half of the driver runs: training with periodic validation, or a
/// single evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Train,
    Val,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no dataset configured for phase `{0}`")]
    MissingDataset(Phase),
    #[error("noise schedule for phase `{0}` has zero timesteps")]
    EmptySchedule(Phase),
    #[error("train.n_iter must be positive when phase is `train`")]
    NoIterations,
    #[error("denoiser maps {in_channel} -> {out_channel} channels, images have {channels}")]
    ChannelMismatch {
        in_channel: usize,
        out_channel: usize,
        channels: usize,
    },
}

/// Fully resolved run configuration. Every section defaults, so keys absent
/// from the file take their neutral value once at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub name: String,
    pub phase: Phase,
    pub gpu_ids: Option<Vec<usize>>,
    pub path: PathConfig,
    pub datasets: DatasetsConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub eval: EvalConfig,
    pub wandb: WandbConfig,
    pub enable_wandb: bool,
    pub log_wandb_ckpt: bool,
    pub log_eval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub log: PathBuf,
    pub tb_logger: PathBuf,
    pub results: PathBuf,
    pub checkpoint: PathBuf,
    pub resume_state: Option<PathBuf>,
    /// Set by [`RunConfig::resolve`]; never read from the file.
    #[serde(skip_deserializing)]
    pub experiments_root: Option<PathBuf>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            log: PathBuf::from("logs"),
            tb_logger: PathBuf::from("tb_logger"),
            results: PathBuf::from("results"),
            checkpoint: PathBuf::from("checkpoint"),
            resume_state: None,
            experiments_root: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetsConfig {
    pub train: Option<DatasetSpec>,
    pub val: Option<DatasetSpec>,
}

impl DatasetsConfig {
    pub fn for_phase(&self, phase: Phase) -> Option<&DatasetSpec> {
        match phase {
            Phase::Train => self.train.as_ref(),
            Phase::Val => self.val.as_ref(),
        }
    }
}

/// Image size given either as a single edge or as `[height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resolution {
    Square(u32),
    Rect([u32; 2]),
}

impl Resolution {
    /// `(height, width)`
    pub fn dims(&self) -> (u32, u32) {
        match *self {
            Resolution::Square(edge) => (edge, edge),
            Resolution::Rect([h, w]) => (h, w),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSpec {
    pub name: String,
    pub dataroot: PathBuf,
    pub l_resolution: Resolution,
    pub r_resolution: Resolution,
    pub batch_size: usize,
    pub num_workers: usize,
    pub use_shuffle: bool,
    /// Number of samples to keep; non-positive keeps all of them.
    pub data_len: i64,
}

impl Default for DatasetSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            dataroot: PathBuf::new(),
            l_resolution: Resolution::Square(16),
            r_resolution: Resolution::Square(128),
            batch_size: 1,
            num_workers: 1,
            use_shuffle: false,
            data_len: -1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub denoiser: DenoiserConfig,
    pub beta_schedule: BetaSchedules,
    pub diffusion: DiffusionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiserConfig {
    pub in_channel: usize,
    pub out_channel: usize,
    pub inner_channel: usize,
    pub res_blocks: usize,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            in_channel: 12,
            out_channel: 3,
            inner_channel: 32,
            res_blocks: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BetaSchedules {
    pub train: ScheduleSpec,
    pub val: ScheduleSpec,
}

impl BetaSchedules {
    pub fn for_phase(&self, phase: Phase) -> &ScheduleSpec {
        match phase {
            Phase::Train => &self.train,
            Phase::Val => &self.val,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetaScheduleKind {
    #[default]
    Linear,
    Quad,
    Warmup10,
    Warmup50,
    Const,
    Jsd,
    Cosine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSpec {
    pub schedule: BetaScheduleKind,
    pub n_timestep: usize,
    pub linear_start: f64,
    pub linear_end: f64,
    pub cosine_s: f64,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            schedule: BetaScheduleKind::Linear,
            n_timestep: 2000,
            linear_start: 1e-6,
            linear_end: 1e-2,
            cosine_s: 8e-3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    #[default]
    L1,
    L2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub channels: usize,
    pub loss_type: LossType,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            channels: 3,
            loss_type: LossType::L1,
        }
    }
}

/// Periodic actions fire only when their frequency is set and non-zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub n_iter: usize,
    pub val_freq: Option<usize>,
    pub save_checkpoint_freq: Option<usize>,
    pub print_freq: Option<usize>,
    pub optimizer: OptimizerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { lr: 1e-4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrImageMode {
    /// One file per trajectory frame.
    Single,
    /// A strip of the whole trajectory plus the final frame.
    #[default]
    Grid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub sr_image_mode: SrImageMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WandbConfig {
    pub project: Option<String>,
}

/// Command-line adjustments applied on top of the file.
#[derive(Debug, Clone)]
pub struct RunOverrides {
    pub phase: Option<Phase>,
    pub gpu_ids: Option<Vec<usize>>,
    pub debug: bool,
    pub enable_wandb: bool,
    pub log_wandb_ckpt: bool,
    pub log_eval: bool,
    pub experiments_dir: PathBuf,
}

impl Default for RunOverrides {
    fn default() -> Self {
        Self {
            phase: None,
            gpu_ids: None,
            debug: false,
            enable_wandb: false,
            log_wandb_ckpt: false,
            log_eval: false,
            experiments_dir: PathBuf::from("experiments"),
        }
    }
}

impl RunConfig {
    /// Apply overrides, create the experiment directory tree and validate.
    pub fn resolve(self, overrides: &RunOverrides) -> Result<Self> {
        let timestamp = chrono::Local::now().format("%y%m%d_%H%M%S").to_string();
        self.resolve_at(overrides, &timestamp)
    }

    pub fn resolve_at(mut self, overrides: &RunOverrides, timestamp: &str) -> Result<Self> {
        if let Some(phase) = overrides.phase {
            self.phase = phase;
        }
        if let Some(ids) = &overrides.gpu_ids {
            self.gpu_ids = Some(ids.clone());
        }
        self.enable_wandb |= overrides.enable_wandb;
        self.log_wandb_ckpt |= overrides.log_wandb_ckpt;
        self.log_eval |= overrides.log_eval;

        if overrides.debug && !self.name.starts_with("debug") {
            self.name = format!("debug_{}", self.name);
        }
        if self.name.contains("debug") {
            self.shrink_for_debug();
        }

        let root = overrides
            .experiments_dir
            .join(format!("{}_{}", self.name, timestamp));
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create experiment root: {}", root.display()))?;
        for dir in [
            &mut self.path.log,
            &mut self.path.tb_logger,
            &mut self.path.results,
            &mut self.path.checkpoint,
        ] {
            if dir.is_relative() {
                *dir = root.join(&*dir);
            }
            fs::create_dir_all(&*dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        self.path.experiments_root = Some(root);

        self.validate()?;
        Ok(self)
    }

    fn shrink_for_debug(&mut self) {
        self.train.print_freq = Some(2);
        self.train.val_freq = Some(2);
        self.train.save_checkpoint_freq = Some(3);
        self.model.beta_schedule.train.n_timestep = 10;
        self.model.beta_schedule.val.n_timestep = 10;
        if let Some(train) = self.datasets.train.as_mut() {
            train.batch_size = 2;
        }
        if let Some(val) = self.datasets.val.as_mut() {
            val.data_len = 3;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.datasets.val.is_none() {
            return Err(ConfigError::MissingDataset(Phase::Val));
        }
        if self.phase == Phase::Train {
            if self.datasets.train.is_none() {
                return Err(ConfigError::MissingDataset(Phase::Train));
            }
            if self.train.n_iter == 0 {
                return Err(ConfigError::NoIterations);
            }
        }
        for phase in [Phase::Train, Phase::Val] {
            if self.model.beta_schedule.for_phase(phase).n_timestep == 0 {
                return Err(ConfigError::EmptySchedule(phase));
            }
        }
        // Input stacks three LR views and the noisy target
        let denoiser = &self.model.denoiser;
        let channels = self.model.diffusion.channels;
        if denoiser.out_channel != channels || denoiser.in_channel != 4 * channels {
            return Err(ConfigError::ChannelMismatch {
                in_channel: denoiser.in_channel,
                out_channel: denoiser.out_channel,
                channels,
            });
        }
        Ok(())
    }

    /// Human readable dump of the resolved options.
    pub fn summary(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render config")
    }

    pub fn device(&self) -> Result<Device> {
        match self.gpu_ids.as_ref().and_then(|ids| ids.first()) {
            Some(&ordinal) => Ok(Device::cuda_if_available(ordinal)?),
            None => Ok(Device::Cpu),
        }
    }
}

/// Strip full-line `//` comments so annotated JSON configs parse.
fn strip_json_comments(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("yml") | Some("yaml") => serde_yaml::from_str(&config_str)
            .with_context(|| "Failed to parse YAML config")?,
        _ => serde_json::from_str(&strip_json_comments(&config_str))
            .with_context(|| "Failed to parse JSON config")?,
    };

    Ok(config)
}

/// Build every collaborator from a resolved configuration and run the
/// requested phase.
pub fn run_from_config(config: RunConfig) -> Result<()> {
    let logger = RunLogger::create("base", &config.path.log, "train", true)?;
    let val_logger = RunLogger::create("val", &config.path.log, "val", false)?;
    logger.info(&config.summary()?);

    let dashboard = FileDashboard::create(&config.path.tb_logger)?;
    let tracker: Option<Box<dyn ExperimentTracker>> = if config.enable_wandb {
        Some(Box::new(LocalTracker::create(&config)?))
    } else {
        None
    };

    let device = config.device()?;
    info!("Using device: {:?}", device);

    let mut train_loader = None;
    if config.phase == Phase::Train {
        let spec = config
            .datasets
            .for_phase(Phase::Train)
            .ok_or(ConfigError::MissingDataset(Phase::Train))?;
        let dataset = create_dataset(spec, Phase::Train)?;
        train_loader = Some(create_dataloader(dataset, spec, Phase::Train, &device)?);
    }
    let val_spec = config
        .datasets
        .for_phase(Phase::Val)
        .ok_or(ConfigError::MissingDataset(Phase::Val))?;
    let val_set = create_dataset(val_spec, Phase::Val)?;
    let mut val_loader = create_dataloader(val_set, val_spec, Phase::Val, &device)?;
    logger.info("Initial Dataset Finished");

    let model = GaussianDiffusion::new(&config, device)?;
    logger.info("Initial Model Finished");

    let mut orchestrator = Orchestrator::new(
        &config,
        model,
        StandardMetrics,
        logger,
        val_logger,
        Box::new(dashboard),
        tracker,
    );
    match train_loader.as_mut() {
        Some(train_loader) => orchestrator.train(train_loader, &mut val_loader),
        None => orchestrator.evaluate(&mut val_loader),
    }
}
