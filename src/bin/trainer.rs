//! LP-Diff training and evaluation driver
//!
//! Usage: cargo run --bin trainer -- -c config/lp_diff.json -p train

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use lpdiff::trainers::{load_config, run_from_config, Phase, RunOverrides};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train or evaluate the LP-Diff super-resolution model")]
struct Args {
    /// JSON or YAML configuration file
    #[arg(short, long, default_value = "config/lp_diff.json")]
    config: PathBuf,

    /// Run training with periodic validation, or evaluation only
    #[arg(short, long, value_enum)]
    phase: Option<Phase>,

    /// Comma separated GPU ids, e.g. `0,1`
    #[arg(short, long, value_delimiter = ',')]
    gpu_ids: Option<Vec<usize>>,

    /// Short run with frequent logging and a tiny schedule
    #[arg(short, long)]
    debug: bool,

    #[arg(long)]
    enable_wandb: bool,

    /// Register every `latest` checkpoint with the experiment tracker
    #[arg(long)]
    log_wandb_ckpt: bool,

    /// Record per-sample evaluation rows with the experiment tracker
    #[arg(long)]
    log_eval: bool,

    /// Directory experiment folders are created in
    #[arg(long, default_value = "experiments")]
    experiments_dir: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    lpdiff::logging::init_logger(args.debug);

    info!("Loading configuration: {}", args.config.display());
    let overrides = RunOverrides {
        phase: args.phase,
        gpu_ids: args.gpu_ids,
        debug: args.debug,
        enable_wandb: args.enable_wandb,
        log_wandb_ckpt: args.log_wandb_ckpt,
        log_eval: args.log_eval,
        experiments_dir: args.experiments_dir,
    };
    let config = load_config(&args.config)?.resolve(&overrides)?;
    info!("Experiment [{}] in phase {}", config.name, config.phase);

    run_from_config(config)
}
