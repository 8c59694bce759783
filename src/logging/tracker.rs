//! Experiment tracking. `LocalTracker` keeps the run's metrics, media,
//! checkpoint artifacts and evaluation table under `{experiment}/tracker/`.

use anyhow::{Context, Result};
use image::RgbImage;
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use crate::models::checkpoint::CheckpointCategory;
use crate::trainers::RunConfig;

pub trait ExperimentTracker {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>) -> Result<()>;
    fn log_image(&mut self, key: &str, image: &RgbImage) -> Result<()>;
    /// Register the current `latest` checkpoint as an artifact.
    fn log_checkpoint(&mut self, epoch: usize, step: usize) -> Result<()>;
    /// Buffer one evaluation row; written out by [`log_eval_table`].
    ///
    /// [`log_eval_table`]: ExperimentTracker::log_eval_table
    fn log_eval_data(
        &mut self,
        lr: &RgbImage,
        sr: &RgbImage,
        hr: &RgbImage,
        psnr: f64,
        ssim: f64,
    ) -> Result<()>;
    fn log_eval_table(&mut self) -> Result<()>;
}

struct EvalRow {
    lr: RgbImage,
    sr: RgbImage,
    hr: RgbImage,
    psnr: f64,
    ssim: f64,
}

#[derive(Serialize)]
struct EvalRecord {
    index: usize,
    lr: String,
    sr: String,
    hr: String,
    psnr: f64,
    ssim: f64,
}

pub struct LocalTracker {
    root: PathBuf,
    checkpoint_dir: PathBuf,
    metrics: LineWriter<File>,
    step: usize,
    eval_rows: Vec<EvalRow>,
}

impl LocalTracker {
    pub fn create(config: &RunConfig) -> Result<Self> {
        let base = config
            .path
            .experiments_root
            .clone()
            .unwrap_or_else(|| config.path.log.clone());
        let root = base.join("tracker");
        for dir in [root.join("media"), root.join("artifacts"), root.join("eval")] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        }

        let run = serde_json::json!({
            "project": config.wandb.project.clone().unwrap_or_else(|| config.name.clone()),
            "name": config.name,
            "phase": config.phase.as_str(),
            "started": chrono::Local::now().to_rfc3339(),
        });
        fs::write(root.join("run.json"), serde_json::to_string_pretty(&run)?)?;

        let metrics_path = root.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metrics_path)
            .with_context(|| format!("Failed to open {}", metrics_path.display()))?;

        info!("Tracking experiment in {}", root.display());
        Ok(Self {
            root,
            checkpoint_dir: config.path.checkpoint.clone(),
            metrics: LineWriter::new(file),
            step: 0,
            eval_rows: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn save(image: &RgbImage, path: &Path) -> Result<()> {
        image
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("Failed to save {}", path.display()))
    }
}

impl ExperimentTracker for LocalTracker {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let mut record = serde_json::Map::new();
        record.insert("_step".to_string(), serde_json::json!(self.step));
        for (key, value) in metrics {
            record.insert(key.clone(), serde_json::json!(value));
        }
        writeln!(self.metrics, "{}", serde_json::Value::Object(record))
            .context("Failed to append metrics")?;
        self.step += 1;
        Ok(())
    }

    fn log_image(&mut self, key: &str, image: &RgbImage) -> Result<()> {
        let path = self.root.join("media").join(format!("{}_{}.png", key, self.step));
        Self::save(image, &path)
    }

    fn log_checkpoint(&mut self, epoch: usize, step: usize) -> Result<()> {
        let artifact_dir = self
            .root
            .join("artifacts")
            .join(format!("I{}_E{}", step, epoch));
        fs::create_dir_all(&artifact_dir)?;

        let files = CheckpointCategory::Latest.files(&self.checkpoint_dir);
        for source in [&files.gen, &files.opt, &files.state] {
            if let Some(name) = source.file_name() {
                fs::copy(source, artifact_dir.join(name)).with_context(|| {
                    format!("Failed to copy checkpoint artifact {}", source.display())
                })?;
            }
        }

        let record = serde_json::json!({
            "epoch": epoch,
            "iter": step,
            "aliases": [format!("epoch_{}", epoch), format!("iter_{}", step)],
            "dir": artifact_dir,
        });
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("artifacts.jsonl"))?;
        writeln!(index, "{}", record)?;
        Ok(())
    }

    fn log_eval_data(
        &mut self,
        lr: &RgbImage,
        sr: &RgbImage,
        hr: &RgbImage,
        psnr: f64,
        ssim: f64,
    ) -> Result<()> {
        self.eval_rows.push(EvalRow {
            lr: lr.clone(),
            sr: sr.clone(),
            hr: hr.clone(),
            psnr,
            ssim,
        });
        Ok(())
    }

    fn log_eval_table(&mut self) -> Result<()> {
        let eval_dir = self.root.join("eval");
        let mut records = Vec::with_capacity(self.eval_rows.len());
        for (index, row) in self.eval_rows.drain(..).enumerate() {
            let mut names = Vec::with_capacity(3);
            for (tag, image) in [("lr", &row.lr), ("sr", &row.sr), ("hr", &row.hr)] {
                let name = format!("{}_{}.png", index, tag);
                Self::save(image, &eval_dir.join(&name))?;
                names.push(name);
            }
            let mut names = names.into_iter();
            records.push(EvalRecord {
                index,
                lr: names.next().unwrap_or_default(),
                sr: names.next().unwrap_or_default(),
                hr: names.next().unwrap_or_default(),
                psnr: row.psnr,
                ssim: row.ssim,
            });
        }
        let table_path = self.root.join("eval_table.json");
        fs::write(&table_path, serde_json::to_string_pretty(&records)?)
            .with_context(|| format!("Failed to write {}", table_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_in(dir: &Path) -> Result<LocalTracker> {
        let mut config = RunConfig::default();
        config.name = "lp".to_string();
        config.path.experiments_root = Some(dir.to_path_buf());
        config.path.checkpoint = dir.join("checkpoint");
        fs::create_dir_all(&config.path.checkpoint)?;
        LocalTracker::create(&config)
    }

    #[test]
    fn test_metrics_carry_running_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tracker = tracker_in(dir.path())?;
        let mut metrics = BTreeMap::new();
        metrics.insert("l_pix".to_string(), 0.5);
        tracker.log_metrics(&metrics)?;
        tracker.log_metrics(&metrics)?;

        let contents = fs::read_to_string(tracker.root().join("metrics.jsonl"))?;
        let last: serde_json::Value = serde_json::from_str(contents.lines().last().unwrap())?;
        assert_eq!(last["_step"], 1);
        assert_eq!(last["l_pix"], 0.5);
        Ok(())
    }

    #[test]
    fn test_eval_table_flushes_buffered_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tracker = tracker_in(dir.path())?;
        let img = RgbImage::new(4, 4);
        tracker.log_eval_data(&img, &img, &img, 30.0, 0.9)?;
        tracker.log_eval_data(&img, &img, &img, 20.0, 0.5)?;
        tracker.log_eval_table()?;

        let table: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(tracker.root().join("eval_table.json"))?)?;
        assert_eq!(table.as_array().map(|rows| rows.len()), Some(2));
        assert_eq!(table[1]["sr"], "1_sr.png");
        assert!(tracker.root().join("eval/1_hr.png").is_file());
        Ok(())
    }

    #[test]
    fn test_checkpoint_artifact_copies_latest_slot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tracker = tracker_in(dir.path())?;
        let files = CheckpointCategory::Latest.files(&dir.path().join("checkpoint"));
        for path in [&files.gen, &files.opt, &files.state] {
            fs::write(path, b"x")?;
        }
        tracker.log_checkpoint(2, 300)?;

        let artifact = tracker.root().join("artifacts/I300_E2");
        assert!(artifact.join("latest_gen.safetensors").is_file());
        assert!(artifact.join("latest_state.json").is_file());
        Ok(())
    }
}
