use anyhow::{Context, Result};
use image::RgbImage;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

/// Scalar and image sink keyed by step.
pub trait DashboardSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) -> Result<()>;
}

/// Dashboard backed by the log directory: scalars as JSON lines in
/// `scalars.jsonl`, images as `images/{tag}_{step}.png`.
pub struct FileDashboard {
    scalars: LineWriter<File>,
    image_dir: PathBuf,
}

impl FileDashboard {
    pub fn create(dir: &Path) -> Result<Self> {
        let image_dir = dir.join("images");
        fs::create_dir_all(&image_dir)
            .with_context(|| format!("Failed to create directory: {:?}", image_dir))?;
        let scalar_path = dir.join("scalars.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&scalar_path)
            .with_context(|| format!("Failed to open {}", scalar_path.display()))?;

        Ok(Self {
            scalars: LineWriter::new(file),
            image_dir,
        })
    }
}

impl DashboardSink for FileDashboard {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let record = serde_json::json!({
            "tag": tag,
            "value": value,
            "step": step,
            "wall_time": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        });
        writeln!(self.scalars, "{}", record).context("Failed to append scalar")?;
        Ok(())
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: usize) -> Result<()> {
        let path = self.image_dir.join(format!("{}_{}.png", tag, step));
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        Ok(())
    }
}
