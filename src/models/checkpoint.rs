//! Checkpoint slots. Each category owns one set of files under the
//! checkpoint directory and every save overwrites that set.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointCategory {
    Latest,
    BestLoss,
    BestPsnr,
    BestBoth,
}

impl CheckpointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointCategory::Latest => "latest",
            CheckpointCategory::BestLoss => "best_loss",
            CheckpointCategory::BestPsnr => "best_psnr",
            CheckpointCategory::BestBoth => "best_both",
        }
    }

    pub fn files(&self, dir: &Path) -> CheckpointFiles {
        CheckpointFiles::with_prefix(&dir.join(self.as_str()))
    }
}

impl fmt::Display for CheckpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three files of one checkpoint slot.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub gen: PathBuf,
    pub opt: PathBuf,
    pub state: PathBuf,
}

impl CheckpointFiles {
    /// `{prefix}_gen.safetensors`, `{prefix}_opt.safetensors`,
    /// `{prefix}_state.json`; `resume_state` uses the same prefix form.
    pub fn with_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = prefix.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            gen: with_suffix("_gen.safetensors"),
            opt: with_suffix("_opt.safetensors"),
            state: with_suffix("_state.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub iter: usize,
    pub category: CheckpointCategory,
    #[serde(default)]
    pub optimizer_step: usize,
}

impl CheckpointMeta {
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read training state: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| "Failed to parse training state")
    }
}

/// Serialize named tensors with string metadata into a safetensors file.
pub fn write_safetensors(
    path: &Path,
    tensors: &[(String, Tensor)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    // First collect all data and info
    let mut all_data: Vec<Vec<u8>> = Vec::with_capacity(tensors.len());
    let mut tensor_info = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        tensor_info.push((
            name.clone(),
            convert_dtype(tensor.dtype())?,
            tensor.dims().to_vec(),
            all_data.len(),
        ));
        all_data.push(tensor_to_vec(tensor)?);
    }

    // Now create TensorViews using indices
    let mut views = HashMap::new();
    for (name, dtype, shape, idx) in tensor_info {
        views.insert(name, TensorView::new(dtype, shape, &all_data[idx])?);
    }

    let data = serialize(&views, &Some(metadata))?;
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::F64 => Ok(SafeDtype::F64),
        _ => Err(anyhow::anyhow!("Unsupported dtype for safetensors: {:?}", dtype)),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;

    let data = match tensor.dtype() {
        DType::F32 => {
            let data: Vec<f32> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::F64 => {
            let data: Vec<f64> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::F16 => {
            let data: Vec<half::f16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::BF16 => {
            let data: Vec<half::bf16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        _ => return Err(anyhow::anyhow!("Unsupported tensor dtype for conversion")),
    };
    Ok(data)
}
