//! Noise-prediction network conditioned on the three upsampled LR views.
//! Input is `[LR1, LR2, LR3, x_t]` stacked on channels plus the continuous
//! noise level of every sample.

use anyhow::Result;
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{conv2d, linear, ops::silu, Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::trainers::DenoiserConfig;

/// Sinusoidal embedding of a `[B]` noise level into `[B, dim]`.
pub fn noise_level_embedding(noise_level: &Tensor, dim: usize) -> Result<Tensor> {
    let count = dim / 2;
    let steps = (Tensor::arange(0u32, count as u32, noise_level.device())?.to_dtype(DType::F32)?
        / count as f64)?;
    let freqs = (steps * -(1e4f64).ln())?.exp()?;
    let encoding = noise_level.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    Ok(Tensor::cat(&[encoding.sin()?, encoding.cos()?], D::Minus1)?)
}

struct ResBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    noise_proj: Linear,
}

impl ResBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv2d(channels, channels, 3, cfg, vb.pp("conv1"))?,
            conv2: conv2d(channels, channels, 3, cfg, vb.pp("conv2"))?,
            noise_proj: linear(channels, channels, vb.pp("noise_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = x.dims4()?;
        let bias = self.noise_proj.forward(emb)?.reshape((b, c, 1, 1))?;
        let h = self.conv1.forward(&silu(x)?)?.broadcast_add(&bias)?;
        let h = self.conv2.forward(&silu(&h)?)?;
        Ok((x + h)?)
    }
}

pub struct ConditionalDenoiser {
    embed_dim: usize,
    noise_mlp_in: Linear,
    noise_mlp_out: Linear,
    head: Conv2d,
    blocks: Vec<ResBlock>,
    tail: Conv2d,
}

impl ConditionalDenoiser {
    pub fn new(config: &DenoiserConfig, vb: VarBuilder) -> Result<Self> {
        let inner = config.inner_channel;
        let embed_dim = 2 * (inner / 2).max(1);
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let blocks = (0..config.res_blocks)
            .map(|i| ResBlock::new(inner, vb.pp(format!("blocks.{}", i))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embed_dim,
            noise_mlp_in: linear(embed_dim, inner * 4, vb.pp("noise_mlp.0"))?,
            noise_mlp_out: linear(inner * 4, inner, vb.pp("noise_mlp.2"))?,
            head: conv2d(config.in_channel, inner, 3, cfg, vb.pp("head"))?,
            blocks,
            tail: conv2d(inner, config.out_channel, 3, cfg, vb.pp("tail"))?,
        })
    }

    /// Predict the noise in `x` (`[B, in_channel, H, W]`) at `noise_level` (`[B]`).
    pub fn forward(&self, x: &Tensor, noise_level: &Tensor) -> Result<Tensor> {
        let emb = noise_level_embedding(noise_level, self.embed_dim)?;
        let emb = self.noise_mlp_in.forward(&emb)?;
        let emb = self.noise_mlp_out.forward(&silu(&emb)?)?;

        let mut h = self.head.forward(x)?;
        for block in &self.blocks {
            h = block.forward(&h, &emb)?;
        }
        Ok(self.tail.forward(&silu(&h)?)?)
    }
}
