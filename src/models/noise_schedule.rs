//! Beta schedules and the per-timestep coefficients of the forward and
//! reverse diffusion process. Values are kept on the host in f64; each
//! sampling step only needs a handful of scalars.

use anyhow::Result;
use std::f64::consts::PI;

use crate::trainers::{BetaScheduleKind, ScheduleSpec};

#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    num_timesteps: usize,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    /// `sqrt` of `[1, alphas_cumprod...]`, length `T + 1`.
    sqrt_alphas_cumprod_prev: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(spec: &ScheduleSpec) -> Result<Self> {
        let n = spec.n_timestep;
        if n == 0 {
            anyhow::bail!("noise schedule needs at least one timestep");
        }

        let betas = match spec.schedule {
            BetaScheduleKind::Linear => linspace(spec.linear_start, spec.linear_end, n),
            BetaScheduleKind::Quad => linspace(spec.linear_start.sqrt(), spec.linear_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaScheduleKind::Warmup10 => warmup_betas(spec.linear_start, spec.linear_end, n, 0.1),
            BetaScheduleKind::Warmup50 => warmup_betas(spec.linear_start, spec.linear_end, n, 0.5),
            BetaScheduleKind::Const => vec![spec.linear_end; n],
            // 1/T, 1/(T-1), ..., 1
            BetaScheduleKind::Jsd => {
                linspace(n as f64, 1.0, n).into_iter().map(|v| 1.0 / v).collect()
            }
            BetaScheduleKind::Cosine => cosine_betas(n, spec.cosine_s),
        };

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut running = 1.0;
        for alpha in &alphas {
            running *= alpha;
            alphas_cumprod.push(running);
        }

        let mut alphas_cumprod_prev = Vec::with_capacity(n);
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..n - 1]);

        let sqrt_alphas_cumprod_prev = std::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .map(f64::sqrt)
            .collect();

        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect();

        let mut posterior_variance = Vec::with_capacity(n);
        let mut posterior_mean_coef1 = Vec::with_capacity(n);
        let mut posterior_mean_coef2 = Vec::with_capacity(n);
        for t in 0..n {
            let denom = 1.0 - alphas_cumprod[t];
            posterior_variance.push(betas[t] * (1.0 - alphas_cumprod_prev[t]) / denom);
            posterior_mean_coef1.push(betas[t] * alphas_cumprod_prev[t].sqrt() / denom);
            posterior_mean_coef2.push((1.0 - alphas_cumprod_prev[t]) * alphas[t].sqrt() / denom);
        }
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .map(|v: &f64| v.max(1e-20).ln())
            .collect();

        Ok(Self {
            num_timesteps: n,
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod_prev,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    pub fn sqrt_alphas_cumprod_prev(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod_prev
    }

    pub fn posterior_variance(&self) -> &[f64] {
        &self.posterior_variance
    }

    /// Coefficients `(a, b)` with `x_0 = a * x_t - b * eps`.
    pub fn start_from_noise_coefs(&self, t: usize) -> (f64, f64) {
        (self.sqrt_recip_alphas_cumprod[t], self.sqrt_recipm1_alphas_cumprod[t])
    }

    /// `(coef1, coef2, log_variance)` of `q(x_{t-1} | x_t, x_0)`.
    pub fn posterior(&self, t: usize) -> (f64, f64, f64) {
        (
            self.posterior_mean_coef1[t],
            self.posterior_mean_coef2[t],
            self.posterior_log_variance_clipped[t],
        )
    }

    /// Interval every how many reverse steps a trajectory frame is kept.
    pub fn sample_interval(&self) -> usize {
        (self.num_timesteps / 10).max(1)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * (i as f64) / (n as f64 - 1.0))
        .collect()
}

fn warmup_betas(start: f64, end: f64, n: usize, warmup_frac: f64) -> Vec<f64> {
    let mut betas = vec![end; n];
    let warmup_time = (n as f64 * warmup_frac) as usize;
    for (slot, value) in betas.iter_mut().zip(linspace(start, end, warmup_time)) {
        *slot = value;
    }
    betas
}

fn cosine_betas(n: usize, s: f64) -> Vec<f64> {
    let alphas: Vec<f64> = (0..=n)
        .map(|i| {
            let t = i as f64 / n as f64 + s;
            (t / (1.0 + s) * PI / 2.0).cos().powi(2)
        })
        .collect();
    let alpha_0 = alphas[0];
    let alphas: Vec<f64> = alphas.iter().map(|a| a / alpha_0).collect();

    alphas
        .windows(2)
        .map(|w| (1.0 - w[1] / w[0]).min(0.999))
        .collect()
}
