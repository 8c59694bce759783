//! Tensor to image conversion and image quality metrics.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use image::{GenericImage, RgbImage};
use std::path::Path;

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f64 = 1.5;

/// Everything the orchestrator needs to turn model output into files and
/// numbers.
pub trait MetricsAdapter {
    /// `[3, H, W]` tensor in `[-1, 1]` to an 8-bit image.
    fn tensor_to_image(&self, tensor: &Tensor) -> Result<RgbImage>;
    fn save_image(&self, image: &RgbImage, path: &Path) -> Result<()>;
    fn calculate_psnr(&self, sr: &RgbImage, hr: &RgbImage) -> f64;
    fn calculate_ssim(&self, sr: &RgbImage, hr: &RgbImage) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardMetrics;

impl MetricsAdapter for StandardMetrics {
    fn tensor_to_image(&self, tensor: &Tensor) -> Result<RgbImage> {
        // Convert from [-1, 1] to [0, 255]
        let tensor = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
        let tensor = tensor.round()?.to_dtype(DType::U8)?;

        let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
        if channel != 3 {
            anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
        }

        let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
        RgbImage::from_raw(width as u32, height as u32, data)
            .context("Failed to create image buffer")
    }

    fn save_image(&self, image: &RgbImage, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        image
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("Failed to save {}", path.display()))
    }

    fn calculate_psnr(&self, sr: &RgbImage, hr: &RgbImage) -> f64 {
        let n = sr.as_raw().len().min(hr.as_raw().len());
        if n == 0 {
            return f64::NAN;
        }
        let mse = sr
            .as_raw()
            .iter()
            .zip(hr.as_raw())
            .map(|(a, b)| {
                let d = *a as f64 - *b as f64;
                d * d
            })
            .sum::<f64>()
            / n as f64;
        if mse == 0.0 {
            return f64::INFINITY;
        }
        20.0 * (255.0 / mse.sqrt()).log10()
    }

    fn calculate_ssim(&self, sr: &RgbImage, hr: &RgbImage) -> Result<f64> {
        if sr.dimensions() != hr.dimensions() {
            anyhow::bail!(
                "Input images must have the same dimensions: {:?} vs {:?}",
                sr.dimensions(),
                hr.dimensions()
            );
        }
        let (w, h) = (sr.width() as usize, sr.height() as usize);
        if w < SSIM_WINDOW || h < SSIM_WINDOW {
            log::warn!("SSIM undefined below {0}x{0} pixels, got {1}x{2}", SSIM_WINDOW, w, h);
            return Ok(f64::NAN);
        }

        let kernel = gaussian_kernel();
        let mut total = 0.0;
        for c in 0..3 {
            let plane =
                |img: &RgbImage| -> Vec<f64> { img.pixels().map(|p| p[c] as f64).collect() };
            total += ssim_plane(&plane(sr), &plane(hr), w, h, &kernel);
        }
        Ok(total / 3.0)
    }
}

fn gaussian_kernel() -> Vec<f64> {
    let half = (SSIM_WINDOW / 2) as f64;
    let raw: Vec<f64> = (0..SSIM_WINDOW)
        .map(|i| {
            let x = i as f64 - half;
            (-(x * x) / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

/// Separable Gaussian filter keeping only fully covered positions.
fn filter_valid(plane: &[f64], w: usize, h: usize, kernel: &[f64]) -> (Vec<f64>, usize, usize) {
    let k = kernel.len();
    let (ow, oh) = (w - k + 1, h - k + 1);

    let mut rows = vec![0.0; ow * h];
    for y in 0..h {
        for x in 0..ow {
            rows[y * ow + x] = (0..k).map(|i| plane[y * w + x + i] * kernel[i]).sum();
        }
    }
    let mut out = vec![0.0; ow * oh];
    for y in 0..oh {
        for x in 0..ow {
            out[y * ow + x] = (0..k).map(|i| rows[(y + i) * ow + x] * kernel[i]).sum();
        }
    }
    (out, ow, oh)
}

fn ssim_plane(a: &[f64], b: &[f64], w: usize, h: usize, kernel: &[f64]) -> f64 {
    let c1 = (0.01f64 * 255.0).powi(2);
    let c2 = (0.03f64 * 255.0).powi(2);

    let product = |f: fn(f64, f64) -> f64| -> Vec<f64> {
        a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect()
    };
    let (mu1, ow, oh) = filter_valid(a, w, h, kernel);
    let (mu2, _, _) = filter_valid(b, w, h, kernel);
    let (aa, _, _) = filter_valid(&product(|x, _| x * x), w, h, kernel);
    let (bb, _, _) = filter_valid(&product(|_, y| y * y), w, h, kernel);
    let (ab, _, _) = filter_valid(&product(|x, y| x * y), w, h, kernel);

    let n = ow * oh;
    let mut sum = 0.0;
    for i in 0..n {
        let (m1, m2) = (mu1[i], mu2[i]);
        let sigma1 = aa[i] - m1 * m1;
        let sigma2 = bb[i] - m2 * m2;
        let sigma12 = ab[i] - m1 * m2;
        sum += ((2.0 * m1 * m2 + c1) * (2.0 * sigma12 + c2))
            / ((m1 * m1 + m2 * m2 + c1) * (sigma1 + sigma2 + c2));
    }
    sum / n as f64
}

/// Concatenate images left to right.
pub fn concat_horizontal(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        anyhow::bail!("no images to concatenate");
    }
    let height = images.iter().map(|img| img.height()).max().unwrap_or(0);
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = RgbImage::new(total_width, height);

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0).context("failed to concatenate image")?;
        offset_x += img.width();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use image::Rgb;

    fn noisy(w: u32, h: u32, seed: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = ((x * 31 + y * 17 + seed * 7) % 251) as u8;
            Rgb([v, v.wrapping_add(40), 255 - v])
        })
    }

    #[test]
    fn test_tensor_to_image_maps_range() -> Result<()> {
        let t = Tensor::new(&[[[-1f32, 1.0]], [[0.0, 2.0]], [[-3.0, 0.5]]], &Device::Cpu)?;
        let img = StandardMetrics.tensor_to_image(&t)?;
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0), &Rgb([0, 128, 0]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([255, 255, 191]));
        Ok(())
    }

    #[test]
    fn test_psnr_identical_is_infinite_and_known_value() {
        let a = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        assert!(StandardMetrics.calculate_psnr(&a, &a).is_infinite());

        // Uniform error of 5 gives 20 * log10(255 / 5)
        let b = RgbImage::from_pixel(4, 4, Rgb([105, 105, 105]));
        let psnr = StandardMetrics.calculate_psnr(&a, &b);
        assert!((psnr - 20.0 * 51f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn test_ssim_bounds() -> Result<()> {
        let a = noisy(16, 16, 1);
        let same = StandardMetrics.calculate_ssim(&a, &a)?;
        assert!((same - 1.0).abs() < 1e-9);

        let other = StandardMetrics.calculate_ssim(&a, &noisy(16, 16, 9))?;
        assert!(other < 1.0);

        // Smaller than the window: undefined, not fatal
        assert!(StandardMetrics.calculate_ssim(&noisy(8, 8, 1), &noisy(8, 8, 1))?.is_nan());
        assert!(StandardMetrics.calculate_ssim(&noisy(4, 20, 1), &noisy(4, 20, 1))?.is_nan());
        assert!(StandardMetrics.calculate_ssim(&a, &noisy(16, 12, 1)).is_err());
        Ok(())
    }

    #[test]
    fn test_concat_and_save() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let strip = concat_horizontal(&[noisy(3, 2, 0), noisy(5, 2, 1)])?;
        assert_eq!(strip.dimensions(), (8, 2));
        assert!(concat_horizontal(&[]).is_err());

        let path = dir.path().join("nested/strip.png");
        StandardMetrics.save_image(&strip, &path)?;
        assert_eq!(image::open(&path)?.to_rgb8(), strip);
        Ok(())
    }
}
