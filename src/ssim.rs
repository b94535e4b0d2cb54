// src/ssim.rs
//
// Mean structural similarity over uniform square windows, per channel, then
// averaged across channels. Windows are only evaluated where they fit entirely
// inside the image, so no border padding mode is involved.

use crate::error::{KfevalError, Result};
use crate::frame_store::Raster;

pub const DEFAULT_WINDOW: usize = 7;
const K1: f64 = 0.01;
const K2: f64 = 0.03;

/// Summed-area table with a zero row and column in front.
struct Integral {
    stride: usize,
    sums: Vec<f64>,
}

impl Integral {
    fn new(height: usize, width: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = width + 1;
        let mut sums = vec![0.0; (height + 1) * stride];
        for y in 0..height {
            let mut row = 0.0;
            for x in 0..width {
                row += value(y, x);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Integral { stride, sums }
    }

    fn window(&self, y: usize, x: usize, size: usize) -> f64 {
        let s = self.stride;
        let (y1, x1) = (y + size, x + size);
        self.sums[y1 * s + x1] - self.sums[y * s + x1] - self.sums[y1 * s + x] + self.sums[y * s + x]
    }
}

/// Largest odd window not exceeding the image or `DEFAULT_WINDOW`.
pub fn window_size(height: usize, width: usize) -> Option<usize> {
    let limit = DEFAULT_WINDOW.min(height).min(width);
    if limit < 3 {
        return None;
    }
    Some(if limit % 2 == 0 { limit - 1 } else { limit })
}

pub fn ssim(pred: &Raster, gt: &Raster, data_range: f64) -> Result<f64> {
    if pred.shape() != gt.shape() {
        return Err(KfevalError::Metric(format!(
            "SSIM inputs differ in shape: {:?} vs {:?}",
            pred.shape(),
            gt.shape()
        )));
    }
    let (h, w, c) = (pred.height as usize, pred.width as usize, pred.channels as usize);
    let win = window_size(h, w).ok_or_else(|| {
        KfevalError::Metric(format!("image {}x{} is too small for SSIM (minimum 3x3)", w, h))
    })?;

    let total: f64 = (0..c)
        .map(|ch| channel_ssim(&pred.data, &gt.data, (h, w, c), ch, win, data_range))
        .sum();
    Ok(total / c as f64)
}

fn channel_ssim(
    pred: &[f32],
    gt: &[f32],
    (h, w, c): (usize, usize, usize),
    ch: usize,
    win: usize,
    data_range: f64,
) -> f64 {
    let at = |data: &[f32], y: usize, x: usize| data[(y * w + x) * c + ch] as f64;

    let sx = Integral::new(h, w, |y, x| at(pred, y, x));
    let sy = Integral::new(h, w, |y, x| at(gt, y, x));
    let sxx = Integral::new(h, w, |y, x| at(pred, y, x).powi(2));
    let syy = Integral::new(h, w, |y, x| at(gt, y, x).powi(2));
    let sxy = Integral::new(h, w, |y, x| at(pred, y, x) * at(gt, y, x));

    let np = (win * win) as f64;
    // Sample covariance over the window.
    let cov_norm = np / (np - 1.0);
    let c1 = (K1 * data_range).powi(2);
    let c2 = (K2 * data_range).powi(2);

    let mut total = 0.0;
    let mut count = 0usize;
    for y in 0..=(h - win) {
        for x in 0..=(w - win) {
            let ux = sx.window(y, x, win) / np;
            let uy = sy.window(y, x, win) / np;
            let vx = cov_norm * (sxx.window(y, x, win) / np - ux * ux);
            let vy = cov_norm * (syy.window(y, x, win) / np - uy * uy);
            let vxy = cov_norm * (sxy.window(y, x, win) / np - ux * uy);

            let numerator = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let denominator = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += numerator / denominator;
            count += 1;
        }
    }
    total / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn raster(h: u32, w: u32, c: u8, data: Vec<f32>) -> Raster {
        Raster {
            width: w,
            height: h,
            channels: c,
            data,
        }
    }

    fn random_raster(rng: &mut StdRng, h: u32, w: u32, c: u8) -> Raster {
        let n = (h * w * c as u32) as usize;
        raster(h, w, c, (0..n).map(|_| rng.random::<f32>()).collect())
    }

    #[test]
    fn window_shrinks_to_fit() {
        assert_eq!(window_size(100, 100), Some(7));
        assert_eq!(window_size(4, 4), Some(3));
        assert_eq!(window_size(6, 50), Some(5));
        assert_eq!(window_size(2, 50), None);
    }

    #[test]
    fn identical_images_score_one() {
        let zeros = raster(4, 4, 3, vec![0.0; 48]);
        assert!((ssim(&zeros, &zeros, 1.0).unwrap() - 1.0).abs() < 1e-12);

        let mut rng = StdRng::seed_from_u64(1);
        let img = random_raster(&mut rng, 16, 12, 3);
        assert!((ssim(&img, &img, 1.0).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn random_images_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..5 {
            let a = random_raster(&mut rng, 20, 20, 3);
            let b = random_raster(&mut rng, 20, 20, 3);
            let score = ssim(&a, &b, 1.0).unwrap();
            assert!((-1.0..=1.0).contains(&score), "{}", score);
            assert!(score < 0.5);
        }
    }

    #[test]
    fn inverted_image_scores_negative() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random_raster(&mut rng, 16, 16, 1);
        let inverted = raster(16, 16, 1, a.data.iter().map(|v| 1.0 - v).collect());
        assert!(ssim(&a, &inverted, 1.0).unwrap() < 0.0);
    }

    #[test]
    fn matches_direct_window_computation() {
        // One 3x3 window over a single channel, computed by hand.
        let a = raster(3, 3, 1, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        let b = raster(3, 3, 1, vec![0.1, 0.1, 0.3, 0.4, 0.6, 0.6, 0.7, 0.8, 1.0]);
        let n = 9.0;
        let mean = |v: &[f32]| v.iter().map(|&x| x as f64).sum::<f64>() / n;
        let (ua, ub) = (mean(&a.data), mean(&b.data));
        let cov = |p: &[f32], q: &[f32], up: f64, uq: f64| {
            p.iter()
                .zip(q)
                .map(|(&x, &y)| (x as f64 - up) * (y as f64 - uq))
                .sum::<f64>()
                / (n - 1.0)
        };
        let (va, vb, vab) = (
            cov(&a.data, &a.data, ua, ua),
            cov(&b.data, &b.data, ub, ub),
            cov(&a.data, &b.data, ua, ub),
        );
        let (c1, c2) = (0.01f64.powi(2), 0.03f64.powi(2));
        let expected = ((2.0 * ua * ub + c1) * (2.0 * vab + c2)) / ((ua * ua + ub * ub + c1) * (va + vb + c2));
        assert!((ssim(&a, &b, 1.0).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn tiny_images_fail() {
        let img = raster(2, 2, 1, vec![0.0; 4]);
        assert!(matches!(ssim(&img, &img, 1.0), Err(KfevalError::Metric(_))));
    }
}
