// src/metrics.rs

use crate::align::AlignedPair;
use crate::error::{KfevalError, Result};
use crate::frame_store::{self, Raster};
use crate::ssim;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Pairs handed to the perceptual network per call.
pub const DEFAULT_LPIPS_BATCH: usize = 4;
/// Worker cap when no perceptual model devices are configured.
const CPU_WORKER_CAP: usize = 4;

// --- Data Structures ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MetricRow {
    pub psnr: f64,
    pub ssim: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lpips: Option<f64>,
}

/// Which selection run a table belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Provenance {
    pub strategy: String,
    pub percentage: f64,
    pub method: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricTable {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    pub rows: Vec<MetricRow>,
}

impl MetricTable {
    pub fn has_lpips(&self) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|r| r.lpips.is_some())
    }
}

/// NCHW samples scaled to [-1, 1], the layout perceptual networks consume.
#[derive(Debug, Clone, PartialEq)]
pub struct NchwBatch {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub data: Vec<f32>,
}

impl NchwBatch {
    /// Builds a batch from normalized HWC rasters of identical shape.
    pub fn from_normalized(images: &[&Raster]) -> Result<Self> {
        let first = images
            .first()
            .ok_or_else(|| KfevalError::Metric("cannot build an empty image batch".to_string()))?;
        let (h, w, c) = (first.height as usize, first.width as usize, first.channels as usize);
        let plane = h * w;

        let mut data = Vec::with_capacity(images.len() * c * plane);
        for img in images {
            if img.shape() != first.shape() {
                return Err(KfevalError::Metric(format!(
                    "batch images differ in shape: {:?} vs {:?}",
                    img.shape(),
                    first.shape()
                )));
            }
            for ch in 0..c {
                data.extend((0..plane).map(|p| img.data[p * c + ch] * 2.0 - 1.0));
            }
        }
        Ok(NchwBatch {
            n: images.len(),
            c,
            h,
            w,
            data,
        })
    }
}

/// A pretrained perceptual distance (LPIPS) bound to one compute device.
///
/// Implementations are loaded once and shared read-only across workers;
/// `distance` returns one non-negative score per image pair in the batch.
pub trait PerceptualDistance: Send + Sync {
    fn distance(&self, pred: &NchwBatch, gt: &NchwBatch) -> Result<Vec<f64>>;
}

// --- Core Functions ---

/// Rescales 8-bit range samples to [0, 1]. Already-normalized data is left as is.
pub fn normalize(mut raster: Raster) -> Raster {
    let max = raster.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > 1.0 {
        for v in raster.data.iter_mut() {
            *v /= 255.0;
        }
    }
    raster
}

/// Fails when any sample lies outside [0, 1] (or is NaN).
pub fn check_normalized(raster: &Raster, path: &Path) -> Result<()> {
    let (min, max) = raster
        .data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let has_nan = raster.data.iter().any(|v| v.is_nan());
    if has_nan || min < 0.0 || max > 1.0 {
        return Err(KfevalError::NormalizationViolation {
            path: path.to_path_buf(),
            min,
            max,
        });
    }
    Ok(())
}

/// Peak signal-to-noise ratio for data in [0, 1]; `+inf` when identical.
pub fn psnr(pred: &[f32], gt: &[f32]) -> f64 {
    let sum: f64 = pred
        .iter()
        .zip(gt)
        .map(|(&p, &g)| {
            let d = p as f64 - g as f64;
            d * d
        })
        .sum();
    let mse = sum / pred.len() as f64;
    if mse == 0.0 {
        return f64::INFINITY;
    }
    10.0 * (1.0 / mse).log10()
}

pub fn default_workers() -> usize {
    num_cpus::get().clamp(1, CPU_WORKER_CAP)
}

pub struct MetricEngine {
    perceptual: Vec<Arc<dyn PerceptualDistance>>,
    workers: usize,
    lpips_batch: usize,
}

impl MetricEngine {
    /// PSNR and SSIM only, scored on `workers` threads.
    pub fn new(workers: usize) -> Self {
        MetricEngine {
            perceptual: Vec::new(),
            workers: workers.max(1),
            lpips_batch: DEFAULT_LPIPS_BATCH,
        }
    }

    /// Adds LPIPS with one pre-loaded model per device; the pool then runs one
    /// worker per device.
    pub fn with_perceptual(mut self, models: Vec<Arc<dyn PerceptualDistance>>) -> Self {
        self.perceptual = models;
        self
    }

    pub fn with_lpips_batch(mut self, batch: usize) -> Self {
        self.lpips_batch = batch.max(1);
        self
    }

    pub fn has_lpips(&self) -> bool {
        !self.perceptual.is_empty()
    }

    pub fn shard_count(&self) -> usize {
        if self.perceptual.is_empty() {
            self.workers
        } else {
            self.perceptual.len()
        }
    }

    /// Scores a single pair on the calling thread.
    pub fn score(&self, pair: &AlignedPair) -> Result<MetricRow> {
        let mut scored = self.score_shard(0, &[(0, pair)])?;
        scored
            .pop()
            .map(|(_, row)| row)
            .ok_or_else(|| KfevalError::Metric("pair produced no score".to_string()))
    }

    /// Scores all pairs, sharded round-robin across workers. Rows come back in
    /// submission order; any failing pair fails the whole batch.
    pub fn score_batch(&self, pairs: &[AlignedPair], provenance: Option<Provenance>) -> Result<MetricTable> {
        if pairs.is_empty() {
            return Ok(MetricTable {
                provenance,
                rows: Vec::new(),
            });
        }

        let shards = self.shard_count().min(pairs.len());
        let mut buckets: Vec<Vec<(usize, &AlignedPair)>> = vec![Vec::new(); shards];
        for (position, pair) in pairs.iter().enumerate() {
            buckets[position % shards].push((position, pair));
        }

        info!(
            "Scoring {} pairs on {} shard(s) (LPIPS: {})",
            pairs.len(),
            shards,
            self.has_lpips()
        );
        let start_time = Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(shards)
            .thread_name(|i| format!("kfeval-shard-{}", i))
            .build()
            .map_err(|e| KfevalError::Metric(format!("failed to start worker pool: {}", e)))?;

        let scored: Vec<Vec<(usize, MetricRow)>> = pool.install(|| {
            buckets
                .par_iter()
                .enumerate()
                .map(|(shard, bucket)| self.score_shard(shard, bucket))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut slots: Vec<Option<MetricRow>> = vec![None; pairs.len()];
        for (position, row) in scored.into_iter().flatten() {
            slots[position] = Some(row);
        }
        let rows = slots
            .into_iter()
            .enumerate()
            .map(|(position, row)| {
                row.ok_or_else(|| KfevalError::Metric(format!("no score recorded for pair {}", position)))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Scored {} pairs in {:.2?}",
            rows.len(),
            start_time.elapsed()
        );
        Ok(MetricTable { provenance, rows })
    }

    fn score_shard(&self, shard: usize, bucket: &[(usize, &AlignedPair)]) -> Result<Vec<(usize, MetricRow)>> {
        let model = if self.perceptual.is_empty() {
            None
        } else {
            Some(self.perceptual[shard % self.perceptual.len()].as_ref())
        };

        let mut out = Vec::with_capacity(bucket.len());
        for chunk in bucket.chunks(self.lpips_batch) {
            let mut loaded = Vec::with_capacity(chunk.len());
            for &(position, pair) in chunk {
                let (pred, gt) = load_pair(position, pair)?;
                let psnr = psnr(&pred.data, &gt.data);
                let ssim = ssim::ssim(&pred, &gt, 1.0).map_err(|e| match e {
                    KfevalError::Metric(msg) => KfevalError::Metric(format!(
                        "{} vs {}: {}",
                        pair.predicted.path.display(),
                        pair.ground_truth.path.display(),
                        msg
                    )),
                    other => other,
                })?;
                debug!(
                    "Pair {} ({} vs {}): PSNR {:.2} SSIM {:.4}",
                    position, pair.predicted.index, pair.ground_truth.index, psnr, ssim
                );
                loaded.push((position, pred, gt, psnr, ssim));
            }

            let lpips: Vec<Option<f64>> = match model {
                Some(model) => {
                    let images: Vec<(&Raster, &Raster)> = loaded.iter().map(|(_, p, g, _, _)| (p, g)).collect();
                    perceptual_distances(model, &images)?.into_iter().map(Some).collect()
                }
                None => vec![None; loaded.len()],
            };

            out.extend(
                loaded
                    .into_iter()
                    .zip(lpips)
                    .map(|((position, _, _, psnr, ssim), lpips)| (position, MetricRow { psnr, ssim, lpips })),
            );
        }
        Ok(out)
    }
}

fn load_pair(position: usize, pair: &AlignedPair) -> Result<(Raster, Raster)> {
    let pred = normalize(frame_store::load(&pair.predicted)?);
    check_normalized(&pred, &pair.predicted.path)?;
    let gt = normalize(frame_store::load(&pair.ground_truth)?);
    check_normalized(&gt, &pair.ground_truth.path)?;
    if pred.shape() != gt.shape() {
        return Err(KfevalError::ShapeMismatch {
            position,
            pred: pred.shape(),
            gt: gt.shape(),
        });
    }
    Ok((pred, gt))
}

/// Runs the model over runs of equally shaped pairs.
fn perceptual_distances(model: &dyn PerceptualDistance, images: &[(&Raster, &Raster)]) -> Result<Vec<f64>> {
    let mut distances = Vec::with_capacity(images.len());
    let mut start = 0;
    while start < images.len() {
        let shape = images[start].0.shape();
        let end = images[start..]
            .iter()
            .position(|(p, _)| p.shape() != shape)
            .map_or(images.len(), |offset| start + offset);

        let preds: Vec<&Raster> = images[start..end].iter().map(|(p, _)| *p).collect();
        let gts: Vec<&Raster> = images[start..end].iter().map(|(_, g)| *g).collect();
        let scores = model.distance(&NchwBatch::from_normalized(&preds)?, &NchwBatch::from_normalized(&gts)?)?;

        if scores.len() != preds.len() {
            return Err(KfevalError::Metric(format!(
                "perceptual model returned {} scores for {} pairs",
                scores.len(),
                preds.len()
            )));
        }
        if let Some(bad) = scores.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(KfevalError::Metric(format!("perceptual model returned invalid distance {}", bad)));
        }
        distances.extend(scores);
        start = end;
    }
    Ok(distances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::{AlignOptions, align};
    use crate::frame_store::list_ordered;
    use crate::frame_store::test_support::write_rgb;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Mean absolute difference per pair; records calls and input range.
    struct StubDistance {
        calls: AtomicUsize,
        seen_range: Mutex<(f32, f32)>,
    }

    impl StubDistance {
        fn shared() -> Arc<Self> {
            Arc::new(StubDistance {
                calls: AtomicUsize::new(0),
                seen_range: Mutex::new((f32::INFINITY, f32::NEG_INFINITY)),
            })
        }
    }

    impl PerceptualDistance for StubDistance {
        fn distance(&self, pred: &NchwBatch, gt: &NchwBatch) -> Result<Vec<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut range = self.seen_range.lock().unwrap();
            for &v in pred.data.iter().chain(&gt.data) {
                range.0 = range.0.min(v);
                range.1 = range.1.max(v);
            }
            let per_item = pred.c * pred.h * pred.w;
            Ok((0..pred.n)
                .map(|i| {
                    let s = i * per_item;
                    pred.data[s..s + per_item]
                        .iter()
                        .zip(&gt.data[s..s + per_item])
                        .map(|(a, b)| (a - b).abs() as f64)
                        .sum::<f64>()
                        / per_item as f64
                })
                .collect())
        }
    }

    fn raster(data: Vec<f32>) -> Raster {
        Raster {
            width: data.len() as u32,
            height: 1,
            channels: 1,
            data,
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(raster(vec![0.0, 51.0, 255.0]));
        assert_eq!(once.data, vec![0.0, 0.2, 1.0]);
        let twice = normalize(once.clone());
        assert_eq!(once, twice);
        assert!(check_normalized(&twice, Path::new("x.png")).is_ok());
    }

    #[test]
    fn out_of_range_after_normalization_is_fatal() {
        let bad = normalize(raster(vec![-3.0, 0.5]));
        assert!(matches!(
            check_normalized(&bad, Path::new("x.png")),
            Err(KfevalError::NormalizationViolation { .. })
        ));
        let nan = raster(vec![f32::NAN, 0.5]);
        assert!(check_normalized(&nan, Path::new("x.png")).is_err());
    }

    #[test]
    fn psnr_of_identical_data_is_infinite() {
        let x = vec![0.3f32; 12];
        assert_eq!(psnr(&x, &x), f64::INFINITY);
    }

    #[test]
    fn psnr_matches_definition() {
        let a = vec![0.0f32, 0.0, 0.0, 0.0];
        let b = vec![0.1f32, 0.1, 0.1, 0.1];
        let mse = (0.1f32 as f64).powi(2);
        assert!((psnr(&a, &b) - 10.0 * (1.0 / mse).log10()).abs() < 1e-9);
        assert!(psnr(&a, &b) >= 0.0);
        // mse == 1 gives 0 dB
        assert!(psnr(&[0.0, 1.0], &[1.0, 0.0]).abs() < 1e-12);
    }

    #[test]
    fn batch_layout_is_nchw_in_signed_range() {
        let img = Raster {
            width: 2,
            height: 1,
            channels: 3,
            data: vec![0.0, 0.5, 1.0, 1.0, 0.5, 0.0],
        };
        let batch = NchwBatch::from_normalized(&[&img]).unwrap();
        assert_eq!((batch.n, batch.c, batch.h, batch.w), (1, 3, 1, 2));
        assert_eq!(batch.data, vec![-1.0, 1.0, 0.0, 0.0, 1.0, -1.0]);
    }

    #[test]
    fn identical_black_frames_score_perfectly() {
        let dir = tempdir().unwrap();
        let (pred_dir, gt_dir) = (dir.path().join("pred"), dir.path().join("gt"));
        std::fs::create_dir_all(&pred_dir).unwrap();
        std::fs::create_dir_all(&gt_dir).unwrap();
        write_rgb(&pred_dir, "frame_0000.png", 4, 4, 0);
        write_rgb(&gt_dir, "frame_0000.png", 4, 4, 0);

        let aligned = align(
            &list_ordered(&pred_dir).unwrap(),
            &list_ordered(&gt_dir).unwrap(),
            &AlignOptions::default(),
        )
        .unwrap();
        let stub = StubDistance::shared();
        let engine = MetricEngine::new(1).with_perceptual(vec![stub.clone() as Arc<dyn PerceptualDistance>]);
        let row = engine.score(&aligned.pairs[0]).unwrap();

        assert_eq!(row.psnr, f64::INFINITY);
        assert!((row.ssim - 1.0).abs() < 1e-12);
        assert!(row.lpips.unwrap().abs() < 1e-12);
        assert_eq!(*stub.seen_range.lock().unwrap(), (-1.0, -1.0));
    }

    fn eight_pairs(root: &Path) -> Vec<AlignedPair> {
        let (pred_dir, gt_dir) = (root.join("pred"), root.join("gt"));
        std::fs::create_dir_all(&pred_dir).unwrap();
        std::fs::create_dir_all(&gt_dir).unwrap();
        for i in 0..8u64 {
            write_rgb(&pred_dir, &format!("frame_{:04}.png", i), 8, 8, (i * 20) as u8);
            write_rgb(&gt_dir, &format!("frame_{:04}.png", i), 8, 8, (i * 20 + 5) as u8);
        }
        align(
            &list_ordered(&pred_dir).unwrap(),
            &list_ordered(&gt_dir).unwrap(),
            &AlignOptions::default(),
        )
        .unwrap()
        .pairs
    }

    #[test]
    fn sharding_preserves_submission_order() {
        let dir = tempdir().unwrap();
        let pairs = eight_pairs(dir.path());

        let single_model = StubDistance::shared();
        let single = MetricEngine::new(1)
            .with_perceptual(vec![single_model.clone() as Arc<dyn PerceptualDistance>])
            .score_batch(&pairs, None)
            .unwrap();

        let (a, b) = (StubDistance::shared(), StubDistance::shared());
        let models: Vec<Arc<dyn PerceptualDistance>> = vec![a.clone(), b.clone()];
        let sharded_engine = MetricEngine::new(1).with_perceptual(models);
        assert_eq!(sharded_engine.shard_count(), 2);
        let sharded = sharded_engine.score_batch(&pairs, None).unwrap();

        assert_eq!(single, sharded);
        assert_eq!(single.rows.len(), 8);
        assert!(single.has_lpips());
        // 4 pairs per shard at batch size 4: one model call each
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(single_model.calls.load(Ordering::SeqCst), 2);

        let cpu_only = MetricEngine::new(3).score_batch(&pairs, None).unwrap();
        for (with, without) in single.rows.iter().zip(&cpu_only.rows) {
            assert_eq!((with.psnr, with.ssim), (without.psnr, without.ssim));
            assert!(without.lpips.is_none());
        }
    }

    #[test]
    fn any_failing_pair_fails_the_batch() {
        let dir = tempdir().unwrap();
        let mut pairs = eight_pairs(dir.path());
        std::fs::write(&pairs[5].ground_truth.path, b"").unwrap();
        let result = MetricEngine::new(2).score_batch(&pairs, None);
        assert!(matches!(result, Err(KfevalError::Load { .. })));

        pairs.truncate(0);
        assert!(MetricEngine::new(2).score_batch(&pairs, None).unwrap().rows.is_empty());
    }

    #[test]
    fn reversed_renders_match_after_reversal() {
        let dir = tempdir().unwrap();
        let (pred_dir, gt_dir) = (dir.path().join("pred"), dir.path().join("gt"));
        std::fs::create_dir_all(&pred_dir).unwrap();
        std::fs::create_dir_all(&gt_dir).unwrap();
        for i in 0..5u8 {
            let name = format!("frame_{:04}.png", i);
            write_rgb(&gt_dir, &name, 4, 4, i * 30);
            write_rgb(&pred_dir, &name, 4, 4, (4 - i) * 30);
        }
        let (pred, gt) = (list_ordered(&pred_dir).unwrap(), list_ordered(&gt_dir).unwrap());
        let engine = MetricEngine::new(2);

        let reversed = align(
            &pred,
            &gt,
            &AlignOptions {
                reverse_pred: true,
                ..Default::default()
            },
        )
        .unwrap();
        let table = engine.score_batch(&reversed.pairs, None).unwrap();
        assert_eq!(table.rows.len(), 5);
        for row in &table.rows {
            assert_eq!(row.psnr, f64::INFINITY);
            assert!((row.ssim - 1.0).abs() < 1e-9);
        }

        // Without reversal only the middle frame lines up.
        let forward = align(&pred, &gt, &AlignOptions::default()).unwrap();
        let table = engine.score_batch(&forward.pairs, None).unwrap();
        let perfect = table.rows.iter().filter(|r| r.psnr.is_infinite()).count();
        assert_eq!(perfect, 1);
    }

    #[test]
    fn rows_follow_brightness_gap() {
        let dir = tempdir().unwrap();
        let pairs = eight_pairs(dir.path());
        let table = MetricEngine::new(2).score_batch(&pairs, None).unwrap();
        // Every pair differs by a constant 5/255.
        let expected = 10.0 * (1.0 / (5.0f64 / 255.0).powi(2)).log10();
        for row in &table.rows {
            assert!((row.psnr - expected).abs() < 1e-3, "{}", row.psnr);
        }
    }
}
