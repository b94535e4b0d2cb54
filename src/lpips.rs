// src/lpips.rs
//
// LPIPS from an ONNX export of the network. The graph takes two NCHW float
// inputs scaled to [-1, 1] (prediction first) and returns one distance per
// sample, e.g. shape [n, 1, 1, 1].

use crate::error::{KfevalError, Result};
use crate::metrics::{NchwBatch, PerceptualDistance};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tract_onnx::prelude::*;

/// Channels the network expects; gray frames are repeated to fill them.
const NETWORK_CHANNELS: usize = 3;

pub struct OnnxLpips {
    path: PathBuf,
    plan: TypedSimplePlan<TypedModel>,
}

impl OnnxLpips {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(KfevalError::Input(format!("LPIPS model not found: {}", path.display())));
        }
        let start = Instant::now();
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| KfevalError::Metric(format!("cannot load LPIPS model {}: {:#}", path.display(), e)))?;
        debug!("Loaded LPIPS model {} in {:.2?}", path.display(), start.elapsed());
        Ok(OnnxLpips {
            path: path.to_path_buf(),
            plan,
        })
    }

    fn input(&self, batch: &NchwBatch) -> Result<TValue> {
        let data = expand_to_rgb(batch)?;
        Tensor::from_shape(&[batch.n, NETWORK_CHANNELS, batch.h, batch.w], data.as_slice())
            .map(|t| t.into())
            .map_err(|e| KfevalError::Metric(format!("cannot build LPIPS input tensor: {:#}", e)))
    }
}

impl PerceptualDistance for OnnxLpips {
    fn distance(&self, pred: &NchwBatch, gt: &NchwBatch) -> Result<Vec<f64>> {
        if (pred.n, pred.c, pred.h, pred.w) != (gt.n, gt.c, gt.h, gt.w) {
            return Err(KfevalError::Metric(format!(
                "LPIPS batches differ: {:?} vs {:?}",
                (pred.n, pred.c, pred.h, pred.w),
                (gt.n, gt.c, gt.h, gt.w)
            )));
        }

        let outputs = self
            .plan
            .run(tvec!(self.input(pred)?, self.input(gt)?))
            .map_err(|e| KfevalError::Metric(format!("LPIPS inference with {} failed: {:#}", self.path.display(), e)))?;
        let first = outputs
            .first()
            .ok_or_else(|| KfevalError::Metric(format!("{} produced no output", self.path.display())))?;
        let scores: Vec<f64> = first
            .to_array_view::<f32>()
            .map_err(|e| KfevalError::Metric(format!("LPIPS output is not f32: {:#}", e)))?
            .iter()
            .map(|&v| v as f64)
            .collect();

        if scores.len() != pred.n {
            return Err(KfevalError::Metric(format!(
                "LPIPS output has {} values for a batch of {}",
                scores.len(),
                pred.n
            )));
        }
        Ok(scores)
    }
}

/// Loads `count` independent copies of the model, one per scoring worker.
pub fn load_devices(path: &Path, count: usize) -> Result<Vec<Arc<dyn PerceptualDistance>>> {
    let count = count.max(1);
    let mut models: Vec<Arc<dyn PerceptualDistance>> = Vec::with_capacity(count);
    for _ in 0..count {
        models.push(Arc::new(OnnxLpips::load(path)?));
    }
    info!("LPIPS enabled: {} x {}", count, path.display());
    Ok(models)
}

/// NCHW data with exactly three channels. One-channel planes are repeated.
fn expand_to_rgb(batch: &NchwBatch) -> Result<Vec<f32>> {
    match batch.c {
        NETWORK_CHANNELS => Ok(batch.data.clone()),
        1 => {
            let plane = batch.h * batch.w;
            let mut data = Vec::with_capacity(batch.n * NETWORK_CHANNELS * plane);
            for sample in batch.data.chunks(plane) {
                for _ in 0..NETWORK_CHANNELS {
                    data.extend_from_slice(sample);
                }
            }
            Ok(data)
        }
        c => Err(KfevalError::Metric(format!("LPIPS needs 1 or 3 channels, got {}", c))),
    }
}
