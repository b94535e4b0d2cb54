// src/config.rs

use crate::error::{KfevalError, Result};
use crate::metrics::{DEFAULT_LPIPS_BATCH, default_workers};
use crate::selector::Strategy;
use log::info;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Experiment file as written by hand; every key optional until validated.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    videos: Option<Vec<PathBuf>>,
    percentages: Option<Vec<f64>>,
    algorithms: Option<Vec<String>>,
    proj_dir: Option<PathBuf>,
    eval_images: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    seed: Option<u64>,
    workers: Option<usize>,
    lpips_model: Option<PathBuf>,
    lpips_batch: Option<usize>,
    reverse_pred: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub videos: Vec<PathBuf>,
    /// `percentages` as fractions in (0, 1].
    pub fractions: Vec<f64>,
    pub strategies: Vec<Strategy>,
    pub proj_dir: PathBuf,
    /// Ground-truth frames for evaluation.
    pub eval_images: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub seed: Option<u64>,
    pub workers: usize,
    /// ONNX LPIPS network; one copy is loaded per worker.
    pub lpips_model: Option<PathBuf>,
    pub lpips_batch: usize,
    /// Renders come out in reverse temporal order.
    pub reverse_pred: bool,
}

/// Percent in (0, 100] to a fraction of frames kept. `1` means 1%.
pub fn to_fraction(percentage: f64) -> Option<f64> {
    if !percentage.is_finite() || percentage <= 0.0 || percentage > 100.0 {
        None
    } else {
        Some(percentage / 100.0)
    }
}

/// Percentage label for a fraction, rounded to hide float noise (0.07 -> 7).
pub fn to_percentage(fraction: f64) -> f64 {
    (fraction * 100.0 * 1e6).round() / 1e6
}

pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let contents = fs::read_to_string(path).map_err(|e| {
        KfevalError::ConfigurationMissing(vec![format!("cannot read config {}: {}", path.display(), e)])
    })?;
    let raw: RawConfig = serde_yaml::from_str(&contents)?;
    let config = validate(raw)?;
    info!(
        "Loaded config {}: {} videos, {} percentages, {} strategies",
        path.display(),
        config.videos.len(),
        config.fractions.len(),
        config.strategies.len()
    );
    Ok(config)
}

fn validate(raw: RawConfig) -> Result<ExperimentConfig> {
    let mut problems: Vec<String> = Vec::new();

    let videos = raw.videos.unwrap_or_default();
    if videos.is_empty() {
        problems.push("videos: at least one video path is required".to_string());
    }
    for (i, video) in videos.iter().enumerate() {
        if !video.is_file() {
            problems.push(format!("videos[{}]: file not found: {}", i, video.display()));
        }
    }

    let percentages = raw.percentages.unwrap_or_default();
    if percentages.is_empty() {
        problems.push("percentages: at least one percentage is required".to_string());
    }
    let mut fractions = Vec::with_capacity(percentages.len());
    for (i, value) in percentages.iter().enumerate() {
        match to_fraction(*value) {
            Some(fraction) => fractions.push(fraction),
            None => problems.push(format!("percentages[{}]: {} is not in (0, 100]", i, value)),
        }
    }

    let algorithms = raw.algorithms.unwrap_or_default();
    if algorithms.is_empty() {
        problems.push("algorithms: at least one selection strategy is required".to_string());
    }
    let mut strategies = Vec::with_capacity(algorithms.len());
    for (i, tag) in algorithms.iter().enumerate() {
        match tag.parse::<Strategy>() {
            Ok(strategy) if !strategies.contains(&strategy) => strategies.push(strategy),
            Ok(_) => {}
            Err(_) => problems.push(format!(
                "algorithms[{}]: unknown strategy '{}' (expected even, n, uniform or random)",
                i, tag
            )),
        }
    }

    if raw.proj_dir.is_none() {
        problems.push("proj_dir: project directory is required".to_string());
    }

    if let Some(eval_images) = &raw.eval_images {
        if !eval_images.is_dir() {
            problems.push(format!("eval_images: not a directory: {}", eval_images.display()));
        }
    }

    if let Some(model) = &raw.lpips_model {
        if !model.is_file() {
            problems.push(format!("lpips_model: file not found: {}", model.display()));
        }
    }

    if raw.workers == Some(0) {
        problems.push("workers: must be at least 1".to_string());
    }
    if raw.lpips_batch == Some(0) {
        problems.push("lpips_batch: must be at least 1".to_string());
    }

    let Some(proj_dir) = raw.proj_dir else {
        return Err(KfevalError::ConfigurationMissing(problems));
    };
    if !problems.is_empty() {
        return Err(KfevalError::ConfigurationMissing(problems));
    }

    Ok(ExperimentConfig {
        videos,
        fractions,
        strategies,
        results_dir: raw.results_dir.unwrap_or_else(|| proj_dir.join("results")),
        proj_dir,
        eval_images: raw.eval_images,
        seed: raw.seed,
        workers: raw.workers.unwrap_or_else(default_workers),
        lpips_model: raw.lpips_model,
        lpips_batch: raw.lpips_batch.unwrap_or(DEFAULT_LPIPS_BATCH),
        reverse_pred: raw.reverse_pred,
    })
}
