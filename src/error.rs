// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KfevalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load frame {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Frame count mismatch: {pred} predicted vs {gt} ground-truth frames")]
    CountMismatch { pred: usize, gt: usize },

    #[error("Shape mismatch at position {position}: predicted {pred:?} vs ground-truth {gt:?} (h, w, c)")]
    ShapeMismatch {
        position: usize,
        pred: (u32, u32, u8),
        gt: (u32, u32, u8),
    },

    #[error("Normalized image {path} has values outside [0, 1] (min {min}, max {max})")]
    NormalizationViolation { path: PathBuf, min: f32, max: f32 },

    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    ConfigurationMissing(Vec<String>),

    #[error("Metric computation failed: {0}")]
    Metric(String),

    #[error("FFmpeg/FFprobe command failed: {0}")]
    Command(String),

    #[error("Failed to parse: {0}")]
    Parse(String),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML processing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV processing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Plotting error: {0}")]
    Plot(String),

    #[error("Input error: {0}")]
    Input(String),
}

impl KfevalError {
    pub fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        KfevalError::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

// Define a standard Result type for the crate
pub type Result<T> = std::result::Result<T, KfevalError>;
