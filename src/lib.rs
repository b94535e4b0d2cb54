//! Keyframe selection for radiance-field training and frame-by-frame
//! quality scoring of the resulting renders.

pub mod align;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod frame_store;
pub mod lpips;
pub mod metrics;
pub mod plot;
pub mod report;
pub mod runner;
pub mod selector;
pub mod ssim;
pub mod transforms;

pub use error::{KfevalError, Result};
