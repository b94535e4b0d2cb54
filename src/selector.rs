// src/selector.rs

use crate::error::{KfevalError, Result};
use crate::frame_store::{self, FrameIndex};
use log::{info, warn};
use rand::Rng;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File written next to the selected images, one source frame index per line.
pub const SELECTION_LEDGER: &str = "selected_frames.txt";
pub const IMAGES_DIR: &str = "images";
const FLOOR_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Evenly spaced across the whole sequence.
    Even,
    /// Uniform sample without replacement, kept in playback order.
    Random,
}

impl Strategy {
    pub fn tag(&self) -> &'static str {
        match self {
            Strategy::Even => "even",
            Strategy::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Strategy {
    type Err = KfevalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "even" | "n" | "uniform" => Ok(Strategy::Even),
            "random" => Ok(Strategy::Random),
            other => Err(KfevalError::Input(format!("Unknown selection strategy: '{}'", other))),
        }
    }
}

/// Number of frames kept for `fraction` of `total_frames` (floored).
///
/// The floor tolerates float noise of `FLOOR_EPSILON`, so this knowingly
/// differs from a plain truncating `int(total * fraction)`: 100 frames at 29%
/// keep 29 here, where truncation keeps 28.
pub fn selection_size(total_frames: usize, fraction: f64) -> usize {
    // 100 * 0.29 is 28.999999999999996 in binary floating point.
    (total_frames as f64 * fraction + FLOOR_EPSILON).floor() as usize
}

/// Chooses positions in `[0, total_frames)`, ascending.
pub fn select<R: Rng + ?Sized>(
    total_frames: usize,
    fraction: f64,
    strategy: Strategy,
    rng: &mut R,
) -> Result<Vec<usize>> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(KfevalError::Input(format!(
            "Selection fraction must be in (0, 1], got {}",
            fraction
        )));
    }
    let k = selection_size(total_frames, fraction);

    let positions = match strategy {
        Strategy::Even => even_positions(total_frames, k),
        Strategy::Random => {
            let mut picked = rand::seq::index::sample(rng, total_frames, k).into_vec();
            picked.sort_unstable();
            picked
        }
    };
    Ok(positions)
}

// round(i * (n - 1) / (k - 1)); rounding may repeat an index and that is kept.
fn even_positions(total_frames: usize, k: usize) -> Vec<usize> {
    match k {
        0 => Vec::new(),
        1 => vec![0],
        _ => {
            let span = total_frames.saturating_sub(1) as f64;
            let steps = (k - 1) as f64;
            (0..k)
                .map(|i| (i as f64 * span / steps).round() as usize)
                .collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    /// Destination already existed; nothing was recomputed.
    Skipped,
    Selected {
        indices: Vec<FrameIndex>,
        copied: usize,
    },
}

/// Selects frames from `source` and copies them into `<run_dir>/images`,
/// recording the chosen source indices in `<run_dir>/selected_frames.txt`.
pub fn materialize<R: Rng + ?Sized>(
    source: &Path,
    run_dir: &Path,
    fraction: f64,
    strategy: Strategy,
    rng: &mut R,
) -> Result<SelectionOutcome> {
    let images_dir = run_dir.join(IMAGES_DIR);
    if images_dir.exists() {
        info!(
            "Selection output {} already exists, skipping ({} @ {:.0}%)",
            images_dir.display(),
            strategy,
            fraction * 100.0
        );
        return Ok(SelectionOutcome::Skipped);
    }

    let sequence = frame_store::list_ordered(source)?;
    let positions = select(sequence.len(), fraction, strategy, rng)?;
    if positions.is_empty() {
        warn!(
            "{} @ {:.0}% keeps no frames out of {} in {}",
            strategy,
            fraction * 100.0,
            sequence.len(),
            source.display()
        );
    }

    let chosen: Vec<_> = positions.iter().map(|&p| sequence.frames()[p].clone()).collect();
    let copied = frame_store::copy_into(&chosen, &images_dir)?;
    let indices: Vec<FrameIndex> = chosen.iter().map(|f| f.index).collect();
    write_selection(&run_dir.join(SELECTION_LEDGER), &indices)?;

    info!(
        "Selected {} of {} frames ({} @ {:.0}%) into {}",
        copied,
        sequence.len(),
        strategy,
        fraction * 100.0,
        images_dir.display()
    );
    Ok(SelectionOutcome::Selected { indices, copied })
}

pub fn write_selection(path: &Path, indices: &[FrameIndex]) -> Result<()> {
    let mut content = String::new();
    for index in indices {
        content.push_str(&index.to_string());
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}

pub fn read_selection(path: &Path) -> Result<Vec<FrameIndex>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<FrameIndex>()
                .map_err(|_| KfevalError::Parse(format!("Invalid frame index '{}' in {}", line, path.display())))
        })
        .collect()
}

/// `<pct>p_<strategy>` directory name for one selection run.
pub fn run_dir_name(percentage: f64, strategy: Strategy) -> String {
    format!("{}p_{}", format_percentage(percentage), strategy)
}

pub fn format_percentage(percentage: f64) -> String {
    if percentage.fract() == 0.0 {
        format!("{}", percentage as u64)
    } else {
        format!("{}", percentage)
    }
}

pub fn run_dir(base: &Path, percentage: f64, strategy: Strategy) -> PathBuf {
    base.join(run_dir_name(percentage, strategy))
}
