// src/runner.rs

use crate::align::{self, AlignOptions};
use crate::config::{self, ExperimentConfig};
use crate::error::{KfevalError, Result};
use crate::ffmpeg;
use crate::frame_store::{self, FrameIndex, FrameOrdering};
use crate::lpips;
use crate::metrics::{MetricEngine, Provenance};
use crate::plot;
use crate::report::{self, MetricKind};
use crate::selector::{self, SelectionOutcome, Strategy};
use crate::transforms;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-method render folders inside a run directory: `<run_dir>/renders/<method>/`.
pub const RENDERS_DIR: &str = "renders";
const FRAMES_DIR: &str = "frames";
const SUMMARY_FILE: &str = "summary.json";

/// One video's working folders under the project directory.
struct VideoLayout {
    name: String,
    video_dir: PathBuf,
    frames_dir: PathBuf,
    results_dir: PathBuf,
}

impl VideoLayout {
    fn new(config: &ExperimentConfig, video: &Path) -> Result<Self> {
        let name = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| KfevalError::Input(format!("Video path has no file name: {}", video.display())))?;
        let video_dir = config.proj_dir.join(&name);
        Ok(VideoLayout {
            frames_dir: video_dir.join(FRAMES_DIR),
            results_dir: config.results_dir.join(&name),
            video_dir,
            name,
        })
    }
}

/// Extracts, selects and evaluates every (video, percentage, strategy)
/// combination of `config`. Steps whose output already exists are skipped.
pub fn run_experiment(config: &ExperimentConfig) -> Result<()> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let engine = metric_engine(config)?;

    for (i, video) in config.videos.iter().enumerate() {
        info!("--- Video {}/{}: {} ---", i + 1, config.videos.len(), video.display());
        let layout = VideoLayout::new(config, video)?;
        ffmpeg::extract_frames(video, &layout.frames_dir)?;

        let mut written = 0;
        for &fraction in &config.fractions {
            for &strategy in &config.strategies {
                let run_dir = prepare_run(&layout, fraction, strategy, &mut rng)?;
                let percentage = config::to_percentage(fraction);
                written += evaluate_run(config, &engine, &layout, &run_dir, percentage, strategy)?;
            }
        }

        if !layout.results_dir.is_dir() || report::collect_results(&layout.results_dir)?.is_empty() {
            info!("No evaluation results for {} yet, skipping report", layout.name);
            continue;
        }
        debug!("{} new result files for {}", written, layout.name);
        write_report(&layout.results_dir, &layout.results_dir.join("plots"))?;
    }
    Ok(())
}

/// PSNR and SSIM on `workers` threads, plus LPIPS when a model is configured.
fn metric_engine(config: &ExperimentConfig) -> Result<MetricEngine> {
    let engine = MetricEngine::new(config.workers).with_lpips_batch(config.lpips_batch);
    Ok(match &config.lpips_model {
        Some(model) => engine.with_perceptual(lpips::load_devices(model, config.workers)?),
        None => engine,
    })
}

fn prepare_run(layout: &VideoLayout, fraction: f64, strategy: Strategy, rng: &mut StdRng) -> Result<PathBuf> {
    let run_dir = selector::run_dir(&layout.video_dir, config::to_percentage(fraction), strategy);
    let outcome = selector::materialize(&layout.frames_dir, &run_dir, fraction, strategy, rng)?;

    let transforms_path = layout.video_dir.join(transforms::TRANSFORMS_FILE);
    if let SelectionOutcome::Selected { indices, .. } = &outcome {
        if transforms_path.is_file() {
            transforms::subset_transforms(&transforms_path, indices, &run_dir.join(transforms::TRANSFORMS_FILE))?;
        } else {
            debug!("No {} for {}", transforms::TRANSFORMS_FILE, layout.name);
        }
    }
    Ok(run_dir)
}

/// Scores every `<run_dir>/renders/<method>/` folder that has no results file
/// yet. Returns how many results files were written.
fn evaluate_run(
    config: &ExperimentConfig,
    engine: &MetricEngine,
    layout: &VideoLayout,
    run_dir: &Path,
    percentage: f64,
    strategy: Strategy,
) -> Result<usize> {
    let renders = run_dir.join(RENDERS_DIR);
    if !renders.is_dir() {
        debug!("No renders in {}", run_dir.display());
        return Ok(0);
    }

    let mut methods: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&renders)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name() {
                methods.push((name.to_string_lossy().to_string(), path));
            }
        }
    }
    methods.sort();

    let gt_dir = config.eval_images.as_deref().unwrap_or(layout.frames_dir.as_path());
    let ledger = run_dir.join(selector::SELECTION_LEDGER);
    let selection: Option<Vec<FrameIndex>> = if ledger.is_file() {
        Some(selector::read_selection(&ledger)?)
    } else {
        None
    };

    fs::create_dir_all(&layout.results_dir)?;
    let mut written = 0;

    for (method, pred_dir) in methods {
        let provenance = Provenance {
            strategy: strategy.to_string(),
            percentage,
            method,
        };
        let csv_path = layout
            .results_dir
            .join(format!("{}.csv", report::result_file_stem(&provenance)));
        if csv_path.exists() {
            info!("{} already exists, skipping evaluation", csv_path.display());
            continue;
        }

        let pred = frame_store::list_ordered(&pred_dir)?;
        let gt = frame_store::list_ordered(gt_dir)?;

        // Renders of only the training views are compared against those views.
        let filter: Option<HashSet<FrameIndex>> = match &selection {
            Some(indices) if pred.len() == indices.len() && pred.len() != gt.len() => {
                if gt.ordering() == FrameOrdering::Lexicographic {
                    warn!(
                        "{} is not numbered by frame; selection indices are taken as positions",
                        gt_dir.display()
                    );
                }
                Some(indices.iter().copied().collect())
            }
            _ => None,
        };

        let alignment = align::align(
            &pred,
            &gt,
            &AlignOptions {
                frame_filter: filter.as_ref(),
                reverse_pred: config.reverse_pred,
            },
        )?;
        let table = engine.score_batch(&alignment.pairs, Some(provenance))?;
        report::write_csv(&table, &csv_path)?;
        written += 1;
    }
    Ok(written)
}

/// Summary statistics plus one plot per metric and method for every results
/// file in `results_dir`.
pub fn write_report(results_dir: &Path, plots_dir: &Path) -> Result<()> {
    let tables = report::collect_results(results_dir)?;
    if tables.is_empty() {
        return Err(KfevalError::Input(format!(
            "No <pct>p_<strategy>_<method>.csv files in {}",
            results_dir.display()
        )));
    }

    let groups = report::summarize(&tables);
    let summary_path = results_dir.join(SUMMARY_FILE);
    fs::write(&summary_path, serde_json::to_string_pretty(&groups)?)?;
    info!("Wrote statistics for {} groups to {}", groups.len(), summary_path.display());

    let mut methods: Vec<&str> = groups.iter().map(|g| g.method.as_str()).collect();
    methods.dedup();

    fs::create_dir_all(plots_dir)?;
    for method in methods {
        for metric in MetricKind::ALL {
            let has_data = groups
                .iter()
                .any(|g| g.method == method && metric.stats(g).is_some());
            if !has_data {
                debug!("No {} values for {}, skipping plot", metric.label(), method);
                continue;
            }
            let path = plots_dir.join(format!("{}_{}.png", method, metric.label().to_ascii_lowercase()));
            plot::plot_metric(&groups, metric, method, &path)?;
            println!("  {} plot: {}", metric.label(), path.display());
        }
    }
    Ok(())
}
