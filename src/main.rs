mod cli;

use crate::cli::{CliArgs, Command, EvalArgs, SelectArgs};
use chrono::Local;
use kfeval::metrics::{self, MetricEngine, Provenance};
use kfeval::selector::{self, SelectionOutcome, Strategy};
use kfeval::{align, config, ffmpeg, frame_store, lpips, report, runner, transforms};
use kfeval::{KfevalError, Result};
use log::{error, info, LevelFilter};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashSet;
use std::error::Error as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

fn main() -> ExitCode {
    let start_time = Instant::now();
    let args = cli::parse_args();

    if let Err(e) = setup_logging(&args) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting kfeval...");
    info!("Arguments: {:?}", args);

    match run(args) {
        Ok(()) => {
            let duration = start_time.elapsed();
            info!("Completed successfully in {:.2?}", duration);
            ExitCode::SUCCESS
        }
        Err(e) => {
            let duration = start_time.elapsed();
            error!("Failed after {:.2?}: {}", duration, e);
            eprintln!("Error: {}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

/// Sets up logging to console and optionally to a file.
fn setup_logging(args: &CliArgs) -> std::result::Result<(), fern::InitError> {
    let own_level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Info)
        .level_for("kfeval", own_level);

    let console_config = fern::Dispatch::new().chain(std::io::stdout());
    let mut logger = base_config.chain(console_config);

    let mut log_path = None;
    if args.log {
        let log_filename = format!("kfeval_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
        let dir = args.log_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)?;
        let path = dir.join(log_filename);
        logger = logger.chain(fern::Dispatch::new().chain(fern::log_file(&path)?));
        log_path = Some(path);
    }

    logger.apply()?;
    if let Some(path) = log_path {
        info!("Logging to file: {}", path.display());
    }
    Ok(())
}

fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Extract { video, output_dir } => {
            let count = ffmpeg::extract_frames(&video, &output_dir)?;
            println!("{} frames in {}", count, output_dir.display());
            Ok(())
        }
        Command::Select(select_args) => run_select(select_args),
        Command::Eval(eval_args) => run_eval(eval_args),
        Command::Report { results_dir, plots_dir } => {
            let plots_dir = plots_dir.unwrap_or_else(|| results_dir.join("plots"));
            runner::write_report(&results_dir, &plots_dir)
        }
        Command::Run { config } => {
            let config = config::load_config(&config)?;
            runner::run_experiment(&config)
        }
    }
}

fn run_select(args: SelectArgs) -> Result<()> {
    let fraction = config::to_fraction(args.percentage).ok_or_else(|| {
        KfevalError::Input(format!("Percentage {} is not in (0, 100]", args.percentage))
    })?;
    let strategy: Strategy = args.strategy.parse()?;
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    match selector::materialize(&args.source, &args.run_dir, fraction, strategy, &mut rng)? {
        SelectionOutcome::Skipped => {
            println!("{} already selected, nothing to do", args.run_dir.display());
        }
        SelectionOutcome::Selected { indices, copied } => {
            if let Some(transforms_path) = &args.transforms {
                transforms::subset_transforms(
                    transforms_path,
                    &indices,
                    &args.run_dir.join(transforms::TRANSFORMS_FILE),
                )?;
            }
            println!("Selected {} frames into {}", copied, args.run_dir.display());
        }
    }
    Ok(())
}

fn run_eval(args: EvalArgs) -> Result<()> {
    let provenance = match (&args.strategy, args.percentage, &args.method) {
        (Some(strategy), Some(percentage), Some(method)) => {
            let fraction = config::to_fraction(percentage)
                .ok_or_else(|| KfevalError::Input(format!("Percentage {} is not in (0, 100]", percentage)))?;
            Some(Provenance {
                strategy: strategy.clone(),
                percentage: config::to_percentage(fraction),
                method: method.clone(),
            })
        }
        (None, None, None) => None,
        _ => {
            return Err(KfevalError::Input(
                "--strategy, --percentage and --method must be given together".to_string(),
            ));
        }
    };

    let pred = frame_store::list_ordered(&args.pred)?;
    let gt = frame_store::list_ordered(&args.gt)?;

    let filter = match &args.filter_from {
        Some(ledger) => {
            let selected: HashSet<_> = selector::read_selection(ledger)?.into_iter().collect();
            let filter: HashSet<_> = if args.exclude_selected {
                gt.indices().into_iter().filter(|i| !selected.contains(i)).collect()
            } else {
                selected
            };
            info!(
                "Evaluating {} {} frames from {}",
                filter.len(),
                if args.exclude_selected { "held-out" } else { "selected" },
                ledger.display()
            );
            Some(filter)
        }
        None => None,
    };

    let alignment = align::align(
        &pred,
        &gt,
        &align::AlignOptions {
            frame_filter: filter.as_ref(),
            reverse_pred: args.reverse_pred,
        },
    )?;

    let workers = args.workers.unwrap_or_else(metrics::default_workers);
    let mut engine = MetricEngine::new(workers).with_lpips_batch(args.lpips_batch);
    if let Some(model) = &args.lpips_model {
        engine = engine.with_perceptual(lpips::load_devices(model, workers)?);
    }
    let table = engine.score_batch(&alignment.pairs, provenance)?;

    let output_dir = args.output_dir.unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&output_dir)?;
    let stem = table
        .provenance
        .as_ref()
        .map(report::result_file_stem)
        .unwrap_or_else(|| "metrics".to_string());
    let csv_path = output_dir.join(format!("{}.csv", stem));
    report::write_csv(&table, &csv_path)?;
    let summary = report::write_summary_json(&table, &summary_path(&output_dir, &stem))?;

    println!("Results saved:");
    println!("  CSV: {}", csv_path.display());
    println!(
        "  {} frames, mean PSNR {}, mean SSIM {}",
        summary.frames,
        summary.mean_psnr.map_or("n/a".to_string(), |v| format!("{:.2}", v)),
        summary.mean_ssim.map_or("n/a".to_string(), |v| format!("{:.4}", v)),
    );
    if let Some(mean_lpips) = summary.mean_lpips {
        println!("  mean LPIPS {:.4}", mean_lpips);
    }
    Ok(())
}

fn summary_path(output_dir: &Path, stem: &str) -> PathBuf {
    output_dir.join(format!("{}_summary.json", stem))
}
