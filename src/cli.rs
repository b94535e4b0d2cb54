// src/cli.rs

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Keyframe selection and render-quality evaluation", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Debug-level logging for kfeval itself
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Enable logging to file (e.g., kfeval_YYYYMMDD_HHMMSS.log)
    #[arg(long, global = true)]
    pub log: bool,

    /// Directory for the log file (default: current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dump every video frame as frame_<NNNN>.jpg
    Extract {
        video: PathBuf,
        output_dir: PathBuf,
    },

    /// Select a fraction of frames and copy them into <RUN_DIR>/images
    Select(SelectArgs),

    /// Score predicted frames against ground truth (PSNR, SSIM)
    Eval(EvalArgs),

    /// Aggregate result CSVs into summary statistics and plots
    Report {
        /// Folder holding <pct>p_<strategy>_<method>.csv files
        results_dir: PathBuf,

        /// Where to write plots (default: <RESULTS_DIR>/plots)
        #[arg(long, value_name = "DIR")]
        plots_dir: Option<PathBuf>,
    },

    /// Run extraction, selection and evaluation for an experiment config
    Run {
        /// YAML experiment config
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Folder of source frames
    pub source: PathBuf,

    /// Run directory; frames land in <RUN_DIR>/images
    pub run_dir: PathBuf,

    /// Percentage of frames to keep, in (0, 100]; 1 keeps 1%
    #[arg(long, short)]
    pub percentage: f64,

    /// even (alias n) or random
    #[arg(long, short, default_value = "even")]
    pub strategy: String,

    /// Seed for the random strategy
    #[arg(long)]
    pub seed: Option<u64>,

    /// transforms.json to subset alongside the images
    #[arg(long, value_name = "FILE")]
    pub transforms: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Predicted (rendered) frames
    #[arg(long)]
    pub pred: PathBuf,

    /// Ground-truth frames
    #[arg(long)]
    pub gt: PathBuf,

    /// selected_frames.txt restricting ground truth to those indices
    #[arg(long, value_name = "FILE")]
    pub filter_from: Option<PathBuf>,

    /// Use the frames NOT listed in --filter-from instead
    #[arg(long, requires = "filter_from")]
    pub exclude_selected: bool,

    /// Predicted frames are in reverse temporal order
    #[arg(long)]
    pub reverse_pred: bool,

    /// Selection strategy that produced the training frames
    #[arg(long, requires_all = ["percentage", "method"])]
    pub strategy: Option<String>,

    /// Percentage of frames kept, in (0, 100]
    #[arg(long, requires_all = ["strategy", "method"])]
    pub percentage: Option<f64>,

    /// Reconstruction method (e.g. nerfacto, splatfacto)
    #[arg(long, requires_all = ["strategy", "percentage"])]
    pub method: Option<String>,

    /// Output directory for CSV and summary (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Scoring threads (default: min(cpus, 4))
    #[arg(long)]
    pub workers: Option<usize>,

    /// LPIPS network in ONNX format; adds an LPIPS column
    #[arg(long, value_name = "FILE")]
    pub lpips_model: Option<PathBuf>,

    /// Image pairs per LPIPS call
    #[arg(long, requires = "lpips_model", default_value_t = kfeval::metrics::DEFAULT_LPIPS_BATCH)]
    pub lpips_batch: usize,
}

pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_provenance_flags_go_together() {
        let ok = CliArgs::try_parse_from([
            "kfeval", "eval", "--pred", "p", "--gt", "g", "--strategy", "even", "--percentage", "10", "--method",
            "nerfacto",
        ]);
        assert!(ok.is_ok());

        let partial = CliArgs::try_parse_from(["kfeval", "eval", "--pred", "p", "--gt", "g", "--strategy", "even"]);
        assert!(partial.is_err());
    }

    #[test]
    fn exclude_requires_filter() {
        let bad = CliArgs::try_parse_from(["kfeval", "eval", "--pred", "p", "--gt", "g", "--exclude-selected"]);
        assert!(bad.is_err());
    }

    #[test]
    fn lpips_batch_needs_a_model() {
        let bad = CliArgs::try_parse_from(["kfeval", "eval", "--pred", "p", "--gt", "g", "--lpips-batch", "8"]);
        assert!(bad.is_err());

        let ok = CliArgs::try_parse_from([
            "kfeval", "eval", "--pred", "p", "--gt", "g", "--lpips-model", "lpips.onnx", "--lpips-batch", "8",
        ])
        .unwrap();
        match ok.command {
            Command::Eval(args) => {
                assert_eq!(args.lpips_model, Some(PathBuf::from("lpips.onnx")));
                assert_eq!(args.lpips_batch, 8);
            }
            other => panic!("expected eval, got {:?}", other),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
