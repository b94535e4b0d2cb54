// src/report.rs

use crate::error::{KfevalError, Result};
use crate::metrics::{MetricRow, MetricTable, Provenance};
use crate::selector::format_percentage;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use quantiles::ckms::CKMS;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

/// Infinite PSNR (identical frames) is capped at this value for statistics.
pub const PSNR_CAP_DB: f64 = 100.0;

static RESULT_FILE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<pct>\d+(?:\.\d+)?)p_(?P<strategy>.+)_(?P<method>[^_]+)\.csv$")
        .expect("Invalid result file regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Psnr,
    Ssim,
    Lpips,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Psnr, MetricKind::Ssim, MetricKind::Lpips];

    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::Psnr => "PSNR",
            MetricKind::Ssim => "SSIM",
            MetricKind::Lpips => "LPIPS",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::Psnr => " (dB)",
            _ => "",
        }
    }

    pub fn stats<'a>(&self, group: &'a GroupStats) -> Option<&'a Stats> {
        match self {
            MetricKind::Psnr => Some(&group.psnr),
            MetricKind::Ssim => Some(&group.ssim),
            MetricKind::Lpips => group.lpips.as_ref(),
        }
    }
}

/// `<pct>p_<strategy>_<method>`
pub fn result_file_stem(provenance: &Provenance) -> String {
    format!(
        "{}p_{}_{}",
        format_percentage(provenance.percentage),
        provenance.strategy,
        provenance.method
    )
}

pub fn parse_result_file_name(file_name: &str) -> Option<Provenance> {
    let caps = RESULT_FILE_REGEX.captures(file_name)?;
    Some(Provenance {
        percentage: caps.name("pct")?.as_str().parse().ok()?,
        strategy: caps.name("strategy")?.as_str().to_string(),
        method: caps.name("method")?.as_str().to_string(),
    })
}

fn two_decimals(value: f64) -> String {
    format!("{:.2}", value)
}

/// Writes `PSNR,SSIM[,LPIPS]` rows with two decimals.
pub fn write_csv(table: &MetricTable, path: &Path) -> Result<()> {
    let with_lpips = table.has_lpips();
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec![MetricKind::Psnr.label(), MetricKind::Ssim.label()];
    if with_lpips {
        header.push(MetricKind::Lpips.label());
    }
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![two_decimals(row.psnr), two_decimals(row.ssim)];
        if let (true, Some(lpips)) = (with_lpips, row.lpips) {
            record.push(two_decimals(lpips));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!("Wrote {} metric rows to {}", table.rows.len(), path.display());
    Ok(())
}

pub fn read_csv(path: &Path) -> Result<Vec<MetricRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));

    let psnr_col = column("PSNR")
        .ok_or_else(|| KfevalError::Parse(format!("{} has no PSNR column", path.display())))?;
    let ssim_col = column("SSIM")
        .ok_or_else(|| KfevalError::Parse(format!("{} has no SSIM column", path.display())))?;
    let lpips_col = column("LPIPS");

    let parse = |record: &csv::StringRecord, col: usize| -> Result<f64> {
        let raw = record.get(col).unwrap_or("").trim();
        raw.parse::<f64>()
            .map_err(|_| KfevalError::Parse(format!("Invalid value '{}' in {}", raw, path.display())))
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(MetricRow {
            psnr: parse(&record, psnr_col)?,
            ssim: parse(&record, ssim_col)?,
            lpips: lpips_col.map(|col| parse(&record, col)).transpose()?,
        });
    }
    Ok(rows)
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub provenance: Option<Provenance>,
    pub frames: usize,
    /// Mean over finite values only.
    pub mean_psnr: Option<f64>,
    pub infinite_psnr: usize,
    pub mean_ssim: Option<f64>,
    pub mean_lpips: Option<f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

pub fn summarize_table(table: &MetricTable) -> RunSummary {
    let infinite_psnr = table.rows.iter().filter(|r| r.psnr.is_infinite()).count();
    RunSummary {
        provenance: table.provenance.clone(),
        frames: table.rows.len(),
        mean_psnr: mean(table.rows.iter().map(|r| r.psnr).filter(|v| v.is_finite())),
        infinite_psnr,
        mean_ssim: mean(table.rows.iter().map(|r| r.ssim)),
        mean_lpips: if table.has_lpips() {
            mean(table.rows.iter().filter_map(|r| r.lpips))
        } else {
            None
        },
    }
}

pub fn write_summary_json(table: &MetricTable, path: &Path) -> Result<RunSummary> {
    let summary = summarize_table(table);
    fs::write(path, serde_json::to_string_pretty(&summary)?)?;
    info!("Wrote summary to {}", path.display());
    Ok(summary)
}

/// Reads every `<pct>p_<strategy>_<method>.csv` in `folder`.
pub fn collect_results(folder: &Path) -> Result<Vec<MetricTable>> {
    let mut found: Vec<(Provenance, PathBuf)> = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        match parse_result_file_name(&name) {
            Some(provenance) => found.push((provenance, path)),
            None if name.ends_with(".csv") => warn!("Ignoring unrecognized results file: {}", name),
            None => debug!("Skipping {}", name),
        }
    }
    found.sort_by(|a, b| compare_provenance(&a.0, &b.0));

    let mut tables = Vec::with_capacity(found.len());
    for (provenance, path) in found {
        let rows = read_csv(&path)?;
        debug!("Read {} rows from {}", rows.len(), path.display());
        tables.push(MetricTable {
            provenance: Some(provenance),
            rows,
        });
    }
    info!("Collected {} result files from {}", tables.len(), folder.display());
    Ok(tables)
}

fn compare_provenance(a: &Provenance, b: &Provenance) -> Ordering {
    a.method
        .cmp(&b.method)
        .then_with(|| a.strategy.cmp(&b.strategy))
        .then_with(|| a.percentage.partial_cmp(&b.percentage).unwrap_or(Ordering::Equal))
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub max: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub method: String,
    pub strategy: String,
    pub percentage: f64,
    pub psnr: Stats,
    pub ssim: Stats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lpips: Option<Stats>,
}

fn stats(mut values: Vec<f64>) -> Option<Stats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mut quantiles_data = CKMS::<f64>::new(0.001);
    for v in &values {
        quantiles_data.insert(*v);
    }
    let percentile = |q: f64| quantiles_data.query(q).map(|(_, v)| v).unwrap_or(f64::NAN);

    Some(Stats {
        count: values.len(),
        mean: values.iter().sum::<f64>() / values.len() as f64,
        min: values[0],
        p25: percentile(0.25),
        median: percentile(0.5),
        p75: percentile(0.75),
        max: values[values.len() - 1],
    })
}

/// Per (method, strategy, percentage) statistics across all collected rows.
pub fn summarize(tables: &[MetricTable]) -> Vec<GroupStats> {
    let mut grouped: Vec<(Provenance, Vec<&MetricRow>)> = Vec::new();
    for table in tables {
        let Some(provenance) = &table.provenance else {
            warn!("Skipping a metric table without provenance");
            continue;
        };
        match grouped.iter_mut().find(|(p, _)| p == provenance) {
            Some((_, rows)) => rows.extend(table.rows.iter()),
            None => grouped.push((provenance.clone(), table.rows.iter().collect())),
        }
    }
    grouped.sort_by(|a, b| compare_provenance(&a.0, &b.0));

    let mut capped = 0usize;
    let mut out = Vec::with_capacity(grouped.len());
    for (provenance, rows) in grouped {
        let psnr_values: Vec<f64> = rows
            .iter()
            .map(|r| {
                if r.psnr.is_infinite() {
                    capped += 1;
                    PSNR_CAP_DB
                } else {
                    r.psnr
                }
            })
            .collect();
        let (Some(psnr), Some(ssim)) = (stats(psnr_values), stats(rows.iter().map(|r| r.ssim).collect())) else {
            warn!("No rows for {}", result_file_stem(&provenance));
            continue;
        };
        let lpips = if rows.iter().all(|r| r.lpips.is_some()) {
            stats(rows.iter().filter_map(|r| r.lpips).collect())
        } else {
            None
        };
        out.push(GroupStats {
            method: provenance.method,
            strategy: provenance.strategy,
            percentage: provenance.percentage,
            psnr,
            ssim,
            lpips,
        });
    }

    if capped > 0 {
        info!("Note: Capped {} infinite PSNR values to {} dB for statistics.", capped, PSNR_CAP_DB);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn provenance(pct: f64, strategy: &str, method: &str) -> Provenance {
        Provenance {
            strategy: strategy.to_string(),
            percentage: pct,
            method: method.to_string(),
        }
    }

    fn row(psnr: f64, ssim: f64, lpips: Option<f64>) -> MetricRow {
        MetricRow { psnr, ssim, lpips }
    }

    #[test]
    fn file_names_round_trip_provenance() {
        let p = provenance(10.0, "open_source", "splatfacto");
        assert_eq!(result_file_stem(&p), "10p_open_source_splatfacto");
        assert_eq!(parse_result_file_name("10p_open_source_splatfacto.csv"), Some(p));
        assert_eq!(
            parse_result_file_name("2.5p_even_nerfacto.csv"),
            Some(provenance(2.5, "even", "nerfacto"))
        );
        assert_eq!(parse_result_file_name("summary.csv"), None);
    }

    #[test]
    fn csv_has_two_decimals_and_optional_lpips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.csv");
        let table = MetricTable {
            provenance: None,
            rows: vec![row(f64::INFINITY, 1.0, None), row(31.23456, 0.876, None)],
        };
        write_csv(&table, &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "PSNR,SSIM\ninf,1.00\n31.23,0.88\n");

        let with_lpips = MetricTable {
            provenance: None,
            rows: vec![row(20.0, 0.5, Some(0.1234))],
        };
        write_csv(&with_lpips, &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "PSNR,SSIM,LPIPS\n20.00,0.50,0.12\n");

        let rows = read_csv(&path).unwrap();
        assert_eq!(rows, vec![row(20.0, 0.5, Some(0.12))]);
    }

    #[test]
    fn summary_skips_infinite_psnr_in_mean() {
        let table = MetricTable {
            provenance: Some(provenance(50.0, "even", "nerfacto")),
            rows: vec![row(f64::INFINITY, 1.0, None), row(30.0, 0.8, None), row(20.0, 0.6, None)],
        };
        let summary = summarize_table(&table);
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.infinite_psnr, 1);
        assert_eq!(summary.mean_psnr, Some(25.0));
        assert!((summary.mean_ssim.unwrap() - 0.8).abs() < 1e-12);
        assert_eq!(summary.mean_lpips, None);
    }

    #[test]
    fn collects_and_groups_result_files() {
        let dir = tempdir().unwrap();
        let write = |p: Provenance, rows: Vec<MetricRow>| {
            let path = dir.path().join(format!("{}.csv", result_file_stem(&p)));
            write_csv(&MetricTable { provenance: Some(p), rows }, &path).unwrap();
        };
        write(
            provenance(50.0, "random", "nerfacto"),
            (1..=5).map(|i| row(20.0 + i as f64, 0.5, None)).collect(),
        );
        write(provenance(10.0, "random", "nerfacto"), vec![row(f64::INFINITY, 1.0, None)]);
        write(provenance(10.0, "even", "nerfacto"), vec![row(15.0, 0.4, None)]);
        fs::write(dir.path().join("notes.csv"), "x\n1\n").unwrap();

        let tables = collect_results(dir.path()).unwrap();
        let order: Vec<_> = tables
            .iter()
            .map(|t| result_file_stem(t.provenance.as_ref().unwrap()))
            .collect();
        assert_eq!(order, vec!["10p_even_nerfacto", "10p_random_nerfacto", "50p_random_nerfacto"]);

        let groups = summarize(&tables);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].psnr.max, PSNR_CAP_DB);
        let g = &groups[2];
        assert_eq!(g.psnr.count, 5);
        assert_eq!((g.psnr.min, g.psnr.max, g.psnr.mean), (21.0, 25.0, 23.0));
        assert!(g.psnr.min <= g.psnr.p25 && g.psnr.p25 <= g.psnr.median);
        assert!(g.psnr.median <= g.psnr.p75 && g.psnr.p75 <= g.psnr.max);
        assert!(g.lpips.is_none());
    }
}
