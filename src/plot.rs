// src/plot.rs

use crate::error::{KfevalError, Result};
use crate::report::{GroupStats, MetricKind};
use log::{info, warn};
use plotters::prelude::*;
use std::path::Path;

/// Median of `metric` against the percentage of frames kept, one series per
/// selection strategy, with the interquartile range as error bars.
pub fn plot_metric(groups: &[GroupStats], metric: MetricKind, method: &str, output_path: &Path) -> Result<()> {
    info!("Generating {} plot for {}: {}", metric.label(), method, output_path.display());

    // --- 1. Extract and Prepare Data ---
    let mut strategies: Vec<&str> = Vec::new();
    let mut points: Vec<(&str, f64, f64, f64, f64)> = Vec::new(); // (strategy, pct, p25, median, p75)
    for group in groups.iter().filter(|g| g.method == method) {
        let Some(stats) = metric.stats(group) else {
            continue;
        };
        if !strategies.contains(&group.strategy.as_str()) {
            strategies.push(group.strategy.as_str());
        }
        points.push((group.strategy.as_str(), group.percentage, stats.p25, stats.median, stats.p75));
    }

    if points.is_empty() {
        warn!("No {} statistics to plot for {}", metric.label(), method);
        return Err(KfevalError::Plot(format!("No {} statistics for {}", metric.label(), method)));
    }

    let x_min = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let x_max = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    let y_min = points.iter().map(|p| p.2).fold(f64::INFINITY, f64::min);
    let y_max = points.iter().map(|p| p.4).fold(f64::NEG_INFINITY, f64::max);
    let x_pad = ((x_max - x_min) * 0.05).max(1.0);
    let y_pad = ((y_max - y_min) * 0.1).max(0.01);

    // --- 2. Setup Plot ---
    let root = BitMapBackend::new(output_path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| KfevalError::Plot(format!("Failed to fill plot background: {}", e)))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("{} vs Percentage of Frames Remaining ({})", metric.label(), method),
            ("sans-serif", 24).into_font(),
        )
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d((x_min - x_pad)..(x_max + x_pad), (y_min - y_pad)..(y_max + y_pad))
        .map_err(|e| KfevalError::Plot(format!("Failed to build chart: {}", e)))?;

    // --- 3. Configure Mesh ---
    let y_label_format = |y: &f64| format!("{:.2}", y);
    chart
        .configure_mesh()
        .x_desc("Percentage of Frames Remaining")
        .y_desc(format!("{}{}", metric.label(), metric.unit()))
        .y_label_formatter(&y_label_format)
        .axis_desc_style(("sans-serif", 16))
        .label_style(("sans-serif", 14))
        .draw()
        .map_err(|e| KfevalError::Plot(format!("Failed to draw mesh: {:?}", e)))?;

    // --- 4. Draw One Series Per Strategy ---
    for (i, strategy) in strategies.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        let mut series: Vec<_> = points.iter().filter(|p| p.0 == *strategy).collect();
        series.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        chart
            .draw_series(LineSeries::new(
                series.iter().map(|p| (p.1, p.3)),
                color.stroke_width(2),
            ))
            .map_err(|e| KfevalError::Plot(format!("Failed to draw {} series: {:?}", strategy, e)))?
            .label(strategy.to_string())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));

        chart
            .draw_series(
                series
                    .iter()
                    .map(|p| ErrorBar::new_vertical(p.1, p.2, p.3, p.4, color.filled(), 10)),
            )
            .map_err(|e| KfevalError::Plot(format!("Failed to draw {} error bars: {:?}", strategy, e)))?;
    }

    // --- 5. Configure Legend ---
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerRight)
        .margin(10)
        .label_font(("sans-serif", 14))
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| KfevalError::Plot(format!("Failed to draw legend: {:?}", e)))?;

    // --- 6. Finalize ---
    root.present()
        .map_err(|e| KfevalError::Plot(format!("Failed to save plot: {:?}", e)))?;
    info!("Successfully generated {} plot: {}", metric.label(), output_path.display());

    Ok(())
}
