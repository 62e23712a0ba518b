//! SVG chart rendering for training curves.
//!
//! Hand-rolled SVG keeps the chart output dependency-free; the files land
//! in the run directory and can be dropped straight into a report.

use std::fs;
use std::path::Path;

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 500.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 70.0;
const MARGIN_LEFT: f64 = 80.0;

const SERIES_COLORS: [&str; 4] = ["#3498db", "#2ecc71", "#e74c3c", "#9b59b6"];
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

/// A named data series; x is the epoch index.
#[derive(Debug, Clone, Default)]
pub struct Series {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

impl Series {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: Vec::new(),
        }
    }

    pub fn push(&mut self, x: f64, y: f64) {
        self.points.push((x, y));
    }
}

/// Pick a color for the n-th series.
pub fn series_color(index: usize) -> &'static str {
    SERIES_COLORS[index % SERIES_COLORS.len()]
}

/// Render a line chart of the given series to `output_path`.
///
/// The y range is data-driven with a small pad; the x range spans the
/// union of all series.
pub fn write_line_chart(
    title: &str,
    x_label: &str,
    y_label: &str,
    series: &[Series],
    output_path: &Path,
) -> std::io::Result<()> {
    let plot_width = CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

    let points = series.iter().flat_map(|s| s.points.iter());
    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    for &(x, y) in points {
        x_min = x_min.min(x);
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    }
    if !x_min.is_finite() {
        // No data yet; render an empty frame.
        x_min = 0.0;
        x_max = 1.0;
        y_min = 0.0;
        y_max = 1.0;
    }
    if (x_max - x_min).abs() < f64::EPSILON {
        x_max = x_min + 1.0;
    }
    let pad = ((y_max - y_min) * 0.05).max(1e-6);
    y_min -= pad;
    y_max += pad;

    let x_pos = |x: f64| MARGIN_LEFT + ((x - x_min) / (x_max - x_min)) * plot_width;
    let y_pos = |y: f64| MARGIN_TOP + plot_height - ((y - y_min) / (y_max - y_min)) * plot_height;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {CHART_WIDTH} {CHART_HEIGHT}" width="{CHART_WIDTH}" height="{CHART_HEIGHT}">"#
    ));
    svg.push_str(&format!(
        r#"<rect width="{CHART_WIDTH}" height="{CHART_HEIGHT}" fill="white"/>"#
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{COLOR_TEXT}">{}</text>"#,
        CHART_WIDTH / 2.0,
        escape_xml(title)
    ));

    // Horizontal grid and y labels
    for i in 0..=5 {
        let fraction = i as f64 / 5.0;
        let y = MARGIN_TOP + plot_height - fraction * plot_height;
        let value = y_min + fraction * (y_max - y_min);
        svg.push_str(&format!(
            r#"<line x1="{MARGIN_LEFT}" y1="{y}" x2="{}" y2="{y}" stroke="{COLOR_GRID}" stroke-width="1"/>"#,
            MARGIN_LEFT + plot_width
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{COLOR_TEXT}">{value:.3}</text>"#,
            MARGIN_LEFT - 10.0,
            y + 4.0
        ));
    }

    // Axes
    svg.push_str(&format!(
        r#"<line x1="{MARGIN_LEFT}" y1="{}" x2="{}" y2="{}" stroke="{COLOR_AXIS}" stroke-width="2"/>"#,
        MARGIN_TOP + plot_height,
        MARGIN_LEFT + plot_width,
        MARGIN_TOP + plot_height
    ));
    svg.push_str(&format!(
        r#"<line x1="{MARGIN_LEFT}" y1="{MARGIN_TOP}" x2="{MARGIN_LEFT}" y2="{}" stroke="{COLOR_AXIS}" stroke-width="2"/>"#,
        MARGIN_TOP + plot_height
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{COLOR_TEXT}">{}</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        CHART_HEIGHT - 20.0,
        escape_xml(x_label)
    ));
    svg.push_str(&format!(
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{COLOR_TEXT}" transform="rotate(-90 20 {})">{}</text>"#,
        CHART_HEIGHT / 2.0,
        CHART_HEIGHT / 2.0,
        escape_xml(y_label)
    ));

    // X ticks: at most ten, integer epochs
    let tick_count = ((x_max - x_min) as usize).min(10).max(1);
    for i in 0..=tick_count {
        let x_value = x_min + (x_max - x_min) * i as f64 / tick_count as f64;
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="11" fill="{COLOR_TEXT}">{x_value:.0}</text>"#,
            x_pos(x_value),
            MARGIN_TOP + plot_height + 20.0
        ));
    }

    for (index, s) in series.iter().enumerate() {
        if s.points.is_empty() {
            continue;
        }
        let color = series_color(index);
        let mut path = String::new();
        for (i, &(x, y)) in s.points.iter().enumerate() {
            let command = if i == 0 { "M" } else { " L" };
            path.push_str(&format!("{command} {} {}", x_pos(x), y_pos(y)));
        }
        svg.push_str(&format!(
            r#"<path d="{path}" fill="none" stroke="{color}" stroke-width="2"/>"#
        ));
    }

    // Legend
    let mut legend_y = MARGIN_TOP + 10.0;
    for (index, s) in series.iter().enumerate() {
        let color = series_color(index);
        svg.push_str(&format!(
            r#"<rect x="{}" y="{legend_y}" width="15" height="15" fill="{color}"/>"#,
            CHART_WIDTH - MARGIN_RIGHT - 150.0
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="12" fill="{COLOR_TEXT}">{}</text>"#,
            CHART_WIDTH - MARGIN_RIGHT - 130.0,
            legend_y + 12.0,
            escape_xml(&s.name)
        ));
        legend_y += 25.0;
    }

    svg.push_str("</svg>");
    fs::write(output_path, svg)
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
