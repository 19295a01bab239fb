//! SVG diagnostic plots: p-value histogram and QQ scatter.

use std::path::Path;

use svg::node::element::{Circle, Line, Rectangle, Text};
use svg::Document;

use crate::error::{PhylopermError, Result};
use crate::report::QqRow;

const WIDTH: f64 = 620.0;
const HEIGHT: f64 = 440.0;
const MARGIN_LEFT: f64 = 70.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_TOP: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 60.0;

const BAR_FILL: &str = "#3A78C2";
const POINT_FILL: &str = "#2F7D4A";

fn plot_area() -> (f64, f64, f64, f64) {
    (
        MARGIN_LEFT,
        MARGIN_TOP,
        WIDTH - MARGIN_RIGHT,
        HEIGHT - MARGIN_BOTTOM,
    )
}

fn axis_label(x: f64, y: f64, text: &str, anchor: &str) -> Text {
    Text::new(text)
        .set("x", x)
        .set("y", y)
        .set("font-size", 13)
        .set("font-family", "sans-serif")
        .set("text-anchor", anchor)
}

fn frame(document: Document, title: &str) -> Document {
    let (left, top, right, bottom) = plot_area();
    document
        .add(
            Rectangle::new()
                .set("x", left)
                .set("y", top)
                .set("width", right - left)
                .set("height", bottom - top)
                .set("fill", "none")
                .set("stroke", "black")
                .set("stroke-width", 1),
        )
        .add(axis_label((left + right) / 2.0, MARGIN_TOP - 14.0, title, "middle"))
}

fn save(path: &Path, document: &Document) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| PhylopermError::io(path, e))?;
        }
    }
    std::fs::write(path, document.to_string()).map_err(|e| PhylopermError::io(path, e))
}

/// Render the p-value histogram as an SVG bar chart.
pub fn write_pvalue_hist_svg(path: &Path, bins: &[(f64, f64, usize)]) -> Result<()> {
    let (left, top, right, bottom) = plot_area();
    let max_count = bins.iter().map(|b| b.2).max().unwrap_or(1).max(1) as f64;

    let mut document = Document::new()
        .set("viewBox", (0, 0, WIDTH, HEIGHT))
        .set("width", WIDTH)
        .set("height", HEIGHT);
    document = frame(document, "p-value histogram");

    for &(start, end, count) in bins {
        let x0 = left + start * (right - left);
        let x1 = left + end * (right - left);
        let h = (count as f64 / max_count) * (bottom - top);
        document = document.add(
            Rectangle::new()
                .set("x", x0)
                .set("y", bottom - h)
                .set("width", (x1 - x0).max(0.0))
                .set("height", h)
                .set("fill", BAR_FILL)
                .set("stroke", "black")
                .set("stroke-width", 0.5),
        );
    }

    for tick in [0.0, 0.25, 0.5, 0.75, 1.0] {
        let x = left + tick * (right - left);
        document = document
            .add(
                Line::new()
                    .set("x1", x)
                    .set("y1", bottom)
                    .set("x2", x)
                    .set("y2", bottom + 5.0)
                    .set("stroke", "black"),
            )
            .add(axis_label(x, bottom + 20.0, &format!("{tick}"), "middle"));
    }
    document = document
        .add(axis_label(
            (left + right) / 2.0,
            HEIGHT - 16.0,
            "Empirical p-value",
            "middle",
        ))
        .add(axis_label(left - 10.0, top + 12.0, &format!("{}", max_count as usize), "end"))
        .add(axis_label(left - 10.0, bottom, "0", "end"));

    save(path, &document)
}

/// Render the QQ table as an SVG scatter in -log10 space.
pub fn write_qq_svg(path: &Path, rows: &[QqRow]) -> Result<()> {
    let (left, top, right, bottom) = plot_area();
    let lim = rows
        .iter()
        .flat_map(|r| [r.minus_log10_observed, r.minus_log10_expected])
        .fold(1.0f64, f64::max);

    let to_x = |v: f64| left + (v / lim) * (right - left);
    let to_y = |v: f64| bottom - (v / lim) * (bottom - top);

    let mut document = Document::new()
        .set("viewBox", (0, 0, WIDTH, HEIGHT))
        .set("width", WIDTH)
        .set("height", HEIGHT);
    document = frame(document, "QQ plot");

    // Identity line.
    document = document.add(
        Line::new()
            .set("x1", to_x(0.0))
            .set("y1", to_y(0.0))
            .set("x2", to_x(lim))
            .set("y2", to_y(lim))
            .set("stroke", "black")
            .set("stroke-width", 1),
    );

    for row in rows {
        document = document.add(
            Circle::new()
                .set("cx", to_x(row.minus_log10_expected))
                .set("cy", to_y(row.minus_log10_observed))
                .set("r", 2.5)
                .set("fill", POINT_FILL)
                .set("fill-opacity", 0.8),
        );
    }

    document = document
        .add(axis_label(
            (left + right) / 2.0,
            HEIGHT - 16.0,
            "Expected -log10(p)",
            "middle",
        ))
        .add(axis_label(left - 10.0, top + 12.0, &format!("{lim:.1}"), "end"))
        .add(axis_label(left - 10.0, bottom, "0", "end"));

    save(path, &document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::qq_rows;

    #[test]
    fn test_histogram_svg_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hist.svg");
        let bins = vec![(0.0, 0.5, 3usize), (0.5, 1.0, 1usize)];
        write_pvalue_hist_svg(&path, &bins).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("<svg"));
        assert!(text.contains("rect"));
    }

    #[test]
    fn test_qq_svg_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qq.svg");
        let rows = qq_rows(&[0.01, 0.2, 0.5, 0.9]);
        write_qq_svg(&path, &rows).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("circle"));
    }
}
