use textplots::{Chart, Plot, Shape};

use crate::acquisition::ScanImage;
use crate::error::GalvoError;

/// Characters from dark to bright
const SHADES: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];

/// Determine the best scale and unit prefix for a given maximum value
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1.0 {
        (1.0, "")
    } else if max_value >= 1e-3 {
        (1e3, "m")
    } else {
        (1e6, "μ")
    }
}

/// Render the image as shaded text, +y at the top
///
/// Images wider than `max_width` columns are subsampled.
pub fn render_heatmap(image: &ScanImage, max_width: usize) -> String {
    let (rows, columns) = (image.rows(), image.columns());
    if rows == 0 || columns == 0 {
        return "(empty image)\n".to_string();
    }

    let stats = image.stats();
    let span = stats.max - stats.min;
    let stride = columns.div_ceil(max_width.max(1));
    let last_shade = (SHADES.len() - 1) as f64;

    let mut out = String::new();
    out.push_str(&format!(
        "y {:+.4} V, counts {} to {}\n",
        image.extent[3], stats.min, stats.max
    ));
    for row in (0..rows).rev().step_by(stride) {
        for column in (0..columns).step_by(stride) {
            let value = image.data[[row, column]];
            let level = if span > 0.0 {
                ((value - stats.min) / span * last_shade).round() as usize
            } else {
                0
            };
            out.push(SHADES[level.min(SHADES.len() - 1)]);
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "y {:+.4} V, x {:+.4} to {:+.4} V\n",
        image.extent[2], image.extent[0], image.extent[1]
    ));
    out
}

/// Line plot of one image row against the x voltage
pub fn plot_row_profile(
    image: &ScanImage,
    row: usize,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<(), GalvoError> {
    if row >= image.rows() || image.columns() < 2 {
        return Err(GalvoError::InvalidConfig(format!(
            "no row {row} to plot in a {} x {} image",
            image.columns(),
            image.rows()
        )));
    }

    let [x_min, x_max, _, _] = image.extent;
    let (scale, unit) = determine_scale(x_max.abs().max(x_min.abs()));
    let step = (x_max - x_min) / (image.columns() - 1) as f64;

    let frame: Vec<(f32, f32)> = image
        .data
        .row(row)
        .iter()
        .enumerate()
        .map(|(column, &count)| (((x_min + column as f64 * step) * scale) as f32, count as f32))
        .collect();

    println!("Row {row} profile | x in {unit}V | counts per pixel");
    Chart::new(
        width.unwrap_or(140),
        height.unwrap_or(40),
        (x_min * scale) as f32,
        (x_max * scale) as f32,
    )
    .lineplot(&Shape::Lines(&frame))
    .nice();
    Ok(())
}

/// Row holding the brightest pixel
pub fn brightest_row(image: &ScanImage) -> Option<usize> {
    image
        .data
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|((row, _), _)| row)
}
