//! Radio tomographic imaging: reconstructs a 2D excess-attenuation field
//! from confidence-weighted link measurements via ridge regression.

use nalgebra::{DMatrix, DVector};

/// Default grid cell size in meters.
pub const DEFAULT_RESOLUTION_M: f64 = 0.5;
/// Default Gaussian kernel influence radius in meters.
pub const DEFAULT_INFLUENCE_RADIUS_M: f64 = 0.5;

/// A single link's excess attenuation relative to a free-space path-loss
/// model, used as one row of the tomography system.
#[derive(Debug, Clone, Copy)]
pub struct LinkMeasurement {
    pub p1: (f64, f64),
    pub p2: (f64, f64),
    pub excess_attenuation: f64,
    pub confidence: f64,
}

/// Shortest distance from `(px, py)` to the segment `(x1, y1) -> (x2, y2)`.
fn point_to_segment_distance(px: f64, py: f64, x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    let dx = x2 - x1;
    let dy = y2 - y1;
    let seg_len_sq = dx * dx + dy * dy;
    if seg_len_sq <= 0.0 {
        return (px - x1).hypot(py - y1);
    }
    let t = (((px - x1) * dx + (py - y1) * dy) / seg_len_sq).clamp(0.0, 1.0);
    let proj_x = x1 + t * dx;
    let proj_y = y1 + t * dy;
    (px - proj_x).hypot(py - proj_y)
}

/// Adaptive ridge regularizer: grows with the row-weighted system's
/// condition number and with how underdetermined the system is.
fn adaptive_alpha(ata_reg: &DMatrix<f64>, n_rows: usize, n_cells: usize) -> f64 {
    let cond = ata_reg
        .clone()
        .svd(false, false)
        .singular_values
        .iter()
        .copied()
        .fold((f64::INFINITY, 0.0_f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let (min_sv, max_sv) = cond;
    let condition_number = if min_sv > 1e-12 { max_sv / min_sv } else { 1e8 };
    let condition_number = if condition_number.is_finite() { condition_number } else { 1e8 };
    let sample_ratio = n_cells as f64 / n_rows.max(1) as f64;
    let alpha = 0.05 * sample_ratio * (1.0 + condition_number.max(1.0).log10());
    alpha.clamp(0.05, 5.0)
}

/// Reconstructs an `n_rows x n_cols` attenuation grid (row-major,
/// `grid[row][col]`) from `links` over `bounds = (x_min, y_min, x_max,
/// y_max)`. Returns an empty grid when the bounds or resolution are
/// degenerate.
#[must_use]
pub fn reconstruct(
    links: &[LinkMeasurement],
    bounds: (f64, f64, f64, f64),
    resolution: f64,
    influence_radius: f64,
) -> Vec<Vec<f64>> {
    let (x_min, y_min, x_max, y_max) = bounds;
    if x_max <= x_min || y_max <= y_min || resolution <= 0.0 {
        return vec![vec![]];
    }

    let n_cols = (((x_max - x_min) / resolution).ceil() as usize).max(1);
    let n_rows = (((y_max - y_min) / resolution).ceil() as usize).max(1);
    let n_cells = n_rows * n_cols;

    if links.is_empty() {
        return vec![vec![0.0; n_cols]; n_rows];
    }

    let xs: Vec<f64> = (0..n_cols).map(|c| x_min + (c as f64 + 0.5) * resolution).collect();
    let ys: Vec<f64> = (0..n_rows).map(|r| y_min + (r as f64 + 0.5) * resolution).collect();
    let cell_coords: Vec<(f64, f64)> = ys
        .iter()
        .flat_map(|&cy| xs.iter().map(move |&cx| (cy, cx)))
        .collect();

    let kernel_sigma = (influence_radius / 2.0).max(1e-3);
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut targets: Vec<f64> = Vec::new();
    let mut row_weights: Vec<f64> = Vec::new();

    for link in links {
        let (x1, y1) = link.p1;
        let (x2, y2) = link.p2;
        let lx_min = x1.min(x2) - influence_radius;
        let lx_max = x1.max(x2) + influence_radius;
        let ly_min = y1.min(y2) - influence_radius;
        let ly_max = y1.max(y2) + influence_radius;

        let mut row = vec![0.0f64; n_cells];
        for (idx, &(cy, cx)) in cell_coords.iter().enumerate() {
            if !(lx_min <= cx && cx <= lx_max && ly_min <= cy && cy <= ly_max) {
                continue;
            }
            let dist = point_to_segment_distance(cx, cy, x1, y1, x2, y2);
            if dist > influence_radius {
                continue;
            }
            row[idx] = (-(dist * dist) / (2.0 * kernel_sigma * kernel_sigma)).exp();
        }

        let row_sum: f64 = row.iter().sum();
        if row_sum <= 1e-6 {
            continue;
        }
        for v in &mut row {
            *v /= row_sum;
        }
        rows.push(row);
        targets.push(link.excess_attenuation);
        let c = link.confidence.clamp(0.01, 0.99);
        row_weights.push(c / (1.0 - c));
    }

    if rows.is_empty() {
        return vec![vec![0.0; n_cols]; n_rows];
    }

    let n_rows_sys = rows.len();
    let a = DMatrix::from_row_iterator(n_rows_sys, n_cells, rows.into_iter().flatten());
    let b = DVector::from_vec(targets);
    let w = DVector::from_vec(row_weights);

    let sqrt_w = w.map(f64::sqrt);
    let weighted_a = DMatrix::from_fn(n_rows_sys, n_cells, |r, c| a[(r, c)] * sqrt_w[r]);
    let weighted_b = DVector::from_fn(n_rows_sys, |r, _| b[r] * sqrt_w[r]);

    let ata = weighted_a.transpose() * &weighted_a;
    let atb = weighted_a.transpose() * &weighted_b;
    let identity = DMatrix::identity(n_cells, n_cells);
    let alpha = adaptive_alpha(&(ata.clone() + identity.clone() * 1e-6), n_rows_sys, n_cells);

    let lhs = ata + identity * alpha;
    let x = lhs
        .clone()
        .lu()
        .solve(&atb)
        .unwrap_or_else(|| {
            weighted_a
                .clone()
                .svd(true, true)
                .solve(&weighted_b, 1e-9)
                .unwrap_or_else(|_| DVector::zeros(n_cells))
        });

    let mut grid = vec![vec![0.0f64; n_cols]; n_rows];
    for r in 0..n_rows {
        for c in 0..n_cols {
            let value = x[r * n_cols + c];
            grid[r][c] = if value > 0.0 { value } else { 0.0 };
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_links_produce_a_zero_grid() {
        let grid = reconstruct(&[], (-1.0, -1.0, 4.0, 4.0), 0.5, 0.5);
        assert!(grid.iter().flatten().all(|&v| v == 0.0));
    }

    #[test]
    fn degenerate_bounds_produce_an_empty_grid() {
        let grid = reconstruct(&[], (0.0, 0.0, 0.0, 5.0), 0.5, 0.5);
        assert_eq!(grid, vec![vec![]]);
    }

    #[test]
    fn recovers_an_obstructed_region_between_three_nodes() {
        let links = [
            LinkMeasurement { p1: (0.0, 0.0), p2: (3.0, 0.0), excess_attenuation: 6.0, confidence: 1.0 },
            LinkMeasurement { p1: (0.0, 0.0), p2: (0.0, 3.0), excess_attenuation: 4.0, confidence: 1.0 },
            LinkMeasurement { p1: (3.0, 0.0), p2: (0.0, 3.0), excess_attenuation: 5.0, confidence: 1.0 },
        ];
        let grid = reconstruct(&links, (-1.0, -1.0, 4.0, 4.0), 0.5, 0.5);
        let max_value = grid.iter().flatten().cloned().fold(0.0_f64, f64::max);
        assert!(max_value > 0.0, "expected a reconstructed attenuation signal");
    }

    #[test]
    fn point_to_segment_distance_handles_a_degenerate_point_segment() {
        assert_eq!(point_to_segment_distance(1.0, 1.0, 0.0, 0.0, 0.0, 0.0), 2.0_f64.sqrt());
    }
}
