//! Device positioning from anchor/distance observations via robust
//! trilateration: a RANSAC-style search over candidate anchor subsets, each
//! refined by iteratively reweighted Gauss-Newton with a Tukey biweight.

/// Maximum Gauss-Newton iterations per candidate refinement.
pub const MAX_GN_ITERATIONS: u32 = 12;
/// Gauss-Newton convergence tolerance on the step norm.
pub const GN_TOLERANCE: f64 = 1e-4;
/// Tikhonov regularizer added to the normal equations.
pub const TIKHONOV_LAMBDA: f64 = 1e-6;
/// Tukey biweight cutoff, expressed as a multiple of the per-range sigma.
pub const TUKEY_CUTOFF_SIGMAS: f64 = 2.5;
/// RMSE above which a refit is rejected outright.
pub const MAX_ACCEPTABLE_RMSE_M: f64 = 8.0;
/// Subsets of size 3 are only exhaustively enumerated below this many
/// observations; above it only the full set and leave-one-out sets are
/// tried, to keep the candidate count bounded.
const EXHAUSTIVE_SUBSET_LIMIT: usize = 6;

/// Range-dependent measurement sigma: longer ranges are noisier.
fn range_sigma(distance: f64) -> f64 {
    (0.08 * distance + 0.2).max(0.35)
}

/// Tukey biweight for a residual given its sigma; zero beyond the cutoff.
fn tukey_weight(residual: f64, sigma: f64) -> f64 {
    let cutoff = TUKEY_CUTOFF_SIGMAS * sigma;
    let u = residual / cutoff;
    if u.abs() >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u;
        t * t
    }
}

/// Solves a symmetric 2x2 linear system `[[a, b], [b, d]] * x = [e, f]` via
/// Cramer's rule, returning `None` on a (near-)singular matrix.
fn solve_2x2(a: f64, b: f64, d: f64, e: f64, f: f64) -> Option<(f64, f64)> {
    let det = a * d - b * b;
    if det.abs() < 1e-12 {
        return None;
    }
    Some(((e * d - f * b) / det, (a * f - b * e) / det))
}

/// Linearized least-squares seed: subtract the first circle equation from
/// every other one, producing a linear system in (x, y).
fn linearized_seed(observations: &[((f64, f64), f64)]) -> Option<(f64, f64)> {
    if observations.len() < 2 {
        return None;
    }
    let ((x0, y0), d0) = observations[0];
    let n = observations.len() - 1;
    let mut ata = [[0.0f64; 2]; 2];
    let mut atb = [0.0f64; 2];
    for &((xi, yi), di) in &observations[1..] {
        let ai0 = 2.0 * (x0 - xi);
        let ai1 = 2.0 * (y0 - yi);
        let bi = di * di - d0 * d0 - xi * xi + x0 * x0 - yi * yi + y0 * y0;
        ata[0][0] += ai0 * ai0;
        ata[0][1] += ai0 * ai1;
        ata[1][1] += ai1 * ai1;
        atb[0] += ai0 * bi;
        atb[1] += ai1 * bi;
    }
    if n == 0 {
        return None;
    }
    solve_2x2(ata[0][0], ata[0][1], ata[1][1], atb[0], atb[1])
}

fn centroid_seed(observations: &[((f64, f64), f64)]) -> (f64, f64) {
    let n = observations.len() as f64;
    let (sx, sy) = observations
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &((x, y), _)| (sx + x, sy + y));
    (sx / n, sy / n)
}

/// One iteratively reweighted Gauss-Newton refinement from `seed`, using
/// only `subset` (indices into `observations`).
fn refine(observations: &[((f64, f64), f64)], subset: &[usize], seed: (f64, f64)) -> (f64, f64) {
    let (mut x, mut y) = seed;
    for _ in 0..MAX_GN_ITERATIONS {
        let mut jtj = [[0.0f64; 2]; 2];
        let mut jtr = [0.0f64; 2];
        for &idx in subset {
            let ((xi, yi), di) = observations[idx];
            let dx = x - xi;
            let dy = y - yi;
            let pred = (dx * dx + dy * dy).sqrt().max(1e-9);
            let residual = pred - di;
            let sigma = range_sigma(di);
            let weight = tukey_weight(residual, sigma) / (sigma * sigma);
            let jx = dx / pred;
            let jy = dy / pred;
            jtj[0][0] += weight * jx * jx;
            jtj[0][1] += weight * jx * jy;
            jtj[1][1] += weight * jy * jy;
            jtr[0] += weight * jx * residual;
            jtr[1] += weight * jy * residual;
        }
        let Some((dx, dy)) = solve_2x2(
            jtj[0][0] + TIKHONOV_LAMBDA,
            jtj[0][1],
            jtj[1][1] + TIKHONOV_LAMBDA,
            -jtr[0],
            -jtr[1],
        ) else {
            break;
        };
        x += dx;
        y += dy;
        if (dx * dx + dy * dy).sqrt() < GN_TOLERANCE {
            break;
        }
    }
    (x, y)
}

/// Every index subset a candidate is refined over: the full set, every
/// leave-one-out set, and (for small inputs) every 3-subset.
fn candidate_subsets(n: usize) -> Vec<Vec<usize>> {
    let mut subsets = Vec::new();
    subsets.push((0..n).collect::<Vec<_>>());
    for skip in 0..n {
        let loo: Vec<usize> = (0..n).filter(|&i| i != skip).collect();
        if loo.len() >= 3 {
            subsets.push(loo);
        }
    }
    if n <= EXHAUSTIVE_SUBSET_LIMIT {
        for i in 0..n {
            for j in (i + 1)..n {
                for k in (j + 1)..n {
                    subsets.push(vec![i, j, k]);
                }
            }
        }
    }
    subsets
}

struct Scored {
    position: (f64, f64),
    inliers: Vec<usize>,
    inlier_count: usize,
    mean_clipped_residual: f64,
}

/// Scores `position` against every observation: inlier count at the Tukey
/// cutoff, and the mean squared normalized residual clipped at the cutoff.
fn score(observations: &[((f64, f64), f64)], position: (f64, f64)) -> (Vec<usize>, usize, f64) {
    let (x, y) = position;
    let mut inliers = Vec::new();
    let mut clipped_sum = 0.0;
    let cutoff_sq = TUKEY_CUTOFF_SIGMAS * TUKEY_CUTOFF_SIGMAS;
    for (idx, &((xi, yi), di)) in observations.iter().enumerate() {
        let pred = ((x - xi).powi(2) + (y - yi).powi(2)).sqrt();
        let residual = pred - di;
        let sigma = range_sigma(di);
        let normalized_sq = (residual / sigma).powi(2);
        if normalized_sq.sqrt() < TUKEY_CUTOFF_SIGMAS {
            inliers.push(idx);
        }
        clipped_sum += normalized_sq.min(cutoff_sq);
    }
    let mean_clipped = clipped_sum / observations.len() as f64;
    let inlier_count = inliers.len();
    (inliers, inlier_count, mean_clipped)
}

/// Weighted RMSE of `position` against `indices`, using the same range
/// sigma as the Tukey weighting.
fn weighted_rmse(observations: &[((f64, f64), f64)], indices: &[usize], position: (f64, f64)) -> f64 {
    let (x, y) = position;
    let mut weight_sum = 0.0;
    let mut weighted_sq_sum = 0.0;
    for &idx in indices {
        let ((xi, yi), di) = observations[idx];
        let pred = ((x - xi).powi(2) + (y - yi).powi(2)).sqrt();
        let residual = pred - di;
        let sigma = range_sigma(di);
        let weight = 1.0 / (sigma * sigma);
        weight_sum += weight;
        weighted_sq_sum += weight * residual * residual;
    }
    if weight_sum <= 0.0 {
        return f64::INFINITY;
    }
    (weighted_sq_sum / weight_sum).sqrt()
}

/// Estimates a device's position from `observations` (anchor position,
/// estimated distance) pairs. Returns `None` when there are fewer than 3
/// observations, all candidates are degenerate, or the best refit's RMSE
/// exceeds [`MAX_ACCEPTABLE_RMSE_M`].
#[must_use]
pub fn trilaterate(observations: &[((f64, f64), f64)]) -> Option<((f64, f64), f64)> {
    if observations.len() < 3 {
        return None;
    }

    let mut best: Option<Scored> = None;
    for subset in candidate_subsets(observations.len()) {
        let subset_obs: Vec<((f64, f64), f64)> = subset.iter().map(|&i| observations[i]).collect();
        let mut seeds = Vec::new();
        if let Some(seed) = linearized_seed(&subset_obs) {
            seeds.push(seed);
        }
        seeds.push(centroid_seed(&subset_obs));

        for seed in seeds {
            let position = refine(observations, &subset, seed);
            if !position.0.is_finite() || !position.1.is_finite() {
                continue;
            }
            let (inliers, inlier_count, mean_clipped_residual) = score(observations, position);
            let candidate = Scored {
                position,
                inliers,
                inlier_count,
                mean_clipped_residual,
            };
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if (candidate.inlier_count, -candidate.mean_clipped_residual)
                        > (current.inlier_count, -current.mean_clipped_residual)
                    {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
    }

    let best = best?;
    let inlier_indices = if best.inliers.len() >= 3 {
        best.inliers
    } else {
        (0..observations.len()).collect()
    };
    let refit_position = refine(observations, &inlier_indices, best.position);
    if !refit_position.0.is_finite() || !refit_position.1.is_finite() {
        return None;
    }
    let rmse = weighted_rmse(observations, &inlier_indices, refit_position);
    if !rmse.is_finite() || rmse > MAX_ACCEPTABLE_RMSE_M {
        return None;
    }
    Some((refit_position, rmse))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_nothing_with_fewer_than_three_observations() {
        assert!(trilaterate(&[((0.0, 0.0), 1.0), ((1.0, 0.0), 1.0)]).is_none());
    }

    #[test]
    fn recovers_position_from_four_anchors_with_one_outlier() {
        let observations = [
            ((0.0, 0.0), 2.0_f64.sqrt()),
            ((4.0, 0.0), 10.0_f64.sqrt()),
            ((0.0, 4.0), 10.0_f64.sqrt()),
            ((4.0, 4.0), 8.0),
        ];
        let (position, uncertainty) = trilaterate(&observations).expect("should resolve a position");
        let dx = position.0 - 1.0;
        let dy = position.1 - 1.0;
        assert!((dx * dx + dy * dy).sqrt() < 0.6, "position {position:?} too far from (1,1)");
        assert!(uncertainty < 2.0, "uncertainty {uncertainty} too high");
    }

    #[test]
    fn rejects_collinear_anchors() {
        let observations = [
            ((0.0, 0.0), 1.0),
            ((1.0, 0.0), 1.0),
            ((2.0, 0.0), 1.0),
        ];
        // Collinear anchors make y unrecoverable; the refit RMSE should
        // either blow up or the result should remain far from any one true
        // point. We only assert it doesn't panic and is internally consistent.
        let _ = trilaterate(&observations);
    }

    #[test]
    fn tukey_weight_vanishes_beyond_the_cutoff() {
        assert_eq!(tukey_weight(100.0, 1.0), 0.0);
        assert!(tukey_weight(0.0, 1.0) > 0.0);
    }
}
