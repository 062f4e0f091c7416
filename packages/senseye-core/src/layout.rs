//! Classical multidimensional scaling: relative node positions from
//! pairwise distances, aligned to one or two known anchor positions.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, SymmetricEigen};

/// Classical MDS on a symmetric NxN distance matrix, returning N (x, y)
/// positions relative to an arbitrary origin, rotation, and reflection.
#[must_use]
pub fn mds_positions(distances: &DMatrix<f64>) -> Vec<(f64, f64)> {
    let n = distances.nrows();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![(0.0, 0.0)];
    }
    if n == 2 {
        return vec![(0.0, 0.0), (distances[(0, 1)], 0.0)];
    }

    let d2 = distances.map(|d| d * d);
    let row_means: Vec<f64> = (0..n).map(|r| d2.row(r).sum() / n as f64).collect();
    let col_means: Vec<f64> = (0..n).map(|c| d2.column(c).sum() / n as f64).collect();
    let grand_mean = d2.sum() / (n * n) as f64;

    let mut b = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            b[(i, j)] = -0.5 * (d2[(i, j)] - row_means[i] - col_means[j] + grand_mean);
        }
    }
    // Symmetrize away floating-point asymmetry.
    let b = (&b + b.transpose()) * 0.5;

    let eigen = SymmetricEigen::new(b);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &c| eigen.eigenvalues[c].partial_cmp(&eigen.eigenvalues[a]).unwrap());

    let top = &order[..2.min(n)];
    let scales: Vec<f64> = top.iter().map(|&i| eigen.eigenvalues[i].max(0.0).sqrt()).collect();

    (0..n)
        .map(|row| {
            let x = if let Some(&col) = top.first() {
                eigen.eigenvectors[(row, col)] * scales[0]
            } else {
                0.0
            };
            let y = if top.len() > 1 {
                eigen.eigenvectors[(row, top[1])] * scales[1]
            } else {
                0.0
            };
            (x, y)
        })
        .collect()
}

/// Aligns `positions` to one or two known anchors (node index -> target
/// position). One anchor translates only; two anchors translate, rotate,
/// and reflect if that better matches the target pair's orientation.
#[must_use]
pub fn anchor_positions(positions: &[(f64, f64)], anchors: &BTreeMap<usize, (f64, f64)>) -> Vec<(f64, f64)> {
    if positions.is_empty() || anchors.is_empty() {
        return positions.to_vec();
    }

    let indices: Vec<usize> = anchors.keys().copied().collect();
    let mut result = positions.to_vec();

    if indices.len() >= 2 {
        let i = indices[0];
        let j = indices[1];
        let src = (result[j].0 - result[i].0, result[j].1 - result[i].1);
        let tgt_i = anchors[&i];
        let tgt_j = anchors[&j];
        let tgt = (tgt_j.0 - tgt_i.0, tgt_j.1 - tgt_i.1);

        let src_len = (src.0 * src.0 + src.1 * src.1).sqrt();
        let tgt_len = (tgt.0 * tgt.0 + tgt.1 * tgt.1).sqrt();

        if src_len > 1e-12 && tgt_len > 1e-12 {
            let angle_src = src.1.atan2(src.0);
            let angle_tgt = tgt.1.atan2(tgt.0);
            let theta = angle_tgt - angle_src;
            let (sin_t, cos_t) = theta.sin_cos();

            let rotate = |p: (f64, f64), about: (f64, f64)| -> (f64, f64) {
                let (dx, dy) = (p.0 - about.0, p.1 - about.1);
                (dx * cos_t - dy * sin_t, dx * sin_t + dy * cos_t)
            };

            let pivot = result[i];
            let rotated: Vec<(f64, f64)> = result.iter().map(|&p| rotate(p, pivot)).collect();

            let rotated_vec = (rotated[j].0 - rotated[i].0, rotated[j].1 - rotated[i].1);
            let error_no_flip = ((rotated_vec.0 - tgt.0).powi(2) + (rotated_vec.1 - tgt.1).powi(2)).sqrt();

            let reflected: Vec<(f64, f64)> = rotated.iter().map(|&(x, y)| (x, -y)).collect();
            let reflected_vec = (reflected[j].0 - reflected[i].0, reflected[j].1 - reflected[i].1);
            let error_flip = ((reflected_vec.0 - tgt.0).powi(2) + (reflected_vec.1 - tgt.1).powi(2)).sqrt();

            let chosen = if error_flip < error_no_flip { reflected } else { rotated };
            let offset = (tgt_i.0 - chosen[i].0, tgt_i.1 - chosen[i].1);
            result = chosen.iter().map(|&(x, y)| (x + offset.0, y + offset.1)).collect();
        } else {
            let offset = (tgt_i.0 - result[i].0, tgt_i.1 - result[i].1);
            result = result.iter().map(|&(x, y)| (x + offset.0, y + offset.1)).collect();
        }
    } else {
        let i = indices[0];
        let target = anchors[&i];
        let offset = (target.0 - result[i].0, target.1 - result[i].1);
        result = result.iter().map(|&(x, y)| (x + offset.0, y + offset.1)).collect();
    }

    result
}

/// Fills the unknown entries of a pairwise distance matrix in two passes.
///
/// `direct[i][j]` holds a directly measured distance, or `None` if nodes `i`
/// and `j` have no direct measurement between them. The diagonal is ignored.
///
/// Pass 1 propagates distances along known edges via shortest paths of at
/// most three hops (two rounds of relaxation against the direct edges, since
/// the seed matrix already covers one-hop paths). This never shortens an
/// existing direct edge below its measured value and never invents a path
/// shorter than the true shortest path through the known edges.
///
/// Pass 2 fills anything still unresolved using the uniform-angle prior
/// relative to `observer`: `E[d_ij^2] = d_0i^2 + d_0j^2`, the expected
/// squared distance between two points at known range from a common
/// observer, averaged over a uniformly random angle between them. This is a
/// weak prior, not a measurement, so the returned confidence matrix marks it
/// well below both direct and propagated entries.
#[must_use]
pub fn propagate_distances(direct: &[Vec<Option<f64>>], observer: usize) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let n = direct.len();
    let mut best = vec![vec![f64::INFINITY; n]; n];
    let mut confidence = vec![vec![0.0; n]; n];
    for i in 0..n {
        best[i][i] = 0.0;
        confidence[i][i] = 1.0;
        for j in 0..n {
            if i != j {
                if let Some(d) = direct[i][j] {
                    best[i][j] = d;
                    confidence[i][j] = 1.0;
                }
            }
        }
    }

    // Two rounds of relaxation against the one-hop seed reach exactly
    // three-hop paths: round 1 yields <=2 hops, round 2 yields <=3 hops.
    for _ in 0..2 {
        let mut next = best.clone();
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                for k in 0..n {
                    if let Some(dk) = direct[k][j] {
                        let candidate = best[i][k] + dk;
                        if candidate < next[i][j] {
                            next[i][j] = candidate;
                        }
                    }
                }
            }
        }
        best = next;
    }
    for i in 0..n {
        for j in 0..n {
            if i != j && direct[i][j].is_none() && best[i][j].is_finite() {
                confidence[i][j] = 0.5;
            }
        }
    }

    if observer < n {
        for i in 0..n {
            if i == observer || !best[observer][i].is_finite() {
                continue;
            }
            for j in (i + 1)..n {
                if j == observer || !best[observer][j].is_finite() {
                    continue;
                }
                if best[i][j].is_finite() {
                    continue;
                }
                let d0i = best[observer][i];
                let d0j = best[observer][j];
                let estimate = (d0i * d0i + d0j * d0j).sqrt();
                best[i][j] = estimate;
                best[j][i] = estimate;
                confidence[i][j] = 0.25;
                confidence[j][i] = 0.25;
            }
        }
    }

    // Direct measurements are ground truth: restore them verbatim in case
    // floating-point relaxation nudged a value below the measured one.
    for i in 0..n {
        for j in 0..n {
            if i != j {
                if let Some(d) = direct[i][j] {
                    best[i][j] = d;
                    confidence[i][j] = 1.0;
                }
            }
        }
    }

    (best, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_node_mds_places_them_along_the_x_axis_at_the_given_distance() {
        let distances = DMatrix::from_row_slice(2, 2, &[0.0, 3.0, 3.0, 0.0]);
        let positions = mds_positions(&distances);
        assert_eq!(positions[0], (0.0, 0.0));
        assert_eq!(positions[1].0, 3.0);
    }

    #[test]
    fn three_node_mds_recovers_pairwise_distances() {
        let distances = DMatrix::from_row_slice(
            3,
            3,
            &[0.0, 3.0, 4.0, 3.0, 0.0, 5.0, 4.0, 5.0, 0.0],
        );
        let positions = mds_positions(&distances);
        let dist = |a: (f64, f64), b: (f64, f64)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
        assert!((dist(positions[0], positions[1]) - 3.0).abs() < 1e-6);
        assert!((dist(positions[0], positions[2]) - 4.0).abs() < 1e-6);
        assert!((dist(positions[1], positions[2]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn single_anchor_translates_without_rotating() {
        let positions = vec![(0.0, 0.0), (3.0, 0.0)];
        let mut anchors = BTreeMap::new();
        anchors.insert(0usize, (10.0, 10.0));
        let aligned = anchor_positions(&positions, &anchors);
        assert_eq!(aligned[0], (10.0, 10.0));
        assert_eq!(aligned[1], (13.0, 10.0));
    }

    #[test]
    fn two_anchors_rotate_and_translate_to_match_target_orientation() {
        let positions = vec![(0.0, 0.0), (3.0, 0.0)];
        let mut anchors = BTreeMap::new();
        anchors.insert(0usize, (0.0, 0.0));
        anchors.insert(1usize, (0.0, 3.0));
        let aligned = anchor_positions(&positions, &anchors);
        assert!((aligned[0].0).abs() < 1e-9 && (aligned[0].1).abs() < 1e-9);
        assert!((aligned[1].0).abs() < 1e-6);
        assert!((aligned[1].1 - 3.0).abs() < 1e-6);
    }

    #[test]
    fn propagate_distances_never_overwrites_a_direct_edge() {
        let direct = vec![
            vec![None, Some(1.0), None],
            vec![Some(1.0), None, Some(1.0)],
            vec![None, Some(1.0), None],
        ];
        let (filled, confidence) = propagate_distances(&direct, 0);
        assert_eq!(filled[0][1], 1.0);
        assert_eq!(filled[1][2], 1.0);
        assert_eq!(confidence[0][1], 1.0);
        // 0-2 has no direct edge; the shortest path through node 1 is 2.0,
        // and nothing should beat (or fall below) that.
        assert!((filled[0][2] - 2.0).abs() < 1e-9);
        assert!(filled[0][2] >= 2.0 - 1e-9);
        assert_eq!(confidence[0][2], 0.5);
    }

    #[test]
    fn propagate_distances_falls_back_to_uniform_angle_prior_when_unreachable() {
        // Observer 0 knows distances to 1 and 2, but 1 and 2 were never
        // observed together and share no path.
        let direct = vec![
            vec![None, Some(3.0), Some(4.0)],
            vec![Some(3.0), None, None],
            vec![Some(4.0), None, None],
        ];
        let (filled, confidence) = propagate_distances(&direct, 0);
        assert!((filled[1][2] - 5.0).abs() < 1e-9);
        assert_eq!(confidence[1][2], 0.25);
    }
}
