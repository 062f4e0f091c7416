//! Floor-plan calibration: scan aggregation, anchor ranking, MDS
//! self-localization, free-space wall detection, tomographic wall
//! refinement, and room clustering into a persistable [`FloorPlan`].
//!
//! Known mesh peers are never ranked as candidate anchors alongside
//! observed devices — they enter the distance matrix either via a measured
//! acoustic range or, lacking one, via a low-confidence placeholder so the
//! floor plan still reports *a* position for every declared peer rather
//! than silently dropping it.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use nalgebra::DMatrix;

use crate::acoustic;
use crate::audio::AudioBackend;
use crate::error::{SenseyeError, SenseyeResult};
use crate::floorplan::FloorPlan;
use crate::inference::{MAX_DISTANCE_M, MIN_DISTANCE_M, PATH_LOSS_INTERCEPT};
use crate::layout;
use crate::model::SignalType;
use crate::scanner::ScannerBackend;
use crate::tomography::{self, LinkMeasurement};
use crate::topology::{self, WallSegment, classify_material};

/// Path-loss exponent for the calibration distance model. Deliberately a
/// plain free-space exponent (n=2) rather than [`crate::inference`]'s
/// indoor-biased 2.5: calibration wants maximum sensitivity to excess
/// attenuation, not a realistic absolute-distance estimate.
pub const FREE_SPACE_PATH_LOSS_EXPONENT: f64 = 2.0;
/// At most this many non-peer devices are kept as MDS anchors.
pub const MAX_ANCHOR_DEVICES: usize = 8;
/// Margin, in meters, added around the observed position extent to get a
/// provisional tomography bounding box.
pub const BOUNDS_MARGIN_M: f64 = 1.0;
/// Percentile of the tomography grid above which a cell is promoted to a
/// wall segment.
pub const TOMOGRAPHY_WALL_PERCENTILE: f64 = 0.8;
/// Floor under the percentile threshold: weak reconstructions never
/// produce tomography-derived walls.
pub const MIN_TOMOGRAPHY_WALL_DB: f64 = 3.0;
/// At most this many tomography-derived wall segments are kept.
pub const MAX_TOMOGRAPHY_WALLS: usize = 40;
/// Confidence assigned to a peer distance with no acoustic measurement —
/// low enough that MDS output for it should be treated as a rough guess.
pub const UNRESOLVED_PEER_CONFIDENCE: f64 = 0.1;

/// Aggregated RF view of one observed device across a calibration scan
/// burst.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub mean_rssi: f64,
    pub samples: usize,
    pub ssid: Option<String>,
}

/// Runs `scan_count` scans (default 3 per spec) and averages RSSI per
/// device. Acoustic observations never appear here — calibration treats
/// acoustic ranging as a separate, peer-keyed input.
pub async fn perform_scans(
    scanner: &dyn ScannerBackend,
    scan_count: usize,
) -> BTreeMap<String, DeviceSummary> {
    let mut sums: BTreeMap<String, (f64, usize, Option<String>)> = BTreeMap::new();
    for _ in 0..scan_count.max(1) {
        for obs in scanner.scan().await {
            if !matches!(obs.signal_type, SignalType::Wifi | SignalType::Ble) {
                continue;
            }
            let entry = sums
                .entry(obs.device_id.clone())
                .or_insert((0.0, 0, None));
            entry.0 += obs.rssi;
            entry.1 += 1;
            if entry.2.is_none() {
                entry.2 = obs.metadata.ssid.clone();
            }
        }
    }
    sums.into_iter()
        .map(|(id, (sum, n, ssid))| {
            let mean_rssi = sum / n.max(1) as f64;
            (id, DeviceSummary { mean_rssi, samples: n, ssid })
        })
        .collect()
}

fn free_space_distance(rssi: f64) -> f64 {
    let exponent = (-rssi - PATH_LOSS_INTERCEPT) / (10.0 * FREE_SPACE_PATH_LOSS_EXPONENT);
    10f64.powf(exponent).clamp(MIN_DISTANCE_M, MAX_DISTANCE_M)
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = (((sorted.len() - 1) as f64) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn bounds_of(positions: impl Iterator<Item = (f64, f64)>) -> (f64, f64, f64, f64) {
    let mut x_min = f64::INFINITY;
    let mut y_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    let mut any = false;
    for (x, y) in positions {
        any = true;
        x_min = x_min.min(x);
        y_min = y_min.min(y);
        x_max = x_max.max(x);
        y_max = y_max.max(y);
    }
    if !any {
        return (0.0, 0.0, 1.0, 1.0);
    }
    (
        x_min - BOUNDS_MARGIN_M,
        y_min - BOUNDS_MARGIN_M,
        x_max + BOUNDS_MARGIN_M,
        y_max + BOUNDS_MARGIN_M,
    )
}

/// Runs the full calibration pipeline (spec §4.9) given already-aggregated
/// RF device summaries and any acoustic peer ranges resolved by the
/// orchestrator's ping/pong round trip. Pure and synchronous so it is
/// exercised directly by unit tests without a scanner or audio backend.
pub fn build_floorplan(
    self_id: &str,
    own_position: Option<(f64, f64)>,
    devices: &BTreeMap<String, DeviceSummary>,
    peer_ids: &[String],
    peer_acoustic_ranges: &BTreeMap<String, f64>,
    now: f64,
) -> SenseyeResult<(FloorPlan, BTreeMap<String, f64>)> {
    let mut ranked: Vec<(&String, &DeviceSummary)> = devices.iter().collect();
    ranked.sort_by(|a, b| b.1.mean_rssi.partial_cmp(&a.1.mean_rssi).unwrap());
    ranked.truncate(MAX_ANCHOR_DEVICES);

    let mut ids: Vec<String> = vec![self_id.to_string()];
    let device_start = ids.len();
    for (id, _) in &ranked {
        ids.push((*id).clone());
    }
    let peer_start = ids.len();
    for peer_id in peer_ids {
        ids.push(peer_id.clone());
    }

    let n = ids.len();
    if n < 2 {
        return Err(SenseyeError::Calibration(
            "no candidate anchors or peers available to calibrate against".into(),
        ));
    }

    let mut direct: Vec<Vec<Option<f64>>> = vec![vec![None; n]; n];
    let mut device_distances = Vec::with_capacity(ranked.len());
    for (offset, (_, summary)) in ranked.iter().enumerate() {
        let idx = device_start + offset;
        let d = free_space_distance(summary.mean_rssi);
        direct[0][idx] = Some(d);
        direct[idx][0] = Some(d);
        device_distances.push(d);
    }
    let default_peer_distance = if device_distances.is_empty() {
        5.0
    } else {
        device_distances.iter().sum::<f64>() / device_distances.len() as f64
    };

    let mut synthetic: Vec<(usize, usize)> = Vec::new();
    for (offset, peer_id) in peer_ids.iter().enumerate() {
        let idx = peer_start + offset;
        let (d, is_synthetic) = match peer_acoustic_ranges.get(peer_id) {
            Some(&d) => (d, false),
            None => (default_peer_distance, true),
        };
        direct[0][idx] = Some(d);
        direct[idx][0] = Some(d);
        if is_synthetic {
            synthetic.push((0, idx));
            synthetic.push((idx, 0));
        }
    }

    let (distances, mut confidence) = layout::propagate_distances(&direct, 0);
    for &(i, j) in &synthetic {
        confidence[i][j] = UNRESOLVED_PEER_CONFIDENCE;
    }
    let _ = confidence; // retained for future use; current MDS step is unweighted.

    let matrix = DMatrix::from_fn(n, n, |r, c| distances[r][c]);
    let raw_positions = layout::mds_positions(&matrix);
    let mut anchors = BTreeMap::new();
    anchors.insert(0usize, own_position.unwrap_or((0.0, 0.0)));
    let positions = layout::anchor_positions(&raw_positions, &anchors);

    let mut positions_by_id: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    positions_by_id.insert(self_id.to_string(), positions[0]);
    for (offset, (id, _)) in ranked.iter().enumerate() {
        positions_by_id.insert((*id).clone(), positions[device_start + offset]);
    }
    for (offset, peer_id) in peer_ids.iter().enumerate() {
        positions_by_id.insert(peer_id.clone(), positions[peer_start + offset]);
    }

    let mut node_positions: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for (offset, (id, _)) in ranked.iter().enumerate() {
        node_positions.insert((*id).clone(), positions[device_start + offset]);
    }
    for (offset, peer_id) in peer_ids.iter().enumerate() {
        node_positions.insert(peer_id.clone(), positions[peer_start + offset]);
    }

    let self_pos = positions[0];
    let mut link_attenuations: BTreeMap<(String, String), f64> = BTreeMap::new();
    for (offset, (id, summary)) in ranked.iter().enumerate() {
        let pos = positions[device_start + offset];
        let d = ((pos.0 - self_pos.0).powi(2) + (pos.1 - self_pos.1).powi(2))
            .sqrt()
            .max(0.05);
        let expected_rssi = -(10.0 * FREE_SPACE_PATH_LOSS_EXPONENT * d.log10() + PATH_LOSS_INTERCEPT);
        let attenuation = (expected_rssi - summary.mean_rssi).max(0.0);
        link_attenuations.insert((self_id.to_string(), (*id).clone()), attenuation);
    }

    let detected_walls = topology::detect_walls(&positions_by_id, &link_attenuations);

    let bounds = bounds_of(positions_by_id.values().copied());
    let resolution = tomography::DEFAULT_RESOLUTION_M;
    let influence_radius = tomography::DEFAULT_INFLUENCE_RADIUS_M;
    let link_measurements: Vec<LinkMeasurement> = ranked
        .iter()
        .enumerate()
        .map(|(offset, (id, summary))| LinkMeasurement {
            p1: self_pos,
            p2: positions[device_start + offset],
            excess_attenuation: *link_attenuations
                .get(&(self_id.to_string(), (*id).clone()))
                .unwrap_or(&0.0),
            confidence: (summary.samples as f64 / 10.0).clamp(0.2, 0.95),
        })
        .collect();
    let grid = tomography::reconstruct(&link_measurements, bounds, resolution, influence_radius);

    let values: Vec<f64> = grid.iter().flatten().copied().collect();
    let threshold = MIN_TOMOGRAPHY_WALL_DB.max(percentile(&values, TOMOGRAPHY_WALL_PERCENTILE));
    let mut ranked_cells: Vec<(f64, usize, usize)> = Vec::new();
    for (r, row) in grid.iter().enumerate() {
        for (c, &value) in row.iter().enumerate() {
            if value > threshold {
                ranked_cells.push((value, r, c));
            }
        }
    }
    ranked_cells.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    ranked_cells.truncate(MAX_TOMOGRAPHY_WALLS);

    let (x_min, y_min, _, _) = bounds;
    let half = resolution / 2.0;
    let tomography_walls: Vec<WallSegment> = ranked_cells
        .into_iter()
        .map(|(value, r, c)| {
            let cx = x_min + (c as f64 + 0.5) * resolution;
            let cy = y_min + (r as f64 + 0.5) * resolution;
            WallSegment {
                start: (cx - half, cy),
                end: (cx + half, cy),
                attenuation_db: value,
                material: classify_material(value),
            }
        })
        .collect();

    let mut seen: HashSet<(i64, i64, i64, i64, &'static str)> = HashSet::new();
    let mut walls = Vec::new();
    for wall in detected_walls.into_iter().chain(tomography_walls) {
        let key = (
            (wall.start.0 * 10.0).round() as i64,
            (wall.start.1 * 10.0).round() as i64,
            (wall.end.0 * 10.0).round() as i64,
            (wall.end.1 * 10.0).round() as i64,
            wall.material.as_str(),
        );
        if seen.insert(key) {
            walls.push(wall);
        }
    }

    let rooms = topology::infer_rooms_from_nodes(&positions_by_id, &walls);

    let mut labels = BTreeMap::new();
    for (id, summary) in &ranked {
        if let Some(ssid) = &summary.ssid {
            labels.insert((*id).clone(), ssid.clone());
        }
    }

    let baseline: BTreeMap<String, f64> = devices
        .iter()
        .map(|(id, summary)| (id.clone(), summary.mean_rssi))
        .collect();

    let floorplan = FloorPlan {
        node_positions,
        wall_segments: walls,
        rooms,
        bounds,
        labels,
        attenuation_grid: Some(grid),
        attenuation_resolution: Some(resolution),
        calibrated_at: now,
    };

    Ok((floorplan, baseline))
}

/// The `calibrate` subcommand / recalibration-trigger entry point: performs
/// live scans and a best-effort acoustic echo sweep (to bound room extent),
/// then hands off to [`build_floorplan`]. Acoustic peer ranges are supplied
/// by the caller, since resolving them requires the orchestrator's mesh
/// handle and simultaneous listen/ping round trip (see
/// [`crate::mesh::PeerMesh::request_acoustic_ping`]).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    self_id: &str,
    own_position: Option<(f64, f64)>,
    scanner: &dyn ScannerBackend,
    audio: &dyn AudioBackend,
    freq_start: f64,
    freq_end: f64,
    chirp_duration: f64,
    sample_rate: u32,
    peer_ids: &[String],
    peer_acoustic_ranges: &BTreeMap<String, f64>,
    scan_count: usize,
    now: f64,
) -> SenseyeResult<(FloorPlan, BTreeMap<String, f64>)> {
    let devices = perform_scans(scanner, scan_count).await;

    let template = acoustic::generate_chirp(freq_start, freq_end, chirp_duration, sample_rate as f64);
    let record_duration = Duration::from_secs_f64(chirp_duration + 0.3);
    match audio.play_record(template.clone(), record_duration, sample_rate).await {
        Ok(recording) => {
            if let Some(profile) = acoustic::analyze_echo(&recording, &template, sample_rate as f64) {
                log::debug!(
                    "[calibration] {self_id}: echo sweep bounded nearest reflector at {:.2} m (snr {:.1})",
                    profile.distance_m,
                    profile.snr
                );
            }
        }
        Err(e) => log::debug!("[calibration] {self_id}: echo sweep unavailable: {e}"),
    }

    build_floorplan(self_id, own_position, &devices, peer_ids, peer_acoustic_ranges, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullAudioBackend;
    use crate::scanner::NullScanner;

    fn device(mean_rssi: f64, ssid: Option<&str>) -> DeviceSummary {
        DeviceSummary {
            mean_rssi,
            samples: 10,
            ssid: ssid.map(str::to_string),
        }
    }

    #[test]
    fn three_devices_and_one_unresolvable_peer_populate_four_positions() {
        let mut devices = BTreeMap::new();
        devices.insert("ap-1".to_string(), device(-40.0, Some("HomeWifi")));
        devices.insert("phone-1".to_string(), device(-55.0, None));
        devices.insert("laptop-1".to_string(), device(-65.0, None));

        let peer_ids = vec!["node-b".to_string()];
        let acoustic_ranges = BTreeMap::new();

        let (plan, baseline) =
            build_floorplan("node-a", None, &devices, &peer_ids, &acoustic_ranges, 1_700_000_000.0)
                .expect("calibration should succeed");

        assert_eq!(plan.node_positions.len(), 4);
        assert!(plan.bounds.2 > plan.bounds.0);
        assert!(plan.bounds.3 > plan.bounds.1);
        assert!(plan.labels.values().any(|label| label == "HomeWifi"));
        assert!(!plan.rooms.rooms.is_empty());
        assert_eq!(baseline.len(), devices.len());
    }

    #[test]
    fn a_measured_acoustic_range_is_used_verbatim() {
        let mut devices = BTreeMap::new();
        devices.insert("ap-1".to_string(), device(-50.0, None));
        devices.insert("ap-2".to_string(), device(-52.0, None));

        let peer_ids = vec!["node-b".to_string()];
        let mut acoustic_ranges = BTreeMap::new();
        acoustic_ranges.insert("node-b".to_string(), 3.5);

        let (plan, _) =
            build_floorplan("node-a", None, &devices, &peer_ids, &acoustic_ranges, 0.0).unwrap();
        let peer_pos = plan.node_positions["node-b"];
        let dist = (peer_pos.0.powi(2) + peer_pos.1.powi(2)).sqrt();
        assert!((dist - 3.5).abs() < 1e-6);
    }

    #[test]
    fn refuses_to_calibrate_with_no_anchors_or_peers() {
        let devices = BTreeMap::new();
        let peer_ids: Vec<String> = Vec::new();
        let acoustic_ranges = BTreeMap::new();
        assert!(build_floorplan("node-a", None, &devices, &peer_ids, &acoustic_ranges, 0.0).is_err());
    }

    #[tokio::test]
    async fn run_falls_back_gracefully_when_scanner_and_audio_are_null() {
        let scanner = NullScanner;
        let audio = NullAudioBackend;
        let peer_ids = vec!["node-b".to_string()];
        let mut acoustic_ranges = BTreeMap::new();
        acoustic_ranges.insert("node-b".to_string(), 2.0);

        let result = run(
            "node-a",
            None,
            &scanner,
            &audio,
            18_000.0,
            22_000.0,
            0.01,
            48_000,
            &peer_ids,
            &acoustic_ranges,
            3,
            0.0,
        )
        .await;
        assert!(result.is_ok());
    }
}
