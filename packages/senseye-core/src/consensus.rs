//! Consensus fusion: combine this node's local belief with its peers'
//! latest beliefs into a single inverse-variance-weighted fused belief.

use std::collections::BTreeMap;

use crate::model::{Belief, DeviceState, LinkState, ZoneBelief};

/// Small floor added to variance so a confidence of exactly 1.0 never
/// produces an infinite weight.
const VARIANCE_EPSILON: f64 = 1e-3;
/// Baseline device confidence when no matching link confidence is known.
const DEFAULT_DEVICE_CONFIDENCE: f64 = 0.35;
/// Coefficient controlling how strongly disagreement between contributors'
/// attenuation estimates suppresses fused link confidence.
const AGREEMENT_PENALTY_COEFFICIENT: f64 = 2.5;
/// Distance (m) at which the distance-confidence term has decayed to 0.5.
const DISTANCE_CONFIDENCE_SCALE_M: f64 = 15.0;
/// Confidence multiplier applied to a moving contributor's device estimate.
const MOVING_CONFIDENCE_PENALTY: f64 = 0.9;

/// Maps a confidence in `[0, 1]` to a variance via `(1-c)/c + eps`, after
/// clamping `c` into `[0.01, 0.99]` so neither term diverges.
fn confidence_to_variance(confidence: f64) -> f64 {
    let c = confidence.clamp(0.01, 0.99);
    (1.0 - c) / c + VARIANCE_EPSILON
}

/// Inverse-variance weight for a confidence value.
fn confidence_to_weight(confidence: f64) -> f64 {
    1.0 / confidence_to_variance(confidence)
}

/// Weighted mean of `(value, weight)` pairs, or `None` if the total weight
/// is zero (i.e. there were no contributors).
fn weighted_mean(samples: &[(f64, f64)]) -> Option<f64> {
    let total_weight: f64 = samples.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return None;
    }
    Some(samples.iter().map(|(v, w)| v * w).sum::<f64>() / total_weight)
}

/// Weighted variance of `(value, weight)` pairs around their weighted mean.
fn weighted_variance(samples: &[(f64, f64)]) -> f64 {
    let Some(mean) = weighted_mean(samples) else {
        return 0.0;
    };
    let total_weight: f64 = samples.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    samples
        .iter()
        .map(|(v, w)| w * (v - mean).powi(2))
        .sum::<f64>()
        / total_weight
}

/// One contributor's view of a single link, device, or zone key, carrying
/// enough context to compute per-contributor weights.
struct Contributor<'a> {
    link: Option<&'a LinkState>,
    device: Option<&'a DeviceState>,
    zone: Option<&'a ZoneBelief>,
}

/// Collects, for every belief (local plus every peer), the contributor at
/// `key` if present, returning an empty vec if no belief mentions `key`.
fn collect_link<'a>(beliefs: &[&'a Belief], key: &str) -> Vec<&'a LinkState> {
    beliefs.iter().filter_map(|b| b.links.get(key)).collect()
}

fn collect_device<'a>(beliefs: &[&'a Belief], key: &str) -> Vec<&'a DeviceState> {
    beliefs.iter().filter_map(|b| b.devices.get(key)).collect()
}

fn collect_zone<'a>(beliefs: &[&'a Belief], key: &str) -> Vec<&'a ZoneBelief> {
    beliefs.iter().filter_map(|b| b.zones.get(key)).collect()
}

fn fuse_link(contributors: &[&LinkState]) -> LinkState {
    let attenuation_samples: Vec<(f64, f64)> = contributors
        .iter()
        .map(|l| (l.attenuation, confidence_to_weight(l.confidence)))
        .collect();
    let motion_samples: Vec<(f64, f64)> = contributors
        .iter()
        .map(|l| (if l.motion { 1.0 } else { 0.0 }, confidence_to_weight(l.confidence)))
        .collect();

    let attenuation = weighted_mean(&attenuation_samples).unwrap_or(0.0);
    let weighted_motion = weighted_mean(&motion_samples).unwrap_or(0.0);
    let total_weight: f64 = attenuation_samples.iter().map(|(_, w)| w).sum();
    let agreement_penalty = 1.0 / (1.0 + AGREEMENT_PENALTY_COEFFICIENT * weighted_variance(&attenuation_samples));
    let confidence = (total_weight / (1.0 + total_weight)) * agreement_penalty;

    LinkState {
        attenuation: attenuation.max(0.0),
        motion: weighted_motion >= 0.5,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

fn fuse_device(contributors: &[&DeviceState], link_confidence: Option<f64>) -> DeviceState {
    let device_confidence = link_confidence.unwrap_or(DEFAULT_DEVICE_CONFIDENCE);

    let rssi_samples: Vec<(f64, f64)> = contributors
        .iter()
        .map(|d| {
            let moving_penalty = if d.moving { MOVING_CONFIDENCE_PENALTY } else { 1.0 };
            (d.rssi, confidence_to_weight(device_confidence) * moving_penalty)
        })
        .collect();
    let rssi = weighted_mean(&rssi_samples).unwrap_or(0.0);

    let distance_samples: Vec<(f64, f64)> = contributors
        .iter()
        .filter_map(|d| d.estimated_distance.map(|dist| (d, dist)))
        .map(|(d, dist)| {
            let distance_confidence = 1.0 / (1.0 + dist / DISTANCE_CONFIDENCE_SCALE_M);
            let moving_penalty = if d.moving { MOVING_CONFIDENCE_PENALTY } else { 1.0 };
            let precision = confidence_to_weight(device_confidence) * distance_confidence * moving_penalty;
            (dist, precision / dist.max(0.1).powi(2))
        })
        .collect();
    let distance = weighted_mean(&distance_samples);

    let motion_samples: Vec<(f64, f64)> = contributors
        .iter()
        .map(|d| (if d.moving { 1.0 } else { 0.0 }, confidence_to_weight(device_confidence)))
        .collect();
    let moving = weighted_mean(&motion_samples).unwrap_or(0.0) >= 0.5;

    DeviceState {
        rssi,
        estimated_distance: distance,
        moving,
    }
}

fn fuse_zone(contributors: &[&ZoneBelief]) -> ZoneBelief {
    let occupied_samples: Vec<(f64, f64)> = contributors
        .iter()
        .map(|z| (z.occupied, zone_precision(z.occupied)))
        .collect();
    let motion_samples: Vec<(f64, f64)> = contributors
        .iter()
        .map(|z| (z.motion, zone_precision(z.motion)))
        .collect();

    ZoneBelief {
        occupied: weighted_mean(&occupied_samples).unwrap_or(0.0).clamp(0.0, 1.0),
        motion: weighted_mean(&motion_samples).unwrap_or(0.0).clamp(0.0, 1.0),
    }
}

/// Precision for a zone probability: certainty (near 0 or 1) dominates over
/// values near the uninformative midpoint of 0.5.
fn zone_precision(probability: f64) -> f64 {
    1.0 + (probability - 0.5).abs() * 2.0
}

/// Fuses a local belief `local` with zero or more `peers` into a single
/// belief attributed to `local.node_id`, preserving `local`'s identity,
/// timestamp, and acoustic ranges. `fuse_beliefs(local, [])` is the
/// identity: the result equals `local` for every link/device/zone key.
#[must_use]
pub fn fuse_beliefs(local: &Belief, peers: &[&Belief]) -> Belief {
    let mut all: Vec<&Belief> = Vec::with_capacity(peers.len() + 1);
    all.push(local);
    all.extend(peers.iter().copied());

    let mut link_keys: Vec<&str> = Vec::new();
    let mut device_keys: Vec<&str> = Vec::new();
    let mut zone_keys: Vec<&str> = Vec::new();
    for belief in &all {
        link_keys.extend(belief.links.keys().map(String::as_str));
        device_keys.extend(belief.devices.keys().map(String::as_str));
        zone_keys.extend(belief.zones.keys().map(String::as_str));
    }
    link_keys.sort_unstable();
    link_keys.dedup();
    device_keys.sort_unstable();
    device_keys.dedup();
    zone_keys.sort_unstable();
    zone_keys.dedup();

    let mut links = BTreeMap::new();
    for key in &link_keys {
        let contributors = collect_link(&all, key);
        if !contributors.is_empty() {
            links.insert((*key).to_string(), fuse_link(&contributors));
        }
    }

    let mut devices = BTreeMap::new();
    for key in &device_keys {
        let contributors = collect_device(&all, key);
        if !contributors.is_empty() {
            let link_confidence = links.get(*key).map(|l: &LinkState| l.confidence);
            devices.insert((*key).to_string(), fuse_device(&contributors, link_confidence));
        }
    }

    let mut zones = BTreeMap::new();
    for key in &zone_keys {
        let contributors = collect_zone(&all, key);
        if !contributors.is_empty() {
            zones.insert((*key).to_string(), fuse_zone(&contributors));
        }
    }

    Belief {
        node_id: local.node_id.clone(),
        timestamp: local.timestamp,
        sequence_number: local.sequence_number,
        hop_count: local.hop_count,
        links,
        devices,
        zones,
        acoustic_ranges: local.acoustic_ranges.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(attenuation: f64, motion: bool, confidence: f64) -> LinkState {
        LinkState { attenuation, motion, confidence }
    }

    #[test]
    fn fusing_with_no_peers_is_the_identity() {
        let mut local = Belief::new("node-a", 10.0);
        local.links.insert("phone-1".into(), link(5.0, false, 0.8));
        local.devices.insert(
            "phone-1".into(),
            DeviceState { rssi: -55.0, estimated_distance: Some(4.0), moving: false },
        );
        local.zones.insert("kitchen".into(), ZoneBelief { occupied: 0.7, motion: 0.2 });

        let fused = fuse_beliefs(&local, &[]);
        assert_eq!(fused.links["phone-1"].attenuation, 5.0);
        assert_eq!(fused.devices["phone-1"].rssi, -55.0);
        assert_eq!(fused.zones["kitchen"].occupied, 0.7);
    }

    #[test]
    fn agreeing_peers_increase_confidence_over_either_alone() {
        let mut local = Belief::new("node-a", 10.0);
        local.links.insert("phone-1".into(), link(5.0, false, 0.6));
        let mut peer = Belief::new("node-b", 10.0);
        peer.links.insert("phone-1".into(), link(5.2, false, 0.6));

        let fused = fuse_beliefs(&local, &[&peer]);
        assert!(fused.links["phone-1"].confidence > 0.6);
    }

    #[test]
    fn disagreeing_peers_depress_confidence_via_agreement_penalty() {
        let mut local = Belief::new("node-a", 10.0);
        local.links.insert("phone-1".into(), link(2.0, false, 0.8));
        let mut peer = Belief::new("node-b", 10.0);
        peer.links.insert("phone-1".into(), link(40.0, false, 0.8));

        let agreeing_local = Belief::new("node-a", 10.0);
        let mut agreeing_a = agreeing_local.clone();
        agreeing_a.links.insert("phone-1".into(), link(2.0, false, 0.8));
        let mut agreeing_b = Belief::new("node-b", 10.0);
        agreeing_b.links.insert("phone-1".into(), link(2.1, false, 0.8));

        let disagreeing = fuse_beliefs(&local, &[&peer]);
        let agreeing = fuse_beliefs(&agreeing_a, &[&agreeing_b]);
        assert!(disagreeing.links["phone-1"].confidence < agreeing.links["phone-1"].confidence);
    }

    #[test]
    fn motion_is_fused_by_majority_vote_weighted_by_confidence() {
        let mut local = Belief::new("node-a", 10.0);
        local.links.insert("phone-1".into(), link(5.0, true, 0.9));
        let mut peer = Belief::new("node-b", 10.0);
        peer.links.insert("phone-1".into(), link(5.0, false, 0.1));

        let fused = fuse_beliefs(&local, &[&peer]);
        assert!(fused.links["phone-1"].motion);
    }

    #[test]
    fn a_key_present_in_only_one_peer_is_still_fused() {
        let local = Belief::new("node-a", 10.0);
        let mut peer = Belief::new("node-b", 10.0);
        peer.zones.insert("hall".into(), ZoneBelief { occupied: 0.9, motion: 0.1 });

        let fused = fuse_beliefs(&local, &[&peer]);
        assert!(fused.zones.contains_key("hall"));
    }
}
