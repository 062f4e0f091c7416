//! Local inference: from raw + filtered RSSI history, produce per-link
//! attenuation, per-device distance, and per-zone occupancy/motion belief.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::model::{DeviceState, LinkState, Observation, SignalType, ZoneBelief};

/// Default bounded history length per device.
pub const DEFAULT_HISTORY_LIMIT: usize = 120;
/// Window (in samples) over which motion variance is computed.
pub const MOTION_WINDOW: usize = 10;
/// Variance threshold, in dB^2, above which a link is considered in motion.
pub const MOTION_THRESHOLD_DB2: f64 = 2.0;
/// Path-loss exponent used by the free-space/indoor attenuation model.
pub const PATH_LOSS_EXPONENT: f64 = 2.5;
/// Path-loss model intercept, in dB.
pub const PATH_LOSS_INTERCEPT: f64 = 45.0;
/// Minimum resolvable distance, in meters.
pub const MIN_DISTANCE_M: f64 = 0.2;
/// Maximum resolvable RF distance, in meters.
pub const MAX_DISTANCE_M: f64 = 40.0;

/// A caller-maintained bounded ring buffer of raw RSSI samples for one
/// device, used for variance-based motion detection.
#[derive(Debug, Clone)]
pub struct DeviceHistory {
    raw: VecDeque<f64>,
    limit: usize,
}

impl DeviceHistory {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            raw: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.raw.len() == self.limit {
            self.raw.pop_front();
        }
        self.raw.push_back(value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Sample variance over the last `window` samples, or `None` if fewer
    /// than two samples are available.
    #[must_use]
    pub fn variance(&self, window: usize) -> Option<f64> {
        let n = self.raw.len().min(window);
        if n < 2 {
            return None;
        }
        let slice: Vec<f64> = self.raw.iter().rev().take(n).copied().collect();
        let mean = slice.iter().sum::<f64>() / n as f64;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        Some(var)
    }
}

/// Euclidean distance between two 2D points.
fn euclidean(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Inverts the path-loss model to recover a distance estimate from a
/// filtered RSSI, clamped to `[MIN_DISTANCE_M, MAX_DISTANCE_M]`.
#[must_use]
pub fn invert_path_loss(filtered_rssi: f64) -> f64 {
    let exponent = (-filtered_rssi - PATH_LOSS_INTERCEPT) / (10.0 * PATH_LOSS_EXPONENT);
    10f64.powf(exponent).clamp(MIN_DISTANCE_M, MAX_DISTANCE_M)
}

/// Per-device history plus the motion/attenuation/distance/confidence
/// machinery that turns a batch of observations into link and device
/// belief fragments.
pub struct LocalInference {
    histories: DashMap<String, DeviceHistory>,
    history_limit: usize,
}

impl LocalInference {
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            histories: DashMap::new(),
            history_limit,
        }
    }

    fn observe(&self, device_id: &str, raw_rssi: f64) {
        self.histories
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHistory::new(self.history_limit))
            .push(raw_rssi);
    }

    fn motion(&self, device_id: &str) -> bool {
        self.histories
            .get(device_id)
            .and_then(|h| h.variance(MOTION_WINDOW))
            .map(|v| v > MOTION_THRESHOLD_DB2)
            .unwrap_or(false)
    }

    fn sample_count(&self, device_id: &str) -> usize {
        self.histories.get(device_id).map(|h| h.len()).unwrap_or(0)
    }

    /// Infers this node's link and device belief fragments for one filtered
    /// observation.
    ///
    /// `observer_position`/`target_position` are only consulted for RF
    /// observations (acoustic observations carry an authoritative
    /// `metadata.distance_m` and skip the path-loss distance math).
    pub fn infer_link(
        &self,
        observation: &Observation,
        filtered_rssi: f64,
        innovation: f64,
        observer_position: Option<(f64, f64)>,
        target_position: Option<(f64, f64)>,
    ) -> (LinkState, DeviceState) {
        let raw_rssi = observation.metadata.raw_rssi.unwrap_or(observation.rssi);
        self.observe(&observation.device_id, raw_rssi);

        let motion = self.motion(&observation.device_id);
        let samples = self.sample_count(&observation.device_id) as f64;
        let base_confidence = (samples / MOTION_WINDOW as f64).min(1.0);

        let (attenuation, distance, confidence) = match observation.signal_type {
            SignalType::Acoustic => {
                let distance = observation.metadata.distance_m;
                let snr = observation.metadata.peak_snr.unwrap_or(0.0);
                let snr_confidence = ((snr - 1.0) / 8.0).clamp(0.05, 1.0);
                (0.0, distance, (base_confidence + snr_confidence) / 2.0)
            }
            SignalType::Wifi | SignalType::Ble => {
                let attenuation = match (observer_position, target_position) {
                    (Some(observer), Some(target)) => {
                        let d = euclidean(observer, target).max(0.05);
                        let expected_rssi =
                            -(10.0 * PATH_LOSS_EXPONENT * d.log10() + PATH_LOSS_INTERCEPT);
                        (expected_rssi - filtered_rssi).max(0.0)
                    }
                    _ => 0.0,
                };
                let distance = invert_path_loss(filtered_rssi);
                let innovation_penalty = 1.0 / (1.0 + innovation.abs() / 8.0);
                (attenuation, Some(distance), base_confidence * innovation_penalty)
            }
        };

        let link = LinkState {
            attenuation: attenuation.max(0.0),
            motion,
            confidence: confidence.clamp(0.0, 1.0),
        };
        let device = DeviceState {
            rssi: filtered_rssi,
            estimated_distance: distance,
            moving: motion,
        };

        (link, device)
    }
}

/// Aggregates the [`LinkState`]s of every link known to cross a zone into
/// that zone's occupancy/motion belief.
#[must_use]
pub fn infer_zone_belief(crossing_links: &[&LinkState]) -> ZoneBelief {
    if crossing_links.is_empty() {
        return ZoneBelief {
            occupied: 0.0,
            motion: 0.0,
        };
    }

    let motion_votes = crossing_links.iter().filter(|l| l.motion).count();
    let motion_prob = motion_votes as f64 / crossing_links.len() as f64;

    let avg_attenuation = crossing_links.iter().map(|l| l.attenuation).sum::<f64>()
        / crossing_links.len() as f64;
    let occupied_prob = (avg_attenuation / 20.0).min(1.0);

    ZoneBelief {
        occupied: occupied_prob,
        motion: motion_prob,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObservationMetadata;

    fn observation(device_id: &str, rssi: f64, signal_type: SignalType) -> Observation {
        Observation {
            device_id: device_id.to_string(),
            rssi,
            timestamp: 0.0,
            signal_type,
            metadata: ObservationMetadata {
                raw_rssi: Some(rssi),
                ..Default::default()
            },
        }
    }

    #[test]
    fn steady_rssi_produces_no_motion() {
        let inference = LocalInference::new(DEFAULT_HISTORY_LIMIT);
        let mut result = None;
        for _ in 0..12 {
            let obs = observation("phone-1", -60.0, SignalType::Wifi);
            result = Some(inference.infer_link(&obs, -60.0, 0.0, None, None));
        }
        assert!(!result.unwrap().0.motion);
    }

    #[test]
    fn a_noisy_rssi_history_is_flagged_as_motion() {
        let inference = LocalInference::new(DEFAULT_HISTORY_LIMIT);
        let samples = [-60.0, -50.0, -68.0, -45.0, -70.0, -42.0, -66.0, -48.0, -72.0, -40.0];
        let mut result = None;
        for &rssi in &samples {
            let obs = observation("phone-1", rssi, SignalType::Wifi);
            result = Some(inference.infer_link(&obs, rssi, 0.0, None, None));
        }
        assert!(result.unwrap().0.motion);
    }

    #[test]
    fn acoustic_observations_skip_path_loss_and_use_distance_m_directly() {
        let inference = LocalInference::new(DEFAULT_HISTORY_LIMIT);
        let mut obs = observation("node-b", -10.0, SignalType::Acoustic);
        obs.metadata.distance_m = Some(3.2);
        obs.metadata.peak_snr = Some(9.0);
        let (link, device) = inference.infer_link(&obs, -10.0, 0.0, None, None);
        assert_eq!(link.attenuation, 0.0);
        assert_eq!(device.estimated_distance, Some(3.2));
        assert!(device.rssi == -10.0);
    }

    #[test]
    fn zone_belief_with_no_crossing_links_is_empty() {
        let belief = infer_zone_belief(&[]);
        assert_eq!(belief.occupied, 0.0);
        assert_eq!(belief.motion, 0.0);
    }

    #[test]
    fn zone_belief_averages_attenuation_and_votes_motion() {
        let a = LinkState { attenuation: 10.0, motion: true, confidence: 1.0 };
        let b = LinkState { attenuation: 30.0, motion: false, confidence: 1.0 };
        let belief = infer_zone_belief(&[&a, &b]);
        assert_eq!(belief.motion, 0.5);
        assert_eq!(belief.occupied, 1.0); // avg attenuation 20 / 20 clamped to 1.0
    }
}
