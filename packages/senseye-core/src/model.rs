//! Core domain types shared by every subsystem: observations, per-link and
//! per-device belief state, and the periodic broadcast unit (`Belief`).
//!
//! `Observation` follows the "explicit small struct of recognized fields"
//! design note rather than an untyped string map in the hot path; anything
//! not in the recognized set lands in `rest`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The scanning modality that produced an [`Observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    /// WiFi beacon/probe RSSI.
    Wifi,
    /// Bluetooth Low Energy advertisement RSSI.
    Ble,
    /// Acoustic chirp time-of-flight, reported as a synthetic RSSI plus
    /// `metadata.distance_m`.
    Acoustic,
}

/// Recognized, typed metadata fields carried alongside an observation.
/// Fields outside this set (scanner-specific extras) land in `rest`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationMetadata {
    /// WiFi SSID, when known.
    pub ssid: Option<String>,
    /// BLE advertised local name, when known.
    pub name: Option<String>,
    /// Authoritative distance in meters for acoustic observations.
    pub distance_m: Option<f64>,
    /// Matched-filter peak SNR for acoustic observations.
    pub peak_snr: Option<f64>,
    /// Kalman innovation for the filtered sample this observation carries.
    pub innovation: Option<f64>,
    /// Raw (pre-filter) RSSI, preserved alongside the filtered value.
    pub raw_rssi: Option<f64>,
    /// WiFi channel number, when known.
    pub channel: Option<u32>,
    /// Whether this is the currently-associated network (WiFi only).
    pub connected: Option<bool>,
    /// Any remaining scanner-specific fields, kept opaque.
    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

/// One scan sample: a device identifier, its RSSI (or acoustic pseudo-RSSI),
/// a monotonic timestamp, and its signal class plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Stable device identifier — MAC-like for RF, synthetic for acoustic.
    pub device_id: String,
    /// Signed RSSI in dBm, or a placeholder for acoustic observations
    /// (whose authoritative distance lives in `metadata.distance_m`).
    pub rssi: f64,
    /// Unix timestamp in fractional seconds.
    pub timestamp: f64,
    /// Which scanner produced this sample.
    pub signal_type: SignalType,
    /// Typed, partially-opaque metadata bag.
    pub metadata: ObservationMetadata,
}

impl Observation {
    /// Convenience constructor for the common case of no extra metadata.
    pub fn new(device_id: impl Into<String>, rssi: f64, timestamp: f64, signal_type: SignalType) -> Self {
        Self {
            device_id: device_id.into(),
            rssi,
            timestamp,
            signal_type,
            metadata: ObservationMetadata::default(),
        }
    }
}

/// A directed belief about a signal path from this node to one device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkState {
    /// Non-negative excess attenuation in dB relative to a path-loss model.
    pub attenuation: f64,
    /// Whether this link is currently carrying motion.
    pub motion: bool,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// Per-device aggregate belief.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceState {
    /// Latest filtered RSSI in dBm.
    pub rssi: f64,
    /// Estimated distance in meters, when resolvable.
    pub estimated_distance: Option<f64>,
    /// Whether the device is currently moving.
    pub moving: bool,
}

/// Per-room occupancy/motion summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZoneBelief {
    /// Occupancy probability in [0, 1].
    pub occupied: f64,
    /// Motion probability in [0, 1].
    pub motion: f64,
}

/// A node's periodic broadcast unit: identity, sequencing, and everything it
/// currently believes about links, devices, and zones.
///
/// Invariant: `sequence_number` is strictly increasing per `node_id` across
/// the system; receivers drop anything that does not exceed the last value
/// seen for that producer (see [`crate::mesh`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Belief {
    /// Producing node's identity.
    pub node_id: String,
    /// Wall-clock timestamp this belief was produced.
    pub timestamp: f64,
    /// Monotonically increasing sequence number, per `node_id`.
    #[serde(default)]
    pub sequence_number: u64,
    /// Remaining relay hop count (TTL).
    #[serde(default = "default_hop_count")]
    pub hop_count: u32,
    /// Link beliefs, keyed by device/peer id.
    #[serde(default)]
    pub links: BTreeMap<String, LinkState>,
    /// Device beliefs, keyed by device id.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceState>,
    /// Zone beliefs, keyed by zone/room name.
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneBelief>,
    /// Acoustic time-of-flight-derived ranges to peers, in meters.
    #[serde(default)]
    pub acoustic_ranges: BTreeMap<String, f64>,
}

fn default_hop_count() -> u32 {
    3
}

impl Belief {
    /// Creates an empty belief for `node_id` stamped with `timestamp`.
    pub fn new(node_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            sequence_number: 0,
            hop_count: default_hop_count(),
            links: BTreeMap::new(),
            devices: BTreeMap::new(),
            zones: BTreeMap::new(),
            acoustic_ranges: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn belief_round_trips_acoustic_ranges_through_json() {
        let mut belief = Belief::new("node-a", 0.0);
        belief.acoustic_ranges.insert("node-b".into(), 2.75);

        let payload = serde_json::to_string(&belief).unwrap();
        let restored: Belief = serde_json::from_str(&payload).unwrap();
        assert_eq!(restored.acoustic_ranges["node-b"], 2.75);
    }

    #[test]
    fn belief_defaults_hop_count_to_three() {
        let belief = Belief::new("node-a", 0.0);
        assert_eq!(belief.hop_count, 3);
    }
}
