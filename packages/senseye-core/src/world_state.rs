//! The dynamic overlay on top of a [`FloorPlan`]: per-zone motion with
//! exponential decay, a tracker of active devices, and node liveness.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::NodeRole;
use crate::floorplan::FloorPlan;
use crate::model::{Belief, SignalType, ZoneBelief};

/// Default motion-intensity decay rate (per second).
pub const DEFAULT_MOTION_DECAY: f64 = 0.3;
/// Below this intensity, a zone is considered to have no residual motion.
pub const MOTION_FLOOR: f64 = 0.01;
/// Default eviction age for tracked devices and liveness checks.
pub const DEFAULT_MAX_AGE_SECS: f64 = 60.0;

/// Per-zone motion intensity with exponential decay between observations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MotionState {
    pub zone_motion: BTreeMap<String, f64>,
    pub last_updated: BTreeMap<String, f64>,
}

/// Decays every known zone's intensity by `exp(-decay * dt)`, clamping
/// anything below [`MOTION_FLOOR`] to zero, then merges in `zone_beliefs`
/// by taking the max of the decayed and observed intensity.
pub fn update_motion(
    state: &mut MotionState,
    zone_beliefs: &BTreeMap<String, ZoneBelief>,
    dt: f64,
    decay: f64,
    now: f64,
) {
    let factor = (-decay * dt).exp();
    for intensity in state.zone_motion.values_mut() {
        *intensity *= factor;
        if *intensity < MOTION_FLOOR {
            *intensity = 0.0;
        }
    }

    for (zone, belief) in zone_beliefs {
        let current = state.zone_motion.get(zone).copied().unwrap_or(0.0);
        state.zone_motion.insert(zone.clone(), current.max(belief.motion));
        state.last_updated.insert(zone.clone(), now);
    }
}

/// A mobile device's last-known position and motion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedDevice {
    pub device_id: String,
    pub name: Option<String>,
    pub position: Option<(f64, f64)>,
    pub zone: Option<String>,
    pub moving: bool,
    pub last_seen: f64,
    pub signal_type: SignalType,
}

impl TrackedDevice {
    fn new(device_id: impl Into<String>, now: f64) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            position: None,
            zone: None,
            moving: false,
            last_seen: now,
            signal_type: SignalType::Ble,
        }
    }
}

/// Upsertable, age-evictable registry of tracked devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceTracker {
    devices: BTreeMap<String, TrackedDevice>,
}

impl DeviceTracker {
    /// Upserts `device_id`: fields passed as `Some` overwrite, `None`
    /// fields are left as previously recorded (or absent, on first sight).
    pub fn update(
        &mut self,
        device_id: &str,
        position: Option<(f64, f64)>,
        zone: Option<String>,
        moving: bool,
        signal_type: SignalType,
        name: Option<String>,
        now: f64,
    ) -> &TrackedDevice {
        let entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| TrackedDevice::new(device_id, now));
        if name.is_some() {
            entry.name = name;
        }
        if position.is_some() {
            entry.position = position;
        }
        if zone.is_some() {
            entry.zone = zone;
        }
        entry.moving = moving;
        entry.signal_type = signal_type;
        entry.last_seen = now;
        entry
    }

    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<&TrackedDevice> {
        self.devices.get(device_id)
    }

    /// Devices seen within `max_age` seconds of `now`.
    #[must_use]
    pub fn active(&self, max_age: f64, now: f64) -> Vec<&TrackedDevice> {
        let cutoff = now - max_age;
        self.devices.values().filter(|d| d.last_seen >= cutoff).collect()
    }

    /// Removes every device not seen within `max_age` seconds of `now`.
    pub fn cleanup(&mut self, max_age: f64, now: f64) {
        let cutoff = now - max_age;
        self.devices.retain(|_, d| d.last_seen >= cutoff);
    }
}

/// Liveness record for one mesh peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub name: String,
    pub role: NodeRole,
    pub online: bool,
    pub last_seen: f64,
}

/// The full live runtime view: a floor-plan pointer, motion overlay,
/// device tracker, and node registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldState {
    pub floorplan: Option<FloorPlan>,
    pub motion: MotionState,
    pub devices: DeviceTracker,
    pub nodes: BTreeMap<String, NodeInfo>,
    pub map_age: f64,
    pub timestamp: f64,
}

/// Applies a freshly fused [`Belief`] to the dynamic layer: decays and
/// merges motion, upserts every reported device's moving flag, marks the
/// reporting node online, and recomputes map age from the floor plan's
/// calibration timestamp.
pub fn update_world(state: &mut WorldState, belief: &Belief, dt: f64, now: f64) {
    update_motion(&mut state.motion, &belief.zones, dt, DEFAULT_MOTION_DECAY, now);

    for (device_id, device_belief) in &belief.devices {
        state
            .devices
            .update(device_id, None, None, device_belief.moving, SignalType::Ble, None, now);
    }

    state
        .nodes
        .entry(belief.node_id.clone())
        .and_modify(|node| {
            node.online = true;
            node.last_seen = now;
        })
        .or_insert_with(|| NodeInfo {
            node_id: belief.node_id.clone(),
            name: belief.node_id.clone(),
            role: NodeRole::Fixed,
            online: true,
            last_seen: now,
        });

    state.map_age = state.floorplan.as_ref().map_or(0.0, |plan| now - plan.calibrated_at);
    state.timestamp = now;
}

/// Consumer seam for the dashboard: something that wants an immutable
/// snapshot of [`WorldState`] once per orchestrator cycle. Mirrors this
/// codebase's pattern of defining a platform-facing trait at the boundary
/// (`EventEmitter`) rather than hand-rolling a UI inside the core crate.
pub trait WorldStateSink: Send + Sync {
    fn publish(&self, snapshot: &WorldState);
}

/// Default sink: logs a one-line summary at `info!`. Used headless or
/// whenever no richer sink (terminal dashboard, IPC bridge) is attached.
#[derive(Debug, Default)]
pub struct LoggingWorldStateSink;

impl WorldStateSink for LoggingWorldStateSink {
    fn publish(&self, snapshot: &WorldState) {
        let active_devices = snapshot.devices.active(DEFAULT_MAX_AGE_SECS, snapshot.timestamp).len();
        let online_nodes = snapshot.nodes.values().filter(|n| n.online).count();
        let moving_zones = snapshot
            .motion
            .zone_motion
            .iter()
            .filter(|(_, &intensity)| intensity > MOTION_FLOOR)
            .count();
        log::info!(
            "[world] devices={active_devices} nodes={online_nodes} moving_zones={moving_zones} map_age={:.1}s",
            snapshot.map_age
        );
    }
}

/// The room whose center is nearest `position`, or `None` if the floor
/// plan has no rooms.
#[must_use]
pub fn nearest_zone(floorplan: &FloorPlan, position: (f64, f64)) -> Option<String> {
    floorplan
        .rooms
        .rooms
        .iter()
        .filter_map(|room| room.center.map(|center| (room, center)))
        .map(|(room, center)| {
            let d = ((center.0 - position.0).powi(2) + (center.1 - position.1).powi(2)).sqrt();
            (d, room.name.clone())
        })
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap())
        .map(|(_, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_decays_without_new_observations() {
        let mut state = MotionState::default();
        state.zone_motion.insert("living_room".into(), 1.0);
        update_motion(&mut state, &BTreeMap::new(), 1.0, DEFAULT_MOTION_DECAY, 100.0);
        let decayed = state.zone_motion["living_room"];
        assert!(decayed < 1.0 && decayed > 0.0);
    }

    #[test]
    fn motion_below_the_floor_clamps_to_zero() {
        let mut state = MotionState::default();
        state.zone_motion.insert("hallway".into(), 0.001);
        update_motion(&mut state, &BTreeMap::new(), 1.0, DEFAULT_MOTION_DECAY, 1.0);
        assert_eq!(state.zone_motion["hallway"], 0.0);
    }

    #[test]
    fn new_observations_take_the_max_over_decayed_intensity() {
        let mut state = MotionState::default();
        state.zone_motion.insert("kitchen".into(), 0.1);
        let mut beliefs = BTreeMap::new();
        beliefs.insert("kitchen".to_string(), ZoneBelief { occupied: 0.9, motion: 0.8 });
        update_motion(&mut state, &beliefs, 0.0, DEFAULT_MOTION_DECAY, 5.0);
        assert_eq!(state.zone_motion["kitchen"], 0.8);
    }

    #[test]
    fn device_tracker_preserves_fields_not_present_in_an_update() {
        let mut tracker = DeviceTracker::default();
        tracker.update("phone-1", Some((1.0, 2.0)), Some("kitchen".into()), false, SignalType::Ble, Some("Pixel".into()), 10.0);
        tracker.update("phone-1", None, None, true, SignalType::Ble, None, 11.0);
        let device = tracker.get("phone-1").unwrap();
        assert_eq!(device.position, Some((1.0, 2.0)));
        assert_eq!(device.zone.as_deref(), Some("kitchen"));
        assert!(device.moving);
        assert_eq!(device.last_seen, 11.0);
    }

    #[test]
    fn cleanup_evicts_only_stale_devices() {
        let mut tracker = DeviceTracker::default();
        tracker.update("fresh", None, None, false, SignalType::Ble, None, 100.0);
        tracker.update("stale", None, None, false, SignalType::Ble, None, 0.0);
        tracker.cleanup(DEFAULT_MAX_AGE_SECS, 100.0);
        assert!(tracker.get("fresh").is_some());
        assert!(tracker.get("stale").is_none());
    }

    #[test]
    fn nearest_zone_picks_the_closest_room_center() {
        use crate::topology::{Room, RoomGraph};
        let mut plan = FloorPlan::default();
        plan.rooms = RoomGraph {
            rooms: vec![
                Room { name: "near".into(), center: Some((0.0, 0.0)), node_ids: vec![] },
                Room { name: "far".into(), center: Some((10.0, 10.0)), node_ids: vec![] },
            ],
            connections: vec![],
        };
        assert_eq!(nearest_zone(&plan, (0.5, 0.5)).as_deref(), Some("near"));
    }
}
