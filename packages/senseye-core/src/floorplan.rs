//! The persisted floor plan: node positions, walls, rooms, optional
//! attenuation grid, and the on-disk JSON layout those form together.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SenseyeError, SenseyeResult};
use crate::topology::{RoomGraph, WallSegment};

/// Default drift threshold, in meters, for [`FloorPlan::needs_update`].
pub const DEFAULT_DRIFT_THRESHOLD_M: f64 = 2.0;

/// The persisted floor plan: the compatibility surface is the JSON layout
/// below, matched field-for-field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloorPlan {
    pub node_positions: BTreeMap<String, (f64, f64)>,
    pub wall_segments: Vec<WallSegment>,
    pub rooms: RoomGraph,
    pub bounds: (f64, f64, f64, f64),
    pub labels: BTreeMap<String, String>,
    /// Row-major, rows along y; absent until a tomographic pass has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attenuation_grid: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attenuation_resolution: Option<f64>,
    pub calibrated_at: f64,
}

impl FloorPlan {
    /// Serializes this plan to pretty JSON and writes it to `path`,
    /// creating parent directories as needed. Writes to a sibling temp file
    /// and renames over `path` so a reader never observes a partial file.
    pub fn save(&self, path: &Path) -> SenseyeResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SenseyeError::Calibration(format!("failed to serialize floor plan: {e}")))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json + "\n")?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Loads a floor plan previously written by [`Self::save`].
    pub fn load(path: &Path) -> SenseyeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| SenseyeError::Calibration(format!("failed to parse floor plan: {e}")))
    }

    /// True if any pairwise node distance has drifted beyond `threshold`
    /// relative to `current_distances` (node order: sorted node ids). A
    /// dimension mismatch (topology has changed) also counts as drift.
    #[must_use]
    pub fn needs_update(&self, current_distances: &[Vec<f64>], threshold: f64) -> bool {
        let node_ids: Vec<&String> = self.node_positions.keys().collect();
        let n = node_ids.len();
        if n < 2 {
            return false;
        }
        if current_distances.len() != n || current_distances.iter().any(|row| row.len() != n) {
            return true;
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let pi = self.node_positions[node_ids[i]];
                let pj = self.node_positions[node_ids[j]];
                let plan_dist = ((pi.0 - pj.0).powi(2) + (pi.1 - pj.1).powi(2)).sqrt();
                if (plan_dist - current_distances[i][j]).abs() > threshold {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Connection, Material, Room};

    fn sample_plan() -> FloorPlan {
        let mut node_positions = BTreeMap::new();
        node_positions.insert("node-a".to_string(), (0.0, 0.0));
        node_positions.insert("node-b".to_string(), (3.0, 0.0));
        let mut labels = BTreeMap::new();
        labels.insert("node-a".to_string(), "Living Room AP".to_string());

        FloorPlan {
            node_positions,
            wall_segments: vec![WallSegment {
                start: (1.5, -1.0),
                end: (1.5, 1.0),
                attenuation_db: 6.0,
                material: Material::Wood,
            }],
            rooms: RoomGraph {
                rooms: vec![Room { name: "room_0".into(), center: Some((0.0, 0.0)), node_ids: vec!["node-a".into()] }],
                connections: vec![Connection { room_a: "room_0".into(), room_b: "room_1".into(), doorway_position: None }],
            },
            bounds: (-2.0, -2.0, 5.0, 2.0),
            labels,
            attenuation_grid: Some(vec![vec![0.0, 1.5], vec![0.2, 0.0]]),
            attenuation_resolution: Some(0.5),
            calibrated_at: 1_700_000_000.0,
        }
    }

    #[test]
    fn round_trips_through_json_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floorplan.json");
        let plan = sample_plan();
        plan.save(&path).unwrap();
        let loaded = FloorPlan::load(&path).unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn needs_update_detects_drift_beyond_threshold() {
        let plan = sample_plan();
        let current = vec![vec![0.0, 6.0], vec![6.0, 0.0]];
        assert!(plan.needs_update(&current, DEFAULT_DRIFT_THRESHOLD_M));
    }

    #[test]
    fn needs_update_tolerates_small_drift() {
        let plan = sample_plan();
        let current = vec![vec![0.0, 3.5], vec![3.5, 0.0]];
        assert!(!plan.needs_update(&current, DEFAULT_DRIFT_THRESHOLD_M));
    }

    #[test]
    fn needs_update_is_false_with_fewer_than_two_nodes() {
        let mut plan = FloorPlan::default();
        plan.node_positions.insert("solo".to_string(), (0.0, 0.0));
        assert!(!plan.needs_update(&[], DEFAULT_DRIFT_THRESHOLD_M));
    }
}
