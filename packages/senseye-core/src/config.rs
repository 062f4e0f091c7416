//! Node configuration: defaults, TOML file loading, and override application.
//!
//! Mirrors the "defaults → file overrides → CLI overrides" merge order used
//! throughout this codebase's configuration layer, with TOML in place of
//! YAML to match the on-disk format this daemon's external interface
//! mandates (`~/.senseye/config.toml`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SenseyeError, SenseyeResult};

/// Default mesh TCP port.
pub const DEFAULT_MESH_PORT: u16 = 5483;

/// Floor applied to `belief_rate` so the orchestrator never busy-loops.
pub const MIN_BELIEF_RATE_HZ: f64 = 0.1;

/// Whether a node participates in calibration (fixed) or only reports (mobile).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs the calibration pipeline and anchors the floor plan.
    Fixed,
    /// Reports observations but never calibrates.
    Mobile,
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Fixed
    }
}

impl std::str::FromStr for NodeRole {
    type Err = SenseyeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "mobile" => Ok(Self::Mobile),
            other => Err(SenseyeError::Config(format!(
                "unknown node_role '{other}', expected 'fixed' or 'mobile'"
            ))),
        }
    }
}

/// Acoustic chirp sampling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcousticMode {
    /// No acoustic sampling at all.
    Off,
    /// Only sampled when explicitly requested (the `calibrate` subcommand).
    OnDemand,
    /// Sampled automatically on a fixed interval.
    Interval,
}

impl Default for AcousticMode {
    fn default() -> Self {
        Self::Off
    }
}

/// Parses a CLI/config `acoustic_mode` value: `"off"`, `"on-demand"`, or a
/// duration string (`"10m"`, `"1h"`, a bare number of seconds) which implies
/// `Interval` mode and also sets `acoustic_interval`.
pub fn parse_acoustic_mode(s: &str) -> (AcousticMode, Option<f64>) {
    match s {
        "off" => (AcousticMode::Off, None),
        "on-demand" => (AcousticMode::OnDemand, None),
        duration => (AcousticMode::Interval, parse_duration_secs(duration)),
    }
}

/// Parses a duration string with an optional `s`/`m`/`h` suffix into seconds.
pub fn parse_duration_secs(s: &str) -> Option<f64> {
    let s = s.trim();
    let (value, multiplier) = if let Some(prefix) = s.strip_suffix('h') {
        (prefix, 3600.0)
    } else if let Some(prefix) = s.strip_suffix('m') {
        (prefix, 60.0)
    } else if let Some(prefix) = s.strip_suffix('s') {
        (prefix, 1.0)
    } else {
        (s, 1.0)
    };
    value.trim().parse::<f64>().ok().map(|v| v * multiplier)
}

/// A fixed-node anchor position, in meters, on the floor plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
}

/// Full node configuration, loaded from `config.toml` and CLI/env overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenseyeConfig {
    /// Stable identity for this node, used in gossip dedup and the floor plan.
    pub node_id: String,
    /// Human-readable label, defaults to `node_id` when empty.
    pub node_name: String,
    /// Whether this node calibrates (fixed) or only reports (mobile).
    pub node_role: NodeRole,
    /// Optional known anchor position for fixed nodes.
    pub position: Option<Position>,

    /// Whether the WiFi RSSI scanner is enabled.
    pub wifi_enabled: bool,
    /// Whether the BLE scanner is enabled.
    pub ble_enabled: bool,
    /// Seconds between WiFi scans.
    pub scan_interval: f64,
    /// Seconds a BLE scan window lasts.
    pub ble_duration: f64,

    /// Acoustic chirp sampling mode.
    pub acoustic_mode: AcousticMode,
    /// Seconds between acoustic samples in `Interval` mode.
    pub acoustic_interval: f64,
    /// Fallback chirp start frequency in Hz.
    pub chirp_freq_start: f64,
    /// Fallback chirp end frequency in Hz.
    pub chirp_freq_end: f64,
    /// Fallback chirp duration in seconds.
    pub chirp_duration: f64,

    /// TCP port the gossip mesh listens on.
    pub mesh_port: u16,
    /// Target belief broadcast rate in Hz (floored at [`MIN_BELIEF_RATE_HZ`]).
    pub belief_rate: f64,

    /// Whether a dashboard sink should be attached.
    pub ui_enabled: bool,
    /// Dashboard refresh interval in seconds.
    pub ui_refresh: f64,

    /// Directory for persistent state (`floorplan.json`, config.toml).
    pub data_dir: PathBuf,
}

impl Default for SenseyeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            node_name: String::new(),
            node_role: NodeRole::Fixed,
            position: None,
            wifi_enabled: true,
            ble_enabled: true,
            scan_interval: 1.0,
            ble_duration: 2.0,
            acoustic_mode: AcousticMode::Off,
            acoustic_interval: 600.0,
            chirp_freq_start: 18_000.0,
            chirp_freq_end: 22_000.0,
            chirp_duration: 0.01,
            mesh_port: DEFAULT_MESH_PORT,
            belief_rate: 1.0,
            ui_enabled: true,
            ui_refresh: 1.0,
            data_dir: default_data_dir(),
        }
    }
}

fn default_node_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..12].to_string()
}

fn default_data_dir() -> PathBuf {
    dirs_data_dir().join(".senseye")
}

/// Best-effort home directory lookup without pulling in a `dirs` dependency;
/// falls back to the current directory if `HOME` is unset.
fn dirs_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl SenseyeConfig {
    /// Path to the persisted floor plan under `data_dir`.
    #[must_use]
    pub fn floorplan_path(&self) -> PathBuf {
        self.data_dir.join("floorplan.json")
    }

    /// Path to the config file under `data_dir`.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Ensures `node_name` defaults to `node_id` and `belief_rate` is floored.
    pub fn normalize(&mut self) {
        if self.node_name.is_empty() {
            self.node_name = self.node_id.clone();
        }
        if self.belief_rate < MIN_BELIEF_RATE_HZ {
            self.belief_rate = MIN_BELIEF_RATE_HZ;
        }
    }

    /// Loads a `config.toml` file if it exists, falling back to defaults.
    ///
    /// A missing file is not an error — matching the original prototype's
    /// `load_config_file`, which returns an empty mapping rather than failing
    /// when the file has never been written (first run).
    pub fn load(path: &Path) -> SenseyeResult<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)
                .map_err(|e| SenseyeError::Config(format!("failed to parse {}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.normalize();
        Ok(config)
    }

    /// Serializes this configuration back to TOML text.
    pub fn to_toml(&self) -> SenseyeResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SenseyeError::Config(format!("failed to serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_normalizes_node_name() {
        let mut config = SenseyeConfig::default();
        config.node_name.clear();
        config.normalize();
        assert_eq!(config.node_name, config.node_id);
    }

    #[test]
    fn belief_rate_is_floored() {
        let mut config = SenseyeConfig::default();
        config.belief_rate = 0.01;
        config.normalize();
        assert_eq!(config.belief_rate, MIN_BELIEF_RATE_HZ);
    }

    #[test]
    fn parse_acoustic_mode_duration_strings() {
        assert_eq!(parse_duration_secs("10m"), Some(600.0));
        assert_eq!(parse_duration_secs("1h"), Some(3600.0));
        assert_eq!(parse_duration_secs("90s"), Some(90.0));
        assert_eq!(parse_duration_secs("45"), Some(45.0));
    }

    #[test]
    fn parse_acoustic_mode_keywords() {
        assert_eq!(parse_acoustic_mode("off").0, AcousticMode::Off);
        assert_eq!(parse_acoustic_mode("on-demand").0, AcousticMode::OnDemand);
        let (mode, interval) = parse_acoustic_mode("10m");
        assert_eq!(mode, AcousticMode::Interval);
        assert_eq!(interval, Some(600.0));
    }

    #[test]
    fn node_role_from_str_rejects_unknown() {
        assert!("fixed".parse::<NodeRole>().is_ok());
        assert!("bogus".parse::<NodeRole>().is_err());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = SenseyeConfig::load(&path).unwrap();
        assert_eq!(config.mesh_port, DEFAULT_MESH_PORT);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = SenseyeConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: SenseyeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mesh_port, config.mesh_port);
        assert_eq!(parsed.node_id, config.node_id);
    }
}
