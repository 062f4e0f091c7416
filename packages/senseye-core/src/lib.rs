//! Senseye Core - shared library for Senseye, a distributed passive RF
//! sensing daemon.
//!
//! Each node in a Senseye mesh runs this crate's orchestrator: it scans WiFi
//! and BLE RSSI (and, optionally, acoustic chirps), filters and interprets
//! those observations locally, floods its belief across a gossip mesh,
//! fuses its own belief with its peers', and maintains a shared floor plan
//! and live occupancy/motion overlay.
//!
//! # Architecture
//!
//! - [`model`]: the observation/belief wire and state types shared by every
//!   other module.
//! - [`kalman`]: adaptive per-link Kalman filtering of raw RSSI.
//! - [`inference`]: turns a filtered observation into a link/device belief.
//! - [`consensus`]: fuses a local belief with peer beliefs.
//! - [`mesh`]: mDNS discovery and gossip-flooded TCP sessions between nodes.
//! - [`protocol`]: the newline-delimited JSON wire framing the mesh speaks.
//! - [`trilateration`]: robust multi-anchor position solving.
//! - [`tomography`]: radio-tomographic attenuation grid reconstruction.
//! - [`layout`]: classical MDS self-localization and anchor alignment.
//! - [`topology`]: wall detection and room/doorway graph inference.
//! - [`floorplan`]: the persisted floor plan and its on-disk format.
//! - [`calibration`]: the pipeline that turns scans into a [`floorplan::FloorPlan`].
//! - [`acoustic`]: chirp generation, matched filtering, and channel assignment.
//! - [`world_state`]: the live motion/device/node overlay and its dashboard seam.
//! - [`orchestrator`]: the cooperative sense loop tying every module together.
//! - [`scanner`] / [`audio`]: platform I/O seams (WiFi/BLE scanning, chirp playback).
//! - [`context`]: local network/IP detection.
//! - [`config`]: node configuration, defaults, and TOML loading.
//! - [`error`]: centralized error types.
//! - [`bootstrap`]: the composition root wiring a loaded config into a running node.
//!
//! # Abstraction Traits
//!
//! - [`runtime::TaskSpawner`]: spawning background tasks.
//! - [`context::IpDetector`]: local IP detection.
//! - [`scanner::ScannerBackend`]: WiFi/BLE scanning.
//! - [`audio::AudioBackend`]: acoustic chirp playback/recording.
//! - [`world_state::WorldStateSink`]: dashboard/UI consumption of world-state snapshots.
//!
//! Each trait has a null or loopback implementation suitable for tests; a
//! platform layer supplies the real ones.

#![warn(clippy::all)]

pub mod acoustic;
pub mod audio;
pub mod bootstrap;
pub mod calibration;
pub mod config;
pub mod consensus;
pub mod context;
pub mod error;
pub mod floorplan;
pub mod graph;
pub mod inference;
pub mod kalman;
pub mod layout;
mod mdns_advertise;
pub mod mesh;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod runtime;
pub mod scanner;
pub mod tomography;
pub mod topology;
pub mod trilateration;
pub mod utils;
pub mod world_state;

// Re-export commonly used types at the crate root.
pub use acoustic::{channel_band, channel_for_node};
pub use audio::{AudioBackend, AudioError, NullAudioBackend};
pub use bootstrap::{bootstrap_node, BootstrappedNode};
pub use config::{AcousticMode, NodeRole, SenseyeConfig};
pub use consensus::fuse_beliefs;
pub use context::{IpDetector, LocalIpDetector, NetworkError};
pub use error::{ErrorCode, SenseyeError, SenseyeResult};
pub use floorplan::FloorPlan;
pub use kalman::{FilterBank, KalmanFilter1D};
pub use mesh::{MeshError, MeshEvent, PeerMesh};
pub use model::{Belief, DeviceState, LinkState, Observation, SignalType, ZoneBelief};
pub use orchestrator::Orchestrator;
pub use runtime::{TaskSpawner, TokioSpawner};
pub use scanner::{LoopbackScanner, NullScanner, ScannerBackend};
pub use world_state::{WorldState, WorldStateSink};
