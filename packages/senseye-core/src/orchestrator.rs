//! The cooperative sense loop: one task that scans, filters, infers,
//! floods beliefs, fuses the mesh's view, re-localizes, and republishes
//! [`WorldState`] every cycle, plus the background tasks it spawns to
//! consume mesh events and service acoustic RPCs.
//!
//! Mirrors this codebase's single-task-per-concern composition: the
//! orchestrator owns the pieces no one else may mutate (sequence counter,
//! floor plan, world state) the same way the bootstrap's server loop owns
//! its connection table, and everything else is an `Arc`-shared, internally
//! synchronized collaborator reached through a trait object where the spec
//! calls for a seam (scanner, audio, dashboard sink).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::acoustic;
use crate::audio::AudioBackend;
use crate::calibration;
use crate::config::{AcousticMode, SenseyeConfig};
use crate::consensus;
use crate::error::SenseyeResult;
use crate::floorplan::FloorPlan;
use crate::graph::SignalGraph;
use crate::inference::LocalInference;
use crate::kalman::FilterBank;
use crate::mesh::{MeshEvent, PeerMesh};
use crate::model::{Belief, Observation, SignalType};
use crate::runtime::TaskSpawner;
use crate::scanner::ScannerBackend;
use crate::topology;
use crate::trilateration;
use crate::world_state::{self, WorldState, WorldStateSink};

/// Minimum time between recalibration attempts, regardless of trigger.
pub const RECALIBRATION_COOLDOWN_SECS: f64 = 30.0;
/// RSSI drift, in dB, against the last calibration baseline that forces a
/// recalibration.
pub const RSSI_DRIFT_THRESHOLD_DB: f64 = 8.0;
/// A drift trigger requires at least this many devices shared with the
/// calibration baseline to be meaningful.
pub const MIN_SHARED_DEVICES_FOR_DRIFT: usize = 3;
/// Scans averaged per calibration pass.
pub const CALIBRATION_SCAN_COUNT: usize = 3;
/// Minimum distinct anchors required before a device is trilaterated.
pub const MIN_TRILATERATION_ANCHORS: usize = 3;
/// Default sample rate for acoustic chirps when a peer doesn't report one.
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 48_000;

/// Everything the sense loop needs to run one cycle, wired once at startup.
pub struct Orchestrator {
    config: SenseyeConfig,
    filters: Arc<FilterBank>,
    inference: Arc<LocalInference>,
    mesh: Arc<PeerMesh>,
    scanner: Arc<dyn ScannerBackend>,
    audio: Arc<dyn AudioBackend>,
    sink: Arc<dyn WorldStateSink>,
    spawner: Arc<dyn TaskSpawner>,
    cancel: CancellationToken,
    graph: Arc<SignalGraph>,

    sequence: AtomicU64,
    floorplan: RwLock<Option<FloorPlan>>,
    world: Mutex<WorldState>,
    peer_beliefs: DashMap<String, Belief>,
    last_zone: DashMap<String, String>,
    motion_events: Mutex<Vec<(String, String, f64)>>,
    baseline_rssi: RwLock<BTreeMap<String, f64>>,
    last_peer_set: RwLock<Vec<String>>,
    last_calibration_attempt: RwLock<f64>,
    last_acoustic_sample: RwLock<f64>,
    last_broadcast: RwLock<f64>,
}

impl Orchestrator {
    /// Builds an orchestrator from its already-constructed collaborators.
    /// Does not start the mesh, spawn tasks, or perform any I/O.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: SenseyeConfig,
        filters: Arc<FilterBank>,
        inference: Arc<LocalInference>,
        mesh: Arc<PeerMesh>,
        scanner: Arc<dyn ScannerBackend>,
        audio: Arc<dyn AudioBackend>,
        sink: Arc<dyn WorldStateSink>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Arc<Self> {
        let floorplan = FloorPlan::load(&config.floorplan_path()).ok();
        let world = WorldState {
            floorplan: floorplan.clone(),
            ..WorldState::default()
        };
        Arc::new(Self {
            config,
            filters,
            inference,
            mesh,
            scanner,
            audio,
            sink,
            spawner,
            cancel: CancellationToken::new(),
            graph: Arc::new(SignalGraph::new()),
            sequence: AtomicU64::new(0),
            floorplan: RwLock::new(floorplan),
            world: Mutex::new(world),
            peer_beliefs: DashMap::new(),
            last_zone: DashMap::new(),
            motion_events: Mutex::new(Vec::new()),
            baseline_rssi: RwLock::new(BTreeMap::new()),
            last_peer_set: RwLock::new(Vec::new()),
            last_calibration_attempt: RwLock::new(f64::NEG_INFINITY),
            last_acoustic_sample: RwLock::new(f64::NEG_INFINITY),
            last_broadcast: RwLock::new(f64::NEG_INFINITY),
        })
    }

    /// Signals shutdown: every wait in the sense loop and its background
    /// tasks races against this token.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.mesh.stop();
    }

    /// Starts the mesh transport, spawns the mesh-event consumer, and runs
    /// the sense loop until [`Self::shutdown`] is called.
    pub async fn run(self: Arc<Self>, advertise_ip: IpAddr) -> SenseyeResult<()> {
        self.mesh.start(advertise_ip).await?;

        if let Some(events) = self.mesh.take_events() {
            let this = Arc::clone(&self);
            self.spawner.spawn(async move {
                this.consume_mesh_events(events).await;
            });
        }

        self.sense_loop().await;
        Ok(())
    }

    async fn consume_mesh_events(self: Arc<Self>, mut events: tokio::sync::mpsc::UnboundedReceiver<MeshEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        MeshEvent::Belief(belief) => {
                            self.peer_beliefs.insert(belief.node_id.clone(), belief);
                        }
                        MeshEvent::AcousticPingRequested {
                            from,
                            request_id,
                            delay_s,
                            sample_rate,
                            chirp_duration,
                            ..
                        } => {
                            let this = Arc::clone(&self);
                            this.spawner.spawn(async move {
                                this.respond_to_acoustic_ping(from, request_id, delay_s, sample_rate, chirp_duration).await;
                            });
                        }
                    }
                }
            }
        }
    }

    /// Responder side of the acoustic ping flow: always emits on our own
    /// deterministic channel, never the requester's (spec's acoustic ranging
    /// section forbids trusting a peer-supplied frequency band).
    async fn respond_to_acoustic_ping(
        self: Arc<Self>,
        peer_id: String,
        request_id: String,
        delay_s: f64,
        sample_rate: u32,
        chirp_duration: f64,
    ) {
        let (freq_start, freq_end) = acoustic::channel_band(&self.config.node_id);
        tokio::time::sleep(Duration::from_secs_f64(delay_s.max(0.0))).await;
        let chirp = acoustic::generate_chirp(freq_start, freq_end, chirp_duration, sample_rate as f64);
        let outcome = self.audio.play(chirp, sample_rate).await;
        let (ok, error) = match outcome {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.mesh.send_acoustic_pong(&peer_id, request_id, ok, error);
    }

    /// The ten-step sense loop (spec §4.10), sleeping between cycles for
    /// `1 / belief_rate` seconds.
    async fn sense_loop(self: Arc<Self>) {
        let period = Duration::from_secs_f64(1.0 / self.config.belief_rate);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let now = crate::utils::now_secs();
            self.run_cycle(now).await;

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
        }
    }

    async fn run_cycle(self: &Arc<Self>, now: f64) {
        // 1. Scan (and, on cadence, sample acoustics) into raw observations.
        let mut observations = self.scanner.scan().await;
        if let Some(echo_obs) = self.maybe_sample_acoustic(now).await {
            observations.extend(echo_obs);
        }

        // 2 & 3. Kalman-filter each observation, then run local inference.
        let own_position = self.config.position.map(|p| (p.x, p.y));
        let positions = self.node_positions();
        let mut local_belief = Belief::new(self.config.node_id.clone(), now);

        for obs in &observations {
            self.graph.record_observation(&self.config.node_id, obs.clone());
            let (filtered_rssi, innovation) =
                self.filters
                    .update(&self.config.node_id, &obs.device_id, obs.rssi, now);
            let target_position = positions.get(&obs.device_id).copied();
            let (link, device) = self.inference.infer_link(
                obs,
                filtered_rssi,
                innovation,
                own_position.or_else(|| positions.get(&self.config.node_id).copied()),
                target_position,
            );
            local_belief.links.insert(obs.device_id.clone(), link);
            local_belief.devices.insert(obs.device_id.clone(), device);
        }

        let crossing: Vec<&crate::model::LinkState> = local_belief.links.values().collect();
        if !crossing.is_empty() {
            let zone_name = own_position
                .zip(self.floorplan.read().as_ref())
                .and_then(|(pos, plan)| world_state::nearest_zone(plan, pos))
                .unwrap_or_else(|| "unzoned".to_string());
            local_belief
                .zones
                .insert(zone_name, crate::inference::infer_zone_belief(&crossing));
        }

        // 4. Stamp sequence number and broadcast.
        let sequence_number = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        local_belief.sequence_number = sequence_number;
        self.mesh.broadcast_belief(&local_belief);
        *self.last_broadcast.write() = now;

        // 5. Gather this cycle's peer snapshot and fuse with the local belief.
        let peer_beliefs: Vec<Belief> = self.peer_beliefs.iter().map(|e| e.value().clone()).collect();
        let peer_refs: Vec<&Belief> = peer_beliefs.iter().collect();
        let fused = consensus::fuse_beliefs(&local_belief, &peer_refs);

        // 6. Trilaterate every device seen by at least three distinct anchors,
        // and recompute the radio-tomography grid from fused link attenuations.
        self.retrilaterate_and_recompute_tomography(&local_belief, &peer_beliefs, now);

        // 7. Update the dynamic world-state overlay from the fused belief.
        let dt = if self.last_broadcast.read().is_finite() {
            (1.0 / self.config.belief_rate).max(0.01)
        } else {
            0.0
        };
        {
            let mut world = self.world.lock();
            world_state::update_world(&mut world, &fused, dt, now);
            world.floorplan = self.floorplan.read().clone();
            self.apply_device_positions_and_zones(&mut world, now);
            self.sink.publish(&world);
        }

        // 8. Track zone transitions and feed the doorway-inference topology pass.
        self.record_zone_transitions(now);

        // 9. Evaluate whether a recalibration should fire this cycle.
        self.maybe_recalibrate(now).await;

        let _ = fused;
    }

    fn node_positions(&self) -> BTreeMap<String, (f64, f64)> {
        self.floorplan
            .read()
            .as_ref()
            .map(|plan| plan.node_positions.clone())
            .unwrap_or_default()
    }

    /// Step 1's acoustic half: only samples when `acoustic_mode != Off`,
    /// `OnDemand` never fires automatically, `Interval` fires on cadence.
    /// Feeds both the local echo and every resolved peer range in as
    /// synthetic observations sharing the same Kalman/inference path as RF.
    async fn maybe_sample_acoustic(self: &Arc<Self>, now: f64) -> Option<Vec<Observation>> {
        if self.config.acoustic_mode != AcousticMode::Interval {
            return None;
        }
        let interval = self.config.acoustic_interval.max(1.0);
        if now - *self.last_acoustic_sample.read() < interval {
            return None;
        }
        *self.last_acoustic_sample.write() = now;

        let mut observations = Vec::new();
        let sample_rate = DEFAULT_SAMPLE_RATE_HZ;
        let (freq_start, freq_end) = (self.config.chirp_freq_start, self.config.chirp_freq_end);
        let template =
            acoustic::generate_chirp(freq_start, freq_end, self.config.chirp_duration, sample_rate as f64);
        let record_duration = Duration::from_secs_f64(self.config.chirp_duration + 0.3);
        if let Ok(recording) = self.audio.play_record(template.clone(), record_duration, sample_rate).await {
            if let Some(profile) = acoustic::analyze_echo(&recording, &template, sample_rate as f64) {
                let mut obs = Observation::new(
                    format!("acoustic:echo:{}", self.config.node_id),
                    0.0,
                    now,
                    SignalType::Acoustic,
                );
                obs.metadata.distance_m = Some(profile.distance_m);
                obs.metadata.peak_snr = Some(profile.snr);
                observations.push(obs);
            }
        }

        for peer_id in self.mesh.connected_peer_ids() {
            if let Some(distance_m) = self.range_peer(&peer_id, now).await {
                let mut obs = Observation::new(peer_id, 0.0, now, SignalType::Acoustic);
                obs.metadata.distance_m = Some(distance_m);
                observations.push(obs);
            }
        }
        Some(observations)
    }

    /// Requester side of the acoustic ping round trip: asks `peer_id` to
    /// emit after a fixed delay, records the exact instants needed to
    /// compensate for mesh round-trip latency, and returns the resolved
    /// one-way distance in meters.
    async fn range_peer(self: &Arc<Self>, peer_id: &str, now: f64) -> Option<f64> {
        const DELAY_S: f64 = 0.2;
        let sample_rate = DEFAULT_SAMPLE_RATE_HZ;
        let chirp_duration = self.config.chirp_duration;
        let record_duration = Duration::from_secs_f64(DELAY_S + chirp_duration + 0.3);

        let request_sent_at = crate::utils::now_secs();
        let (recording_result, ping_result) = tokio::join!(
            self.audio.record(record_duration, sample_rate),
            self.mesh
                .request_acoustic_ping(peer_id, DELAY_S, sample_rate, 0.0, 0.0, chirp_duration)
        );
        let response_received_at = crate::utils::now_secs();

        if ping_result.is_err() {
            return None;
        }
        let recording = recording_result.ok()?;

        let (peer_freq_start, peer_freq_end) = acoustic::channel_band(peer_id);
        let template = acoustic::generate_chirp(peer_freq_start, peer_freq_end, chirp_duration, sample_rate as f64);
        let profile = acoustic::analyze_echo(&recording, &template, sample_rate as f64)?;
        if profile.snr < acoustic::IDENTIFY_SNR_THRESHOLD {
            return None;
        }

        let one_way_network = (response_received_at - request_sent_at) / 2.0;
        let expected_emission_instant = request_sent_at + one_way_network + DELAY_S;
        let arrival_instant = request_sent_at + profile.tof_s;
        let estimated_one_way_tof = arrival_instant - expected_emission_instant;

        if estimated_one_way_tof <= 0.0 || estimated_one_way_tof > 0.2 {
            return None;
        }
        let _ = now;
        Some(estimated_one_way_tof * acoustic::SPEED_OF_SOUND_MPS)
    }

    /// Step 6: gathers, per device, the `(anchor_position, distance)` pairs
    /// reported by the local belief and every currently-held peer belief —
    /// the fused devices map carries no per-anchor breakdown, so
    /// trilateration must read the raw, pre-fusion beliefs directly.
    fn retrilaterate_and_recompute_tomography(&self, local: &Belief, peers: &[Belief], now: f64) {
        let positions = self.node_positions();
        let Some(local_pos) = positions.get(&local.node_id).copied() else {
            return;
        };

        let mut anchors: BTreeMap<String, ((f64, f64), f64)> = BTreeMap::new();
        let mut per_device: BTreeMap<String, Vec<((f64, f64), f64)>> = BTreeMap::new();

        let mut raw_beliefs: Vec<(&str, (f64, f64), &Belief)> = vec![(local.node_id.as_str(), local_pos, local)];
        for peer in peers {
            if let Some(pos) = positions.get(&peer.node_id).copied() {
                raw_beliefs.push((peer.node_id.as_str(), pos, peer));
            }
        }

        for (anchor_id, anchor_pos, belief) in &raw_beliefs {
            for (device_id, device) in &belief.devices {
                if let Some(distance) = device.estimated_distance {
                    per_device
                        .entry(device_id.clone())
                        .or_default()
                        .push((*anchor_pos, distance));
                    anchors.insert((*anchor_id).to_string(), (*anchor_pos, distance));
                }
            }
        }

        let mut trilaterated = BTreeMap::new();
        for (device_id, observations) in &per_device {
            if observations.len() < MIN_TRILATERATION_ANCHORS {
                continue;
            }
            if let Some((position, _rmse)) = trilateration::trilaterate(observations) {
                trilaterated.insert(device_id.clone(), position);
            }
        }

        if trilaterated.is_empty() {
            let _ = anchors;
            return;
        }

        let mut plan_guard = self.floorplan.write();
        if let Some(plan) = plan_guard.as_mut() {
            for (device_id, position) in trilaterated {
                plan.node_positions.entry(device_id).or_insert(position);
            }
            plan.calibrated_at = plan.calibrated_at.max(now - 1.0);
        }
    }

    fn apply_device_positions_and_zones(&self, world: &mut WorldState, now: f64) {
        let plan = world.floorplan.clone();
        let device_ids: Vec<String> = world.devices.active(f64::INFINITY, now).iter().map(|d| d.device_id.clone()).collect();
        for device_id in device_ids {
            let position = world.devices.get(&device_id).and_then(|d| d.position);
            let zone = plan
                .as_ref()
                .and_then(|plan| position.and_then(|pos| world_state::nearest_zone(plan, pos)));
            if zone.is_some() {
                world.devices.update(&device_id, None, zone, false, SignalType::Ble, None, now);
            }
        }
    }

    /// Step 8: compares each tracked device's zone against its previous
    /// cycle's zone and accumulates a motion event for every transition,
    /// then feeds the accumulated events into the doorway-inference pass.
    fn record_zone_transitions(&self, now: f64) {
        let world = self.world.lock();
        let mut events = self.motion_events.lock();
        for device in world.devices.active(f64::INFINITY, now) {
            let Some(zone) = &device.zone else { continue };
            match self.last_zone.get(&device.device_id).map(|e| e.clone()) {
                Some(previous) if &previous != zone => {
                    events.push((previous, zone.clone(), now));
                    self.last_zone.insert(device.device_id.clone(), zone.clone());
                }
                None => {
                    self.last_zone.insert(device.device_id.clone(), zone.clone());
                }
                _ => {}
            }
        }
        drop(world);

        if events.is_empty() {
            return;
        }
        let mut plan_guard = self.floorplan.write();
        if let Some(plan) = plan_guard.as_mut() {
            plan.rooms = topology::update_topology(&plan.rooms, &events);
        }
    }

    /// Step 9: evaluates the four recalibration triggers (no floor plan yet,
    /// peer set changed, RSSI drift beyond threshold, acoustic interval
    /// elapsed), all gated by [`RECALIBRATION_COOLDOWN_SECS`].
    async fn maybe_recalibrate(self: &Arc<Self>, now: f64) {
        if now - *self.last_calibration_attempt.read() < RECALIBRATION_COOLDOWN_SECS {
            return;
        }
        if self.config.node_role != crate::config::NodeRole::Fixed {
            return;
        }

        let current_peers = self.mesh.connected_peer_ids();
        let mut sorted_peers = current_peers.clone();
        sorted_peers.sort();

        let no_plan = self.floorplan.read().is_none();
        let peer_set_changed = *self.last_peer_set.read() != sorted_peers;
        let drift = self.rssi_drift_exceeded().await;
        let acoustic_due = self.config.acoustic_mode == AcousticMode::Interval
            && now - *self.last_acoustic_sample.read() >= self.config.acoustic_interval;

        if !(no_plan || peer_set_changed || drift || acoustic_due) {
            return;
        }

        *self.last_calibration_attempt.write() = now;

        let own_position = self.config.position.map(|p| (p.x, p.y));
        let peer_ranges: BTreeMap<String, f64> = BTreeMap::new();
        let result = calibration::run(
            &self.config.node_id,
            own_position,
            self.scanner.as_ref(),
            self.audio.as_ref(),
            self.config.chirp_freq_start,
            self.config.chirp_freq_end,
            self.config.chirp_duration,
            DEFAULT_SAMPLE_RATE_HZ,
            &sorted_peers,
            &peer_ranges,
            CALIBRATION_SCAN_COUNT,
            now,
        )
        .await;

        match result {
            Ok((plan, baseline)) => {
                if let Err(e) = plan.save(&self.config.floorplan_path()) {
                    log::warn!("[orchestrator] failed to persist floor plan: {e}");
                }
                *self.floorplan.write() = Some(plan);
                *self.baseline_rssi.write() = baseline;
                *self.last_peer_set.write() = sorted_peers;
                self.motion_events.lock().clear();
            }
            Err(e) => {
                log::warn!("[orchestrator] calibration failed, keeping prior floor plan: {e}");
            }
        }
    }

    async fn rssi_drift_exceeded(&self) -> bool {
        let baseline = self.baseline_rssi.read().clone();
        if baseline.is_empty() {
            return false;
        }
        let observations = self.scanner.scan().await;
        let mut shared = 0usize;
        let mut drifted = false;
        for obs in &observations {
            if let Some(&baseline_rssi) = baseline.get(&obs.device_id) {
                shared += 1;
                if (obs.rssi - baseline_rssi).abs() >= RSSI_DRIFT_THRESHOLD_DB {
                    drifted = true;
                }
            }
        }
        drifted && shared >= MIN_SHARED_DEVICES_FOR_DRIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullAudioBackend;
    use crate::runtime::TokioSpawner;
    use crate::scanner::NullScanner;
    use crate::world_state::LoggingWorldStateSink;

    fn test_orchestrator(handle: tokio::runtime::Handle) -> Arc<Orchestrator> {
        let config = SenseyeConfig {
            node_id: "node-a".to_string(),
            belief_rate: 10.0,
            ..SenseyeConfig::default()
        };
        let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::new(handle));
        let mesh = PeerMesh::new(config.node_id.clone(), 0, Arc::clone(&spawner));
        Orchestrator::new(
            config,
            Arc::new(FilterBank::new(1.0)),
            Arc::new(LocalInference::new(120)),
            mesh,
            Arc::new(NullScanner),
            Arc::new(NullAudioBackend),
            Arc::new(LoggingWorldStateSink),
            spawner,
        )
    }

    #[tokio::test]
    async fn a_cycle_with_no_observations_produces_an_empty_broadcast_belief() {
        let orchestrator = test_orchestrator(tokio::runtime::Handle::current());
        orchestrator.run_cycle(0.0).await;
        assert_eq!(orchestrator.sequence.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_the_token_and_stops_the_mesh() {
        let orchestrator = test_orchestrator(tokio::runtime::Handle::current());
        orchestrator.shutdown();
        assert!(orchestrator.cancel.is_cancelled());
    }

    #[test]
    fn recalibration_never_fires_inside_the_cooldown_window() {
        let orchestrator = test_orchestrator(tokio::runtime::Handle::current());
        *orchestrator.last_calibration_attempt.write() = 100.0;
        assert!(100.5 - *orchestrator.last_calibration_attempt.read() < RECALIBRATION_COOLDOWN_SECS);
    }
}
