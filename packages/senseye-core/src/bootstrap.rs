//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage

use std::net::IpAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audio::{AudioBackend, NullAudioBackend};
use crate::context::{IpDetector, LocalIpDetector, NetworkError};
use crate::error::{SenseyeError, SenseyeResult};
use crate::inference::LocalInference;
use crate::kalman::FilterBank;
use crate::mesh::PeerMesh;
use crate::orchestrator::Orchestrator;
use crate::runtime::TokioSpawner;
use crate::scanner::{NullScanner, ScannerBackend};
use crate::world_state::{LoggingWorldStateSink, WorldStateSink};
use crate::SenseyeConfig;

/// Container for one bootstrapped node.
///
/// Holds the wired [`Orchestrator`] plus the pieces `main` needs to start
/// and stop it. Scanner, audio, and dashboard-sink fields are the platform
/// seams the desktop/headless entry points replace before calling
/// [`bootstrap_node`].
pub struct BootstrappedNode {
    /// The wired sense loop, not yet running.
    pub orchestrator: Arc<Orchestrator>,
    /// The address advertised over mDNS and bound by the mesh listener.
    pub advertise_ip: IpAddr,
    /// Cancellation token shared with the orchestrator for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Task spawner used for every background task this node runs.
    pub spawner: Arc<TokioSpawner>,
}

impl BootstrappedNode {
    /// Starts the mesh and runs the sense loop until [`Self::shutdown`] is
    /// called from another task.
    pub async fn run(&self) -> SenseyeResult<()> {
        Arc::clone(&self.orchestrator).run(self.advertise_ip).await
    }

    /// Signals graceful shutdown: cancels the shared token and stops the mesh.
    pub fn shutdown(&self) {
        log::info!("[bootstrap] beginning graceful shutdown");
        self.cancel_token.cancel();
        self.orchestrator.shutdown();
        log::info!("[bootstrap] shutdown complete");
    }
}

/// Bootstraps a node's services with the platform's scanner, audio backend,
/// and dashboard sink injected. Falls back to null/logging implementations
/// for any seam left `None`, which is what headless/test runs want.
///
/// This is the composition root where all services are instantiated and
/// wired together. The wiring order matters - services are created in
/// dependency order:
///
/// 1. Local IP detection (needed to advertise the mesh over mDNS)
/// 2. The gossip mesh (depends on node id, port, task spawner)
/// 3. The filter bank and local-inference engine (stateless until first use)
/// 4. The orchestrator (depends on all of the above plus the scanner, audio,
///    and dashboard seams)
///
/// # Errors
///
/// Returns an error if the local IP address cannot be detected.
pub fn bootstrap_node(
    config: SenseyeConfig,
    scanner: Option<Arc<dyn ScannerBackend>>,
    audio: Option<Arc<dyn AudioBackend>>,
    sink: Option<Arc<dyn WorldStateSink>>,
) -> SenseyeResult<BootstrappedNode> {
    bootstrap_node_with_ip_detector(config, scanner, audio, sink, LocalIpDetector::arc())
}

/// As [`bootstrap_node`], but with the IP detector injected — used by tests
/// that need a fixed advertise address instead of a real network interface.
pub fn bootstrap_node_with_ip_detector(
    config: SenseyeConfig,
    scanner: Option<Arc<dyn ScannerBackend>>,
    audio: Option<Arc<dyn AudioBackend>>,
    sink: Option<Arc<dyn WorldStateSink>>,
    ip_detector: Arc<dyn IpDetector>,
) -> SenseyeResult<BootstrappedNode> {
    let spawner = Arc::new(TokioSpawner::current());
    let cancel_token = CancellationToken::new();

    let advertise_ip: IpAddr = ip_detector
        .detect()
        .map_err(|e: NetworkError| SenseyeError::Config(format!("failed to detect local IP: {e}")))?
        .parse()
        .map_err(|e| SenseyeError::Config(format!("local IP detector returned an unparseable address: {e}")))?;

    let mesh = PeerMesh::new(config.node_id.clone(), config.mesh_port, Arc::clone(&spawner) as _);

    let filters = Arc::new(FilterBank::new(1.0 / config.belief_rate.max(0.1)));
    let inference = Arc::new(LocalInference::new(crate::inference::DEFAULT_HISTORY_LIMIT));

    let scanner = scanner.unwrap_or_else(|| Arc::new(NullScanner));
    let audio = audio.unwrap_or_else(|| Arc::new(NullAudioBackend));
    let sink: Arc<dyn WorldStateSink> = sink.unwrap_or_else(|| Arc::new(LoggingWorldStateSink));

    let orchestrator = Orchestrator::new(
        config,
        filters,
        inference,
        mesh,
        scanner,
        audio,
        sink,
        Arc::clone(&spawner) as _,
    );

    Ok(BootstrappedNode {
        orchestrator,
        advertise_ip,
        cancel_token,
        spawner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIpDetector;

    impl IpDetector for FixedIpDetector {
        fn detect(&self) -> Result<String, NetworkError> {
            Ok("127.0.0.1".to_string())
        }
    }

    #[tokio::test]
    async fn bootstrap_wires_a_node_with_null_seams_by_default() {
        let config = SenseyeConfig {
            node_id: "node-a".to_string(),
            mesh_port: 0,
            ..SenseyeConfig::default()
        };
        let node = bootstrap_node_with_ip_detector(config, None, None, None, Arc::new(FixedIpDetector))
            .expect("bootstrap should succeed with a fixed IP detector");
        assert_eq!(node.advertise_ip.to_string(), "127.0.0.1");
    }
}
