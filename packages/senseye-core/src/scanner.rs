//! Scanner backend interface.
//!
//! OS-specific WiFi/BLE scanning is out of scope (see spec §1): this module
//! defines only the integration seam, matching the pattern used elsewhere in
//! this codebase for platform-specific concerns (`SonosTopologyClient`,
//! `EventEmitter`) — a trait at the boundary plus a null/test double, with
//! the real implementation supplied by the embedding application.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::Observation;

/// Produces a batch of [`Observation`]s per scan. Implementations may wrap
/// WiFi beacon scanning, BLE advertisement scanning, or any other passive
/// RF source; the orchestrator treats them uniformly.
#[async_trait]
pub trait ScannerBackend: Send + Sync {
    async fn scan(&self) -> Vec<Observation>;
}

/// A scanner that never observes anything — used when a modality is
/// disabled (`--no-wifi`, `--no-ble`) or in tests that don't exercise
/// scanning.
#[derive(Debug, Default)]
pub struct NullScanner;

#[async_trait]
impl ScannerBackend for NullScanner {
    async fn scan(&self) -> Vec<Observation> {
        Vec::new()
    }
}

/// A scanner that replays a fixed, pre-recorded sequence of scan results —
/// one batch per call, looping once exhausted. Used by orchestrator and
/// calibration tests that need deterministic input.
pub struct LoopbackScanner {
    script: Mutex<VecDeque<Vec<Observation>>>,
    original: Vec<Vec<Observation>>,
}

impl LoopbackScanner {
    #[must_use]
    pub fn new(script: Vec<Vec<Observation>>) -> Self {
        Self {
            script: Mutex::new(script.clone().into()),
            original: script,
        }
    }
}

#[async_trait]
impl ScannerBackend for LoopbackScanner {
    async fn scan(&self) -> Vec<Observation> {
        let mut guard = self.script.lock();
        match guard.pop_front() {
            Some(batch) => batch,
            None => {
                *guard = self.original.clone().into();
                guard.pop_front().unwrap_or_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SignalType;

    #[tokio::test]
    async fn null_scanner_never_observes_anything() {
        let scanner = NullScanner;
        assert!(scanner.scan().await.is_empty());
    }

    #[tokio::test]
    async fn loopback_scanner_replays_then_loops() {
        let scanner = LoopbackScanner::new(vec![
            vec![Observation::new("phone-1", -60.0, 0.0, SignalType::Wifi)],
            vec![],
        ]);
        assert_eq!(scanner.scan().await.len(), 1);
        assert_eq!(scanner.scan().await.len(), 0);
        // Loops back to the first batch.
        assert_eq!(scanner.scan().await.len(), 1);
    }
}
