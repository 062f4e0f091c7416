//! Local network address detection.
//!
//! The mesh listener and mDNS advertiser both need to know which address to
//! bind and advertise. This is injected through a small trait so tests can
//! supply a fixed address instead of touching real interfaces.

use std::sync::Arc;

/// Trait for detecting the local IP address to advertise on the mesh.
pub trait IpDetector: Send + Sync {
    /// Detects the local IP address.
    fn detect(&self) -> Result<String, NetworkError>;
}

/// Default IP detector using the system's network interfaces.
#[derive(Debug, Clone, Default)]
pub struct LocalIpDetector;

impl LocalIpDetector {
    /// Creates a new `LocalIpDetector`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Creates a new `LocalIpDetector` wrapped in an Arc.
    #[must_use]
    pub fn arc() -> Arc<dyn IpDetector> {
        Arc::new(Self::new())
    }
}

impl IpDetector for LocalIpDetector {
    fn detect(&self) -> Result<String, NetworkError> {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .map_err(|e| NetworkError::Detection(e.to_string()))
    }
}

/// Errors that can occur while detecting the local network address.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Could not detect local IP address.
    #[error("failed to detect local IP: {0}")]
    Detection(String),

    /// Network interface error.
    #[error("network interface error: {0}")]
    Interface(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockIpDetector {
        ip: String,
    }

    impl IpDetector for MockIpDetector {
        fn detect(&self) -> Result<String, NetworkError> {
            Ok(self.ip.clone())
        }
    }

    #[test]
    fn mock_detector_returns_configured_ip() {
        let detector = MockIpDetector {
            ip: "10.0.0.5".to_string(),
        };
        assert_eq!(detector.detect().unwrap(), "10.0.0.5");
    }
}
