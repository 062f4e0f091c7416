//! Centralized error types for the Senseye core library.
//!
//! Per the error handling design, no error is expected to traverse more than
//! one component boundary: transient failures are swallowed and logged at
//! their origin (scanner I/O, audio backend, malformed wire messages), and
//! only failures that a caller cannot locally recover from bubble up as a
//! [`SenseyeError`] (config loading, fatal bind/mDNS failures, calibration
//! persistence).

use thiserror::Error;

use crate::mesh::MeshError;
use crate::protocol::ProtocolError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a stable, machine-readable error code.
    fn code(&self) -> &'static str;
}

impl ErrorCode for MeshError {
    fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "mesh_connect_failed",
            Self::Io(_) => "mesh_io_error",
            Self::Closed => "mesh_connection_closed",
            Self::Protocol(_) => "mesh_protocol_error",
            Self::Timeout => "mesh_rpc_timeout",
        }
    }
}

impl ErrorCode for ProtocolError {
    fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_message",
            Self::Io(_) => "protocol_io_error",
        }
    }
}

/// Application-wide error type for the Senseye daemon.
#[derive(Debug, Error)]
pub enum SenseyeError {
    /// Gossip mesh transport failure that could not be handled locally
    /// (e.g. the mesh listener itself failed to bind).
    #[error("mesh error: {0}")]
    Mesh(String),

    /// Calibration pipeline failed to produce a usable floor plan.
    #[error("calibration failed: {0}")]
    Calibration(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Numerical routine (MDS, tomography, trilateration) could not recover
    /// even after its fallback path.
    #[error("numerical error: {0}")]
    Numeric(String),

    /// Underlying I/O failure (floor plan persistence, mDNS daemon).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// mDNS daemon failure (advertisement or browsing).
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

impl SenseyeError {
    /// Returns a stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Mesh(_) => "mesh_error",
            Self::Calibration(_) => "calibration_failed",
            Self::Config(_) => "configuration_error",
            Self::Numeric(_) => "numerical_error",
            Self::Io(_) => "io_error",
            Self::Mdns(_) => "mdns_error",
        }
    }
}

impl From<MeshError> for SenseyeError {
    fn from(err: MeshError) -> Self {
        Self::Mesh(err.to_string())
    }
}

impl From<ProtocolError> for SenseyeError {
    fn from(err: ProtocolError) -> Self {
        Self::Mesh(err.to_string())
    }
}

/// Convenient Result alias for application-wide operations.
pub type SenseyeResult<T> = Result<T, SenseyeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_returns_correct_code() {
        let err = SenseyeError::Config("missing data_dir".into());
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn mesh_error_converts_from_mesh_error() {
        let err: SenseyeError = MeshError::Closed.into();
        assert_eq!(err.code(), "mesh_error");
    }
}
