//! Audio backend interface.
//!
//! The real audio backend (blocking play/record/play-record over a mono
//! float32 stream) is out of scope (§1) and platform-specific; this module
//! defines the seam the acoustic engine dispatches onto, plus a null
//! implementation that reports itself unavailable — mirroring the
//! prototype's optional-dependency fallback — so the signal-processing
//! functions in [`crate::acoustic`] are fully unit-testable without real
//! hardware.

use std::time::Duration;

use async_trait::async_trait;

/// Errors from the audio backend.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("audio backend unavailable")]
    Unavailable,
    #[error("audio I/O error: {0}")]
    Io(String),
}

/// Blocking play/record/play-record primitives on a mono float32 stream.
/// Implementations are expected to dispatch onto a dedicated blocking
/// worker pool so the cooperative sense loop is never stalled on audio I/O.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Plays `samples` at `sample_rate` and returns once playback completes.
    async fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), AudioError>;

    /// Records `duration` of audio at `sample_rate`.
    async fn record(&self, duration: Duration, sample_rate: u32) -> Result<Vec<f32>, AudioError>;

    /// Plays `samples` while simultaneously recording for `record_duration`,
    /// returning the recorded buffer. Used for self-echo ranging.
    async fn play_record(
        &self,
        samples: Vec<f32>,
        record_duration: Duration,
        sample_rate: u32,
    ) -> Result<Vec<f32>, AudioError>;
}

/// Reports every call as unavailable — the default when no real audio
/// backend is wired in (headless deployments, tests, `--no-wifi --no-ble`
/// style minimal runs without a speaker/microphone).
#[derive(Debug, Default)]
pub struct NullAudioBackend;

#[async_trait]
impl AudioBackend for NullAudioBackend {
    async fn play(&self, _samples: Vec<f32>, _sample_rate: u32) -> Result<(), AudioError> {
        Err(AudioError::Unavailable)
    }

    async fn record(&self, _duration: Duration, _sample_rate: u32) -> Result<Vec<f32>, AudioError> {
        Err(AudioError::Unavailable)
    }

    async fn play_record(
        &self,
        _samples: Vec<f32>,
        _record_duration: Duration,
        _sample_rate: u32,
    ) -> Result<Vec<f32>, AudioError> {
        Err(AudioError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_backend_reports_unavailable_for_every_operation() {
        let backend = NullAudioBackend;
        assert!(matches!(
            backend.play(vec![], 48_000).await,
            Err(AudioError::Unavailable)
        ));
        assert!(matches!(
            backend.record(Duration::from_millis(10), 48_000).await,
            Err(AudioError::Unavailable)
        ));
        assert!(matches!(
            backend
                .play_record(vec![], Duration::from_millis(10), 48_000)
                .await,
            Err(AudioError::Unavailable)
        ));
    }
}
