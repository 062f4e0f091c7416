//! Acoustic engine: FMCW chirp generation, FFT matched-filter ranging, and
//! per-node deterministic frequency channel assignment.

use std::collections::BTreeMap;

use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use sha2::{Digest, Sha256};

/// Default acoustic sample rate.
pub const SAMPLE_RATE_HZ: f64 = 48_000.0;
/// Default chirp duration.
pub const DEFAULT_CHIRP_DURATION_S: f64 = 0.01;
/// Speed of sound used to convert time-of-flight into distance.
pub const SPEED_OF_SOUND_MPS: f64 = 343.0;
/// Lower edge of the deterministic-channel band.
pub const CHANNEL_BAND_LOW_HZ: f64 = 17_000.0;
/// Width of each per-node sub-band.
pub const CHANNEL_BAND_WIDTH_HZ: f64 = 1_000.0;
/// Number of contiguous sub-bands tiling `[17kHz, 23kHz)`.
pub const CHANNEL_COUNT: u64 = 6;
/// A peak must exceed this multiple of the envelope's median to count as a
/// real echo rather than noise.
pub const NOISE_REJECT_FACTOR: f64 = 3.0;
/// Minimum SNR for `identify_chirps` to report a candidate as heard.
pub const IDENTIFY_SNR_THRESHOLD: f64 = 3.0;

/// Deterministic sub-band index for `node_id`: `SHA-256(node_id)[0] mod 6`.
/// A pure function of `node_id` — the same id always yields the same
/// channel, which is what lets a listener identify an emitter passively.
#[must_use]
pub fn channel_for_node(node_id: &str) -> u64 {
    let digest = Sha256::digest(node_id.as_bytes());
    u64::from(digest[0]) % CHANNEL_COUNT
}

/// The `[start, end)` frequency band, in Hz, assigned to `node_id`.
#[must_use]
pub fn channel_band(node_id: &str) -> (f64, f64) {
    let channel = channel_for_node(node_id) as f64;
    let start = CHANNEL_BAND_LOW_HZ + channel * CHANNEL_BAND_WIDTH_HZ;
    (start, start + CHANNEL_BAND_WIDTH_HZ)
}

/// Generates a linear FMCW chirp `s(t) = sin(2*pi*(f0*t + 0.5*k*t^2))`
/// sampled at `sample_rate` Hz.
#[must_use]
pub fn generate_chirp(freq_start: f64, freq_end: f64, duration_s: f64, sample_rate: f64) -> Vec<f32> {
    let n = (duration_s * sample_rate).round().max(1.0) as usize;
    let k = (freq_end - freq_start) / duration_s;
    (0..n)
        .map(|i| {
            let t = i as f64 / sample_rate;
            (2.0 * std::f64::consts::PI * (freq_start * t + 0.5 * k * t * t)).sin() as f32
        })
        .collect()
}

/// Circular cross-correlation of `signal` against a unit-norm `template`
/// via FFT, returning the magnitude envelope (length equal to the padded
/// FFT size, not the input length).
#[must_use]
pub fn matched_filter(signal: &[f32], template: &[f32]) -> Vec<f64> {
    if signal.is_empty() || template.is_empty() {
        return Vec::new();
    }

    let n = (signal.len().max(template.len()) * 2).next_power_of_two();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let template_norm = template
        .iter()
        .map(|&v| f64::from(v).powi(2))
        .sum::<f64>()
        .sqrt()
        .max(1e-12);

    let mut signal_buf: Vec<Complex64> =
        signal.iter().map(|&v| Complex64::new(f64::from(v), 0.0)).collect();
    signal_buf.resize(n, Complex64::new(0.0, 0.0));

    let mut template_buf: Vec<Complex64> = template
        .iter()
        .map(|&v| Complex64::new(f64::from(v) / template_norm, 0.0))
        .collect();
    template_buf.resize(n, Complex64::new(0.0, 0.0));

    fft.process(&mut signal_buf);
    fft.process(&mut template_buf);

    let mut product: Vec<Complex64> = signal_buf
        .iter()
        .zip(template_buf.iter())
        .map(|(s, t)| s * t.conj())
        .collect();

    ifft.process(&mut product);
    let scale = 1.0 / n as f64;
    product.iter().map(|c| (c * scale).norm()).collect()
}

/// Median of the magnitude envelope beyond `skip` samples.
fn envelope_median(envelope: &[f64], skip: usize) -> f64 {
    if envelope.len() <= skip {
        return 0.0;
    }
    let mut sorted: Vec<f64> = envelope[skip..].to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted[sorted.len() / 2]
}

/// Peak-to-median ratio beyond `skip` samples — the SNR used both for peak
/// rejection and chirp identification.
fn envelope_snr(envelope: &[f64], skip: usize) -> f64 {
    if envelope.len() <= skip {
        return 0.0;
    }
    let peak = envelope[skip..].iter().cloned().fold(0.0_f64, f64::max);
    let median = envelope_median(envelope, skip).max(1e-9);
    peak / median
}

/// Finds the first-arriving peak beyond `template_len` samples (skipping
/// the self-echo's direct path), rejecting it as noise if it doesn't clear
/// [`NOISE_REJECT_FACTOR`] times the envelope's median. Returns the
/// time-of-flight in seconds.
#[must_use]
pub fn find_peak_tof(envelope: &[f64], template_len: usize, sample_rate: f64) -> Option<f64> {
    if envelope.len() <= template_len {
        return None;
    }
    let search = &envelope[template_len..];
    let median = envelope_median(envelope, template_len);
    let threshold = NOISE_REJECT_FACTOR * median;

    let (peak_idx, &peak_val) = search
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())?;

    if peak_val < threshold {
        return None;
    }

    Some((template_len + peak_idx) as f64 / sample_rate)
}

/// A single-node echo ranging result.
#[derive(Debug, Clone, Copy)]
pub struct EchoProfile {
    pub tof_s: f64,
    pub distance_m: f64,
    pub snr: f64,
}

/// Runs matched filtering + peak detection over a simultaneous play+record
/// recording against its own chirp template, producing a distance estimate.
#[must_use]
pub fn analyze_echo(recording: &[f32], template: &[f32], sample_rate: f64) -> Option<EchoProfile> {
    let envelope = matched_filter(recording, template);
    let tof_s = find_peak_tof(&envelope, template.len(), sample_rate)?;
    let snr = envelope_snr(&envelope, template.len());
    Some(EchoProfile {
        tof_s,
        distance_m: tof_s * SPEED_OF_SOUND_MPS,
        snr,
    })
}

/// Correlates `recording` against every candidate node's deterministic
/// chirp template, returning `{node_id: snr}` for every candidate whose SNR
/// clears [`IDENTIFY_SNR_THRESHOLD`].
#[must_use]
pub fn identify_chirps(
    recording: &[f32],
    candidates: &[(String, Vec<f32>)],
) -> BTreeMap<String, f64> {
    let mut heard = BTreeMap::new();
    for (node_id, template) in candidates {
        if template.is_empty() {
            continue;
        }
        let envelope = matched_filter(recording, template);
        let snr = envelope_snr(&envelope, template.len());
        if snr > IDENTIFY_SNR_THRESHOLD {
            heard.insert(node_id.clone(), snr);
        }
    }
    heard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_assignment_is_a_pure_function_of_node_id() {
        assert_eq!(channel_for_node("node-a"), channel_for_node("node-a"));
        assert!(channel_for_node("node-a") < CHANNEL_COUNT);
    }

    #[test]
    fn channel_band_tiles_the_17_to_23_khz_range() {
        for candidate in ["node-a", "node-b", "node-c", "node-d"] {
            let (start, end) = channel_band(candidate);
            assert!(start >= CHANNEL_BAND_LOW_HZ);
            assert!(end <= CHANNEL_BAND_LOW_HZ + CHANNEL_COUNT as f64 * CHANNEL_BAND_WIDTH_HZ);
            assert_eq!(end - start, CHANNEL_BAND_WIDTH_HZ);
        }
    }

    #[test]
    fn generate_chirp_produces_the_expected_sample_count() {
        let chirp = generate_chirp(18_000.0, 22_000.0, 0.01, SAMPLE_RATE_HZ);
        assert_eq!(chirp.len(), 480);
    }

    #[test]
    fn matched_filter_peaks_near_zero_lag_for_a_self_echo() {
        let template = generate_chirp(18_000.0, 22_000.0, DEFAULT_CHIRP_DURATION_S, SAMPLE_RATE_HZ);
        let envelope = matched_filter(&template, &template);
        let (peak_idx, _) = envelope
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert!(peak_idx < 4, "expected near-zero-lag peak, got index {peak_idx}");
    }

    #[test]
    fn find_peak_tof_rejects_pure_noise() {
        let envelope = vec![0.1, 0.12, 0.09, 0.11, 0.1, 0.13];
        assert!(find_peak_tof(&envelope, 2, SAMPLE_RATE_HZ).is_none());
    }

    #[test]
    fn identify_chirps_only_reports_candidates_above_threshold() {
        let template_a = generate_chirp(17_500.0, 18_500.0, 0.01, SAMPLE_RATE_HZ);
        let template_b = generate_chirp(21_500.0, 22_500.0, 0.01, SAMPLE_RATE_HZ);

        let mut recording = template_a.clone();
        recording.extend(std::iter::repeat(0.0f32).take(200));

        let candidates = vec![
            ("node-a".to_string(), template_a),
            ("node-b".to_string(), template_b),
        ];
        let heard = identify_chirps(&recording, &candidates);
        assert!(heard.contains_key("node-a"));
    }
}
