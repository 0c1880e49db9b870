//! Segmental signal-to-noise estimate.
//!
//! Diagnostic only: the value is logged per segment and reported by the
//! one-shot `/tts` endpoint, never used to make decisions.

use super::{samples_for_ms, AudioClip};

/// Minimum number of analysis windows for a meaningful estimate.
const MIN_WINDOWS: usize = 4;

/// Keeps log10 finite on digital silence.
const ENERGY_FLOOR: f64 = 1e-12;

/// Analysis parameters for [`segmental_snr`].
#[derive(Debug, Clone, Copy)]
pub struct SnrOptions {
    pub window_ms: u32,
    pub overlap_ratio: f64,
    pub silence_threshold_ratio: f64,
}

impl Default for SnrOptions {
    fn default() -> Self {
        Self {
            window_ms: 20,
            overlap_ratio: 0.5,
            silence_threshold_ratio: 0.15,
        }
    }
}

/// Ratio of mean "signal" window energy to mean "noise" window energy, in dB.
///
/// Windows quieter than `silence_threshold_ratio × median energy` count as
/// noise. Returns `NaN` when there are fewer than four windows, or when every
/// window (or no window) is classified as noise.
pub fn segmental_snr(clip: &AudioClip, options: &SnrOptions) -> f64 {
    let window = samples_for_ms(clip.sample_rate, options.window_ms);
    if window == 0 || clip.samples.len() < window {
        return f64::NAN;
    }
    let hop = ((window as f64 * (1.0 - options.overlap_ratio)) as usize).max(1);

    let samples = centered(&clip.samples);

    let energies: Vec<f64> = (0..=samples.len() - window)
        .step_by(hop)
        .map(|start| {
            let frame = &samples[start..start + window];
            frame.iter().map(|s| s * s).sum::<f64>() / window as f64 + ENERGY_FLOOR
        })
        .collect();
    if energies.len() < MIN_WINDOWS {
        return f64::NAN;
    }

    let threshold = options.silence_threshold_ratio * median(&energies);
    let (noise, signal): (Vec<f64>, Vec<f64>) = energies.iter().partition(|&&e| e < threshold);
    if noise.is_empty() || signal.is_empty() {
        return f64::NAN;
    }

    let mean_signal = signal.iter().sum::<f64>() / signal.len() as f64;
    let mean_noise = noise.iter().sum::<f64>() / noise.len() as f64;
    10.0 * (mean_signal / mean_noise).log10()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Remove DC, then scale down to a peak of 1.0 if it is above that.
fn centered(samples: &[f32]) -> Vec<f64> {
    let mut centered: Vec<f64> = samples
        .iter()
        .map(|&s| if s.is_finite() { s as f64 } else { 0.0 })
        .collect();
    if centered.is_empty() {
        return centered;
    }
    let mean = centered.iter().sum::<f64>() / centered.len() as f64;
    centered.iter_mut().for_each(|s| *s -= mean);

    let max = centered.iter().fold(0.0_f64, |m, s| m.max(s.abs()));
    if max > 1.0 {
        centered.iter_mut().for_each(|s| *s /= max);
    }
    centered
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic uniform noise in [-1, 1).
    fn noise(len: usize, mut seed: u64) -> Vec<f32> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                (seed >> 11) as f32 / (1u64 << 53) as f32 * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_silence_is_nan() {
        let clip = AudioClip::silence(16000, 16000);
        assert!(segmental_snr(&clip, &SnrOptions::default()).is_nan());
    }

    #[test]
    fn test_too_few_windows_is_nan() {
        // 40 ms at 16 kHz gives three half-overlapping 20 ms windows
        let clip = AudioClip::new(noise(640, 7), 16000);
        assert!(segmental_snr(&clip, &SnrOptions::default()).is_nan());
    }

    #[test]
    fn test_tone_over_noise_floor_is_about_20_db() {
        let rate = 16000;
        let len = 2 * rate as usize;
        let tone_rms = 10f32.powf(-10.0 / 20.0);
        let noise_rms = 10f32.powf(-30.0 / 20.0);
        // Uniform noise in [-a, a] has RMS a / sqrt(3)
        let noise_amplitude = noise_rms * 3f32.sqrt();
        let tone_amplitude = tone_rms * 2f32.sqrt();

        let floor = noise(len, 0x9E37_79B9_7F4A_7C15);
        let samples: Vec<f32> = (0..len)
            .map(|i| {
                let tone = if i < len * 3 / 5 {
                    tone_amplitude
                        * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin()
                } else {
                    0.0
                };
                tone + noise_amplitude * floor[i]
            })
            .collect();

        let snr = segmental_snr(&AudioClip::new(samples, rate), &SnrOptions::default());
        assert!((snr - 20.0).abs() <= 2.0, "snr was {snr}");
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_peak_is_measured_after_dc_removal() {
        // Offset by 1.5: the raw peak is 2.5, the centered peak only 1.0
        assert_eq!(centered(&[2.5, 1.5, 0.5, 1.5]), vec![1.0, 0.0, -1.0, 0.0]);
        assert_eq!(centered(&[3.0, -1.0]), vec![1.0, -1.0]);
        assert!(centered(&[]).is_empty());
    }
}
