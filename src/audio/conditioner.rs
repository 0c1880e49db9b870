//! # Audio Conditioner
//!
//! Normalizes waveforms on both sides of the voice-conversion engine.
//!
//! ## Pipeline Position:
//! ```text
//! synthesis ──► preprocess ──► pad (bucket) ──► engine ──► postprocess ──► packetizer
//! ```
//!
//! ## Key Rust Concepts Used:
//! - **Move semantics**: Every stage takes an [`AudioClip`] by value and returns a new one
//! - **Error propagation**: Resampler failures surface as [`AudioError`] through `?`
//! - **Slices**: Fades and gating work in place over `&mut [f32]`

use super::{peak, AudioClip, AudioError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Peak ceiling enforced before the engine sees a clip.
const INPUT_PEAK_LIMIT: f32 = 1.0;

/// Bound on silent flush calls when draining the resampler delay.
const MAX_RESAMPLER_FLUSHES: usize = 16;

/// Below this peak, conversion-only input is treated as silence.
const CONVERSION_INPUT_FLOOR: f32 = 0.01;

/// Tunables for the post-conversion cleanup.
#[derive(Debug, Clone)]
pub struct ConditionerSettings {
    /// Upper bound on the fade length, in samples
    pub fade_ceiling_samples: usize,

    /// Absolute amplitude below which samples are zeroed
    pub noise_gate: f32,

    /// Output peak ceiling
    pub output_peak: f32,
}

impl Default for ConditionerSettings {
    fn default() -> Self {
        Self {
            fade_ceiling_samples: 240,
            noise_gate: 0.001,
            output_peak: 0.99,
        }
    }
}

/// Stateless waveform normalizer shared by every session.
#[derive(Debug, Clone, Default)]
pub struct AudioConditioner {
    settings: ConditionerSettings,
}

impl AudioConditioner {
    pub fn new(settings: ConditionerSettings) -> Self {
        Self { settings }
    }

    /// Prepare a synthesized clip for the engine.
    ///
    /// ## Steps:
    /// 1. Band-limited resample to `internal_rate` when the rates differ
    /// 2. Subtract the mean (DC removal)
    /// 3. Scale down so the peak is at most 1.0
    /// 4. Replace non-finite samples with 0
    pub fn preprocess(&self, clip: AudioClip, internal_rate: u32) -> Result<AudioClip, AudioError> {
        let mut clip = resample(clip, internal_rate)?;
        sanitize(&mut clip.samples);
        remove_dc(&mut clip.samples);
        limit_peak(&mut clip.samples, INPUT_PEAK_LIMIT);
        Ok(clip)
    }

    /// Right-pad with zeros up to `target_len`; no-op if already that long.
    pub fn pad(mut clip: AudioClip, target_len: usize) -> AudioClip {
        if clip.samples.len() < target_len {
            clip.samples.resize(target_len, 0.0);
        }
        clip
    }

    /// Output length matching `input_len` samples at the internal rate.
    pub fn expected_len(input_len: usize, output_rate: u32, internal_rate: u32) -> usize {
        if internal_rate == 0 {
            return input_len;
        }
        (input_len as f64 * output_rate as f64 / internal_rate as f64).round() as usize
    }

    /// Clean up raw engine output.
    ///
    /// The returned clip is always exactly `expected_len` samples: longer output
    /// is cropped, shorter output is zero-padded.
    pub fn postprocess(&self, raw: AudioClip, expected_len: usize) -> AudioClip {
        let mut clip = raw;
        clip.samples.resize(expected_len, 0.0);

        sanitize(&mut clip.samples);
        limit_peak(&mut clip.samples, self.settings.output_peak);
        apply_fades(&mut clip.samples, self.settings.fade_ceiling_samples);
        gate(&mut clip.samples, self.settings.noise_gate);
        clip
    }

    /// Prepare raw peer audio for conversion-only sessions.
    ///
    /// Removes DC, then scales the clip to `level` peak and clips it to
    /// [-1.0, 1.0]. Returns `None` when the input is effectively silent.
    pub fn normalize_input(&self, mut clip: AudioClip, level: f32) -> Option<AudioClip> {
        sanitize(&mut clip.samples);
        remove_dc(&mut clip.samples);

        let current = peak(&clip.samples);
        if current <= CONVERSION_INPUT_FLOOR {
            return None;
        }

        let gain = level / current;
        for sample in clip.samples.iter_mut() {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
        Some(clip)
    }

    /// Change a clip's sample rate, for callers stitching clips together.
    pub fn resample(&self, clip: AudioClip, target_rate: u32) -> Result<AudioClip, AudioError> {
        resample(clip, target_rate)
    }
}

/// Band-limited sinc resampling via `rubato`.
///
/// The whole clip is processed as a single chunk, the resampler is flushed
/// until its delay is covered, the delay is trimmed, and the result is cut to
/// `round(n * ratio)` samples.
fn resample(clip: AudioClip, target_rate: u32) -> Result<AudioClip, AudioError> {
    if clip.sample_rate == target_rate || clip.samples.is_empty() {
        return Ok(AudioClip::new(clip.samples, target_rate));
    }
    if clip.sample_rate == 0 || target_rate == 0 {
        return Err(AudioError::Resample(format!(
            "cannot resample {} Hz to {} Hz",
            clip.sample_rate, target_rate
        )));
    }

    let ratio = target_rate as f64 / clip.sample_rate as f64;
    let input_len = clip.samples.len();

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input_len, 1)
        .map_err(|e| AudioError::Resample(e.to_string()))?;
    let delay = resampler.output_delay();

    let target_len = (input_len as f64 * ratio).round() as usize;

    let input = vec![clip.samples];
    let mut output = resampler
        .process(&input, None)
        .map_err(|e| AudioError::Resample(e.to_string()))?;
    let mut samples = output.remove(0);

    // Flush with silence until the delayed tail of the input has come out.
    let mut flushes = 0;
    while samples.len() < delay + target_len && flushes < MAX_RESAMPLER_FLUSHES {
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        match tail.into_iter().next() {
            Some(channel) if !channel.is_empty() => samples.extend(channel),
            _ => break,
        }
        flushes += 1;
    }

    let mut samples: Vec<f32> = samples.into_iter().skip(delay).take(target_len).collect();
    samples.resize(target_len, 0.0);

    Ok(AudioClip::new(samples, target_rate))
}

fn sanitize(samples: &mut [f32]) {
    for sample in samples.iter_mut() {
        if !sample.is_finite() {
            *sample = 0.0;
        }
    }
}

fn remove_dc(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    let mean = mean as f32;
    for sample in samples.iter_mut() {
        *sample -= mean;
    }
}

fn limit_peak(samples: &mut [f32], ceiling: f32) {
    let current = peak(samples);
    if current > ceiling {
        let gain = ceiling / current;
        for sample in samples.iter_mut() {
            *sample *= gain;
        }
    }
}

/// Linear fade-in and fade-out of `min(ceiling, len / 20)` samples.
fn apply_fades(samples: &mut [f32], ceiling: usize) {
    let len = samples.len();
    let fade = ceiling.min(len / 20);
    if fade == 0 {
        return;
    }

    for i in 0..fade {
        let gain = i as f32 / fade as f32;
        samples[i] *= gain;
        samples[len - 1 - i] *= gain;
    }
}

fn gate(samples: &mut [f32], threshold: f32) {
    for sample in samples.iter_mut() {
        if sample.abs() < threshold {
            *sample = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_preprocess_removes_dc_and_limits_peak() {
        let conditioner = AudioConditioner::default();
        let mut samples: Vec<f32> = sine(200.0, 16000, 1600, 1.5).iter().map(|s| s + 0.5).collect();
        samples[10] = f32::NAN;

        let clip = conditioner
            .preprocess(AudioClip::new(samples, 16000), 16000)
            .unwrap();

        let mean: f32 = clip.samples.iter().sum::<f32>() / clip.len() as f32;
        assert!(mean.abs() < 0.01, "mean was {mean}");
        assert!(clip.peak() <= 1.0 + 1e-6);
        assert!(clip.samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_preprocess_resamples_to_internal_rate() {
        let conditioner = AudioConditioner::default();
        let clip = AudioClip::new(sine(440.0, 24000, 2400, 0.5), 24000);

        let out = conditioner.preprocess(clip, 16000).unwrap();

        assert_eq!(out.sample_rate, 16000);
        assert_eq!(out.len(), 1600);
        // Band-limited resampling keeps a 440 Hz tone near its original level
        let mid_peak = peak(&out.samples[400..1200]);
        assert!(mid_peak > 0.4 && mid_peak < 0.6, "peak was {mid_peak}");
    }

    #[test]
    fn test_resample_keeps_the_tail() {
        for input_len in [300usize, 2400, 24000] {
            let clip = AudioClip::new(vec![0.5; input_len], 24000);
            let out = resample(clip, 16000).unwrap();

            let expected = input_len * 2 / 3;
            assert_eq!(out.len(), expected);
            let tail = &out.samples[expected - 60..];
            assert!(
                tail.iter().all(|s| *s > 0.2),
                "zeroed tail for {input_len} samples: {:?}",
                &tail[tail.len() - 5..]
            );
        }
    }

    #[test]
    fn test_pad_only_grows() {
        let clip = AudioClip::new(vec![0.5; 3], 16000);
        let padded = AudioConditioner::pad(clip.clone(), 5);
        assert_eq!(padded.samples, vec![0.5, 0.5, 0.5, 0.0, 0.0]);

        let unchanged = AudioConditioner::pad(clip.clone(), 3);
        assert_eq!(unchanged, clip);
    }

    #[test]
    fn test_expected_len() {
        assert_eq!(AudioConditioner::expected_len(8000, 24000, 16000), 12000);
        assert_eq!(AudioConditioner::expected_len(8001, 24000, 16000), 12002);
        assert_eq!(AudioConditioner::expected_len(100, 16000, 16000), 100);
    }

    #[test]
    fn test_postprocess_length_is_exact() {
        let conditioner = AudioConditioner::default();
        for raw_len in [0usize, 1, 999, 1000, 1001, 5000] {
            let raw = AudioClip::new(vec![0.3; raw_len], 24000);
            let out = conditioner.postprocess(raw, 1000);
            assert_eq!(out.len(), 1000);
        }
    }

    #[test]
    fn test_postprocess_limits_fades_and_gates() {
        let conditioner = AudioConditioner::default();
        let mut samples = vec![2.0_f32; 4800];
        samples[2400] = 0.0005;
        samples[2401] = f32::INFINITY;

        let out = conditioner.postprocess(AudioClip::new(samples, 24000), 4800);

        assert!((out.peak() - 0.99).abs() < 1e-6);
        assert_eq!(out.samples[0], 0.0);
        assert_eq!(out.samples[4799], 0.0);
        assert!(out.samples[120] < out.samples[239]);
        assert_eq!(out.samples[2400], 0.0);
        assert_eq!(out.samples[2401], 0.0);
        assert!((out.samples[1000] - 0.99).abs() < 1e-6);
    }

    #[test]
    fn test_fade_is_five_percent_for_short_clips() {
        let mut samples = vec![1.0_f32; 100];
        apply_fades(&mut samples, 240);
        // 100 / 20 = 5 samples of fade on each end
        assert_eq!(samples[0], 0.0);
        assert!((samples[4] - 0.8).abs() < 1e-6);
        assert_eq!(samples[5], 1.0);
        assert_eq!(samples[94], 1.0);
        assert_eq!(samples[99], 0.0);
    }

    #[test]
    fn test_normalize_input() {
        let conditioner = AudioConditioner::default();

        let quiet = AudioClip::new(vec![0.005, -0.005, 0.005, -0.005], 24000);
        assert!(conditioner.normalize_input(quiet, 0.7).is_none());

        let loud = AudioClip::new(vec![0.2, -0.2, 0.1, -0.1], 24000);
        let normalized = conditioner.normalize_input(loud, 0.7).unwrap();
        assert!((normalized.peak() - 0.7).abs() < 1e-6);
    }
}
