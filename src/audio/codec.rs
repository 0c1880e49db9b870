//! # Audio Format Conversion
//!
//! Converts between [`AudioClip`] and the byte formats used at the service
//! boundaries:
//! - **WAV** (via the `wav` crate): synthesis replies, conversion engine requests
//!   and replies, and the one-shot `/tts` HTTP response
//! - **Raw PCM16** (via `byteorder`): audio pushed by peers on conversion-only sockets

use super::{AudioClip, AudioError};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

const WAV_FORMAT_PCM: u16 = 0x0001;
const WAV_FORMAT_IEEE_FLOAT: u16 = 0x0003;

/// Decode a WAV payload into a mono clip.
///
/// ## Supported encodings:
/// - 8, 16 and 24-bit integer PCM
/// - 32-bit IEEE float
///
/// Interleaved multi-channel audio is averaged down to one channel.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioClip, AudioError> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor).map_err(|e| AudioError::Wav(e.to_string()))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(AudioClip::new(samples, header.sampling_rate))
}

/// Encode a clip as a mono 32-bit float WAV (lossless hand-off to the engine).
pub fn encode_wav_f32(clip: &AudioClip) -> Result<Vec<u8>, AudioError> {
    let header = wav::Header::new(WAV_FORMAT_IEEE_FLOAT, 1, clip.sample_rate, 32);
    let track = wav::BitDepth::ThirtyTwoFloat(clip.samples.clone());
    write_wav(header, &track)
}

/// Encode a clip as a mono 16-bit PCM WAV (what HTTP clients expect to play).
pub fn encode_wav_pcm16(clip: &AudioClip) -> Result<Vec<u8>, AudioError> {
    let header = wav::Header::new(WAV_FORMAT_PCM, 1, clip.sample_rate, 16);
    let track = wav::BitDepth::Sixteen(clip.samples.iter().map(|&s| to_pcm16(s)).collect());
    write_wav(header, &track)
}

fn write_wav(header: wav::Header, track: &wav::BitDepth) -> Result<Vec<u8>, AudioError> {
    let mut cursor = Cursor::new(Vec::new());
    wav::write(header, track, &mut cursor).map_err(|e| AudioError::Wav(e.to_string()))?;
    Ok(cursor.into_inner())
}

/// Convert raw little-endian PCM16 bytes to float samples in [-1.0, 1.0).
pub fn pcm16_to_f32(data: &[u8]) -> Result<Vec<f32>, AudioError> {
    if data.len() % 2 != 0 {
        return Err(AudioError::OddPcmLength(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Clamp to [-1.0, 1.0] and scale linearly onto the signed 16-bit range.
pub fn to_pcm16(sample: f32) -> i16 {
    let sample = if sample.is_finite() { sample } else { 0.0 };
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}
