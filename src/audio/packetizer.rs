//! # Frame Packetizer
//!
//! Slices conditioned audio into fixed-duration, fixed-byte-length PCM16 frames
//! ready to be written to a WebSocket as binary messages.
//!
//! ## Key Rust Concepts Used:
//! - **Iterators**: [`Frames`] is a lazy, borrowing iterator; frames are packed on demand
//! - **Lifetimes**: `Frames<'a>` borrows the clip's samples instead of copying them
//! - **Byte packing**: samples are written as little-endian `i16`

use super::{codec::to_pcm16, samples_for_ms, AudioClip};

const BYTES_PER_SAMPLE: usize = 2;

/// One wire-ready chunk of packed 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Splits clips into frames of a fixed number of samples.
#[derive(Debug, Clone, Copy)]
pub struct FramePacketizer {
    frame_samples: usize,
}

impl FramePacketizer {
    /// A packetizer emitting `frame_samples` samples per frame (at least one).
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
        }
    }

    /// A packetizer emitting `frame_ms` milliseconds of audio at `sample_rate`.
    pub fn for_duration(sample_rate: u32, frame_ms: u32) -> Self {
        Self::new(samples_for_ms(sample_rate, frame_ms))
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Size in bytes of every frame this packetizer produces.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * BYTES_PER_SAMPLE
    }

    /// Lazily partition `clip` into frames.
    ///
    /// The last frame is zero-padded to full length. An empty clip yields
    /// exactly one frame of silence.
    pub fn frames<'a>(&self, clip: &'a AudioClip) -> Frames<'a> {
        Frames {
            samples: &clip.samples,
            frame_samples: self.frame_samples,
            position: 0,
            emitted: false,
        }
    }
}

/// Iterator returned by [`FramePacketizer::frames`].
#[derive(Debug)]
pub struct Frames<'a> {
    samples: &'a [f32],
    frame_samples: usize,
    position: usize,
    emitted: bool,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.position >= self.samples.len() {
            if self.emitted {
                return None;
            }
            self.emitted = true;
            return Some(pack(&[], self.frame_samples));
        }

        let end = (self.position + self.frame_samples).min(self.samples.len());
        let frame = pack(&self.samples[self.position..end], self.frame_samples);
        self.position = end;
        self.emitted = true;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.position >= self.samples.len() {
            usize::from(!self.emitted)
        } else {
            (self.samples.len() - self.position).div_ceil(self.frame_samples)
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Frames<'_> {}

fn pack(window: &[f32], frame_samples: usize) -> Frame {
    let mut bytes = Vec::with_capacity(frame_samples * BYTES_PER_SAMPLE);
    for &sample in window {
        bytes.extend_from_slice(&to_pcm16(sample).to_le_bytes());
    }
    bytes.resize(frame_samples * BYTES_PER_SAMPLE, 0);
    Frame { bytes }
}
