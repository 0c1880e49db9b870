//! Bucket scheduling for the voice-conversion engine.
//!
//! Inference engines tend to allocate working buffers sized to the first input
//! length they see. Rounding every input up to a small set of bucket lengths,
//! and warming each bucket once, turns an unbounded number of cold starts into
//! a bounded set paid up front.

use super::{ConversionParams, EngineError, VoiceConverter};
use crate::audio::AudioClip;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Smallest multiple of `bucket_size` that is at least `n`.
///
/// Returns `n` unchanged when `bucket_size` or `n` is zero.
pub fn quantize(n: usize, bucket_size: usize) -> usize {
    if bucket_size == 0 || n == 0 {
        return n;
    }
    n.div_ceil(bucket_size) * bucket_size
}

/// Length quantization plus the set of bucket lengths already warmed.
///
/// Owned by [`super::ConversionEngine`] behind its mutex; never shared directly.
#[derive(Debug)]
pub struct BucketScheduler {
    enabled: bool,
    bucket_size: usize,
    internal_rate: u32,
    warmed: BTreeSet<usize>,
}

impl BucketScheduler {
    pub fn new(enabled: bool, bucket_size: usize, internal_rate: u32) -> Self {
        Self {
            enabled,
            bucket_size,
            internal_rate,
            warmed: BTreeSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bucket length for an input of `n` samples (`n` itself when disabled).
    pub fn quantize(&self, n: usize) -> usize {
        if self.enabled {
            quantize(n, self.bucket_size)
        } else {
            n
        }
    }

    /// True iff `bucket_len` has not been warmed yet.
    pub fn needs_warm(&self, bucket_len: usize) -> bool {
        !self.warmed.contains(&bucket_len)
    }

    /// Run one throwaway conversion of `bucket_len` zeros and record the bucket.
    ///
    /// The bucket is only recorded when the call succeeds, so a failed warm is
    /// retried the next time that length comes up.
    pub async fn warm(
        &mut self,
        converter: &dyn VoiceConverter,
        bucket_len: usize,
        params: &ConversionParams,
    ) -> Result<(), EngineError> {
        debug!(bucket_len = bucket_len, "Warming conversion bucket");
        let silence = AudioClip::silence(bucket_len, self.internal_rate);
        converter.warm(silence, params).await?;
        self.warmed.insert(bucket_len);
        info!(bucket_len = bucket_len, warmed = self.warmed.len(), "Conversion bucket warmed");
        Ok(())
    }

    /// Warmed bucket lengths in ascending order.
    pub fn warmed(&self) -> Vec<usize> {
        self.warmed.iter().copied().collect()
    }
}
