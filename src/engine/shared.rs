//! # Shared Conversion Engine
//!
//! The one process-wide handle to the voice-conversion engine. The converter
//! and the warmed-bucket set live behind a single `tokio::sync::Mutex`, so
//! across all sessions:
//! - at most one convert or warm call is in flight at a time
//! - a bucket is warmed exactly once, before its first conversion
//!
//! The engine is a deliberate bottleneck. Sessions queue on the lock; holding a
//! `tokio` mutex across `.await` suspends the waiting task without blocking the
//! worker thread, so other sessions keep streaming while one waits.

use super::{BucketScheduler, ConversionParams, EngineError, VoiceConverter};
use crate::audio::{conditioner::AudioConditioner, AudioClip};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of one bucketed conversion.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    /// Raw engine output (not yet conditioned)
    pub clip: AudioClip,

    /// Samples submitted before bucket padding
    pub input_len: usize,

    /// Samples actually submitted to the engine
    pub bucket_len: usize,

    /// Whether this call had to warm the bucket first
    pub warmed: bool,
}

/// Serialized access to the voice-conversion engine.
pub struct ConversionEngine {
    converter: Arc<dyn VoiceConverter>,
    params: ConversionParams,
    internal_rate: u32,
    scheduler: Mutex<BucketScheduler>,
}

impl ConversionEngine {
    /// ## Parameters:
    /// - `converter`: adapter, already probed by the caller
    /// - `params`: control parameters sent with every call
    /// - `scheduler`: bucket policy; its warmed set starts empty
    /// - `internal_rate`: sample rate every submitted clip must have
    pub fn new(
        converter: Arc<dyn VoiceConverter>,
        params: ConversionParams,
        scheduler: BucketScheduler,
        internal_rate: u32,
    ) -> Self {
        Self {
            converter,
            params,
            internal_rate,
            scheduler: Mutex::new(scheduler),
        }
    }

    pub fn internal_rate(&self) -> u32 {
        self.internal_rate
    }

    /// Convert a preprocessed clip at the internal rate.
    ///
    /// ## Steps (all under the engine lock):
    /// 1. Quantize the length to its bucket
    /// 2. Warm the bucket if this is its first use
    /// 3. Zero-pad to the bucket length and convert
    pub async fn convert(&self, clip: AudioClip) -> Result<ConversionOutcome, EngineError> {
        if clip.sample_rate != self.internal_rate {
            return Err(EngineError::Failed(format!(
                "clip is {} Hz, engine expects {} Hz",
                clip.sample_rate, self.internal_rate
            )));
        }
        if clip.is_empty() {
            return Err(EngineError::Failed("nothing to convert".to_string()));
        }

        let input_len = clip.len();
        let wait_start = Instant::now();
        let mut scheduler = self.scheduler.lock().await;
        debug!(
            wait_ms = wait_start.elapsed().as_millis() as u64,
            "Acquired conversion engine"
        );

        let bucket_len = scheduler.quantize(input_len);
        let mut warmed = false;
        if scheduler.is_enabled() && scheduler.needs_warm(bucket_len) {
            scheduler
                .warm(self.converter.as_ref(), bucket_len, &self.params)
                .await?;
            warmed = true;
        }

        let padded = AudioConditioner::pad(clip, bucket_len);
        let converted = self.converter.convert(padded, &self.params).await?;

        Ok(ConversionOutcome {
            clip: converted,
            input_len,
            bucket_len,
            warmed,
        })
    }

    /// Warm the bucket of each length in `lengths` ahead of traffic.
    ///
    /// Failures are logged and skipped. Returns the number of buckets warmed.
    pub async fn prewarm(&self, lengths: &[usize]) -> usize {
        let mut scheduler = self.scheduler.lock().await;
        if !scheduler.is_enabled() {
            return 0;
        }

        let mut count = 0;
        for &length in lengths {
            let bucket_len = scheduler.quantize(length);
            if bucket_len == 0 || !scheduler.needs_warm(bucket_len) {
                continue;
            }
            match scheduler
                .warm(self.converter.as_ref(), bucket_len, &self.params)
                .await
            {
                Ok(()) => count += 1,
                Err(e) => warn!(bucket_len = bucket_len, error = %e, "Pre-warm failed"),
            }
        }

        info!(warmed = count, requested = lengths.len(), "Conversion engine pre-warm complete");
        count
    }

    /// Bucket lengths warmed so far.
    #[cfg(test)]
    pub async fn warmed_buckets(&self) -> Vec<usize> {
        self.scheduler.lock().await.warmed()
    }

    /// Warmed buckets, or `None` while a conversion holds the engine.
    pub fn try_warmed_buckets(&self) -> Option<Vec<usize>> {
        self.scheduler.try_lock().ok().map(|scheduler| scheduler.warmed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::FakeConverter;
    use std::sync::atomic::Ordering;

    fn engine(converter: Arc<FakeConverter>, bucketing: bool) -> ConversionEngine {
        ConversionEngine::new(
            converter,
            ConversionParams::default(),
            BucketScheduler::new(bucketing, 8000, 16000),
            16000,
        )
    }

    #[tokio::test]
    async fn test_convert_pads_to_bucket_and_warms_once() {
        let converter = Arc::new(FakeConverter::new(24000));
        let engine = engine(converter.clone(), true);

        let first = engine.convert(AudioClip::new(vec![0.1; 8001], 16000)).await.unwrap();
        let second = engine.convert(AudioClip::new(vec![0.1; 9000], 16000)).await.unwrap();

        assert!(first.warmed);
        assert!(!second.warmed);
        assert_eq!(first.input_len, 8001);
        assert_eq!(first.bucket_len, 16000);
        assert_eq!(converter.warmed(), vec![16000]);
        assert_eq!(converter.converted(), vec![16000, 16000]);
        assert_eq!(first.clip.sample_rate, 24000);
        assert_eq!(engine.warmed_buckets().await, vec![16000]);
        assert_eq!(engine.try_warmed_buckets(), Some(vec![16000]));
    }

    #[tokio::test]
    async fn test_bucketing_disabled_submits_exact_length() {
        let converter = Arc::new(FakeConverter::new(24000));
        let engine = engine(converter.clone(), false);

        let outcome = engine.convert(AudioClip::new(vec![0.1; 8001], 16000)).await.unwrap();

        assert!(!outcome.warmed);
        assert_eq!(converter.converted(), vec![8001]);
        assert!(converter.warmed().is_empty());
        assert_eq!(engine.prewarm(&[8000]).await, 0);
    }

    #[tokio::test]
    async fn test_rejects_wrong_rate_and_empty_clip() {
        let converter = Arc::new(FakeConverter::new(24000));
        let engine = engine(converter.clone(), true);

        assert!(engine.convert(AudioClip::new(vec![0.1; 10], 24000)).await.is_err());
        assert!(engine.convert(AudioClip::new(Vec::new(), 16000)).await.is_err());
        assert!(converter.converted().is_empty());
    }

    #[tokio::test]
    async fn test_prewarm_dedupes_buckets() {
        let converter = Arc::new(FakeConverter::new(24000));
        let engine = engine(converter.clone(), true);

        let count = engine.prewarm(&[8000, 7000, 16000, 24000, 32000]).await;

        assert_eq!(count, 4);
        assert_eq!(converter.warmed(), vec![8000, 16000, 24000, 32000]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_are_serialized_across_tasks() {
        let converter = Arc::new(FakeConverter::new(16000));
        let engine = Arc::new(engine(converter.clone(), true));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .convert(AudioClip::new(vec![0.1; 4000 * (i + 1)], 16000))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(converter.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(converter.converted().len(), 8);
    }
}
