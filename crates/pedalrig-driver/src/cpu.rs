//! Per-block CPU accounting for the audio thread.
//!
//! The block loop marks a category after each phase; the meter attributes
//! elapsed time since the previous mark to that phase and folds everything
//! into smoothed load fractions the host can read.

use pedalrig_core::AtomicFloat;
use std::sync::Arc;
use std::time::Instant;

/// Block-loop phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileCategory {
    /// Waiting on and reading the capture stream.
    Read,
    /// Sample-format conversion, both directions.
    Codec,
    /// The pedalboard process hook.
    Execute,
    /// Writing the playback stream.
    Write,
}

#[derive(Default)]
struct Shared {
    read: AtomicFloat,
    codec: AtomicFloat,
    execute: AtomicFloat,
    write: AtomicFloat,
    total: AtomicFloat,
}

/// Smoothed CPU load snapshot, as fractions of the block period.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuMetrics {
    pub read: f32,
    pub codec: f32,
    pub execute: f32,
    pub write: f32,
    pub total: f32,
}

/// Host-side reader.
#[derive(Clone, Default)]
pub struct CpuMetricsHandle {
    shared: Arc<Shared>,
}

impl CpuMetricsHandle {
    pub fn snapshot(&self) -> CpuMetrics {
        CpuMetrics {
            read: self.shared.read.get(),
            codec: self.shared.codec.get(),
            execute: self.shared.execute.get(),
            write: self.shared.write.get(),
            total: self.shared.total.get(),
        }
    }
}

/// Realtime-side meter. One per audio thread.
pub struct CpuMeter {
    shared: Arc<Shared>,
    mark: Instant,
    block_seconds: f64,
    read_acc: f64,
    codec_acc: f64,
    execute_acc: f64,
    write_acc: f64,
    smoothing: f64,
}

impl CpuMeter {
    pub fn new(handle: &CpuMetricsHandle, block_size: u32, sample_rate: u32) -> Self {
        Self {
            shared: handle.shared.clone(),
            mark: Instant::now(),
            block_seconds: block_size as f64 / sample_rate.max(1) as f64,
            read_acc: 0.0,
            codec_acc: 0.0,
            execute_acc: 0.0,
            write_acc: 0.0,
            smoothing: 0.05,
        }
    }

    /// Re-arms the phase timer without attributing elapsed time anywhere.
    #[inline]
    pub fn begin_block(&mut self) {
        self.mark = Instant::now();
    }

    /// Attributes time since the last mark to `category`.
    #[inline]
    pub fn add_sample(&mut self, category: ProfileCategory) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.mark).as_secs_f64();
        self.mark = now;
        match category {
            ProfileCategory::Read => self.read_acc += elapsed,
            ProfileCategory::Codec => self.codec_acc += elapsed,
            ProfileCategory::Execute => self.execute_acc += elapsed,
            ProfileCategory::Write => self.write_acc += elapsed,
        }
    }

    /// Publishes smoothed fractions and resets the block accumulators.
    #[inline]
    pub fn end_block(&mut self) {
        let scale = 1.0 / self.block_seconds;
        let alpha = self.smoothing;
        let fold = |shared: &AtomicFloat, acc: f64| {
            let current = shared.get() as f64;
            shared.set((current + alpha * (acc * scale - current)) as f32);
        };
        fold(&self.shared.read, self.read_acc);
        fold(&self.shared.codec, self.codec_acc);
        fold(&self.shared.execute, self.execute_acc);
        fold(&self.shared.write, self.write_acc);
        fold(
            &self.shared.total,
            self.read_acc + self.codec_acc + self.execute_acc + self.write_acc,
        );
        self.read_acc = 0.0;
        self.codec_acc = 0.0;
        self.execute_acc = 0.0;
        self.write_acc = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_accumulate() {
        let handle = CpuMetricsHandle::default();
        let mut meter = CpuMeter::new(&handle, 64, 48_000);
        for _ in 0..50 {
            meter.begin_block();
            std::thread::sleep(std::time::Duration::from_micros(200));
            meter.add_sample(ProfileCategory::Execute);
            meter.end_block();
        }
        let metrics = handle.snapshot();
        assert!(metrics.execute > 0.0);
        assert!(metrics.total >= metrics.execute * 0.9);
        assert_eq!(metrics.read, 0.0);
    }
}
