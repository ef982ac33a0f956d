//! Dummy audio device: silent input, discarded output, wall-clock paced.
//!
//! Used when the appliance runs headless without a sound interface (or when
//! the configured device is missing) so the control plane, MIDI routing, and
//! UI stay fully functional.

use crate::config::{DriverConfig, NegotiatedConfig};
use crate::pcm::{PcmBackend, PcmDevice, PcmResult};
use pedalrig_core::SampleFormat;
use std::time::{Duration, Instant};

/// Backend producing [`DummyPcm`] devices.
#[derive(Debug, Default)]
pub struct DummyBackend;

impl PcmBackend for DummyBackend {
    type Device = DummyPcm;

    fn open(&self, config: &DriverConfig) -> PcmResult<DummyPcm> {
        let format = SampleFormat::host_preference()[0];
        let negotiated = NegotiatedConfig {
            format,
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            buffer_count: config.buffer_count,
            capture_channels: config.capture_channels,
            playback_channels: config.playback_channels,
            hw_capture_channels: config.capture_channels,
            hw_playback_channels: config.playback_channels,
        };
        Ok(DummyPcm {
            negotiated,
            next_block: Instant::now(),
            block_period: Duration::from_secs_f64(
                config.block_size as f64 / config.sample_rate.max(1) as f64,
            ),
        })
    }
}

/// The device itself. Reads return silence at the real-time block rate so
/// downstream timing (dezippers, tap tempo) behaves as it would on hardware.
pub struct DummyPcm {
    negotiated: NegotiatedConfig,
    next_block: Instant,
    block_period: Duration,
}

impl PcmDevice for DummyPcm {
    fn negotiated(&self) -> &NegotiatedConfig {
        &self.negotiated
    }

    fn driver_name(&self) -> &'static str {
        "dummyAudioDriver"
    }

    fn read(&mut self, buf: &mut [u8], frames: usize) -> PcmResult<usize> {
        let now = Instant::now();
        if now < self.next_block {
            std::thread::sleep(self.next_block - now);
        }
        self.next_block += self.block_period;
        // A stalled consumer must not accumulate debt.
        if self.next_block + self.block_period * 4 < Instant::now() {
            self.next_block = Instant::now();
        }

        let frame_size = self
            .negotiated
            .format
            .bytes_per_sample()
            * self.negotiated.hw_capture_channels as usize;
        // Silence is all-zero bytes in every supported wire format.
        buf[..frames * frame_size].fill(0);
        Ok(frames)
    }

    fn write(&mut self, _buf: &[u8], frames: usize) -> PcmResult<usize> {
        Ok(frames)
    }

    fn start_capture(&mut self) -> PcmResult<()> {
        self.next_block = Instant::now();
        Ok(())
    }

    fn prepare_capture(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn prepare_playback(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn drain_capture(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn resume(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn link(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn unlink(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn wait(&mut self, timeout_ms: i32) -> PcmResult<bool> {
        std::thread::sleep(Duration::from_millis((timeout_ms.max(0) as u64).min(1)));
        Ok(true)
    }

    fn capture_avail(&mut self) -> PcmResult<usize> {
        Ok(self.negotiated.block_size as usize)
    }

    fn playback_avail(&mut self) -> PcmResult<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_reads_silence_at_block_rate() {
        let backend = DummyBackend;
        let mut device = backend
            .open(&DriverConfig {
                sample_rate: 48_000,
                block_size: 480,
                ..Default::default()
            })
            .unwrap();
        device.start_capture().unwrap();

        let frame_size = device.negotiated().format.bytes_per_sample() * 2;
        let mut buf = vec![0xFFu8; 480 * frame_size];
        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(device.read(&mut buf, 480).unwrap(), 480);
        }
        // Three 10 ms blocks: pacing must hold back at least two periods.
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(buf.iter().all(|&b| b == 0));
    }
}
