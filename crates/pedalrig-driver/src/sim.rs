//! Scripted PCM device for driver and engine tests.
//!
//! Generates capture input from a caller-supplied function, records decoded
//! playback output, and injects stream errors at chosen read/write calls so
//! recovery paths can be exercised deterministically. Shared state lives
//! behind the backend handle, so it survives the close/reopen cycles the
//! driver performs during restart escalation.

use crate::config::{DriverConfig, NegotiatedConfig};
use crate::pcm::{PcmBackend, PcmDevice, PcmError, PcmResult};
use parking_lot::Mutex;
use pedalrig_core::{AudioFormat, SampleFormat};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type InputFn = dyn Fn(u64, usize) -> f32 + Send + Sync;

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    opens: AtomicU64,
    prepares_capture: AtomicU64,
    prepares_playback: AtomicU64,
    links: AtomicU64,
    unlinks: AtomicU64,
    starts: AtomicU64,
}

/// Snapshot of the device call counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimCounters {
    pub reads: u64,
    pub writes: u64,
    pub opens: u64,
    pub prepares_capture: u64,
    pub prepares_playback: u64,
    pub links: u64,
    pub unlinks: u64,
    pub starts: u64,
}

struct Shared {
    format: SampleFormat,
    input_fn: Box<InputFn>,
    captured: Mutex<Vec<Vec<f32>>>,
    read_faults: Mutex<VecDeque<(u64, PcmError)>>,
    write_faults: Mutex<VecDeque<(u64, PcmError)>>,
    open_faults: Mutex<VecDeque<PcmError>>,
    counters: Counters,
}

/// Backend handle; clone it to keep inspecting state while the driver owns
/// the devices it opens.
#[derive(Clone)]
pub struct SimBackend {
    shared: Arc<Shared>,
}

impl SimBackend {
    /// Silent input in the given wire format.
    pub fn new(format: SampleFormat) -> Self {
        Self::with_input(format, |_, _| 0.0)
    }

    /// Capture input generated per `(absolute_frame, channel)`.
    pub fn with_input<F>(format: SampleFormat, input: F) -> Self
    where
        F: Fn(u64, usize) -> f32 + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                format,
                input_fn: Box::new(input),
                captured: Mutex::new(Vec::new()),
                read_faults: Mutex::new(VecDeque::new()),
                write_faults: Mutex::new(VecDeque::new()),
                open_faults: Mutex::new(VecDeque::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Fails the `nth` read call (0-based, counted across reopens).
    pub fn inject_read_fault(&self, nth: u64, err: PcmError) {
        self.shared.read_faults.lock().push_back((nth, err));
    }

    /// Fails the `nth` write call (0-based, counted across reopens).
    pub fn inject_write_fault(&self, nth: u64, err: PcmError) {
        self.shared.write_faults.lock().push_back((nth, err));
    }

    /// Fails the next `open` once per queued error.
    pub fn inject_open_fault(&self, err: PcmError) {
        self.shared.open_faults.lock().push_back(err);
    }

    /// Playback audio decoded back to f32, per channel.
    pub fn captured(&self) -> Vec<Vec<f32>> {
        self.shared.captured.lock().clone()
    }

    /// Frames of playback recorded so far.
    pub fn captured_frames(&self) -> usize {
        self.shared
            .captured
            .lock()
            .first()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn counters(&self) -> SimCounters {
        let c = &self.shared.counters;
        SimCounters {
            reads: c.reads.load(Ordering::Acquire),
            writes: c.writes.load(Ordering::Acquire),
            opens: c.opens.load(Ordering::Acquire),
            prepares_capture: c.prepares_capture.load(Ordering::Acquire),
            prepares_playback: c.prepares_playback.load(Ordering::Acquire),
            links: c.links.load(Ordering::Acquire),
            unlinks: c.unlinks.load(Ordering::Acquire),
            starts: c.starts.load(Ordering::Acquire),
        }
    }
}

impl PcmBackend for SimBackend {
    type Device = SimPcm;

    fn open(&self, config: &DriverConfig) -> PcmResult<SimPcm> {
        self.shared.counters.opens.fetch_add(1, Ordering::AcqRel);
        if let Some(err) = self.shared.open_faults.lock().pop_front() {
            return Err(err);
        }
        let negotiated = NegotiatedConfig {
            format: self.shared.format,
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            buffer_count: config.buffer_count,
            capture_channels: config.capture_channels,
            playback_channels: config.playback_channels,
            hw_capture_channels: config.capture_channels,
            hw_playback_channels: config.playback_channels,
        };
        {
            let mut captured = self.shared.captured.lock();
            if captured.is_empty() {
                *captured = vec![Vec::new(); config.playback_channels as usize];
            }
        }
        let block = config.block_size as usize;
        Ok(SimPcm {
            shared: self.shared.clone(),
            format: AudioFormat::new(self.shared.format),
            negotiated,
            read_frame: 0,
            scratch: (0..config.playback_channels.max(config.capture_channels) as usize)
                .map(|_| vec![0.0f32; block].into_boxed_slice())
                .collect(),
        })
    }
}

/// The scripted device.
pub struct SimPcm {
    shared: Arc<Shared>,
    format: AudioFormat,
    negotiated: NegotiatedConfig,
    read_frame: u64,
    scratch: Vec<Box<[f32]>>,
}

impl SimPcm {
    fn take_fault(faults: &Mutex<VecDeque<(u64, PcmError)>>, call: u64) -> Option<PcmError> {
        let mut faults = faults.lock();
        if let Some(pos) = faults.iter().position(|(n, _)| *n == call) {
            return faults.remove(pos).map(|(_, err)| err);
        }
        None
    }
}

impl PcmDevice for SimPcm {
    fn negotiated(&self) -> &NegotiatedConfig {
        &self.negotiated
    }

    fn driver_name(&self) -> &'static str {
        "alsaDriver"
    }

    fn read(&mut self, buf: &mut [u8], frames: usize) -> PcmResult<usize> {
        let call = self.shared.counters.reads.fetch_add(1, Ordering::AcqRel);
        if let Some(err) = Self::take_fault(&self.shared.read_faults, call) {
            return Err(err);
        }
        // Keep free-running test loops from pinning a core.
        std::thread::sleep(Duration::from_micros(10));

        let channels = self.negotiated.hw_capture_channels as usize;
        let frames = frames.min(self.scratch.first().map_or(0, |s| s.len()));
        for (ch, scratch) in self.scratch.iter_mut().take(channels).enumerate() {
            for (i, sample) in scratch.iter_mut().take(frames).enumerate() {
                *sample = (self.shared.input_fn)(self.read_frame + i as u64, ch);
            }
        }
        (self.format.encode)(&self.scratch, buf, channels, frames);
        self.read_frame += frames as u64;
        Ok(frames)
    }

    fn write(&mut self, buf: &[u8], frames: usize) -> PcmResult<usize> {
        let call = self.shared.counters.writes.fetch_add(1, Ordering::AcqRel);
        if let Some(err) = Self::take_fault(&self.shared.write_faults, call) {
            return Err(err);
        }
        let channels = self.negotiated.hw_playback_channels as usize;
        let frames = frames.min(self.scratch.first().map_or(0, |s| s.len()));
        (self.format.decode)(buf, &mut self.scratch, channels, frames);
        let mut captured = self.shared.captured.lock();
        for (ch, channel) in captured.iter_mut().take(channels).enumerate() {
            channel.extend_from_slice(&self.scratch[ch][..frames]);
        }
        Ok(frames)
    }

    fn start_capture(&mut self) -> PcmResult<()> {
        self.shared.counters.starts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn prepare_capture(&mut self) -> PcmResult<()> {
        self.shared
            .counters
            .prepares_capture
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn prepare_playback(&mut self) -> PcmResult<()> {
        self.shared
            .counters
            .prepares_playback
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn drain_capture(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn resume(&mut self) -> PcmResult<()> {
        Ok(())
    }

    fn link(&mut self) -> PcmResult<()> {
        self.shared.counters.links.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unlink(&mut self) -> PcmResult<()> {
        self.shared.counters.unlinks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn wait(&mut self, _timeout_ms: i32) -> PcmResult<bool> {
        std::thread::sleep(Duration::from_micros(50));
        Ok(true)
    }

    fn capture_avail(&mut self) -> PcmResult<usize> {
        Ok(self.negotiated.block_size as usize)
    }

    fn playback_avail(&mut self) -> PcmResult<usize> {
        Ok(0)
    }
}
