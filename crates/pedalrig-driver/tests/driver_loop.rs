//! Driver block-loop tests against the scripted PCM device.

use pedalrig_driver::sim::SimBackend;
use pedalrig_driver::{
    AudioDriver, AudioDriverHost, ChannelSelection, DriverConfig, PcmError, ProcessContext,
};
use pedalrig_core::SampleFormat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pass-through host that counts blocks and underruns.
struct PassThroughHost {
    blocks: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
}

impl AudioDriverHost for PassThroughHost {
    fn on_process(&mut self, ctx: ProcessContext<'_>) {
        for (output, input) in ctx.outputs.iter_mut().zip(ctx.inputs.iter()) {
            output[..ctx.frames].copy_from_slice(&input[..ctx.frames]);
        }
        self.blocks.fetch_add(1, Ordering::AcqRel);
    }

    fn on_underrun(&mut self) {
        self.underruns.fetch_add(1, Ordering::AcqRel);
    }
}

fn wait_for_blocks(blocks: &AtomicU64, minimum: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while blocks.load(Ordering::Acquire) < minimum {
        assert!(Instant::now() < deadline, "timed out waiting for blocks");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn config(block_size: u32) -> DriverConfig {
    DriverConfig {
        device_name: "sim".into(),
        sample_rate: 48_000,
        block_size,
        buffer_count: 3,
        capture_channels: 2,
        playback_channels: 2,
    }
}

fn start(
    backend: SimBackend,
    block_size: u32,
) -> (AudioDriver<SimBackend>, Arc<AtomicU64>, Arc<AtomicU64>) {
    let blocks = Arc::new(AtomicU64::new(0));
    let underruns = Arc::new(AtomicU64::new(0));
    let mut driver = AudioDriver::new(backend);
    driver.open(config(block_size)).unwrap();
    let selection = ChannelSelection::all(driver.negotiated().unwrap());
    driver
        .activate(
            selection,
            PassThroughHost {
                blocks: blocks.clone(),
                underruns: underruns.clone(),
            },
        )
        .unwrap();
    (driver, blocks, underruns)
}

#[test]
fn test_round_trip_through_s24_3le() {
    // End-to-end scenario: S24_3LE device, block 128, 2 channels, input ramp
    // x[n] = n/128 per block; a pass-through "board" must reproduce the ramp
    // within codec tolerance.
    let backend = SimBackend::with_input(SampleFormat::S24P3Le, |frame, _ch| {
        (frame % 128) as f32 / 128.0
    });
    let (mut driver, blocks, underruns) = start(backend.clone(), 128);

    wait_for_blocks(&blocks, 8);
    driver.deactivate();

    assert_eq!(underruns.load(Ordering::Acquire), 0);
    let captured = backend.captured();
    assert_eq!(captured.len(), 2);
    let samples = &captured[0];
    assert!(samples.len() >= 8 * 128);
    for (i, &sample) in samples.iter().take(8 * 128).enumerate() {
        let expected = (i % 128) as f32 / 128.0;
        assert!(
            (sample - expected).abs() < 1e-5,
            "sample {i}: {sample} != {expected}"
        );
    }
}

#[test]
fn test_write_xrun_recovers_and_counts_once() {
    let backend = SimBackend::new(SampleFormat::S32Le);
    let (mut driver, blocks, underruns) = start(backend.clone(), 64);

    wait_for_blocks(&blocks, 3);
    let faulted_write = backend.counters().writes + 20;
    backend.inject_write_fault(faulted_write, PcmError::Xrun);

    // Recovery within 3 blocks of the fault.
    let at_fault = blocks.load(Ordering::Acquire);
    wait_for_blocks(&blocks, at_fault + 40);
    driver.deactivate();

    assert_eq!(underruns.load(Ordering::Acquire), 1);
    let counters = backend.counters();
    assert!(counters.prepares_playback >= 1, "playback was not prepared");
    assert_eq!(counters.opens, 1, "in-place recovery must not reopen");
}

#[test]
fn test_read_xrun_runs_full_recovery_sequence() {
    let backend = SimBackend::new(SampleFormat::S16Le);
    let (mut driver, blocks, underruns) = start(backend.clone(), 64);

    wait_for_blocks(&blocks, 2);
    backend.inject_read_fault(backend.counters().reads + 20, PcmError::Xrun);

    let at_fault = blocks.load(Ordering::Acquire);
    wait_for_blocks(&blocks, at_fault + 40);
    driver.deactivate();

    assert_eq!(underruns.load(Ordering::Acquire), 1);
    let counters = backend.counters();
    assert!(counters.unlinks >= 1, "streams were not unlinked");
    assert!(counters.links >= 1, "streams were not relinked");
    assert!(counters.prepares_capture >= 1);
    assert!(counters.prepares_playback >= 1);
    assert!(counters.starts >= 2, "capture was not restarted");
}

#[test]
fn test_failed_recovery_escalates_to_reopen() {
    let backend = SimBackend::new(SampleFormat::F32Le);
    let (mut driver, blocks, _underruns) = start(backend.clone(), 64);

    wait_for_blocks(&blocks, 2);
    // The read fails unrecoverably; the driver must close and reopen.
    backend.inject_read_fault(
        backend.counters().reads + 20,
        PcmError::Failed("cable pulled".into()),
    );

    let at_fault = blocks.load(Ordering::Acquire);
    wait_for_blocks(&blocks, at_fault + 40);
    driver.deactivate();

    assert_eq!(backend.counters().opens, 2, "expected a full reopen");
}

#[test]
fn test_deactivate_joins_quickly() {
    let backend = SimBackend::new(SampleFormat::F32Le);
    let (mut driver, blocks, _) = start(backend, 64);
    wait_for_blocks(&blocks, 2);

    let start = Instant::now();
    driver.deactivate();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!driver.is_active());
}

#[test]
fn test_open_error_surfaces_busy() {
    let backend = SimBackend::new(SampleFormat::F32Le);
    backend.inject_open_fault(PcmError::Busy("another process".into()));
    let mut driver = AudioDriver::new(backend);
    let err = driver.open(config(64)).unwrap_err();
    assert!(matches!(err, pedalrig_core::Error::DeviceBusy(_)));
}
