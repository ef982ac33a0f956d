//! The realtime block loop.
//!
//! One dedicated thread per driver, promoted to SCHED_FIFO. Each wakeup it
//! reconstructs exactly one block from capture (retrying short reads under a
//! bounded wait), decodes to planar f32, polls the MIDI sequencer, hands the
//! block to the host's process hook, encodes, and writes playback.
//!
//! Xruns are recovered in place (unlink, prepare both streams, relink,
//! refill playback with silence, restart capture). Five consecutive xrun
//! recoveries, or any recovery step failing, escalate to a full device
//! close/reopen bounded by [`RESTART_TIMEOUT`].

use crate::config::{DriverConfig, NegotiatedConfig};
use crate::cpu::{CpuMeter, CpuMetricsHandle, ProfileCategory};
use crate::pcm::{PcmBackend, PcmDevice, PcmError, PcmResult};
use crate::sched;
use crate::trace::RecoveryTrace;
use pedalrig_core::{AtomicFlag, AudioFormat, Error, Result};
use pedalrig_midi::{MidiEventBuffer, MidiSequencer, NullSequencer, RawMidiMessage};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bounded park while waiting for capture data; also the cooperative
/// termination latency ceiling.
const POLL_TIMEOUT_MS: i32 = 250;

/// Consecutive xrun recoveries tolerated before a full restart.
const MAX_RECOVERIES: u32 = 5;

/// Total budget for the close/reopen cycle: device removal, then
/// re-creation.
const RESTART_TIMEOUT: Duration = Duration::from_millis(1500);
const RESTART_STAGE: Duration = Duration::from_millis(750);
const RESTART_RETRY: Duration = Duration::from_millis(50);

/// Which hardware channels feed the engine, in engine-channel order.
#[derive(Clone, Debug, Default)]
pub struct ChannelSelection {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl ChannelSelection {
    /// Identity selection over the negotiated engine channel counts.
    pub fn all(negotiated: &NegotiatedConfig) -> Self {
        Self {
            inputs: (0..negotiated.capture_channels as usize).collect(),
            outputs: (0..negotiated.playback_channels as usize).collect(),
        }
    }
}

/// One block handed to the host's process hook.
pub struct ProcessContext<'a> {
    /// Selected capture channels, planar, exactly `frames` samples each.
    pub inputs: &'a [Box<[f32]>],
    /// Selected playback channels; the host writes the full block.
    pub outputs: &'a mut [Box<[f32]>],
    pub frames: usize,
    /// MIDI events polled during this block, in arrival order.
    pub midi: &'a MidiEventBuffer,
}

/// Engine-side callbacks invoked from the realtime thread.
pub trait AudioDriverHost: Send + 'static {
    /// Called once on the realtime thread before the first block.
    fn on_audio_started(&mut self) {}

    /// Called once per block. Must not allocate or block.
    fn on_process(&mut self, ctx: ProcessContext<'_>);

    /// An under/overrun was detected (counter semantics; recovery is the
    /// driver's business).
    fn on_underrun(&mut self) {}

    /// The stream died and could not be restarted; zero-input blocks follow
    /// until deactivation.
    fn on_driver_stopped(&mut self) {}

    /// Last callback before the thread exits.
    fn on_audio_terminated(&mut self) {}
}

/// The audio driver: owns the device handles and the realtime thread.
///
/// Lifecycle: `open` -> `activate` -> `deactivate` -> `close`. Activation
/// moves the device into the thread; running again after `deactivate`
/// requires a fresh `open`.
pub struct AudioDriver<B: PcmBackend> {
    backend: Arc<B>,
    config: Option<DriverConfig>,
    negotiated: Option<NegotiatedConfig>,
    device: Option<B::Device>,
    sequencer: Option<Box<dyn MidiSequencer>>,
    thread: Option<JoinHandle<()>>,
    terminate: Arc<AtomicFlag>,
    trace: RecoveryTrace,
    cpu: CpuMetricsHandle,
}

impl<B: PcmBackend> AudioDriver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            config: None,
            negotiated: None,
            device: None,
            sequencer: None,
            thread: None,
            terminate: Arc::new(AtomicFlag::new(false)),
            trace: RecoveryTrace::new(),
            cpu: CpuMetricsHandle::default(),
        }
    }

    /// Opens and configures the device. Fails with `DeviceBusy`,
    /// `PermissionDenied`, or `UnsupportedFormat` per the device's answer.
    pub fn open(&mut self, config: DriverConfig) -> Result<()> {
        if self.device.is_some() || self.thread.is_some() {
            return Err(Error::Driver("driver already open".into()));
        }
        config.validate().map_err(Error::InvalidConfig)?;
        let device = self
            .backend
            .open(&config)
            .map_err(|e| e.into_open_error(&config.device_name))?;
        tracing::info!(
            description = %device.negotiated().description(&config.device_name),
            "audio device opened"
        );
        self.negotiated = Some(device.negotiated().clone());
        self.device = Some(device);
        self.config = Some(config);
        Ok(())
    }

    pub fn negotiated(&self) -> Option<&NegotiatedConfig> {
        self.negotiated.as_ref()
    }

    /// Diagnostic description of the open configuration.
    pub fn description(&self) -> Option<String> {
        match (&self.negotiated, &self.config) {
            (Some(negotiated), Some(config)) => {
                Some(negotiated.description(&config.device_name))
            }
            _ => None,
        }
    }

    /// Installs the MIDI event source polled once per block. Takes effect at
    /// the next `activate`.
    pub fn set_midi_sequencer(&mut self, sequencer: Box<dyn MidiSequencer>) {
        self.sequencer = Some(sequencer);
    }

    pub fn cpu_metrics(&self) -> CpuMetricsHandle {
        self.cpu.clone()
    }

    pub fn recovery_trace(&self) -> RecoveryTrace {
        self.trace.clone()
    }

    pub fn is_active(&self) -> bool {
        self.thread.is_some()
    }

    /// Spawns the realtime thread over the selected channels.
    pub fn activate<H: AudioDriverHost>(
        &mut self,
        selection: ChannelSelection,
        host: H,
    ) -> Result<()> {
        let device = self
            .device
            .take()
            .ok_or_else(|| Error::Driver("driver not open".into()))?;
        let config = self
            .config
            .clone()
            .ok_or_else(|| Error::Driver("driver not open".into()))?;

        let negotiated = device.negotiated();
        let max_in = negotiated.hw_capture_channels as usize;
        let max_out = negotiated.hw_playback_channels as usize;
        if selection.inputs.iter().any(|&c| c >= max_in)
            || selection.outputs.iter().any(|&c| c >= max_out)
        {
            self.device = Some(device);
            return Err(Error::InvalidConfig("channel selection out of range".into()));
        }

        self.terminate.set(false);
        let thread_name = device.driver_name();
        let ctx = ThreadContext {
            device: Some(device),
            host,
            backend: self.backend.clone(),
            config,
            selection,
            sequencer: self
                .sequencer
                .take()
                .unwrap_or_else(|| Box::new(NullSequencer)),
            terminate: self.terminate.clone(),
            trace: self.trace.clone(),
            cpu: self.cpu.clone(),
            consecutive_xruns: 0,
        };
        let handle = std::thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || audio_thread(ctx))
            .map_err(|e| Error::Driver(format!("failed to spawn audio thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Signals termination and joins the realtime thread.
    pub fn deactivate(&mut self) {
        self.terminate.set(true);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Releases the device handles.
    pub fn close(&mut self) {
        self.deactivate();
        self.device = None;
        self.negotiated = None;
        self.config = None;
    }
}

impl<B: PcmBackend> Drop for AudioDriver<B> {
    fn drop(&mut self) {
        self.close();
    }
}

struct ThreadContext<B: PcmBackend, H: AudioDriverHost> {
    device: Option<B::Device>,
    host: H,
    backend: Arc<B>,
    config: DriverConfig,
    selection: ChannelSelection,
    sequencer: Box<dyn MidiSequencer>,
    terminate: Arc<AtomicFlag>,
    trace: RecoveryTrace,
    cpu: CpuMetricsHandle,
    consecutive_xruns: u32,
}

impl<B: PcmBackend, H: AudioDriverHost> ThreadContext<B, H> {
    fn device(&mut self) -> PcmResult<&mut B::Device> {
        self.device
            .as_mut()
            .ok_or_else(|| PcmError::Failed("device closed".into()))
    }
}

struct BlockBuffers {
    format: AudioFormat,
    block: usize,
    hw_in: usize,
    hw_out: usize,
    in_frame_size: usize,
    out_frame_size: usize,
    raw_in: Vec<u8>,
    raw_out: Vec<u8>,
    planar_in: Vec<Box<[f32]>>,
    planar_out: Vec<Box<[f32]>>,
    active_in: Vec<Box<[f32]>>,
    active_out: Vec<Box<[f32]>>,
    midi: MidiEventBuffer,
    message: RawMidiMessage,
}

impl BlockBuffers {
    fn new(negotiated: &NegotiatedConfig, selection: &ChannelSelection) -> Self {
        let format = AudioFormat::new(negotiated.format);
        let block = negotiated.block_size as usize;
        let hw_in = negotiated.hw_capture_channels as usize;
        let hw_out = negotiated.hw_playback_channels as usize;
        let planar = |n: usize| -> Vec<Box<[f32]>> {
            (0..n).map(|_| vec![0.0f32; block].into_boxed_slice()).collect()
        };
        Self {
            format,
            block,
            hw_in,
            hw_out,
            in_frame_size: format.frame_size(hw_in),
            out_frame_size: format.frame_size(hw_out),
            raw_in: vec![0u8; format.frame_size(hw_in) * block],
            raw_out: vec![0u8; format.frame_size(hw_out) * block],
            planar_in: planar(hw_in),
            planar_out: planar(hw_out),
            active_in: planar(selection.inputs.len()),
            active_out: planar(selection.outputs.len()),
            midi: MidiEventBuffer::new(),
            message: RawMidiMessage::default(),
        }
    }

    fn zero_inputs(&mut self) {
        for channel in &mut self.active_in {
            channel.fill(0.0);
        }
    }
}

fn audio_thread<B: PcmBackend, H: AudioDriverHost>(mut ctx: ThreadContext<B, H>) {
    sched::promote_current_thread();

    let negotiated = match ctx.device.as_ref() {
        Some(device) => device.negotiated().clone(),
        None => return,
    };
    let mut buffers = BlockBuffers::new(&negotiated, &ctx.selection);

    ctx.host.on_audio_started();

    match run_blocks(&mut ctx, &negotiated, &mut buffers) {
        Ok(()) => {
            // One zero-input pass so downstream teardown observes a
            // consistent state.
            buffers.zero_inputs();
            buffers.midi.clear();
            ctx.host.on_process(ProcessContext {
                inputs: &buffers.active_in,
                outputs: &mut buffers.active_out,
                frames: buffers.block,
                midi: &buffers.midi,
            });
        }
        Err(err) => {
            tracing::error!(%err, "audio thread terminated abnormally");
            if !ctx.terminate.get() {
                ctx.host.on_driver_stopped();
                pump_zero_blocks(&mut ctx, &mut buffers);
            }
        }
    }

    ctx.host.on_audio_terminated();
}

/// Keeps delivering zero-input blocks after a fatal stream error so the
/// host's control plane stays responsive until deactivation.
fn pump_zero_blocks<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    buffers: &mut BlockBuffers,
) {
    buffers.zero_inputs();
    while !ctx.terminate.get() {
        std::thread::sleep(Duration::from_millis(10));
        buffers.midi.clear();
        ctx.host.on_process(ProcessContext {
            inputs: &buffers.active_in,
            outputs: &mut buffers.active_out,
            frames: buffers.block,
            midi: &buffers.midi,
        });
    }
}

fn run_blocks<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    negotiated: &NegotiatedConfig,
    buffers: &mut BlockBuffers,
) -> PcmResult<()> {
    let mut cpu = CpuMeter::new(&ctx.cpu, negotiated.block_size, negotiated.sample_rate);

    fill_playback_silence(ctx.device()?, buffers.out_frame_size)?;
    ctx.device()?.start_capture()?;

    loop {
        if ctx.terminate.get() {
            return Ok(());
        }
        cpu.begin_block();
        buffers.midi.clear();

        if !read_block(ctx, buffers)? {
            continue; // xrun recovered (or termination noticed); skip block
        }
        cpu.add_sample(ProfileCategory::Read);

        (buffers.format.decode)(
            &buffers.raw_in,
            &mut buffers.planar_in,
            buffers.hw_in,
            buffers.block,
        );
        for (active, &hw) in buffers.active_in.iter_mut().zip(&ctx.selection.inputs) {
            active.copy_from_slice(&buffers.planar_in[hw]);
        }
        cpu.add_sample(ProfileCategory::Codec);

        ctx.host.on_process(ProcessContext {
            inputs: &buffers.active_in,
            outputs: &mut buffers.active_out,
            frames: buffers.block,
            midi: &buffers.midi,
        });
        cpu.add_sample(ProfileCategory::Execute);

        for channel in &mut buffers.planar_out {
            channel.fill(0.0);
        }
        for (active, &hw) in buffers.active_out.iter().zip(&ctx.selection.outputs) {
            buffers.planar_out[hw].copy_from_slice(active);
        }
        (buffers.format.encode)(
            &buffers.planar_out,
            &mut buffers.raw_out,
            buffers.hw_out,
            buffers.block,
        );
        cpu.add_sample(ProfileCategory::Codec);

        match write_block(ctx, buffers) {
            Ok(()) => {
                ctx.consecutive_xruns = 0;
            }
            Err(err) => {
                ctx.host.on_underrun();
                recover_output(ctx, err, buffers)?;
            }
        }
        cpu.add_sample(ProfileCategory::Write);
        cpu.end_block();
    }
}

/// Reads exactly one block, reconstructing across short reads. Returns
/// false when the block was abandoned to xrun recovery or termination.
fn read_block<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    buffers: &mut BlockBuffers,
) -> PcmResult<bool> {
    let mut frames_read = 0usize;
    while frames_read < buffers.block {
        read_midi(
            ctx.sequencer.as_mut(),
            &mut buffers.midi,
            &mut buffers.message,
            frames_read as u32,
        );

        let offset = frames_read * buffers.in_frame_size;
        let wanted = buffers.block - frames_read;
        let result = ctx.device()?.read(&mut buffers.raw_in[offset..], wanted);
        match result {
            Ok(0) | Err(PcmError::Again) => {
                if ctx.terminate.get() {
                    return Ok(false);
                }
                ctx.device()?.wait(POLL_TIMEOUT_MS)?;
            }
            Ok(frames) => frames_read += frames,
            Err(err) => {
                ctx.host.on_underrun();
                recover_input(ctx, err, frames_read as i64, buffers)?;
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn read_midi(
    sequencer: &mut dyn MidiSequencer,
    midi: &mut MidiEventBuffer,
    message: &mut RawMidiMessage,
    frame: u32,
) {
    while sequencer.read_message(message, 0) {
        if message.data.is_empty() {
            continue;
        }
        // META messages do not propagate to plugins.
        if message.data[0] == 0xFF && message.data.len() > 1 {
            continue;
        }
        midi.push(message.timestamp, frame, &message.data);
    }
}

fn write_block<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    buffers: &mut BlockBuffers,
) -> PcmResult<()> {
    let mut written = 0usize;
    while written < buffers.block {
        let offset = written * buffers.out_frame_size;
        match ctx
            .device()?
            .write(&buffers.raw_out[offset..], buffers.block - written)
        {
            Ok(0) | Err(PcmError::Again) => continue,
            Ok(frames) => written += frames,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Pre-loads the playback stream with silence until the device reports no
/// free space, bounded against devices that never fill.
fn fill_playback_silence<D: PcmDevice>(device: &mut D, frame_size: usize) -> PcmResult<()> {
    let silence = [0u8; 4096];
    let chunk_frames = silence.len() / frame_size.max(1);
    let mut retries = 0;
    loop {
        let avail = match device.playback_avail() {
            Ok(avail) => avail,
            Err(PcmError::Again) => return Ok(()),
            Err(_) => {
                retries += 1;
                if retries >= 5 {
                    return Err(PcmError::Failed(
                        "timed out filling the playback buffer".into(),
                    ));
                }
                device.prepare_playback()?;
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        if avail == 0 {
            return Ok(());
        }
        let frames = avail.min(chunk_frames);
        device.write(&silence[..frames * frame_size], frames)?;
    }
}

fn recover_input<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    err: PcmError,
    buffered_frames: i64,
    buffers: &mut BlockBuffers,
) -> PcmResult<()> {
    record_trace(ctx, b'r', buffered_frames);
    ctx.consecutive_xruns += 1;
    if ctx.consecutive_xruns >= MAX_RECOVERIES {
        tracing::warn!("too many consecutive xruns; restarting audio device");
        return restart_device(ctx, buffers);
    }

    let outcome = (|| -> PcmResult<()> {
        match err {
            PcmError::Xrun => {
                let frame_size = buffers.out_frame_size;
                let device = ctx.device()?;
                // Unlink before recovery so prepare does not trip the peer
                // stream, then resynchronize.
                device.unlink()?;
                device.prepare_playback()?;
                device.prepare_capture()?;
                device.link()?;
                fill_playback_silence(device, frame_size)?;
                device.start_capture()?;
                Ok(())
            }
            PcmError::Suspended => {
                let device = ctx.device()?;
                let mut tries = 0;
                loop {
                    match device.resume() {
                        Ok(()) => break,
                        Err(PcmError::Again) if tries < 1000 => {
                            tries += 1;
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Err(_) => {
                            device.prepare_capture()?;
                            break;
                        }
                    }
                }
                Ok(())
            }
            other => Err(other),
        }
    })();

    match outcome {
        Ok(()) => Ok(()),
        Err(inner) => {
            tracing::warn!(%inner, "capture recovery failed; restarting audio device");
            restart_device(ctx, buffers)
        }
    }
}

fn recover_output<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    err: PcmError,
    buffers: &mut BlockBuffers,
) -> PcmResult<()> {
    record_trace(ctx, b'w', buffers.block as i64);
    ctx.consecutive_xruns += 1;
    if ctx.consecutive_xruns >= MAX_RECOVERIES {
        tracing::warn!("too many consecutive xruns; restarting audio device");
        return restart_device(ctx, buffers);
    }

    let outcome = (|| -> PcmResult<()> {
        match err {
            PcmError::Xrun => {
                let frame_size = buffers.out_frame_size;
                let device = ctx.device()?;
                device.prepare_playback()?;
                device.drain_capture()?;
                fill_playback_silence(device, frame_size)?;
                device.prepare_capture()?;
                device.start_capture()?;
                record_trace(ctx, b'x', 0);
                Ok(())
            }
            other => Err(other),
        }
    })();

    match outcome {
        Ok(()) => Ok(()),
        Err(inner) => {
            tracing::warn!(%inner, "playback recovery failed; restarting audio device");
            restart_device(ctx, buffers)
        }
    }
}

/// Full close/reopen cycle: waits out device removal, then re-creation, in
/// two bounded stages.
fn restart_device<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    buffers: &mut BlockBuffers,
) -> PcmResult<()> {
    record_trace(ctx, b'R', 0);
    ctx.device = None; // release handles before reopening

    let start = Instant::now();
    loop {
        if ctx.terminate.get() {
            return Err(PcmError::Failed("terminated during restart".into()));
        }
        match ctx.backend.open(&ctx.config) {
            Ok(device) => {
                ctx.device = Some(device);
                let frame_size = buffers.out_frame_size;
                let device = ctx.device()?;
                fill_playback_silence(device, frame_size)?;
                device.start_capture()?;
                ctx.consecutive_xruns = 0;
                tracing::info!("audio device restarted");
                return Ok(());
            }
            Err(PcmError::Busy(_)) if start.elapsed() < RESTART_STAGE => {
                // Stage one: the dying handle may not have released yet.
                std::thread::sleep(RESTART_RETRY);
            }
            Err(_) if start.elapsed() < RESTART_TIMEOUT => {
                // Stage two: wait for the device node to come back.
                std::thread::sleep(RESTART_RETRY);
            }
            Err(err) => {
                tracing::error!(%err, "audio device restart failed");
                return Err(err);
            }
        }
    }
}

fn record_trace<B: PcmBackend, H: AudioDriverHost>(
    ctx: &mut ThreadContext<B, H>,
    code: u8,
    buffered_frames: i64,
) {
    let (in_avail, out_avail) = match ctx.device.as_mut() {
        Some(device) => (
            device.capture_avail().map(|a| a as i64).unwrap_or(-1),
            device.playback_avail().map(|a| a as i64).unwrap_or(-1),
        ),
        None => (-1, -1),
    };
    ctx.trace.record(code, in_avail, out_avail, buffered_frames);
}
