//! The engine: driver + realtime host + control plane + services, wired.

use crate::board::Pedalboard;
use crate::control::{ControlPlane, LearnedKey};
use crate::plan::LoadError;
use crate::registry::{PluginRegistry, Preset};
use crate::rt::{EngineCommand, EngineRt, EngineReturn};
use pedalrig_core::messages::{host_to_rt_ring, rt_ring_capacity, rt_to_host_ring};
use pedalrig_core::{signal, AtomicCounter, CrashGuard, Error, Result, VuReading, Worker};
use pedalrig_driver::{
    AudioDriver, ChannelSelection, CpuMetrics, DriverConfig, DummyBackend, PcmBackend,
    RtInversionGuard, TraceEntry,
};
use pedalrig_midi::MidiSequencer;
use ringbuf::traits::Split;
use ringbuf::HeapRb;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Sizing assumption for the telemetry ring.
const MAX_EFFECTS: usize = 32;
const COMMAND_RING_BYTES: usize = 16 * 1024;
const BOARD_RING_DEPTH: usize = 4;

/// The running appliance engine.
///
/// Generic over the PCM backend; the default is the dummy device, tests use
/// the scripted simulator, and hardware plugs in through the same trait.
pub struct Engine<B: PcmBackend = DummyBackend> {
    driver: AudioDriver<B>,
    control: ControlPlane,
    worker: Worker,
    crash_guard: Arc<CrashGuard>,
    registry: Arc<PluginRegistry>,
    underruns: Arc<AtomicCounter>,
    plugin_faults: Arc<AtomicCounter>,
    preset_rx: crossbeam_channel::Receiver<(u64, Vec<(String, f32)>)>,
    preset_tx: crossbeam_channel::Sender<(u64, Vec<(String, f32)>)>,
    crash_tripped: bool,
}

impl Engine<DummyBackend> {
    pub fn builder() -> EngineBuilder<DummyBackend> {
        EngineBuilder::new()
    }
}

impl<B: PcmBackend> Engine<B> {
    /// Loads the user's pedalboard. When the crash guard has tripped, the
    /// empty board is loaded instead and `RepeatedCrash` is returned; the
    /// user's board stays on disk untouched.
    pub fn load_pedalboard(&mut self, board: &Pedalboard) -> Result<Vec<LoadError>> {
        if self.crash_guard.has_crashed() {
            self.crash_tripped = true;
            self.control.set_pedalboard(&Pedalboard::empty())?;
            return Err(Error::RepeatedCrash);
        }
        self.control.set_pedalboard(board)
    }

    /// True when the crash guard refused the user's board this boot.
    pub fn has_crashed(&self) -> bool {
        self.crash_tripped
    }

    /// Re-arms after the user chose to retry their board.
    pub fn clear_crash_guard(&mut self) {
        self.crash_guard.clear();
        self.crash_tripped = false;
    }

    /// Host housekeeping: drains realtime telemetry, retired boards, and
    /// finished worker jobs. Call at UI rate.
    pub fn poll(&mut self) {
        self.control.poll();
        while let Ok((instance_id, values)) = self.preset_rx.try_recv() {
            for (symbol, value) in values {
                if let Err(err) = self.control.set_control(instance_id, &symbol, value) {
                    tracing::warn!(%err, instance_id, "preset value rejected");
                }
            }
        }
    }

    pub fn set_control(&mut self, instance_id: u64, symbol: &str, value: f32) -> Result<u64> {
        self.control.set_control(instance_id, symbol, value)
    }

    pub fn set_bypass(&mut self, instance_id: u64, enable: bool) -> Result<u64> {
        self.control.set_bypass(instance_id, enable)
    }

    pub fn set_input_db(&mut self, db: f32) -> Result<u64> {
        self.control.set_input_db(db)
    }

    pub fn set_output_db(&mut self, db: f32) -> Result<u64> {
        self.control.set_output_db(db)
    }

    pub fn snapshot_vu(&mut self, instance_id: u64) -> HashMap<u32, VuReading> {
        self.control.poll();
        self.control.snapshot_vu(instance_id)
    }

    pub fn get_output_control(&mut self, instance_id: u64, symbol: &str) -> Result<f32> {
        self.control.poll();
        self.control.get_output_control(instance_id, symbol)
    }

    pub fn midi_learn(&mut self, instance_id: u64, symbol: &str) -> Result<u64> {
        self.control.midi_learn(instance_id, symbol)
    }

    pub fn take_learned_key(&mut self) -> Option<LearnedKey> {
        self.control.poll();
        self.control.take_learned_key()
    }

    pub fn list_factory_presets(&self, plugin_uri: &str) -> Vec<Preset> {
        self.registry.factory_presets(plugin_uri)
    }

    /// Resolves the preset on the worker thread; the values land as
    /// ordinary control changes on a later [`poll`](Self::poll).
    pub fn load_factory_preset(&mut self, instance_id: u64, preset_uri: &str) -> Result<()> {
        let registry = self.registry.clone();
        let preset_uri = preset_uri.to_string();
        let tx = self.preset_tx.clone();
        self.worker.post(move || {
            let Some(preset) = registry.find_preset(&preset_uri) else {
                tracing::warn!(preset_uri = %preset_uri, "factory preset not found");
                return;
            };
            let values: Vec<(String, f32)> = preset.values.into_iter().collect();
            let _ = tx.send((instance_id, values));
        });
        Ok(())
    }

    /// Blocks until the realtime thread has observed everything sent so
    /// far. Returns false on timeout.
    pub fn sync(&mut self, timeout: Duration) -> bool {
        self.control.sync(timeout)
    }

    pub fn control_plane(&mut self) -> &mut ControlPlane {
        &mut self.control
    }

    pub fn description(&self) -> Option<String> {
        self.driver.description()
    }

    pub fn cpu_metrics(&self) -> CpuMetrics {
        self.driver.cpu_metrics().snapshot()
    }

    pub fn recovery_trace(&self) -> Vec<TraceEntry> {
        self.driver.recovery_trace().dump()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.get()
    }

    pub fn plugin_faults(&self) -> u64 {
        self.plugin_faults.get()
    }

    /// True once a termination signal arrived; the owner should call
    /// [`shutdown`](Self::shutdown).
    pub fn shutdown_requested(&self) -> bool {
        signal::shutdown_requested()
    }

    /// Stops audio and releases the device. `normal` selects exit code 0
    /// (do not restart) over 1 (supervisor restarts).
    pub fn shutdown(&mut self, normal: bool) {
        if normal {
            signal::request_shutdown(true);
        }
        {
            let _guard = RtInversionGuard::new();
            self.driver.deactivate();
        }
        self.control.poll();
        self.driver.close();
    }

    /// Exit code for the service supervisor.
    pub fn exit_code(&self) -> i32 {
        signal::exit_code()
    }
}

impl<B: PcmBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.driver.deactivate();
    }
}

/// Builder for [`Engine`]. Everything here is frozen once `build` returns.
pub struct EngineBuilder<B: PcmBackend = DummyBackend> {
    backend: B,
    config: DriverConfig,
    crash_guard_path: Option<PathBuf>,
    registry: Option<PluginRegistry>,
    sequencer: Option<Box<dyn MidiSequencer>>,
}

impl EngineBuilder<DummyBackend> {
    pub fn new() -> Self {
        Self {
            backend: DummyBackend,
            config: DriverConfig::default(),
            crash_guard_path: None,
            registry: None,
            sequencer: None,
        }
    }
}

impl Default for EngineBuilder<DummyBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: PcmBackend> EngineBuilder<B> {
    /// Swaps the PCM backend (hardware, dummy, or the test simulator).
    pub fn backend<B2: PcmBackend>(self, backend: B2) -> EngineBuilder<B2> {
        EngineBuilder {
            backend,
            config: self.config,
            crash_guard_path: self.crash_guard_path,
            registry: self.registry,
            sequencer: self.sequencer,
        }
    }

    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables the persistent crash guard at `path`.
    pub fn crash_guard_path(mut self, path: PathBuf) -> Self {
        self.crash_guard_path = Some(path);
        self
    }

    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn midi_sequencer(mut self, sequencer: Box<dyn MidiSequencer>) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    /// Opens the device, spawns the realtime thread, and returns the
    /// running engine.
    pub fn build(self) -> Result<Engine<B>> {
        signal::install_termination_handlers();

        let crash_guard = Arc::new(match self.crash_guard_path {
            Some(path) => CrashGuard::open(path),
            None => CrashGuard::disabled(),
        });
        let registry = Arc::new(self.registry.unwrap_or_default());

        let mut driver = AudioDriver::new(self.backend);
        {
            let _guard = RtInversionGuard::new();
            driver.open(self.config)?;
        }
        if let Some(sequencer) = self.sequencer {
            driver.set_midi_sequencer(sequencer);
        }

        let negotiated = driver
            .negotiated()
            .cloned()
            .ok_or_else(|| Error::Driver("device reported no configuration".into()))?;
        let selection = ChannelSelection::all(&negotiated);
        let channels = selection.inputs.len().max(selection.outputs.len());

        let (command_writer, host_reader) = host_to_rt_ring(COMMAND_RING_BYTES);
        let (rt_writer, rt_reader) =
            rt_to_host_ring(rt_ring_capacity(MAX_EFFECTS, channels.max(2)));
        let (board_tx, board_rx) = HeapRb::<EngineCommand>::new(BOARD_RING_DEPTH).split();
        let (return_tx, return_rx) =
            HeapRb::<EngineReturn>::new(BOARD_RING_DEPTH + 2).split();

        let underruns = Arc::new(AtomicCounter::new());
        let plugin_faults = Arc::new(AtomicCounter::new());

        let rt = EngineRt::new(
            board_rx,
            return_tx,
            host_reader,
            rt_writer,
            crash_guard.clone(),
            underruns.clone(),
            plugin_faults.clone(),
            negotiated.sample_rate,
        );
        {
            let _guard = RtInversionGuard::new();
            driver.activate(selection, rt)?;
        }

        let control = ControlPlane::new(
            command_writer,
            rt_reader,
            board_tx,
            return_rx,
            registry.clone(),
            negotiated.sample_rate as f64,
            negotiated.block_size as usize,
            channels,
        );

        let (preset_tx, preset_rx) = crossbeam_channel::unbounded();

        Ok(Engine {
            driver,
            control,
            worker: Worker::spawn(),
            crash_guard,
            registry,
            underruns,
            plugin_faults,
            preset_rx,
            preset_tx,
            crash_tripped: false,
        })
    }
}
