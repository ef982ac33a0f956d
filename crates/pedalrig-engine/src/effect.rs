//! Effect instances: one loaded plugin presented through a uniform realtime
//! interface.
//!
//! [`Plugin`] is the hot trait third-party wrappers and built-ins implement;
//! [`EffectInstance`] wraps one plugin with everything the pedalboard needs
//! around it: the control table, the bounded parameter queue, bypass with
//! edge crossfade, per-channel VU accumulation, and fault containment.

use parking_lot::Mutex;
use pedalrig_core::VuAccumulator;
use pedalrig_midi::PortRange;
use smallvec::SmallVec;
use std::sync::Arc;

/// Bounded parameter-change queue depth; overflow drops the oldest change.
const PARAM_QUEUE_DEPTH: usize = 64;

/// Metadata for one control port.
#[derive(Clone, Debug)]
pub struct ControlPortInfo {
    pub symbol: String,
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub integer: bool,
    pub toggled: bool,
    /// Enumeration scale-point values; non-empty means the port quantizes.
    pub scale_points: Vec<f32>,
    /// Output control: written by the plugin, read by the host (meters).
    pub is_output: bool,
}

impl ControlPortInfo {
    pub fn input(symbol: &str, name: &str, min: f32, max: f32, default: f32) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            min,
            max,
            default,
            integer: false,
            toggled: false,
            scale_points: Vec::new(),
            is_output: false,
        }
    }

    pub fn output(symbol: &str, name: &str, min: f32, max: f32) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            min,
            max,
            default: min,
            integer: false,
            toggled: false,
            scale_points: Vec::new(),
            is_output: true,
        }
    }

    pub fn toggle(symbol: &str, name: &str, default: bool) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            min: 0.0,
            max: 1.0,
            default: if default { 1.0 } else { 0.0 },
            integer: false,
            toggled: true,
            scale_points: Vec::new(),
            is_output: false,
        }
    }

    /// The router's cached view of this port.
    pub fn range(&self) -> PortRange {
        PortRange {
            min: self.min,
            max: self.max,
            integer: self.integer,
            toggled: self.toggled,
            scale_points: self.scale_points.clone(),
        }
    }
}

/// A non-numeric (patch) property value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchValue {
    Path(String),
    Blob(Vec<u8>),
}

/// The processing interface a hosted plugin exposes.
///
/// `process` is the single hot method; everything else is called at load
/// time or block-rate with realtime constraints noted per method.
pub trait Plugin: Send {
    fn uri(&self) -> &str;

    /// Control-port table; index order is the wire order used by
    /// `SET_CONTROL` messages.
    fn ports(&self) -> &[ControlPortInfo];

    /// `(audio_inputs, audio_outputs)`.
    fn audio_io(&self) -> (usize, usize);

    /// Non-realtime; allocations allowed.
    fn prepare(&mut self, sample_rate: f64, max_block: usize);

    /// Realtime-safe; idempotent.
    fn activate(&mut self) {}

    /// Realtime-safe; idempotent. A flush `process` with zero input runs
    /// before this is called.
    fn deactivate(&mut self) {}

    /// Realtime-safe.
    fn set_control(&mut self, index: usize, value: f32);

    /// Realtime-safe.
    fn get_control(&self, index: usize) -> f32;

    /// Realtime; must not allocate.
    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize);

    /// Realtime-safe; returns borrowed bytes for the requested property.
    fn patch_property(&self, _property: u32) -> Option<&[u8]> {
        None
    }
}

/// Lifecycle states; transitions are strictly monotonic per load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Prepared,
    Active,
}

/// Host-readable snapshot slot for one gathered patch property.
///
/// The realtime thread fills it with `try_lock` (skipping, and retrying next
/// block, if the host is mid-read); `seq` bumps on every successful fill so
/// the host can await fresh data.
pub struct PatchSlot {
    inner: Mutex<PatchSlotData>,
}

struct PatchSlotData {
    seq: u64,
    property: u32,
    bytes: Vec<u8>,
}

impl PatchSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PatchSlotData {
                seq: 0,
                property: 0,
                bytes: Vec::with_capacity(256),
            }),
        })
    }

    /// Host side: `(seq, property, bytes)` of the latest gather.
    pub fn read(&self) -> (u64, u32, Vec<u8>) {
        let data = self.inner.lock();
        (data.seq, data.property, data.bytes.clone())
    }
}

/// One plugin instance plus its pedalboard-facing state.
pub struct EffectInstance {
    instance_id: u64,
    plugin: Box<dyn Plugin>,
    state: LifecycleState,
    /// Current plain control values, written only on the realtime thread
    /// once the instance is live.
    values: Vec<f32>,
    param_queue: SmallVec<[(u32, f32); PARAM_QUEUE_DEPTH]>,
    bypass: bool,
    /// Set when bypass changed this block and the output must crossfade.
    bypass_edge: bool,
    forced_bypass: bool,
    fault_count: u64,
    vu: Vec<VuAccumulator>,
    patch_slot: Arc<PatchSlot>,
    pending_patch: Option<u32>,
}

impl EffectInstance {
    pub fn new(instance_id: u64, plugin: Box<dyn Plugin>) -> Self {
        let values: Vec<f32> = plugin.ports().iter().map(|p| p.default).collect();
        let (_, outs) = plugin.audio_io();
        Self {
            instance_id,
            vu: vec![VuAccumulator::new(); outs],
            values,
            plugin,
            state: LifecycleState::Created,
            param_queue: SmallVec::new(),
            bypass: false,
            bypass_edge: false,
            forced_bypass: false,
            fault_count: 0,
            patch_slot: PatchSlot::new(),
            pending_patch: None,
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn uri(&self) -> &str {
        self.plugin.uri()
    }

    pub fn ports(&self) -> &[ControlPortInfo] {
        self.plugin.ports()
    }

    pub fn audio_io(&self) -> (usize, usize) {
        self.plugin.audio_io()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn control_index(&self, symbol: &str) -> Option<usize> {
        self.plugin.ports().iter().position(|p| p.symbol == symbol)
    }

    pub fn patch_slot(&self) -> Arc<PatchSlot> {
        self.patch_slot.clone()
    }

    /// Non-realtime. Allocations allowed; resets the lifecycle to Prepared.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        self.plugin.prepare(sample_rate, max_block);
        self.state = LifecycleState::Prepared;
        // Push the persisted values into the freshly prepared plugin.
        for (index, &value) in self.values.clone().iter().enumerate() {
            self.plugin.set_control(index, value);
        }
    }

    /// Realtime-safe; idempotent.
    pub fn activate(&mut self) {
        debug_assert!(self.state != LifecycleState::Created, "activate before prepare");
        if self.state != LifecycleState::Active {
            self.plugin.activate();
            self.state = LifecycleState::Active;
        }
    }

    /// Realtime-safe. Runs one zero-input flush pass before deactivating.
    pub fn deactivate(&mut self, scratch: &mut FlushScratch) {
        if self.state != LifecycleState::Active {
            return;
        }
        scratch.flush(self.plugin.as_mut());
        self.plugin.deactivate();
        self.state = LifecycleState::Prepared;
    }

    /// Direct write, realtime context (or host context before the board
    /// goes live).
    pub fn set_control_direct(&mut self, index: usize, value: f32) {
        if index < self.values.len() {
            self.values[index] = value;
            self.plugin.set_control(index, value);
        }
    }

    /// Enqueues a change to be applied at the head of the next `run`.
    /// Overflow drops the oldest queued change for this effect.
    pub fn queue_control(&mut self, index: u32, value: f32) {
        if self.param_queue.len() == PARAM_QUEUE_DEPTH {
            self.param_queue.remove(0);
        }
        self.param_queue.push((index, value));
    }

    pub fn get_control(&self, index: usize) -> f32 {
        self.values.get(index).copied().unwrap_or(0.0)
    }

    /// Output-control ports read live from the plugin.
    pub fn get_output_control(&self, index: usize) -> f32 {
        self.plugin.get_control(index)
    }

    pub fn set_bypass(&mut self, enable: bool) {
        if self.bypass != enable {
            self.bypass = enable;
            self.bypass_edge = true;
        }
    }

    /// Initial bypass state at load time; no crossfade edge.
    pub fn set_bypass_immediate(&mut self, enable: bool) {
        self.bypass = enable;
        self.bypass_edge = false;
    }

    pub fn bypassed(&self) -> bool {
        self.bypass || self.forced_bypass
    }

    pub fn fault_count(&self) -> u64 {
        self.fault_count
    }

    /// Arms a patch-property gather; serviced at the end of the next `run`.
    pub fn request_patch_property(&mut self, property: u32) {
        self.pending_patch = Some(property);
    }

    /// Fills the patch slot if a gather is pending. Realtime-safe.
    pub fn gather_patch_properties(&mut self) {
        let Some(property) = self.pending_patch else {
            return;
        };
        let Some(mut slot) = self.patch_slot.inner.try_lock() else {
            return; // host is reading; retry next block
        };
        let bytes = self.plugin.patch_property(property).unwrap_or(&[]);
        if bytes.len() <= slot.bytes.capacity() {
            slot.bytes.clear();
            slot.bytes.extend_from_slice(bytes);
            slot.property = property;
            slot.seq += 1;
        }
        self.pending_patch = None;
    }

    /// Per-channel `(peak, rms)` since the last take.
    pub fn take_vu(&mut self, channel: usize) -> (f32, f32) {
        self.vu
            .get_mut(channel)
            .map(VuAccumulator::take)
            .unwrap_or((0.0, 0.0))
    }

    pub fn output_channels(&self) -> usize {
        self.vu.len()
    }

    /// Runs one block. Drains the parameter queue, applies bypass policy
    /// (with an edge-triggered crossfade), contains plugin faults, and
    /// accumulates VU. Returns false when the plugin produced non-finite
    /// output and was silenced.
    pub fn run(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) -> bool {
        for (index, value) in std::mem::take(&mut self.param_queue) {
            if (index as usize) < self.values.len() {
                self.values[index as usize] = value;
                self.plugin.set_control(index as usize, value);
            }
        }

        let bypassed = self.bypassed();
        let edge = self.bypass_edge;
        self.bypass_edge = false;

        let mut ok = true;
        if bypassed && !edge {
            copy_bypass(inputs, outputs, frames);
        } else {
            self.plugin.process(inputs, outputs, frames);
            ok = outputs_finite(outputs, frames);
            if !ok {
                for output in outputs.iter_mut() {
                    output[..frames].fill(0.0);
                }
                self.forced_bypass = true;
                self.fault_count += 1;
            } else if edge {
                crossfade_bypass(inputs, outputs, frames, bypassed);
            }
        }

        for (vu, output) in self.vu.iter_mut().zip(outputs.iter()) {
            vu.accumulate(&output[..frames]);
        }
        self.gather_patch_properties();
        ok
    }
}

/// Preallocated zero-input buffers for deactivation flushes.
pub struct FlushScratch {
    zeros: Vec<Box<[f32]>>,
    outputs: Vec<Box<[f32]>>,
    frames: usize,
}

impl FlushScratch {
    pub fn new(max_channels: usize, frames: usize) -> Self {
        let planar = |n: usize| -> Vec<Box<[f32]>> {
            (0..n).map(|_| vec![0.0f32; frames].into_boxed_slice()).collect()
        };
        Self {
            zeros: planar(max_channels),
            outputs: planar(max_channels),
            frames,
        }
    }

    fn flush(&mut self, plugin: &mut dyn Plugin) {
        let (ins, outs) = plugin.audio_io();
        let ins = ins.min(self.zeros.len());
        let outs = outs.min(self.outputs.len());
        for z in &mut self.zeros {
            z.fill(0.0);
        }
        let inputs: SmallVec<[&[f32]; 2]> =
            self.zeros[..ins].iter().map(|b| &b[..self.frames]).collect();
        let mut outputs: SmallVec<[&mut [f32]; 2]> = self.outputs[..outs]
            .iter_mut()
            .map(|b| &mut b[..self.frames])
            .collect();
        plugin.process(&inputs, &mut outputs, self.frames);
    }
}

/// Bypass copy: mono-to-mono passes bits through; mismatched channel counts
/// broadcast or sum.
fn copy_bypass(inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
    if inputs.is_empty() {
        for output in outputs.iter_mut() {
            output[..frames].fill(0.0);
        }
        return;
    }
    if inputs.len() == outputs.len() {
        for (output, input) in outputs.iter_mut().zip(inputs.iter()) {
            output[..frames].copy_from_slice(&input[..frames]);
        }
    } else if inputs.len() == 1 {
        for output in outputs.iter_mut() {
            output[..frames].copy_from_slice(&inputs[0][..frames]);
        }
    } else {
        // Sum the inputs into each output.
        let scale = 1.0 / inputs.len() as f32;
        for output in outputs.iter_mut() {
            for frame in 0..frames {
                let mut acc = 0.0;
                for input in inputs {
                    acc += input[frame];
                }
                output[frame] = acc * scale;
            }
        }
    }
}

/// Linear crossfade between the wet block already in `outputs` and the dry
/// path, across the block. `entering` = fading toward dry.
fn crossfade_bypass(inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize, entering: bool) {
    if frames == 0 {
        return;
    }
    let step = 1.0 / frames as f32;
    for (ch, output) in outputs.iter_mut().enumerate() {
        let dry = inputs.get(ch.min(inputs.len().saturating_sub(1)));
        let Some(dry) = dry else { continue };
        let mut t = 0.0f32;
        for frame in 0..frames {
            let wet_gain = if entering { 1.0 - t } else { t };
            output[frame] = output[frame] * wet_gain + dry[frame] * (1.0 - wet_gain);
            t += step;
        }
    }
}

fn outputs_finite(outputs: &[&mut [f32]], frames: usize) -> bool {
    outputs
        .iter()
        .all(|output| output[..frames].iter().all(|s| s.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::Gain;

    fn gain_instance(db: f32) -> EffectInstance {
        let mut instance = EffectInstance::new(1, Box::new(Gain::new()));
        instance.prepare(48_000.0, 64);
        instance.set_control_direct(0, db);
        instance.activate();
        instance
    }

    fn run_mono(instance: &mut EffectInstance, input: &[f32]) -> Vec<f32> {
        let mut output = vec![0.0f32; input.len()];
        let inputs = [input];
        {
            let mut outputs: SmallVec<[&mut [f32]; 2]> = SmallVec::new();
            outputs.push(&mut output[..]);
            assert!(instance.run(&inputs, &mut outputs, input.len()));
        }
        output
    }

    #[test]
    fn test_steady_bypass_is_bit_exact() {
        let mut instance = gain_instance(12.0);
        instance.set_bypass(true);
        // First block carries the crossfade edge; second is steady.
        run_mono(&mut instance, &[0.5; 64]);
        let input: Vec<f32> = (0..64).map(|i| (i as f32 / 64.0).sin()).collect();
        let output = run_mono(&mut instance, &input);
        assert_eq!(input, output);
    }

    #[test]
    fn test_bypass_edge_crossfades() {
        let mut instance = gain_instance(12.0);
        let wet_gain = 10.0f32.powf(12.0 / 20.0);

        // Active block first.
        let active = run_mono(&mut instance, &[0.5; 64]);
        assert!((active[32] - 0.5 * wet_gain).abs() < 1e-4);

        // Toggling bypass: the edge block starts wet and lands dry.
        instance.set_bypass(true);
        let edge = run_mono(&mut instance, &[0.5; 64]);
        assert!((edge[0] - 0.5 * wet_gain).abs() < 0.1, "block should start wet");
        assert!((edge[63] - 0.5).abs() < 0.1, "block should end dry");

        // Next block is pure dry.
        let steady = run_mono(&mut instance, &[0.5; 64]);
        assert_eq!(steady, vec![0.5; 64]);
    }

    #[test]
    fn test_param_queue_applies_before_process() {
        let mut instance = gain_instance(0.0);
        instance.queue_control(0, 6.0);
        let output = run_mono(&mut instance, &[1.0; 16]);
        let expected = 10.0f32.powf(6.0 / 20.0);
        assert!((output[0] - expected).abs() < 1e-4);
        assert_eq!(instance.get_control(0), 6.0);
    }

    #[test]
    fn test_param_queue_drops_oldest() {
        let mut instance = gain_instance(0.0);
        for i in 0..(PARAM_QUEUE_DEPTH + 10) {
            instance.queue_control(0, i as f32);
        }
        run_mono(&mut instance, &[0.0; 4]);
        // The newest value survives.
        assert_eq!(instance.get_control(0), (PARAM_QUEUE_DEPTH + 9) as f32);
    }

    #[test]
    fn test_fault_forces_bypass_and_silence() {
        struct NanPlugin {
            ports: Vec<ControlPortInfo>,
        }
        impl Plugin for NanPlugin {
            fn uri(&self) -> &str {
                "test://nan"
            }
            fn ports(&self) -> &[ControlPortInfo] {
                &self.ports
            }
            fn audio_io(&self) -> (usize, usize) {
                (1, 1)
            }
            fn prepare(&mut self, _: f64, _: usize) {}
            fn set_control(&mut self, _: usize, _: f32) {}
            fn get_control(&self, _: usize) -> f32 {
                0.0
            }
            fn process(&mut self, _: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
                outputs[0][..frames].fill(f32::NAN);
            }
        }

        let mut instance = EffectInstance::new(9, Box::new(NanPlugin { ports: Vec::new() }));
        instance.prepare(48_000.0, 16);
        instance.activate();

        let input = [0.25f32; 16];
        let mut output = vec![0.0f32; 16];
        let inputs = [&input[..]];
        let mut outputs: SmallVec<[&mut [f32]; 2]> = SmallVec::new();
        outputs.push(&mut output[..]);
        assert!(!instance.run(&inputs, &mut outputs, 16));
        drop(outputs);

        assert!(output.iter().all(|&s| s == 0.0));
        assert_eq!(instance.fault_count(), 1);
        assert!(instance.bypassed());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut instance = EffectInstance::new(1, Box::new(Gain::new()));
        assert_eq!(instance.state(), LifecycleState::Created);
        instance.prepare(48_000.0, 64);
        assert_eq!(instance.state(), LifecycleState::Prepared);
        instance.activate();
        instance.activate(); // idempotent
        assert_eq!(instance.state(), LifecycleState::Active);

        let mut scratch = FlushScratch::new(2, 64);
        instance.deactivate(&mut scratch);
        assert_eq!(instance.state(), LifecycleState::Prepared);
    }

    #[test]
    fn test_control_index_lookup() {
        let instance = EffectInstance::new(1, Box::new(Gain::new()));
        assert_eq!(instance.control_index("gain"), Some(0));
        assert_eq!(instance.control_index("nope"), None);
    }
}
