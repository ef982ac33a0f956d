//! The process plan: a pedalboard compiled for the realtime thread.
//!
//! At load time the item tree is walked into a flat sequence of tagged
//! steps over a pre-allocated buffer arena. Buffers are reused once their
//! last reader has passed, step outputs are always allocated before step
//! inputs are released (so no buffer is ever both an input and an output of
//! one step), and execution is a straight loop with no dispatch beyond the
//! step tag.

use crate::board::{Pedalboard, PedalboardItem, PluginItem, SplitItem};
use crate::effect::{EffectInstance, FlushScratch};
use crate::registry::PluginRegistry;
use pedalrig_core::messages::RtMessage;
use pedalrig_core::{DbDezipper, RtWriter};
use pedalrig_midi::{
    parse_midi, BindingKey, MappingInput, MappingState, MidiEvent, ParsedMidi,
};
use smallvec::SmallVec;
use std::collections::HashMap;

/// One item that failed to load; the rest of the board still runs.
#[derive(Clone, Debug)]
pub struct LoadError {
    pub instance_id: u64,
    pub message: String,
}

enum PlanStep {
    Effect {
        effect: usize,
        inputs: SmallVec<[usize; 2]>,
        outputs: SmallVec<[usize; 2]>,
    },
    /// `out[i] = a[i]*gain_a + b[i]*gain_b`
    Mix {
        a: usize,
        b: usize,
        out: usize,
        gain_a: f32,
        gain_b: f32,
    },
}

struct Arena {
    buffers: Vec<Box<[f32]>>,
    refcounts: Vec<u32>,
    free: Vec<usize>,
    block: usize,
}

impl Arena {
    fn new(block: usize) -> Self {
        Self {
            buffers: Vec::new(),
            refcounts: Vec::new(),
            free: Vec::new(),
            block,
        }
    }

    fn alloc(&mut self) -> usize {
        if let Some(index) = self.free.pop() {
            self.refcounts[index] = 1;
            return index;
        }
        self.buffers.push(vec![0.0f32; self.block].into_boxed_slice());
        self.refcounts.push(1);
        self.buffers.len() - 1
    }

    fn retain(&mut self, index: usize) {
        self.refcounts[index] += 1;
    }

    fn release(&mut self, index: usize) {
        debug_assert!(self.refcounts[index] > 0);
        self.refcounts[index] -= 1;
        if self.refcounts[index] == 0 {
            self.free.push(index);
        }
    }

    fn release_unique(&mut self, indices: &[usize]) {
        let mut seen: SmallVec<[usize; 4]> = SmallVec::new();
        for &index in indices {
            if !seen.contains(&index) {
                seen.push(index);
                self.release(index);
            }
        }
    }
}

struct ResolvedMapping {
    key: BindingKey,
    effect: usize,
    control: u32,
    state: MappingState,
}

/// A pedalboard compiled and owned by the realtime thread.
pub struct RtPedalboard {
    effects: Vec<EffectInstance>,
    steps: Vec<PlanStep>,
    arena: Arena,
    input_indices: Vec<usize>,
    output_indices: Vec<usize>,
    input_volume: DbDezipper,
    output_volume: DbDezipper,
    mappings: Vec<ResolvedMapping>,
    /// Armed MIDI-learn target; the next eligible event reports its key.
    learn_armed: bool,
    flush_scratch: FlushScratch,
}

impl RtPedalboard {
    pub fn effects(&self) -> &[EffectInstance] {
        &self.effects
    }

    pub fn effects_mut(&mut self) -> &mut [EffectInstance] {
        &mut self.effects
    }

    pub fn effect_by_instance(&mut self, instance_id: u64) -> Option<&mut EffectInstance> {
        self.effects
            .iter_mut()
            .find(|e| e.instance_id() == instance_id)
    }

    pub fn set_input_volume_db(&mut self, db: f32) {
        self.input_volume.set_target(db);
    }

    pub fn set_output_volume_db(&mut self, db: f32) {
        self.output_volume.set_target(db);
    }

    pub fn arm_midi_learn(&mut self) {
        self.learn_armed = true;
    }

    /// Activates every effect. Realtime-safe and idempotent; normally done
    /// on the host side right before the swap.
    pub fn activate(&mut self) {
        for effect in &mut self.effects {
            effect.activate();
        }
    }

    /// Deactivates every effect, flushing delay lines with one zero-input
    /// pass each.
    pub fn deactivate(&mut self) {
        for effect in &mut self.effects {
            effect.deactivate(&mut self.flush_scratch);
        }
    }

    /// Takes apart the board for instance transfer into a later load.
    pub fn into_effects(self) -> Vec<EffectInstance> {
        self.effects
    }

    /// Routes one MIDI event through the resolved bindings.
    pub fn on_midi(&mut self, event: &MidiEvent<'_>, rt_tx: &mut RtWriter) {
        let parsed = parse_midi(event.bytes);
        if matches!(parsed, ParsedMidi::Other) {
            return;
        }

        if self.learn_armed {
            if let Some((kind, channel, data)) = learned_key(&parsed) {
                self.learn_armed = false;
                rt_tx.write(&RtMessage::MidiLearned {
                    kind,
                    channel,
                    data,
                });
            }
            return;
        }

        for mapping in &mut self.mappings {
            let Some(input) = match_binding(&mapping.key, &parsed) else {
                continue;
            };
            if let Some(value) = mapping.state.apply(input, event.timestamp) {
                if let Some(effect) = self.effects.get_mut(mapping.effect) {
                    effect.set_control_direct(mapping.control as usize, value);
                    rt_tx.write(&RtMessage::ParamReadback {
                        instance: effect.instance_id(),
                        port_index: mapping.control,
                        value,
                    });
                }
            }
        }
    }

    /// Completes trigger pulses; call once after processing each block.
    pub fn end_of_block(&mut self, rt_tx: &mut RtWriter) {
        for mapping in &mut self.mappings {
            if let Some(value) = mapping.state.end_of_block() {
                if let Some(effect) = self.effects.get_mut(mapping.effect) {
                    effect.set_control_direct(mapping.control as usize, value);
                    rt_tx.write(&RtMessage::ParamReadback {
                        instance: effect.instance_id(),
                        port_index: mapping.control,
                        value,
                    });
                }
            }
        }
    }

    /// Publishes per-effect VU and output-control readings.
    pub fn publish_meters(&mut self, rt_tx: &mut RtWriter) {
        for effect in &mut self.effects {
            let instance = effect.instance_id();
            for channel in 0..effect.output_channels() {
                let (peak, rms) = effect.take_vu(channel);
                rt_tx.write(&RtMessage::VuSample {
                    instance,
                    channel: channel as u32,
                    peak,
                    rms,
                });
            }
            for (index, port) in effect.ports().iter().enumerate() {
                if port.is_output {
                    rt_tx.write(&RtMessage::ParamReadback {
                        instance,
                        port_index: index as u32,
                        value: effect.get_output_control(index),
                    });
                }
            }
        }
    }

    /// Runs one block. Returns false when any effect produced non-finite
    /// output; the caller mutes the block.
    pub fn run(
        &mut self,
        inputs: &[Box<[f32]>],
        outputs: &mut [Box<[f32]>],
        frames: usize,
    ) -> bool {
        if self.input_indices.is_empty()
            || self.output_indices.is_empty()
            || inputs.is_empty()
            || outputs.is_empty()
        {
            for output in outputs.iter_mut() {
                output[..frames].fill(0.0);
            }
            return true;
        }

        // Input trim onto the arena's input buffers.
        for frame in 0..frames {
            let gain = self.input_volume.tick();
            for (channel, &index) in self.input_indices.iter().enumerate() {
                let source = &inputs[channel.min(inputs.len() - 1)];
                self.arena.buffers[index][frame] = source[frame] * gain;
            }
        }

        let mut ok = true;
        for step in &self.steps {
            match step {
                PlanStep::Effect {
                    effect,
                    inputs: step_in,
                    outputs: step_out,
                } => {
                    let mut taken: SmallVec<[(usize, Box<[f32]>); 2]> = step_out
                        .iter()
                        .map(|&i| (i, std::mem::take(&mut self.arena.buffers[i])))
                        .collect();
                    {
                        let in_refs: SmallVec<[&[f32]; 2]> = step_in
                            .iter()
                            .map(|&i| &self.arena.buffers[i][..frames])
                            .collect();
                        let mut out_refs: SmallVec<[&mut [f32]; 2]> = taken
                            .iter_mut()
                            .map(|(_, buffer)| &mut buffer[..frames])
                            .collect();
                        ok &= self.effects[*effect].run(&in_refs, &mut out_refs, frames);
                    }
                    for (index, buffer) in taken {
                        self.arena.buffers[index] = buffer;
                    }
                }
                PlanStep::Mix {
                    a,
                    b,
                    out,
                    gain_a,
                    gain_b,
                } => {
                    let mut buffer = std::mem::take(&mut self.arena.buffers[*out]);
                    let buf_a = &self.arena.buffers[*a];
                    let buf_b = &self.arena.buffers[*b];
                    for frame in 0..frames {
                        buffer[frame] = buf_a[frame] * gain_a + buf_b[frame] * gain_b;
                    }
                    self.arena.buffers[*out] = buffer;
                }
            }
        }

        // Output trim into the caller's buffers.
        for frame in 0..frames {
            let gain = self.output_volume.tick();
            for (channel, output) in outputs.iter_mut().enumerate() {
                let index =
                    self.output_indices[channel.min(self.output_indices.len() - 1)];
                output[frame] = self.arena.buffers[index][frame] * gain;
            }
        }

        for output in outputs.iter() {
            if !output[..frames].iter().all(|s| s.is_finite()) {
                ok = false;
            }
        }
        ok
    }
}

fn learned_key(parsed: &ParsedMidi) -> Option<(u8, u8, u8)> {
    // kind: 0 = cc, 1 = note, 2 = program change (wire values for
    // MIDI_LEARNED frames).
    match *parsed {
        ParsedMidi::ControlChange {
            channel,
            controller,
            ..
        } => Some((0, channel, controller)),
        ParsedMidi::NoteOn { channel, note, .. } => Some((1, channel, note)),
        ParsedMidi::ProgramChange { channel, .. } => Some((2, channel, 0)),
        _ => None,
    }
}

fn match_binding(key: &BindingKey, parsed: &ParsedMidi) -> Option<MappingInput> {
    match (key, parsed) {
        (
            BindingKey::Cc {
                channel,
                controller,
            },
            ParsedMidi::ControlChange {
                channel: ch,
                controller: ctrl,
                value,
            },
        ) if *ctrl == *controller && BindingKey::channel_matches(*channel, *ch) => {
            Some(MappingInput::Cc(*value))
        }
        (
            BindingKey::Note { channel, note },
            ParsedMidi::NoteOn {
                channel: ch,
                note: n,
                ..
            },
        ) if *n == *note && BindingKey::channel_matches(*channel, *ch) => {
            Some(MappingInput::NoteOn)
        }
        (
            BindingKey::Note { channel, note },
            ParsedMidi::NoteOff {
                channel: ch,
                note: n,
            },
        ) if *n == *note && BindingKey::channel_matches(*channel, *ch) => {
            Some(MappingInput::NoteOff)
        }
        (
            BindingKey::ProgramChange { channel },
            ParsedMidi::ProgramChange {
                channel: ch,
                program,
            },
        ) if BindingKey::channel_matches(*channel, *ch) => {
            Some(MappingInput::ProgramChange(*program))
        }
        _ => None,
    }
}

struct Builder<'a> {
    registry: &'a PluginRegistry,
    sample_rate: f64,
    block: usize,
    effects: Vec<EffectInstance>,
    steps: Vec<PlanStep>,
    arena: Arena,
    errors: Vec<LoadError>,
    existing: &'a mut HashMap<u64, EffectInstance>,
}

impl<'a> Builder<'a> {
    /// Walks a chain, returning its output buffer indices.
    fn walk_chain(&mut self, items: &[PedalboardItem], current: Vec<usize>) -> Vec<usize> {
        let mut current = current;
        for item in items {
            current = match item {
                PedalboardItem::Plugin(plugin) => self.walk_plugin(plugin, current),
                PedalboardItem::Split(split) => self.walk_split(split, current),
            };
        }
        current
    }

    fn walk_plugin(&mut self, item: &PluginItem, current: Vec<usize>) -> Vec<usize> {
        let mut instance = match self.take_or_create(item) {
            Ok(instance) => instance,
            Err(message) => {
                self.errors.push(LoadError {
                    instance_id: item.instance_id,
                    message,
                });
                return current;
            }
        };

        instance.prepare(self.sample_rate, self.block);
        for (symbol, &value) in &item.control_values {
            if let Some(index) = instance.control_index(symbol) {
                instance.set_control_direct(index, value);
            }
        }
        instance.set_bypass_immediate(item.bypass);

        let (wants_in, wants_out) = instance.audio_io();
        let inputs = self.adapt_channels(current, wants_in);

        // Outputs are allocated before inputs are released, so a step never
        // writes a buffer it is also reading.
        let outputs: SmallVec<[usize; 2]> =
            (0..wants_out).map(|_| self.arena.alloc()).collect();
        self.arena.release_unique(&inputs);

        let effect_index = self.effects.len();
        self.effects.push(instance);
        self.steps.push(PlanStep::Effect {
            effect: effect_index,
            inputs: SmallVec::from_slice(&inputs),
            outputs: outputs.clone(),
        });
        outputs.into_vec()
    }

    fn walk_split(&mut self, split: &SplitItem, current: Vec<usize>) -> Vec<usize> {
        // Both legs read the split input.
        for &index in unique(&current).iter() {
            self.arena.retain(index);
        }
        let top_out = self.walk_chain(&split.top, current.clone());
        let bottom_out = self.walk_chain(&split.bottom, current);

        let gain_top = 1.0 - split.mix;
        let gain_bottom = split.mix;
        let channels = top_out.len().max(bottom_out.len()).max(1);

        let outputs: Vec<usize> = (0..channels).map(|_| self.arena.alloc()).collect();
        for (channel, &out) in outputs.iter().enumerate() {
            let a = top_out[channel.min(top_out.len().saturating_sub(1))];
            let b = bottom_out[channel.min(bottom_out.len().saturating_sub(1))];
            self.steps.push(PlanStep::Mix {
                a,
                b,
                out,
                gain_a: gain_top * pan_gain(split.pan_top, channel, channels),
                gain_b: gain_bottom * pan_gain(split.pan_bottom, channel, channels),
            });
        }
        self.arena.release_unique(&top_out);
        self.arena.release_unique(&bottom_out);
        outputs
    }

    /// Adapts `current` to `wanted` channels: broadcast up, downmix down.
    fn adapt_channels(&mut self, current: Vec<usize>, wanted: usize) -> Vec<usize> {
        if wanted == current.len() || current.is_empty() {
            return current;
        }
        if wanted == 0 {
            self.arena.release_unique(&current);
            return Vec::new();
        }
        if wanted > current.len() {
            // Broadcast: repeat the last channel. Reads may alias.
            let last = current[current.len() - 1];
            let mut adapted = current;
            while adapted.len() < wanted {
                adapted.push(last);
            }
            return adapted;
        }
        // Downmix pairs until the count fits.
        let mut adapted = current;
        while adapted.len() > wanted {
            let (Some(b), Some(a)) = (adapted.pop(), adapted.pop()) else {
                break;
            };
            let out = self.arena.alloc();
            self.steps.push(PlanStep::Mix {
                a,
                b,
                out,
                gain_a: 0.5,
                gain_b: 0.5,
            });
            self.arena.release_unique(&[a, b]);
            adapted.push(out);
        }
        adapted
    }

    fn take_or_create(&mut self, item: &PluginItem) -> Result<EffectInstance, String> {
        if let Some(existing) = self.existing.remove(&item.instance_id) {
            if existing.uri() == item.plugin_uri {
                return Ok(existing);
            }
            // URI changed under the same id: fall through to a fresh load.
            self.existing.insert(item.instance_id, existing);
        }
        match self.registry.instantiate(&item.plugin_uri) {
            Ok(plugin) => Ok(EffectInstance::new(item.instance_id, plugin)),
            Err(err) => Err(err.to_string()),
        }
    }
}

fn unique(indices: &[usize]) -> SmallVec<[usize; 4]> {
    let mut seen: SmallVec<[usize; 4]> = SmallVec::new();
    for &index in indices {
        if !seen.contains(&index) {
            seen.push(index);
        }
    }
    seen
}

/// Simple linear pan: only applied when mixing to stereo.
fn pan_gain(pan: f32, channel: usize, channels: usize) -> f32 {
    if channels < 2 {
        return 1.0;
    }
    match channel {
        0 => {
            if pan > 0.0 {
                1.0 - pan
            } else {
                1.0
            }
        }
        _ => {
            if pan < 0.0 {
                1.0 + pan
            } else {
                1.0
            }
        }
    }
}

/// Compiles `board` into a realtime plan.
///
/// `existing` is the instance-transfer pool: effects with a matching
/// `instance_id` and URI are moved in instead of re-instantiated. Items
/// that fail to load are reported in the error list and skipped; the rest
/// of the board still runs.
pub fn build_rt_pedalboard(
    board: &Pedalboard,
    registry: &PluginRegistry,
    sample_rate: f64,
    block: usize,
    channels: usize,
    existing: &mut HashMap<u64, EffectInstance>,
) -> (RtPedalboard, Vec<LoadError>) {
    let mut builder = Builder {
        registry,
        sample_rate,
        block,
        effects: Vec::new(),
        steps: Vec::new(),
        arena: Arena::new(block),
        errors: Vec::new(),
        existing,
    };

    let input_indices: Vec<usize> = (0..channels).map(|_| builder.arena.alloc()).collect();
    let output_indices = builder.walk_chain(&board.items, input_indices.clone());

    let mut input_volume = DbDezipper::new(sample_rate);
    input_volume.set_rate(0.1);
    input_volume.reset(board.input_volume_db);
    let mut output_volume = DbDezipper::new(sample_rate);
    output_volume.set_rate(0.1);
    output_volume.reset(board.output_volume_db);

    let mut mappings = Vec::new();
    for item in board.plugin_items() {
        for binding in &item.midi_bindings {
            let Some(effect_index) = builder
                .effects
                .iter()
                .position(|e| e.instance_id() == binding.instance_id)
            else {
                continue; // target not in the live board; ignored silently
            };
            let Some(control) = builder.effects[effect_index].control_index(&binding.control)
            else {
                continue;
            };
            let range = builder.effects[effect_index].ports()[control].range();
            mappings.push(ResolvedMapping {
                key: binding.key,
                effect: effect_index,
                control: control as u32,
                state: MappingState::new(binding.kind, range, binding.min, binding.max),
            });
        }
    }

    let max_channels = builder
        .effects
        .iter()
        .map(|e| {
            let (i, o) = e.audio_io();
            i.max(o)
        })
        .max()
        .unwrap_or(2)
        .max(channels);

    let rt = RtPedalboard {
        effects: builder.effects,
        steps: builder.steps,
        arena: builder.arena,
        input_indices,
        output_indices,
        input_volume,
        output_volume,
        mappings,
        learn_armed: false,
        flush_scratch: FlushScratch::new(max_channels, block),
    };
    (rt, builder.errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{PluginItem, SplitItem};
    use crate::effects::GAIN_URI;
    use pedalrig_core::rt_to_host_ring;
    use pedalrig_midi::{MidiBinding, MidiTimestamp, MappingKind};
    use std::collections::BTreeMap;

    const BLOCK: usize = 64;

    fn gain_item(instance_id: u64, db: f32) -> PedalboardItem {
        PedalboardItem::Plugin(PluginItem {
            instance_id,
            plugin_uri: GAIN_URI.into(),
            control_values: [("gain".to_string(), db)].into_iter().collect(),
            bypass: false,
            midi_bindings: Vec::new(),
        })
    }

    fn build(board: &Pedalboard, channels: usize) -> RtPedalboard {
        let registry = PluginRegistry::with_builtins();
        let mut pool = HashMap::new();
        let (mut rt, errors) =
            build_rt_pedalboard(board, &registry, 48_000.0, BLOCK, channels, &mut pool);
        assert!(errors.is_empty(), "unexpected load errors: {errors:?}");
        rt.activate();
        rt
    }

    fn planar(channels: usize, value: f32) -> Vec<Box<[f32]>> {
        (0..channels)
            .map(|_| vec![value; BLOCK].into_boxed_slice())
            .collect()
    }

    fn run_board(rt: &mut RtPedalboard, input_value: f32, channels: usize) -> Vec<Box<[f32]>> {
        let inputs = planar(channels, input_value);
        let mut outputs = planar(channels, 0.0);
        assert!(rt.run(&inputs, &mut outputs, BLOCK));
        outputs
    }

    #[test]
    fn test_empty_board_passes_input() {
        let mut rt = build(&Pedalboard::empty(), 2);
        let outputs = run_board(&mut rt, 0.5, 2);
        assert!(outputs[0].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(outputs[1].iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_zero_channel_board_is_silent() {
        let mut rt = build(&Pedalboard::empty(), 0);
        let inputs: Vec<Box<[f32]>> = Vec::new();
        let mut outputs = planar(2, 1.0);
        assert!(rt.run(&inputs, &mut outputs, BLOCK));
        assert!(outputs[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_linear_chain_composes_gains() {
        let board = Pedalboard {
            items: vec![gain_item(1, 6.0), gain_item(2, 6.0)],
            ..Pedalboard::empty()
        };
        let mut rt = build(&board, 2);
        let outputs = run_board(&mut rt, 0.1, 2);
        let expected = 0.1 * 10.0f32.powf(12.0 / 20.0);
        assert!(
            (outputs[0][BLOCK / 2] - expected).abs() < 1e-4,
            "got {} expected {expected}",
            outputs[0][BLOCK / 2]
        );
    }

    #[test]
    fn test_mono_chain_broadcasts_to_stereo_out() {
        let board = Pedalboard {
            items: vec![gain_item(1, 0.0)],
            ..Pedalboard::empty()
        };
        let mut rt = build(&board, 2);
        let outputs = run_board(&mut rt, 0.25, 2);
        // Stereo downmixes to the mono effect and broadcasts back out.
        assert!((outputs[0][10] - 0.25).abs() < 1e-5);
        assert_eq!(outputs[0][10], outputs[1][10]);
    }

    #[test]
    fn test_split_mixes_legs() {
        // Top leg: +6 dB gain. Bottom leg: empty (dry). Mix 0.5.
        let board = Pedalboard {
            items: vec![PedalboardItem::Split(SplitItem {
                instance_id: 10,
                top: vec![gain_item(1, 6.0)],
                bottom: Vec::new(),
                mix: 0.5,
                pan_top: 0.0,
                pan_bottom: 0.0,
            })],
            ..Pedalboard::empty()
        };
        let mut rt = build(&board, 1);
        let outputs = run_board(&mut rt, 0.2, 1);
        let expected = 0.5 * 0.2 * 10.0f32.powf(6.0 / 20.0) + 0.5 * 0.2;
        assert!(
            (outputs[0][20] - expected).abs() < 1e-4,
            "got {} expected {expected}",
            outputs[0][20]
        );
    }

    #[test]
    fn test_one_effect_run_per_block() {
        let board = Pedalboard {
            items: vec![gain_item(1, 0.0), gain_item(2, 0.0), gain_item(3, 0.0)],
            ..Pedalboard::empty()
        };
        let mut rt = build(&board, 1);
        run_board(&mut rt, 0.5, 1);
        // Each effect processed the block exactly once: its VU saw exactly
        // BLOCK samples.
        for effect in rt.effects_mut() {
            let (peak, _) = effect.take_vu(0);
            assert!(peak > 0.0);
        }
    }

    #[test]
    fn test_cc_binding_moves_control() {
        let board = Pedalboard {
            items: vec![PedalboardItem::Plugin(PluginItem {
                instance_id: 1,
                plugin_uri: GAIN_URI.into(),
                control_values: BTreeMap::new(),
                bypass: false,
                midi_bindings: vec![MidiBinding {
                    key: BindingKey::Cc {
                        channel: None,
                        controller: 11,
                    },
                    instance_id: 1,
                    control: "gain".into(),
                    kind: MappingKind::Linear,
                    min: None,
                    max: None,
                }],
            })],
            ..Pedalboard::empty()
        };
        let mut rt = build(&board, 1);
        let (mut rt_tx, mut rt_rx) = rt_to_host_ring(4096);

        let bytes = [0xB0u8, 11, 127];
        let event = MidiEvent {
            timestamp: MidiTimestamp::new(1, 0),
            frame: 0,
            bytes: &bytes,
        };
        rt.on_midi(&event, &mut rt_tx);

        let effect = rt.effect_by_instance(1).unwrap();
        assert_eq!(effect.get_control(0), 24.0); // port max

        // The change was reported back to the host.
        match rt_rx.read() {
            Some(RtMessage::ParamReadback {
                instance,
                port_index,
                value,
            }) => {
                assert_eq!(instance, 1);
                assert_eq!(port_index, 0);
                assert_eq!(value, 24.0);
            }
            other => panic!("expected readback, got {other:?}"),
        }
    }

    #[test]
    fn test_binding_to_absent_instance_is_ignored() {
        let board = Pedalboard {
            items: vec![PedalboardItem::Plugin(PluginItem {
                instance_id: 1,
                plugin_uri: GAIN_URI.into(),
                control_values: BTreeMap::new(),
                bypass: false,
                midi_bindings: vec![MidiBinding {
                    key: BindingKey::Cc {
                        channel: None,
                        controller: 11,
                    },
                    instance_id: 999, // not in this board
                    control: "gain".into(),
                    kind: MappingKind::Linear,
                    min: None,
                    max: None,
                }],
            })],
            ..Pedalboard::empty()
        };
        let registry = PluginRegistry::with_builtins();
        let mut pool = HashMap::new();
        let (rt, errors) =
            build_rt_pedalboard(&board, &registry, 48_000.0, BLOCK, 1, &mut pool);
        assert!(errors.is_empty());
        assert_eq!(rt.mappings.len(), 0);
    }

    #[test]
    fn test_midi_learn_reports_key_once() {
        let mut rt = build(&Pedalboard::empty(), 1);
        let (mut rt_tx, mut rt_rx) = rt_to_host_ring(4096);
        rt.arm_midi_learn();

        let bytes = [0xB3u8, 80, 127];
        let event = MidiEvent {
            timestamp: MidiTimestamp::new(1, 0),
            frame: 0,
            bytes: &bytes,
        };
        rt.on_midi(&event, &mut rt_tx);
        rt.on_midi(&event, &mut rt_tx);

        match rt_rx.read() {
            Some(RtMessage::MidiLearned {
                kind,
                channel,
                data,
            }) => {
                assert_eq!(kind, 0);
                assert_eq!(channel, 3);
                assert_eq!(data, 80);
            }
            other => panic!("expected learned key, got {other:?}"),
        }
        assert!(rt_rx.read().is_none(), "learn must disarm after one event");
    }

    #[test]
    fn test_unknown_plugin_reports_error_and_board_runs() {
        let board = Pedalboard {
            items: vec![
                PedalboardItem::Plugin(PluginItem {
                    instance_id: 1,
                    plugin_uri: "builtin://missing".into(),
                    control_values: BTreeMap::new(),
                    bypass: false,
                    midi_bindings: Vec::new(),
                }),
                gain_item(2, 0.0),
            ],
            ..Pedalboard::empty()
        };
        let registry = PluginRegistry::with_builtins();
        let mut pool = HashMap::new();
        let (mut rt, errors) =
            build_rt_pedalboard(&board, &registry, 48_000.0, BLOCK, 1, &mut pool);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].instance_id, 1);
        rt.activate();
        let outputs = run_board(&mut rt, 0.5, 1);
        assert!((outputs[0][5] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_instance_transfer_reuses_effect() {
        let board = Pedalboard {
            items: vec![gain_item(7, 3.0)],
            ..Pedalboard::empty()
        };
        let registry = PluginRegistry::with_builtins();
        let mut pool = HashMap::new();
        let (rt, _) = build_rt_pedalboard(&board, &registry, 48_000.0, BLOCK, 1, &mut pool);

        // Retire the board, harvest its instances, rebuild.
        for effect in rt.into_effects() {
            pool.insert(effect.instance_id(), effect);
        }
        let (rt2, errors) =
            build_rt_pedalboard(&board, &registry, 48_000.0, BLOCK, 1, &mut pool);
        assert!(errors.is_empty());
        assert!(pool.is_empty(), "instance should have been transferred");
        assert_eq!(rt2.effects().len(), 1);
        assert_eq!(rt2.effects()[0].instance_id(), 7);
    }

    #[test]
    fn test_block_size_does_not_change_output() {
        // A memoryless chain must produce identical audio whether it is
        // driven one frame or thousands of frames at a time.
        let registry = PluginRegistry::with_builtins();
        let board = Pedalboard {
            items: vec![gain_item(1, 4.5)],
            ..Pedalboard::empty()
        };
        let input: Vec<f32> = (0..8192).map(|i| ((i as f32) * 0.01).sin() * 0.8).collect();

        let render = |block: usize| -> Vec<f32> {
            let mut pool = HashMap::new();
            let (mut rt, errors) =
                build_rt_pedalboard(&board, &registry, 48_000.0, block, 1, &mut pool);
            assert!(errors.is_empty());
            rt.activate();
            let mut rendered = Vec::with_capacity(input.len());
            let mut inputs = vec![vec![0.0f32; block].into_boxed_slice()];
            let mut outputs = vec![vec![0.0f32; block].into_boxed_slice()];
            for chunk in input.chunks(block) {
                inputs[0][..chunk.len()].copy_from_slice(chunk);
                assert!(rt.run(&inputs, &mut outputs, chunk.len()));
                rendered.extend_from_slice(&outputs[0][..chunk.len()]);
            }
            rendered
        };

        let by_one = render(1);
        let by_block = render(8192);
        assert_eq!(by_one.len(), by_block.len());
        for (a, b) in by_one.iter().zip(by_block.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_input_volume_applies() {
        let mut board = Pedalboard::empty();
        board.input_volume_db = -6.0;
        let mut rt = build(&board, 1);
        let outputs = run_board(&mut rt, 1.0, 1);
        let expected = 10.0f32.powf(-6.0 / 20.0);
        assert!((outputs[0][0] - expected).abs() < 1e-4);
    }
}
