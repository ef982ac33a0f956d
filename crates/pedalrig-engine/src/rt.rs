//! The engine's realtime side: the driver-host implementation that owns the
//! live pedalboard.
//!
//! Board swaps travel on a typed SPSC ring of boxes: the host allocates a
//! compiled board, the realtime thread exchanges its `current` pointer on a
//! block boundary and sends the retired board back on the return ring, and
//! the host frees it after the acknowledgment. The byte rings carry all POD
//! commands and telemetry.

use crate::plan::RtPedalboard;
use pedalrig_core::messages::{HostMessage, RtMessage};
use pedalrig_core::{AtomicCounter, CrashGuard, HostReader, RtWriter};
use pedalrig_driver::{AudioDriverHost, ProcessContext};
use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};
use std::sync::Arc;

/// Host -> realtime, pointer-carrying.
pub enum EngineCommand {
    LoadBoard(Box<RtPedalboard>),
}

/// Realtime -> host, pointer-carrying.
pub enum EngineReturn {
    RetiredBoard(Box<RtPedalboard>),
}

/// State owned by the realtime thread.
pub struct EngineRt {
    board: Option<Box<RtPedalboard>>,
    command_rx: HeapCons<EngineCommand>,
    return_tx: HeapProd<EngineReturn>,
    host_rx: HostReader,
    rt_tx: RtWriter,
    crash_guard: Arc<CrashGuard>,
    underruns: Arc<AtomicCounter>,
    plugin_faults: Arc<AtomicCounter>,
    commands_processed: u64,
    last_acked: u64,
    last_underruns_published: u64,
    meter_frames: usize,
    meter_interval: usize,
}

impl EngineRt {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command_rx: HeapCons<EngineCommand>,
        return_tx: HeapProd<EngineReturn>,
        host_rx: HostReader,
        rt_tx: RtWriter,
        crash_guard: Arc<CrashGuard>,
        underruns: Arc<AtomicCounter>,
        plugin_faults: Arc<AtomicCounter>,
        sample_rate: u32,
    ) -> Self {
        Self {
            board: None,
            command_rx,
            return_tx,
            host_rx,
            rt_tx,
            crash_guard,
            underruns,
            plugin_faults,
            commands_processed: 0,
            last_acked: 0,
            last_underruns_published: 0,
            meter_frames: 0,
            // ~30 meter updates per second.
            meter_interval: (sample_rate as usize / 30).max(1),
        }
    }

    fn swap_boards(&mut self) {
        while let Some(command) = self.command_rx.try_pop() {
            match command {
                EngineCommand::LoadBoard(new_board) => {
                    if let Some(old) = self.board.replace(new_board) {
                        // Return ring capacity tracks the command ring, so
                        // this push only fails if the host stopped polling;
                        // dropping here is the lesser evil then.
                        let _ = self.return_tx.try_push(EngineReturn::RetiredBoard(old));
                    }
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Some(message) = self.host_rx.read() {
            self.commands_processed += 1;
            let Some(board) = self.board.as_mut() else {
                continue;
            };
            match message {
                HostMessage::SetControl {
                    instance,
                    port_index,
                    value,
                } => {
                    if let Some(effect) = board.effect_by_instance(instance) {
                        effect.queue_control(port_index, value);
                    }
                }
                HostMessage::SetBypass { instance, enable } => {
                    if let Some(effect) = board.effect_by_instance(instance) {
                        effect.set_bypass(enable);
                    }
                }
                HostMessage::SetInputVolumeDb(db) => board.set_input_volume_db(db),
                HostMessage::SetOutputVolumeDb(db) => board.set_output_volume_db(db),
                HostMessage::RequestPatchProperty { instance, property } => {
                    if let Some(effect) = board.effect_by_instance(instance) {
                        effect.request_patch_property(property);
                    }
                }
                HostMessage::MidiLearn { .. } => board.arm_midi_learn(),
            }
        }
    }

    fn publish_housekeeping(&mut self, frames: usize) {
        if self.commands_processed != self.last_acked {
            if self
                .rt_tx
                .write(&RtMessage::CommandAck(self.commands_processed))
            {
                self.last_acked = self.commands_processed;
            }
        }

        let underruns = self.underruns.get();
        if underruns != self.last_underruns_published {
            if self.rt_tx.write(&RtMessage::UnderrunCounter(underruns)) {
                self.last_underruns_published = underruns;
            }
        }

        self.meter_frames += frames;
        if self.meter_frames >= self.meter_interval {
            self.meter_frames = 0;
            if let Some(board) = self.board.as_mut() {
                board.publish_meters(&mut self.rt_tx);
            }
        }
    }
}

impl AudioDriverHost for EngineRt {
    fn on_audio_started(&mut self) {
        self.crash_guard.enter();
    }

    fn on_process(&mut self, ctx: ProcessContext<'_>) {
        self.swap_boards();
        self.drain_commands();

        let frames = ctx.frames;
        match self.board.as_mut() {
            Some(board) => {
                for event in ctx.midi.iter() {
                    board.on_midi(&event, &mut self.rt_tx);
                }
                let ok = board.run(ctx.inputs, ctx.outputs, frames);
                if !ok {
                    for output in ctx.outputs.iter_mut() {
                        output[..frames].fill(0.0);
                    }
                    self.plugin_faults.increment();
                }
                board.end_of_block(&mut self.rt_tx);
            }
            None => {
                for output in ctx.outputs.iter_mut() {
                    output[..frames].fill(0.0);
                }
            }
        }

        self.publish_housekeeping(frames);
    }

    fn on_underrun(&mut self) {
        self.underruns.increment();
    }

    fn on_audio_terminated(&mut self) {
        self.rt_tx.write(&RtMessage::AudioTerminated);
        self.crash_guard.leave();
    }
}
