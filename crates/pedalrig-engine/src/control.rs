//! The non-realtime control plane.
//!
//! Every mutating call serializes into the host->realtime ring; `Ok` means
//! "enqueued", not "applied". The realtime thread echoes a monotonic
//! command counter so callers can wait for acknowledgment, and publishes
//! VU, output-control, and learned-binding telemetry that [`poll`]
//! (ControlPlane::poll) folds into host-side mirrors.

use crate::board::Pedalboard;
use crate::effect::{EffectInstance, PatchSlot};
use crate::plan::{build_rt_pedalboard, LoadError};
use crate::registry::PluginRegistry;
use crate::rt::{EngineCommand, EngineReturn};
use pedalrig_core::messages::{HostMessage, RtMessage};
use pedalrig_core::{Error, HostWriter, Result, RtReader, VuReading};
use pedalrig_driver::RtInversionGuard;
use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A MIDI key reported by the realtime thread after a learn request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LearnedKey {
    Cc { channel: u8, controller: u8 },
    Note { channel: u8, note: u8 },
    ProgramChange { channel: u8 },
}

struct EffectDescriptor {
    uri: String,
    symbols: HashMap<String, u32>,
    patch_slot: Arc<PatchSlot>,
}

/// Host-side handle to the running engine.
pub struct ControlPlane {
    command_writer: HostWriter,
    rt_reader: RtReader,
    board_tx: HeapProd<EngineCommand>,
    return_rx: HeapCons<EngineReturn>,
    registry: Arc<PluginRegistry>,
    sample_rate: f64,
    block_size: usize,
    channels: usize,

    command_seq: u64,
    acked: u64,
    descriptors: HashMap<u64, EffectDescriptor>,
    transfer_pool: HashMap<u64, EffectInstance>,
    vu: HashMap<u64, HashMap<u32, VuReading>>,
    output_controls: HashMap<(u64, u32), f32>,
    learned: Option<LearnedKey>,
    underruns: u64,
    audio_terminated: bool,
    input_db: f32,
    output_db: f32,
}

impl ControlPlane {
    pub fn new(
        command_writer: HostWriter,
        rt_reader: RtReader,
        board_tx: HeapProd<EngineCommand>,
        return_rx: HeapCons<EngineReturn>,
        registry: Arc<PluginRegistry>,
        sample_rate: f64,
        block_size: usize,
        channels: usize,
    ) -> Self {
        Self {
            command_writer,
            rt_reader,
            board_tx,
            return_rx,
            registry,
            sample_rate,
            block_size,
            channels,
            command_seq: 0,
            acked: 0,
            descriptors: HashMap::new(),
            transfer_pool: HashMap::new(),
            vu: HashMap::new(),
            output_controls: HashMap::new(),
            learned: None,
            underruns: 0,
            audio_terminated: false,
            input_db: 0.0,
            output_db: 0.0,
        }
    }

    /// Compiles `board` and ships it to the realtime thread. Existing
    /// instances (same id and URI) retired by earlier swaps are transferred
    /// instead of re-instantiated. Items that fail to load are reported;
    /// the rest of the board runs.
    pub fn set_pedalboard(&mut self, board: &Pedalboard) -> Result<Vec<LoadError>> {
        let (mut rt_board, errors) = build_rt_pedalboard(
            board,
            &self.registry,
            self.sample_rate,
            self.block_size,
            self.channels,
            &mut self.transfer_pool,
        );
        rt_board.activate();

        let descriptors: HashMap<u64, EffectDescriptor> = rt_board
            .effects()
            .iter()
            .map(|effect| {
                (
                    effect.instance_id(),
                    EffectDescriptor {
                        uri: effect.uri().to_string(),
                        symbols: effect
                            .ports()
                            .iter()
                            .enumerate()
                            .map(|(i, p)| (p.symbol.clone(), i as u32))
                            .collect(),
                        patch_slot: effect.patch_slot(),
                    },
                )
            })
            .collect();

        self.board_tx
            .try_push(EngineCommand::LoadBoard(Box::new(rt_board)))
            .map_err(|_| Error::Busy)?;
        self.descriptors = descriptors;
        self.vu.clear();
        self.output_controls.clear();
        self.input_db = board.input_volume_db;
        self.output_db = board.output_volume_db;
        Ok(errors)
    }

    /// Drains realtime telemetry and harvests retired boards. Call from the
    /// host's housekeeping loop.
    pub fn poll(&mut self) {
        while let Some(retired) = self.return_rx.try_pop() {
            match retired {
                EngineReturn::RetiredBoard(board) => {
                    let mut board = *board;
                    board.deactivate();
                    // Old instances become transfer candidates for the next
                    // load; stale candidates from the previous swap go away.
                    self.transfer_pool.clear();
                    for effect in board.into_effects() {
                        self.transfer_pool.insert(effect.instance_id(), effect);
                    }
                }
            }
        }

        while let Some(message) = self.rt_reader.read() {
            match message {
                RtMessage::VuSample {
                    instance,
                    channel,
                    peak,
                    rms,
                } => {
                    self.vu
                        .entry(instance)
                        .or_default()
                        .insert(channel, VuReading { peak, rms });
                }
                RtMessage::ParamReadback {
                    instance,
                    port_index,
                    value,
                } => {
                    self.output_controls.insert((instance, port_index), value);
                }
                RtMessage::MidiLearned {
                    kind,
                    channel,
                    data,
                } => {
                    self.learned = Some(match kind {
                        0 => LearnedKey::Cc {
                            channel,
                            controller: data,
                        },
                        1 => LearnedKey::Note {
                            channel,
                            note: data,
                        },
                        _ => LearnedKey::ProgramChange { channel },
                    });
                }
                RtMessage::UnderrunCounter(count) => self.underruns = count,
                RtMessage::AudioTerminated => self.audio_terminated = true,
                RtMessage::CommandAck(seq) => self.acked = seq,
            }
        }
    }

    fn port_index(&self, instance_id: u64, symbol: &str) -> Result<u32> {
        let descriptor = self
            .descriptors
            .get(&instance_id)
            .ok_or_else(|| Error::NotFound(format!("no effect instance {instance_id}")))?;
        descriptor
            .symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("{}: no port '{symbol}'", descriptor.uri)))
    }

    fn send(&mut self, message: HostMessage) -> Result<u64> {
        self.command_writer.write(&message)?;
        self.command_seq += 1;
        Ok(self.command_seq)
    }

    /// Enqueues a control change. `Ok` means enqueued, not applied.
    pub fn set_control(&mut self, instance_id: u64, symbol: &str, value: f32) -> Result<u64> {
        let port_index = self.port_index(instance_id, symbol)?;
        self.send(HostMessage::SetControl {
            instance: instance_id,
            port_index,
            value,
        })
    }

    pub fn set_bypass(&mut self, instance_id: u64, enable: bool) -> Result<u64> {
        if !self.descriptors.contains_key(&instance_id) {
            return Err(Error::NotFound(format!("no effect instance {instance_id}")));
        }
        self.send(HostMessage::SetBypass {
            instance: instance_id,
            enable,
        })
    }

    pub fn set_input_db(&mut self, db: f32) -> Result<u64> {
        self.input_db = db;
        self.send(HostMessage::SetInputVolumeDb(db))
    }

    pub fn set_output_db(&mut self, db: f32) -> Result<u64> {
        self.output_db = db;
        self.send(HostMessage::SetOutputVolumeDb(db))
    }

    /// Round-trips a no-op command so the caller knows every message sent
    /// so far (and any pending board swap) has been observed.
    pub fn sync(&mut self, timeout: Duration) -> bool {
        match self.send(HostMessage::SetInputVolumeDb(self.input_db)) {
            Ok(seq) => self.wait_for_ack(seq, timeout),
            Err(_) => false,
        }
    }

    /// Asks the realtime thread to gather a patch property into the
    /// effect's slot; read it with the returned handle once acknowledged.
    pub fn request_patch_property(
        &mut self,
        instance_id: u64,
        property: u32,
    ) -> Result<Arc<PatchSlot>> {
        let descriptor = self
            .descriptors
            .get(&instance_id)
            .ok_or_else(|| Error::NotFound(format!("no effect instance {instance_id}")))?;
        let slot = descriptor.patch_slot.clone();
        self.send(HostMessage::RequestPatchProperty {
            instance: instance_id,
            property,
        })?;
        Ok(slot)
    }

    /// Arms MIDI learn; the next eligible event's key arrives via
    /// [`take_learned_key`](Self::take_learned_key).
    pub fn midi_learn(&mut self, instance_id: u64, symbol: &str) -> Result<u64> {
        let port_index = self.port_index(instance_id, symbol)?;
        self.learned = None;
        self.send(HostMessage::MidiLearn {
            instance: instance_id,
            port_index,
        })
    }

    pub fn take_learned_key(&mut self) -> Option<LearnedKey> {
        self.learned.take()
    }

    /// Latest VU readings for one effect, per channel.
    pub fn snapshot_vu(&self, instance_id: u64) -> HashMap<u32, VuReading> {
        self.vu.get(&instance_id).cloned().unwrap_or_default()
    }

    /// Latest output-control reading published by the realtime thread.
    pub fn get_output_control(&self, instance_id: u64, symbol: &str) -> Result<f32> {
        let port_index = self.port_index(instance_id, symbol)?;
        self.output_controls
            .get(&(instance_id, port_index))
            .copied()
            .ok_or_else(|| Error::NotFound(format!("no reading yet for '{symbol}'")))
    }

    /// Instances harvested from the last retired board, available for
    /// transfer into the next load.
    pub fn retired_instances(&self) -> usize {
        self.transfer_pool.len()
    }

    /// Highest command sequence acknowledged by the realtime thread.
    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn command_seq(&self) -> u64 {
        self.command_seq
    }

    /// Blocks (bounded) until the realtime thread has observed command
    /// `seq`. Used around pedalboard-swap acknowledgments; the inversion
    /// guard keeps the wait from starving the realtime thread.
    pub fn wait_for_ack(&mut self, seq: u64, timeout: Duration) -> bool {
        let _guard = RtInversionGuard::new();
        let deadline = Instant::now() + timeout;
        while self.acked < seq {
            if Instant::now() >= deadline {
                return false;
            }
            self.poll();
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn input_db(&self) -> f32 {
        self.input_db
    }

    pub fn output_db(&self) -> f32 {
        self.output_db
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    pub fn audio_terminated(&self) -> bool {
        self.audio_terminated
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }
}
