//! Hardware MIDI input via midir, adapted to the polled sequencer contract.
//!
//! midir delivers messages on its own callback thread; the engine polls from
//! the realtime thread. The bridge is a byte SPSC ring: the callback frames
//! `{u64 micros, u8 len, bytes}` and pushes with a single `push_slice`, the
//! realtime side pops without blocking or allocating.

use crate::event::MidiTimestamp;
use crate::sequencer::{MidiSequencer, RawMidiMessage};
use midir::{Ignore, MidiInput, MidiInputConnection};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use thiserror::Error;

const RING_BYTES: usize = 16 * 1024;
const FRAME_HEADER: usize = 9;
const MAX_MESSAGE: usize = 255;

#[derive(Error, Debug)]
pub enum MidiIoError {
    #[error("MIDI subsystem init failed: {0}")]
    Init(String),

    #[error("MIDI port not found: {0}")]
    PortNotFound(String),

    #[error("MIDI port connect failed: {0}")]
    Connect(String),
}

/// A midir-backed [`MidiSequencer`]. Dropping it closes the port.
pub struct MidirSequencer {
    cons: HeapCons<u8>,
    scratch: [u8; FRAME_HEADER + MAX_MESSAGE],
    _connection: MidiInputConnection<()>,
}

impl MidirSequencer {
    /// Lists available input port names.
    pub fn ports() -> Result<Vec<String>, MidiIoError> {
        let input = MidiInput::new("pedalrig").map_err(|e| MidiIoError::Init(e.to_string()))?;
        Ok(input
            .ports()
            .iter()
            .filter_map(|p| input.port_name(p).ok())
            .collect())
    }

    /// Connects to the input port whose name contains `port_name`.
    pub fn connect(port_name: &str) -> Result<Self, MidiIoError> {
        let mut input = MidiInput::new("pedalrig").map_err(|e| MidiIoError::Init(e.to_string()))?;
        input.ignore(Ignore::Time);

        let ports = input.ports();
        let port = ports
            .iter()
            .find(|p| {
                input
                    .port_name(p)
                    .map(|name| name.contains(port_name))
                    .unwrap_or(false)
            })
            .ok_or_else(|| MidiIoError::PortNotFound(port_name.into()))?;

        let (mut prod, cons) = HeapRb::<u8>::new(RING_BYTES).split();
        let mut frame = [0u8; FRAME_HEADER + MAX_MESSAGE];

        let connection = input
            .connect(
                port,
                "pedalrig-in",
                move |micros, bytes, _| {
                    if bytes.is_empty() || bytes.len() > MAX_MESSAGE {
                        return;
                    }
                    let len = FRAME_HEADER + bytes.len();
                    frame[0..8].copy_from_slice(&micros.to_le_bytes());
                    frame[8] = bytes.len() as u8;
                    frame[9..len].copy_from_slice(bytes);
                    if prod.vacant_len() >= len {
                        prod.push_slice(&frame[..len]);
                    }
                    // Ring full: drop the message; the consumer is stalled
                    // anyway and stale MIDI is worse than none.
                },
                (),
            )
            .map_err(|e| MidiIoError::Connect(e.to_string()))?;

        tracing::info!(port = port_name, "MIDI input connected");

        Ok(Self {
            cons,
            scratch: [0; FRAME_HEADER + MAX_MESSAGE],
            _connection: connection,
        })
    }
}

impl MidiSequencer for MidirSequencer {
    fn read_message(&mut self, out: &mut RawMidiMessage, _timeout_ms: i32) -> bool {
        if self.cons.occupied_len() < FRAME_HEADER {
            return false;
        }
        let mut header = [0u8; FRAME_HEADER];
        self.cons.pop_slice(&mut header);
        let micros = u64::from_le_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6],
            header[7],
        ]);
        let len = header[8] as usize;
        self.cons.pop_slice(&mut self.scratch[..len]);

        out.timestamp = MidiTimestamp::from_micros(micros);
        out.data.clear();
        out.data.extend_from_slice(&self.scratch[..len]);
        true
    }
}
