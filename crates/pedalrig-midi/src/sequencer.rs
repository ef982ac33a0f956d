//! The sequencer contract the driver polls once per block.

use crate::event::MidiTimestamp;
use smallvec::SmallVec;

/// One complete raw MIDI message with its driver timestamp.
///
/// The inline capacity covers every channel-voice message; only sysex spills
/// to the heap, and that happens on the sequencer's thread, not the realtime
/// one.
#[derive(Clone, Debug, Default)]
pub struct RawMidiMessage {
    pub timestamp: MidiTimestamp,
    pub data: SmallVec<[u8; 16]>,
}

impl RawMidiMessage {
    pub fn clear(&mut self) {
        self.timestamp = MidiTimestamp::default();
        self.data.clear();
    }
}

/// Source of timestamped MIDI messages.
///
/// Implementations own parsing concerns: running status is expanded, sysex
/// is reassembled, and only complete messages are handed out. META messages
/// (leading byte `0xFF`) are dropped by the caller.
pub trait MidiSequencer: Send {
    /// Fills `out` with the next pending message. `timeout_ms == 0` polls;
    /// returns false when no message is available within the timeout.
    fn read_message(&mut self, out: &mut RawMidiMessage, timeout_ms: i32) -> bool;
}

/// A sequencer with nothing to say; used when no MIDI hardware is configured.
#[derive(Debug, Default)]
pub struct NullSequencer;

impl MidiSequencer for NullSequencer {
    fn read_message(&mut self, _out: &mut RawMidiMessage, _timeout_ms: i32) -> bool {
        false
    }
}

/// Scripted sequencer for tests: hands out a fixed queue of messages.
#[derive(Debug, Default)]
pub struct QueueSequencer {
    queue: std::collections::VecDeque<RawMidiMessage>,
}

impl QueueSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timestamp: MidiTimestamp, data: &[u8]) {
        self.queue.push_back(RawMidiMessage {
            timestamp,
            data: SmallVec::from_slice(data),
        });
    }
}

impl MidiSequencer for QueueSequencer {
    fn read_message(&mut self, out: &mut RawMidiMessage, _timeout_ms: i32) -> bool {
        match self.queue.pop_front() {
            Some(msg) => {
                *out = msg;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_sequencer_drains_in_order() {
        let mut seq = QueueSequencer::new();
        seq.push(MidiTimestamp::new(1, 0), &[0xB0, 80, 127]);
        seq.push(MidiTimestamp::new(2, 0), &[0xB0, 80, 0]);

        let mut msg = RawMidiMessage::default();
        assert!(seq.read_message(&mut msg, 0));
        assert_eq!(msg.data.as_slice(), &[0xB0, 80, 127]);
        assert_eq!(msg.timestamp.seconds, 1);
        assert!(seq.read_message(&mut msg, 0));
        assert_eq!(msg.timestamp.seconds, 2);
        assert!(!seq.read_message(&mut msg, 0));
    }

    #[test]
    fn test_null_sequencer_is_silent() {
        let mut seq = NullSequencer;
        let mut msg = RawMidiMessage::default();
        assert!(!seq.read_message(&mut msg, 0));
    }
}
