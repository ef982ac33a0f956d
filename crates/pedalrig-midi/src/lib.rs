//! MIDI subsystem for the pedalrig engine.
//!
//! Splits into three layers:
//! - raw events and the per-block event arena the driver fills
//!   ([`MidiEventBuffer`]),
//! - persisted bindings and their mapping state machines
//!   ([`MidiBinding`], [`MappingState`]),
//! - the [`MidiSequencer`] contract the driver polls, with a midir-backed
//!   implementation behind the `midi-io` feature.
//!
//! Binding *resolution* (symbol -> port index against a loaded pedalboard)
//! lives with the pedalboard runtime, not here.

mod event;
pub use event::{parse_midi, MidiEvent, MidiEventBuffer, MidiTimestamp, ParsedMidi};

mod binding;
pub use binding::{BindingKey, MappingKind, MidiBinding};

mod mapping;
pub use mapping::{MappingInput, MappingState, PortRange};

mod sequencer;
pub use sequencer::{MidiSequencer, NullSequencer, QueueSequencer, RawMidiMessage};

#[cfg(feature = "midi-io")]
pub mod io;
#[cfg(feature = "midi-io")]
pub use io::{MidiIoError, MidirSequencer};
