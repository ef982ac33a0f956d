//! User-defined MIDI-to-control bindings, as persisted in the pedalboard.

use serde::{Deserialize, Serialize};

/// Which incoming events a binding listens to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BindingKey {
    /// Control-change `controller` on `channel` (`None` = omni).
    Cc {
        channel: Option<u8>,
        controller: u8,
    },
    /// Note on/off for `note` on `channel`.
    Note { channel: Option<u8>, note: u8 },
    /// Any program change on `channel`.
    ProgramChange { channel: Option<u8> },
}

impl BindingKey {
    /// Omni channel match helper.
    #[inline]
    pub fn channel_matches(filter: Option<u8>, channel: u8) -> bool {
        filter.map_or(true, |c| c == channel)
    }
}

/// How a matched event maps onto the target control's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MappingKind {
    /// CC value scaled onto `[min, max]`; enumerations quantize, integer
    /// ports round.
    Linear,
    /// Relative encoder: CC value 64 is rest, offsets step the value.
    Circular,
    /// Held: max while on, min while off.
    Momentary,
    /// Positive edges toggle between min and max.
    Latched,
    /// Positive edge emits max for one block, then min.
    Trigger,
    /// Repeated triggers set a BPM-valued control.
    TapTempo,
}

/// A persisted binding: key + target + mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiBinding {
    pub key: BindingKey,
    /// Target effect instance.
    pub instance_id: u64,
    /// Target control port symbol, resolved to an index at load.
    pub control: String,
    pub kind: MappingKind,
    /// Mapped range; defaults to the port's own range when absent.
    #[serde(default)]
    pub min: Option<f32>,
    #[serde(default)]
    pub max: Option<f32>,
}
