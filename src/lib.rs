//! # pedalrig - Real-time guitar-effects engine
//!
//! Umbrella crate coordinating the pedalboard subsystems:
//! - **pedalrig-core** - engine kernel (sample codec, dezipper, ring
//!   messages, VU, crash guard, worker, signals)
//! - **pedalrig-midi** - MIDI events, control bindings, mapping state
//!   machines, sequencer I/O
//! - **pedalrig-driver** - realtime audio driver over the PCM device
//!   contract, with xrun recovery
//! - **pedalrig-engine** - pedalboard runtime, process plan, control plane
//!
//! ## Quick start
//!
//! ```no_run
//! use pedalrig::prelude::*;
//!
//! # fn main() -> pedalrig::Result<()> {
//! let mut engine = Engine::builder()
//!     .config(DriverConfig {
//!         device_name: "default".into(),
//!         block_size: 64,
//!         ..Default::default()
//!     })
//!     .build()?;
//!
//! let board = Pedalboard::empty();
//! engine.load_pedalboard(&board)?;
//!
//! while !engine.shutdown_requested() {
//!     engine.poll();
//!     std::thread::sleep(std::time::Duration::from_millis(30));
//! }
//! engine.shutdown(true);
//! # Ok(())
//! # }
//! ```

/// Re-export of the subsystem crates for direct access.
pub use pedalrig_core as core;
pub use pedalrig_driver as driver;
pub use pedalrig_engine as engine;
pub use pedalrig_midi as midi;

pub use pedalrig_core::{Error, Result};

// Engine surface
pub use pedalrig_engine::{
    ControlPlane, Engine, EngineBuilder, LearnedKey, LoadError, Pedalboard, PedalboardItem,
    PluginItem, PluginRegistry, Preset, SplitItem,
};

// Driver surface
pub use pedalrig_driver::{
    AudioDriver, ChannelSelection, CpuMetrics, DriverConfig, DummyBackend, NegotiatedConfig,
    PcmBackend, PcmDevice, PcmError, TraceEntry,
};

// Kernel types
pub use pedalrig_core::{
    AudioFormat, CrashGuard, DbDezipper, SampleFormat, VuReading, Worker,
};

// MIDI types
pub use pedalrig_midi::{
    BindingKey, MappingKind, MidiBinding, MidiSequencer, MidiTimestamp, RawMidiMessage,
};

/// Everything a typical embedder needs.
pub mod prelude {
    pub use crate::{
        BindingKey, DriverConfig, Engine, Error, MappingKind, MidiBinding, Pedalboard,
        PedalboardItem, PluginItem, PluginRegistry, Result, SampleFormat, SplitItem, VuReading,
    };
}
