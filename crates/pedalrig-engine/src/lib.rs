//! Pedalboard runtime and control plane for the pedalrig engine.
//!
//! The engine compiles a persisted [`Pedalboard`] into a realtime process
//! plan, runs it under the driver's block loop, and exposes a non-realtime
//! [`ControlPlane`] whose mutating calls all cross the realtime boundary
//! through lock-free rings.

mod effect;
pub use effect::{
    ControlPortInfo, EffectInstance, FlushScratch, LifecycleState, PatchSlot, PatchValue, Plugin,
};

pub mod effects;

mod board;
pub use board::{Pedalboard, PedalboardItem, PluginItem, SplitItem};

mod plan;
pub use plan::{build_rt_pedalboard, LoadError, RtPedalboard};

mod registry;
pub use registry::{PluginRegistry, Preset};

mod rt;
pub use rt::{EngineCommand, EngineReturn, EngineRt};

mod control;
pub use control::{ControlPlane, LearnedKey};

mod engine;
pub use engine::{Engine, EngineBuilder};
