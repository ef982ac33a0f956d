//! Engine kernel for the pedalrig appliance.
//!
//! Everything here is either realtime-safe (codec, dezipper, ring messages,
//! VU accumulation, lock-free atomics) or a host-side service the realtime
//! thread depends on (crash guard, worker, signal flags). The driver,
//! pedalboard runtime, and control plane live in their own crates and build
//! on these pieces.

pub mod error;
pub use error::{Error, Result};

pub mod codec;
pub use codec::{AudioFormat, DecodeFn, EncodeFn, SampleFormat};

mod dezipper;
pub use dezipper::DbDezipper;

mod lockfree;
pub use lockfree::{AtomicCounter, AtomicDouble, AtomicFlag, AtomicFloat};

pub mod messages;
pub use messages::{
    host_to_rt_ring, rt_ring_capacity, rt_to_host_ring, HostMessage, HostReader, HostWriter,
    RtMessage, RtReader, RtWriter,
};

mod vu;
pub use vu::{VuAccumulator, VuReading};

mod crash_guard;
pub use crash_guard::{CrashGuard, CrashGuardLock};

mod worker;
pub use worker::Worker;

pub mod signal;
