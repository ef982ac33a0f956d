//! The PCM device contract the realtime driver is written against.
//!
//! Devices are opened in interleaved mode with linked capture and playback
//! streams. Hardware backends (ALSA and friends) implement [`PcmBackend`]
//! out of tree; in-tree implementations are the dummy device and the
//! scripted simulation device used by tests.

use crate::config::{DriverConfig, NegotiatedConfig};
use pedalrig_core::Error;

/// Stream-level errors, in ALSA's vocabulary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PcmError {
    /// No data available right now (non-blocking read/write).
    #[error("stream not ready")]
    Again,

    /// Under/overrun (`EPIPE`): the stream needs prepare + restart.
    #[error("stream xrun")]
    Xrun,

    /// Stream suspended (`ESTRPIPE`): resume, or prepare when resume fails.
    #[error("stream suspended")]
    Suspended,

    /// Another process owns the device.
    #[error("device busy: {0}")]
    Busy(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Anything the driver cannot recover in place; triggers restart.
    #[error("device failure: {0}")]
    Failed(String),
}

impl PcmError {
    /// Maps open-time errors onto the host-facing error kinds.
    pub fn into_open_error(self, device: &str) -> Error {
        match self {
            PcmError::Busy(msg) => Error::DeviceBusy(format!("{device}: {msg}")),
            PcmError::Permission(msg) => Error::PermissionDenied(format!("{device}: {msg}")),
            PcmError::Unsupported(msg) => Error::UnsupportedFormat(format!("{device}: {msg}")),
            other => Error::Driver(format!("{device}: {other}")),
        }
    }
}

pub type PcmResult<T> = Result<T, PcmError>;

/// A linked capture/playback stream pair, interleaved bytes on both sides.
///
/// All calls are non-blocking or bounded by an explicit timeout; the
/// realtime thread only ever parks inside [`wait`](PcmDevice::wait).
pub trait PcmDevice: Send {
    fn negotiated(&self) -> &NegotiatedConfig;

    /// Thread name for diagnostics (`"alsaDriver"`, `"dummyAudioDriver"`).
    fn driver_name(&self) -> &'static str;

    /// Reads up to `frames` interleaved capture frames into `buf`. Returns
    /// the number of frames read; 0 means "try again after wait".
    fn read(&mut self, buf: &mut [u8], frames: usize) -> PcmResult<usize>;

    /// Writes `frames` interleaved playback frames from `buf`.
    fn write(&mut self, buf: &[u8], frames: usize) -> PcmResult<usize>;

    fn start_capture(&mut self) -> PcmResult<()>;
    fn prepare_capture(&mut self) -> PcmResult<()>;
    fn prepare_playback(&mut self) -> PcmResult<()>;
    fn drain_capture(&mut self) -> PcmResult<()>;
    fn resume(&mut self) -> PcmResult<()>;

    /// Links / unlinks the capture and playback streams so they start and
    /// stop together.
    fn link(&mut self) -> PcmResult<()>;
    fn unlink(&mut self) -> PcmResult<()>;

    /// Parks until capture data is available or `timeout_ms` elapses.
    /// Returns false on timeout. Also the wakeup point for cooperative
    /// termination: implementations return early when woken.
    fn wait(&mut self, timeout_ms: i32) -> PcmResult<bool>;

    fn capture_avail(&mut self) -> PcmResult<usize>;
    fn playback_avail(&mut self) -> PcmResult<usize>;
}

/// Opens [`PcmDevice`]s; retained by the driver so a failed stream can be
/// torn down and reopened in place.
pub trait PcmBackend: Send + Sync + 'static {
    type Device: PcmDevice + 'static;

    fn open(&self, config: &DriverConfig) -> PcmResult<Self::Device>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        assert!(matches!(
            PcmError::Busy("held".into()).into_open_error("hw:0"),
            Error::DeviceBusy(_)
        ));
        assert!(matches!(
            PcmError::Permission("root".into()).into_open_error("hw:0"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            PcmError::Unsupported("fmt".into()).into_open_error("hw:0"),
            Error::UnsupportedFormat(_)
        ));
        assert!(matches!(
            PcmError::Xrun.into_open_error("hw:0"),
            Error::Driver(_)
        ));
    }
}
