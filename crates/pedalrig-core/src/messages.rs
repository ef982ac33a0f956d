//! Framed SPSC ring messages between the realtime and host threads.
//!
//! Two byte rings cross the realtime boundary: host->realtime carries control
//! commands, realtime->host carries telemetry and acknowledgments. Frames are
//! `{u32 length, u32 tag, payload[length]}`, little-endian, written with a
//! single `push_slice` so a frame is either wholly visible to the reader or
//! not at all.
//!
//! Overflow policy differs per direction: the realtime writer soft-drops
//! (callers count drops), the host writer surfaces [`Error::Busy`] so the
//! API caller can retry.

use crate::error::{Error, Result};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Largest frame (header + payload) any message serializes to.
pub const MAX_FRAME: usize = 64;

const HEADER: usize = 8;

/// Frame tags. Stable wire values; new tags append.
pub mod tag {
    // realtime -> host
    pub const VU_SAMPLE: u32 = 0x01;
    pub const PARAM_READBACK: u32 = 0x02;
    pub const MIDI_LEARNED: u32 = 0x03;
    pub const UNDERRUN_COUNTER: u32 = 0x04;
    pub const AUDIO_TERMINATED: u32 = 0x05;
    pub const COMMAND_ACK: u32 = 0x06;

    // host -> realtime
    pub const SET_CONTROL: u32 = 0x41;
    pub const SET_BYPASS: u32 = 0x42;
    pub const SET_INPUT_VOL_DB: u32 = 0x43;
    pub const SET_OUTPUT_VOL_DB: u32 = 0x44;
    pub const REQUEST_PATCH_PROP: u32 = 0x45;
    pub const MIDI_LEARN: u32 = 0x46;
}

/// Serialization surface for one frame's payload.
struct FrameBuf {
    buf: [u8; MAX_FRAME],
    len: usize,
}

impl FrameBuf {
    fn new(tag: u32) -> Self {
        let mut frame = Self {
            buf: [0; MAX_FRAME],
            len: HEADER,
        };
        frame.buf[4..8].copy_from_slice(&tag.to_le_bytes());
        frame
    }

    fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf[self.len..self.len + 4].copy_from_slice(&v.to_le_bytes());
        self.len += 4;
        self
    }

    fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf[self.len..self.len + 8].copy_from_slice(&v.to_le_bytes());
        self.len += 8;
        self
    }

    fn put_f32(&mut self, v: f32) -> &mut Self {
        self.buf[self.len..self.len + 4].copy_from_slice(&v.to_bits().to_le_bytes());
        self.len += 4;
        self
    }

    fn finish(&mut self) -> &[u8] {
        let payload = (self.len - HEADER) as u32;
        self.buf[0..4].copy_from_slice(&payload.to_le_bytes());
        &self.buf[..self.len]
    }
}

/// Payload cursor for parsing.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let b = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Option<f32> {
        self.u32().map(f32::from_bits)
    }
}

/// Opaque encoded frame handed to the ring writer.
pub struct EncodedFrame {
    buf: [u8; MAX_FRAME],
    len: usize,
}

impl EncodedFrame {
    fn from(frame: &mut FrameBuf) -> Self {
        let bytes = frame.finish();
        let mut out = Self {
            buf: [0; MAX_FRAME],
            len: bytes.len(),
        };
        out.buf[..bytes.len()].copy_from_slice(bytes);
        out
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Telemetry flowing realtime -> host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RtMessage {
    VuSample {
        instance: u64,
        channel: u32,
        peak: f32,
        rms: f32,
    },
    ParamReadback {
        instance: u64,
        port_index: u32,
        value: f32,
    },
    MidiLearned {
        kind: u8,
        channel: u8,
        data: u8,
    },
    UnderrunCounter(u64),
    AudioTerminated,
    CommandAck(u64),
}

impl RtMessage {
    fn encode(&self) -> EncodedFrame {
        match *self {
            Self::VuSample {
                instance,
                channel,
                peak,
                rms,
            } => {
                let mut f = FrameBuf::new(tag::VU_SAMPLE);
                f.put_u64(instance).put_u32(channel).put_f32(peak).put_f32(rms);
                EncodedFrame::from(&mut f)
            }
            Self::ParamReadback {
                instance,
                port_index,
                value,
            } => {
                let mut f = FrameBuf::new(tag::PARAM_READBACK);
                f.put_u64(instance).put_u32(port_index).put_f32(value);
                EncodedFrame::from(&mut f)
            }
            Self::MidiLearned { kind, channel, data } => {
                let mut f = FrameBuf::new(tag::MIDI_LEARNED);
                f.put_u32(kind as u32).put_u32(channel as u32).put_u32(data as u32);
                EncodedFrame::from(&mut f)
            }
            Self::UnderrunCounter(count) => {
                let mut f = FrameBuf::new(tag::UNDERRUN_COUNTER);
                f.put_u64(count);
                EncodedFrame::from(&mut f)
            }
            Self::AudioTerminated => EncodedFrame::from(&mut FrameBuf::new(tag::AUDIO_TERMINATED)),
            Self::CommandAck(seq) => {
                let mut f = FrameBuf::new(tag::COMMAND_ACK);
                f.put_u64(seq);
                EncodedFrame::from(&mut f)
            }
        }
    }

    fn decode(tag_value: u32, payload: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(payload);
        match tag_value {
            tag::VU_SAMPLE => Some(Self::VuSample {
                instance: c.u64()?,
                channel: c.u32()?,
                peak: c.f32()?,
                rms: c.f32()?,
            }),
            tag::PARAM_READBACK => Some(Self::ParamReadback {
                instance: c.u64()?,
                port_index: c.u32()?,
                value: c.f32()?,
            }),
            tag::MIDI_LEARNED => Some(Self::MidiLearned {
                kind: c.u32()? as u8,
                channel: c.u32()? as u8,
                data: c.u32()? as u8,
            }),
            tag::UNDERRUN_COUNTER => Some(Self::UnderrunCounter(c.u64()?)),
            tag::AUDIO_TERMINATED => Some(Self::AudioTerminated),
            tag::COMMAND_ACK => Some(Self::CommandAck(c.u64()?)),
            _ => None,
        }
    }
}

/// Commands flowing host -> realtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostMessage {
    SetControl {
        instance: u64,
        port_index: u32,
        value: f32,
    },
    SetBypass {
        instance: u64,
        enable: bool,
    },
    SetInputVolumeDb(f32),
    SetOutputVolumeDb(f32),
    RequestPatchProperty {
        instance: u64,
        property: u32,
    },
    MidiLearn {
        instance: u64,
        port_index: u32,
    },
}

impl HostMessage {
    fn encode(&self) -> EncodedFrame {
        match *self {
            Self::SetControl {
                instance,
                port_index,
                value,
            } => {
                let mut f = FrameBuf::new(tag::SET_CONTROL);
                f.put_u64(instance).put_u32(port_index).put_f32(value);
                EncodedFrame::from(&mut f)
            }
            Self::SetBypass { instance, enable } => {
                let mut f = FrameBuf::new(tag::SET_BYPASS);
                f.put_u64(instance).put_u32(enable as u32);
                EncodedFrame::from(&mut f)
            }
            Self::SetInputVolumeDb(db) => {
                let mut f = FrameBuf::new(tag::SET_INPUT_VOL_DB);
                f.put_f32(db);
                EncodedFrame::from(&mut f)
            }
            Self::SetOutputVolumeDb(db) => {
                let mut f = FrameBuf::new(tag::SET_OUTPUT_VOL_DB);
                f.put_f32(db);
                EncodedFrame::from(&mut f)
            }
            Self::RequestPatchProperty { instance, property } => {
                let mut f = FrameBuf::new(tag::REQUEST_PATCH_PROP);
                f.put_u64(instance).put_u32(property);
                EncodedFrame::from(&mut f)
            }
            Self::MidiLearn {
                instance,
                port_index,
            } => {
                let mut f = FrameBuf::new(tag::MIDI_LEARN);
                f.put_u64(instance).put_u32(port_index);
                EncodedFrame::from(&mut f)
            }
        }
    }

    fn decode(tag_value: u32, payload: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(payload);
        match tag_value {
            tag::SET_CONTROL => Some(Self::SetControl {
                instance: c.u64()?,
                port_index: c.u32()?,
                value: c.f32()?,
            }),
            tag::SET_BYPASS => Some(Self::SetBypass {
                instance: c.u64()?,
                enable: c.u32()? != 0,
            }),
            tag::SET_INPUT_VOL_DB => Some(Self::SetInputVolumeDb(c.f32()?)),
            tag::SET_OUTPUT_VOL_DB => Some(Self::SetOutputVolumeDb(c.f32()?)),
            tag::REQUEST_PATCH_PROP => Some(Self::RequestPatchProperty {
                instance: c.u64()?,
                property: c.u32()?,
            }),
            tag::MIDI_LEARN => Some(Self::MidiLearn {
                instance: c.u64()?,
                port_index: c.u32()?,
            }),
            _ => None,
        }
    }
}

/// Writer half of the realtime -> host ring. Lives on the realtime thread;
/// never blocks, never allocates. Overflow drops the frame and counts it.
pub struct RtWriter {
    prod: HeapProd<u8>,
    dropped: u64,
}

impl RtWriter {
    #[inline]
    pub fn write(&mut self, msg: &RtMessage) -> bool {
        let frame = msg.encode();
        let bytes = frame.bytes();
        if self.prod.vacant_len() < bytes.len() {
            self.dropped += 1;
            return false;
        }
        self.prod.push_slice(bytes);
        true
    }

    /// Frames dropped to overflow since creation.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Reader half of the realtime -> host ring. Lives on the host thread.
pub struct RtReader {
    cons: HeapCons<u8>,
    scratch: [u8; MAX_FRAME],
}

impl RtReader {
    pub fn read(&mut self) -> Option<RtMessage> {
        loop {
            let (tag_value, len) = self.read_header()?;
            self.cons.pop_slice(&mut self.scratch[..len]);
            if let Some(msg) = RtMessage::decode(tag_value, &self.scratch[..len]) {
                return Some(msg);
            }
            // Unknown tag from a newer peer: skip the frame.
        }
    }

    fn read_header(&mut self) -> Option<(u32, usize)> {
        if self.cons.occupied_len() < HEADER {
            return None;
        }
        let mut header = [0u8; HEADER];
        self.cons.pop_slice(&mut header);
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let tag_value = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        debug_assert!(len <= MAX_FRAME - HEADER);
        Some((tag_value, len.min(MAX_FRAME - HEADER)))
    }
}

/// Writer half of the host -> realtime ring. Host thread; overflow is `Busy`.
pub struct HostWriter {
    prod: HeapProd<u8>,
}

impl HostWriter {
    pub fn write(&mut self, msg: &HostMessage) -> Result<()> {
        let frame = msg.encode();
        let bytes = frame.bytes();
        if self.prod.vacant_len() < bytes.len() {
            return Err(Error::Busy);
        }
        self.prod.push_slice(bytes);
        Ok(())
    }
}

/// Reader half of the host -> realtime ring. Realtime thread; never blocks.
pub struct HostReader {
    cons: HeapCons<u8>,
    scratch: [u8; MAX_FRAME],
}

impl HostReader {
    #[inline]
    pub fn read(&mut self) -> Option<HostMessage> {
        loop {
            if self.cons.occupied_len() < HEADER {
                return None;
            }
            let mut header = [0u8; HEADER];
            self.cons.pop_slice(&mut header);
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let tag_value = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let len = len.min(MAX_FRAME - HEADER);
            self.cons.pop_slice(&mut self.scratch[..len]);
            if let Some(msg) = HostMessage::decode(tag_value, &self.scratch[..len]) {
                return Some(msg);
            }
        }
    }
}

/// Builds the realtime -> host ring pair with `capacity` bytes.
pub fn rt_to_host_ring(capacity: usize) -> (RtWriter, RtReader) {
    let (prod, cons) = HeapRb::<u8>::new(capacity).split();
    (
        RtWriter { prod, dropped: 0 },
        RtReader {
            cons,
            scratch: [0; MAX_FRAME],
        },
    )
}

/// Builds the host -> realtime ring pair with `capacity` bytes.
pub fn host_to_rt_ring(capacity: usize) -> (HostWriter, HostReader) {
    let (prod, cons) = HeapRb::<u8>::new(capacity).split();
    (
        HostWriter { prod },
        HostReader {
            cons,
            scratch: [0; MAX_FRAME],
        },
    )
}

/// Ring capacity sized for one full block of VU traffic for `max_effects`
/// effects on `channels` channels, plus per-effect parameter headroom.
pub fn rt_ring_capacity(max_effects: usize, channels: usize) -> usize {
    let vu_frame = HEADER + 20;
    let param_frame = HEADER + 16;
    2 * max_effects * channels * vu_frame + max_effects * 8 * param_frame + 256
}
