//! Interleaved PCM <-> planar f32 sample codec.
//!
//! One (decode, encode) function pair per wire format. The pair is selected
//! once at device open and called once per block from the realtime thread,
//! so every function here is monomorphic, allocation-free, and branchless in
//! the inner loop.
//!
//! Scaling convention: decode maps an integer sample `v` to
//! `v / (max_of_type + 1)`, so the full negative range reaches exactly -1.0.
//! Encode clamps to [-1.0, 1.0], scales by `max_of_type + 1`, and clamps the
//! integer to the type's range. Encoding then decoding any representable
//! integer is the identity; decoding then encoding any float is accurate to
//! one LSB of the integer format.

mod decode;
mod encode;

pub use decode::*;
pub use encode::*;

use crate::error::{Error, Result};

/// Decodes `frames` interleaved frames from `raw` into `planar[ch][frame]`.
///
/// `raw` must hold at least `frames * channels * bytes_per_sample` bytes and
/// each planar buffer at least `frames` samples.
pub type DecodeFn = fn(raw: &[u8], planar: &mut [Box<[f32]>], channels: usize, frames: usize);

/// Encodes `frames` frames from `planar[ch][frame]` into interleaved `raw`.
pub type EncodeFn = fn(planar: &[Box<[f32]>], raw: &mut [u8], channels: usize, frames: usize);

/// Wire formats the engine can negotiate with a PCM device.
///
/// `S24` is 24 significant bits LSB-justified in a 32-bit word; `S24_3` is
/// the packed 3-byte layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S16Be,
    S24Le,
    S24Be,
    S24P3Le,
    S24P3Be,
    S32Le,
    S32Be,
    F32Le,
    F32Be,
}

impl SampleFormat {
    /// Bytes occupied by one sample on the wire.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Le | Self::S16Be => 2,
            Self::S24P3Le | Self::S24P3Be => 3,
            Self::S24Le | Self::S24Be | Self::S32Le | Self::S32Be | Self::F32Le | Self::F32Be => 4,
        }
    }

    /// ALSA-style format name, used in the driver description string.
    pub fn name(self) -> &'static str {
        match self {
            Self::S16Le => "S16_LE",
            Self::S16Be => "S16_BE",
            Self::S24Le => "S24_LE",
            Self::S24Be => "S24_BE",
            Self::S24P3Le => "S24_3LE",
            Self::S24P3Be => "S24_3BE",
            Self::S32Le => "S32_LE",
            Self::S32Be => "S32_BE",
            Self::F32Le => "FLOAT_LE",
            Self::F32Be => "FLOAT_BE",
        }
    }

    /// Negotiation preference in host byte order: float first, then the
    /// widest integer formats down to 16 bit.
    pub fn host_preference() -> &'static [SampleFormat] {
        if cfg!(target_endian = "little") {
            &[
                Self::F32Le,
                Self::S32Le,
                Self::S24P3Le,
                Self::S24Le,
                Self::S16Le,
            ]
        } else {
            &[
                Self::F32Be,
                Self::S32Be,
                Self::S24P3Be,
                Self::S24Be,
                Self::S16Be,
            ]
        }
    }

    /// Picks the first format of `supported` in host preference order.
    pub fn negotiate(supported: &[SampleFormat]) -> Result<SampleFormat> {
        for &preferred in Self::host_preference() {
            if supported.contains(&preferred) {
                return Ok(preferred);
            }
        }
        // Fall back to any supported format before giving up; a BE device on
        // an LE host still works, just off the fast path.
        supported.first().copied().ok_or_else(|| {
            Error::UnsupportedFormat("device offers no format the codec understands".into())
        })
    }

    pub fn decode_fn(self) -> DecodeFn {
        match self {
            Self::S16Le => decode_s16_le,
            Self::S16Be => decode_s16_be,
            Self::S24Le => decode_s24_le,
            Self::S24Be => decode_s24_be,
            Self::S24P3Le => decode_s24_3le,
            Self::S24P3Be => decode_s24_3be,
            Self::S32Le => decode_s32_le,
            Self::S32Be => decode_s32_be,
            Self::F32Le => decode_f32_le,
            Self::F32Be => decode_f32_be,
        }
    }

    pub fn encode_fn(self) -> EncodeFn {
        match self {
            Self::S16Le => encode_s16_le,
            Self::S16Be => encode_s16_be,
            Self::S24Le => encode_s24_le,
            Self::S24Be => encode_s24_be,
            Self::S24P3Le => encode_s24_3le,
            Self::S24P3Be => encode_s24_3be,
            Self::S32Le => encode_s32_le,
            Self::S32Be => encode_s32_be,
            Self::F32Le => encode_f32_le,
            Self::F32Be => encode_f32_be,
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The (decode, encode) pairing negotiated with a device, plus the frame
/// geometry derived from it. Immutable after open.
#[derive(Clone, Copy)]
pub struct AudioFormat {
    pub format: SampleFormat,
    pub decode: DecodeFn,
    pub encode: EncodeFn,
    pub bytes_per_sample: usize,
}

impl AudioFormat {
    pub fn new(format: SampleFormat) -> Self {
        Self {
            format,
            decode: format.decode_fn(),
            encode: format.encode_fn(),
            bytes_per_sample: format.bytes_per_sample(),
        }
    }

    /// Bytes per interleaved frame for `channels` channels.
    pub fn frame_size(&self, channels: usize) -> usize {
        self.bytes_per_sample * channels
    }
}

impl std::fmt::Debug for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFormat")
            .field("format", &self.format)
            .field("bytes_per_sample", &self.bytes_per_sample)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_FORMATS: [SampleFormat; 10] = [
        SampleFormat::S16Le,
        SampleFormat::S16Be,
        SampleFormat::S24Le,
        SampleFormat::S24Be,
        SampleFormat::S24P3Le,
        SampleFormat::S24P3Be,
        SampleFormat::S32Le,
        SampleFormat::S32Be,
        SampleFormat::F32Le,
        SampleFormat::F32Be,
    ];

    fn planar(channels: usize, frames: usize) -> Vec<Box<[f32]>> {
        (0..channels)
            .map(|_| vec![0.0f32; frames].into_boxed_slice())
            .collect()
    }

    fn round_trip(format: SampleFormat, input: &[f32]) -> Vec<f32> {
        let frames = input.len();
        let fmt = AudioFormat::new(format);

        let mut src = planar(1, frames);
        src[0].copy_from_slice(input);

        let mut raw = vec![0u8; fmt.frame_size(1) * frames];
        (fmt.encode)(&src, &mut raw, 1, frames);

        let mut dst = planar(1, frames);
        (fmt.decode)(&raw, &mut dst, 1, frames);
        dst[0].to_vec()
    }

    #[test]
    fn test_round_trip_tolerance() {
        let input: Vec<f32> = (0..256).map(|i| (i as f32 - 128.0) / 128.0).collect();
        for format in ALL_FORMATS {
            let output = round_trip(format, &input);
            for (a, b) in input.iter().zip(output.iter()) {
                assert!(
                    (a - b).abs() < 4e-5,
                    "{format}: {a} round-tripped to {b}"
                );
            }
        }
    }

    #[test]
    fn test_float_round_trip_exact() {
        let input = [0.0f32, 1.0, -1.0, 0.5, -0.25, 1.0e-7, -3.5e-5];
        for format in [SampleFormat::F32Le, SampleFormat::F32Be] {
            let output = round_trip(format, &input);
            assert_eq!(&input[..], &output[..], "{format}");
        }
    }

    #[test]
    fn test_full_scale_clamps_not_wraps() {
        // +1.0 must encode to the positive maximum, not wrap to the negative
        // end of the integer range.
        for format in ALL_FORMATS {
            let output = round_trip(format, &[1.0, -1.0, 1.5, -1.5]);
            assert!(output[0] > 0.99, "{format}: +1.0 decoded to {}", output[0]);
            assert!((output[1] + 1.0).abs() < 4e-5, "{format}");
            assert!(output[2] > 0.99, "{format}: out-of-range sample wrapped");
            assert!((output[3] + 1.0).abs() < 4e-5, "{format}");
        }
    }

    #[test]
    fn test_s16_identity_on_representable_values() {
        let fmt = AudioFormat::new(SampleFormat::S16Le);
        for v in [-32768i16, -12345, -1, 0, 1, 127, 32767] {
            let mut raw = v.to_le_bytes().to_vec();
            let mut dst = planar(1, 1);
            (fmt.decode)(&raw, &mut dst, 1, 1);
            (fmt.encode)(&dst, &mut raw, 1, 1);
            assert_eq!(i16::from_le_bytes([raw[0], raw[1]]), v);
        }
    }

    #[test]
    fn test_s24_3_identity_on_representable_values() {
        let fmt = AudioFormat::new(SampleFormat::S24P3Le);
        for v in [-8388608i32, -65536, -1, 0, 1, 40000, 8388607] {
            let b = v.to_le_bytes();
            let mut raw = vec![b[0], b[1], b[2]];
            let mut dst = planar(1, 1);
            (fmt.decode)(&raw, &mut dst, 1, 1);
            (fmt.encode)(&dst, &mut raw, 1, 1);
            let decoded =
                i32::from_le_bytes([raw[0], raw[1], raw[2], if raw[2] & 0x80 != 0 { 0xFF } else { 0 }]);
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn test_interleave_order() {
        // Two channels, two frames: wire order is L0 R0 L1 R1.
        let fmt = AudioFormat::new(SampleFormat::S16Le);
        let mut src = planar(2, 2);
        src[0][0] = 0.25;
        src[0][1] = 0.5;
        src[1][0] = -0.25;
        src[1][1] = -0.5;

        let mut raw = vec![0u8; 8];
        (fmt.encode)(&src, &mut raw, 2, 2);

        let sample = |i: usize| i16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
        assert_eq!(sample(0), 8192);
        assert_eq!(sample(1), -8192);
        assert_eq!(sample(2), 16384);
        assert_eq!(sample(3), -16384);
    }

    #[test]
    fn test_negotiate_prefers_float() {
        let supported = [SampleFormat::S16Le, SampleFormat::F32Le, SampleFormat::S32Le];
        if cfg!(target_endian = "little") {
            assert_eq!(
                SampleFormat::negotiate(&supported).unwrap(),
                SampleFormat::F32Le
            );
        }
    }

    #[test]
    fn test_negotiate_integer_order() {
        if cfg!(target_endian = "little") {
            let supported = [SampleFormat::S16Le, SampleFormat::S24P3Le, SampleFormat::S32Le];
            assert_eq!(
                SampleFormat::negotiate(&supported).unwrap(),
                SampleFormat::S32Le
            );
            let supported = [SampleFormat::S16Le, SampleFormat::S24P3Le, SampleFormat::S24Le];
            assert_eq!(
                SampleFormat::negotiate(&supported).unwrap(),
                SampleFormat::S24P3Le
            );
        }
    }

    #[test]
    fn test_negotiate_empty_fails() {
        assert!(SampleFormat::negotiate(&[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip_within_tolerance(
            samples in proptest::collection::vec(-1.0f32..=1.0f32, 1..64)
        ) {
            for format in ALL_FORMATS {
                let output = round_trip(format, &samples);
                for (a, b) in samples.iter().zip(output.iter()) {
                    prop_assert!((a - b).abs() < 4e-5, "{}: {} vs {}", format, a, b);
                }
            }
        }
    }
}
