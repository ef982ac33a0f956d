//! Driver configuration, frozen at `open()`.

use pedalrig_core::SampleFormat;

/// Requested device configuration. The device may negotiate different
/// channel counts or format; the result is reported as [`NegotiatedConfig`].
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub device_name: String,
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: u32,
    /// Hardware periods in the device buffer.
    pub buffer_count: u32,
    pub capture_channels: u32,
    pub playback_channels: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device_name: "default".into(),
            sample_rate: 48_000,
            block_size: 64,
            buffer_count: 3,
            capture_channels: 2,
            playback_channels: 2,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 {
            return Err("block_size must be non-zero".into());
        }
        if self.buffer_count < 2 {
            return Err("buffer_count must be at least 2".into());
        }
        if self.sample_rate == 0 {
            return Err("sample_rate must be non-zero".into());
        }
        Ok(())
    }
}

/// What the device actually granted.
#[derive(Clone, Debug)]
pub struct NegotiatedConfig {
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub block_size: u32,
    pub buffer_count: u32,
    /// Channels the engine uses.
    pub capture_channels: u32,
    pub playback_channels: u32,
    /// Channels the hardware delivers per frame.
    pub hw_capture_channels: u32,
    pub hw_playback_channels: u32,
}

impl NegotiatedConfig {
    /// Diagnostic description, e.g.
    /// `"ALSA, hw:0, S24_3LE, 48000, 64×3, in: 2/2, out: 2/2"`.
    pub fn description(&self, device_name: &str) -> String {
        format!(
            "ALSA, {}, {}, {}, {}\u{d7}{}, in: {}/{}, out: {}/{}",
            device_name,
            self.format.name(),
            self.sample_rate,
            self.block_size,
            self.buffer_count,
            self.capture_channels,
            self.hw_capture_channels,
            self.playback_channels,
            self.hw_playback_channels,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(DriverConfig::default().validate().is_ok());
        let mut config = DriverConfig::default();
        config.buffer_count = 1;
        assert!(config.validate().is_err());
        let mut config = DriverConfig::default();
        config.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_description_format() {
        let negotiated = NegotiatedConfig {
            format: SampleFormat::S24P3Le,
            sample_rate: 48_000,
            block_size: 64,
            buffer_count: 3,
            capture_channels: 2,
            playback_channels: 2,
            hw_capture_channels: 2,
            hw_playback_channels: 8,
        };
        assert_eq!(
            negotiated.description("hw:0"),
            "ALSA, hw:0, S24_3LE, 48000, 64\u{d7}3, in: 2/2, out: 2/8"
        );
    }
}
