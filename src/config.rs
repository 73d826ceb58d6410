//! Stream parameters for the bitstream back end
//!
//! This module provides configuration structures and validation logic for
//! everything the back end needs before the first frame: sample rate,
//! bitrate or VBR range, channel mode, header flags and reservoir policy.
//! Unsupported combinations are rejected here, never mid-stream.

use crate::error::{ConfigError, ConfigResult};
use crate::tables::{sample_rate_index, BITRATES};

/// Main configuration structure for the encoder back end
#[derive(Debug, Clone)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub struct Config {
    /// Wave/audio configuration
    pub wave: WaveConfig,
    /// MPEG encoding configuration
    pub mpeg: MpegConfig,
}

/// Audio format configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub struct WaveConfig {
    /// Number of audio channels
    pub channels: Channels,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

/// MPEG encoding configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub struct MpegConfig {
    /// Stereo encoding mode
    pub mode: StereoMode,
    /// Target bitrate in kbps (the fixed rate for CBR)
    pub bitrate: u32,
    /// Pre-emphasis mode
    pub emphasis: Emphasis,
    /// Copyright flag
    pub copyright: bool,
    /// Original flag
    pub original: bool,
    /// Append a CRC-16 after the header
    pub error_protection: bool,
    /// Header private bit
    pub extension: bool,
    /// Fixed or variable bitrate
    pub vbr: VbrMode,
    /// Step-size search effort for VBR
    pub search: SearchEffort,
    /// Never carry bits across frames
    pub disable_reservoir: bool,
    /// Limit frame buffers to what a strict ISO decoder holds
    pub strict_iso: bool,
}

/// Number of audio channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub enum Channels {
    /// Mono audio (1 channel)
    Mono = 1,
    /// Stereo audio (2 channels)
    Stereo = 2,
}

/// Stereo encoding modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub enum StereoMode {
    /// Standard stereo
    Stereo,
    /// Joint stereo (uses mid/side encoding)
    JointStereo,
    /// Dual channel (independent channels)
    DualChannel,
    /// Mono
    Mono,
}

/// Pre-emphasis modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub enum Emphasis {
    /// No emphasis
    None,
    /// 50/15 microseconds emphasis
    Emphasis50_15,
    /// CCITT J.17 emphasis
    CcittJ17,
}

/// MPEG version enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub enum MpegVersion {
    /// MPEG-1
    Mpeg1,
    /// MPEG-2
    Mpeg2,
    /// MPEG-2.5
    Mpeg25,
}

/// Bitrate control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub enum VbrMode {
    /// Every frame uses `MpegConfig::bitrate`
    Cbr,
    /// Each frame picks the lowest bitrate in range that holds its bits
    Vbr { min_bitrate: u32, max_bitrate: u32 },
}

/// How thoroughly the VBR search looks for per-band scalefactors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub enum SearchEffort {
    /// Binary search against the measured quantization noise
    Full,
    /// Closed-form estimate from the masking threshold alone
    Fast,
}

impl StereoMode {
    /// Two-bit mode field of the frame header
    pub fn header_bits(self) -> u32 {
        match self {
            StereoMode::Stereo => 0,
            StereoMode::JointStereo => 1,
            StereoMode::DualChannel => 2,
            StereoMode::Mono => 3,
        }
    }
}

impl Emphasis {
    /// Two-bit emphasis field of the frame header
    pub fn header_bits(self) -> u32 {
        match self {
            Emphasis::None => 0,
            Emphasis::Emphasis50_15 => 1,
            Emphasis::CcittJ17 => 3,
        }
    }
}

impl MpegVersion {
    /// Row of `BITRATES` for this version
    pub fn table_row(self) -> usize {
        match self {
            MpegVersion::Mpeg1 => 0,
            MpegVersion::Mpeg2 => 1,
            MpegVersion::Mpeg25 => 2,
        }
    }

    /// Granules per frame
    pub fn granules(self) -> usize {
        match self {
            MpegVersion::Mpeg1 => 2,
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 1,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            wave: WaveConfig::default(),
            mpeg: MpegConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.wave.validate()?;
        self.mpeg.validate(&self.wave)?;
        self.validate_compatibility()?;
        Ok(())
    }

    /// Get the MPEG version based on sample rate
    pub fn mpeg_version(&self) -> MpegVersion {
        match self.wave.sample_rate {
            44100 | 48000 | 32000 => MpegVersion::Mpeg1,
            22050 | 24000 | 16000 => MpegVersion::Mpeg2,
            _ => MpegVersion::Mpeg25,
        }
    }

    /// Get the number of samples per frame
    pub fn samples_per_frame(&self) -> usize {
        576 * self.mode_gr()
    }

    /// Granules per frame
    pub fn mode_gr(&self) -> usize {
        self.mpeg_version().granules()
    }

    /// Number of coded channels
    pub fn channels(&self) -> usize {
        usize::from(self.wave.channels)
    }

    /// Bitrate index for a rate in kbps, if the version defines it
    pub fn bitrate_index_of(&self, bitrate: u32) -> Option<usize> {
        let row = &BITRATES[self.mpeg_version().table_row()];
        (1..15).find(|&index| row[index] == bitrate)
    }

    /// Bitrate index of the configured CBR rate
    pub fn bitrate_index(&self) -> Option<usize> {
        self.bitrate_index_of(self.mpeg.bitrate)
    }

    /// Bitrate in kbps for an index
    pub fn bitrate_of_index(&self, index: usize) -> u32 {
        BITRATES[self.mpeg_version().table_row()][index]
    }

    /// Range of bitrate indices a frame may use
    pub fn bitrate_index_range(&self) -> Option<(usize, usize)> {
        match self.mpeg.vbr {
            VbrMode::Cbr => self.bitrate_index().map(|index| (index, index)),
            VbrMode::Vbr { min_bitrate, max_bitrate } => {
                Some((self.bitrate_index_of(min_bitrate)?, self.bitrate_index_of(max_bitrate)?))
            }
        }
    }

    /// Get sample rate index for the frame header
    pub fn samplerate_index(&self) -> u32 {
        sample_rate_index(self.wave.sample_rate).map_or(0, |index| (index % 3) as u32)
    }

    /// Bytes of header plus side information (plus CRC when protected)
    pub fn side_info_len(&self) -> usize {
        let side = match (self.mpeg_version(), self.wave.channels) {
            (MpegVersion::Mpeg1, Channels::Mono) => 17,
            (MpegVersion::Mpeg1, Channels::Stereo) => 32,
            (_, Channels::Mono) => 9,
            (_, Channels::Stereo) => 17,
        };
        4 + side + if self.mpeg.error_protection { 2 } else { 0 }
    }

    /// Whole bytes per frame before padding, times the sample rate remainder
    fn slot_numerator(&self, bitrate_index: usize) -> u64 {
        let factor: u64 = match self.mpeg_version() {
            MpegVersion::Mpeg1 => 144_000,
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 72_000,
        };
        factor * self.bitrate_of_index(bitrate_index) as u64
    }

    /// Frame length in bits for a bitrate index and padding decision
    pub fn frame_bits(&self, bitrate_index: usize, padding: bool) -> usize {
        let bytes = self.slot_numerator(bitrate_index) / self.wave.sample_rate as u64;
        8 * (bytes as usize + padding as usize)
    }

    /// Fractional slot increment used to decide padding for a CBR stream
    pub fn frac_slots_per_frame(&self) -> u64 {
        match (self.mpeg.vbr, self.bitrate_index()) {
            (VbrMode::Cbr, Some(index)) => self.slot_numerator(index) % self.wave.sample_rate as u64,
            _ => 0,
        }
    }

    /// Most bits one frame's main data plus side info may span
    pub fn max_frame_buffer_bits(&self) -> usize {
        if self.mpeg.strict_iso {
            let top = match self.mpeg_version() {
                MpegVersion::Mpeg1 | MpegVersion::Mpeg2 => 14,
                MpegVersion::Mpeg25 => 8,
            };
            self.frame_bits(top, false)
        } else {
            8 * 1440
        }
    }

    /// Validate compatibility between sample rate and bitrate
    fn validate_compatibility(&self) -> ConfigResult<()> {
        if self.bitrate_index().is_none() {
            return Err(ConfigError::IncompatibleRateCombination {
                sample_rate: self.wave.sample_rate,
                bitrate: self.mpeg.bitrate,
            });
        }

        if let VbrMode::Vbr { min_bitrate, max_bitrate } = self.mpeg.vbr {
            match (self.bitrate_index_of(min_bitrate), self.bitrate_index_of(max_bitrate)) {
                (Some(low), Some(high)) if low <= high => {}
                _ => {
                    return Err(ConfigError::InvalidVbrRange {
                        min: min_bitrate,
                        max: max_bitrate,
                    })
                }
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl WaveConfig {
    /// Validate wave configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if sample_rate_index(self.sample_rate).is_none() {
            return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
        }

        Ok(())
    }
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            channels: Channels::Stereo,
            sample_rate: 44100,
        }
    }
}

impl MpegConfig {
    /// Validate MPEG configuration
    pub fn validate(&self, wave: &WaveConfig) -> ConfigResult<()> {
        const VALID_BITRATES: &[u32] = &[
            8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 192, 224, 256, 320,
        ];

        if !VALID_BITRATES.contains(&self.bitrate) {
            return Err(ConfigError::UnsupportedBitrate(self.bitrate));
        }

        match (wave.channels, self.mode) {
            (Channels::Mono, StereoMode::Mono) => Ok(()),
            (Channels::Stereo, StereoMode::Stereo | StereoMode::JointStereo | StereoMode::DualChannel) => Ok(()),
            (channels, mode) => Err(ConfigError::InvalidStereoMode {
                mode: format!("{:?}", mode),
                channels: channels as u8,
            }),
        }
    }
}

impl Default for MpegConfig {
    fn default() -> Self {
        Self {
            mode: StereoMode::JointStereo,
            bitrate: 128,
            emphasis: Emphasis::None,
            copyright: false,
            original: true,
            error_protection: false,
            extension: false,
            vbr: VbrMode::Cbr,
            search: SearchEffort::Full,
            disable_reservoir: false,
            strict_iso: false,
        }
    }
}

impl From<u8> for Channels {
    fn from(value: u8) -> Self {
        match value {
            1 => Channels::Mono,
            _ => Channels::Stereo,
        }
    }
}

impl From<Channels> for usize {
    fn from(channels: Channels) -> Self {
        channels as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    prop_compose! {
        fn valid_sample_rate()(rate in prop::sample::select(&[
            44100u32, 48000, 32000,  // MPEG-1
            22050, 24000, 16000,     // MPEG-2
            11025, 12000, 8000,      // MPEG-2.5
        ])) -> u32 {
            rate
        }
    }

    prop_compose! {
        fn valid_channels()(channels in prop::sample::select(&[Channels::Mono, Channels::Stereo])) -> Channels {
            channels
        }
    }

    fn bitrates_for(sample_rate: u32) -> Vec<u32> {
        match sample_rate {
            44100 | 48000 | 32000 => vec![32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
            22050 | 24000 | 16000 => vec![8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
            _ => vec![8, 16, 24, 32, 40, 48, 56, 64],
        }
    }

    fn compatible_config() -> impl Strategy<Value = Config> {
        (valid_sample_rate(), valid_channels(), any::<bool>())
            .prop_flat_map(|(sample_rate, channels, error_protection)| {
                let mode = match channels {
                    Channels::Mono => StereoMode::Mono,
                    Channels::Stereo => StereoMode::JointStereo,
                };
                (
                    Just(sample_rate),
                    Just(channels),
                    prop::sample::select(bitrates_for(sample_rate)),
                    Just(mode),
                    Just(error_protection),
                )
            })
            .prop_map(|(sample_rate, channels, bitrate, mode, error_protection)| Config {
                wave: WaveConfig { channels, sample_rate },
                mpeg: MpegConfig {
                    mode,
                    bitrate,
                    error_protection,
                    ..MpegConfig::default()
                },
            })
    }

    proptest! {
        #[test]
        fn test_valid_configs_pass_validation(config in compatible_config()) {
            prop_assert!(config.validate().is_ok(), "Valid configuration should pass validation");

            let expected_samples = match config.mpeg_version() {
                MpegVersion::Mpeg1 => 1152,
                MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 576,
            };
            prop_assert_eq!(config.samples_per_frame(), expected_samples);

            let index = config.bitrate_index().unwrap();
            prop_assert_eq!(config.bitrate_of_index(index), config.mpeg.bitrate);
        }

        #[test]
        fn test_frame_bits_are_whole_bytes(config in compatible_config(), padding in any::<bool>()) {
            let index = config.bitrate_index().unwrap();
            let bits = config.frame_bits(index, padding);
            prop_assert_eq!(bits % 8, 0);
            prop_assert!(bits > 8 * config.side_info_len(), "frame must hold its side info");
        }

        #[test]
        fn test_invalid_sample_rate_rejected(rate in any::<u32>().prop_filter("Must be invalid", |&rate| {
            !matches!(rate, 44100 | 48000 | 32000 | 22050 | 24000 | 16000 | 11025 | 12000 | 8000)
        })) {
            let config = Config {
                wave: WaveConfig { channels: Channels::Stereo, sample_rate: rate },
                mpeg: MpegConfig::default(),
            };
            prop_assert_eq!(config.validate(), Err(ConfigError::UnsupportedSampleRate(rate)));
        }
    }

    #[test]
    fn test_side_info_lengths() {
        let mut config = Config::new();
        assert_eq!(config.side_info_len(), 36);
        config.mpeg.error_protection = true;
        assert_eq!(config.side_info_len(), 38);

        config.wave.sample_rate = 22050;
        config.mpeg.error_protection = false;
        assert_eq!(config.side_info_len(), 21);

        config.wave.channels = Channels::Mono;
        config.mpeg.mode = StereoMode::Mono;
        assert_eq!(config.side_info_len(), 13);
    }

    #[test]
    fn test_frame_length_at_44100() {
        let config = Config::new();
        let index = config.bitrate_index().unwrap();
        assert_eq!(index, 9);
        assert_eq!(config.frame_bits(index, false), 417 * 8);
        assert_eq!(config.frame_bits(index, true), 418 * 8);
        assert_eq!(config.frac_slots_per_frame(), 42300);
    }

    #[test]
    fn test_mpeg25_rejects_high_bitrates() {
        let config = Config {
            wave: WaveConfig { channels: Channels::Mono, sample_rate: 8000 },
            mpeg: MpegConfig { mode: StereoMode::Mono, bitrate: 128, ..MpegConfig::default() },
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::IncompatibleRateCombination { sample_rate: 8000, bitrate: 128 })
        );
    }

    #[test]
    fn test_vbr_range_validation() {
        let mut config = Config::new();
        config.mpeg.vbr = VbrMode::Vbr { min_bitrate: 32, max_bitrate: 320 };
        assert!(config.validate().is_ok());
        assert_eq!(config.bitrate_index_range(), Some((1, 14)));

        config.mpeg.vbr = VbrMode::Vbr { min_bitrate: 256, max_bitrate: 64 };
        assert_eq!(config.validate(), Err(ConfigError::InvalidVbrRange { min: 256, max: 64 }));
    }

    #[test]
    fn test_mono_with_stereo_mode_rejected() {
        let config = Config {
            wave: WaveConfig { channels: Channels::Mono, sample_rate: 44100 },
            mpeg: MpegConfig { mode: StereoMode::Stereo, ..MpegConfig::default() },
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidStereoMode { channels: 1, .. })));
    }

    #[test]
    fn test_channels_conversion() {
        assert_eq!(Channels::from(1), Channels::Mono);
        assert_eq!(Channels::from(2), Channels::Stereo);
        assert_eq!(usize::from(Channels::Mono), 1);
        assert_eq!(usize::from(Channels::Stereo), 2);
    }
}
