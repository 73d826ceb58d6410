//! Error types for the Layer III bitstream back end
//!
//! Two classes of failure exist. Parameter and caller errors (`ConfigError`,
//! `EncoderError::BufferTooSmall`) are recoverable. Internal invariant
//! violations (`EncodingError`) mean the encoding session is no longer
//! trustworthy and should be abandoned.

use thiserror::Error;

/// Main error type for the bitstream encoder
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid frame input handed over by the quantization stage
    #[error("Input data error: {0}")]
    InputData(#[from] InputDataError),

    /// Internal consistency errors raised while producing frames
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Output slice cannot hold the buffered bytes
    #[error("Output buffer too small: {required} bytes required, {available} available")]
    BufferTooSmall { required: usize, available: usize },
}

/// Stream parameter validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Unsupported sample rate
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// Unsupported bitrate
    #[error("Unsupported bitrate: {0} kbps")]
    UnsupportedBitrate(u32),

    /// Invalid channel configuration
    #[error("Invalid channel configuration")]
    InvalidChannels,

    /// Incompatible sample rate and bitrate combination
    #[error("Incompatible sample rate ({sample_rate} Hz) and bitrate ({bitrate} kbps) combination")]
    IncompatibleRateCombination { sample_rate: u32, bitrate: u32 },

    /// Invalid stereo mode for channel count
    #[error("Invalid stereo mode {mode:?} for {channels} channels")]
    InvalidStereoMode { mode: String, channels: u8 },

    /// VBR bounds are reversed or outside the version's bitrate table
    #[error("Invalid VBR bitrate range: {min} to {max} kbps")]
    InvalidVbrRange { min: u32, max: u32 },
}

/// Frame input validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputDataError {
    /// Granule/channel layout does not match the stream parameters
    #[error("Invalid granule layout: expected {expected_granules}x{expected_channels}, got {granules}x{channels}")]
    GranuleLayout {
        expected_granules: usize,
        expected_channels: usize,
        granules: usize,
        channels: usize,
    },

    /// Masking data missing or mismatched for VBR search
    #[error("Masking data does not match the granule layout")]
    MaskingLayout,

    /// Quantized magnitude outside the escape range
    #[error("Quantized value {value} at index {index} exceeds the largest codable magnitude")]
    QuantizedValueRange { index: usize, value: i32 },

    /// Scalefactors cannot be represented with any scalefac_compress value
    #[error("Scalefactors of granule {granule} channel {channel} exceed the codable range")]
    ScalefactorRange { granule: usize, channel: usize },
}

/// Internal invariant violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    /// More bits requested in one write than the writer accepts
    #[error("Bit width {0} out of range")]
    BitWidthOutOfRange(u32),

    /// Header ring has no free slot
    #[error("Header ring overflow: {capacity} headers pending")]
    HeaderRingOverflow { capacity: usize },

    /// A header became due at a bit offset already passed
    #[error("Header due at bit {write_timing} but writer is at bit {position}")]
    HeaderTimingMissed { write_timing: u64, position: u64 },

    /// Bit count from the counting pass differs from the bits written
    #[error("Bit count mismatch: counted {expected}, wrote {actual}")]
    BitCountMismatch { expected: u64, actual: u64 },

    /// Reservoir bookkeeping disagrees with the stream state
    #[error("Reservoir mismatch: reservoir {resv_size} bits, stream {stream_bits} bits")]
    ReservoirMismatch { resv_size: i64, stream_bits: i64 },

    /// Frame content does not fit the largest allowed frame
    #[error("Frame needs {used} bits but at most {limit} are available")]
    FrameBitsExceeded { used: u64, limit: u64 },

    /// A granule/channel needs more bits than `part2_3_length` can express
    #[error("Granule {granule} channel {channel} needs {bits} bits, field holds at most 4095")]
    GranuleBitsExceeded { granule: usize, channel: usize, bits: u32 },

    /// A side-information value does not fit its field
    #[error("Value {value} does not fit a {width}-bit side-info field")]
    FieldOverflow { value: u32, width: usize },

    /// Scalefactors produced by the step-size search are not codable
    #[error("Scalefactor allocation produced uncodable values")]
    ScalefactorAllocation,

    /// Bit writer buffer exhausted
    #[error("Bit writer buffer overflow at {0} bytes")]
    BufferOverflow(usize),

    /// Flush computed a negative amount of padding
    #[error("Negative flush bit count {0}")]
    NegativeFlushBits(i64),
}

/// Specialized result types for different modules
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type InputResult<T> = std::result::Result<T, InputDataError>;
pub type EncodingResult<T> = std::result::Result<T, EncodingError>;
pub type EncoderResult<T> = std::result::Result<T, EncoderError>;
