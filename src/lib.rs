//! # Layer III bitstream back end
//!
//! Turns quantized (or masking-annotated) MPEG-1/2/2.5 Layer III granules
//! into a byte-exact elementary stream. The crate covers Huffman table
//! selection and coding, scalefactor and side-information packing with
//! optional CRC, the bit reservoir, the VBR step-size search, and the frame
//! orchestration that splices headers into the main data stream.
//!
//! ```no_run
//! use l3_bitstream::{Config, EncoderState, FrameInput};
//!
//! let mut encoder = EncoderState::new(Config::default())?;
//! let mut out = Vec::new();
//! for _ in 0..10 {
//!     let frame = FrameInput::silence(encoder.config(), encoder.bands());
//!     encoder.encode_frame(frame, &mut out)?;
//! }
//! encoder.flush(&mut out)?;
//! # Ok::<(), l3_bitstream::EncoderError>(())
//! ```

pub mod bitstream;
pub mod config;
pub mod error;
pub mod frame;
pub mod header_ring;
pub mod huffman;
pub mod reservoir;
pub mod scalefactors;
pub mod side_info;
pub mod spectral;
pub mod tables;
pub mod takehiro;
pub mod types;
pub mod vbr;

pub use config::{Channels, Config, Emphasis, MpegConfig, MpegVersion, SearchEffort, StereoMode, VbrMode, WaveConfig};
pub use error::{ConfigError, EncoderError, EncoderResult, EncodingError, InputDataError};
pub use frame::{EncoderState, FrameInput, FrameReport, StreamStats};
pub use types::{BlockType, GranuleInfo, Masking, Scalefactor, SideInfo};
