//! Type definitions shared by the Layer III back end
//!
//! `GranuleInfo` carries one granule of one channel from the quantization
//! stage through table selection, scalefactor packing and the VBR search.
//! `SideInfo` aggregates the granules of one frame together with the
//! reservoir pointer and scfsi flags written into the side information.

use crate::tables::ScalefactorBands;

/// Spectral lines per granule
pub const GRANULE_SIZE: usize = 576;
/// Maximum channels per frame
pub const MAX_CHANNELS: usize = 2;
/// Maximum granules per frame
pub const MAX_GRANULES: usize = 2;
/// Long block scalefactor bands, including the band above the last coded one
pub const SBMAX_L: usize = 22;
/// Short block scalefactor bands, including the band above the last coded one
pub const SBMAX_S: usize = 13;
/// Long block bands that carry a scalefactor
pub const SBPSY_L: usize = 21;
/// Short block bands that carry a scalefactor
pub const SBPSY_S: usize = 12;
/// Band/window slots of the largest layout (short blocks)
pub const SFBMAX: usize = SBMAX_S * 3;
/// Largest `part2_3_length` the 12-bit side-info field can carry
pub const MAX_BITS_PER_CHANNEL: usize = 4095;
/// Largest number of bits one granule may use
pub const MAX_BITS_PER_GRANULE: usize = 7680;
/// Largest quantized magnitude: 15 plus a 13-bit escape
pub const IXMAX_VAL: i32 = 8206;

/// Window switching block types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub enum BlockType {
    /// Long block without window switching
    #[default]
    Normal,
    /// Transition from long to short
    Start,
    /// Three short windows
    Short,
    /// Transition from short to long
    Stop,
}

impl BlockType {
    /// Two-bit block_type field (only written when window switching)
    pub fn header_bits(self) -> u32 {
        match self {
            BlockType::Normal => 0,
            BlockType::Start => 1,
            BlockType::Short => 2,
            BlockType::Stop => 3,
        }
    }
}

/// A scalefactor as carried in the main data
///
/// `Reused` marks an MPEG-1 second-granule band whose value is taken from
/// the first granule through scfsi. It occupies no bits in the main data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalefactor {
    Reused,
    Value(u8),
}

impl Scalefactor {
    /// Numeric value, if transmitted
    #[inline]
    pub fn value(self) -> Option<u8> {
        match self {
            Scalefactor::Reused => None,
            Scalefactor::Value(v) => Some(v),
        }
    }

    /// Numeric value for range checks; reused bands count as zero
    #[inline]
    pub fn magnitude(self) -> i32 {
        self.value().map_or(0, i32::from)
    }
}

impl Default for Scalefactor {
    fn default() -> Self {
        Scalefactor::Value(0)
    }
}

/// Per-band masking data produced by the psychoacoustic model
#[derive(Debug, Clone)]
pub struct Masking {
    /// Allowed noise energy per band/window slot, laid out like `GranuleInfo::width`
    pub l3_xmin: [f32; SFBMAX],
    /// Perceptual entropy of the granule
    pub pe: f32,
}

impl Default for Masking {
    fn default() -> Self {
        Self {
            l3_xmin: [0.0; SFBMAX],
            pe: 0.0,
        }
    }
}

/// Coding parameters and data of one granule of one channel
///
/// Bit accounting follows the counting pass: `part2_3_length` holds the
/// Huffman bits and `part2_length` the scalefactor bits. The 12-bit side-info
/// field receives their sum (`total_bits`).
///
/// For short blocks `xr` and `l3_enc` are in bitstream order: band by band,
/// and within a band window 0, 1, 2.
#[derive(Debug, Clone)]
pub struct GranuleInfo {
    /// Spectrum before quantization; only the signs reach the bitstream
    pub xr: [f32; GRANULE_SIZE],
    /// Quantized magnitudes
    pub l3_enc: [i32; GRANULE_SIZE],
    /// Scalefactors indexed like `width`
    pub scalefac: [Scalefactor; SFBMAX],
    pub block_type: BlockType,
    pub mixed_block_flag: bool,
    /// Coefficients in the big-values region (twice the pair count)
    pub big_values: usize,
    /// End of the count1 region
    pub count1: usize,
    pub count1bits: u32,
    pub global_gain: i32,
    pub scalefac_compress: u32,
    pub scalefac_scale: bool,
    pub preflag: bool,
    pub subblock_gain: [i32; 3],
    pub region0_count: usize,
    pub region1_count: usize,
    pub table_select: [usize; 3],
    pub count1table_select: usize,
    pub part2_length: u32,
    pub part2_3_length: u32,
    /// MPEG-2 scalefactor widths per partition
    pub slen: [u32; 4],
    /// MPEG-2 band counts per partition
    pub sfb_partition: [usize; 4],
    pub max_nonzero_coeff: usize,
    /// Band/window slots carrying a scalefactor
    pub sfbmax: usize,
    /// First slot coded with the second MPEG-1 scalefactor width
    pub sfbdivide: usize,
    /// Slots covered by the masking analysis
    pub psymax: usize,
    pub width: [usize; SFBMAX],
    pub window: [usize; SFBMAX],
}

impl Default for GranuleInfo {
    fn default() -> Self {
        Self {
            xr: [0.0; GRANULE_SIZE],
            l3_enc: [0; GRANULE_SIZE],
            scalefac: [Scalefactor::default(); SFBMAX],
            block_type: BlockType::Normal,
            mixed_block_flag: false,
            big_values: 0,
            count1: 0,
            count1bits: 0,
            global_gain: 210,
            scalefac_compress: 0,
            scalefac_scale: false,
            preflag: false,
            subblock_gain: [0; 3],
            region0_count: 0,
            region1_count: 0,
            table_select: [0; 3],
            count1table_select: 0,
            part2_length: 0,
            part2_3_length: 0,
            slen: [0; 4],
            sfb_partition: [0; 4],
            max_nonzero_coeff: 0,
            sfbmax: SBPSY_L,
            sfbdivide: 11,
            psymax: SBPSY_L,
            width: [0; SFBMAX],
            window: [0; SFBMAX],
        }
    }
}

impl GranuleInfo {
    /// Empty granule with the band layout of `block_type`
    pub fn new(block_type: BlockType, bands: &ScalefactorBands) -> Self {
        let mut gi = Self {
            block_type,
            ..Self::default()
        };
        gi.set_layout(bands);
        gi
    }

    /// Recompute band widths and slot counts for the current block type
    pub fn set_layout(&mut self, bands: &ScalefactorBands) {
        self.width = [0; SFBMAX];
        self.window = [0; SFBMAX];
        if self.block_type == BlockType::Short {
            for sfb in 0..SBMAX_S {
                let w = bands.s[sfb + 1] - bands.s[sfb];
                for win in 0..3 {
                    self.width[sfb * 3 + win] = w;
                    self.window[sfb * 3 + win] = win;
                }
            }
            self.sfbmax = SBPSY_S * 3;
            self.sfbdivide = 6 * 3;
        } else {
            for sfb in 0..SBMAX_L {
                self.width[sfb] = bands.l[sfb + 1] - bands.l[sfb];
            }
            self.sfbmax = SBPSY_L;
            self.sfbdivide = 11;
        }
        self.psymax = self.sfbmax;
    }

    /// Number of band/window slots that cover the spectrum
    pub fn slots(&self) -> usize {
        if self.block_type == BlockType::Short {
            SFBMAX
        } else {
            SBMAX_L
        }
    }

    /// Index of the last nonzero spectral line (0 for silence)
    pub fn update_max_nonzero_coeff(&mut self) -> usize {
        self.max_nonzero_coeff = self.xr.iter().rposition(|x| x.abs() > 1e-12).unwrap_or(0);
        self.max_nonzero_coeff
    }

    /// Value written to the 12-bit part2_3_length field
    #[inline]
    pub fn total_bits(&self) -> u32 {
        self.part2_3_length + self.part2_length
    }

    /// True when the sample at `index` codes with a sign bit of one
    #[inline]
    pub fn is_negative(&self, index: usize) -> bool {
        self.xr[index] < 0.0
    }
}

/// Side information of one frame
#[derive(Debug, Clone, Default)]
pub struct SideInfo {
    /// Bytes of main data stored before this frame's header
    pub main_data_begin: usize,
    pub private_bits: u32,
    /// Stuffing drained before this frame's main data
    pub resv_drain_pre: usize,
    /// Stuffing drained after this frame's main data
    pub resv_drain_post: usize,
    pub scfsi: [[bool; 4]; MAX_CHANNELS],
    /// Granule data, `tt[granule][channel]`
    pub tt: [[GranuleInfo; MAX_CHANNELS]; MAX_GRANULES],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::SCALEFACTOR_BANDS;

    #[test]
    fn test_long_layout_covers_granule() {
        let gi = GranuleInfo::new(BlockType::Normal, &SCALEFACTOR_BANDS[0]);
        assert_eq!(gi.width[..gi.slots()].iter().sum::<usize>(), GRANULE_SIZE);
        assert_eq!(gi.sfbmax, 21);
        assert_eq!(gi.sfbdivide, 11);
    }

    #[test]
    fn test_short_layout_covers_granule() {
        let gi = GranuleInfo::new(BlockType::Short, &SCALEFACTOR_BANDS[1]);
        assert_eq!(gi.width[..gi.slots()].iter().sum::<usize>(), GRANULE_SIZE);
        assert_eq!(gi.window[..6], [0, 1, 2, 0, 1, 2]);
        assert_eq!(gi.sfbmax, 36);
    }

    #[test]
    fn test_scalefactor_reused_has_no_value() {
        assert_eq!(Scalefactor::Reused.value(), None);
        assert_eq!(Scalefactor::Reused.magnitude(), 0);
        assert_eq!(Scalefactor::Value(7).value(), Some(7));
    }

    #[test]
    fn test_max_nonzero_coeff() {
        let mut gi = GranuleInfo::default();
        assert_eq!(gi.update_max_nonzero_coeff(), 0);
        gi.xr[300] = -0.5;
        assert_eq!(gi.update_max_nonzero_coeff(), 300);
    }
}
