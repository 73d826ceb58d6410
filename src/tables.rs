//! Lookup tables and constants for Layer III bitstream formatting
//!
//! This module contains the static tables required to lay out a frame:
//! sample rate and bitrate tables, scalefactor band boundaries, scalefactor
//! length tables and the range limits used when fitting scalefactors.

/// Sample rates for different MPEG versions
pub const SAMPLE_RATES: [u32; 9] = [
    44100, 48000, 32000, // MPEG-1
    22050, 24000, 16000, // MPEG-2
    11025, 12000, 8000,  // MPEG-2.5
];

/// Bitrate table in kbps, indexed by `[version][bitrate_index]`
/// where version 0 = MPEG-1, 1 = MPEG-2, 2 = MPEG-2.5.
/// Index 0 (free format) and 15 (forbidden) are never selected.
pub const BITRATES: [[u32; 16]; 3] = [
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 0, 0, 0, 0, 0, 0, 0],
];

/// Scalefactor band boundaries for one sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalefactorBands {
    /// Long block band starts, 22 bands plus the 576 terminator
    pub l: [usize; 23],
    /// Short block band starts, 13 bands plus the 192 terminator
    pub s: [usize; 14],
}

/// Scalefactor band boundaries indexed like `SAMPLE_RATES`
pub const SCALEFACTOR_BANDS: [ScalefactorBands; 9] = [
    // 44.1 kHz
    ScalefactorBands {
        l: [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 52, 62, 74, 90, 110, 134, 162, 196, 238, 288, 342, 418, 576],
        s: [0, 4, 8, 12, 16, 22, 30, 40, 52, 66, 84, 106, 136, 192],
    },
    // 48 kHz
    ScalefactorBands {
        l: [0, 4, 8, 12, 16, 20, 24, 30, 36, 42, 50, 60, 72, 88, 106, 128, 156, 190, 230, 276, 330, 384, 576],
        s: [0, 4, 8, 12, 16, 22, 28, 38, 50, 64, 80, 100, 126, 192],
    },
    // 32 kHz
    ScalefactorBands {
        l: [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 54, 66, 82, 102, 126, 156, 194, 240, 296, 364, 448, 550, 576],
        s: [0, 4, 8, 12, 16, 22, 30, 42, 58, 78, 104, 138, 180, 192],
    },
    // 22.05 kHz
    ScalefactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 24, 32, 42, 56, 74, 100, 132, 174, 192],
    },
    // 24 kHz
    ScalefactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 114, 136, 162, 194, 232, 278, 332, 394, 464, 540, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 136, 180, 192],
    },
    // 16 kHz
    ScalefactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    },
    // 11.025 kHz
    ScalefactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    },
    // 12 kHz
    ScalefactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    },
    // 8 kHz
    ScalefactorBands {
        l: [0, 12, 24, 36, 48, 60, 72, 88, 108, 132, 160, 192, 232, 280, 336, 400, 476, 566, 568, 570, 572, 574, 576],
        s: [0, 8, 16, 24, 36, 52, 72, 96, 124, 160, 162, 164, 166, 192],
    },
];

/// Scalefactor bit widths for the first band group (MPEG-1 `scalefac_compress`)
pub const SLEN1_TAB: [u32; 16] = [0, 0, 0, 0, 3, 1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4];
/// Scalefactor bit widths for the second band group (MPEG-1 `scalefac_compress`)
pub const SLEN2_TAB: [u32; 16] = [0, 1, 2, 3, 0, 1, 2, 3, 1, 2, 3, 1, 2, 3, 2, 3];

/// Exclusive upper bound of scalefactors codable with `SLEN1_TAB[k]` bits
pub const SLEN1_N: [i32; 16] = [1, 1, 1, 1, 8, 2, 2, 2, 4, 4, 4, 8, 8, 8, 16, 16];
/// Exclusive upper bound of scalefactors codable with `SLEN2_TAB[k]` bits
pub const SLEN2_N: [i32; 16] = [1, 2, 4, 8, 1, 2, 4, 8, 2, 4, 8, 2, 4, 8, 4, 8];

/// Band groups sharing one scfsi flag
pub const SCFSI_BAND: [usize; 5] = [0, 6, 11, 16, 21];

/// Pre-emphasis added to long block scalefactors when `preflag` is set
pub const PRETAB: [i32; 22] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 3, 3, 3, 2, 0];

/// MPEG-2/2.5 scalefactor partition sizes, `[table][block row][partition]`.
/// Rows: long, short, mixed. Tables 3 to 5 are the intensity stereo variants.
pub const NR_OF_SFB_BLOCK: [[[usize; 4]; 3]; 6] = [
    [[6, 5, 5, 5], [9, 9, 9, 9], [6, 9, 9, 9]],
    [[6, 5, 7, 3], [9, 9, 12, 6], [6, 9, 12, 6]],
    [[11, 10, 0, 0], [18, 18, 0, 0], [15, 18, 0, 0]],
    [[7, 7, 7, 0], [12, 12, 12, 0], [6, 15, 12, 0]],
    [[6, 6, 6, 3], [12, 9, 9, 6], [6, 12, 9, 6]],
    [[8, 8, 5, 0], [15, 12, 9, 0], [6, 18, 9, 0]],
];

/// Largest scalefactor per MPEG-2 partition, indexed like `NR_OF_SFB_BLOCK`
pub const MAX_RANGE_SFAC_TAB: [[i32; 4]; 6] = [
    [15, 15, 7, 7],
    [15, 15, 7, 0],
    [7, 3, 0, 0],
    [15, 31, 31, 0],
    [7, 7, 7, 0],
    [3, 3, 0, 0],
];

/// Bit width needed for a partition maximum in 0..16
pub const LOG2TAB: [u32; 16] = [0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4];

/// Scalefactor range for short blocks, one entry per band and window
pub const MAX_RANGE_SHORT: [i32; 39] = [
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    0, 0, 0,
];

/// Scalefactor range for long blocks
pub const MAX_RANGE_LONG: [i32; 22] = [
    15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 15, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 0,
];

/// Scalefactor range for MPEG-2 long blocks using the pre-emphasis partition table
pub const MAX_RANGE_LONG_LSF_PRETAB: [i32; 22] = [
    7, 7, 7, 7, 7, 7, 3, 3, 3, 3, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Preferred (region0_count, region1_count) by number of long bands in big_values
pub const SUBDV_TABLE: [(usize, usize); 23] = [
    (0, 0), // 0 bands
    (0, 0), // 1 bands
    (0, 0), // 2 bands
    (0, 0), // 3 bands
    (0, 0), // 4 bands
    (0, 1), // 5 bands
    (1, 1), // 6 bands
    (1, 1), // 7 bands
    (1, 2), // 8 bands
    (2, 2), // 9 bands
    (2, 3), // 10 bands
    (2, 3), // 11 bands
    (3, 4), // 12 bands
    (3, 4), // 13 bands
    (3, 4), // 14 bands
    (4, 5), // 15 bands
    (4, 5), // 16 bands
    (4, 6), // 17 bands
    (5, 6), // 18 bands
    (5, 6), // 19 bands
    (5, 7), // 20 bands
    (6, 7), // 21 bands
    (6, 7), // 22 bands
];

/// Helper function to get sample rate index from sample rate value
pub fn sample_rate_index(sample_rate: u32) -> Option<usize> {
    SAMPLE_RATES.iter().position(|&rate| rate == sample_rate)
}

/// Scalefactor bands for a sample rate
pub fn scalefactor_bands(sample_rate: u32) -> Option<&'static ScalefactorBands> {
    sample_rate_index(sample_rate).map(|index| &SCALEFACTOR_BANDS[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_tables_are_monotonic() {
        for bands in SCALEFACTOR_BANDS.iter() {
            assert!(bands.l.windows(2).all(|w| w[0] < w[1]));
            assert!(bands.s.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(bands.l[22], 576);
            assert_eq!(bands.s[13], 192);
        }
    }

    #[test]
    fn test_slen_bounds_match_widths() {
        for k in 0..16 {
            assert_eq!(SLEN1_N[k], 1 << SLEN1_TAB[k]);
            assert_eq!(SLEN2_N[k], 1 << SLEN2_TAB[k]);
        }
    }

    #[test]
    fn test_partition_tables_cover_all_bands() {
        for table in NR_OF_SFB_BLOCK.iter().take(3) {
            assert_eq!(table[0].iter().sum::<usize>(), 21);
            assert_eq!(table[1].iter().sum::<usize>(), 36);
        }
    }

    #[test]
    fn test_sample_rate_lookup() {
        assert_eq!(sample_rate_index(44100), Some(0));
        assert_eq!(sample_rate_index(8000), Some(8));
        assert_eq!(sample_rate_index(44000), None);
        assert_eq!(scalefactor_bands(48000).map(|b| b.l[9]), Some(42));
    }
}
