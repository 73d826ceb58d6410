//! Main data writer: scalefactors and Huffman-coded spectrum
//!
//! Writes what `takehiro` and `scalefactors` counted. Every granule's written
//! bit count is compared against `part2_length` and `part2_3_length`; a
//! difference means the counting and writing passes disagree.

use log::error;

use crate::bitstream::BitStream;
use crate::config::{Config, MpegVersion};
use crate::error::{EncodingError, EncodingResult};
use crate::huffman::{self, COUNT1_TABLE_A, FIRST_ESC_TABLE};
use crate::tables::{ScalefactorBands, SLEN1_TAB, SLEN2_TAB};
use crate::takehiro::switched_region1_start;
use crate::types::{BlockType, GranuleInfo, SideInfo};

/// Code the pairs in `start..end` with `table_index`; table 0 writes nothing
///
/// Index 14 codes with table 16.
pub fn huffman_code(
    stream: &mut BitStream,
    table_index: usize,
    start: usize,
    end: usize,
    gi: &GranuleInfo,
) -> EncodingResult<u32> {
    if table_index == 0 {
        return Ok(0);
    }
    let table_index = huffman::normalize_table_select(table_index);
    let table = huffman::table(table_index);
    let linbits = table.linbits;
    let mut bits = 0;

    for i in (start..end).step_by(2) {
        let mut x = gi.l3_enc[i] as u32;
        let mut y = gi.l3_enc[i + 1] as u32;
        let mut ext = 0u32;
        let mut xbits = 0u32;

        if table_index >= FIRST_ESC_TABLE && x >= 15 {
            ext = x - 15;
            xbits += linbits;
            x = 15;
        }
        if x != 0 {
            ext = (ext << 1) | gi.is_negative(i) as u32;
            xbits += 1;
        }
        if table_index >= FIRST_ESC_TABLE && y >= 15 {
            ext = (ext << linbits) | (y - 15);
            xbits += linbits;
            y = 15;
        }
        if y != 0 {
            ext = (ext << 1) | gi.is_negative(i + 1) as u32;
            xbits += 1;
        }

        let (code, len) = table.pair(x as usize, y as usize);
        stream.put_bits(code, len)?;
        stream.put_bits(ext, xbits)?;
        bits += len + xbits;
    }
    Ok(bits)
}

fn long_huffman_code_bits(stream: &mut BitStream, gi: &GranuleInfo, bands: &ScalefactorBands) -> EncodingResult<u32> {
    let big_values = gi.big_values;
    let index = gi.region0_count + 1;
    let region1_start = bands.l[index].min(big_values);
    let region2_start = bands.l[index + gi.region1_count + 1].min(big_values);

    let mut bits = huffman_code(stream, gi.table_select[0], 0, region1_start, gi)?;
    bits += huffman_code(stream, gi.table_select[1], region1_start, region2_start, gi)?;
    bits += huffman_code(stream, gi.table_select[2], region2_start, big_values, gi)?;
    Ok(bits)
}

fn short_huffman_code_bits(stream: &mut BitStream, gi: &GranuleInfo, bands: &ScalefactorBands) -> EncodingResult<u32> {
    let region1_start = switched_region1_start(gi, bands).min(gi.big_values);
    let mut bits = huffman_code(stream, gi.table_select[0], 0, region1_start, gi)?;
    bits += huffman_code(stream, gi.table_select[1], region1_start, gi.big_values, gi)?;
    Ok(bits)
}

/// Code the count1 quadruples with the table chosen during counting
pub fn huffman_coder_count1(stream: &mut BitStream, gi: &GranuleInfo) -> EncodingResult<u32> {
    let table = huffman::table(COUNT1_TABLE_A + gi.count1table_select);
    let mut bits = 0;

    for start in (gi.big_values..gi.count1).step_by(4) {
        let mut pattern = 0;
        let mut signs = 0u32;
        let mut nsigns = 0;
        for (k, &v) in gi.l3_enc[start..start + 4].iter().enumerate() {
            if v != 0 {
                pattern |= 8 >> k;
                signs = (signs << 1) | gi.is_negative(start + k) as u32;
                nsigns += 1;
            }
        }
        let (code, len) = table.quad(pattern);
        stream.put_bits(code, len)?;
        stream.put_bits(signs, nsigns)?;
        bits += len + nsigns;
    }
    Ok(bits)
}

/// Huffman-coded spectrum of one granule (big values then count1)
fn write_spectrum(stream: &mut BitStream, gi: &GranuleInfo, bands: &ScalefactorBands) -> EncodingResult<u32> {
    let mut bits = if gi.block_type == BlockType::Short {
        short_huffman_code_bits(stream, gi, bands)?
    } else {
        long_huffman_code_bits(stream, gi, bands)?
    };
    bits += huffman_coder_count1(stream, gi)?;
    Ok(bits)
}

/// MPEG-1 scalefactors; reused bands are skipped entirely
fn write_scalefactors_mpeg1(stream: &mut BitStream, gi: &GranuleInfo) -> EncodingResult<u32> {
    let compress = gi.scalefac_compress as usize;
    let mut bits = 0;
    for sfb in 0..gi.sfbmax {
        let Some(value) = gi.scalefac[sfb].value() else {
            continue;
        };
        let slen = if sfb < gi.sfbdivide {
            SLEN1_TAB[compress]
        } else {
            SLEN2_TAB[compress]
        };
        stream.put_bits(value as u32, slen)?;
        bits += slen;
    }
    Ok(bits)
}

/// MPEG-2/2.5 scalefactors, four partitions of independent width
fn write_scalefactors_lsf(stream: &mut BitStream, gi: &GranuleInfo) -> EncodingResult<u32> {
    let mut bits = 0;
    let mut slot = 0;
    for (&count, &slen) in gi.sfb_partition.iter().zip(&gi.slen) {
        for _ in 0..count {
            let value = gi.scalefac[slot].value().unwrap_or(0);
            stream.put_bits(value as u32, slen)?;
            bits += slen;
            slot += 1;
        }
    }
    Ok(bits)
}

fn check_bits(kind: &str, gr: usize, ch: usize, expected: u32, actual: u32) -> EncodingResult<()> {
    if expected != actual {
        error!(
            "{} bits of granule {} channel {}: counted {}, wrote {}",
            kind, gr, ch, expected, actual
        );
        return Err(EncodingError::BitCountMismatch {
            expected: expected as u64,
            actual: actual as u64,
        });
    }
    Ok(())
}

/// Write the main data of every granule and channel of a frame
///
/// Returns the number of bits written, headers spliced on the way excluded.
pub fn write_main_data(
    stream: &mut BitStream,
    config: &Config,
    side: &SideInfo,
    bands: &ScalefactorBands,
) -> EncodingResult<u64> {
    let nch = config.channels();
    let mpeg1 = config.mpeg_version() == MpegVersion::Mpeg1;
    let mut total = 0u64;

    for gr in 0..config.mode_gr() {
        for ch in 0..nch {
            let gi = &side.tt[gr][ch];
            let scale_bits = if mpeg1 {
                write_scalefactors_mpeg1(stream, gi)?
            } else {
                write_scalefactors_lsf(stream, gi)?
            };
            let data_bits = write_spectrum(stream, gi, bands)?;

            check_bits("scalefactor", gr, ch, gi.part2_length, scale_bits)?;
            check_bits("Huffman", gr, ch, gi.part2_3_length, data_bits)?;
            total += (scale_bits + data_bits) as u64;
        }
    }
    Ok(total)
}
