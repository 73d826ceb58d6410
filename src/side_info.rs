//! Frame header and side information rendering
//!
//! Each frame's header and side information are rendered into a fixed-size
//! byte block as soon as the frame's granules are final. The block is then
//! handed to the header scheduler, which places it in the stream at the
//! frame boundary. The optional CRC-16 is computed over the rendered block.

use log::error;

use crate::config::{Config, MpegVersion, StereoMode};
use crate::error::{EncodingError, EncodingResult};
use crate::header_ring::MAX_HEADER_LEN;
use crate::huffman::normalize_table_select;
use crate::types::{BlockType, GranuleInfo, SideInfo};

/// CRC-16 generator polynomial (x^16 + x^15 + x^2 + 1)
pub const CRC16_POLYNOMIAL: u32 = 0x8005;

/// Per-frame header fields that are not fixed by the stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub bitrate_index: usize,
    pub padding: bool,
    /// Mid/side coding active in this frame (joint stereo only)
    pub ms_stereo: bool,
}

impl FrameHeader {
    /// Two-bit mode extension; intensity stereo is never signalled
    pub fn mode_ext(&self, config: &Config) -> u32 {
        if config.mpeg.mode == StereoMode::JointStereo && self.ms_stereo {
            2
        } else {
            0
        }
    }
}

/// MSB-first packer over a fixed header buffer
struct HeaderBuf {
    buf: [u8; MAX_HEADER_LEN],
    ptr: usize,
}

impl HeaderBuf {
    fn new() -> Self {
        Self {
            buf: [0; MAX_HEADER_LEN],
            ptr: 0,
        }
    }

    /// Append the `width` low bits of `value`; wider values are rejected
    fn put(&mut self, value: u32, mut width: usize) -> EncodingResult<()> {
        if width < 32 && value >> width != 0 {
            error!("side-info value {} does not fit {} bits", value, width);
            return Err(EncodingError::FieldOverflow { value, width });
        }
        while width > 0 {
            let k = width.min(8 - (self.ptr & 7));
            width -= k;
            let chunk = ((value >> width) & ((1 << k) - 1)) as u8;
            self.buf[self.ptr >> 3] |= chunk << (8 - (self.ptr & 7) - k);
            self.ptr += k;
        }
        Ok(())
    }

    fn put_flag(&mut self, flag: bool) -> EncodingResult<()> {
        self.put(flag as u32, 1)
    }
}

/// Fold one byte into a running CRC-16
pub fn crc_update(value: u8, crc: u32) -> u32 {
    let mut value = u32::from(value) << 8;
    let mut crc = crc;
    for _ in 0..8 {
        value <<= 1;
        crc <<= 1;
        if (crc ^ value) & 0x10000 != 0 {
            crc ^= CRC16_POLYNOMIAL;
        }
    }
    crc & 0xffff
}

/// CRC over header bytes 2 and 3 and everything after the CRC field
pub fn header_crc(block: &[u8]) -> u16 {
    let crc = [block[2], block[3]]
        .iter()
        .chain(&block[6..])
        .fold(0xffff, |crc, &byte| crc_update(byte, crc));
    crc as u16
}

fn write_frame_header(hb: &mut HeaderBuf, config: &Config, header: &FrameHeader) -> EncodingResult<()> {
    let sync = if config.wave.sample_rate < 16000 { 0xffe } else { 0xfff };
    hb.put(sync, 12)?;
    hb.put_flag(config.mpeg_version() == MpegVersion::Mpeg1)?;
    hb.put(1, 2)?;
    hb.put_flag(!config.mpeg.error_protection)?;
    hb.put(header.bitrate_index as u32, 4)?;
    hb.put(config.samplerate_index(), 2)?;
    hb.put_flag(header.padding)?;
    hb.put_flag(config.mpeg.extension)?;
    hb.put(config.mpeg.mode.header_bits(), 2)?;
    hb.put(header.mode_ext(config), 2)?;
    hb.put_flag(config.mpeg.copyright)?;
    hb.put_flag(config.mpeg.original)?;
    hb.put(config.mpeg.emphasis.header_bits(), 2)?;
    if config.mpeg.error_protection {
        hb.put(0, 16)?;
    }
    Ok(())
}

/// Block-type dependent part shared by both layouts
fn write_block_fields(hb: &mut HeaderBuf, gi: &GranuleInfo) -> EncodingResult<()> {
    if gi.block_type != BlockType::Normal {
        hb.put(1, 1)?;
        hb.put(gi.block_type.header_bits(), 2)?;
        hb.put_flag(gi.mixed_block_flag)?;
        hb.put(gi.table_select[0] as u32, 5)?;
        hb.put(gi.table_select[1] as u32, 5)?;
        for &gain in &gi.subblock_gain {
            hb.put(gain as u32, 3)?;
        }
    } else {
        hb.put(0, 1)?;
        for &table in &gi.table_select {
            hb.put(table as u32, 5)?;
        }
        hb.put(gi.region0_count as u32, 4)?;
        hb.put(gi.region1_count as u32, 3)?;
    }
    Ok(())
}

/// Render header and side information for one frame
///
/// Table index 14 is rewritten to 16 in `side` before rendering. The
/// returned block is exactly `config.side_info_len()` bytes long.
pub fn render_side_info(config: &Config, side: &mut SideInfo, header: &FrameHeader) -> EncodingResult<Vec<u8>> {
    let mode_gr = config.mode_gr();
    let nch = config.channels();
    for gr in 0..mode_gr {
        for gi in side.tt[gr][..nch].iter_mut() {
            for table in gi.table_select.iter_mut() {
                *table = normalize_table_select(*table);
            }
        }
    }

    let mut hb = HeaderBuf::new();
    write_frame_header(&mut hb, config, header)?;

    if config.mpeg_version() == MpegVersion::Mpeg1 {
        hb.put(side.main_data_begin as u32, 9)?;
        hb.put(side.private_bits, if nch == 2 { 3 } else { 5 })?;
        for scfsi in &side.scfsi[..nch] {
            for &band in scfsi {
                hb.put_flag(band)?;
            }
        }
        for gr in 0..2 {
            for gi in &side.tt[gr][..nch] {
                hb.put(gi.total_bits(), 12)?;
                hb.put((gi.big_values / 2) as u32, 9)?;
                hb.put(gi.global_gain as u32, 8)?;
                hb.put(gi.scalefac_compress, 4)?;
                write_block_fields(&mut hb, gi)?;
                hb.put_flag(gi.preflag)?;
                hb.put_flag(gi.scalefac_scale)?;
                hb.put(gi.count1table_select as u32, 1)?;
            }
        }
    } else {
        hb.put(side.main_data_begin as u32, 8)?;
        hb.put(side.private_bits, nch)?;
        for gi in &side.tt[0][..nch] {
            hb.put(gi.total_bits(), 12)?;
            hb.put((gi.big_values / 2) as u32, 9)?;
            hb.put(gi.global_gain as u32, 8)?;
            hb.put(gi.scalefac_compress, 9)?;
            write_block_fields(&mut hb, gi)?;
            hb.put_flag(gi.scalefac_scale)?;
            hb.put(gi.count1table_select as u32, 1)?;
        }
    }

    let len = config.side_info_len();
    if hb.ptr != len * 8 {
        error!("side info rendered {} bits, expected {}", hb.ptr, len * 8);
        return Err(EncodingError::BitCountMismatch {
            expected: (len * 8) as u64,
            actual: hb.ptr as u64,
        });
    }

    let mut block = hb.buf[..len].to_vec();
    if config.mpeg.error_protection {
        let crc = header_crc(&block);
        block[4] = (crc >> 8) as u8;
        block[5] = crc as u8;
    }
    Ok(block)
}
