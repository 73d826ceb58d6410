//! Bit writer for the Layer III elementary stream
//!
//! Bits are appended MSB-first. Every time the cursor starts a new byte the
//! writer asks the `HeaderScheduler` whether a header is due at the current
//! bit offset and, if so, copies the rendered header and side information in
//! before continuing. Main data therefore flows around headers without the
//! callers having to know where frame boundaries fall.

use log::error;

use crate::error::{EncodingError, EncodingResult};
use crate::header_ring::HeaderScheduler;

/// Widths at or above this are rejected
pub const MAX_LENGTH: u32 = 32;

/// Default buffer size in bytes; far above one frame plus the reservoir
pub const BUFFER_SIZE: usize = 147_456;

/// Append-only bit writer
#[derive(Debug)]
pub struct BitWriter {
    /// Bytes written and not yet handed out
    buf: Vec<u8>,
    /// Free bits in the last byte of `buf`; 0 when a new byte must be started
    bits_free: u32,
    /// Bits written since the stream started, headers included
    total_bits: u64,
    /// Hard limit on buffered bytes
    capacity: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(BUFFER_SIZE)),
            bits_free: 0,
            total_bits: 0,
            capacity,
        }
    }

    /// Total bits written since stream start
    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.total_bits % 8 == 0
    }

    /// Complete bytes currently buffered
    pub fn buffered_bytes(&self) -> usize {
        self.buf.len() - usize::from(self.bits_free > 0)
    }

    /// Write the low `width` bits of `value`, splicing due headers at byte
    /// boundaries
    pub fn put_bits(&mut self, headers: &mut HeaderScheduler, value: u32, width: u32) -> EncodingResult<()> {
        self.write(Some(headers), value, width)
    }

    /// Write the low `width` bits of `value` without consulting the header
    /// queue; for padding after the final frame only
    pub fn put_bits_raw(&mut self, value: u32, width: u32) -> EncodingResult<()> {
        self.write(None, value, width)
    }

    fn write(&mut self, mut headers: Option<&mut HeaderScheduler>, value: u32, width: u32) -> EncodingResult<()> {
        if width >= MAX_LENGTH - 2 {
            error!("put_bits called with width {}", width);
            return Err(EncodingError::BitWidthOutOfRange(width));
        }
        let value = value & ((1u32 << width) - 1);
        let mut remaining = width;

        while remaining > 0 {
            if self.bits_free == 0 {
                if let Some(headers) = headers.as_deref_mut() {
                    if let Some(header) = headers.pop_front_if_due(self.total_bits)? {
                        self.reserve(header.bytes().len())?;
                        self.buf.extend_from_slice(header.bytes());
                        self.total_bits += header.bits();
                    }
                }
                self.reserve(1)?;
                self.buf.push(0);
                self.bits_free = 8;
            }

            let k = remaining.min(self.bits_free);
            remaining -= k;
            self.bits_free -= k;
            let chunk = (value >> remaining) & ((1u32 << k) - 1);
            if let Some(last) = self.buf.last_mut() {
                *last |= (chunk << self.bits_free) as u8;
            }
            self.total_bits += k as u64;
        }
        Ok(())
    }

    fn reserve(&self, bytes: usize) -> EncodingResult<()> {
        if self.buf.len() + bytes > self.capacity {
            error!("bit writer buffer exhausted at {} bytes", self.buf.len());
            return Err(EncodingError::BufferOverflow(self.buf.len()));
        }
        Ok(())
    }

    /// Move all complete bytes into `out`
    ///
    /// Returns the number of bytes copied, or `Err(required)` when `out` is
    /// shorter than the buffered byte count; nothing is consumed in that case.
    pub fn copy_buffer(&mut self, out: &mut [u8]) -> Result<usize, usize> {
        let complete = self.buffered_bytes();
        if complete > out.len() {
            return Err(complete);
        }
        out[..complete].copy_from_slice(&self.buf[..complete]);
        self.buf.drain(..complete);
        Ok(complete)
    }

    /// Move all complete bytes to the end of `out`
    pub fn drain_into(&mut self, out: &mut Vec<u8>) -> usize {
        let complete = self.buffered_bytes();
        out.extend(self.buf.drain(..complete));
        complete
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bit writer paired with the header queue it splices from
#[derive(Debug, Default)]
pub struct BitStream {
    pub writer: BitWriter,
    pub headers: HeaderScheduler,
}

impl BitStream {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn put_bits(&mut self, value: u32, width: u32) -> EncodingResult<()> {
        self.writer.put_bits(&mut self.headers, value, width)
    }

    #[inline]
    pub fn put_bits_raw(&mut self, value: u32, width: u32) -> EncodingResult<()> {
        self.writer.put_bits_raw(value, width)
    }

    pub fn total_bits(&self) -> u64 {
        self.writer.total_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_msb_first_packing() {
        let mut writer = BitWriter::new();
        writer.put_bits_raw(0b101, 3).unwrap();
        writer.put_bits_raw(0b11111, 5).unwrap();
        writer.put_bits_raw(0x1234, 16).unwrap();
        assert_eq!(writer.total_bits(), 24);

        let mut out = [0u8; 3];
        assert_eq!(writer.copy_buffer(&mut out), Ok(3));
        assert_eq!(out, [0b1011_1111, 0x12, 0x34]);
    }

    #[test]
    fn test_only_low_bits_are_written() {
        let mut writer = BitWriter::new();
        writer.put_bits_raw(0xffff_fff0, 4).unwrap();
        writer.put_bits_raw(0, 4).unwrap();
        let mut out = Vec::new();
        writer.drain_into(&mut out);
        assert_eq!(out, vec![0x00]);
    }

    #[test]
    fn test_width_limit() {
        let mut writer = BitWriter::new();
        assert_eq!(writer.put_bits_raw(0, 30), Err(EncodingError::BitWidthOutOfRange(30)));
        assert!(writer.put_bits_raw(0, 29).is_ok());
    }

    #[test]
    fn test_header_spliced_at_its_offset() {
        let mut headers = HeaderScheduler::new();
        let mut writer = BitWriter::new();
        headers.schedule(&[0xAA; 4], 64).unwrap();
        headers.schedule(&[0xBB; 4], 64).unwrap();

        writer.put_bits(&mut headers, 0x11, 8).unwrap();
        writer.put_bits(&mut headers, 0x22_3344, 24).unwrap();
        assert_eq!(writer.total_bits(), 64);
        assert_eq!(headers.pending(), 1);

        writer.put_bits(&mut headers, 0x55, 8).unwrap();
        assert!(headers.is_empty());

        let mut out = Vec::new();
        writer.drain_into(&mut out);
        assert_eq!(
            out,
            vec![0xAA, 0xAA, 0xAA, 0xAA, 0x11, 0x22, 0x33, 0x44, 0xBB, 0xBB, 0xBB, 0xBB, 0x55]
        );
    }

    #[test]
    fn test_header_passed_over_is_fatal() {
        let mut headers = HeaderScheduler::new();
        let mut writer = BitWriter::new();
        headers.schedule(&[0; 4], 12).unwrap();
        headers.schedule(&[0; 4], 12).unwrap();

        writer.put_bits(&mut headers, 0, 8).unwrap();
        assert_eq!(
            writer.put_bits(&mut headers, 0, 8),
            Err(EncodingError::HeaderTimingMissed { write_timing: 12, position: 40 })
        );
    }

    #[test]
    fn test_header_written_before_first_main_data_bit() {
        let mut headers = HeaderScheduler::new();
        let mut writer = BitWriter::new();
        headers.schedule(&[0xFF, 0xFB, 0x90, 0x64], 64).unwrap();
        writer.put_bits(&mut headers, 0x0F, 8).unwrap();
        assert_eq!(writer.total_bits(), 40);
        assert!(headers.is_empty());

        let mut out = Vec::new();
        writer.drain_into(&mut out);
        assert_eq!(out, vec![0xFF, 0xFB, 0x90, 0x64, 0x0F]);
    }

    #[test]
    fn test_copy_buffer_too_small() {
        let mut writer = BitWriter::new();
        writer.put_bits_raw(0xABCD, 16).unwrap();
        let mut out = [0u8; 1];
        assert_eq!(writer.copy_buffer(&mut out), Err(2));
        let mut out = [0u8; 2];
        assert_eq!(writer.copy_buffer(&mut out), Ok(2));
        assert_eq!(writer.buffered_bytes(), 0);
    }

    #[test]
    fn test_partial_byte_is_kept() {
        let mut writer = BitWriter::new();
        writer.put_bits_raw(0xFF, 8).unwrap();
        writer.put_bits_raw(1, 1).unwrap();
        let mut out = Vec::new();
        assert_eq!(writer.drain_into(&mut out), 1);
        writer.put_bits_raw(0, 7).unwrap();
        assert_eq!(writer.drain_into(&mut out), 1);
        assert_eq!(out, vec![0xFF, 0x80]);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut writer = BitWriter::with_capacity(2);
        writer.put_bits_raw(0xFFFF, 16).unwrap();
        assert_eq!(writer.put_bits_raw(1, 1), Err(EncodingError::BufferOverflow(2)));
    }

    proptest! {
        #[test]
        fn property_total_bits_matches_bytes(writes in prop::collection::vec((any::<u32>(), 0u32..30), 1..200)) {
            let mut writer = BitWriter::new();
            let mut expected = 0u64;
            for &(value, width) in &writes {
                writer.put_bits_raw(value, width).unwrap();
                expected += width as u64;
            }
            prop_assert_eq!(writer.total_bits(), expected);
            prop_assert_eq!(writer.buffered_bytes() as u64, expected / 8);
        }
    }
}
